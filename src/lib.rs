//! ishell — a terminal multiplexer pairing a shell with an assistant REPL
//!
//! Two PTY children share one controlling terminal: an interactive shell and
//! an AI-assistant REPL, each rendered into its own pane with independent
//! scrollback. The crate is organized around the data path:
//!
//! - [`escape`] decodes PTY bytes into terminal events,
//! - [`pad`] holds each child's growable screen buffer,
//! - [`screen`] maps events onto the pad and reflows it on resize,
//! - [`pty`] spawns and manages the children,
//! - [`host`] draws onto the real terminal, and
//! - [`mux`] ties them together under an epoll event loop.

pub mod assistant;
pub mod config;
pub mod escape;
pub mod host;
pub mod mux;
pub mod pad;
pub mod pty;
pub mod screen;
