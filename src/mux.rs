//! Terminal multiplexer event loop
//!
//! The [`Multiplexer`] owns everything: both PTY children and their screens,
//! the host terminal, the epoll instance, and the SIGWINCH signalfd. A
//! single-threaded loop waits on epoll and dispatches: stdin bytes route
//! through the command-prefix state machine or forward verbatim to the
//! focused child, child output feeds the per-pane lexer and screen, and
//! SIGWINCH drives the resize/reflow path.
//!
//! Layout: assistant pane on top, shell pane below, one divider row between
//! them and a one-row status bar at the bottom. Zooming gives the focused
//! pane the whole surface minus the status bar.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::{sigprocmask, SigSet, Signal, SigmaskHow};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use crate::assistant::{BasicRepl, StaticAgent};
use crate::config::Config;
use crate::escape::{EscapeLexer, KeyCode, TerminalChar};
use crate::host::HostTerminal;
use crate::pty::{ChildTask, PtyChild};
use crate::screen::{Rect, Screen};

/// One-shot command prefix (`^B`).
const PREFIX_KEY: u8 = 0x02;

const MAX_EVENTS: usize = 8;

const TOKEN_STDIN: u64 = 0;
const TOKEN_SIGNAL: u64 = 1;
const TOKEN_PANE_BASE: u64 = 2;

/// A screen paired with the child whose output fills it and the lexer
/// holding that fd's partial-sequence state.
struct Pane {
    screen: Screen,
    child: PtyChild,
    lexer: EscapeLexer,
}

impl Pane {
    fn new(child: PtyChild) -> Self {
        Pane {
            screen: Screen::new(0, 0),
            child,
            lexer: EscapeLexer::new(),
        }
    }
}

/// What a decoded stdin event should do, given the prefix/focus/scroll
/// state. Kept separate from the `Multiplexer` so the routing rules are
/// testable on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputAction {
    /// `^B` arms the prefix; the event is consumed.
    BeginPrefix,
    SwitchFocus,
    ToggleZoom,
    ToggleManualScroll,
    /// An armed prefix followed by an unbound key; consumed.
    CancelPrefix,
    /// Manual-scroll arrow keys on the focused pane.
    ScrollUp,
    ScrollDown,
    /// Write the event's original bytes to the focused child.
    Forward,
    Drop,
}

pub(crate) fn route_input(
    waiting_for_command: bool,
    focused: bool,
    in_manual_scroll: bool,
    tch: &TerminalChar,
) -> InputAction {
    if !waiting_for_command && tch.code == KeyCode::Byte(PREFIX_KEY) {
        return InputAction::BeginPrefix;
    }
    if waiting_for_command {
        return match tch.code {
            KeyCode::Byte(b'\t') => InputAction::SwitchFocus,
            KeyCode::Byte(b'Z') | KeyCode::Byte(b'z') => InputAction::ToggleZoom,
            KeyCode::Byte(b'[') => InputAction::ToggleManualScroll,
            _ => InputAction::CancelPrefix,
        };
    }
    if focused && in_manual_scroll {
        return match tch.code {
            KeyCode::Cuu => InputAction::ScrollUp,
            KeyCode::Cud => InputAction::ScrollDown,
            _ => InputAction::Drop,
        };
    }
    if focused {
        return InputAction::Forward;
    }
    InputAction::Drop
}

/// Viewport geometry for one pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PaneSpec {
    pub lines: usize,
    pub cols: usize,
    pub rect: Option<Rect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Layout {
    pub assistant: PaneSpec,
    pub shell: PaneSpec,
    pub divider_row: u16,
    pub status_row: u16,
    pub cols: u16,
}

impl Layout {
    /// Split the host surface: assistant pane above the divider at
    /// `(rows - 1) / 2`, shell pane below it, status bar on the last row.
    /// When zoomed, the focused pane takes every row above the status bar
    /// and the other pane loses its rectangle.
    pub(crate) fn compute(rows: u16, cols: u16, zoomed: bool, focus: Option<usize>) -> Layout {
        let rows_i = rows as i64;
        let middle = (rows_i - 1) / 2;

        let mut a_lines = middle;
        let mut s_lines = rows_i - middle - 2;
        let a_y = 0i64;
        let mut s_y = middle + 1;
        let mut a_hidden = false;
        let mut s_hidden = false;

        if zoomed {
            match focus {
                Some(0) => {
                    a_lines = rows_i - 1;
                    s_hidden = true;
                }
                Some(1) => {
                    s_lines = rows_i - 1;
                    s_y = 0;
                    a_hidden = true;
                }
                _ => {}
            }
        }

        let rect = |y: i64, lines: i64, hidden: bool| -> Option<Rect> {
            if hidden || lines <= 0 || cols == 0 {
                return None;
            }
            Some(Rect {
                min_y: y as u16,
                min_x: 0,
                max_y: (y + lines - 1) as u16,
                max_x: cols - 1,
            })
        };

        Layout {
            assistant: PaneSpec {
                lines: a_lines.max(0) as usize,
                cols: cols as usize,
                rect: rect(a_y, a_lines, a_hidden),
            },
            shell: PaneSpec {
                lines: s_lines.max(0) as usize,
                cols: cols as usize,
                rect: rect(s_y, s_lines, s_hidden),
            },
            divider_row: middle.max(0) as u16,
            status_row: rows.saturating_sub(1),
            cols,
        }
    }

    fn pane(&self, i: usize) -> PaneSpec {
        if i == 0 {
            self.assistant
        } else {
            self.shell
        }
    }
}

pub struct Multiplexer {
    panes: Vec<Pane>,
    focus: Option<usize>,
    zoomed_in: bool,
    waiting_for_command: bool,
    stdin_lexer: EscapeLexer,
    layout: Layout,
    status_label: String,
    host: HostTerminal,
    epoll: Epoll,
    signal_fd: SignalFd,
    /// SIGWINCH disposition that was installed before ours, re-invoked on
    /// each delivery so nested users of the signal keep working.
    prev_winch: Option<extern "C" fn(libc::c_int)>,
}

impl Multiplexer {
    pub fn new(config: &Config) -> Result<Multiplexer> {
        // The assistant child runs the REPL in-process and therefore never
        // execs; spawn it first so it cannot inherit the shell's master
        // (masters are CLOEXEC, which only helps across exec).
        let assistant = PtyChild::spawn(
            ChildTask::Run(Box::new(|| BasicRepl::new(StaticAgent).run())),
            &config.term,
        )
        .context("spawn assistant child")?;

        let shell = PtyChild::spawn(ChildTask::exec(&config.shell)?, &config.term)
            .with_context(|| format!("spawn shell {:?}", config.shell))?;

        let host = HostTerminal::init().context("initialize host terminal")?;

        // Capture any pre-existing SIGWINCH handler, then route the signal
        // through a signalfd.
        let prev_winch = saved_sigwinch_handler();
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGWINCH);
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None).context("sigprocmask")?;
        let signal_fd =
            SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK).context("signalfd")?;

        let epoll = Epoll::new(EpollCreateFlags::empty()).context("epoll_create1")?;
        epoll
            .add(io::stdin(), EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_STDIN))
            .context("epoll_ctl: stdin")?;
        // SAFETY: the signalfd lives as long as the epoll registration.
        let sig_fd = unsafe { BorrowedFd::borrow_raw(signal_fd.as_raw_fd()) };
        epoll
            .add(sig_fd, EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_SIGNAL))
            .context("epoll_ctl: signalfd")?;

        let panes = vec![Pane::new(assistant), Pane::new(shell)];
        for (i, pane) in panes.iter().enumerate() {
            epoll
                .add(
                    pane.child.master_fd(),
                    EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_PANE_BASE + i as u64),
                )
                .context("epoll_ctl: pty master")?;
        }

        let (rows, cols) = host.size().context("query terminal size")?;
        let mut mux = Multiplexer {
            panes,
            focus: None,
            zoomed_in: false,
            waiting_for_command: false,
            stdin_lexer: EscapeLexer::new(),
            layout: Layout::compute(rows, cols, false, None),
            status_label: config.status_label.clone(),
            host,
            epoll,
            signal_fd,
            prev_winch,
        };
        mux.layout_and_draw()?;
        Ok(mux)
    }

    /// Drive the event loop until stdin closes or a child exits.
    pub fn run(&mut self) -> Result<()> {
        self.send_dims()?;

        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        'outer: loop {
            let n = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("epoll_wait"),
            };

            for ev in &events[..n] {
                match ev.data() {
                    TOKEN_STDIN => {
                        if !self.handle_input()? {
                            tracing::info!("stdin closed");
                            break 'outer;
                        }
                    }
                    TOKEN_SIGNAL => self.handle_sigwinch()?,
                    token => {
                        let idx = (token - TOKEN_PANE_BASE) as usize;
                        if !self.handle_screen_output(idx)? {
                            tracing::info!(pane = idx, "child exited");
                            break 'outer;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Read and dispatch pending stdin bytes. Returns false on EOF.
    fn handle_input(&mut self) -> Result<bool> {
        let stdin = io::stdin();
        let mut chars = Vec::new();
        match self
            .stdin_lexer
            .read_and_escape(stdin.as_fd(), &mut chars)
        {
            Ok(0) => return Ok(false),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
            Err(e) => return Err(e).context("read stdin"),
        }

        for tch in &chars {
            self.dispatch_input(tch)?;
        }
        Ok(true)
    }

    fn dispatch_input(&mut self, tch: &TerminalChar) -> Result<()> {
        let focused = self.focus;
        let in_manual = focused
            .map(|i| self.panes[i].screen.is_in_manual_scroll())
            .unwrap_or(false);

        let action = route_input(self.waiting_for_command, focused.is_some(), in_manual, tch);
        self.waiting_for_command = action == InputAction::BeginPrefix;

        match action {
            InputAction::BeginPrefix | InputAction::CancelPrefix | InputAction::Drop => {}
            InputAction::SwitchFocus => self.switch_focus()?,
            InputAction::ToggleZoom => {
                self.zoomed_in = !self.zoomed_in;
                self.resize()?;
            }
            InputAction::ToggleManualScroll => self.toggle_manual_scroll()?,
            InputAction::ScrollUp => {
                if let Some(i) = focused {
                    self.panes[i].screen.manual_scroll_up();
                    self.refresh_cursor()?;
                }
            }
            InputAction::ScrollDown => {
                if let Some(i) = focused {
                    self.panes[i].screen.manual_scroll_down();
                    self.refresh_cursor()?;
                }
            }
            InputAction::Forward => {
                if let Some(i) = focused {
                    self.panes[i]
                        .child
                        .write_all(&tch.sequence)
                        .context("write to child pty")?;
                }
            }
        }
        Ok(())
    }

    /// Drain one pane's output until the read would block. Returns false
    /// when the child is gone (EOF or EIO on the master).
    fn handle_screen_output(&mut self, idx: usize) -> Result<bool> {
        let mut total = 0usize;
        loop {
            let pane = &mut self.panes[idx];
            let mut chars = Vec::new();
            match pane.lexer.read_and_escape(pane.child.master_fd(), &mut chars) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    total += n;
                    for tch in &chars {
                        pane.screen.handle_char(tch);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // A closed PTY reports EIO on the master.
                Err(e) if e.raw_os_error() == Some(libc::EIO) => return Ok(false),
                Err(e) => return Err(e).context("read from pty master"),
            }
        }

        if total > 0 {
            self.panes[idx].screen.refresh(&mut self.host)?;
            self.refresh_cursor()?;
        }
        Ok(true)
    }

    fn handle_sigwinch(&mut self) -> Result<()> {
        let mut delivered = false;
        loop {
            match self.signal_fd.read_signal() {
                Ok(Some(_)) => delivered = true,
                // Spurious wake or fully drained.
                Ok(None) => break,
                Err(e) => return Err(e).context("read signalfd"),
            }
        }
        if delivered {
            if let Some(handler) = self.prev_winch {
                handler(libc::SIGWINCH);
            }
            self.resize()?;
        }
        Ok(())
    }

    fn switch_focus(&mut self) -> Result<()> {
        if self.zoomed_in {
            return Ok(());
        }
        self.focus = Some(match self.focus {
            None => 0,
            Some(i) => (i + 1) % self.panes.len(),
        });
        self.draw_focus()
    }

    fn toggle_manual_scroll(&mut self) -> Result<()> {
        if let Some(i) = self.focus {
            let screen = &mut self.panes[i].screen;
            if screen.is_in_manual_scroll() {
                screen.reset_manual_scroll();
            } else {
                screen.enter_manual_scroll();
            }
            self.refresh_cursor()?;
        }
        Ok(())
    }

    /// Recompute the layout for the current host size, rebuild both screens
    /// by reflow, repaint everything, and push the new sizes to the
    /// children.
    fn resize(&mut self) -> Result<()> {
        self.host.clear_all()?;
        self.layout_and_draw()?;
        self.send_dims()
    }

    fn layout_and_draw(&mut self) -> Result<()> {
        let (rows, cols) = self.host.size().context("query terminal size")?;
        let layout = Layout::compute(rows, cols, self.zoomed_in, self.focus);
        tracing::debug!(rows, cols, zoomed = self.zoomed_in, "layout");

        for (i, pane) in self.panes.iter_mut().enumerate() {
            let spec = layout.pane(i);
            let mut screen = Screen::with_reflow(spec.lines, spec.cols, &pane.screen);
            screen.set_rect(spec.rect);
            pane.screen = screen;
        }
        self.layout = layout;

        if self.focus.is_none() {
            self.focus = Some(0);
        }

        self.host
            .draw_status_bar(layout.status_row, cols, &self.status_label)?;
        self.host.draw_divider(layout.divider_row, cols, self.focus)?;
        for i in 0..self.panes.len() {
            self.panes[i].screen.refresh(&mut self.host)?;
        }
        self.refresh_cursor()
    }

    fn draw_focus(&mut self) -> Result<()> {
        self.host
            .draw_divider(self.layout.divider_row, self.layout.cols, self.focus)?;
        self.refresh_cursor()
    }

    /// Re-blit the focused pane and place (or hide) the host cursor, then
    /// flush everything queued so far.
    fn refresh_cursor(&mut self) -> Result<()> {
        if let Some(i) = self.focus {
            self.panes[i].screen.refresh(&mut self.host)?;
            let screen = &self.panes[i].screen;
            if screen.is_in_manual_scroll() {
                self.host.hide_cursor()?;
            } else if let Some((y, x)) = screen.cursor_host_position() {
                self.host.set_cursor(y, x)?;
            } else {
                self.host.hide_cursor()?;
            }
        } else {
            self.host.hide_cursor()?;
        }
        self.host.flush()?;
        Ok(())
    }

    fn send_dims(&self) -> Result<()> {
        for pane in &self.panes {
            pane.child
                .resize(pane.screen.n_lines() as u16, pane.screen.n_cols() as u16)?;
        }
        Ok(())
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGWINCH);
        let _ = sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&mask), None);
    }
}

/// Query the SIGWINCH disposition without changing it. Only a plain
/// function-pointer handler is worth re-invoking.
fn saved_sigwinch_handler() -> Option<extern "C" fn(libc::c_int)> {
    let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::sigaction(libc::SIGWINCH, std::ptr::null(), &mut old) };
    if rc != 0 {
        return None;
    }
    if old.sa_sigaction == libc::SIG_DFL || old.sa_sigaction == libc::SIG_IGN {
        return None;
    }
    if old.sa_flags & libc::SA_SIGINFO != 0 {
        return None;
    }
    // SAFETY: sa_sigaction holds a plain handler pointer when SA_SIGINFO is
    // clear and the value is neither SIG_DFL nor SIG_IGN.
    Some(unsafe {
        std::mem::transmute::<libc::sighandler_t, extern "C" fn(libc::c_int)>(old.sa_sigaction)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escape::EscapeLexer;

    fn lex_one(bytes: &[u8]) -> TerminalChar {
        let mut lexer = EscapeLexer::new();
        let mut out = Vec::new();
        lexer.feed(bytes, &mut out);
        assert_eq!(out.len(), 1);
        out.remove(0)
    }

    #[test]
    fn test_prefix_key_arms_and_consumes() {
        let tch = lex_one(&[PREFIX_KEY]);
        assert_eq!(route_input(false, true, false, &tch), InputAction::BeginPrefix);
    }

    #[test]
    fn test_prefix_dispatch() {
        assert_eq!(
            route_input(true, true, false, &lex_one(b"\t")),
            InputAction::SwitchFocus
        );
        assert_eq!(
            route_input(true, true, false, &lex_one(b"z")),
            InputAction::ToggleZoom
        );
        assert_eq!(
            route_input(true, true, false, &lex_one(b"Z")),
            InputAction::ToggleZoom
        );
        assert_eq!(
            route_input(true, true, false, &lex_one(b"[")),
            InputAction::ToggleManualScroll
        );
        // Any other key cancels the prefix without forwarding.
        assert_eq!(
            route_input(true, true, false, &lex_one(b"q")),
            InputAction::CancelPrefix
        );
    }

    #[test]
    fn test_plain_bytes_forward_to_focused_pane() {
        for b in [b"l".as_slice(), b"s", b"\n"] {
            assert_eq!(route_input(false, true, false, &lex_one(b)), InputAction::Forward);
        }
        // Nothing is forwarded without focus.
        assert_eq!(route_input(false, false, false, &lex_one(b"l")), InputAction::Drop);
    }

    #[test]
    fn test_function_keys_forward_whole_sequence() {
        let tch = lex_one(b"\x1b[15~");
        assert_eq!(tch.code, KeyCode::Unrecognized);
        assert_eq!(route_input(false, true, false, &tch), InputAction::Forward);
        assert_eq!(tch.sequence, b"\x1b[15~");
    }

    #[test]
    fn test_manual_scroll_routing() {
        assert_eq!(
            route_input(false, true, true, &lex_one(b"\x1b[A")),
            InputAction::ScrollUp
        );
        assert_eq!(
            route_input(false, true, true, &lex_one(b"\x1b[B")),
            InputAction::ScrollDown
        );
        // Everything else is swallowed while inspecting scrollback.
        assert_eq!(route_input(false, true, true, &lex_one(b"x")), InputAction::Drop);
    }

    #[test]
    fn test_layout_split() {
        let layout = Layout::compute(24, 80, false, Some(0));
        assert_eq!(layout.divider_row, 11);
        assert_eq!(layout.status_row, 23);

        let a = layout.assistant;
        assert_eq!(a.lines, 11);
        assert_eq!(a.cols, 80);
        assert_eq!(
            a.rect,
            Some(Rect {
                min_y: 0,
                min_x: 0,
                max_y: 10,
                max_x: 79
            })
        );

        let s = layout.shell;
        assert_eq!(s.lines, 11);
        assert_eq!(
            s.rect,
            Some(Rect {
                min_y: 12,
                min_x: 0,
                max_y: 22,
                max_x: 79
            })
        );
    }

    #[test]
    fn test_layout_after_growth() {
        let layout = Layout::compute(48, 120, false, Some(0));
        let a = layout.assistant;
        let s = layout.shell;
        assert_eq!(a.lines, 23);
        assert_eq!(a.cols, 120);
        assert_eq!(a.rect.unwrap().min_y, 0);
        assert_eq!(a.rect.unwrap().max_y, 22);
        assert_eq!(s.lines, 23);
        assert_eq!(s.rect.unwrap().min_y, 24);
        assert_eq!(layout.status_row, 47);
    }

    #[test]
    fn test_layout_zoom_hides_other_pane() {
        let layout = Layout::compute(24, 80, true, Some(1));
        assert_eq!(layout.shell.lines, 23);
        assert_eq!(
            layout.shell.rect,
            Some(Rect {
                min_y: 0,
                min_x: 0,
                max_y: 22,
                max_x: 79
            })
        );
        assert_eq!(layout.assistant.rect, None);
        // The hidden pane keeps its split dimensions for reflow.
        assert_eq!(layout.assistant.lines, 11);

        let layout = Layout::compute(24, 80, true, Some(0));
        assert_eq!(layout.assistant.lines, 23);
        assert_eq!(layout.shell.rect, None);
    }

    #[test]
    fn test_layout_degenerate_sizes() {
        let layout = Layout::compute(2, 10, false, None);
        assert_eq!(layout.assistant.lines, 0);
        assert_eq!(layout.assistant.rect, None);

        let layout = Layout::compute(0, 0, false, None);
        assert_eq!(layout.assistant.rect, None);
        assert_eq!(layout.shell.rect, None);
    }
}
