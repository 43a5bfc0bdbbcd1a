//! Escape-sequence lexer for PTY byte streams
//!
//! Turns raw bytes read from a PTY master (or from stdin) into a stream of
//! [`TerminalChar`] events: plain bytes, recognized CSI commands with their
//! numeric parameters, and OSC 133 prompt-progress markers. The recognized
//! subset matches what an `ishell-m` terminfo entry advertises.
//!
//! One [`EscapeLexer`] value holds the partial-sequence state for one file
//! descriptor. A sequence split across two reads decodes identically to the
//! same bytes arriving in one read, so callers can feed whatever `read(2)`
//! hands them.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

/// Size of the read buffer used by [`EscapeLexer::read_and_escape`].
pub const READ_BUFSIZ: usize = 1024;

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;
/// C1 string terminator; also ends a CSI sequence.
const ST: u8 = 0x9c;

/// Decoded meaning of one lexer event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCode {
    /// A plain or control byte, passed through unchanged.
    Byte(u8),
    /// CSI J — erase screen.
    Clear,
    /// CSI P — delete character(s).
    Dch,
    /// CSI K — erase to end of line.
    El,
    /// CSI H — cursor position.
    Cup,
    /// CSI d — vertical position absolute.
    Vpa,
    /// CSI D — cursor back.
    Cub,
    /// CSI C — cursor forward.
    Cuf,
    /// CSI A — cursor up.
    Cuu,
    /// CSI B — cursor down.
    Cud,
    /// ESC M — reverse index.
    Ri,
    /// CSI @ — insert character(s).
    Ich,
    /// OSC 133;A — shell prompt start.
    PromptStart,
    /// OSC 133;B — shell prompt end.
    PromptEnd,
    /// OSC 133;C — command pre-execution.
    PreExec,
    /// OSC 133;D — command finished, optional exit code in `args[0]`.
    CmdFinish,
    /// A complete escape sequence we do not interpret; the raw bytes are
    /// preserved in [`TerminalChar::sequence`] so they can be forwarded.
    Unrecognized,
}

/// One decoded event plus the exact bytes that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalChar {
    pub code: KeyCode,
    /// Numeric CSI parameters in order of appearance.
    pub args: Vec<u16>,
    /// The original bytes, kept so unrecognized input can be forwarded
    /// verbatim to a child PTY.
    pub sequence: Vec<u8>,
}

impl TerminalChar {
    fn byte(b: u8) -> Self {
        TerminalChar {
            code: KeyCode::Byte(b),
            args: Vec::new(),
            sequence: vec![b],
        }
    }

    fn marker(code: KeyCode, args: Vec<u16>) -> Self {
        TerminalChar {
            code,
            args,
            sequence: Vec::new(),
        }
    }
}

/// Per-fd decoder state.
///
/// Invariant: `in_osc` implies `in_escape`.
#[derive(Debug, Default)]
pub struct EscapeLexer {
    in_escape: bool,
    in_osc: bool,
    escape_seq: Vec<u8>,
    osc_seq: Vec<u8>,
}

impl EscapeLexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Perform one `read(2)` of at most [`READ_BUFSIZ`] bytes from `fd` and
    /// append the decoded events to `out`. Returns the raw byte count; 0
    /// means EOF. Errors (including `EWOULDBLOCK` and `EIO`) surface as
    /// `io::Error` for the caller to classify.
    pub fn read_and_escape(
        &mut self,
        fd: BorrowedFd<'_>,
        out: &mut Vec<TerminalChar>,
    ) -> io::Result<usize> {
        let mut buf = [0u8; READ_BUFSIZ];
        let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        self.feed(&buf[..n], out);
        Ok(n)
    }

    /// Decode `bytes`, appending events to `out`. Partial sequences are
    /// retained until completed by a later call.
    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<TerminalChar>) {
        for &b in bytes {
            if self.in_osc {
                self.feed_osc_byte(b, out);
            } else if self.in_escape {
                self.feed_escape_byte(b, out);
            } else if b == ESC {
                self.in_escape = true;
                self.escape_seq.clear();
                self.escape_seq.push(ESC);
            } else {
                out.push(TerminalChar::byte(b));
            }
        }
    }

    fn feed_escape_byte(&mut self, b: u8, out: &mut Vec<TerminalChar>) {
        // Directly after ESC, `]` selects an OSC string.
        if self.escape_seq == [ESC] && b == b']' {
            self.in_osc = true;
            self.osc_seq.clear();
            return;
        }

        // A new ESC restarts the sequence.
        if b == ESC {
            self.escape_seq.clear();
            self.escape_seq.push(ESC);
            return;
        }

        if b != ST {
            self.escape_seq.push(b);
        }

        let is_final = (0x40..=0x7e).contains(&b) && b != b'[';
        if is_final || b == ST {
            out.push(dispatch_escape(&self.escape_seq));
            self.in_escape = false;
            self.escape_seq.clear();
        }
    }

    fn feed_osc_byte(&mut self, b: u8, out: &mut Vec<TerminalChar>) {
        // A pending ESC either completes the two-byte `ESC \` terminator or
        // aborts the string and starts a fresh escape.
        if self.osc_seq.last() == Some(&ESC) {
            self.osc_seq.pop();
            if b == b'\\' {
                self.finish_osc(out);
            } else {
                self.in_osc = false;
                self.osc_seq.clear();
                self.escape_seq.clear();
                self.escape_seq.push(ESC);
                self.feed_escape_byte(b, out);
            }
            return;
        }

        match b {
            BEL => self.finish_osc(out),
            ESC => self.osc_seq.push(ESC),
            _ => self.osc_seq.push(b),
        }
    }

    fn finish_osc(&mut self, out: &mut Vec<TerminalChar>) {
        if let Some(tch) = parse_osc133(&self.osc_seq) {
            out.push(tch);
        }
        self.in_osc = false;
        self.in_escape = false;
        self.osc_seq.clear();
    }
}

/// Match a complete escape sequence against the recognized CSI table.
/// Anything else comes back as [`KeyCode::Unrecognized`] with the raw bytes
/// preserved.
fn dispatch_escape(seq: &[u8]) -> TerminalChar {
    let mut tch = TerminalChar {
        code: KeyCode::Unrecognized,
        args: Vec::new(),
        sequence: seq.to_vec(),
    };

    match seq {
        [ESC, b'M'] => tch.code = KeyCode::Ri,
        [ESC, b'[', body @ .., last] => {
            if let Some((code, args)) = dispatch_csi(body, *last) {
                tch.code = code;
                tch.args = args;
            }
        }
        _ => {}
    }

    tch
}

fn dispatch_csi(body: &[u8], last: u8) -> Option<(KeyCode, Vec<u16>)> {
    match last {
        b'J' if body.is_empty() => Some((KeyCode::Clear, Vec::new())),
        b'K' if body.is_empty() => Some((KeyCode::El, Vec::new())),
        b'P' if all_digits(body) => Some((KeyCode::Dch, parse_single(body))),
        b'd' if all_digits(body) => Some((KeyCode::Vpa, parse_single(body))),
        b'D' if all_digits(body) => Some((KeyCode::Cub, parse_single(body))),
        b'C' if all_digits(body) => Some((KeyCode::Cuf, parse_single(body))),
        b'A' if all_digits(body) => Some((KeyCode::Cuu, parse_single(body))),
        b'B' if all_digits(body) => Some((KeyCode::Cud, parse_single(body))),
        b'@' if all_digits(body) => Some((KeyCode::Ich, parse_single(body))),
        // CUP takes either no parameters or exactly `row;col`.
        b'H' if body.is_empty() => Some((KeyCode::Cup, Vec::new())),
        b'H' => {
            let mut parts = body.splitn(2, |&b| b == b';');
            let y = parts.next()?;
            let x = parts.next()?;
            if y.is_empty() || x.is_empty() || !all_digits(y) || !all_digits(x) {
                return None;
            }
            let mut args = Vec::new();
            args.extend(parse_u16(y));
            args.extend(parse_u16(x));
            Some((KeyCode::Cup, args))
        }
        _ => None,
    }
}

fn all_digits(body: &[u8]) -> bool {
    body.iter().all(u8::is_ascii_digit)
}

/// Parse an optional single numeric parameter. A parameter that fails
/// conversion is dropped; the sequence is still recognized.
fn parse_single(body: &[u8]) -> Vec<u16> {
    if body.is_empty() {
        Vec::new()
    } else {
        parse_u16(body).into_iter().collect()
    }
}

fn parse_u16(digits: &[u8]) -> Option<u16> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Match an OSC payload against the `133;X[;N]` prompt-progress form.
fn parse_osc133(payload: &[u8]) -> Option<TerminalChar> {
    let rest = payload.strip_prefix(b"133;")?;
    let (&id, tail) = rest.split_first()?;

    let mut arg = None;
    match tail {
        [] => {}
        [b';', digits @ ..] if !digits.is_empty() && all_digits(digits) => {
            arg = parse_u16(digits);
        }
        _ => return None,
    }

    let (code, args) = match id {
        b'A' => (KeyCode::PromptStart, Vec::new()),
        b'B' => (KeyCode::PromptEnd, Vec::new()),
        b'C' => (KeyCode::PreExec, Vec::new()),
        b'D' => (KeyCode::CmdFinish, arg.into_iter().collect()),
        _ => return None,
    };

    Some(TerminalChar::marker(code, args))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(bytes: &[u8]) -> Vec<TerminalChar> {
        let mut lexer = EscapeLexer::new();
        let mut out = Vec::new();
        lexer.feed(bytes, &mut out);
        out
    }

    #[test]
    fn test_plain_bytes() {
        let out = lex(b"ok");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].code, KeyCode::Byte(b'o'));
        assert_eq!(out[0].sequence, b"o");
        assert_eq!(out[1].code, KeyCode::Byte(b'k'));
    }

    #[test]
    fn test_clear_requires_no_args() {
        assert_eq!(lex(b"\x1b[J")[0].code, KeyCode::Clear);
        assert_eq!(lex(b"\x1b[1J")[0].code, KeyCode::Unrecognized);
    }

    #[test]
    fn test_dch_optional_arg() {
        let out = lex(b"\x1b[P");
        assert_eq!(out[0].code, KeyCode::Dch);
        assert!(out[0].args.is_empty());

        let out = lex(b"\x1b[16P");
        assert_eq!(out[0].code, KeyCode::Dch);
        assert_eq!(out[0].args, vec![16]);
    }

    #[test]
    fn test_el() {
        assert_eq!(lex(b"\x1b[K")[0].code, KeyCode::El);
        assert_eq!(lex(b"\x1b[1K")[0].code, KeyCode::Unrecognized);
    }

    #[test]
    fn test_cup_arity() {
        let out = lex(b"\x1b[H");
        assert_eq!(out[0].code, KeyCode::Cup);
        assert!(out[0].args.is_empty());

        let out = lex(b"\x1b[16;1H");
        assert_eq!(out[0].code, KeyCode::Cup);
        assert_eq!(out[0].args, vec![16, 1]);

        // A lone row, or an empty field, is not a cursor-position command.
        assert_eq!(lex(b"\x1b[16H")[0].code, KeyCode::Unrecognized);
        assert_eq!(lex(b"\x1b[;16H")[0].code, KeyCode::Unrecognized);
    }

    #[test]
    fn test_cursor_motions() {
        for (bytes, code) in [
            (&b"\x1b[d"[..], KeyCode::Vpa),
            (b"\x1b[D", KeyCode::Cub),
            (b"\x1b[C", KeyCode::Cuf),
            (b"\x1b[A", KeyCode::Cuu),
            (b"\x1b[B", KeyCode::Cud),
            (b"\x1b[@", KeyCode::Ich),
        ] {
            let out = lex(bytes);
            assert_eq!(out[0].code, code, "sequence {:?}", bytes);
            assert!(out[0].args.is_empty());
        }

        let out = lex(b"\x1b[7C");
        assert_eq!(out[0].code, KeyCode::Cuf);
        assert_eq!(out[0].args, vec![7]);
    }

    #[test]
    fn test_ri() {
        assert_eq!(lex(b"\x1bM")[0].code, KeyCode::Ri);
    }

    #[test]
    fn test_unrecognized_preserves_bytes() {
        let out = lex(b"\x1b[38;5;196m");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].code, KeyCode::Unrecognized);
        assert_eq!(out[0].sequence, b"\x1b[38;5;196m");
    }

    #[test]
    fn test_overflowing_arg_is_dropped() {
        let out = lex(b"\x1b[99999999999P");
        assert_eq!(out[0].code, KeyCode::Dch);
        assert!(out[0].args.is_empty());
    }

    #[test]
    fn test_mixed_text_and_cup() {
        let out = lex(b"Test\x1b[16;1HTest");
        assert_eq!(out.len(), 9);
        assert_eq!(out[0].code, KeyCode::Byte(b'T'));
        assert_eq!(out[3].code, KeyCode::Byte(b't'));
        assert_eq!(out[4].code, KeyCode::Cup);
        assert_eq!(out[4].args, vec![16, 1]);
        assert_eq!(out[5].code, KeyCode::Byte(b'T'));
        assert_eq!(out[8].code, KeyCode::Byte(b't'));
    }

    #[test]
    fn test_osc133_markers() {
        assert_eq!(lex(b"\x1b]133;A\x07")[0].code, KeyCode::PromptStart);
        assert_eq!(lex(b"\x1b]133;B\x07")[0].code, KeyCode::PromptEnd);
        assert_eq!(lex(b"\x1b]133;C\x07")[0].code, KeyCode::PreExec);

        let out = lex(b"\x1b]133;D;2\x07");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].code, KeyCode::CmdFinish);
        assert_eq!(out[0].args, vec![2]);
    }

    #[test]
    fn test_osc133_st_terminator() {
        let out = lex(b"\x1b]133;D;0\x1b\\");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].code, KeyCode::CmdFinish);
        assert_eq!(out[0].args, vec![0]);
    }

    #[test]
    fn test_other_osc_discarded() {
        assert!(lex(b"\x1b]0;window title\x07").is_empty());
        assert!(lex(b"\x1b]133;Q\x07").is_empty());
    }

    #[test]
    fn test_split_sequence_across_feeds() {
        let mut lexer = EscapeLexer::new();
        let mut out = Vec::new();
        lexer.feed(b"\x1b", &mut out);
        assert!(out.is_empty());
        lexer.feed(b"]133;D", &mut out);
        assert!(out.is_empty());
        lexer.feed(b";7\x07after", &mut out);
        assert_eq!(out.len(), 6);
        assert_eq!(out[0].code, KeyCode::CmdFinish);
        assert_eq!(out[0].args, vec![7]);
        assert_eq!(out[1].code, KeyCode::Byte(b'a'));
    }

    #[test]
    fn test_split_csi_across_feeds() {
        let mut lexer = EscapeLexer::new();
        let mut out = Vec::new();
        lexer.feed(b"\x1b[1", &mut out);
        lexer.feed(b"6;1H", &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].code, KeyCode::Cup);
        assert_eq!(out[0].args, vec![16, 1]);
    }

    #[test]
    fn test_esc_restarts_escape() {
        let out = lex(b"\x1b\x1b[A");
        // The doubled ESC restarts the sequence, so only one event emerges.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].code, KeyCode::Cuu);
    }

    #[test]
    fn test_read_and_escape_pipe() {
        use std::io::Write;
        use std::os::fd::AsFd;

        let (rx, tx) = nix::unistd::pipe().expect("pipe");
        let mut tx = std::fs::File::from(tx);
        tx.write_all(b"Test\x1b[16;1HTest").unwrap();

        let mut lexer = EscapeLexer::new();
        let mut out = Vec::new();
        let n = lexer.read_and_escape(rx.as_fd(), &mut out).unwrap();
        assert_eq!(n, 15);
        assert_eq!(out.len(), 9);
        assert_eq!(out[4].code, KeyCode::Cup);
    }
}
