//! Host-terminal surface
//!
//! Thin wrapper over crossterm that gives the multiplexer the primitives it
//! needs: raw mode on the alternate screen, current dimensions, rectangular
//! row blits for the panes, the colored divider and status bar, and cursor
//! placement/visibility. Construction takes the terminal over; `Drop`
//! restores it, so a panic anywhere in the event loop still puts the user's
//! terminal back.
//!
//! Stdin is switched to non-blocking here as well, since the event loop
//! reads it raw rather than through crossterm's event stream.

use std::io::{self, Stdout, Write};
use std::os::fd::{AsRawFd, RawFd};

use crossterm::style::{Color, Print, ResetColor, SetBackgroundColor, SetForegroundColor};
use crossterm::terminal::{
    self, Clear, ClearType, DisableLineWrap, EnableLineWrap, EnterAlternateScreen,
    LeaveAlternateScreen,
};
use crossterm::{cursor, execute, queue};

pub const DIVIDER_CHAR: char = '─';

pub struct HostTerminal {
    out: Stdout,
    /// Original stdin flags, restored on drop.
    stdin_flags: libc::c_int,
}

impl HostTerminal {
    /// Enter raw mode on the alternate screen and make stdin non-blocking.
    pub fn init() -> io::Result<Self> {
        let stdin_flags = set_nonblocking(io::stdin().as_raw_fd())?;

        terminal::enable_raw_mode()?;
        let mut out = io::stdout();
        execute!(out, EnterAlternateScreen, DisableLineWrap, cursor::Hide)?;

        Ok(HostTerminal { out, stdin_flags })
    }

    /// Current dimensions as `(rows, cols)`.
    pub fn size(&self) -> io::Result<(u16, u16)> {
        let (cols, rows) = terminal::size()?;
        Ok((rows, cols))
    }

    pub fn clear_all(&mut self) -> io::Result<()> {
        queue!(self.out, Clear(ClearType::All))
    }

    /// Write pane rows starting at `(min_y, min_x)`, one row per line.
    pub fn blit(&mut self, min_y: u16, min_x: u16, rows: &[String]) -> io::Result<()> {
        for (i, row) in rows.iter().enumerate() {
            queue!(
                self.out,
                cursor::MoveTo(min_x, min_y + i as u16),
                Print(row)
            )?;
        }
        Ok(())
    }

    /// Divider line: the half belonging to the focused pane is magenta, the
    /// other half keeps the default foreground. Pane 0 owns the left half.
    pub fn draw_divider(&mut self, row: u16, cols: u16, focus: Option<usize>) -> io::Result<()> {
        let half = cols / 2;
        let left: String = std::iter::repeat(DIVIDER_CHAR).take(half as usize).collect();
        let right: String = std::iter::repeat(DIVIDER_CHAR)
            .take((cols - half) as usize)
            .collect();

        queue!(self.out, cursor::MoveTo(0, row))?;
        if focus == Some(0) {
            queue!(self.out, SetForegroundColor(Color::Magenta))?;
        }
        queue!(self.out, Print(&left), ResetColor)?;
        if focus == Some(1) {
            queue!(self.out, SetForegroundColor(Color::Magenta))?;
        }
        queue!(self.out, Print(&right), ResetColor)
    }

    /// Full-width status bar, white on magenta.
    pub fn draw_status_bar(&mut self, row: u16, cols: u16, label: &str) -> io::Result<()> {
        let mut text = String::with_capacity(cols as usize);
        text.push_str(label);
        while text.len() < cols as usize {
            text.push(' ');
        }
        text.truncate(cols as usize);

        queue!(
            self.out,
            cursor::MoveTo(0, row),
            SetBackgroundColor(Color::Magenta),
            SetForegroundColor(Color::White),
            Print(text),
            ResetColor
        )
    }

    pub fn set_cursor(&mut self, y: u16, x: u16) -> io::Result<()> {
        queue!(self.out, cursor::MoveTo(x, y), cursor::Show)
    }

    pub fn hide_cursor(&mut self) -> io::Result<()> {
        queue!(self.out, cursor::Hide)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

impl Drop for HostTerminal {
    fn drop(&mut self) {
        let _ = execute!(
            self.out,
            cursor::Show,
            EnableLineWrap,
            LeaveAlternateScreen
        );
        let _ = terminal::disable_raw_mode();
        restore_flags(io::stdin().as_raw_fd(), self.stdin_flags);
    }
}

/// Set `O_NONBLOCK` on `fd`, returning the previous flags.
fn set_nonblocking(fd: RawFd) -> io::Result<libc::c_int> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags)
}

fn restore_flags(fd: RawFd, flags: libc::c_int) {
    unsafe {
        libc::fcntl(fd, libc::F_SETFL, flags);
    }
}
