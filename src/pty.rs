//! PTY children
//!
//! A [`PtyChild`] pairs a non-blocking PTY master with the pid of a forked
//! child running on the slave side. The child becomes a session leader, takes
//! the slave as its controlling terminal, dups it over stdio, exports the
//! `TERM` the multiplexer emulates, and then either execs a program (the
//! shell pane) or runs a closure in-process (the assistant pane).
//!
//! Masters carry `FD_CLOEXEC` so an exec'd child does not inherit its
//! sibling's master. The in-process child must therefore be spawned before
//! any exec'd one.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{execvp, fork, setsid, ForkResult, Pid};

/// What the forked child runs once the slave is its controlling terminal.
pub enum ChildTask {
    /// `execvp` a program. `args` includes argv[0].
    Exec { program: CString, args: Vec<CString> },
    /// Run a closure in the forked process and exit with its return code.
    Run(Box<dyn FnOnce() -> i32 + Send>),
}

impl ChildTask {
    /// Exec task for a plain program invocation.
    pub fn exec(program: &str) -> Result<Self> {
        let program = CString::new(program).context("program path contains NUL")?;
        let args = vec![program.clone()];
        Ok(ChildTask::Exec { program, args })
    }
}

pub struct PtyChild {
    master: OwnedFd,
    pid: Pid,
}

impl PtyChild {
    /// Open a PTY pair and fork. The parent keeps the non-blocking master;
    /// the child wires the slave up as its controlling stdio and runs
    /// `task` with `TERM=<term>`.
    pub fn spawn(task: ChildTask, term: &str) -> Result<PtyChild> {
        let (master, slave) = open_pty().context("openpty")?;
        set_nonblocking(master.as_raw_fd()).context("fcntl O_NONBLOCK on master")?;
        set_cloexec(master.as_raw_fd()).context("fcntl FD_CLOEXEC on master")?;

        // SAFETY: the process is single-threaded at every spawn site; the
        // child only touches its own fds and environment before exec/exit.
        match unsafe { fork() }.context("fork")? {
            ForkResult::Parent { child } => {
                drop(slave);
                tracing::info!(pid = child.as_raw(), "spawned pty child");
                Ok(PtyChild { master, pid: child })
            }
            ForkResult::Child => {
                drop(master);
                child_setup_and_run(slave, task, term);
            }
        }
    }

    pub fn master_fd(&self) -> BorrowedFd<'_> {
        use std::os::fd::AsFd;
        self.master.as_fd()
    }

    pub fn master_raw_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Push new dimensions to the child: `TIOCSWINSZ` on the master, then
    /// SIGWINCH so the child rereads them.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if rc < 0 {
            return Err(io::Error::last_os_error()).context("ioctl TIOCSWINSZ");
        }
        kill(self.pid, Signal::SIGWINCH).context("kill SIGWINCH")?;
        Ok(())
    }

    /// Write bytes to the child's input, riding out partial writes and a
    /// full PTY buffer.
    pub fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let fd = self.master.as_raw_fd();
        let mut offset = 0;
        while offset < data.len() {
            let rest = &data[offset..];
            let n = unsafe { libc::write(fd, rest.as_ptr().cast(), rest.len()) };
            if n >= 0 {
                offset += n as usize;
                continue;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                wait_writable(fd);
            } else if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl Drop for PtyChild {
    fn drop(&mut self) {
        // Reap if already exited; a live child gets SIGHUP when the master
        // closes right after this.
        let _ = waitpid(self.pid, Some(WaitPidFlag::WNOHANG));
    }
}

/// Child-side setup. Never returns.
fn child_setup_and_run(slave: OwnedFd, task: ChildTask, term: &str) -> ! {
    let slave_fd = slave.as_raw_fd();

    if setsid().is_err() {
        unsafe { libc::_exit(126) };
    }
    // The slave becomes the controlling terminal of the new session.
    if unsafe { libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) } < 0 {
        unsafe { libc::_exit(126) };
    }

    unsafe {
        if libc::dup2(slave_fd, libc::STDIN_FILENO) < 0
            || libc::dup2(slave_fd, libc::STDOUT_FILENO) < 0
            || libc::dup2(slave_fd, libc::STDERR_FILENO) < 0
        {
            libc::_exit(126);
        }
    }
    drop(slave);

    std::env::set_var("TERM", term);

    match task {
        ChildTask::Exec { program, args } => {
            let _ = execvp(&program, &args);
            // exec failed; nothing useful left to do in this process.
            unsafe { libc::_exit(127) };
        }
        ChildTask::Run(f) => {
            std::process::exit(f());
        }
    }
}

fn open_pty() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut master: libc::c_int = 0;
    let mut slave: libc::c_int = 0;
    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: openpty returned two fresh descriptors we now own.
    unsafe { Ok((OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(slave))) }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Wait briefly for the PTY buffer to drain.
fn wait_writable(fd: RawFd) {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    unsafe {
        libc::poll(&mut pfd, 1, 100);
    }
}
