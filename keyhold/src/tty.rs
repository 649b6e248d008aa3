//! Hidden input on the controlling terminal.
//!
//! Passphrases are read from `/dev/tty` (not stdin, which may be a pipe)
//! with echo disabled, into `Zeroizing` buffers so no plain copy lingers on
//! the heap.

use std::fs::File;
use std::io::{self, BufRead as _, Read, Write as _};
use std::os::unix::io::{AsRawFd as _, RawFd};

use anyhow::{Context as _, Result};
use zeroize::Zeroizing;

/// Restores the original `termios` settings on the given fd when dropped.
///
/// Guarantees echo comes back even if the read is interrupted or the calling
/// code exits early via `?`.
struct TermiosGuard {
    fd: RawFd,
    orig: libc::termios,
}

impl Drop for TermiosGuard {
    fn drop(&mut self) {
        // Best-effort restore; a dead fd no longer has terminal state worth
        // restoring.
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSANOW, &self.orig);
        }
    }
}

/// Prompt on the controlling terminal and read one line with echo disabled.
///
/// The trailing newline is stripped.  Stale unread input is flushed before
/// the prompt (`TCSAFLUSH`) so a buffered keypress cannot end up in the
/// passphrase.
pub fn prompt_hidden(prompt: &str) -> Result<Zeroizing<String>> {
    let mut tty = File::options()
        .read(true)
        .write(true)
        .open("/dev/tty")
        .context("open /dev/tty (passphrase prompts need a terminal)")?;

    tty.write_all(prompt.as_bytes())?;
    tty.flush()?;

    let fd = tty.as_raw_fd();
    let value = read_hidden(fd, &mut tty)?;

    // ECHO was off, so the user's Enter was not echoed.
    tty.write_all(b"\n")?;
    Ok(value)
}

fn read_hidden(fd: RawFd, tty: &mut (impl Read + io::Write)) -> Result<Zeroizing<String>> {
    // SAFETY: fd is a valid open tty and term is initialised by tcgetattr
    // before use.
    let guard = unsafe {
        let mut term = std::mem::MaybeUninit::<libc::termios>::uninit();
        if libc::tcgetattr(fd, term.as_mut_ptr()) != 0 {
            return Err(io::Error::last_os_error()).context("tcgetattr");
        }
        TermiosGuard { fd, orig: term.assume_init() }
    };

    let mut noecho = guard.orig;
    noecho.c_lflag &= !(libc::ECHO as libc::tcflag_t);
    noecho.c_lflag &= !(libc::ECHONL as libc::tcflag_t);

    // SAFETY: noecho is a valid termios copied from the saved state.
    unsafe {
        if libc::tcsetattr(fd, libc::TCSAFLUSH, &noecho) != 0 {
            return Err(io::Error::last_os_error()).context("tcsetattr");
        }
    }

    let mut buf = Zeroizing::new(Vec::<u8>::new());
    io::BufReader::new(tty).read_until(b'\n', &mut buf)?;
    drop(guard);

    while buf.last() == Some(&b'\n') || buf.last() == Some(&b'\r') {
        buf.pop();
    }
    let s = std::str::from_utf8(&buf)
        .context("passphrase is not valid UTF-8")?
        .to_string();
    Ok(Zeroizing::new(s))
}
