//! Raw-mode TTY reader for the keyboard-emulating barcode scanner.
//!
//! Opens `/dev/tty`, switches off echo, canonical mode and signal
//! generation, and turns the byte stream into logical keys, decoding the
//! common CSI escape sequences along the way. The original terminal mode is
//! restored on drop.
//!
//! Reads are cancellable: once the shutdown token fires, [`Tty::read_key`]
//! yields a synthetic newline so the caller's loop can observe the
//! cancellation and exit.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsFd;

use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::termios::{self, LocalFlags, SetArg, Termios};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("terminal setup failed: {0}")]
    Termios(#[source] nix::Error),

    #[error("input stream ended")]
    Eof,

    #[error("unknown escape sequence ending in {0:?}")]
    UnknownEscape(char),
}

/// A logical keystroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Enter,
    Escape,
    Backspace,
    Delete,
    ArrowUp,
    ArrowDown,
    ArrowLeft,
    ArrowRight,
    /// Ctrl+D, the keyboard way out.
    EndOfTransmission,
}

const ESC: u8 = 0x1b;

/// Something that yields bytes and knows whether more are already waiting.
/// The escape decoder needs the distinction: a lone `ESC` byte is the
/// escape key, an `ESC` with bytes behind it starts a sequence.
pub trait ByteSource {
    /// Next byte, blocking; `None` on end of stream.
    fn read_byte(&mut self) -> io::Result<Option<u8>>;

    /// Whether a byte can be read without blocking.
    fn has_pending(&mut self) -> io::Result<bool>;
}

/// Decode one logical key from the stream.
pub fn next_key<S: ByteSource>(src: &mut S) -> Result<Key, InputError> {
    let b = src.read_byte()?.ok_or(InputError::Eof)?;

    let key = match b {
        b'\r' | b'\n' => Key::Enter,
        0x04 => Key::EndOfTransmission,
        0x08 | 0x7f => Key::Backspace,
        ESC => return decode_escape(src),
        other => Key::Char(other as char),
    };
    Ok(key)
}

fn decode_escape<S: ByteSource>(src: &mut S) -> Result<Key, InputError> {
    // nothing buffered behind the ESC byte: a plain escape key
    if !src.has_pending()? {
        return Ok(Key::Escape);
    }

    let b = src.read_byte()?.ok_or(InputError::Eof)?;
    if b != b'[' {
        // alt+ combinations and friends are not supported
        return Err(InputError::UnknownEscape(b as char));
    }

    let b = src.read_byte()?.ok_or(InputError::Eof)?;
    match b {
        b'A' => Ok(Key::ArrowUp),
        b'B' => Ok(Key::ArrowDown),
        b'C' => Ok(Key::ArrowRight),
        b'D' => Ok(Key::ArrowLeft),
        b'3' => {
            // delete key: drain the trailing '~'
            let _ = src.read_byte()?;
            Ok(Key::Delete)
        }
        other => {
            if src.has_pending()? {
                // still a '~' in the buffer, drain it
                let _ = src.read_byte()?;
            }
            Err(InputError::UnknownEscape(other as char))
        }
    }
}

/// `/dev/tty` in raw-ish mode.
pub struct Tty {
    file: File,
    saved: Termios,
    cancel: CancellationToken,
}

impl Tty {
    pub fn open(cancel: CancellationToken) -> Result<Self, InputError> {
        let file = File::open("/dev/tty")?;

        let saved = termios::tcgetattr(file.as_fd()).map_err(InputError::Termios)?;
        let mut raw = saved.clone();
        raw.local_flags &=
            !(LocalFlags::ECHO | LocalFlags::ECHONL | LocalFlags::ICANON | LocalFlags::ISIG);
        termios::tcsetattr(file.as_fd(), SetArg::TCSANOW, &raw).map_err(InputError::Termios)?;

        Ok(Self {
            file,
            saved,
            cancel,
        })
    }

    /// Blocking read of the next logical key. Returns a synthetic
    /// [`Key::Enter`] once the shutdown token is cancelled.
    pub fn read_key(&mut self) -> Result<Key, InputError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(Key::Enter);
            }
            if self.poll_readable(250)? {
                return next_key(self);
            }
        }
    }

    /// Put the terminal back the way we found it.
    pub fn restore(&self) {
        if let Err(e) = termios::tcsetattr(self.file.as_fd(), SetArg::TCSANOW, &self.saved) {
            debug!(error = %e, "could not restore terminal mode");
        }
    }

    fn poll_readable(&self, timeout_ms: u16) -> io::Result<bool> {
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout_ms) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

impl ByteSource for Tty {
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(Some(b'\n'));
            }
            if !self.poll_readable(250)? {
                continue;
            }

            let mut buf = [0u8; 1];
            return match self.file.read(&mut buf) {
                Ok(0) => Ok(None),
                Ok(_) => Ok(Some(buf[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Err(e),
            };
        }
    }

    fn has_pending(&mut self) -> io::Result<bool> {
        self.poll_readable(0)
    }
}

impl Drop for Tty {
    fn drop(&mut self) {
        self.restore();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Scripted {
        bytes: VecDeque<u8>,
    }

    impl Scripted {
        fn new(bytes: &[u8]) -> Self {
            Self {
                bytes: bytes.iter().copied().collect(),
            }
        }
    }

    impl ByteSource for Scripted {
        fn read_byte(&mut self) -> io::Result<Option<u8>> {
            Ok(self.bytes.pop_front())
        }

        fn has_pending(&mut self) -> io::Result<bool> {
            Ok(!self.bytes.is_empty())
        }
    }

    fn keys(bytes: &[u8]) -> Vec<Result<Key, InputError>> {
        let mut src = Scripted::new(bytes);
        let mut out = Vec::new();
        loop {
            match next_key(&mut src) {
                Err(InputError::Eof) => return out,
                other => out.push(other),
            }
        }
    }

    #[test]
    fn plain_characters_and_newline() {
        let got = keys(b"ab\n");
        assert_eq!(got[0].as_ref().unwrap(), &Key::Char('a'));
        assert_eq!(got[1].as_ref().unwrap(), &Key::Char('b'));
        assert_eq!(got[2].as_ref().unwrap(), &Key::Enter);
    }

    #[test]
    fn carriage_return_is_enter() {
        assert_eq!(keys(b"\r")[0].as_ref().unwrap(), &Key::Enter);
    }

    #[test]
    fn lone_escape_is_the_escape_key() {
        assert_eq!(keys(b"\x1b")[0].as_ref().unwrap(), &Key::Escape);
    }

    #[test]
    fn arrow_keys_decode() {
        assert_eq!(keys(b"\x1b[A")[0].as_ref().unwrap(), &Key::ArrowUp);
        assert_eq!(keys(b"\x1b[B")[0].as_ref().unwrap(), &Key::ArrowDown);
        assert_eq!(keys(b"\x1b[C")[0].as_ref().unwrap(), &Key::ArrowRight);
        assert_eq!(keys(b"\x1b[D")[0].as_ref().unwrap(), &Key::ArrowLeft);
    }

    #[test]
    fn delete_sequence_drains_the_tilde() {
        let got = keys(b"\x1b[3~x");
        assert_eq!(got[0].as_ref().unwrap(), &Key::Delete);
        assert_eq!(got[1].as_ref().unwrap(), &Key::Char('x'));
    }

    #[test]
    fn backspace_variants() {
        assert_eq!(keys(b"\x08")[0].as_ref().unwrap(), &Key::Backspace);
        assert_eq!(keys(b"\x7f")[0].as_ref().unwrap(), &Key::Backspace);
    }

    #[test]
    fn ctrl_d_is_end_of_transmission() {
        assert_eq!(
            keys(b"\x04")[0].as_ref().unwrap(),
            &Key::EndOfTransmission
        );
    }

    #[test]
    fn unknown_csi_reports_and_drains_residue() {
        let got = keys(b"\x1b[5~z");
        assert!(matches!(got[0], Err(InputError::UnknownEscape('5'))));
        // the residual '~' was drained, decoding resumes cleanly
        assert_eq!(got[1].as_ref().unwrap(), &Key::Char('z'));
    }

    #[test]
    fn non_csi_escape_is_unknown() {
        let got = keys(b"\x1bq");
        assert!(matches!(got[0], Err(InputError::UnknownEscape('q'))));
    }
}
