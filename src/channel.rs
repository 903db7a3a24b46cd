//! The unidirectional signal channel from a worker to the supervisor.
//!
//! Implemented as a named FIFO rather than an anonymous pipe handed down as
//! an inherited file descriptor: the worker is a *re-exec'd* process (its
//! own fresh `argv`/environment via `Command::spawn`, not a `fork()` child
//! sharing the parent's descriptor table), so a filesystem-addressable
//! channel is the natural way to connect the two, and it is operator
//! visible the same way `kill.it` already is. See `SPEC_FULL.md` §4.3.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::Context;
use nix::unistd::mkfifo;
use nix::sys::stat::Mode;

use crate::model::{ResultFlag, WorkerToken};

/// Creates the FIFO. Must be called by the supervisor before the worker is
/// spawned, since opening a FIFO for read blocks until a writer exists (and
/// vice versa) unless opened non-blocking, which is why the reader side
/// below always opens with `O_NONBLOCK`.
pub fn create(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    if path.exists() {
        std::fs::remove_file(path).ok();
    }
    mkfifo(path, Mode::from_bits_truncate(0o600))
        .with_context(|| format!("mkfifo {}", path.display()))?;
    Ok(())
}

/// The supervisor's non-blocking read end.
pub struct Reader {
    file: File,
}

impl Reader {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .with_context(|| format!("open signal channel {} for reading", path.display()))?;
        Ok(Reader { file })
    }

    /// Non-blockingly drains every byte currently available, returning the
    /// tokens parsed from it in order. A byte outside `{1,2,3,4}` is
    /// reported as an error — the caller treats that as a protocol
    /// violation and applies kill-it-with-fire per `spec.md` §4.6.
    ///
    /// Stops as soon as [`WorkerToken::Exiting`] is read, without consuming
    /// any further bytes: `Exiting` is always followed by exactly one
    /// [`ResultFlag`] byte (`spec.md` §3), which is not itself a valid
    /// token and must be left in the channel for
    /// [`Reader::try_read_result_flag`].
    ///
    /// EOF (the write end closed with nothing more to read) is not an
    /// error: the reader simply stops, and whatever was read is returned.
    pub fn drain_tokens(&mut self) -> anyhow::Result<Vec<WorkerToken>> {
        let mut tokens = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.file.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    let token = WorkerToken::try_from(byte[0])?;
                    let is_exiting = token == WorkerToken::Exiting;
                    tokens.push(token);
                    if is_exiting {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(tokens)
    }

    /// Reads exactly one more byte as a [`ResultFlag`], tolerating the case
    /// where the channel is momentarily empty (the worker is guaranteed by
    /// `spec.md` §9 to have written the flag before its process exits, but a
    /// non-blocking read immediately after observing exit may still race
    /// the kernel's buffering, so the caller retries briefly).
    pub fn try_read_result_flag(&mut self) -> anyhow::Result<Option<ResultFlag>> {
        let mut byte = [0u8; 1];
        match self.file.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(ResultFlag::try_from(byte[0])?)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// The worker's blocking write end.
pub struct Writer {
    file: File,
}

impl Writer {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .with_context(|| format!("open signal channel {} for writing", path.display()))?;
        Ok(Writer { file })
    }

    pub fn send_token(&mut self, token: WorkerToken) -> anyhow::Result<()> {
        self.file.write_all(&[token as u8])?;
        self.file.flush()?;
        Ok(())
    }

    pub fn send_result_flag(&mut self, flag: ResultFlag) -> anyhow::Result<()> {
        self.file.write_all(&[flag as u8])?;
        self.file.flush()?;
        Ok(())
    }
}
