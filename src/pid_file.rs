//! PID file lifecycle: exclusive advisory lock at startup, decimal PID plus
//! newline, liveness probe, removal on clean shutdown.
//!
//! Daemonization itself is a declared external collaborator, but the PID
//! file is implemented here because it is independently testable.

use std::fs::{File, OpenOptions};
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Name of the PID file within its configured directory.
pub const FILENAME: &str = "pxa-agent.pid";

/// Errors raised by [`PidFile`] operations.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// `dir_path` does not exist or is not a directory.
    #[error("PID file directory {0} is not a directory")]
    NotADirectory(PathBuf),
    /// Opening, locking, reading, or writing the file failed.
    #[error("PID file I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The file's content was not a valid process id.
    #[error("PID file content is not a valid process id")]
    InvalidContent,
    /// The file is already locked by another process.
    #[error("PID file is already locked by another process")]
    AlreadyLocked,
}

/// Owns the lifecycle of a single PID file: locking it, writing this
/// process's id, and cleaning up on shutdown.
pub struct PidFile {
    file_path: PathBuf,
    locked_file: Option<File>,
    cleanup_when_done: bool,
}

impl PidFile {
    /// Build a [`PidFile`] rooted at `dir_path`, which must already exist.
    ///
    /// # Errors
    /// Returns [`PidFileError::NotADirectory`] if `dir_path` is not a
    /// directory.
    pub fn new(dir_path: impl AsRef<Path>) -> Result<Self, PidFileError> {
        let dir_path = dir_path.as_ref();
        if !dir_path.is_dir() {
            return Err(PidFileError::NotADirectory(dir_path.to_path_buf()));
        }
        Ok(Self {
            file_path: dir_path.join(FILENAME),
            locked_file: None,
            cleanup_when_done: false,
        })
    }

    /// Returns `true` if the file holds the PID of a still-running process.
    ///
    /// # Errors
    /// Returns [`PidFileError`] if the file cannot be read or does not
    /// contain a valid PID.
    pub fn is_executing(&self) -> Result<bool, PidFileError> {
        let pid = self.read()?;
        Ok(process_exists(pid))
    }

    /// Attempt to take an exclusive, non-blocking lock on the PID file,
    /// creating it if necessary.
    ///
    /// # Errors
    /// Returns [`PidFileError::AlreadyLocked`] if another process already
    /// holds the lock, or [`PidFileError::Io`] for other failures.
    pub fn lock(&mut self) -> Result<(), PidFileError> {
        let file = OpenOptions::new().create(true).truncate(false).read(true).write(true).open(&self.file_path)?;
        exclusively_lock_file(&file)?;
        self.locked_file = Some(file);
        Ok(())
    }

    /// Write `pid` in decimal followed by a newline.
    ///
    /// # Errors
    /// Returns [`PidFileError::Io`] if the file cannot be written, or a
    /// logic error if [`PidFile::lock`] was never called.
    pub fn write(&mut self, pid: u32) -> Result<(), PidFileError> {
        let file = self.locked_file.as_mut().ok_or_else(|| {
            PidFileError::Io(std::io::Error::other("pid file must be locked before writing"))
        })?;
        file.set_len(0)?;
        std::io::Seek::seek(file, std::io::SeekFrom::Start(0))?;
        write!(file, "{pid}\n")?;
        file.flush()?;
        Ok(())
    }

    /// Read the stored PID.
    ///
    /// # Errors
    /// Returns [`PidFileError::Io`] if the file cannot be read, or
    /// [`PidFileError::InvalidContent`] if it does not contain a valid PID.
    pub fn read(&self) -> Result<u32, PidFileError> {
        let mut content = String::new();
        File::open(&self.file_path)?.read_to_string(&mut content)?;
        content.trim().parse().map_err(|_| PidFileError::InvalidContent)
    }

    /// Request that [`PidFile::cleanup`] be run when this value is dropped.
    pub fn cleanup_when_done(&mut self) { self.cleanup_when_done = true; }

    /// Release the lock (if held) and remove the PID file (if present).
    pub fn cleanup(&mut self) {
        self.locked_file = None;
        let _ = std::fs::remove_file(&self.file_path);
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if self.cleanup_when_done {
            self.cleanup();
        }
    }
}

#[cfg(unix)]
fn exclusively_lock_file(file: &File) -> Result<(), PidFileError> {
    use std::os::fd::AsRawFd as _;

    let fd = file.as_raw_fd();
    // SAFETY: `fd` is a valid, open file descriptor owned by `file` for the
    // duration of this call.
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        return if err.kind() == std::io::ErrorKind::WouldBlock {
            Err(PidFileError::AlreadyLocked)
        } else {
            Err(PidFileError::Io(err))
        };
    }
    Ok(())
}

#[cfg(not(unix))]
fn exclusively_lock_file(_file: &File) -> Result<(), PidFileError> {
    // Windows locking is not implemented; this is a documented gap.
    Ok(())
}

/// Checks whether `pid` refers to a currently running process.
///
/// On POSIX this sends the null signal via `kill(pid, 0)`, which does not
/// consider recycled PIDs or zombie processes. On other platforms this is a
/// best-effort stub that only recognizes the current process.
#[cfg(unix)]
#[must_use]
pub fn process_exists(pid: u32) -> bool {
    // SAFETY: signal 0 performs error checking only; it does not deliver a
    // signal to `pid`.
    let result = unsafe { libc::kill(i32::try_from(pid).unwrap_or(i32::MAX), 0) };
    result == 0
}

#[cfg(not(unix))]
#[must_use]
pub fn process_exists(pid: u32) -> bool {
    pid == std::process::id()
}
