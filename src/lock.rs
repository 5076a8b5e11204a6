//! Advisory lock serializing index builds on one database directory.
//!
//! A build takes the lock before its first category write and releases it
//! when the guard drops. Queries never take it; they only see whole
//! category files thanks to the atomic rename in the store.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Lock file created next to the category files
const LOCK_FILE_NAME: &str = "orion.lock";

/// Exclusive build lock, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Take the build lock on `dir` without waiting.
    ///
    /// Fails with [`io::ErrorKind::WouldBlock`] while another build holds it.
    pub fn try_acquire(dir: &Path) -> io::Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match sys::lock_exclusive(&file) {
            Ok(()) => Ok(Self { file, path }),
            Err(e) if sys::is_contended(&e) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("{} is held by another build", path.display()),
            )),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = sys::unlock(&self.file) {
            log::warn!("failed to release {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
        if unsafe { libc::flock(file.as_raw_fd(), operation) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    pub fn lock_exclusive(file: &File) -> io::Result<()> {
        flock(file, libc::LOCK_EX | libc::LOCK_NB)
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        flock(file, libc::LOCK_UN)
    }

    pub fn is_contended(e: &io::Error) -> bool {
        e.kind() == io::ErrorKind::WouldBlock
            || matches!(e.raw_os_error(), Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN)
    }
}

#[cfg(not(unix))]
mod sys {
    use std::fs::File;
    use std::io;

    // TODO: LockFileEx on Windows; until then concurrent builds are unguarded
    pub fn lock_exclusive(_file: &File) -> io::Result<()> {
        Ok(())
    }

    pub fn unlock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    pub fn is_contended(_e: &io::Error) -> bool {
        false
    }
}
