use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// An exclusive advisory lock on a file.
///
/// The lock is acquired blocking: `lock` waits until no other holder
/// remains. Locks are advisory only: they serialize cooperating
/// processes, nothing else. The lock file is created if absent and is
/// never written to: overwriting a lock file from any process invalidates
/// locks held on it.
pub struct FileLock {
    file: Option<File>,
    path: PathBuf,
}

impl FileLock {
    /// Opens (creating if needed) the file at `path` and blocks until the
    /// exclusive lock is acquired.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        Self::acquire(&file)?;

        Ok(Self {
            file: Some(file),
            path,
        })
    }

    // Blocking flock(LOCK_EX), retried if interrupted by a signal.
    fn acquire(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        loop {
            let rc = unsafe { libc::flock(fd, libc::LOCK_EX) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Releases the lock by closing the descriptor. Consuming `self`
    /// guarantees the descriptor is closed exactly once.
    pub fn unlock(mut self) -> io::Result<()> {
        // Dropping the File closes the descriptor, which releases the lock.
        self.file.take();
        Ok(())
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock; the lock file itself is
        // left in place so other processes can reuse it.
    }
}
