//! Single-writer lease on a state directory.
//!
//! One process owns a state's log. The lease is an advisory `flock` on a
//! `LOCK` file inside the directory; it is released when the lease is dropped
//! or the process dies.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::Result;
use crate::Error;

pub const LOCK_FILE: &str = "LOCK";

pub struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    /// Takes the lease on `dir`, failing immediately if another owner holds it.
    /// The lock file records the owner's process ID for debugging.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(Error::LockError)?;

        if let Err(e) = Self::try_lock(&file) {
            let mut holder = String::new();
            let _ = file.read_to_string(&mut holder);
            return Err(Error::LockError(io::Error::new(
                e.kind(),
                format!(
                    "{} is held by process {}: {}",
                    path.display(),
                    holder.trim(),
                    e
                ),
            )));
        }

        file.set_len(0).map_err(Error::LockError)?;
        file.seek(SeekFrom::Start(0)).map_err(Error::LockError)?;
        writeln!(file, "{}", std::process::id()).map_err(Error::LockError)?;
        file.flush().map_err(Error::LockError)?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        // No advisory locking here; single ownership stays a documented precondition.
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
