use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const LOCK_FILE: &str = "emberdb.lock";

/// Exclusive ownership of a data directory.
///
/// Opening a database claims its directory first, so a second instance
/// pointed at the same segments fails fast instead of interleaving
/// appends with the first. The lock file records the holder's process id;
/// a contended open reads it back and names the owner in its error.
/// Dropping the value closes the descriptor, which releases the lock; the
/// file itself stays behind for the next opener.
pub(crate) struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    /// Claims `dir` for this process.
    pub(crate) fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        if !try_exclusive(&file)? {
            let mut holder = String::new();
            file.read_to_string(&mut holder).ok();
            let holder = holder.trim();
            return Err(Error::Io(format!(
                "data directory {} is locked by process {}",
                dir.display(),
                if holder.is_empty() { "unknown" } else { holder },
            )));
        }

        // Only the winner rewrites the file; a losing open above must not
        // clobber the holder's recorded id.
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

/// Attempts the advisory lock without blocking. `Ok(false)` means another
/// descriptor holds it.
#[cfg(unix)]
fn try_exclusive(file: &File) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err.into())
    }
}

// No advisory locks to lean on here; single-instance ownership is by
// contract only.
#[cfg(not(unix))]
fn try_exclusive(_file: &File) -> Result<bool> {
    Ok(true)
}
