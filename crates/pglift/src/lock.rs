//! Advisory file locks (`flock`).

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::model::BaseInstance;

/// An exclusive lock, released when dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

fn open(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| Error::io(path, e))
}

impl FileLock {
    /// Blocks until the lock is held.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = open(path)?;
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(Error::io(path, std::io::Error::last_os_error()));
        }
        log::trace!("acquired lock {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Takes the lock if nobody holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = open(path)?;
        // SAFETY: see `acquire`.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Ok(None);
            }
            return Err(Error::io(path, err));
        }
        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is still owned by `self.file`.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        log::trace!("released lock {}", self.path.display());
    }
}

/// Lock file of an instance: `.{datadir name}.pglift.lock` next to its data
/// directory, since `initdb` wants an empty data directory.
pub fn instance_lock_path(instance: &BaseInstance) -> PathBuf {
    let datadir = instance.datadir();
    let name = datadir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "data".to_string());
    let parent = datadir.parent().unwrap_or(Path::new("/"));
    parent.join(format!(".{}.pglift.lock", name))
}

/// Serializes state-changing operations on `instance`.
pub fn lock_instance(instance: &BaseInstance) -> Result<FileLock> {
    let path = instance_lock_path(instance);
    if let Some(lock) = FileLock::try_acquire(&path)? {
        return Ok(lock);
    }
    log::info!("waiting for another operation on instance {} to complete", instance);
    FileLock::acquire(&path)
}
