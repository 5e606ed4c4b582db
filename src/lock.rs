// Cross-process file locking composed with an intra-process mutex.
//
// Acquisition order is invariant: the intra-process mutex is always
// taken first, then the file lock. Two threads of one process never
// race toward the file lock at the same time, and a second process
// blocks on the OS-level lock until the first has released it.
use crate::errors::Result;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Cross-process advisory exclusive lock keyed to a filesystem path.
///
/// Each `acquire` opens a **fresh** OS file handle. Reusing a cached
/// handle across acquisitions would let a second acquisition by the
/// same process be silently granted by the kernel (locks on most
/// platforms are associated with `(process, inode)`, not `(fd, inode)`),
/// defeating mutual exclusion between threads of this process. Combined
/// with the intra-process mutex below, two threads never race toward
/// `lock_exclusive` simultaneously, so the "fresh handle" property alone
/// is sufficient to make cross-process exclusion correct.
pub struct FileLock {
    path: PathBuf,
}

/// RAII guard: the lock is held for the lifetime of this value and
/// released (by dropping the underlying file handle) when it is dropped.
pub struct FileLockGuard {
    _file: File,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Block until an exclusive lock on `self.path` is held by the
    /// caller, returning a guard that releases it on drop.
    pub fn acquire(&self) -> Result<FileLockGuard> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        Ok(FileLockGuard { _file: file })
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        // FileExt::unlock is best-effort; closing the fd (which happens
        // right after via the File's own Drop) also releases the OS
        // lock, so a failure here is not fatal.
        let _ = self._file.unlock();
    }
}

/// Combines the intra-process mutex with the cross-process `FileLock`,
/// always acquiring them in that order.
///
/// Callers never re-enter this lock from the same thread: `Allocator`
/// structures its critical sections so no helper called while holding
/// the lock calls back into `Locks::acquire`.
pub struct Locks {
    intra: Mutex<()>,
    file: FileLock,
}

pub struct LocksGuard<'a> {
    _intra: MutexGuard<'a, ()>,
    _file: FileLockGuard,
}

impl Locks {
    pub fn new(lock_path: impl Into<PathBuf>) -> Self {
        Self {
            intra: Mutex::new(()),
            file: FileLock::new(lock_path),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.file.path
    }

    /// Acquire both locks in the mandated order: intra-process mutex
    /// first, then the cross-process file lock.
    pub fn acquire(&self) -> Result<LocksGuard<'_>> {
        let intra = self
            .intra
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let file = self.file.acquire()?;
        Ok(LocksGuard {
            _intra: intra,
            _file: file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn fresh_handle_per_acquisition_allows_sequential_reacquire() {
        let dir = TempDir::new().unwrap();
        let lock = FileLock::new(dir.path().join("l"));
        {
            let _g = lock.acquire().unwrap();
        }
        // Second acquisition must succeed promptly now that the first
        // guard has been dropped.
        let _g2 = lock.acquire().unwrap();
    }

    #[test]
    fn locks_serialize_across_threads() {
        let dir = TempDir::new().unwrap();
        let locks = Arc::new(Locks::new(dir.path().join("l")));
        let counter = Arc::new(Mutex::new(0u32));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                let _g = locks.acquire().unwrap();
                let mut c = counter.lock().unwrap();
                let before = *c;
                thread::sleep(std::time::Duration::from_millis(2));
                *c = before + 1;
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*counter.lock().unwrap(), 8);
    }
}
