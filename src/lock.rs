//! The cross-process lock serializing every mutation of the client's state
//! directory (descriptor cache, packet queue, reply-block log, key files).

use crate::prelude::*;
use crate::util::retry_interrupted;
use fs2::FileExt;
use std::cell::{Cell, RefCell};
use std::fs::{File, OpenOptions};

/// An advisory lock over one state directory.  `acquire` blocks until the
/// lock is held and is re-entrant within the process: nested guards share
/// the one OS-level lock, which is released when the last guard drops.
pub struct ClientLock {
    path: PathBuf,
    depth: Cell<u32>,
    file: RefCell<Option<File>>,
}

impl ClientLock {
    pub fn new(path: &Path) -> ClientLock {
        ClientLock {
            path: path.to_path_buf(),
            depth: Cell::new(0),
            file: RefCell::new(None),
        }
    }

    pub fn acquire(&self) -> Result<LockGuard<'_>> {
        if self.depth.get() == 0 {
            // The lock file must be opened in write mode: on Windows, append
            // mode isn't good enough for flock-style locking.
            let f = OpenOptions::new()
                .write(true)
                .create(true)
                .open(&self.path)
                .map_err(|source| MixError::LockUnavailable {
                    path: self.path.clone(),
                    source,
                })?;
            retry_interrupted(|| f.lock_exclusive())?;
            *self.file.borrow_mut() = Some(f);
        }
        self.depth.set(self.depth.get() + 1);
        Ok(LockGuard { lock: self })
    }

    #[cfg(test)]
    pub fn held(&self) -> bool {
        self.depth.get() > 0
    }
}

pub struct LockGuard<'a> {
    lock: &'a ClientLock,
}

impl std::fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("lock", &self.lock.path).finish()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let depth = self.lock.depth.get();
        debug_assert!(depth > 0);
        self.lock.depth.set(depth - 1);
        if depth == 1 {
            if let Some(f) = self.lock.file.borrow_mut().take() {
                if let Err(e) = f.unlock() {
                    warn!("failed to release client lock: {}", e);
                }
            }
        }
    }
}
