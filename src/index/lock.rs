//! Index lock protocol.
//!
//! Four named lock files coordinate cross-process access:
//!
//! - the *write* lock (exclusive) serializes all mutation,
//! - the *read* lock (shared) is held by every open reader for its
//!   lifetime to signal "do not delete files I might still reference",
//! - the *read-lock-processing* lock (exclusive) guards the
//!   escalate/de-escalate sequence itself against races,
//! - the *optimization* lock (exclusive, try-only) serializes merging.
//!
//! Escalating the read lock to exclusive proves that no other process is
//! reading; it fails soft so a writer can simply defer cleanup.

use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::storage::{LockFile, Storage};

/// Name of the write lock file.
pub const WRITE_LOCK_FILE: &str = "write.lock.file";
/// Name of the shared read lock file.
pub const READ_LOCK_FILE: &str = "read.lock.file";
/// Name of the lock guarding read-lock escalation.
pub const READ_LOCK_PROCESSING_LOCK_FILE: &str = "read-lock-processing.lock.file";
/// Name of the optimization lock file.
pub const OPTIMIZATION_LOCK_FILE: &str = "optimization.lock.file";

/// Number of non-blocking attempts made while escalating the read lock.
const ESCALATION_RETRIES: u32 = 10;

/// Obtain the exclusive write lock on the index, blocking until available.
pub fn obtain_write_lock(storage: &dyn Storage) -> Result<Box<dyn LockFile>> {
    let mut lock = storage.open_lock(WRITE_LOCK_FILE)?;
    lock.lock_exclusive()?;
    Ok(lock)
}

/// Obtain a shared read lock on the index.
///
/// It doesn't block other read or update processes, but prevents the index
/// files from premature cleaning-up.
pub fn obtain_read_lock(storage: &dyn Storage) -> Result<Box<dyn LockFile>> {
    let mut lock = storage.open_lock(READ_LOCK_FILE)?;
    lock.lock_shared()?;
    Ok(lock)
}

/// Escalate a held read lock to the exclusive level.
///
/// The shared lock is released first, then the exclusive lock is attempted
/// a bounded number of times with a short sleep between attempts. On
/// failure the shared lock is restored and `false` is returned; the caller
/// must skip cleanup for this cycle. On success the caller may delete
/// files and must then call [`de_escalate_read_lock`].
pub fn escalate_read_lock(storage: &dyn Storage, read_lock: &mut dyn LockFile) -> Result<bool> {
    let mut processing = storage.open_lock(READ_LOCK_PROCESSING_LOCK_FILE)?;
    processing.lock_exclusive()?;

    // Release the shared level first: a conditional promotion to exclusive
    // fails while the shared lock is held, even for the only holder.
    read_lock.unlock()?;

    for _ in 0..ESCALATION_RETRIES {
        if read_lock.try_lock_exclusive()? {
            processing.unlock()?;
            return Ok(true);
        }

        thread::sleep(Duration::from_micros(1));
    }

    // Restore lock state
    read_lock.lock_shared()?;

    processing.unlock()?;
    Ok(false)
}

/// De-escalate an escalated read lock back to the shared level.
pub fn de_escalate_read_lock(read_lock: &mut dyn LockFile) -> Result<()> {
    read_lock.lock_shared()
}

/// Try to obtain the exclusive optimization lock without blocking.
///
/// Returns `None` when another process is already merging.
pub fn obtain_optimization_lock(storage: &dyn Storage) -> Result<Option<Box<dyn LockFile>>> {
    let mut lock = storage.open_lock(OPTIMIZATION_LOCK_FILE)?;
    if lock.try_lock_exclusive()? {
        Ok(Some(lock))
    } else {
        Ok(None)
    }
}
