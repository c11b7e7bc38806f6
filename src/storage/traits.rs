//! Storage abstraction trait and common types.

use crate::error::{KontosError, Result};
use std::io::{Read, Seek, Write};

/// A trait for storage backends that hold a flat namespace of named files.
///
/// This provides a pluggable interface for different storage implementations
/// like file system or memory.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open a file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file for writing, truncating any existing content.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Open a file for in-place writing without truncation, creating it if
    /// it does not exist. Used to patch fixed-offset fields such as the
    /// segment name counter and the generation pointer.
    fn open_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// Rename a file.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Set the modification time of a file to now, creating it if missing.
    fn touch_file(&self, name: &str) -> Result<()>;

    /// List all files in the storage, sorted by name.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Get the modification time of a file (seconds since epoch).
    fn file_modified(&self, name: &str) -> Result<u64>;

    /// Release any in-process cached handle for the file.
    ///
    /// Backends without a handle cache treat this as a no-op. Cleanup uses
    /// it when physical deletion must be deferred because another process
    /// is reading.
    fn purge_file(&self, name: &str);

    /// Open an advisory lock file with the given name.
    fn open_lock(&self, name: &str) -> Result<Box<dyn LockFile>>;

    /// Sync all pending writes to storage.
    fn sync(&self) -> Result<()>;
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;

    /// Clone this input stream with an independent position.
    fn clone_input(&self) -> Result<Box<dyn StorageInput>>;
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Seek + Send + std::fmt::Debug {
    /// Get the current position in the output stream.
    fn position(&self) -> Result<u64>;

    /// Flush buffered data and sync the output to storage.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Close the output stream.
    fn close(&mut self) -> Result<()>;
}

/// An advisory lock on a named lock file.
///
/// A single handle can move between the unlocked, shared and exclusive
/// states; relocking an already-held handle converts the lock.
pub trait LockFile: Send + std::fmt::Debug {
    /// Acquire the lock exclusively, blocking until available.
    fn lock_exclusive(&mut self) -> Result<()>;

    /// Try to acquire the lock exclusively without blocking.
    ///
    /// Returns `false` if another handle currently holds the lock.
    fn try_lock_exclusive(&mut self) -> Result<bool>;

    /// Acquire the lock shared, blocking until no exclusive holder remains.
    fn lock_shared(&mut self) -> Result<()>;

    /// Release the lock. Releasing an unheld lock is a no-op.
    fn unlock(&mut self) -> Result<()>;
}

/// Error types specific to storage operations.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// File not found.
    FileNotFound(String),

    /// I/O error.
    IoError(String),

    /// Lock acquisition failed.
    LockFailed(String),

    /// Storage is closed.
    StorageClosed,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::FileNotFound(name) => write!(f, "File not found: {name}"),
            StorageError::IoError(msg) => write!(f, "I/O error: {msg}"),
            StorageError::LockFailed(name) => write!(f, "Failed to acquire lock: {name}"),
            StorageError::StorageClosed => write!(f, "Storage is closed"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for KontosError {
    fn from(err: StorageError) -> Self {
        KontosError::storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::FileNotFound("segments.gen".to_string());
        assert_eq!(err.to_string(), "File not found: segments.gen");

        let err = StorageError::LockFailed("write.lock.file".to_string());
        assert_eq!(err.to_string(), "Failed to acquire lock: write.lock.file");

        let err = StorageError::StorageClosed;
        assert_eq!(err.to_string(), "Storage is closed");
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: KontosError = StorageError::IoError("disk full".to_string()).into();
        assert_eq!(err.to_string(), "Storage error: I/O error: disk full");
    }
}
