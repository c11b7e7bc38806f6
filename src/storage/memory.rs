//! In-memory storage implementation for testing and temporary indexes.

use crate::error::Result;
use crate::storage::traits::{LockFile, Storage, StorageError, StorageInput, StorageOutput};
use ahash::AHashMap;
use parking_lot::{Condvar, Mutex};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

type FileMap = Arc<Mutex<AHashMap<String, Arc<Vec<u8>>>>>;

/// An in-memory storage implementation.
///
/// This is useful for testing and for creating temporary indexes in memory.
/// Lock files are emulated with an in-process shared/exclusive lock table.
#[derive(Debug)]
pub struct MemoryStorage {
    /// The files stored in memory.
    files: FileMap,
    /// Shared/exclusive lock table keyed by lock file name.
    locks: Arc<LockTable>,
}

impl MemoryStorage {
    /// Create a new memory storage.
    pub fn new() -> Self {
        MemoryStorage {
            files: Arc::new(Mutex::new(AHashMap::new())),
            locks: Arc::new(LockTable::default()),
        }
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        self.files.lock().values().map(|data| data.len() as u64).sum()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        MemoryStorage::new()
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(Box::new(MemoryInput::new(Arc::clone(data))))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        Ok(Box::new(MemoryOutput::new(
            name.to_string(),
            Arc::clone(&self.files),
            Vec::new(),
        )))
    }

    fn open_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let existing = self
            .files
            .lock()
            .get(name)
            .map(|data| data.as_ref().clone())
            .unwrap_or_default();

        Ok(Box::new(MemoryOutput::new(
            name.to_string(),
            Arc::clone(&self.files),
            existing,
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut files = self.files.lock();
        let data = files
            .remove(old_name)
            .ok_or_else(|| StorageError::FileNotFound(old_name.to_string()))?;

        files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn touch_file(&self, name: &str) -> Result<()> {
        self.files
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Vec::new()));
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let files = self.files.lock();
        let mut file_names: Vec<String> = files.keys().cloned().collect();
        file_names.sort();
        Ok(file_names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(data.len() as u64)
    }

    fn file_modified(&self, name: &str) -> Result<u64> {
        if !self.file_exists(name) {
            return Err(StorageError::FileNotFound(name.to_string()).into());
        }

        Ok(SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs())
    }

    fn purge_file(&self, _name: &str) {
        // Memory storage holds no OS handles.
    }

    fn open_lock(&self, name: &str) -> Result<Box<dyn LockFile>> {
        self.touch_file(name)?;
        Ok(Box::new(MemoryLock {
            name: name.to_string(),
            table: Arc::clone(&self.locks),
            held: HeldState::None,
        }))
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// A memory-based input implementation.
#[derive(Debug)]
pub struct MemoryInput {
    data: Arc<Vec<u8>>,
    position: u64,
}

impl MemoryInput {
    fn new(data: Arc<Vec<u8>>) -> Self {
        MemoryInput { data, position: 0 }
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let len = self.data.len() as u64;
        if self.position >= len {
            return Ok(0);
        }

        let start = self.position as usize;
        let available = self.data.len() - start;
        let count = buf.len().min(available);
        buf[..count].copy_from_slice(&self.data[start..start + count]);
        self.position += count as u64;
        Ok(count)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.data.len() as i64 + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };

        if new_pos < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Seek before start of file",
            ));
        }

        self.position = new_pos as u64;
        Ok(self.position)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        Ok(Box::new(MemoryInput::new(Arc::clone(&self.data))))
    }
}

/// A memory-based output implementation.
///
/// The buffer is committed back into the file map on every flush so that
/// readers opened mid-stream observe the latest content, matching file
/// storage semantics.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    files: FileMap,
    cursor: Cursor<Vec<u8>>,
}

impl MemoryOutput {
    fn new(name: String, files: FileMap, existing: Vec<u8>) -> Self {
        MemoryOutput {
            name,
            files,
            cursor: Cursor::new(existing),
        }
    }

    fn commit(&mut self) {
        self.files
            .lock()
            .insert(self.name.clone(), Arc::new(self.cursor.get_ref().clone()));
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.cursor.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.commit();
        Ok(())
    }
}

impl Seek for MemoryOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageOutput for MemoryOutput {
    fn position(&self) -> Result<u64> {
        Ok(self.cursor.position())
    }

    fn flush_and_sync(&mut self) -> Result<()> {
        self.commit();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.commit();
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        self.commit();
    }
}

#[derive(Debug, Default)]
struct LockTable {
    states: Mutex<AHashMap<String, LockState>>,
    changed: Condvar,
}

#[derive(Debug, Default, Clone, Copy)]
struct LockState {
    readers: u32,
    writer: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum HeldState {
    None,
    Shared,
    Exclusive,
}

/// An in-process emulation of an advisory file lock.
#[derive(Debug)]
struct MemoryLock {
    name: String,
    table: Arc<LockTable>,
    held: HeldState,
}

impl MemoryLock {
    fn release_held(
        name: &str,
        held: &mut HeldState,
        states: &mut AHashMap<String, LockState>,
    ) {
        let state = states.entry(name.to_string()).or_default();
        match *held {
            HeldState::Shared => state.readers = state.readers.saturating_sub(1),
            HeldState::Exclusive => state.writer = false,
            HeldState::None => {}
        }
        *held = HeldState::None;
    }
}

impl LockFile for MemoryLock {
    fn lock_exclusive(&mut self) -> Result<()> {
        let mut states = self.table.states.lock();
        Self::release_held(&self.name, &mut self.held, &mut states);
        self.table.changed.notify_all();

        loop {
            let state = states.entry(self.name.clone()).or_default();
            if !state.writer && state.readers == 0 {
                state.writer = true;
                self.held = HeldState::Exclusive;
                return Ok(());
            }
            self.table.changed.wait(&mut states);
        }
    }

    fn try_lock_exclusive(&mut self) -> Result<bool> {
        let mut states = self.table.states.lock();
        let previous = self.held;
        Self::release_held(&self.name, &mut self.held, &mut states);

        let state = states.entry(self.name.clone()).or_default();
        if !state.writer && state.readers == 0 {
            state.writer = true;
            self.held = HeldState::Exclusive;
            return Ok(true);
        }

        // Restore what this handle previously held.
        match previous {
            HeldState::Shared => {
                state.readers += 1;
                self.held = HeldState::Shared;
            }
            HeldState::Exclusive => {
                state.writer = true;
                self.held = HeldState::Exclusive;
            }
            HeldState::None => {}
        }
        Ok(false)
    }

    fn lock_shared(&mut self) -> Result<()> {
        let mut states = self.table.states.lock();
        Self::release_held(&self.name, &mut self.held, &mut states);
        self.table.changed.notify_all();

        loop {
            let state = states.entry(self.name.clone()).or_default();
            if !state.writer {
                state.readers += 1;
                self.held = HeldState::Shared;
                return Ok(());
            }
            self.table.changed.wait(&mut states);
        }
    }

    fn unlock(&mut self) -> Result<()> {
        let mut states = self.table.states.lock();
        Self::release_held(&self.name, &mut self.held, &mut states);
        self.table.changed.notify_all();
        Ok(())
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        let _ = self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read() {
        let storage = MemoryStorage::new();

        {
            let mut output = storage.create_output("test.bin").unwrap();
            output.write_all(b"hello").unwrap();
            output.close().unwrap();
        }

        let mut input = storage.open_input("test.bin").unwrap();
        let mut content = Vec::new();
        input.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"hello");
        assert_eq!(storage.file_count(), 1);
        assert_eq!(storage.total_size(), 5);
    }

    #[test]
    fn test_flush_makes_content_visible() {
        let storage = MemoryStorage::new();

        let mut output = storage.create_output("test.bin").unwrap();
        output.write_all(b"partial").unwrap();
        output.flush().unwrap();

        // Content visible before close.
        assert_eq!(storage.file_size("test.bin").unwrap(), 7);
        output.close().unwrap();
    }

    #[test]
    fn test_open_output_in_place() {
        let storage = MemoryStorage::new();

        {
            let mut output = storage.create_output("test.bin").unwrap();
            output.write_all(b"aaaaaaaa").unwrap();
            output.close().unwrap();
        }

        {
            let mut output = storage.open_output("test.bin").unwrap();
            output.seek(SeekFrom::Start(2)).unwrap();
            output.write_all(b"bb").unwrap();
            output.close().unwrap();
        }

        let mut input = storage.open_input("test.bin").unwrap();
        let mut content = Vec::new();
        input.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"aabbaaaa");
    }

    #[test]
    fn test_shared_blocks_exclusive() {
        let storage = MemoryStorage::new();

        let mut reader = storage.open_lock("read.lock.file").unwrap();
        reader.lock_shared().unwrap();

        let mut writer = storage.open_lock("read.lock.file").unwrap();
        assert!(!writer.try_lock_exclusive().unwrap());

        reader.unlock().unwrap();
        assert!(writer.try_lock_exclusive().unwrap());
        writer.unlock().unwrap();
    }

    #[test]
    fn test_two_shared_locks_coexist() {
        let storage = MemoryStorage::new();

        let mut a = storage.open_lock("read.lock.file").unwrap();
        let mut b = storage.open_lock("read.lock.file").unwrap();
        a.lock_shared().unwrap();
        b.lock_shared().unwrap();
        a.unlock().unwrap();
        b.unlock().unwrap();
    }
}
