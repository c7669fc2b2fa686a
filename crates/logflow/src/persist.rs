//! Durable key/value persistence (§6.4, §3 "Persisted state layout").

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use logflow_core::PersistStore;
use logflow_error::{LogFlowError, Result};

/// Pure in-memory `PersistStore`; state does not survive a process
/// restart. Useful for tests and demos.
#[derive(Default)]
pub struct InMemoryPersistStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryPersistStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistStore for InMemoryPersistStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }
    fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.lock().unwrap().insert(key.to_string(), value.to_vec());
        Ok(())
    }
    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

const FORMAT_VERSION: u32 = 1;

/// A single opaque, versioned key/value file: every value is a
/// length-prefixed byte blob, keyed by a length-prefixed UTF-8 key
/// (`<driver>.seqnum`, `<driver>.queue.<n>`, `cfg.<key>`). The whole
/// table is read into memory on `open` and rewritten wholesale, via a
/// temp file plus rename, on every `store`/`remove` — acceptable since
/// the trait's own contract says this only runs at startup, graceful
/// shutdown, and reload handoff, never on a hot path.
pub struct FilePersistStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl FilePersistStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            read_table(&path).map_err(|e| persist_error(&path, e))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &HashMap<String, Vec<u8>>) -> Result<()> {
        write_table(&self.path, entries).map_err(|e| persist_error(&self.path, e))
    }
}

fn persist_error(path: &Path, e: std::io::Error) -> LogFlowError {
    LogFlowError::ConfigError(format!("persist store {}: {e}", path.display()))
}

impl PersistStore for FilePersistStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), value.to_vec());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(key);
        self.flush(&entries)
    }
}

fn read_table(path: &Path) -> std::io::Result<HashMap<String, Vec<u8>>> {
    let mut file = fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let mut cursor = &buf[..];
    let _version = read_u32(&mut cursor)?;
    let mut entries = HashMap::new();
    while !cursor.is_empty() {
        let key_len = read_u32(&mut cursor)? as usize;
        let key = String::from_utf8_lossy(&take(&mut cursor, key_len)?).into_owned();
        let val_len = read_u32(&mut cursor)? as usize;
        let val = take(&mut cursor, val_len)?;
        entries.insert(key, val);
    }
    Ok(entries)
}

fn write_table(path: &Path, entries: &HashMap<String, Vec<u8>>) -> std::io::Result<()> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    for (key, val) in entries {
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(&(val.len() as u32).to_le_bytes());
        buf.extend_from_slice(val);
    }
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = fs::File::create(&tmp_path)?;
        tmp.write_all(&buf)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)
}

fn read_u32(cursor: &mut &[u8]) -> std::io::Result<u32> {
    if cursor.len() < 4 {
        return Err(truncated());
    }
    let (head, rest) = cursor.split_at(4);
    *cursor = rest;
    Ok(u32::from_le_bytes(head.try_into().unwrap()))
}

fn take(cursor: &mut &[u8], len: usize) -> std::io::Result<Vec<u8>> {
    if cursor.len() < len {
        return Err(truncated());
    }
    let (head, rest) = cursor.split_at(len);
    *cursor = rest;
    Ok(head.to_vec())
}

fn truncated() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated persist file")
}
