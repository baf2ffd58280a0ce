//! Named Stream Storage
//!
//! Recordings are sequential byte streams addressed by name. Each `create`
//! starts a new recording of that name; successive `open` calls replay the
//! recordings of a name in the order they were made. A reader returning 0
//! marks the end of a recording.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No recording left for stream '{0}'")]
    NotFound(String),
    #[error("Invalid stream name '{0}'")]
    InvalidName(String),
    #[error("Storage I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Append side of one recording
pub trait StoreWriter: Send {
    fn append(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush and write the end marker
    fn finish(&mut self) -> io::Result<()>;
}

/// Read side of one recording
pub trait StoreReader: Send {
    /// Read up to `buf.len()` bytes; 0 means end of recording
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Backing store for recorder and player sessions
pub trait StreamStore: Send + Sync {
    /// Start a new recording of `name`
    fn create(&self, name: &str) -> Result<Box<dyn StoreWriter>, StoreError>;

    /// Open the next not-yet-replayed recording of `name`
    fn open(&self, name: &str) -> Result<Box<dyn StoreReader>, StoreError>;
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Recordings as `<name>.<index>.sds` files in one directory
pub struct FileStore {
    dir: PathBuf,
    /// Next index to replay, per name
    play_index: Mutex<HashMap<String, u32>>,
}

impl FileStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        info!("File store at {}", dir.display());
        Ok(Self {
            dir,
            play_index: Mutex::new(HashMap::new()),
        })
    }

    /// Directory holding the recordings
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of recording `index` of `name`
    pub fn path(&self, name: &str, index: u32) -> PathBuf {
        self.dir.join(format!("{}.{}.sds", name, index))
    }
}

struct FileWriter {
    file: BufWriter<File>,
}

impl StoreWriter for FileWriter {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()
    }
}

struct FileReader {
    file: File,
}

impl StoreReader for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl StreamStore for FileStore {
    fn create(&self, name: &str) -> Result<Box<dyn StoreWriter>, StoreError> {
        validate_name(name)?;

        let mut index = 0;
        while self.path(name, index).exists() {
            index += 1;
        }
        let path = self.path(name, index);
        let file = File::options().write(true).create_new(true).open(&path)?;
        debug!("Recording to {}", path.display());

        Ok(Box::new(FileWriter {
            file: BufWriter::new(file),
        }))
    }

    fn open(&self, name: &str) -> Result<Box<dyn StoreReader>, StoreError> {
        validate_name(name)?;

        let mut play_index = self.play_index.lock().unwrap_or_else(PoisonError::into_inner);
        let index = play_index.entry(name.to_string()).or_insert(0);
        let path = self.path(name, *index);

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        *index += 1;
        debug!("Replaying {}", path.display());

        Ok(Box::new(FileReader { file }))
    }
}

#[derive(Default)]
struct MemoryInner {
    recordings: HashMap<String, Vec<Arc<Vec<u8>>>>,
    play_index: HashMap<String, usize>,
}

/// In-memory store; a recording becomes visible when its writer finishes
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a finished recording directly
    pub fn insert(&self, name: &str, bytes: Vec<u8>) {
        self.lock()
            .recordings
            .entry(name.to_string())
            .or_default()
            .push(Arc::new(bytes));
    }

    /// Finished recordings of `name`, oldest first
    pub fn recordings(&self, name: &str) -> Vec<Vec<u8>> {
        self.lock()
            .recordings
            .get(name)
            .map(|list| list.iter().map(|r| r.as_ref().clone()).collect())
            .unwrap_or_default()
    }
}

struct MemoryWriter {
    store: MemoryStore,
    name: String,
    bytes: Vec<u8>,
}

impl StoreWriter for MemoryWriter {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.bytes.extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        let bytes = std::mem::take(&mut self.bytes);
        self.store.insert(&self.name, bytes);
        Ok(())
    }
}

struct MemoryReader {
    bytes: Arc<Vec<u8>>,
    pos: usize,
}

impl StoreReader for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rest = &self.bytes[self.pos..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl StreamStore for MemoryStore {
    fn create(&self, name: &str) -> Result<Box<dyn StoreWriter>, StoreError> {
        validate_name(name)?;
        Ok(Box::new(MemoryWriter {
            store: self.clone(),
            name: name.to_string(),
            bytes: Vec::new(),
        }))
    }

    fn open(&self, name: &str) -> Result<Box<dyn StoreReader>, StoreError> {
        validate_name(name)?;

        let mut inner = self.lock();
        let index = inner.play_index.get(name).copied().unwrap_or(0);
        let bytes = inner
            .recordings
            .get(name)
            .and_then(|list| list.get(index))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        inner.play_index.insert(name.to_string(), index + 1);

        Ok(Box::new(MemoryReader { bytes, pos: 0 }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(reader: &mut dyn StoreReader) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn test_file_store_indexes_recordings() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        for payload in [b"first".as_slice(), b"second".as_slice()] {
            let mut writer = store.create("Accelerometer").unwrap();
            writer.append(payload).unwrap();
            writer.finish().unwrap();
        }

        assert!(store.path("Accelerometer", 0).exists());
        assert!(store.path("Accelerometer", 1).exists());

        assert_eq!(read_all(store.open("Accelerometer").unwrap().as_mut()), b"first");
        assert_eq!(read_all(store.open("Accelerometer").unwrap().as_mut()), b"second");
        assert!(matches!(
            store.open("Accelerometer"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_memory_store_visible_after_finish() {
        let store = MemoryStore::new();
        let mut writer = store.create("mic").unwrap();
        writer.append(&[1, 2, 3, 4]).unwrap();
        assert!(store.recordings("mic").is_empty());

        writer.finish().unwrap();
        assert_eq!(store.recordings("mic"), vec![vec![1, 2, 3, 4]]);
        assert_eq!(read_all(store.open("mic").unwrap().as_mut()), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_rejects_path_like_names() {
        let store = MemoryStore::new();
        for name in ["", "..", "a/b", "a\\b"] {
            assert!(matches!(store.create(name), Err(StoreError::InvalidName(_))));
        }
    }
}
