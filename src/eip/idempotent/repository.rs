use dashmap::{DashMap, Entry};
use fnv::FnvBuildHasher;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Storage of processed message keys.
///
/// `add` must be atomic: of several concurrent calls with the same key,
/// exactly one returns `true`. The same holds for `try_claim`, which marks a
/// key whose first exchange is still running. Claims are shared by every
/// consumer using the repository and are never persisted.
pub trait IdempotentRepository: Send + Sync {
    /// Adds the key, returning `false` when it was already present.
    fn add(&self, key: &str) -> Result<bool, RepositoryError>;

    fn contains(&self, key: &str) -> Result<bool, RepositoryError>;

    /// Removes the key, returning `false` when it was not present.
    fn remove(&self, key: &str) -> Result<bool, RepositoryError>;

    /// Confirms a key once the exchange that added it completed successfully.
    fn confirm(&self, _key: &str) -> Result<bool, RepositoryError> {
        Ok(true)
    }

    fn clear(&self) -> Result<(), RepositoryError>;

    /// Claims a key in progress, returning `false` when it is claimed already.
    fn try_claim(&self, key: &str) -> bool;

    fn release(&self, key: &str);

    fn repository_id(&self) -> &str;
}

/// Keys in progress, for repositories to hand out claims from.
#[derive(Default)]
pub struct ClaimSet {
    keys: DashMap<String, (), FnvBuildHasher>,
}

impl ClaimSet {
    pub fn try_claim(&self, key: &str) -> bool {
        match self.keys.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(());
                true
            }
        }
    }

    pub fn release(&self, key: &str) {
        self.keys.remove(key);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Repository '{repository}' I/O failure. {message}")]
    Io { repository: String, message: String },

    #[error("Repository '{repository}' is unavailable. {message}")]
    Unavailable { repository: String, message: String },
}

impl RepositoryError {
    #[inline]
    pub fn io(repository: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Io {
            repository: repository.into(),
            message: msg.into(),
        }
    }

    #[inline]
    pub fn unavailable(repository: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Unavailable {
            repository: repository.into(),
            message: msg.into(),
        }
    }
}

/// In-memory repository.
///
/// When bounded, the oldest keys are evicted once the capacity is exceeded.
pub struct MemoryIdempotentRepository {
    id: String,
    keys: DashMap<String, u64, FnvBuildHasher>,
    capacity: Option<usize>,
    order: Mutex<VecDeque<(String, u64)>>,
    sequence: AtomicU64,
    claims: ClaimSet,
}

impl MemoryIdempotentRepository {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_capacity(id, None)
    }

    pub fn bounded(id: impl Into<String>, capacity: usize) -> Self {
        Self::with_capacity(id, Some(capacity.max(1)))
    }

    pub fn with_capacity(id: impl Into<String>, capacity: Option<usize>) -> Self {
        Self {
            id: id.into(),
            keys: DashMap::with_hasher(FnvBuildHasher::default()),
            capacity,
            order: Mutex::new(VecDeque::new()),
            sequence: AtomicU64::new(0),
            claims: ClaimSet::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.keys.iter().map(|entry| entry.key().clone()).collect()
    }

    fn insert(&self, key: &str) -> bool {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        match self.keys.entry(key.to_string()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(vacant) => {
                vacant.insert(sequence);
            }
        }
        if let Some(capacity) = self.capacity {
            let mut order = self.order.lock();
            order.push_back((key.to_string(), sequence));
            // Removed keys leave stale entries behind.
            if order.len() > capacity.saturating_mul(2) {
                order.retain(|(key, seq)| self.keys.get(key).is_some_and(|current| *current == *seq));
            }
            while self.keys.len() > capacity {
                let Some((oldest, seq)) = order.pop_front() else {
                    break;
                };
                // Stale when the key was removed and added again since.
                if self.keys.remove_if(&oldest, |_, current| *current == seq).is_some() {
                    log::trace!("Repository '{}' evicted key '{}'", self.id, oldest);
                }
            }
        }
        true
    }
}

impl IdempotentRepository for MemoryIdempotentRepository {
    fn add(&self, key: &str) -> Result<bool, RepositoryError> {
        Ok(self.insert(key))
    }

    fn contains(&self, key: &str) -> Result<bool, RepositoryError> {
        Ok(self.keys.contains_key(key))
    }

    fn remove(&self, key: &str) -> Result<bool, RepositoryError> {
        Ok(self.keys.remove(key).is_some())
    }

    fn clear(&self) -> Result<(), RepositoryError> {
        let mut order = self.order.lock();
        order.clear();
        self.keys.clear();
        Ok(())
    }

    fn try_claim(&self, key: &str) -> bool {
        self.claims.try_claim(key)
    }

    fn release(&self, key: &str) {
        self.claims.release(key)
    }

    fn repository_id(&self) -> &str {
        &self.id
    }
}

/// Repository persisted to a text file, one key per line written as a JSON
/// string so that any key survives a reopen. Lines that are not JSON strings
/// are read verbatim.
///
/// Keys are served from memory. Adds append to the file, removals and
/// clears rewrite it. Existing keys are loaded when the repository opens.
pub struct FileIdempotentRepository {
    memory: MemoryIdempotentRepository,
    path: PathBuf,
    file_lock: Mutex<()>,
}

impl FileIdempotentRepository {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let path = path.as_ref().to_path_buf();
        let id = path.display().to_string();
        let memory = MemoryIdempotentRepository::new(id.clone());
        if path.exists() {
            let file = File::open(&path).map_err(|e| RepositoryError::io(&id, e.to_string()))?;
            for line in BufReader::new(file).lines() {
                let line = line.map_err(|e| RepositoryError::io(&id, e.to_string()))?;
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<String>(&line) {
                    Ok(key) => memory.insert(&key),
                    Err(_) => memory.insert(&line),
                };
            }
            log::debug!("Loaded {} keys into repository '{}'", memory.len(), id);
        }
        Ok(Self {
            memory,
            path,
            file_lock: Mutex::new(()),
        })
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    fn append(&self, key: &str) -> Result<(), RepositoryError> {
        let _guard = self.file_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        writeln!(file, "{}", encode(key)).map_err(|e| self.io_error(e))
    }

    fn rewrite(&self) -> Result<(), RepositoryError> {
        let _guard = self.file_lock.lock();
        let file = File::create(&self.path).map_err(|e| self.io_error(e))?;
        let mut writer = BufWriter::new(file);
        for key in self.memory.keys() {
            writeln!(writer, "{}", encode(&key)).map_err(|e| self.io_error(e))?;
        }
        writer.flush().map_err(|e| self.io_error(e))
    }

    fn io_error(&self, e: std::io::Error) -> RepositoryError {
        RepositoryError::io(self.memory.repository_id(), e.to_string())
    }
}

fn encode(key: &str) -> String {
    serde_json::Value::from(key).to_string()
}

impl IdempotentRepository for FileIdempotentRepository {
    fn add(&self, key: &str) -> Result<bool, RepositoryError> {
        if !self.memory.insert(key) {
            return Ok(false);
        }
        if let Err(e) = self.append(key) {
            self.memory.keys.remove(key);
            return Err(e);
        }
        Ok(true)
    }

    fn contains(&self, key: &str) -> Result<bool, RepositoryError> {
        self.memory.contains(key)
    }

    fn remove(&self, key: &str) -> Result<bool, RepositoryError> {
        if !self.memory.remove(key)? {
            return Ok(false);
        }
        self.rewrite()?;
        Ok(true)
    }

    fn clear(&self) -> Result<(), RepositoryError> {
        self.memory.clear()?;
        self.rewrite()
    }

    fn try_claim(&self, key: &str) -> bool {
        self.memory.try_claim(key)
    }

    fn release(&self, key: &str) {
        self.memory.release(key)
    }

    fn repository_id(&self) -> &str {
        self.memory.repository_id()
    }
}
