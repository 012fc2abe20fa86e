//! Storage adapter for the cache directory
//!
//! The store only talks to disk through [`Storage`], so tests can swap in
//! [`MemoryStorage`] and inject write failures.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tokio::fs;

/// Prefix of temp files written during atomic writes
pub const TEMP_FILE_PREFIX: &str = ".imgkeep-tmp-";

/// Filesystem operations needed by the cache store
#[async_trait]
pub trait Storage: Send + Sync {
    async fn exists(&self, path: &Path) -> io::Result<bool>;

    async fn read(&self, path: &Path) -> io::Result<String>;

    async fn read_binary(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Replace the file contents; must not leave a truncated file on failure
    async fn write(&self, path: &Path, contents: &str) -> io::Result<()>;

    async fn write_binary(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    async fn remove(&self, path: &Path) -> io::Result<()>;

    /// Files directly inside `dir`
    async fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    /// Modification time, `None` if the file does not exist
    async fn stat(&self, path: &Path) -> io::Result<Option<SystemTime>>;

    async fn create_dir_all(&self, dir: &Path) -> io::Result<()>;
}

/// Tokio-backed filesystem storage
#[derive(Debug, Default, Clone)]
pub struct FsStorage;

impl FsStorage {
    pub fn new() -> Self {
        Self
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let parent = path.parent().unwrap_or(Path::new("."));
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let tmp_path = parent.join(format!(
            "{}{}.{}",
            TEMP_FILE_PREFIX,
            path.file_name().and_then(|v| v.to_str()).unwrap_or("file"),
            nanos
        ));

        if let Err(e) = fs::write(&tmp_path, data).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        if let Err(e) = fs::rename(&tmp_path, path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn exists(&self, path: &Path) -> io::Result<bool> {
        fs::try_exists(path).await
    }

    async fn read(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path).await
    }

    async fn read_binary(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path).await
    }

    async fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        self.write_atomic(path, contents.as_bytes()).await
    }

    async fn write_binary(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.write_atomic(path, data).await
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    async fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    async fn stat(&self, path: &Path) -> io::Result<Option<SystemTime>> {
        match fs::metadata(path).await {
            Ok(meta) => meta.modified().map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir).await
    }
}

#[derive(Debug)]
struct MemoryFile {
    data: Vec<u8>,
    modified: SystemTime,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<PathBuf, MemoryFile>,
    writes: HashMap<PathBuf, usize>,
    failing: Vec<String>,
    clock: u64,
}

/// In-memory storage with write counters and injectable failures
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write to a path ending in `suffix` fail
    pub fn fail_writes_to(&self, suffix: &str) {
        self.lock().failing.push(suffix.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    /// Number of successful writes to `path`
    pub fn write_count(&self, path: &Path) -> usize {
        self.lock().writes.get(path).copied().unwrap_or(0)
    }

    /// Store a file directly, as another process would
    pub fn put(&self, path: &Path, data: &[u8]) {
        let mut state = self.lock();
        let modified = state.tick();
        state.files.insert(
            path.to_path_buf(),
            MemoryFile {
                data: data.to_vec(),
                modified,
            },
        );
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().files.contains_key(path)
    }

    pub fn file_names(&self) -> Vec<String> {
        self.lock()
            .files
            .keys()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_bytes(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut state = self.lock();
        let name = path.to_string_lossy();
        if state.failing.iter().any(|suffix| name.ends_with(suffix.as_str())) {
            return Err(io::Error::other(format!("injected write failure: {}", name)));
        }
        let modified = state.tick();
        state.files.insert(
            path.to_path_buf(),
            MemoryFile {
                data: data.to_vec(),
                modified,
            },
        );
        *state.writes.entry(path.to_path_buf()).or_insert(0) += 1;
        Ok(())
    }
}

impl MemoryState {
    /// Strictly increasing fake modification times
    fn tick(&mut self) -> SystemTime {
        self.clock += 1;
        SystemTime::UNIX_EPOCH + Duration::from_secs(self.clock)
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, path.display().to_string())
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(self.contains(path))
    }

    async fn read(&self, path: &Path) -> io::Result<String> {
        let data = self.read_binary(path).await?;
        String::from_utf8(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn read_binary(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.lock()
            .files
            .get(path)
            .map(|f| f.data.clone())
            .ok_or_else(|| not_found(path))
    }

    async fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        self.write_bytes(path, contents.as_bytes())
    }

    async fn write_binary(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.write_bytes(path, data)
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        self.lock().files.remove(path);
        Ok(())
    }

    async fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        Ok(self
            .lock()
            .files
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect())
    }

    async fn stat(&self, path: &Path) -> io::Result<Option<SystemTime>> {
        Ok(self.lock().files.get(path).map(|f| f.modified))
    }

    async fn create_dir_all(&self, _dir: &Path) -> io::Result<()> {
        Ok(())
    }
}
