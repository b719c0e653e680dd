use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::ErrorKind;

pub const CONFIG_FILE: &str = "config";
pub const KEYS_DIR: &str = "keys";
pub const DATA_DIR: &str = "data";
pub const INDEX_DIR: &str = "index";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Local,
    Memory,
}

/// Opaque object store the engine persists repositories into.
///
/// Paths are `/`-separated logical names such as `config` or `data/<id>`.
/// `create` must fail with [`Error::AlreadyExists`] when the object is
/// present; everything else about durability and retries belongs to the
/// implementation.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn init(&self) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn read(&self, path: &str) -> Result<Bytes>;

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes>;

    async fn create(&self, path: &str, data: Bytes) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Returns full object paths (`prefix/name`) under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn stat(&self, path: &str) -> Result<ObjectInfo>;

    fn backend_type(&self) -> BackendType;

    /// Human readable location, without credentials.
    fn location(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub path: String,
    pub size: u64,
    pub modified: chrono::DateTime<chrono::Utc>,
}

/// Last path component of an object path.
pub fn object_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// In-memory backend. Used by tests and by callers that want a scratch
/// repository.
pub struct MemoryBackend {
    name: String,
    objects: Mutex<BTreeMap<String, (Bytes, chrono::DateTime<chrono::Utc>)>>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Overwrites an object in place. Only meant for corrupting data in tests.
    pub fn overwrite(&self, path: &str, data: Bytes) {
        self.objects
            .lock()
            .insert(path.to_string(), (data, chrono::Utc::now()));
    }

    fn not_found(&self, path: &str) -> Error {
        Error::Io(std::io::Error::new(
            ErrorKind::NotFound,
            format!("{}: {path} not found", self.name),
        ))
    }

    fn get(&self, path: &str) -> Result<Bytes> {
        self.objects
            .lock()
            .get(path)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| self.not_found(path))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.objects.lock().contains_key(path))
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        self.get(path)
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes> {
        let data = self.get(path)?;
        let start = offset as usize;
        let end = start.saturating_add(length as usize);
        if end > data.len() {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                format!(
                    "{}: range {start}..{end} beyond end of {path} ({} bytes)",
                    self.name,
                    data.len()
                ),
            )));
        }
        Ok(data.slice(start..end))
    }

    async fn create(&self, path: &str, data: Bytes) -> Result<()> {
        let mut objects = self.objects.lock();
        if objects.contains_key(path) {
            return Err(Error::AlreadyExists {
                path: path.to_string(),
            });
        }
        objects.insert(path.to_string(), (data, chrono::Utc::now()));
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects.lock().remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = format!("{prefix}/");
        Ok(self
            .objects
            .lock()
            .keys()
            .filter(|k| k.starts_with(&dir))
            .cloned()
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<ObjectInfo> {
        let objects = self.objects.lock();
        let (data, modified) = objects
            .get(path)
            .ok_or_else(|| self.not_found(path))?;
        Ok(ObjectInfo {
            path: path.to_string(),
            size: data.len() as u64,
            modified: *modified,
        })
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }

    fn location(&self) -> String {
        format!("memory:{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_is_exclusive() {
        let backend = MemoryBackend::new("t");
        backend.create("config", Bytes::from_static(b"one")).await.unwrap();
        let err = backend
            .create("config", Bytes::from_static(b"two"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
        assert_eq!(backend.read("config").await.unwrap(), Bytes::from_static(b"one"));
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let backend = MemoryBackend::new("t");
        for err in [
            backend.read("keys/missing").await.unwrap_err(),
            backend.stat("keys/missing").await.unwrap_err(),
        ] {
            assert!(matches!(&err, Error::Io(e) if e.kind() == ErrorKind::NotFound));
        }
    }

    #[tokio::test]
    async fn test_list_and_range() {
        let backend = MemoryBackend::new("t");
        backend.create("data/aa", Bytes::from_static(b"0123456789")).await.unwrap();
        backend.create("keys/bb", Bytes::from_static(b"k")).await.unwrap();

        assert_eq!(backend.list("data").await.unwrap(), vec!["data/aa".to_string()]);
        assert_eq!(
            backend.read_range("data/aa", 2, 3).await.unwrap(),
            Bytes::from_static(b"234")
        );
        assert!(matches!(
            backend.read_range("data/aa", 8, 3).await,
            Err(Error::Io(e)) if e.kind() == ErrorKind::UnexpectedEof
        ));
        assert_eq!(object_name("data/aa"), "aa");
    }
}
