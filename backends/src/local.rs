use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use packvault_core::backend::{Backend, BackendType, ObjectInfo};
use packvault_core::{Error, Result};
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// Marker embedded in the names of in-progress writes.
const TEMP_MARKER: &str = ".tmp-";

/// Repository stored as a plain directory tree.
///
/// Objects are written to a temporary sibling first and then hard-linked into
/// place. The link fails when the target exists, which gives create-if-absent
/// semantics, and readers never see a partially written object.
pub struct LocalBackend {
    base_path: PathBuf,
}

impl LocalBackend {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }
}

fn io_error(path: &str, e: std::io::Error) -> Error {
    Error::Io(std::io::Error::new(e.kind(), format!("{path}: {e}")))
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(TEMP_MARKER)
}

#[async_trait]
impl Backend for LocalBackend {
    async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        fs::try_exists(self.full_path(path))
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let data = fs::read(self.full_path(path))
            .await
            .map_err(|e| io_error(path, e))?;
        Ok(Bytes::from(data))
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes> {
        let mut file = fs::File::open(self.full_path(path))
            .await
            .map_err(|e| io_error(path, e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_error(path, e))?;

        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| io_error(path, e))?;
        Ok(Bytes::from(buf))
    }

    async fn create(&self, path: &str, data: Bytes) -> Result<()> {
        let full_path = self.full_path(path);
        let parent = full_path
            .parent()
            .ok_or_else(|| Error::InvalidRequest(format!("invalid object path {path}")))?;
        let name = full_path
            .file_name()
            .ok_or_else(|| Error::InvalidRequest(format!("invalid object path {path}")))?
            .to_string_lossy()
            .to_string();
        fs::create_dir_all(parent).await?;

        let temp_path = parent.join(format!(".{name}{TEMP_MARKER}{}", uuid::Uuid::new_v4()));
        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::hard_link(&temp_path, &full_path).await
        }
        .await;

        if let Err(e) = fs::remove_file(&temp_path).await {
            debug!(path = %temp_path.display(), error = %e, "failed to remove temporary file");
        }

        match written {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(Error::AlreadyExists {
                path: path.to_string(),
            }),
            Err(e) => Err(io_error(path, e)),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.full_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(path, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_path = self.full_path(prefix);
        let mut results = Vec::new();

        let mut entries = match fs::read_dir(&full_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(results),
            Err(e) => return Err(io_error(prefix, e)),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !is_temp_name(name) {
                    results.push(format!("{prefix}/{name}"));
                }
            }
        }

        results.sort();
        Ok(results)
    }

    async fn stat(&self, path: &str) -> Result<ObjectInfo> {
        let metadata = fs::metadata(self.full_path(path))
            .await
            .map_err(|e| io_error(path, e))?;
        let modified: DateTime<Utc> = metadata.modified().map_err(|e| io_error(path, e))?.into();

        Ok(ObjectInfo {
            path: path.to_string(),
            size: metadata.len(),
            modified,
        })
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }

    fn location(&self) -> String {
        format!("local:{}", self.base_path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packvault_core::bootstrap::{self, InitRequest};
    use packvault_core::crypto::KdfCost;
    use packvault_core::{InitOptions, Repository};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_create_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.init().await.unwrap();

        backend.create("config", Bytes::from_static(b"first")).await.unwrap();
        let err = backend
            .create("config", Bytes::from_static(b"second"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
        assert_eq!(backend.read("config").await.unwrap(), Bytes::from_static(b"first"));

        // No temporary files are left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| is_temp_name(&e.file_name().to_string_lossy()))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_creates_have_one_winner() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path()));
        backend.init().await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let backend = backend.clone();
            tasks.push(tokio::spawn(async move {
                backend.create("config", Bytes::from(vec![i; 64])).await
            }));
        }

        let mut winners = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => winners += 1,
                Err(Error::AlreadyExists { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(backend.read("config").await.unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_list_range_and_delete() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());

        assert!(backend.list("data").await.unwrap().is_empty());
        backend.create("data/bb", Bytes::from_static(b"0123456789")).await.unwrap();
        backend.create("data/aa", Bytes::from_static(b"x")).await.unwrap();
        std::fs::write(dir.path().join("data/.cc.tmp-123"), b"partial").unwrap();

        assert_eq!(
            backend.list("data").await.unwrap(),
            vec!["data/aa".to_string(), "data/bb".to_string()]
        );
        assert_eq!(
            backend.read_range("data/bb", 3, 4).await.unwrap(),
            Bytes::from_static(b"3456")
        );
        assert!(backend.read_range("data/bb", 8, 4).await.is_err());
        assert_eq!(backend.stat("data/bb").await.unwrap().size, 10);

        backend.delete("data/aa").await.unwrap();
        backend.delete("data/aa").await.unwrap();
        assert!(!backend.exists("data/aa").await.unwrap());
    }

    #[tokio::test]
    async fn test_repository_on_disk() {
        let dir = TempDir::new().unwrap();
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(dir.path().join("repo")));
        let cancel = CancellationToken::new();
        let request = || InitRequest {
            options: InitOptions {
                kdf: KdfCost {
                    memory: 8,
                    iterations: 1,
                    parallelism: 1,
                },
                ..Default::default()
            },
            ..Default::default()
        };

        let repo = bootstrap::initialize(backend.clone(), "pw", request(), &cancel)
            .await
            .unwrap();
        assert!(dir.path().join("repo/config").is_file());
        assert_eq!(std::fs::read_dir(dir.path().join("repo/keys")).unwrap().count(), 1);

        let err = bootstrap::initialize(backend.clone(), "pw", request(), &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::AlreadyInitialized { .. }));

        let opened = Repository::open(backend, "pw", &cancel).await.unwrap();
        assert_eq!(opened.config(), repo.config());
    }
}
