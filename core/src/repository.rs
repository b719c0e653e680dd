use crate::backend::{Backend, CONFIG_FILE, INDEX_DIR};
use crate::chunker::{Chunker, ChunkerTables, random_polynomial};
use crate::config::{InitOptions, RepoConfig};
use crate::crypto::{Encryptor, KdfCost, MasterKey};
use crate::index::{self, Index, SharedIndex};
use crate::key::{self, KeyHint, KeyRecord};
use crate::pack::{self, PackStore, PackedBlob};
use crate::types::{BlobKind, ChunkID, PackID};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Read;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An unlocked repository.
///
/// A repository is a backend holding exactly one encrypted `config`, one or
/// more key records under `keys/`, immutable packs under `data/` and
/// advisory index files under `index/`:
///
/// ```text
/// repository/
/// ├── config          # encrypted RepoConfig
/// ├── keys/           # password-wrapped master key records
/// ├── data/           # packs, named by keyed hash of their bytes
/// └── index/          # encrypted chunk location indexes
/// ```
///
/// # Examples
///
/// ```no_run
/// use packvault_core::{InitOptions, MemoryBackend, Repository};
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() -> packvault_core::Result<()> {
///     let backend = Arc::new(MemoryBackend::new("scratch"));
///     let cancel = CancellationToken::new();
///
///     let repo = Repository::init(backend.clone(), "pw", InitOptions::default(), &cancel).await?;
///     let again = Repository::open(backend, "pw", &cancel).await?;
///     assert_eq!(repo.config(), again.config());
///     Ok(())
/// }
/// ```
pub struct Repository {
    backend: Arc<dyn Backend>,
    config: RepoConfig,
    key: Arc<MasterKey>,
    key_id: String,
    encryptor: Encryptor,
    chunker: Arc<ChunkerTables>,
    index: Arc<SharedIndex>,
}

/// One key record as shown by `key list`.
#[derive(Debug, Clone, Serialize)]
pub struct KeySummary {
    pub id: String,
    pub current: bool,
    pub created: DateTime<Utc>,
    pub hint: Option<KeyHint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RebuildStats {
    pub packs: usize,
    pub chunks: usize,
    pub superseded: usize,
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<()> {
    if password.is_empty() {
        return Err(Error::InvalidRequest("empty passwords are not allowed".to_string()));
    }
    Ok(())
}

impl Repository {
    /// Creates a new repository on `backend`.
    ///
    /// The key record is written first and the config last. The config's
    /// create-if-absent write is the commit point: a location holding a
    /// config is initialized, one holding only key records is broken. On
    /// cancellation or a failed config write the key record just written is
    /// removed again.
    ///
    /// # Errors
    ///
    /// * `Error::AlreadyInitialized` - a config already exists, or another
    ///   initialization committed first
    /// * `Error::RepositoryBroken` - key records exist without a config
    /// * `Error::InvalidRequest` - empty password or inconsistent options
    /// * `Error::PolynomialGenerationExhausted` - no irreducible polynomial found
    /// * `Error::Cancelled` - `cancel` fired before the commit point
    pub async fn init(
        backend: Arc<dyn Backend>,
        password: &str,
        options: InitOptions,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        validate_password(password)?;
        options.validate()?;
        check_cancelled(cancel)?;

        let location = backend.location();
        if backend.exists(CONFIG_FILE).await? {
            return Err(Error::AlreadyInitialized { location });
        }
        if !key::list_key_ids(backend.as_ref()).await?.is_empty() {
            return Err(Error::RepositoryBroken {
                location,
                reason: "key records present without a config".to_string(),
            });
        }
        backend.init().await?;

        let polynomial = match options.polynomial {
            Some(pol) => pol,
            None => random_polynomial()?,
        };
        let config = RepoConfig::new(options.version, polynomial, options.compression);
        let master = MasterKey::generate();
        let record = KeyRecord::seal(&master, password, options.kdf, options.hint)?;
        let encryptor = master.encryptor();

        check_cancelled(cancel)?;
        let key_id = key::save_key(backend.as_ref(), &record).await?;

        if cancel.is_cancelled() {
            discard_key(backend.as_ref(), &key_id).await;
            return Err(Error::Cancelled);
        }

        if let Err(e) = config.save(backend.as_ref(), &encryptor).await {
            discard_key(backend.as_ref(), &key_id).await;
            return Err(match e {
                Error::AlreadyExists { .. } => Error::AlreadyInitialized { location },
                other => other,
            });
        }

        info!(
            repository = %location,
            id = %config.short_id(),
            version = config.version,
            polynomial = %config.chunker_polynomial,
            "created repository"
        );
        Self::assemble(backend, config, master, key_id, Index::new())
    }

    /// Opens an existing repository with any of its passwords.
    ///
    /// # Errors
    ///
    /// * `Error::RepositoryNotFound` - no config and no keys at the location
    /// * `Error::RepositoryBroken` - key records without a config, or a config without keys
    /// * `Error::AuthenticationFailed` - no key record unlocks with `password`
    /// * `Error::InvalidFormatVersion` - unsupported repository version
    pub async fn open(
        backend: Arc<dyn Backend>,
        password: &str,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        check_cancelled(cancel)?;
        let location = backend.location();

        if !backend.exists(CONFIG_FILE).await? {
            if key::list_key_ids(backend.as_ref()).await?.is_empty() {
                return Err(Error::RepositoryNotFound { location });
            }
            return Err(Error::RepositoryBroken {
                location,
                reason: "key records present without a config".to_string(),
            });
        }

        let (key_id, master) = key::search_key(backend.as_ref(), password, cancel).await?;
        check_cancelled(cancel)?;

        let config = RepoConfig::load(backend.as_ref(), &master.encryptor()).await?;
        let (index, _) = index::load_all(backend.as_ref(), &master.encryptor()).await?;

        debug!(repository = %location, id = %config.short_id(), key = %key_id, "opened repository");
        Self::assemble(backend, config, master, key_id, index)
    }

    fn assemble(
        backend: Arc<dyn Backend>,
        config: RepoConfig,
        master: MasterKey,
        key_id: String,
        index: Index,
    ) -> Result<Self> {
        let chunker = ChunkerTables::new(config.chunker_polynomial)?;
        let encryptor = master.encryptor();
        Ok(Self {
            backend,
            config,
            key: Arc::new(master),
            key_id,
            encryptor,
            chunker,
            index: Arc::new(SharedIndex::new(index)),
        })
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn location(&self) -> String {
        self.backend.location()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Id of the key record this repository was unlocked with.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn encryptor(&self) -> &Encryptor {
        &self.encryptor
    }

    pub fn index(&self) -> &Arc<SharedIndex> {
        &self.index
    }

    /// A fresh chunker for one stream, sharing this repository's tables.
    pub fn chunker<R: Read>(&self, reader: R) -> Chunker<R> {
        Chunker::new(self.chunker.clone(), reader)
    }

    /// A pack buffer for one writer.
    pub fn pack_store(&self) -> PackStore {
        PackStore::new(
            self.backend.clone(),
            self.key.clone(),
            self.index.clone(),
            self.config.effective_compression(),
        )
    }

    /// Chunks `reader` and appends every chunk through `store`. Returns the
    /// ordered chunk ids; content already stored or in flight is skipped.
    /// Callers flush `store` when done.
    pub async fn store_stream<R: Read>(
        &self,
        reader: R,
        kind: BlobKind,
        store: &mut PackStore,
    ) -> Result<Vec<ChunkID>> {
        let mut chunker = self.chunker(reader);
        let mut ids = Vec::new();
        let mut added = 0usize;

        while let Some(chunk) = chunker.next_chunk()? {
            let id = chunk.id();
            if store.append(id, kind, chunk.data()).await? {
                added += 1;
            }
            ids.push(id);
        }

        debug!(chunks = ids.len(), new = added, "stored stream");
        Ok(ids)
    }

    /// Reads one chunk back and verifies its content identity.
    pub async fn load_blob(&self, id: &ChunkID) -> Result<Vec<u8>> {
        let location = self.index.locate(id).ok_or_else(|| Error::ChunkNotFound {
            id: id.to_hex(),
        })?;
        let data = pack::read_chunk(self.backend.as_ref(), &location, &self.encryptor).await?;
        if ChunkID::from_data(&data) != *id {
            return Err(Error::CorruptedPack {
                id: location.pack_id.to_hex(),
                reason: format!("chunk {} does not match its content hash", id.short_string()),
            });
        }
        Ok(data)
    }

    /// Fully verifies one pack: its name, its header and every chunk it lists.
    pub async fn check_pack(&self, pack_id: &PackID) -> Result<Vec<PackedBlob>> {
        let bytes = self.backend.read(&pack_id.path()).await?;
        if PackID::from_bytes(self.key.sign(&bytes)) != *pack_id {
            return Err(Error::CorruptedPack {
                id: pack_id.to_hex(),
                reason: "content does not match pack id".to_string(),
            });
        }

        let blobs = pack::parse_header(pack_id, &bytes, &self.encryptor)?;
        for (id, location) in pack::locate_blobs(*pack_id, &blobs) {
            let start = location.offset as usize;
            let segment = &bytes[start..start + location.length as usize];
            let data = pack::decode_chunk(segment, &location, &self.encryptor)?;
            if ChunkID::from_data(&data) != id {
                return Err(Error::CorruptedPack {
                    id: pack_id.to_hex(),
                    reason: format!("chunk {} does not match its content hash", id.short_string()),
                });
            }
        }
        debug!(pack = %pack_id, chunks = blobs.len(), "pack verified");
        Ok(blobs)
    }

    /// Persists index entries finalized since the last save. Returns the
    /// path written, if any.
    pub async fn save_index(&self) -> Result<Option<String>> {
        let unsaved = self.index.take_unsaved();
        if unsaved.is_empty() {
            return Ok(None);
        }

        match unsaved.save(self.backend.as_ref(), &self.encryptor).await {
            Ok(path) => {
                info!(path = %path, chunks = unsaved.len(), "saved index");
                Ok(Some(path))
            }
            Err(e) => {
                self.index.restore_unsaved(unsaved);
                Err(e)
            }
        }
    }

    /// Rebuilds the index from pack headers, writes it as one file and
    /// removes the index files it supersedes.
    pub async fn rebuild_index(&self, cancel: &CancellationToken) -> Result<RebuildStats> {
        let previous = self.backend.list(INDEX_DIR).await?;
        let rebuilt = index::rebuild(self.backend.as_ref(), &self.encryptor, cancel).await?;
        check_cancelled(cancel)?;

        let stats = RebuildStats {
            packs: rebuilt.packs.len(),
            chunks: rebuilt.len(),
            superseded: previous.len(),
        };

        let written = if rebuilt.is_empty() {
            None
        } else {
            Some(rebuilt.save(self.backend.as_ref(), &self.encryptor).await?)
        };
        for path in &previous {
            if Some(path) != written.as_ref() {
                self.backend.delete(path).await?;
            }
        }

        self.index.replace(rebuilt);
        info!(packs = stats.packs, chunks = stats.chunks, superseded = stats.superseded, "index rebuilt");
        Ok(stats)
    }

    /// Seals the unlocked master key under an additional password.
    pub async fn add_key(&self, password: &str, cost: KdfCost, hint: Option<KeyHint>) -> Result<String> {
        validate_password(password)?;
        let record = KeyRecord::seal(&self.key, password, cost, hint)?;
        let id = key::save_key(self.backend.as_ref(), &record).await?;
        info!(key = %id, "added key");
        Ok(id)
    }

    pub async fn list_keys(&self) -> Result<Vec<KeySummary>> {
        let mut keys = Vec::new();
        for id in key::list_key_ids(self.backend.as_ref()).await? {
            let record = key::load_key(self.backend.as_ref(), &id).await?;
            keys.push(KeySummary {
                current: id == self.key_id,
                id,
                created: record.created,
                hint: record.hint,
            });
        }
        Ok(keys)
    }

    /// Deletes a key record. The key in use cannot be removed.
    pub async fn remove_key(&self, id: &str) -> Result<()> {
        if id == self.key_id {
            return Err(Error::InvalidRequest(
                "refusing to remove the key currently in use".to_string(),
            ));
        }
        let path = key::key_path(id);
        if !self.backend.exists(&path).await? {
            return Err(Error::KeyNotFound { id: id.to_string() });
        }
        self.backend.delete(&path).await?;
        info!(key = %id, "removed key");
        Ok(())
    }
}

async fn discard_key(backend: &dyn Backend, key_id: &str) {
    if let Err(e) = backend.delete(&key::key_path(key_id)).await {
        warn!(key = %key_id, error = %e, "failed to remove key record of aborted initialization");
    }
}
