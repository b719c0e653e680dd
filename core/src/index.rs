use crate::backend::{Backend, INDEX_DIR};
use crate::crypto::Encryptor;
use crate::pack::{PackedBlob, locate_blobs, read_header};
use crate::types::{ChunkID, ChunkLocation, PackID};
use crate::{Error, Result};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Concurrent pack header reads during a rebuild.
const REBUILD_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Index {
    pub chunks: HashMap<ChunkID, ChunkLocation>,
    pub packs: HashMap<PackID, PackInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackInfo {
    pub id: PackID,
    pub size: u64,
    pub chunk_count: u32,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chunk(&mut self, id: ChunkID, location: ChunkLocation) {
        self.chunks.insert(id, location);
    }

    pub fn add_pack(&mut self, info: PackInfo) {
        self.packs.insert(info.id, info);
    }

    /// Records a pack and every blob its header lists.
    pub fn add_pack_header(&mut self, pack_id: PackID, size: u64, blobs: &[PackedBlob]) {
        for (id, location) in locate_blobs(pack_id, blobs) {
            self.add_chunk(id, location);
        }
        self.add_pack(PackInfo {
            id: pack_id,
            size,
            chunk_count: blobs.len() as u32,
        });
    }

    pub fn has_chunk(&self, id: &ChunkID) -> bool {
        self.chunks.contains_key(id)
    }

    pub fn get_chunk(&self, id: &ChunkID) -> Option<&ChunkLocation> {
        self.chunks.get(id)
    }

    pub fn merge(&mut self, other: Index) {
        self.chunks.extend(other.chunks);
        self.packs.extend(other.packs);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty() && self.packs.is_empty()
    }

    /// Writes the index encrypted under `index/<id>` and returns the path.
    pub async fn save(&self, backend: &dyn Backend, encryptor: &Encryptor) -> Result<String> {
        let plaintext = serde_json::to_vec(self)?;
        let ciphertext = encryptor.encrypt(&plaintext)?;
        let path = format!("{INDEX_DIR}/{}", blake3::hash(&ciphertext).to_hex());
        backend.create(&path, Bytes::from(ciphertext)).await?;
        Ok(path)
    }

    pub async fn load(backend: &dyn Backend, path: &str, encryptor: &Encryptor) -> Result<Self> {
        let ciphertext = backend.read(path).await?;
        let plaintext = encryptor.decrypt(&ciphertext)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

/// Loads and merges every index file. Returns the merged index and the paths
/// it was read from.
pub async fn load_all(backend: &dyn Backend, encryptor: &Encryptor) -> Result<(Index, Vec<String>)> {
    let paths = backend.list(INDEX_DIR).await?;
    let mut merged = Index::new();
    for path in &paths {
        merged.merge(Index::load(backend, path, encryptor).await?);
    }
    debug!(files = paths.len(), chunks = merged.len(), "loaded index");
    Ok((merged, paths))
}

/// Reconstructs the index from pack headers alone.
pub async fn rebuild(
    backend: &dyn Backend,
    encryptor: &Encryptor,
    cancel: &CancellationToken,
) -> Result<Index> {
    let paths = backend.list(crate::backend::DATA_DIR).await?;
    let pack_ids = paths
        .iter()
        .map(|path| {
            crate::backend::object_name(path)
                .parse::<PackID>()
                .map_err(|e| Error::RepositoryBroken {
                    location: backend.location(),
                    reason: format!("unexpected object {path}: {e}"),
                })
        })
        .collect::<Result<Vec<_>>>()?;

    let headers: Vec<(PackID, u64, Vec<PackedBlob>)> = stream::iter(pack_ids)
        .map(|pack_id| async move {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let size = backend.stat(&pack_id.path()).await?.size;
            let blobs = read_header(backend, &pack_id, encryptor).await?;
            Ok::<_, Error>((pack_id, size, blobs))
        })
        .buffer_unordered(REBUILD_CONCURRENCY)
        .try_collect()
        .await?;

    let mut index = Index::new();
    for (pack_id, size, blobs) in &headers {
        index.add_pack_header(*pack_id, *size, blobs);
    }
    info!(packs = headers.len(), chunks = index.len(), "rebuilt index from pack headers");
    Ok(index)
}

#[derive(Debug, Default)]
struct IndexState {
    stored: Index,
    in_flight: HashSet<ChunkID>,
    unsaved: Index,
}

/// Index shared by concurrent writers.
///
/// A chunk id is in one of three states: unknown, in flight (reserved by a
/// writer that has not yet written its pack), or stored. `try_reserve` is the
/// only transition out of unknown, so two writers racing on the same id
/// cannot both store it.
#[derive(Debug, Default)]
pub struct SharedIndex {
    state: Mutex<IndexState>,
}

impl SharedIndex {
    pub fn new(stored: Index) -> Self {
        Self {
            state: Mutex::new(IndexState {
                stored,
                ..Default::default()
            }),
        }
    }

    pub fn has(&self, id: &ChunkID) -> bool {
        self.state.lock().stored.has_chunk(id)
    }

    /// Stored or reserved.
    pub fn is_known(&self, id: &ChunkID) -> bool {
        let state = self.state.lock();
        state.stored.has_chunk(id) || state.in_flight.contains(id)
    }

    pub fn locate(&self, id: &ChunkID) -> Option<ChunkLocation> {
        self.state.lock().stored.get_chunk(id).cloned()
    }

    /// Records a location directly. The latest record for an id wins.
    pub fn record(&self, id: ChunkID, location: ChunkLocation) {
        let mut state = self.state.lock();
        state.in_flight.remove(&id);
        state.unsaved.add_chunk(id, location.clone());
        state.stored.add_chunk(id, location);
    }

    /// Claims `id` for the caller. Returns false if it is already stored or
    /// claimed by someone else.
    pub fn try_reserve(&self, id: &ChunkID) -> bool {
        let mut state = self.state.lock();
        if state.stored.has_chunk(id) {
            return false;
        }
        state.in_flight.insert(*id)
    }

    pub fn release(&self, id: &ChunkID) {
        self.state.lock().in_flight.remove(id);
    }

    /// Moves every blob of a freshly written pack from in flight to stored.
    pub fn finalize_pack(&self, pack_id: PackID, size: u64, blobs: &[PackedBlob]) {
        let mut state = self.state.lock();
        for blob in blobs {
            state.in_flight.remove(&blob.id);
        }
        state.stored.add_pack_header(pack_id, size, blobs);
        state.unsaved.add_pack_header(pack_id, size, blobs);
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().stored.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().stored.is_empty()
    }

    /// Entries recorded since the last successful save.
    pub fn take_unsaved(&self) -> Index {
        std::mem::take(&mut self.state.lock().unsaved)
    }

    /// Puts entries back after a failed save.
    pub fn restore_unsaved(&self, index: Index) {
        self.state.lock().unsaved.merge(index);
    }

    /// Replaces the stored view wholesale. Reservations are kept.
    pub fn replace(&self, stored: Index) {
        let mut state = self.state.lock();
        state.stored = stored;
        state.unsaved = Index::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::crypto::MasterKey;
    use crate::types::BlobKind;
    use std::sync::Arc;

    fn blob(data: &[u8], length: u32) -> PackedBlob {
        PackedBlob {
            id: ChunkID::from_data(data),
            kind: BlobKind::Data,
            length,
            raw_length: length - 28,
            compressed: false,
        }
    }

    #[test]
    fn test_record_latest_location_wins() {
        let index = SharedIndex::new(Index::new());
        let id = ChunkID::from_data(b"recorded");
        let at = |pack: u8, offset: u64| ChunkLocation {
            pack_id: PackID::from_bytes([pack; 32]),
            kind: BlobKind::Data,
            offset,
            length: 40,
            raw_length: 12,
            compressed: false,
        };

        assert!(index.try_reserve(&id));
        index.record(id, at(1, 0));
        assert!(index.has(&id));
        assert!(!index.try_reserve(&id));
        assert_eq!(index.in_flight_count(), 0);

        index.record(id, at(2, 96));
        assert_eq!(index.locate(&id), Some(at(2, 96)));
        assert_eq!(index.len(), 1);

        let unsaved = index.take_unsaved();
        assert_eq!(unsaved.get_chunk(&id), Some(&at(2, 96)));
    }

    #[test]
    fn test_reservation_is_exclusive() {
        let index = SharedIndex::new(Index::new());
        let id = ChunkID::from_data(b"chunk");

        assert!(index.try_reserve(&id));
        assert!(!index.try_reserve(&id));
        assert!(index.is_known(&id));
        assert!(!index.has(&id));

        index.release(&id);
        assert!(!index.is_known(&id));
        assert!(index.try_reserve(&id));
    }

    #[test]
    fn test_finalize_offsets_are_cumulative() {
        let index = SharedIndex::new(Index::new());
        let blobs = vec![blob(b"a", 100), blob(b"b", 50), blob(b"c", 30)];
        for b in &blobs {
            assert!(index.try_reserve(&b.id));
        }

        let pack_id = PackID::from_bytes([4; 32]);
        index.finalize_pack(pack_id, 220, &blobs);

        assert_eq!(index.in_flight_count(), 0);
        assert_eq!(index.len(), 3);
        assert_eq!(index.locate(&blobs[0].id).unwrap().offset, 0);
        assert_eq!(index.locate(&blobs[1].id).unwrap().offset, 100);
        assert_eq!(index.locate(&blobs[2].id).unwrap().offset, 150);
        assert!(!index.try_reserve(&blobs[1].id));

        let unsaved = index.take_unsaved();
        assert_eq!(unsaved.len(), 3);
        assert_eq!(unsaved.packs.len(), 1);
        assert!(index.take_unsaved().is_empty());
    }

    #[test]
    fn test_concurrent_reservations_have_one_winner() {
        let index = Arc::new(SharedIndex::new(Index::new()));
        let id = ChunkID::from_data(b"contended");

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let index = index.clone();
                    scope.spawn(move || index.try_reserve(&id) as usize)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_save_load_all() {
        let backend = MemoryBackend::new("idx");
        let encryptor = MasterKey::generate().encryptor();

        let mut first = Index::new();
        first.add_pack_header(PackID::from_bytes([1; 32]), 100, &[blob(b"x", 60)]);
        let mut second = Index::new();
        second.add_pack_header(PackID::from_bytes([2; 32]), 100, &[blob(b"y", 60)]);

        first.save(&backend, &encryptor).await.unwrap();
        second.save(&backend, &encryptor).await.unwrap();

        let (merged, paths) = load_all(&backend, &encryptor).await.unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.packs.len(), 2);
        assert!(merged.has_chunk(&ChunkID::from_data(b"y")));
    }

    #[tokio::test]
    async fn test_rebuild_rejects_foreign_objects() {
        let backend = MemoryBackend::new("idx");
        let encryptor = MasterKey::generate().encryptor();
        backend
            .create("data/not-a-pack", Bytes::from_static(b"junk"))
            .await
            .unwrap();
        assert!(matches!(
            rebuild(&backend, &encryptor, &CancellationToken::new()).await,
            Err(Error::RepositoryBroken { .. })
        ));
    }
}
