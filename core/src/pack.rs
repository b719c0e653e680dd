//! Pack files.
//!
//! Layout of a pack object:
//!
//! ```text
//! [nonce | ciphertext | tag]   chunk 0
//! [nonce | ciphertext | tag]   chunk 1
//! ...
//! [nonce | encrypted header | tag]
//! [u32 LE: encrypted header length]
//! ```
//!
//! The header lists every chunk in order as (id, kind, stored length, raw
//! length, compressed). Offsets are implied by the order, so a pack describes
//! itself completely and can be indexed from its tail alone.

use crate::backend::Backend;
use crate::crypto::{CIPHERTEXT_OVERHEAD, Encryptor, MasterKey};
use crate::index::{PackInfo, SharedIndex};
use crate::types::{BlobKind, ChunkID, ChunkLocation, CompressionMode, PackID};
use crate::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const TRAILER_LEN: usize = 4;

/// Packs are flushed once their encrypted payload reaches this size.
pub const DEFAULT_PACK_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedBlob {
    pub id: ChunkID,
    pub kind: BlobKind,
    /// Length of the encrypted segment inside the pack.
    pub length: u32,
    /// Plaintext length before compression.
    pub raw_length: u32,
    pub compressed: bool,
}

/// Locations of every blob in a pack, derived from header order.
pub fn locate_blobs(pack_id: PackID, blobs: &[PackedBlob]) -> Vec<(ChunkID, ChunkLocation)> {
    let mut offset = 0u64;
    blobs
        .iter()
        .map(|blob| {
            let location = ChunkLocation {
                pack_id,
                kind: blob.kind,
                offset,
                length: blob.length,
                raw_length: blob.raw_length,
                compressed: blob.compressed,
            };
            offset += blob.length as u64;
            (blob.id, location)
        })
        .collect()
}

/// A pack being assembled in memory.
#[derive(Debug, Default)]
pub struct PackFile {
    blobs: Vec<PackedBlob>,
    data: Vec<u8>,
}

impl PackFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chunk(
        &mut self,
        id: ChunkID,
        kind: BlobKind,
        plaintext: &[u8],
        compression: CompressionMode,
        encryptor: &Encryptor,
    ) -> Result<()> {
        let raw_length = u32::try_from(plaintext.len())
            .map_err(|_| Error::Other(format!("chunk {id} too large for a pack")))?;

        let compressed = compress_data(plaintext, compression)?;
        let encrypted = match &compressed {
            Some(packed) => encryptor.encrypt(packed)?,
            None => encryptor.encrypt(plaintext)?,
        };

        self.blobs.push(PackedBlob {
            id,
            kind,
            length: encrypted.len() as u32,
            raw_length,
            compressed: compressed.is_some(),
        });
        self.data.extend_from_slice(&encrypted);
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn is_full(&self, max_size: usize) -> bool {
        self.data.len() >= max_size
    }

    pub fn chunk_ids(&self) -> Vec<ChunkID> {
        self.blobs.iter().map(|b| b.id).collect()
    }

    /// Appends the encrypted header and trailer, returning the pack bytes.
    pub fn finish(self, encryptor: &Encryptor) -> Result<(Vec<u8>, Vec<PackedBlob>)> {
        let header = bincode::serialize(&self.blobs).map_err(|e| Error::Other(e.to_string()))?;
        let encrypted_header = encryptor.encrypt(&header)?;
        let header_len = u32::try_from(encrypted_header.len())
            .map_err(|_| Error::Other("pack header too large".to_string()))?;

        let mut bytes = self.data;
        bytes.reserve(encrypted_header.len() + TRAILER_LEN);
        bytes.extend_from_slice(&encrypted_header);
        bytes.extend_from_slice(&header_len.to_le_bytes());
        Ok((bytes, self.blobs))
    }
}

fn corrupted(pack_id: &PackID, reason: impl Into<String>) -> Error {
    Error::CorruptedPack {
        id: pack_id.to_hex(),
        reason: reason.into(),
    }
}

fn header_length(pack_id: &PackID, trailer: &[u8], pack_size: u64) -> Result<u64> {
    let bytes: [u8; TRAILER_LEN] = trailer
        .try_into()
        .map_err(|_| corrupted(pack_id, "truncated trailer"))?;
    let header_len = u32::from_le_bytes(bytes) as u64;
    if header_len < CIPHERTEXT_OVERHEAD as u64 || header_len + TRAILER_LEN as u64 > pack_size {
        return Err(corrupted(pack_id, format!("invalid header length {header_len}")));
    }
    Ok(header_len)
}

fn decode_header(
    pack_id: &PackID,
    encrypted_header: &[u8],
    data_len: u64,
    encryptor: &Encryptor,
) -> Result<Vec<PackedBlob>> {
    let plaintext = encryptor.decrypt(encrypted_header)?;
    let blobs: Vec<PackedBlob> = bincode::deserialize(&plaintext)
        .map_err(|e| corrupted(pack_id, format!("undecodable header: {e}")))?;

    let described: u64 = blobs.iter().map(|b| b.length as u64).sum();
    if described != data_len {
        return Err(corrupted(
            pack_id,
            format!("header describes {described} bytes, pack holds {data_len}"),
        ));
    }
    Ok(blobs)
}

/// Reads and decrypts only the header of a stored pack.
pub async fn read_header(
    backend: &dyn Backend,
    pack_id: &PackID,
    encryptor: &Encryptor,
) -> Result<Vec<PackedBlob>> {
    let path = pack_id.path();
    let size = backend.stat(&path).await?.size;
    if size < (TRAILER_LEN + CIPHERTEXT_OVERHEAD) as u64 {
        return Err(corrupted(pack_id, "pack too small"));
    }

    let trailer = backend
        .read_range(&path, size - TRAILER_LEN as u64, TRAILER_LEN as u64)
        .await?;
    let header_len = header_length(pack_id, &trailer, size)?;
    let header_start = size - TRAILER_LEN as u64 - header_len;
    let encrypted_header = backend.read_range(&path, header_start, header_len).await?;

    decode_header(pack_id, &encrypted_header, header_start, encryptor)
}

/// Same as [`read_header`] for a pack already held in memory.
pub fn parse_header(
    pack_id: &PackID,
    pack: &[u8],
    encryptor: &Encryptor,
) -> Result<Vec<PackedBlob>> {
    let size = pack.len() as u64;
    if size < (TRAILER_LEN + CIPHERTEXT_OVERHEAD) as u64 {
        return Err(corrupted(pack_id, "pack too small"));
    }
    let trailer_start = pack.len() - TRAILER_LEN;
    let header_len = header_length(pack_id, &pack[trailer_start..], size)?;
    let header_start = trailer_start - header_len as usize;

    decode_header(
        pack_id,
        &pack[header_start..trailer_start],
        header_start as u64,
        encryptor,
    )
}

/// Decrypts one stored segment back to the chunk plaintext.
pub fn decode_chunk(segment: &[u8], location: &ChunkLocation, encryptor: &Encryptor) -> Result<Vec<u8>> {
    let plaintext = encryptor.decrypt(segment)?;
    let data = if location.compressed {
        decompress_data(&plaintext)?
    } else {
        plaintext
    };
    if data.len() != location.raw_length as usize {
        return Err(corrupted(
            &location.pack_id,
            format!(
                "chunk at offset {} decoded to {} bytes, expected {}",
                location.offset,
                data.len(),
                location.raw_length
            ),
        ));
    }
    Ok(data)
}

/// Reads a single chunk with one range read.
pub async fn read_chunk(
    backend: &dyn Backend,
    location: &ChunkLocation,
    encryptor: &Encryptor,
) -> Result<Vec<u8>> {
    let segment = backend
        .read_range(
            &location.pack_id.path(),
            location.offset,
            location.length as u64,
        )
        .await?;
    decode_chunk(&segment, location, encryptor)
}

/// Returns the zlib form of `data` when compression is on and it helps.
fn compress_data(data: &[u8], mode: CompressionMode) -> Result<Option<Vec<u8>>> {
    let level = match mode {
        CompressionMode::Off => return Ok(None),
        CompressionMode::Auto => flate2::Compression::default(),
        CompressionMode::Max => flate2::Compression::best(),
    };

    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), level);
    encoder.write_all(data)?;
    let compressed = encoder.finish()?;
    Ok((compressed.len() < data.len()).then_some(compressed))
}

fn decompress_data(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut result = Vec::new();
    decoder
        .read_to_end(&mut result)
        .map_err(|e| Error::Other(format!("decompression failed: {e}")))?;
    Ok(result)
}

/// Buffers new chunks for one writer and flushes them as packs.
///
/// Appends reserve the chunk id in the shared index first; ids already known
/// or in flight elsewhere are skipped. Reservations are finalized when the
/// pack is written and released if the write fails or the store is dropped
/// with unflushed chunks.
pub struct PackStore {
    backend: Arc<dyn Backend>,
    key: Arc<MasterKey>,
    encryptor: Encryptor,
    index: Arc<SharedIndex>,
    compression: CompressionMode,
    target_size: usize,
    current: PackFile,
}

impl PackStore {
    pub fn new(
        backend: Arc<dyn Backend>,
        key: Arc<MasterKey>,
        index: Arc<SharedIndex>,
        compression: CompressionMode,
    ) -> Self {
        let encryptor = key.encryptor();
        Self {
            backend,
            key,
            encryptor,
            index,
            compression,
            target_size: DEFAULT_PACK_SIZE,
            current: PackFile::new(),
        }
    }

    pub fn with_target_size(mut self, target_size: usize) -> Self {
        self.target_size = target_size;
        self
    }

    /// Buffered, not yet flushed bytes.
    pub fn pending_size(&self) -> usize {
        self.current.size()
    }

    /// Adds a chunk unless its id is already stored or reserved. Returns
    /// whether the chunk was queued.
    pub async fn append(&mut self, id: ChunkID, kind: BlobKind, plaintext: &[u8]) -> Result<bool> {
        if !self.index.try_reserve(&id) {
            debug!(chunk = %id.short_string(), "chunk already known, skipping");
            return Ok(false);
        }

        if let Err(e) = self
            .current
            .add_chunk(id, kind, plaintext, self.compression, &self.encryptor)
        {
            self.index.release(&id);
            return Err(e);
        }

        if self.current.is_full(self.target_size) {
            self.flush().await?;
        }
        Ok(true)
    }

    /// Writes the buffered chunks as one pack. Returns `None` when nothing is
    /// buffered.
    pub async fn flush(&mut self) -> Result<Option<PackInfo>> {
        if self.current.is_empty() {
            return Ok(None);
        }

        let pack = std::mem::take(&mut self.current);
        let ids = pack.chunk_ids();

        match self.write_pack(pack).await {
            Ok((pack_id, size, blobs)) => {
                self.index.finalize_pack(pack_id, size, &blobs);
                info!(pack = %pack_id, chunks = blobs.len(), size, "pack written");
                Ok(Some(PackInfo {
                    id: pack_id,
                    size,
                    chunk_count: blobs.len() as u32,
                }))
            }
            Err(e) => {
                warn!(chunks = ids.len(), error = %e, "pack write failed, releasing reservations");
                for id in &ids {
                    self.index.release(id);
                }
                Err(e)
            }
        }
    }

    async fn write_pack(&self, pack: PackFile) -> Result<(PackID, u64, Vec<PackedBlob>)> {
        let (bytes, blobs) = pack.finish(&self.encryptor)?;
        let pack_id = PackID::from_bytes(self.key.sign(&bytes));
        let size = bytes.len() as u64;
        self.backend.create(&pack_id.path(), Bytes::from(bytes)).await?;
        Ok((pack_id, size, blobs))
    }
}

impl Drop for PackStore {
    fn drop(&mut self) {
        let ids = self.current.chunk_ids();
        if !ids.is_empty() {
            warn!(chunks = ids.len(), "pack store dropped with unflushed chunks");
            for id in &ids {
                self.index.release(id);
            }
        }
    }
}
