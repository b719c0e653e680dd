use crate::backend::{Backend, KEYS_DIR, object_name};
use crate::crypto::{KdfCost, KdfParams, MasterKey, NONCE_LEN, TAG_LEN, derive_key};
use crate::{Error, Result};
use bytes::Bytes;
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce, Tag,
    aead::{AeadCore, AeadInPlace, KeyInit, OsRng},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Descriptive label stored next to a key. Not authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHint {
    pub hostname: String,
    pub username: String,
}

impl KeyHint {
    pub fn current() -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());

        Self { hostname, username }
    }
}

/// One password's wrapping of the repository master key, stored at
/// `keys/<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<KeyHint>,
    pub kdf: KdfParams,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub tag: Vec<u8>,
}

impl KeyRecord {
    /// Wraps `master` under a key derived from `password` with a fresh salt.
    pub fn seal(
        master: &MasterKey,
        password: &str,
        cost: KdfCost,
        hint: Option<KeyHint>,
    ) -> Result<Self> {
        let kdf = KdfParams::new(cost);
        let wrapping_key = derive_key(password, &kdf)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&wrapping_key[..]));

        // The KDF parameters are bound as associated data so they cannot be
        // swapped without failing authentication.
        let aad = serde_json::to_vec(&kdf)?;
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let mut data = master.to_bytes().to_vec();
        let tag = cipher
            .encrypt_in_place_detached(&nonce, &aad, &mut data)
            .map_err(|e| Error::Encryption(e.to_string()))?;

        Ok(Self {
            created: Utc::now(),
            hint,
            kdf,
            nonce: nonce.to_vec(),
            data,
            tag: tag.to_vec(),
        })
    }

    /// Recovers the master key. Wrong passwords and any modification of the
    /// authenticated fields fail with [`Error::AuthenticationFailed`].
    pub fn unlock(&self, password: &str) -> Result<MasterKey> {
        if self.nonce.len() != NONCE_LEN || self.tag.len() != TAG_LEN {
            return Err(Error::AuthenticationFailed);
        }

        let wrapping_key = derive_key(password, &self.kdf)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&wrapping_key[..]));
        let aad = serde_json::to_vec(&self.kdf)?;

        let mut plaintext = Zeroizing::new(self.data.clone());
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&self.nonce),
                &aad,
                &mut plaintext,
                Tag::from_slice(&self.tag),
            )
            .map_err(|_| Error::AuthenticationFailed)?;

        MasterKey::from_bytes(&plaintext)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Key ids are the BLAKE3 hash of the stored record.
pub fn key_id(encoded: &[u8]) -> String {
    blake3::hash(encoded).to_hex().to_string()
}

pub fn key_path(id: &str) -> String {
    format!("{KEYS_DIR}/{id}")
}

pub async fn save_key(backend: &dyn Backend, record: &KeyRecord) -> Result<String> {
    let encoded = record.to_bytes()?;
    let id = key_id(&encoded);
    backend.create(&key_path(&id), Bytes::from(encoded)).await?;
    debug!(key = %id, "stored key record");
    Ok(id)
}

pub async fn load_key(backend: &dyn Backend, id: &str) -> Result<KeyRecord> {
    let path = key_path(id);
    if !backend.exists(&path).await? {
        return Err(Error::KeyNotFound { id: id.to_string() });
    }
    KeyRecord::from_bytes(&backend.read(&path).await?)
}

pub async fn list_key_ids(backend: &dyn Backend) -> Result<Vec<String>> {
    let mut ids: Vec<String> = backend
        .list(KEYS_DIR)
        .await?
        .iter()
        .map(|path| object_name(path).to_string())
        .collect();
    ids.sort();
    Ok(ids)
}

/// Tries every key record until one unlocks with `password`.
pub async fn search_key(
    backend: &dyn Backend,
    password: &str,
    cancel: &CancellationToken,
) -> Result<(String, MasterKey)> {
    let ids = list_key_ids(backend).await?;
    if ids.is_empty() {
        return Err(Error::RepositoryBroken {
            location: backend.location(),
            reason: "no key records".to_string(),
        });
    }

    for id in ids {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let record = match load_key(backend, &id).await {
            Ok(record) => record,
            Err(Error::Serialization(e)) => {
                warn!(key = %id, error = %e, "skipping unreadable key record");
                continue;
            }
            Err(e) => return Err(e),
        };

        match record.unlock(password) {
            Ok(master) => {
                debug!(key = %id, "key record unlocked");
                return Ok((id, master));
            }
            Err(Error::AuthenticationFailed) => {
                debug!(key = %id, "password does not match key record");
            }
            Err(e) => {
                warn!(key = %id, error = %e, "skipping key record");
            }
        }
    }

    Err(Error::AuthenticationFailed)
}

pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
