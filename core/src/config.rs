use crate::backend::{Backend, CONFIG_FILE};
use crate::chunker::Pol;
use crate::crypto::{Encryptor, KdfCost};
use crate::key::KeyHint;
use crate::{CompressionMode, Error, Result};
use bytes::Bytes;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Oldest format: no compression support.
pub const MIN_REPO_VERSION: u32 = 1;
pub const LATEST_REPO_VERSION: u32 = 2;

/// The repository's identity, fixed at initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub version: u32,
    pub id: String,
    pub chunker_polynomial: Pol,
    pub compression: CompressionMode,
}

impl RepoConfig {
    /// Assembles a config with a fresh random 256-bit identifier.
    pub fn new(version: u32, chunker_polynomial: Pol, compression: CompressionMode) -> Self {
        let mut id = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut id);
        Self {
            version,
            id: hex::encode(id),
            chunker_polynomial,
            compression,
        }
    }

    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(10)]
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_REPO_VERSION..=LATEST_REPO_VERSION).contains(&self.version) {
            return Err(Error::InvalidFormatVersion {
                version: self.version,
            });
        }
        self.chunker_polynomial.validate()
    }

    /// Compression actually applied, given the format version.
    pub fn effective_compression(&self) -> CompressionMode {
        if self.version < 2 {
            CompressionMode::Off
        } else {
            self.compression
        }
    }

    pub async fn save(&self, backend: &dyn Backend, encryptor: &Encryptor) -> Result<()> {
        let plaintext = serde_json::to_vec(self)?;
        let ciphertext = encryptor.encrypt(&plaintext)?;
        backend.create(CONFIG_FILE, Bytes::from(ciphertext)).await
    }

    pub async fn load(backend: &dyn Backend, encryptor: &Encryptor) -> Result<Self> {
        let ciphertext = backend.read(CONFIG_FILE).await?;
        let plaintext = encryptor.decrypt(&ciphertext)?;
        let config: RepoConfig = serde_json::from_slice(&plaintext)?;
        config.validate()?;
        Ok(config)
    }
}

/// Parses `--repository-version` style input: a number or `latest`.
pub fn parse_repo_version(s: &str) -> Result<u32> {
    if s == "latest" || s.is_empty() {
        return Ok(LATEST_REPO_VERSION);
    }
    let version: u32 = s
        .parse()
        .map_err(|_| Error::InvalidRequest(format!("invalid repository version {s:?}")))?;
    if !(MIN_REPO_VERSION..=LATEST_REPO_VERSION).contains(&version) {
        return Err(Error::InvalidRequest(format!(
            "repository version {version} is not supported (expected {MIN_REPO_VERSION}..={LATEST_REPO_VERSION})"
        )));
    }
    Ok(version)
}

/// Creation-time settings for a new repository.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Chunker polynomial to use instead of a freshly generated one.
    pub polynomial: Option<Pol>,
    pub version: u32,
    pub compression: CompressionMode,
    pub kdf: KdfCost,
    pub hint: Option<KeyHint>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            polynomial: None,
            version: LATEST_REPO_VERSION,
            compression: CompressionMode::default(),
            kdf: KdfCost::default(),
            hint: Some(KeyHint::current()),
        }
    }
}

impl InitOptions {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_REPO_VERSION..=LATEST_REPO_VERSION).contains(&self.version) {
            return Err(Error::InvalidRequest(format!(
                "repository version {} is not supported",
                self.version
            )));
        }
        if self.version < 2 && self.compression != CompressionMode::Off {
            return Err(Error::InvalidRequest(
                "compression requires repository version 2".to_string(),
            ));
        }
        if let Some(pol) = self.polynomial {
            pol.validate()?;
        }
        Ok(())
    }
}
