use crate::{Error, Result};
use argon2::Argon2;
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Bytes added by [`Encryptor::encrypt`] on top of the plaintext.
pub const CIPHERTEXT_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Argon2id cost factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfCost {
    pub memory: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfCost {
    fn default() -> Self {
        Self {
            memory: 65536,
            iterations: 3,
            parallelism: 4,
        }
    }
}

impl KdfCost {
    #[cfg(test)]
    pub(crate) fn testing() -> Self {
        Self {
            memory: 8,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// Parameters stored in a key record so the derived key can be reproduced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub iterations: u32,
    pub memory: u32,
    pub parallelism: u32,
    #[serde(with = "crate::key::base64_bytes")]
    pub salt: Vec<u8>,
}

impl KdfParams {
    pub fn new(cost: KdfCost) -> Self {
        let mut salt = vec![0u8; 32];
        OsRng.fill_bytes(&mut salt);

        Self {
            algorithm: "argon2id".to_string(),
            iterations: cost.iterations,
            memory: cost.memory,
            parallelism: cost.parallelism,
            salt,
        }
    }

    pub fn cost(&self) -> KdfCost {
        KdfCost {
            memory: self.memory,
            iterations: self.iterations,
            parallelism: self.parallelism,
        }
    }
}

/// Derives a 32 byte wrapping key from a password. Deterministic for a given
/// password and parameter set.
pub fn derive_key(password: &str, params: &KdfParams) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    if params.algorithm != "argon2id" {
        return Err(Error::Encryption(format!(
            "unsupported KDF algorithm {}",
            params.algorithm
        )));
    }

    let argon2 = Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2::Params::new(
            params.memory,
            params.iterations,
            params.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| Error::Encryption(e.to_string()))?,
    );

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password.as_bytes(), &params.salt, &mut key[..])
        .map_err(|e| Error::Encryption(e.to_string()))?;
    Ok(key)
}

/// Repository master key material: an encryption key for every object and a
/// signing key used to name packs.
pub struct MasterKey {
    encryption: Zeroizing<[u8; KEY_LEN]>,
    signing: Zeroizing<[u8; KEY_LEN]>,
}

impl MasterKey {
    pub fn generate() -> Self {
        let mut encryption = Zeroizing::new([0u8; KEY_LEN]);
        let mut signing = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut encryption[..]);
        OsRng.fill_bytes(&mut signing[..]);
        Self {
            encryption,
            signing,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 2 * KEY_LEN {
            return Err(Error::AuthenticationFailed);
        }
        let mut encryption = Zeroizing::new([0u8; KEY_LEN]);
        let mut signing = Zeroizing::new([0u8; KEY_LEN]);
        encryption.copy_from_slice(&bytes[..KEY_LEN]);
        signing.copy_from_slice(&bytes[KEY_LEN..]);
        Ok(Self {
            encryption,
            signing,
        })
    }

    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(2 * KEY_LEN));
        out.extend_from_slice(&self.encryption[..]);
        out.extend_from_slice(&self.signing[..]);
        out
    }

    pub fn encryptor(&self) -> Encryptor {
        Encryptor::from_key(&self.encryption)
    }

    /// Keyed BLAKE3 MAC under the signing key.
    pub fn sign(&self, data: &[u8]) -> [u8; 32] {
        *blake3::keyed_hash(&self.signing, data).as_bytes()
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey").finish_non_exhaustive()
    }
}

/// Authenticated encryption with a fresh random nonce per call.
///
/// Output layout: `nonce (12) || ciphertext || tag (16)`.
#[derive(Clone)]
pub struct Encryptor {
    cipher: ChaCha20Poly1305,
}

impl Encryptor {
    fn from_key(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.encrypt_with_aad(plaintext, &[])
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.decrypt_with_aad(ciphertext, &[])
    }

    pub fn encrypt_with_aad(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    pub fn decrypt_with_aad(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < CIPHERTEXT_OVERHEAD {
            return Err(Error::AuthenticationFailed);
        }

        let (nonce_bytes, encrypted) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: encrypted,
                    aad,
                },
            )
            .map_err(|_| Error::AuthenticationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_key_debug_hides_material() {
        let key = MasterKey::from_bytes(&[0xab; 2 * KEY_LEN]).unwrap();
        let shown = format!("{key:?}");
        assert!(shown.starts_with("MasterKey"));
        assert!(!shown.contains("171"));
        assert!(!shown.to_lowercase().contains("ab"));
    }

    #[test]
    fn test_encryption_roundtrip() {
        let key = MasterKey::generate();
        let encryptor = key.encryptor();

        let plaintext = b"Hello, packvault!";
        let ciphertext = encryptor.encrypt(plaintext).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + CIPHERTEXT_OVERHEAD);
        let decrypted = encryptor.decrypt(&ciphertext).unwrap();

        assert_eq!(plaintext.to_vec(), decrypted);
    }

    #[test]
    fn test_every_single_byte_flip_is_rejected() {
        let encryptor = MasterKey::generate().encryptor();
        let ciphertext = encryptor.encrypt(b"authenticated payload").unwrap();

        for i in 0..ciphertext.len() {
            let mut tampered = ciphertext.clone();
            tampered[i] ^= 0x01;
            assert!(
                matches!(encryptor.decrypt(&tampered), Err(Error::AuthenticationFailed)),
                "flip at byte {i} was accepted"
            );
        }
    }

    #[test]
    fn test_nonces_are_fresh() {
        let encryptor = MasterKey::generate().encryptor();
        let a = encryptor.encrypt(b"same").unwrap();
        let b = encryptor.encrypt(b"same").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_and_truncation_fail_closed() {
        let a = MasterKey::generate().encryptor();
        let b = MasterKey::generate().encryptor();
        let ciphertext = a.encrypt(b"secret").unwrap();

        assert!(matches!(b.decrypt(&ciphertext), Err(Error::AuthenticationFailed)));
        assert!(matches!(a.decrypt(&ciphertext[..20]), Err(Error::AuthenticationFailed)));
    }

    #[test]
    fn test_aad_is_bound() {
        let encryptor = MasterKey::generate().encryptor();
        let ciphertext = encryptor.encrypt_with_aad(b"payload", b"context-a").unwrap();
        assert!(encryptor.decrypt_with_aad(&ciphertext, b"context-b").is_err());
        assert_eq!(
            encryptor.decrypt_with_aad(&ciphertext, b"context-a").unwrap(),
            b"payload"
        );
    }

    #[test]
    fn test_derive_key_depends_on_salt() {
        let params = KdfParams::new(KdfCost::testing());
        let a = derive_key("password", &params).unwrap();
        let b = derive_key("password", &params).unwrap();
        assert_eq!(*a, *b);

        let other = KdfParams::new(KdfCost::testing());
        let c = derive_key("password", &other).unwrap();
        assert_ne!(*a, *c);
    }

    #[test]
    fn test_master_key_bytes() {
        let key = MasterKey::generate();
        let restored = MasterKey::from_bytes(&key.to_bytes()).unwrap();
        assert_eq!(key.sign(b"pack"), restored.sign(b"pack"));
        assert!(MasterKey::from_bytes(&[0u8; 10]).is_err());
    }
}
