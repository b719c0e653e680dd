use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Content identity of a chunk: the BLAKE3 hash of its plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkID(blake3::Hash);

impl ChunkID {
    pub fn from_data(data: &[u8]) -> Self {
        Self(blake3::hash(data))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    pub fn short_string(&self) -> String {
        self.to_hex().chars().take(8).collect()
    }
}

impl From<blake3::Hash> for ChunkID {
    fn from(hash: blake3::Hash) -> Self {
        Self(hash)
    }
}

impl FromStr for ChunkID {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(blake3::Hash::from(decode_id(s)?)))
    }
}

impl Serialize for ChunkID {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChunkID {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ChunkID::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for ChunkID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Name of a pack object in the `data/` namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackID([u8; 32]);

impl PackID {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Backend path of the pack object.
    pub fn path(&self) -> String {
        format!("{}/{}", crate::backend::DATA_DIR, self.to_hex())
    }
}

impl FromStr for PackID {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(decode_id(s)?))
    }
}

impl Serialize for PackID {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PackID {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        PackID::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for PackID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

fn decode_id(s: &str) -> Result<[u8; 32], hex::FromHexError> {
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        return Err(hex::FromHexError::InvalidStringLength);
    }
    let mut array = [0u8; 32];
    array.copy_from_slice(&bytes);
    Ok(array)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobKind {
    Data,
    Tree,
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobKind::Data => write!(f, "data"),
            BlobKind::Tree => write!(f, "tree"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    Off,
    #[default]
    Auto,
    Max,
}

impl FromStr for CompressionMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "off" => Ok(Self::Off),
            "auto" => Ok(Self::Auto),
            "max" => Ok(Self::Max),
            other => Err(crate::Error::InvalidRequest(format!(
                "unknown compression mode {other:?} (expected off, auto or max)"
            ))),
        }
    }
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionMode::Off => write!(f, "off"),
            CompressionMode::Auto => write!(f, "auto"),
            CompressionMode::Max => write!(f, "max"),
        }
    }
}

/// Where a chunk lives: its pack and the byte range of its encrypted segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLocation {
    pub pack_id: PackID,
    pub kind: BlobKind,
    pub offset: u64,
    pub length: u32,
    pub raw_length: u32,
    #[serde(default)]
    pub compressed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_bytes_identical_identity() {
        let a = ChunkID::from_data(b"the same bytes");
        let b = ChunkID::from_data(b"the same bytes");
        let c = ChunkID::from_data(b"other bytes");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_chunk_id_hex_parse() {
        let id = ChunkID::from_data(b"abc");
        let parsed: ChunkID = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("abcd".parse::<ChunkID>().is_err());
    }

    #[test]
    fn test_pack_path() {
        let id = PackID::from_bytes([0xab; 32]);
        assert_eq!(id.path(), format!("data/{}", "ab".repeat(32)));
    }

    #[test]
    fn test_compression_mode_parse() {
        assert_eq!("max".parse::<CompressionMode>().unwrap(), CompressionMode::Max);
        assert!("fast".parse::<CompressionMode>().is_err());
    }
}
