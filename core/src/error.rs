use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Authentication failed: wrong password or tampered data")]
    AuthenticationFailed,

    #[error("Repository not found at {location}")]
    RepositoryNotFound { location: String },

    #[error("Repository at {location} is already initialized")]
    AlreadyInitialized { location: String },

    #[error("Repository at {location} is broken: {reason}")]
    RepositoryBroken { location: String, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Passwords do not match")]
    PasswordMismatch,

    #[error("Invalid repository format version: {version}")]
    InvalidFormatVersion { version: u32 },

    #[error("Invalid chunker polynomial: {0}")]
    InvalidPolynomial(String),

    #[error("Unable to find an irreducible polynomial after {attempts} attempts")]
    PolynomialGenerationExhausted { attempts: usize },

    #[error("Pack file corrupted: {id}: {reason}")]
    CorruptedPack { id: String, reason: String },

    #[error("Chunk not found: {id}")]
    ChunkNotFound { id: String },

    #[error("Key not found: {id}")]
    KeyNotFound { id: String },

    #[error("Object already exists: {path}")]
    AlreadyExists { path: String },

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Machine-readable tag used in structured status records.
    pub fn status_tag(&self) -> &'static str {
        match self {
            Error::AlreadyInitialized { .. } => "error_already_initialized",
            Error::InvalidRequest(_) => "error_invalid_request",
            Error::PasswordMismatch => "error_password_mismatch",
            Error::AuthenticationFailed => "error_authentication",
            Error::BackendUnavailable(_) | Error::Io(_) | Error::AlreadyExists { .. } => {
                "error_backend"
            }
            Error::PolynomialGenerationExhausted { .. } | Error::InvalidPolynomial(_) => {
                "error_polynomial"
            }
            Error::Cancelled => "error_cancelled",
            _ => "error_repository",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Error::AuthenticationFailed => 12,
            Error::Cancelled => 130,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_tags_are_distinct_for_bootstrap_errors() {
        let errors = [
            Error::AlreadyInitialized { location: "r".into() },
            Error::InvalidRequest("x".into()),
            Error::PasswordMismatch,
            Error::AuthenticationFailed,
            Error::BackendUnavailable("down".into()),
            Error::PolynomialGenerationExhausted { attempts: 1 },
        ];
        let mut tags: Vec<_> = errors.iter().map(|e| e.status_tag()).collect();
        tags.sort();
        tags.dedup();
        assert_eq!(tags.len(), errors.len());
    }

    #[test]
    fn test_exit_code_never_zero() {
        assert_eq!(Error::AuthenticationFailed.exit_code(), 12);
        assert_eq!(Error::Cancelled.exit_code(), 130);
        assert_eq!(Error::Other("x".into()).exit_code(), 1);
    }
}
