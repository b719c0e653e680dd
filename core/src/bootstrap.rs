//! One-shot repository initialization, optionally borrowing the chunker
//! polynomial of an existing repository so both chunk identically.

use crate::backend::{Backend, CONFIG_FILE};
use crate::config::InitOptions;
use crate::repository::Repository;
use crate::{Error, Result};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use zeroize::Zeroizing;

/// An already initialized repository to copy chunker parameters from.
pub struct SecondaryRepo {
    pub backend: Arc<dyn Backend>,
    pub password: Zeroizing<String>,
}

#[derive(Default)]
pub struct InitRequest {
    pub options: InitOptions,
    pub copy_chunker_params: bool,
    pub secondary: Option<SecondaryRepo>,
}

/// The copy flag and the secondary location must be given together.
pub fn check_copy_settings(copy_chunker_params: bool, has_secondary: bool) -> Result<()> {
    match (copy_chunker_params, has_secondary) {
        (true, false) => Err(Error::InvalidRequest(
            "copying chunker parameters requires a secondary repository".to_string(),
        )),
        (false, true) => Err(Error::InvalidRequest(
            "a secondary repository must only be specified when copying chunker parameters"
                .to_string(),
        )),
        _ => Ok(()),
    }
}

impl InitRequest {
    /// Rejects inconsistent settings before anything touches a backend.
    pub fn validate(&self) -> Result<()> {
        check_copy_settings(self.copy_chunker_params, self.secondary.is_some())?;
        if self.copy_chunker_params && self.options.polynomial.is_some() {
            return Err(Error::InvalidRequest(
                "an explicit polynomial cannot be combined with copying chunker parameters"
                    .to_string(),
            ));
        }
        self.options.validate()
    }
}

/// Both password entries must match and be non-empty.
pub fn confirm_password(first: &str, second: &str) -> Result<()> {
    if first != second {
        return Err(Error::PasswordMismatch);
    }
    if first.is_empty() {
        return Err(Error::InvalidRequest("empty passwords are not allowed".to_string()));
    }
    Ok(())
}

/// Initializes `target`.
///
/// Order of checks: request consistency, then the target must be free, then
/// the secondary is opened read-only and its polynomial copied, then the
/// repository is created. Nothing is written to the target before the last
/// step.
pub async fn initialize(
    target: Arc<dyn Backend>,
    password: &str,
    request: InitRequest,
    cancel: &CancellationToken,
) -> Result<Repository> {
    request.validate()?;
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    if target.exists(CONFIG_FILE).await? {
        return Err(Error::AlreadyInitialized {
            location: target.location(),
        });
    }

    let mut options = request.options;
    if let Some(secondary) = request.secondary {
        let other = Repository::open(secondary.backend, &secondary.password, cancel).await?;
        let polynomial = other.config().chunker_polynomial;
        info!(
            secondary = %other.location(),
            polynomial = %polynomial,
            "copying chunker parameters"
        );
        options.polynomial = Some(polynomial);
    }

    Repository::init(target, password, options, cancel).await
}

/// Outcome of an `init` run as reported to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitStatus {
    Success {
        id: String,
        repository: String,
    },
    Error {
        status: &'static str,
        repository: String,
        message: String,
    },
}

impl InitStatus {
    pub fn success(repo: &Repository, repository: impl Into<String>) -> Self {
        Self::Success {
            id: repo.config().short_id().to_string(),
            repository: repository.into(),
        }
    }

    pub fn failure(err: &Error, repository: impl Into<String>) -> Self {
        Self::Error {
            status: err.status_tag(),
            repository: repository.into(),
            message: err.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

impl Serialize for InitStatus {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(3))?;
        match self {
            Self::Success { id, repository } => {
                map.serialize_entry("status", "success")?;
                map.serialize_entry("id", id)?;
                map.serialize_entry("repository", repository)?;
            }
            Self::Error {
                status,
                repository,
                message,
            } => {
                map.serialize_entry("status", status)?;
                map.serialize_entry("repository", repository)?;
                map.serialize_entry("message", message)?;
            }
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::chunker::Pol;
    use crate::crypto::KdfCost;

    fn options() -> InitOptions {
        InitOptions {
            kdf: KdfCost::testing(),
            ..Default::default()
        }
    }

    fn request() -> InitRequest {
        InitRequest {
            options: options(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_second_initialize_fails_and_leaves_config_untouched() {
        let backend = Arc::new(MemoryBackend::new("r1"));
        let cancel = CancellationToken::new();

        initialize(backend.clone(), "pw1", request(), &cancel).await.unwrap();
        let before = backend.read(CONFIG_FILE).await.unwrap();
        let objects = backend.object_count();

        let err = initialize(backend.clone(), "pw1", request(), &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::AlreadyInitialized { .. }));
        assert_eq!(backend.read(CONFIG_FILE).await.unwrap(), before);
        assert_eq!(backend.object_count(), objects);
    }

    #[tokio::test]
    async fn test_copy_chunker_params() {
        let cancel = CancellationToken::new();
        let r1 = Arc::new(MemoryBackend::new("r1"));
        let first = initialize(r1.clone(), "pw1", request(), &cancel).await.unwrap();

        let r2 = Arc::new(MemoryBackend::new("r2"));
        let second = initialize(
            r2,
            "pw2",
            InitRequest {
                options: options(),
                copy_chunker_params: true,
                secondary: Some(SecondaryRepo {
                    backend: r1,
                    password: Zeroizing::new("pw1".to_string()),
                }),
            },
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(
            second.config().chunker_polynomial,
            first.config().chunker_polynomial
        );
        assert_ne!(second.config().id, first.config().id);
    }

    #[tokio::test]
    async fn test_inconsistent_copy_request_touches_nothing() {
        let cancel = CancellationToken::new();
        let target = Arc::new(MemoryBackend::new("target"));

        let err = initialize(
            target.clone(),
            "pw",
            InitRequest {
                options: options(),
                copy_chunker_params: true,
                secondary: None,
            },
            &cancel,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let secondary = Arc::new(MemoryBackend::new("secondary"));
        let err = initialize(
            target.clone(),
            "pw",
            InitRequest {
                options: options(),
                copy_chunker_params: false,
                secondary: Some(SecondaryRepo {
                    backend: secondary,
                    password: Zeroizing::new("pw".to_string()),
                }),
            },
            &cancel,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(target.object_count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_secondary_password_writes_nothing() {
        let cancel = CancellationToken::new();
        let r1 = Arc::new(MemoryBackend::new("r1"));
        initialize(r1.clone(), "pw1", request(), &cancel).await.unwrap();

        let target = Arc::new(MemoryBackend::new("r2"));
        let err = initialize(
            target.clone(),
            "pw2",
            InitRequest {
                options: options(),
                copy_chunker_params: true,
                secondary: Some(SecondaryRepo {
                    backend: r1,
                    password: Zeroizing::new("wrong".to_string()),
                }),
            },
            &cancel,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, Error::AuthenticationFailed));
        assert_eq!(target.object_count(), 0);
    }

    #[test]
    fn test_confirm_password() {
        assert!(matches!(
            confirm_password("alpha", "beta"),
            Err(Error::PasswordMismatch)
        ));
        assert!(matches!(confirm_password("", ""), Err(Error::InvalidRequest(_))));
        confirm_password("alpha", "alpha").unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_bootstrap_leaves_target_empty() {
        let target = Arc::new(MemoryBackend::new("target"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = initialize(target.clone(), "pw", request(), &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(target.object_count(), 0);
    }

    #[tokio::test]
    async fn test_explicit_polynomial_is_used() {
        let pol = Pol::new(0x3DA3358B4DC173);
        let repo = initialize(
            Arc::new(MemoryBackend::new("fixed")),
            "pw",
            InitRequest {
                options: InitOptions {
                    polynomial: Some(pol),
                    ..options()
                },
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(repo.config().chunker_polynomial, pol);
    }

    #[tokio::test]
    async fn test_status_records() {
        let repo = initialize(
            Arc::new(MemoryBackend::new("status")),
            "pw",
            request(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let success = InitStatus::success(&repo, "local:/srv/repo");
        assert!(success.is_success());
        let value = serde_json::to_value(&success).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["id"].as_str().unwrap().len(), 10);
        assert_eq!(value["repository"], "local:/srv/repo");
        assert!(value.get("message").is_none());

        let err = Error::AlreadyInitialized {
            location: "local:/srv/repo".to_string(),
        };
        let failure = InitStatus::failure(&err, "local:/srv/repo");
        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["status"], "error_already_initialized");
        assert!(value["message"].as_str().unwrap().contains("already initialized"));
        assert!(value.get("id").is_none());
    }
}
