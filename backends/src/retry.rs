use async_trait::async_trait;
use bytes::Bytes;
use packvault_core::backend::{Backend, BackendType, ObjectInfo};
use packvault_core::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each backoff
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_duration = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);

        let duration_ms = base_duration.min(self.max_backoff.as_millis() as f64) as u64;
        let mut duration = Duration::from_millis(duration_ms);

        if self.jitter {
            let jitter_ms = rand::thread_rng().gen_range(0..=(duration_ms / 4));
            duration += Duration::from_millis(jitter_ms);
        }

        duration
    }
}

/// Trait to determine if an error is retryable
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Io(e) => !matches!(
                e.kind(),
                ErrorKind::NotFound
                    | ErrorKind::AlreadyExists
                    | ErrorKind::PermissionDenied
                    | ErrorKind::InvalidInput
                    | ErrorKind::UnexpectedEof
            ),
            Error::BackendUnavailable(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("timeout")
                    || msg.contains("rate limit")
                    || msg.contains("throttle")
                    || msg.contains("temporarily unavailable")
                    || msg.contains("try again")
                    || msg.contains("503")
                    || msg.contains("429")
            }
            // Authentication, existence and corruption are final
            _ => false,
        }
    }
}

/// Retry a future operation with exponential backoff
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        let error = match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(error) => error,
        };

        if !error.is_retryable() {
            debug!(
                operation = operation_name,
                error = %error,
                "Error is not retryable, failing immediately"
            );
            return Err(error);
        }

        attempt += 1;
        if attempt >= config.max_attempts {
            warn!(
                operation = operation_name,
                max_attempts = config.max_attempts,
                error = %error,
                "Operation failed after all retry attempts"
            );
            return Err(error);
        }

        let backoff = config.backoff_duration(attempt - 1);
        warn!(
            operation = operation_name,
            attempt,
            max_attempts = config.max_attempts,
            backoff_ms = backoff.as_millis(),
            error = %error,
            "Operation failed, retrying after backoff"
        );
        sleep(backoff).await;
    }
}

/// Wraps a backend and retries transient failures of every operation.
pub struct RetryBackend<B> {
    inner: B,
    config: RetryConfig,
}

impl<B: Backend> RetryBackend<B> {
    pub fn new(inner: B, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

#[async_trait]
impl<B: Backend> Backend for RetryBackend<B> {
    async fn init(&self) -> Result<()> {
        retry_with_backoff(&self.config, "init", move || self.inner.init()).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        retry_with_backoff(&self.config, "exists", move || self.inner.exists(path)).await
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        retry_with_backoff(&self.config, "read", move || self.inner.read(path)).await
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes> {
        retry_with_backoff(&self.config, "read_range", move || {
            self.inner.read_range(path, offset, length)
        })
        .await
    }

    /// A retried create that already landed surfaces as `AlreadyExists`.
    async fn create(&self, path: &str, data: Bytes) -> Result<()> {
        retry_with_backoff(&self.config, "create", move || {
            self.inner.create(path, data.clone())
        })
        .await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        retry_with_backoff(&self.config, "delete", move || self.inner.delete(path)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        retry_with_backoff(&self.config, "list", move || self.inner.list(prefix)).await
    }

    async fn stat(&self, path: &str) -> Result<ObjectInfo> {
        retry_with_backoff(&self.config, "stat", move || self.inner.stat(path)).await
    }

    fn backend_type(&self) -> BackendType {
        self.inner.backend_type()
    }

    fn location(&self) -> String {
        self.inner.location()
    }
}
