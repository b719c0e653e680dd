pub mod local;
pub mod location;
pub mod retry;

pub use local::LocalBackend;
pub use location::{display_location, open_location, open_location_with};
pub use retry::{RetryBackend, RetryConfig, Retryable, retry_with_backoff};
