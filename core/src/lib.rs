pub mod backend;
pub mod bootstrap;
pub mod chunker;
pub mod config;
pub mod crypto;
pub mod error;
pub mod index;
pub mod key;
pub mod pack;
pub mod repository;
pub mod types;

pub use backend::{Backend, BackendType, MemoryBackend, ObjectInfo};
pub use bootstrap::{InitRequest, InitStatus, SecondaryRepo};
pub use config::{InitOptions, RepoConfig};
pub use error::{Error, Result};
pub use repository::Repository;
pub use types::*;
