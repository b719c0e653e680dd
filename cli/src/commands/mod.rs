pub mod cat;
pub mod init;
pub mod key;
pub mod rebuild_index;

use crate::Cli;
use crate::password::{PasswordSource, prompt_password, read_password};
use packvault_backends::{display_location, open_location};
use packvault_core::{Error, Repository};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The repository location from `--repo` / `PACKVAULT_REPOSITORY`.
pub fn repository_location(cli: &Cli) -> packvault_core::Result<&str> {
    cli.repo.as_deref().ok_or_else(|| {
        Error::InvalidRequest(
            "repository location required (--repo or PACKVAULT_REPOSITORY)".to_string(),
        )
    })
}

pub fn password_source(cli: &Cli) -> PasswordSource<'_> {
    PasswordSource {
        value: cli.password.as_deref(),
        file: cli.password_file.as_deref(),
    }
}

/// Opens the repository named on the command line.
pub async fn open_repository(cli: &Cli, cancel: &CancellationToken) -> anyhow::Result<Repository> {
    let location = repository_location(cli)?;
    let backend = open_location(location)?;
    let password = read_password(
        password_source(cli),
        &format!("enter password for repository {}: ", display_location(location)),
        prompt_password,
    )?;

    let repo = Repository::open(backend, &password, cancel).await?;
    debug!(id = %repo.config().short_id(), "repository opened");
    Ok(repo)
}
