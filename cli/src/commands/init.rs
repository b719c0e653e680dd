use crate::Cli;
use crate::commands::{password_source, repository_location};
use crate::output::{Printer, Reported};
use crate::password::{PasswordSource, prompt_password, read_new_password, read_password};
use anyhow::{Context, Result};
use clap::Args;
use packvault_backends::{display_location, open_location};
use packvault_core::bootstrap::{self, InitRequest, InitStatus, SecondaryRepo, check_copy_settings};
use packvault_core::config::parse_repo_version;
use packvault_core::{CompressionMode, InitOptions, Repository};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use zeroize::Zeroizing;

#[derive(Args, Debug)]
pub struct InitCommand {
    #[arg(
        long = "from-repo",
        env = "PACKVAULT_FROM_REPOSITORY",
        help = "Secondary repository to copy chunker parameters from"
    )]
    from_repo: Option<String>,

    #[arg(
        long,
        env = "PACKVAULT_FROM_PASSWORD",
        hide_env_values = true,
        help = "Password of the secondary repository"
    )]
    from_password: Option<String>,

    #[arg(
        long,
        env = "PACKVAULT_FROM_PASSWORD_FILE",
        help = "File holding the password of the secondary repository"
    )]
    from_password_file: Option<PathBuf>,

    #[arg(long, help = "Copy chunker parameters from the secondary repository")]
    copy_chunker_params: bool,

    #[arg(
        long,
        default_value = "latest",
        value_parser = parse_repo_version,
        help = "Repository format version (1, 2 or latest)"
    )]
    repository_version: u32,

    #[arg(long, help = "Compression mode for version 2 repositories (off, auto, max)")]
    compression: Option<CompressionMode>,
}

impl InitCommand {
    pub async fn run(&self, cli: &Cli, cancel: &CancellationToken) -> Result<()> {
        let printer = Printer::new(cli.json, cli.quiet);
        // A missing location still gets a status record, with an empty repository.
        let (display, result) = match repository_location(cli) {
            Ok(location) => (
                display_location(location),
                self.initialize(cli, location, cancel, prompt_password).await,
            ),
            Err(err) => (String::new(), Err(err)),
        };

        match result {
            Ok(repo) => {
                let status = InitStatus::success(&repo, &display);
                if printer.is_json() {
                    printer.json(&status)?;
                } else {
                    printer.line(format!(
                        "created packvault repository {} at {display}",
                        repo.config().short_id()
                    ));
                    printer.line("");
                    printer.line("Please note that knowledge of your password is required to access");
                    printer.line("the repository. Losing your password means that your data is");
                    printer.line("irrecoverably lost.");
                }
                Ok(())
            }
            Err(err) if printer.is_json() => {
                printer.json(&InitStatus::failure(&err, &display))?;
                Err(Reported(err).into())
            }
            Err(err) if display.is_empty() => Err(err.into()),
            Err(err) => Err(err).with_context(|| format!("create repository at {display} failed")),
        }
    }

    fn options(&self) -> InitOptions {
        let compression = self.compression.unwrap_or(if self.repository_version < 2 {
            CompressionMode::Off
        } else {
            CompressionMode::Auto
        });
        InitOptions {
            version: self.repository_version,
            compression,
            ..Default::default()
        }
    }

    /// Every check and password entry happens before the target is written.
    async fn initialize<P>(
        &self,
        cli: &Cli,
        location: &str,
        cancel: &CancellationToken,
        mut prompt: P,
    ) -> packvault_core::Result<Repository>
    where
        P: FnMut(&str) -> packvault_core::Result<Zeroizing<String>>,
    {
        check_copy_settings(self.copy_chunker_params, self.from_repo.is_some())?;
        let options = self.options();
        options.validate()?;

        let target = open_location(location)?;
        let password = read_new_password(
            password_source(cli),
            "enter password for new repository: ",
            "enter password again: ",
            &mut prompt,
        )?;

        let secondary = match &self.from_repo {
            Some(from) => {
                let backend = open_location(from)?;
                let password = read_password(
                    PasswordSource {
                        value: self.from_password.as_deref(),
                        file: self.from_password_file.as_deref(),
                    },
                    &format!("enter password for secondary repository {}: ", display_location(from)),
                    &mut prompt,
                )?;
                Some(SecondaryRepo { backend, password })
            }
            None => None,
        };

        let request = InitRequest {
            options,
            copy_chunker_params: self.copy_chunker_params,
            secondary,
        };
        let repo = bootstrap::initialize(target, &password, request, cancel).await?;
        info!(id = %repo.config().short_id(), "repository initialized");
        Ok(repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use packvault_core::Error;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("packvault").chain(args.iter().copied())).unwrap()
    }

    fn init_command(cli: &Cli) -> &InitCommand {
        match &cli.command {
            crate::Commands::Init(cmd) => cmd,
            _ => panic!("not an init command"),
        }
    }

    #[test]
    fn test_version_one_defaults_to_no_compression() {
        let cli = parse(&["init", "--repository-version", "1"]);
        let options = init_command(&cli).options();
        assert_eq!(options.version, 1);
        assert_eq!(options.compression, CompressionMode::Off);

        let cli = parse(&["init"]);
        assert_eq!(init_command(&cli).options().compression, CompressionMode::Auto);

        assert!(Cli::try_parse_from(["packvault", "init", "--repository-version", "9"]).is_err());
        assert!(Cli::try_parse_from(["packvault", "init", "--compression", "fast"]).is_err());
    }

    #[tokio::test]
    async fn test_copy_flag_without_secondary_is_rejected_early() {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("repo");
        let repo = repo.to_str().unwrap();
        let cli = parse(&["--repo", repo, "--password", "pw", "init", "--copy-chunker-params"]);

        let err = init_command(&cli)
            .initialize(&cli, repo, &CancellationToken::new(), prompt_password)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert!(!dir.path().join("repo").exists());
    }

    fn scripted(entries: &[&str]) -> impl FnMut(&str) -> packvault_core::Result<Zeroizing<String>> {
        let mut entries: Vec<String> = entries.iter().rev().map(|e| e.to_string()).collect();
        move |_| {
            entries
                .pop()
                .map(Zeroizing::new)
                .ok_or_else(|| Error::InvalidRequest("no more entries".to_string()))
        }
    }

    #[tokio::test]
    async fn test_password_mismatch_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("repo");
        let repo = repo.to_str().unwrap();
        let cli = parse(&["--repo", repo, "init"]);
        let cancel = CancellationToken::new();

        let err = init_command(&cli)
            .initialize(&cli, repo, &cancel, scripted(&["alpha", "beta"]))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::PasswordMismatch));
        assert!(!dir.path().join("repo").exists());

        init_command(&cli)
            .initialize(&cli, repo, &cancel, scripted(&["alpha", "alpha"]))
            .await
            .unwrap();
        assert!(dir.path().join("repo/config").is_file());
    }

    #[tokio::test]
    async fn test_missing_location_is_reported_in_json_mode() {
        let cli = parse(&["--json", "init"]);
        let err = init_command(&cli)
            .run(&cli, &CancellationToken::new())
            .await
            .unwrap_err();
        let reported = err.downcast_ref::<Reported>().unwrap();
        assert!(matches!(reported.0, Error::InvalidRequest(_)));

        let status = serde_json::to_value(InitStatus::failure(&reported.0, "")).unwrap();
        assert_eq!(status["status"], "error_invalid_request");
        assert_eq!(status["repository"], "");
    }

    #[tokio::test]
    async fn test_init_twice_reports_already_initialized() {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("repo");
        let repo = repo.to_str().unwrap();
        let cli = parse(&["--repo", repo, "--password", "pw", "--json", "init"]);
        let cancel = CancellationToken::new();

        init_command(&cli).run(&cli, &cancel).await.unwrap();
        assert!(dir.path().join("repo/config").is_file());

        let err = init_command(&cli).run(&cli, &cancel).await.unwrap_err();
        let reported = err.downcast_ref::<Reported>().unwrap();
        assert!(matches!(reported.0, Error::AlreadyInitialized { .. }));
        assert_ne!(crate::exit_code(&err), 0);
    }
}
