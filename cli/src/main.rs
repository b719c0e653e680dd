mod commands;
mod output;
mod password;

use clap::{Parser, Subcommand};
use commands::{
    cat::CatCommand, init::InitCommand, key::KeyCommand, rebuild_index::RebuildIndexCommand,
};
use output::Reported;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(
    name = "packvault",
    version,
    about = "Encrypted, deduplicating repository storage",
    long_about = "Packvault stores content-defined chunks encrypted in self-describing packs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub(crate) command: Commands,

    #[arg(
        short = 'r',
        long,
        global = true,
        env = "PACKVAULT_REPOSITORY",
        help = "Repository location (local:<path> or a path)"
    )]
    pub(crate) repo: Option<String>,

    #[arg(
        long,
        global = true,
        env = "PACKVAULT_PASSWORD",
        hide_env_values = true,
        help = "Repository password"
    )]
    pub(crate) password: Option<String>,

    #[arg(
        long,
        global = true,
        env = "PACKVAULT_PASSWORD_FILE",
        help = "File holding the repository password"
    )]
    pub(crate) password_file: Option<PathBuf>,

    #[arg(long, global = true, help = "Print results as JSON")]
    pub(crate) json: bool,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub(crate) verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode")]
    pub(crate) quiet: bool,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    #[command(about = "Initialize a new repository")]
    Init(InitCommand),

    #[command(about = "Manage repository keys")]
    Key(KeyCommand),

    #[command(about = "Print internal repository objects")]
    Cat(CatCommand),

    #[command(about = "Rebuild the index from pack headers")]
    RebuildIndex(RebuildIndexCommand),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    let result = match &cli.command {
        Commands::Init(cmd) => cmd.run(&cli, &cancel).await,
        Commands::Key(cmd) => cmd.run(&cli, &cancel).await,
        Commands::Cat(cmd) => cmd.run(&cli, &cancel).await,
        Commands::RebuildIndex(cmd) => cmd.run(&cli, &cancel).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if err.downcast_ref::<Reported>().is_none() {
                eprintln!("Fatal: {err:#}");
            }
            let code = exit_code(&err);
            debug!(code, "exiting with error");
            ExitCode::from(code)
        }
    }
}

/// Exit status for a failed command. Never zero.
pub(crate) fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(Reported(inner)) = err.downcast_ref::<Reported>() {
        return inner.exit_code();
    }
    err.chain()
        .find_map(|cause| cause.downcast_ref::<packvault_core::Error>())
        .map(packvault_core::Error::exit_code)
        .unwrap_or(1)
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "packvault={level},packvault_core={level},packvault_backends={level}"
        ))
    });

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install log subscriber: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use packvault_core::Error;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_exit_codes() {
        let err = anyhow::Error::new(Error::AuthenticationFailed).context("open failed");
        assert_eq!(exit_code(&err), 12);

        let err: anyhow::Error = Reported(Error::Cancelled).into();
        assert_eq!(exit_code(&err), 130);

        assert_eq!(exit_code(&anyhow::anyhow!("plain failure")), 1);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["packvault", "key", "list", "--repo", "/srv/r", "--json"]).unwrap();
        assert_eq!(cli.repo.as_deref(), Some("/srv/r"));
        assert!(cli.json);
    }
}
