use crate::Cli;
use crate::commands::open_repository;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use packvault_core::PackID;
use packvault_core::pack::read_header;
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug)]
pub struct CatCommand {
    #[command(subcommand)]
    object: CatObject,
}

#[derive(Subcommand, Debug)]
enum CatObject {
    /// Print the decrypted repository config
    Config,

    /// Print the decrypted header of a pack
    Pack { id: String },
}

impl CatCommand {
    pub async fn run(&self, cli: &Cli, cancel: &CancellationToken) -> Result<()> {
        let repo = open_repository(cli, cancel).await?;

        let text = match &self.object {
            CatObject::Config => serde_json::to_string_pretty(repo.config())?,
            CatObject::Pack { id } => {
                let pack_id: PackID = id.parse().with_context(|| format!("invalid pack id {id:?}"))?;
                let header = read_header(repo.backend().as_ref(), &pack_id, repo.encryptor()).await?;
                serde_json::to_string_pretty(&header)?
            }
        };
        println!("{text}");
        Ok(())
    }
}
