use crate::Cli;
use crate::commands::open_repository;
use crate::output::Printer;
use anyhow::Result;
use clap::Args;
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug)]
pub struct RebuildIndexCommand {}

impl RebuildIndexCommand {
    pub async fn run(&self, cli: &Cli, cancel: &CancellationToken) -> Result<()> {
        let printer = Printer::new(cli.json, cli.quiet);
        let repo = open_repository(cli, cancel).await?;

        let stats = repo.rebuild_index(cancel).await?;
        if printer.is_json() {
            printer.json(&stats)?;
        } else {
            printer.result(format!(
                "indexed {} chunks in {} packs, replaced {} index files",
                stats.chunks, stats.packs, stats.superseded
            ));
        }
        Ok(())
    }
}
