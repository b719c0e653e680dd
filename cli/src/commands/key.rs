use crate::Cli;
use crate::commands::open_repository;
use crate::output::Printer;
use crate::password::{PasswordSource, prompt_password, read_new_password};
use anyhow::Result;
use clap::{Args, Subcommand};
use packvault_core::crypto::KdfCost;
use packvault_core::key::KeyHint;
use packvault_core::repository::KeySummary;
use packvault_core::{Error, Repository};
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug)]
pub struct KeyCommand {
    #[command(subcommand)]
    action: KeyAction,
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    /// List key records
    List,

    /// Add a password for the repository
    Add {
        #[arg(long, env = "PACKVAULT_NEW_PASSWORD_FILE", help = "File holding the new password")]
        new_password_file: Option<PathBuf>,

        #[arg(long, help = "Hostname stored with the new key")]
        host: Option<String>,

        #[arg(long, help = "Username stored with the new key")]
        user: Option<String>,
    },

    /// Remove a key record by id or unique id prefix
    Remove { id: String },
}

#[derive(Debug, Serialize)]
struct KeyAdded<'a> {
    id: &'a str,
}

#[derive(Debug, Serialize)]
struct KeyRemoved<'a> {
    removed: &'a str,
}

impl KeyCommand {
    pub async fn run(&self, cli: &Cli, cancel: &CancellationToken) -> Result<()> {
        let printer = Printer::new(cli.json, cli.quiet);
        let repo = open_repository(cli, cancel).await?;

        match &self.action {
            KeyAction::List => {
                let keys = repo.list_keys().await?;
                if printer.is_json() {
                    printer.json(&keys)?;
                } else {
                    print_keys(&printer, &keys);
                }
            }
            KeyAction::Add {
                new_password_file,
                host,
                user,
            } => {
                let password = read_new_password(
                    PasswordSource {
                        value: None,
                        file: new_password_file.as_deref(),
                    },
                    "enter new password: ",
                    "enter password again: ",
                    prompt_password,
                )?;
                let current = KeyHint::current();
                let hint = KeyHint {
                    hostname: host.clone().unwrap_or(current.hostname),
                    username: user.clone().unwrap_or(current.username),
                };
                let id = repo.add_key(&password, KdfCost::default(), Some(hint)).await?;
                if printer.is_json() {
                    printer.json(&KeyAdded { id: &id })?;
                } else {
                    printer.result(format!("saved new key as {}", short(&id)));
                }
            }
            KeyAction::Remove { id } => {
                let id = resolve_key_id(&repo, id).await?;
                repo.remove_key(&id).await?;
                if printer.is_json() {
                    printer.json(&KeyRemoved { removed: &id })?;
                } else {
                    printer.result(format!("removed key {}", short(&id)));
                }
            }
        }
        Ok(())
    }
}

fn short(id: &str) -> &str {
    &id[..id.len().min(8)]
}

fn print_keys(printer: &Printer, keys: &[KeySummary]) {
    printer.result(format!(" {:<10} {:<16} {:<24} {}", "ID", "User", "Host", "Created"));
    printer.result("-".repeat(72));
    for key in keys {
        let marker = if key.current { '*' } else { ' ' };
        let (user, host) = key
            .hint
            .as_ref()
            .map(|h| (h.username.as_str(), h.hostname.as_str()))
            .unwrap_or(("", ""));
        printer.result(format!(
            "{marker}{:<10} {:<16} {:<24} {}",
            short(&key.id),
            user,
            host,
            key.created.format("%Y-%m-%d %H:%M:%S")
        ));
    }
}

/// Expands a unique id prefix to the full key id.
async fn resolve_key_id(repo: &Repository, prefix: &str) -> packvault_core::Result<String> {
    let keys = repo.list_keys().await?;
    if keys.iter().any(|k| k.id == prefix) {
        return Ok(prefix.to_string());
    }

    let mut matches = keys.into_iter().filter(|k| k.id.starts_with(prefix));
    match (matches.next(), matches.next()) {
        (Some(key), None) => Ok(key.id),
        (None, _) => Err(Error::KeyNotFound {
            id: prefix.to_string(),
        }),
        (Some(_), Some(_)) => Err(Error::InvalidRequest(format!(
            "key id prefix {prefix:?} is ambiguous"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_records() {
        let added = serde_json::to_value(KeyAdded { id: "0a1b2c" }).unwrap();
        assert_eq!(added, serde_json::json!({ "id": "0a1b2c" }));

        let removed = serde_json::to_value(KeyRemoved { removed: "0a1b2c" }).unwrap();
        assert_eq!(removed, serde_json::json!({ "removed": "0a1b2c" }));
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short("0123456789abcdef"), "01234567");
        assert_eq!(short("abc"), "abc");
    }
}
