use anyhow::Result;
use serde::Serialize;
use std::fmt::Display;

/// A failure whose status record has already been printed. `main` only
/// picks the exit code for it.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Reported(pub packvault_core::Error);

/// Writes command results to stdout, either as text lines or as JSON.
#[derive(Debug, Clone, Copy)]
pub struct Printer {
    json: bool,
    quiet: bool,
}

impl Printer {
    pub fn new(json: bool, quiet: bool) -> Self {
        Self { json, quiet }
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    /// Human readable line; suppressed in JSON and quiet mode.
    pub fn line(&self, text: impl Display) {
        if !self.json && !self.quiet {
            println!("{text}");
        }
    }

    /// Result text that is printed even in quiet mode.
    pub fn result(&self, text: impl Display) {
        if !self.json {
            println!("{text}");
        }
    }

    pub fn json<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string(value)?);
        Ok(())
    }
}
