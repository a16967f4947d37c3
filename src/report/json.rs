//! JSON reporter for machine consumption

use super::Outcome;
use crate::analysis::ExclusionTable;
use miette::{IntoDiagnostic, Result};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

pub struct JsonReporter {
    output_path: Option<PathBuf>,
}

impl JsonReporter {
    pub fn new(output_path: Option<PathBuf>) -> Self {
        Self { output_path }
    }

    pub fn report(&self, outcome: &Outcome<'_>) -> Result<()> {
        self.write(outcome)
    }

    pub fn report_rules(&self, table: &ExclusionTable) -> Result<()> {
        self.write(&table.rules())
    }

    fn write<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value).into_diagnostic()?;
        match &self.output_path {
            Some(path) => {
                std::fs::write(path, json).into_diagnostic()?;
                info!("Report written to {}", path.display());
            }
            None => println!("{}", json),
        }
        Ok(())
    }
}
