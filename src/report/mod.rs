mod colors;
mod json;
mod terminal;

pub use json::JsonReporter;
pub use terminal::TerminalReporter;

use crate::analysis::{AnalysisResult, ExclusionTable};
use miette::Result;
use serde::Serialize;
use std::path::PathBuf;

/// Output format for reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReportFormat {
    /// Colored trace for humans
    #[default]
    Terminal,
    /// JSON machine-readable format
    Json,
}

/// What an analysis run concluded
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome<'a> {
    Leak(&'a AnalysisResult),
    /// The watched instance was reclaimed before the dump
    FalseAlarm { key: &'a str },
}

/// Options for report generation
#[derive(Debug, Clone, Default)]
pub struct ReportOptions {
    /// Output file path (JSON only)
    pub output_path: Option<PathBuf>,
    /// Dump holder fields under each trace element
    pub show_fields: bool,
}

/// Reporter for analysis outcomes
pub struct Reporter {
    format: ReportFormat,
    options: ReportOptions,
}

impl Reporter {
    pub fn new(format: ReportFormat, output_path: Option<PathBuf>) -> Self {
        Self {
            format,
            options: ReportOptions {
                output_path,
                ..Default::default()
            },
        }
    }

    pub fn with_options(format: ReportFormat, options: ReportOptions) -> Self {
        Self { format, options }
    }

    pub fn report(&self, outcome: &Outcome<'_>) -> Result<()> {
        match self.format {
            ReportFormat::Terminal => {
                let reporter = TerminalReporter::new().with_fields(self.options.show_fields);
                match outcome {
                    Outcome::Leak(result) => reporter.report(result),
                    Outcome::FalseAlarm { key } => reporter.report_false_alarm(key),
                }
                Ok(())
            }
            ReportFormat::Json => JsonReporter::new(self.options.output_path.clone()).report(outcome),
        }
    }

    /// Print the effective exclusion table
    pub fn report_rules(&self, table: &ExclusionTable) -> Result<()> {
        match self.format {
            ReportFormat::Terminal => {
                TerminalReporter::new().report_rules(table);
                Ok(())
            }
            ReportFormat::Json => JsonReporter::new(self.options.output_path.clone()).report_rules(table),
        }
    }
}

/// Byte count with a binary unit
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
