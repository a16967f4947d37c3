//! Centralized color scheme for consistent output formatting
//!
//! Based on Rust compiler diagnostics design (RFC 1644)

use crate::analysis::Reachability;
use colored::{ColoredString, Colorize};

/// Reachability markers shown in front of every trace element
pub struct ReachabilityIndicator;

impl ReachabilityIndicator {
    /// Expected to be alive
    pub fn reachable() -> ColoredString {
        "✓".green().bold()
    }

    pub fn unknown() -> ColoredString {
        "?".yellow()
    }

    /// Should have been reclaimed; the leak starts here
    pub fn unreachable() -> ColoredString {
        "✖".red().bold()
    }

    pub fn for_verdict(reachability: Reachability) -> ColoredString {
        match reachability {
            Reachability::Reachable => Self::reachable(),
            Reachability::Unknown => Self::unknown(),
            Reachability::Unreachable => Self::unreachable(),
        }
    }
}

/// Structural element colors
pub struct StructureColors;

impl StructureColors {
    /// Section headers
    pub fn header(text: &str) -> ColoredString {
        text.cyan().bold()
    }

    /// Holder class name
    pub fn class_name(text: &str) -> ColoredString {
        text.white().bold()
    }

    /// Reference name (field, array index, local)
    pub fn reference(text: &str) -> ColoredString {
        text.magenta()
    }

    /// Exclusion annotations
    pub fn exclusion(text: &str) -> ColoredString {
        text.dimmed().italic()
    }

    /// Field dump lines
    pub fn detail(text: &str) -> ColoredString {
        text.dimmed()
    }

    /// Count/statistics numbers
    pub fn count(text: &str) -> ColoredString {
        text.white().bold()
    }
}

/// Bar chart characters for the retained size breakdown
pub struct ChartChars;

impl ChartChars {
    pub const FILLED: char = '█';
    pub const EMPTY: char = '░';

    /// Create a progress bar string
    pub fn bar(percentage: f64, width: usize) -> String {
        let filled = ((percentage / 100.0) * width as f64).round() as usize;
        let filled = filled.min(width);
        let empty = width - filled;
        format!(
            "{}{}",
            Self::FILLED.to_string().repeat(filled),
            Self::EMPTY.to_string().repeat(empty)
        )
    }
}

/// Box drawing characters for section separators
pub struct BoxChars;

impl BoxChars {
    /// Heavy separator line
    pub fn heavy_line(width: usize) -> String {
        "━".repeat(width)
    }

    /// Light separator line
    pub fn light_line(width: usize) -> String {
        "─".repeat(width)
    }
}
