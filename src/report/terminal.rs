//! Terminal reporter with colored output
//!
//! Based on Rust compiler diagnostic design (RFC 1644)

use super::format_size;
use crate::analysis::{AnalysisResult, ExclusionTable, LeakTraceElement, Reachability};
use crate::report::colors::{BoxChars, ChartChars, ReachabilityIndicator, StructureColors};
use colored::Colorize;

const WIDTH: usize = 60;

/// Terminal reporter with colored output
pub struct TerminalReporter {
    /// Print every holder's field values under its trace line
    show_fields: bool,
}

impl TerminalReporter {
    pub fn new() -> Self {
        Self { show_fields: false }
    }

    pub fn with_fields(mut self, show: bool) -> Self {
        self.show_fields = show;
        self
    }

    pub fn report(&self, result: &AnalysisResult) {
        println!();
        if result.excluded_leak {
            println!(
                "{} {} {}",
                "Known platform leak:".yellow().bold(),
                StructureColors::class_name(&result.class_name),
                "(only retained through excluded references)".dimmed()
            );
        } else {
            println!(
                "{} {}",
                "Leak found:".red().bold(),
                StructureColors::class_name(&result.class_name)
            );
        }
        println!("{}", BoxChars::heavy_line(WIDTH).dimmed());

        self.print_legend();

        let last = result.trace.len().saturating_sub(1);
        for (i, (element, verdict)) in result
            .trace
            .elements
            .iter()
            .zip(&result.trace.expected_reachability)
            .enumerate()
        {
            self.print_element(i, i == last, element, *verdict);
        }

        println!("{}", BoxChars::light_line(WIDTH).dimmed());
        self.print_sizes(result);
        println!(
            "{} {} ms",
            "Analysis time:".dimmed(),
            StructureColors::count(&result.analysis_duration_ms.to_string())
        );
        println!();
    }

    pub fn report_false_alarm(&self, key: &str) {
        println!(
            "{} reference {} was cleared before the heap dump",
            "No leak:".green().bold(),
            key
        );
    }

    pub fn report_rules(&self, table: &ExclusionTable) {
        println!();
        println!(
            "{} {}",
            StructureColors::header("Exclusion rules:"),
            StructureColors::count(&table.len().to_string())
        );
        println!("{}", BoxChars::light_line(WIDTH).dimmed());
        for rule in table.rules() {
            println!(
                "  {:>3} {}",
                rule.priority.to_string().dimmed(),
                StructureColors::reference(&rule.matcher.to_string())
            );
            println!("      {}", StructureColors::detail(&rule.reason));
        }
        println!();
    }

    fn print_legend(&self) {
        println!(
            "  {} {}  {} {}  {} {}",
            ReachabilityIndicator::reachable(),
            "reachable".dimmed(),
            ReachabilityIndicator::unknown(),
            "unknown".dimmed(),
            ReachabilityIndicator::unreachable(),
            "leaking".dimmed()
        );
        println!();
    }

    fn print_element(&self, index: usize, is_last: bool, element: &LeakTraceElement, verdict: Reachability) {
        let prefix = match (index, is_last) {
            (0, _) => "GC ROOT",
            (_, true) => "leaks",
            _ => "references",
        };

        let mut line = String::new();
        line.push_str(&StructureColors::class_name(element.class_name()).to_string());
        match &element.reference {
            Some(reference) => {
                line.push('.');
                line.push_str(&StructureColors::reference(&reference.display_name()).to_string());
            }
            None => line.push_str(" instance"),
        }
        if let Some(extra) = &element.extra {
            line.push(' ');
            line.push_str(&extra.dimmed().to_string());
        }

        println!(
            "  {} {:>10} {}",
            ReachabilityIndicator::for_verdict(verdict),
            prefix.dimmed(),
            line
        );

        if let Some(exclusion) = &element.exclusion {
            println!(
                "  {:>12} {}",
                "",
                StructureColors::exclusion(&format!(
                    "matches exclusion {}: {}",
                    exclusion.matcher, exclusion.reason
                ))
            );
        }

        if self.show_fields {
            for field in &element.field_references {
                println!("  {:>12} {}", "", StructureColors::detail(&format!("| {}", field)));
            }
        }
    }

    fn print_sizes(&self, result: &AnalysisResult) {
        let total = result.total_retained_size();
        println!(
            "{} {}",
            "Retained size:".dimmed(),
            StructureColors::count(&format_size(total))
        );
        if result.ignored_retained_size > 0 && total > 0 {
            let share = result.ignored_retained_size as f64 * 100.0 / total as f64;
            println!(
                "  {} {} held through native roots",
                ChartChars::bar(share, 20).dimmed(),
                format_size(result.ignored_retained_size)
            );
        }
    }
}

impl Default for TerminalReporter {
    fn default() -> Self {
        Self::new()
    }
}
