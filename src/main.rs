use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use colored::Colorize;
use leaktrace::analysis::{AnalysisError, HeapAnalyzer};
use leaktrace::config::Config;
use leaktrace::report::{Outcome, ReportFormat, ReportOptions, Reporter};
use miette::Result;
use std::path::{Path, PathBuf};
use tracing::info;

/// leaktrace - Find the reference chain keeping a leaked object alive
#[derive(Parser, Debug)]
#[command(name = "leaktrace")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "terminal", global = true)]
    format: OutputFormat,

    /// Output file (for json format)
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode - only output results
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Generate shell completions
    #[arg(long, value_name = "SHELL")]
    completions: Option<Shell>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze a heap snapshot for the instance watched with KEY
    Analyze {
        /// Decoded heap snapshot (JSON)
        snapshot: PathBuf,

        /// Watch key of the retained reference
        #[arg(short, long)]
        key: String,

        /// Compute retained sizes on a single thread
        #[arg(long)]
        no_parallel: bool,

        /// Print every holder's fields under its trace line
        #[arg(long)]
        fields: bool,
    },

    /// Print the effective exclusion rules
    Rules,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default)]
enum OutputFormat {
    #[default]
    Terminal,
    Json,
}

impl From<OutputFormat> for ReportFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Terminal => ReportFormat::Terminal,
            OutputFormat::Json => ReportFormat::Json,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle shell completions
    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        generate(shell, &mut cmd, name, &mut std::io::stdout());
        return Ok(());
    }

    init_logging(cli.verbose, cli.quiet);

    info!("leaktrace v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&cli)?;

    match &cli.command {
        Some(Command::Analyze {
            snapshot,
            key,
            no_parallel,
            fields,
        }) => {
            let mut config = config;
            if *no_parallel {
                config.analysis.parallel = false;
            }
            run_analysis(&config, &cli, snapshot, key, *fields)
        }
        Some(Command::Rules) => {
            let table = config.exclusion_table()?;
            Reporter::new(cli.format.into(), cli.output.clone()).report_rules(&table)
        }
        None => {
            Cli::command().print_help().map_err(|e| miette::miette!("{}", e))?;
            Ok(())
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let config = if let Some(config_path) = &cli.config {
        Config::from_file(config_path)?
    } else {
        // Try to load from default locations
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Config::from_default_locations(&cwd)?
    };
    Ok(config)
}

fn run_analysis(config: &Config, cli: &Cli, snapshot: &Path, key: &str, fields: bool) -> Result<()> {
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    let analyzer = HeapAnalyzer::from_config(config)?;

    let spinner = if !cli.quiet && matches!(cli.format, OutputFormat::Terminal) {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("Analyzing {}", snapshot.display()));
        pb.enable_steady_tick(Duration::from_millis(100));
        Some(pb)
    } else {
        None
    };

    let outcome = analyzer.analyze(snapshot, key);

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    let reporter = Reporter::with_options(
        cli.format.into(),
        ReportOptions {
            output_path: cli.output.clone(),
            show_fields: fields,
        },
    );

    match outcome {
        Ok(result) => reporter.report(&Outcome::Leak(&result)),
        Err(AnalysisError::FalseAlarm { key }) => reporter.report(&Outcome::FalseAlarm { key: &key }),
        Err(e) => {
            if !e.is_fatal() {
                eprintln!("{} {}", "warning:".yellow().bold(), e);
            }
            Err(miette::miette!("Analysis failed: {}", e))
        }
    }
}
