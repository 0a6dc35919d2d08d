use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use similar::{ChangeTag, TextDiff};
use site_patcher::config::{build_units, discover_patch_files, load_each};
use site_patcher::telemetry::init_tracing;
use site_patcher::{
    CategoryFilter, FailurePolicy, OrchestrationReport, Orchestrator, OsFileSystem, PatchResult,
    PatchStatus, PatchUnit,
};
use std::path::{Path, PathBuf};
use tracing::Level;

#[derive(Parser)]
#[command(name = "site-patcher")]
#[command(about = "Idempotent, best-effort patches for installed third-party packages", long_about = None)]
#[command(version)]
struct Cli {
    /// Log pipeline stages (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Selection {
    /// Patch file or directory of patch files
    ///
    /// Defaults to ./patches, then to a patches/ directory next to the
    /// executable.
    #[arg(short, long, env = "SITE_PATCHER_PATCHES")]
    patches: Option<PathBuf>,

    /// Do not register units of this category (repeatable)
    #[arg(long = "skip-category", value_name = "CATEGORY")]
    skip_category: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply patches to the installed packages
    Apply {
        #[command(flatten)]
        selection: Selection,

        /// Show unified diff of changes
        #[arg(short, long)]
        diff: bool,

        /// Print the report as JSON instead of text
        #[arg(long)]
        json: bool,

        /// Exit with status 1 when a required patch failed
        #[arg(long)]
        strict: bool,
    },

    /// Report what `apply` would do without writing anything
    Status {
        #[command(flatten)]
        selection: Selection,
    },

    /// List registered patches
    List {
        #[command(flatten)]
        selection: Selection,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.log_json, level);

    match cli.command {
        Commands::Apply {
            selection,
            diff,
            json,
            strict,
        } => {
            let policy = if strict {
                FailurePolicy::Strict
            } else {
                FailurePolicy::BestEffort
            };
            cmd_apply(&selection, diff, json, policy)
        }

        Commands::Status { selection } => cmd_status(&selection),

        Commands::List { selection } => cmd_list(&selection),
    }
}

/// Units to run plus the patch files that could not be loaded.
struct Loaded {
    units: Vec<PatchUnit>,
    failures: Vec<PatchResult>,
}

impl Loaded {
    /// A report that starts with the load failures.
    fn report(&self) -> OrchestrationReport {
        let mut report = OrchestrationReport::default();
        for failure in &self.failures {
            report.push(failure.clone());
        }
        report
    }
}

/// Helper: Where patch files live when `--patches` is not given.
fn default_patch_location() -> PathBuf {
    let local = PathBuf::from("patches");
    if local.exists() {
        return local;
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("patches")))
        .filter(|dir| dir.exists())
        .unwrap_or(local)
}

/// Helper: Turn the selection into the ordered list of units to run.
///
/// A missing patch location or a broken patch file does not stop the run:
/// it becomes a failed entry and the remaining files still load.
fn load_units(selection: &Selection) -> Result<Loaded> {
    let location = selection
        .patches
        .clone()
        .unwrap_or_else(default_patch_location);

    let files = match discover_patch_files(&location) {
        Ok(files) => files,
        Err(err) => {
            tracing::warn!(error = %err, "no patch files loaded");
            return Ok(Loaded {
                units: Vec::new(),
                failures: vec![PatchResult::unloadable(&location, err.to_string())],
            });
        }
    };

    let loaded = load_each(&files);
    for (path, config) in &loaded.configs {
        tracing::debug!(
            file = %path.display(),
            name = %config.meta.name,
            patches = config.patches.len(),
            "loaded patch file"
        );
    }
    let failures = loaded
        .failures
        .iter()
        .map(|(path, err)| {
            tracing::warn!(file = %path.display(), error = %err, "skipping patch file");
            PatchResult::unloadable(path, err.to_string())
        })
        .collect();

    let mut filter = CategoryFilter::new();
    for category in &selection.skip_category {
        filter.disable(category.clone());
    }
    let units = build_units(loaded.configs.iter().map(|(_, config)| config), &filter)
        .context("failed to build patch units")?;
    Ok(Loaded { units, failures })
}

/// Helper: Show unified diff between original and modified content
fn display_diff(file: &Path, original: &str, modified: &str) {
    println!(
        "\n{}",
        format!("--- {} (original)", file.display()).dimmed()
    );
    println!("{}", format!("+++ {} (patched)", file.display()).dimmed());

    let diff = TextDiff::from_lines(original, modified);
    for hunk in diff.unified_diff().context_radius(3).iter_hunks() {
        println!("{}", hunk.header().to_string().cyan());
        for change in hunk.iter_changes() {
            let line = match change.tag() {
                ChangeTag::Delete => format!("-{change}").red(),
                ChangeTag::Insert => format!("+{change}").green(),
                ChangeTag::Equal => format!(" {change}").normal(),
            };
            print!("{line}");
            if change.missing_newline() {
                println!();
            }
        }
    }
}

fn status_symbol(status: PatchStatus) -> colored::ColoredString {
    match status {
        PatchStatus::Applied => "✓".green(),
        PatchStatus::AlreadyApplied => "⊙".yellow(),
        PatchStatus::SkippedNotFound | PatchStatus::SkippedPatternNotMatched => "⊘".cyan(),
        PatchStatus::Failed => "✗".red(),
    }
}

fn print_result(result: &PatchResult, check_mode: bool) {
    let status = match (result.status, check_mode) {
        (PatchStatus::Applied, true) => "would apply".to_string(),
        (status, _) => status.to_string(),
    };
    let line = format!("{} {}: {}", status_symbol(result.status), result.unit_id, status);
    if result.detail.is_empty() {
        println!("{line}");
    } else {
        println!("{line} {}", format!("({})", result.detail).dimmed());
    }
    if let Some(path) = &result.path {
        if result.status == PatchStatus::Failed {
            println!("  File: {}", path.display());
        }
    }
}

fn print_summary(report: &OrchestrationReport) {
    println!();
    println!("{}", "Summary:".bold());
    println!(
        "  {} applied",
        format!("{}", report.count(PatchStatus::Applied)).green()
    );
    println!(
        "  {} already applied",
        format!("{}", report.count(PatchStatus::AlreadyApplied)).yellow()
    );
    println!(
        "  {} skipped",
        format!(
            "{}",
            report.count(PatchStatus::SkippedNotFound)
                + report.count(PatchStatus::SkippedPatternNotMatched)
        )
        .cyan()
    );
    println!(
        "  {} failed",
        format!("{}", report.count(PatchStatus::Failed)).red()
    );
    println!("Patched {}", report.summary().bold());
}

fn cmd_apply(
    selection: &Selection,
    show_diff: bool,
    json: bool,
    policy: FailurePolicy,
) -> Result<()> {
    let loaded = load_units(selection)?;

    let mut report = loaded.report();
    report.merge(
        Orchestrator::new(OsFileSystem)
            .record_changes(show_diff)
            .run(&loaded.units),
    );

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to serialize report")?
        );
    } else {
        for result in &report.results {
            print_result(result, false);
            if let (Some(change), Some(path)) = (&result.change, &result.path) {
                display_diff(path, &change.before, &change.after);
            }
        }
        print_summary(&report);
    }

    if !report.is_success(policy) {
        let failed: Vec<&str> = report
            .required_failures()
            .map(|r| r.unit_id.as_str())
            .collect();
        eprintln!(
            "{} required patches failed: {}",
            "✗".red(),
            failed.join(", ")
        );
        std::process::exit(1);
    }

    Ok(())
}

fn cmd_status(selection: &Selection) -> Result<()> {
    let loaded = load_units(selection)?;
    let mut report = loaded.report();
    report.merge(Orchestrator::new(OsFileSystem).check(&loaded.units));

    for result in &report.results {
        print_result(result, true);
    }

    let pending = report.count(PatchStatus::Applied);
    println!();
    if pending == 0 {
        println!("{}", "Nothing to apply".green());
    } else {
        println!("{} patch(es) would apply", format!("{pending}").yellow());
    }
    Ok(())
}

fn cmd_list(selection: &Selection) -> Result<()> {
    let loaded = load_units(selection)?;
    for failure in &loaded.failures {
        print_result(failure, false);
    }
    let units = loaded.units;

    println!("{}", "Registered patches:".bold());
    for unit in &units {
        println!(
            "  {} [{}] {}",
            unit.id.bold(),
            unit.category.as_deref().unwrap_or("-"),
            unit.strategy.kind().dimmed()
        );
        println!("    file:   {}", unit.target.relative_path.display());
        println!("    marker: {}", unit.marker);
        if !unit.required {
            println!("    {}", "optional".dimmed());
        }
    }
    println!();
    println!("{} patch(es)", units.len());
    Ok(())
}
