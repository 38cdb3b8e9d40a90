use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use catalog_recon::catalog::{CmsClient, CmsConfig, CommerceClient, CommerceConfig, CommerceStore};
use catalog_recon::normalization::MatchConfig;
use catalog_recon::recon::{run, ReconDeps, RunOptions, RunScope};
use catalog_recon::tracing::init_tracing;
use catalog_recon::util::env;

#[derive(Parser, Debug)]
#[command(name = "reconcile", version, about = "Catalog reconciliation CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Detect duplicate CMS products, merge salvageable fields into the
    /// survivor and delete the rest
    Dedupe {
        /// Apply the planned mutations (default is a dry-run preview)
        #[arg(long, default_value_t = false)]
        execute: bool,
        /// Preview without mutating; this is already the default
        #[arg(long, default_value_t = false, conflicts_with = "execute")]
        dry_run: bool,
        /// Also write a JSON report snapshot under the export directory
        #[arg(long, default_value_t = false)]
        json_report: bool,
    },
    /// Link canonical CMS products to commerce products and variants
    Link {
        /// Apply the planned link patches (default is a dry-run preview)
        #[arg(long, default_value_t = false)]
        execute: bool,
        /// Preview without mutating; this is already the default
        #[arg(long, default_value_t = false, conflicts_with = "execute")]
        dry_run: bool,
        /// Commit heuristic-tier matches too; they are propose-only otherwise
        #[arg(long, default_value_t = false)]
        confirm_heuristic: bool,
        /// Also write a JSON report snapshot under the export directory
        #[arg(long, default_value_t = false)]
        json_report: bool,
    },
    /// Read-only scan for draft/published pairs and records needing manual
    /// attention
    Audit {
        /// Also write a JSON report snapshot under the export directory
        #[arg(long, default_value_t = false)]
        json_report: bool,
    },
    /// Full pipeline: dedupe, then link
    Run {
        /// Apply the planned mutations (default is a dry-run preview)
        #[arg(long, default_value_t = false)]
        execute: bool,
        /// Preview without mutating; this is already the default
        #[arg(long, default_value_t = false, conflicts_with = "execute")]
        dry_run: bool,
        /// Commit heuristic-tier matches too; they are propose-only otherwise
        #[arg(long, default_value_t = false)]
        confirm_heuristic: bool,
        /// Also write a JSON report snapshot under the export directory
        #[arg(long, default_value_t = false)]
        json_report: bool,
    },
    /// Print the active match configuration (alias, suffix, keyword and
    /// unit tables) as pretty JSON for diffing
    ConfigDump,
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    let _ = init_tracing("info");
    let cli = Cli::parse();

    let (scope, execute, confirm_heuristic, json_report) = match &cli.command {
        Commands::Dedupe {
            execute,
            dry_run: _,
            json_report,
        } => (RunScope::Dedupe, *execute, false, *json_report),
        Commands::Link {
            execute,
            dry_run: _,
            confirm_heuristic,
            json_report,
        } => (RunScope::Link, *execute, *confirm_heuristic, *json_report),
        Commands::Audit { json_report } => (RunScope::Audit, false, false, *json_report),
        Commands::Run {
            execute,
            dry_run: _,
            confirm_heuristic,
            json_report,
        } => (RunScope::Full, *execute, *confirm_heuristic, *json_report),
        Commands::ConfigDump => {
            let config = MatchConfig::load();
            println!("{}", serde_json::to_string_pretty(&config)?);
            return Ok(());
        }
    };

    preflight(scope, execute)?;
    let config = MatchConfig::load();

    let cms = CmsClient::new(CmsConfig::from_env()?)?;
    let commerce: Option<Arc<dyn CommerceStore>> = if scope.needs_commerce() {
        Some(Arc::new(CommerceClient::new(CommerceConfig::from_env()?)?))
    } else {
        None
    };
    let deps = ReconDeps {
        cms: Arc::new(cms),
        commerce,
    };
    let opts = RunOptions {
        scope,
        execute,
        confirm_heuristic,
        link_concurrency: env::env_parse("RECON_LINK_CONCURRENCY", 4usize),
    };

    let report = run(&deps, opts, &config).await?;
    print!("{}", report.render_text());

    if json_report {
        let dir = env::env_opt("RECON_EXPORT_DIR").unwrap_or_else(|| "exports".to_string());
        let path = report.write_snapshot(PathBuf::from(dir).as_path())?;
        info!(path = %path.display(), "report snapshot written");
    }

    let totals = report.totals();
    if totals.group_errors > 0 || totals.link_errors > 0 {
        warn!(
            group_errors = totals.group_errors,
            link_errors = totals.link_errors,
            "run finished with per-item errors; see the report above"
        );
    }
    Ok(())
}

/// Fail before any stage runs when required credentials are missing. A write
/// token is only demanded when the run is allowed to mutate.
fn preflight(scope: RunScope, execute: bool) -> Result<()> {
    let mut required = vec!["CMS_BASE_URL", "CMS_DATASET"];
    if scope.needs_commerce() {
        required.push("COMMERCE_BASE_URL");
    }
    if execute {
        required.push("CMS_API_TOKEN");
    }
    env::preflight_check(
        "reconcile",
        &required,
        &[
            "CMS_PROJECT_ID",
            "COMMERCE_STORE",
            "COMMERCE_PAGE_SIZE",
            "RECON_HTTP_TIMEOUT_SECS",
            "RECON_MAX_RETRIES",
            "RECON_LINK_CONCURRENCY",
            "RECON_EXPORT_DIR",
        ],
    )
}
