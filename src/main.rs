use std::path::PathBuf;

use adsentry::config::AppConfig;
use adsentry::detect::engine::DetectionEngine;
use adsentry::detect::metric::MetricRow;
use adsentry::detect::{Finding, FindingAction, FindingStatus};
use adsentry::storage::findings::FindingFilter;
use adsentry::storage::SqliteStore;
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "adsentry",
    about = "Rule-based anomaly detection over daily campaign metrics",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides storage.database_path)
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + detection schedule)
    Serve {
        /// Bind address (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run detection once and print the findings
    Detect {
        /// Effective date (YYYY-MM-DD), defaults to today in UTC
        #[arg(long)]
        as_of: Option<NaiveDate>,

        /// Override every rule's lookback window, in days
        #[arg(long)]
        lookback: Option<u32>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Manage detection rules
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Review and triage findings
    Findings {
        #[command(subcommand)]
        action: FindingsAction,
    },

    /// Load metric rows
    Metrics {
        #[command(subcommand)]
        action: MetricsAction,
    },
}

#[derive(Subcommand)]
enum RulesAction {
    /// List all rules
    List,

    /// Install the default rule set into an empty rules table
    InstallDefaults,

    /// Enable a rule
    Enable {
        #[arg(long)]
        id: i64,
    },

    /// Disable a rule
    Disable {
        #[arg(long)]
        id: i64,
    },
}

#[derive(Subcommand)]
enum FindingsAction {
    /// List findings, newest first
    List {
        /// Only findings in this status
        #[arg(long)]
        status: Option<FindingStatus>,

        #[arg(long, default_value = "50")]
        limit: u32,
    },

    /// Acknowledge a new finding
    Ack(Transition),

    /// Start investigating an acknowledged finding
    Investigate(Transition),

    /// Resolve an acknowledged or investigating finding
    Resolve(Transition),

    /// Dismiss an open finding
    Dismiss(Transition),
}

#[derive(clap::Args)]
struct Transition {
    #[arg(long)]
    id: Uuid,

    /// Who is acting on the finding
    #[arg(long)]
    actor: Option<String>,
}

#[derive(Subcommand)]
enum MetricsAction {
    /// Import a JSON array of metric rows
    Import {
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::resolve(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.storage.database_path = db;
    }
    adsentry::init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting adsentry daemon");
            adsentry::serve(config).await?;
        }
        Commands::Detect { as_of, lookback, json } => {
            let store = open_store(&config)?;
            let as_of = as_of.unwrap_or_else(|| Utc::now().date_naive());
            let findings = DetectionEngine::new(&store, &store, &store)
                .with_options(config.detection.options())
                .run_detection(as_of, lookback)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&findings)?);
            } else {
                println!("\nDetection run as of {} ({} findings)", as_of, findings.len());
                print_findings(&findings);
            }
        }
        Commands::Rules { action } => {
            let store = open_store(&config)?;
            match action {
                RulesAction::List => {
                    let rules = store.list_rules()?;
                    if rules.is_empty() {
                        println!("No rules found. Try 'adsentry rules install-defaults'.");
                    } else {
                        println!(
                            "{:<5} | {:<30} | {:<16} | {:<9} | {:>9} | {:>8} | Enabled",
                            "ID", "Name", "Metric", "Kind", "Threshold", "Lookback"
                        );
                        println!("{:-<5}-|-{:-<30}-|-{:-<16}-|-{:-<9}-|-{:-<9}-|-{:-<8}-|-{:-<7}", "", "", "", "", "", "", "");
                        for r in rules {
                            println!(
                                "{:<5} | {:<30} | {:<16} | {:<9} | {:>9} | {:>8} | {}",
                                r.id, r.name, r.metric_name, r.condition_kind, r.threshold_value, r.lookback_days, r.enabled
                            );
                        }
                    }
                }
                RulesAction::InstallDefaults => {
                    let n = store.install_defaults()?;
                    if n == 0 {
                        println!("Rules already present, nothing installed.");
                    } else {
                        println!("Installed {} default rules.", n);
                    }
                }
                RulesAction::Enable { id } => {
                    let rule = store.set_rule_enabled(id, true)?;
                    println!("Rule '{}' enabled.", rule.name);
                }
                RulesAction::Disable { id } => {
                    let rule = store.set_rule_enabled(id, false)?;
                    println!("Rule '{}' disabled.", rule.name);
                }
            }
        }
        Commands::Findings { action } => {
            let store = open_store(&config)?;
            let (t, action) = match action {
                FindingsAction::List { status, limit } => {
                    let filter = FindingFilter {
                        status,
                        limit: Some(limit),
                        ..Default::default()
                    };
                    print_findings(&store.list_findings(&filter)?);
                    return Ok(());
                }
                FindingsAction::Ack(t) => (t, FindingAction::Acknowledge),
                FindingsAction::Investigate(t) => (t, FindingAction::Investigate),
                FindingsAction::Resolve(t) => (t, FindingAction::Resolve),
                FindingsAction::Dismiss(t) => (t, FindingAction::Dismiss),
            };
            let finding = store.transition_finding(t.id, action, t.actor.as_deref())?;
            println!("Finding {} is now {}.", finding.id, finding.status);
        }
        Commands::Metrics { action } => {
            let store = open_store(&config)?;
            match action {
                MetricsAction::Import { file } => {
                    let content = std::fs::read_to_string(&file)
                        .with_context(|| format!("failed to read {}", file.display()))?;
                    let rows: Vec<MetricRow> = serde_json::from_str(&content)
                        .with_context(|| format!("failed to parse {}", file.display()))?;
                    let n = store.insert_metrics(&rows)?;
                    println!("Imported {} metric rows.", n);
                }
            }
        }
    }

    Ok(())
}

fn open_store(config: &AppConfig) -> Result<SqliteStore> {
    SqliteStore::open(&config.storage.database_path)
}

fn print_findings(findings: &[Finding]) {
    if findings.is_empty() {
        println!("No findings.");
        return;
    }
    println!("{:<36} | {:<8} | {:<13} | {:<6} | Title", "ID", "Severity", "Status", "Entity");
    println!("{:-<36}-|-{:-<8}-|-{:-<13}-|-{:-<6}-|-{:-<40}", "", "", "", "", "");
    for f in findings {
        let entity = f.entity_id.map(|e| e.to_string()).unwrap_or_else(|| "-".into());
        println!("{:<36} | {:<8} | {:<13} | {:<6} | {}", f.id, f.severity, f.status, entity, f.title);
    }
}
