use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use loot_config::{secrets, ConfigMode, LoadedConfig};
use loot_db::PgStore;
use loot_reconcile::{PerAccountResult, Reconciler, TrustDirection};
use loot_schemas::{Identity, SystemClock};

#[derive(Parser)]
#[command(name = "loot")]
#[command(about = "Reward ledger operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> overrides...)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Reconcile item instances against account snapshots
    Reconcile {
        /// Restrict to these identities (repeatable). Default: every account.
        #[arg(long = "identity")]
        identities: Vec<String>,

        /// Which representation wins: snapshot | instances
        #[arg(long)]
        direction: Option<String>,

        /// Accounts processed at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Print the full report as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    /// Apply SQL migrations.
    Migrate,
}

/// Connect with the database URL resolved for operator mode.
async fn operator_store(loaded: &LoadedConfig) -> Result<PgStore> {
    let secrets =
        secrets::resolve_secrets_for_mode(&loaded.config_json, ConfigMode::Operator, false)?;
    let url = secrets
        .database_url
        .as_deref()
        .with_context(|| format!("missing env var {}", secrets.database_url_env))?;
    Ok(PgStore::new(loot_db::connect(url).await?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let loaded = loot_config::load_from_env()?;
            let store = operator_store(&loaded).await?;
            match cmd {
                DbCmd::Status => {
                    let s = loot_db::status(store.pool()).await?;
                    println!("db_ok={} has_ledger_table={}", s.ok, s.has_ledger_table);
                }
                DbCmd::Migrate => {
                    loot_db::migrate(store.pool()).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = loot_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Reconcile {
            identities,
            direction,
            concurrency,
            json,
        } => {
            // Arguments are validated before touching the database.
            let loaded = loot_config::load_from_env()?;
            let cfg = loaded.typed()?;
            let direction = match direction.as_deref() {
                Some(raw) => TrustDirection::parse(raw).with_context(|| {
                    format!("invalid --direction '{raw}': expected snapshot|instances")
                })?,
                None => cfg.reconcile.direction,
            };
            let filter = identities
                .iter()
                .map(|raw| {
                    Identity::new(raw.as_str()).with_context(|| format!("invalid --identity '{raw}'"))
                })
                .collect::<Result<Vec<_>>>()?;

            tracing::debug!(
                direction = direction.as_str(),
                identities = filter.len(),
                "operator reconcile starting"
            );
            let store = operator_store(&loaded).await?;
            let reconciler = Reconciler::new(
                Arc::new(store),
                Arc::new(SystemClock),
                direction,
                concurrency.unwrap_or(cfg.reconcile.concurrency),
                cfg.claims.store_timeout(),
            );
            let report = reconciler.reconcile_all(&filter).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for r in &report.results {
                    match r {
                        PerAccountResult::Reconciled(a) => println!(
                            "identity={} added={} removed={} snapshot_rewritten={} shortfall={}",
                            a.identity,
                            a.added,
                            a.removed,
                            a.snapshot_rewritten,
                            a.shortfall.values().sum::<usize>()
                        ),
                        PerAccountResult::Failed(f) => {
                            println!("identity={} code={} error={}", f.identity, f.code, f.error)
                        }
                    }
                }
                println!(
                    "direction={} accounts={} failures={} added={} removed={}",
                    report.direction.as_str(),
                    report.accounts(),
                    report.failures(),
                    report.total_added(),
                    report.total_removed()
                );
            }

            if report.failures() > 0 {
                bail!(
                    "PARTIAL_RECONCILIATION_FAILURE: {} of {} accounts failed",
                    report.failures(),
                    report.accounts()
                );
            }
        }
    }

    Ok(())
}
