use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use proxy_probe::{
    blacklist::{DEFAULT_EXPORT_PATH, DEFAULT_FLAT_PATH},
    config::{
        DEFAULT_BASE_PORT, DEFAULT_DATABASE_PATH, DEFAULT_EXCLUDE_PATH, DEFAULT_PROBE_TIMEOUT_SECS,
        DEFAULT_WORKERS,
    },
    logging, BlacklistStore, CommandLauncher, Config, EndpointParser, ExcludeRules, ProbeLauncher,
    ProxyChecker, RunContext, ShutdownCoordinator,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Batch prober for proxy endpoint lists with a persistent blacklist
#[derive(Parser)]
#[command(name = "proxy-probe")]
#[command(about = "Batch prober for proxy endpoint lists with a persistent blacklist")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe every endpoint in a file and save the working ones
    Check {
        /// Input file with one endpoint descriptor per line
        input: PathBuf,
        /// Output file for working endpoints
        #[arg(short, long, env = "PROXY_PROBE_OUTPUT")]
        output: PathBuf,
        /// Program run once per endpoint; exit status 0 means working
        #[arg(long, env = "PROXY_PROBE_PROGRAM")]
        probe_program: String,
        /// Argument for the probe program ({endpoint} and {port} are substituted)
        #[arg(long = "probe-arg", allow_hyphen_values = true)]
        probe_args: Vec<String>,
        /// First local port handed to probes
        #[arg(long, env = "PROXY_PROBE_BASE_PORT", default_value_t = DEFAULT_BASE_PORT)]
        base_port: u32,
        /// Number of concurrent probes
        #[arg(short = 'n', long, env = "PROXY_PROBE_WORKERS", default_value_t = DEFAULT_WORKERS)]
        workers: usize,
        /// Timeout per probe in seconds
        #[arg(long, env = "PROXY_PROBE_TIMEOUT", default_value_t = DEFAULT_PROBE_TIMEOUT_SECS)]
        timeout: u64,
        /// Blacklist database file
        #[arg(long, env = "PROXY_PROBE_DB", default_value = DEFAULT_DATABASE_PATH)]
        db: PathBuf,
        /// Neither consult nor update the blacklist
        #[arg(long)]
        no_blacklist: bool,
        /// Drop blacklist entries not seen for this many days before probing (0 = keep)
        #[arg(long, env = "PROXY_PROBE_TTL_DAYS", default_value_t = 0)]
        ttl_days: i64,
        /// Keep at most this many blacklist entries (0 = unlimited)
        #[arg(long, env = "PROXY_PROBE_MAX_ROWS", default_value_t = 0)]
        max_rows: i64,
        /// File with exclusion rules (host:port or host, one per line)
        #[arg(long, env = "PROXY_PROBE_EXCLUDE_FILE", default_value = DEFAULT_EXCLUDE_PATH)]
        exclude_file: PathBuf,
        /// Inline exclusion rules, newline separated; wins over the file
        #[arg(long, env = "PROXY_PROBE_EXCLUDE", hide = true)]
        exclude: Option<String>,
    },
    /// Maintain the blacklist store
    Blacklist {
        #[command(subcommand)]
        action: BlacklistAction,
    },
}

#[derive(Subcommand)]
enum BlacklistAction {
    /// Import a flat blacklist file into the store
    MigrateFromFlat {
        /// Flat blacklist file
        #[arg(long, default_value = DEFAULT_FLAT_PATH)]
        flat: PathBuf,
        /// Blacklist database file
        #[arg(long, env = "PROXY_PROBE_DB", default_value = DEFAULT_DATABASE_PATH)]
        db: PathBuf,
    },
    /// Show store statistics
    Summary {
        /// Blacklist database file
        #[arg(long, env = "PROXY_PROBE_DB", default_value = DEFAULT_DATABASE_PATH)]
        db: PathBuf,
        /// Print statistics as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write every stored descriptor to a flat file
    ExportFlat {
        /// Blacklist database file
        #[arg(long, env = "PROXY_PROBE_DB", default_value = DEFAULT_DATABASE_PATH)]
        db: PathBuf,
        /// Destination flat file
        #[arg(long, default_value = DEFAULT_EXPORT_PATH)]
        flat: PathBuf,
    },
    /// Remove entries not seen for the given number of days
    Expire {
        /// Blacklist database file
        #[arg(long, env = "PROXY_PROBE_DB", default_value = DEFAULT_DATABASE_PATH)]
        db: PathBuf,
        /// Maximum age in days
        #[arg(long)]
        days: i64,
    },
    /// TTL cleanup, then a row limit, then VACUUM
    Prune {
        /// Blacklist database file
        #[arg(long, env = "PROXY_PROBE_DB", default_value = DEFAULT_DATABASE_PATH)]
        db: PathBuf,
        /// Maximum age in days (0 = no TTL)
        #[arg(long, default_value_t = 0)]
        days: i64,
        /// Maximum number of entries (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        max_rows: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Commands::Check {
            input,
            output,
            probe_program,
            probe_args,
            base_port,
            workers,
            timeout,
            db,
            no_blacklist,
            ttl_days,
            max_rows,
            exclude_file,
            exclude,
        } => {
            let config = Config::new()
                .with_base_port(base_port)
                .with_workers(workers)
                .with_probe_timeout(Duration::from_secs(timeout))
                .with_database_path(db)
                .with_blacklist_ttl_days(ttl_days)
                .with_blacklist_max_rows(max_rows)
                .with_exclude_file(exclude_file);

            let launcher = CommandLauncher::new(probe_program, probe_args)
                .with_timeout(config.probe_timeout);

            run_check(
                &config,
                input,
                output,
                Arc::new(launcher),
                exclude.as_deref(),
                !no_blacklist,
            )
            .await?;
        }
        Commands::Blacklist { action } => run_blacklist(action).await?,
    }

    Ok(())
}

async fn run_check(
    config: &Config,
    input: PathBuf,
    output: PathBuf,
    launcher: Arc<dyn ProbeLauncher>,
    inline_excludes: Option<&str>,
    use_blacklist: bool,
) -> Result<()> {
    let endpoints = EndpointParser::parse_file(&input)
        .with_context(|| format!("failed to read endpoints from {:?}", input))?;
    println!("Loaded {} endpoints from {:?}", endpoints.len(), input);

    let excludes = ExcludeRules::load(inline_excludes, config.exclude_file.as_deref())
        .context("failed to load exclusion rules")?;
    if !excludes.is_empty() {
        println!("Loaded {} exclusion rules", excludes.len());
    }

    let store = if use_blacklist {
        let store = BlacklistStore::open(&config.database_path)
            .await
            .with_context(|| format!("failed to open blacklist {:?}", config.database_path))?;
        let expired = store.expire(config.blacklist_ttl_days).await?;
        let pruned = store.prune_to_capacity(config.blacklist_max_rows).await?;
        if expired + pruned > 0 {
            info!(expired, pruned, "blacklist maintenance done");
        }
        Some(store)
    } else {
        None
    };

    let ctx = RunContext::new(config, Some(output.clone()));
    let capacity = ctx.pool().capacity();
    if capacity == 0 {
        bail!(
            "no usable probe ports: base port {} is outside 1-65535",
            config.base_port
        );
    }

    let coordinator = Arc::new(ShutdownCoordinator::new(
        Arc::clone(&ctx),
        Arc::clone(&launcher),
    ));
    let _exit_guard = coordinator.exit_guard();
    let _signals = coordinator.spawn_signal_listener();

    println!(
        "Checking with {} workers on ports {}-{}, timeout: {}s",
        capacity,
        config.base_port,
        config.base_port + capacity as u32 - 1,
        config.probe_timeout.as_secs()
    );
    println!();

    let mut checker = ProxyChecker::new(Arc::clone(&ctx), launcher).with_excludes(excludes);
    if let Some(store) = &store {
        checker = checker.with_store(store.clone());
    }
    let summary = checker.check_endpoints(endpoints).await?;

    if ctx.stop_requested() {
        // The shutdown path owns the results from here on.
        return Ok(());
    }

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let good = ctx.results().snapshot();
    EndpointParser::write_lines(&output, &good)
        .with_context(|| format!("failed to write results to {:?}", output))?;
    ctx.results().mark_complete();

    println!(
        "Results: {} good, {} bad, {} errors",
        summary.good, summary.bad, summary.errors
    );
    if summary.skipped_excluded + summary.skipped_blacklisted > 0 {
        println!(
            "Skipped: {} excluded, {} blacklisted",
            summary.skipped_excluded, summary.skipped_blacklisted
        );
    }
    println!("Saved {} working endpoints to {:?}", good.len(), output);

    if let Some(store) = store {
        store.close().await;
    }
    Ok(())
}

async fn run_blacklist(action: BlacklistAction) -> Result<()> {
    match action {
        BlacklistAction::MigrateFromFlat { flat, db } => {
            let store = BlacklistStore::open(&db).await?;
            let (inserted, updated) = store.migrate_from(&flat).await?;
            println!(
                "Migration from flat {:?} to SQLite {:?}: inserted {}, updated {}",
                flat, db, inserted, updated
            );
            store.close().await;
        }
        BlacklistAction::Summary { db, json } => {
            let Some(store) = BlacklistStore::open_existing(&db).await? else {
                println!("No blacklist store at {:?}", db);
                return Ok(());
            };
            let stats = store.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Blacklist summary:");
                println!("  DB path       : {:?}", db);
                println!("  total records : {}", stats.total);
                println!(
                    "  first_seen min: {}",
                    stats.min_first_seen.as_deref().unwrap_or("-")
                );
                println!(
                    "  last_seen max : {}",
                    stats.max_last_seen.as_deref().unwrap_or("-")
                );
            }
            store.close().await;
        }
        BlacklistAction::ExportFlat { db, flat } => {
            let count = match BlacklistStore::open_existing(&db).await? {
                Some(store) => {
                    let count = store.export_to(&flat).await?;
                    store.close().await;
                    count
                }
                None => 0,
            };
            println!(
                "Exported {} records from SQLite {:?} to flat file {:?}",
                count, db, flat
            );
        }
        BlacklistAction::Expire { db, days } => {
            let store = BlacklistStore::open(&db).await?;
            let removed = store.expire(days).await?;
            println!(
                "Expired {} entries older than {} days in {:?}",
                removed, days, db
            );
            store.close().await;
        }
        BlacklistAction::Prune { db, days, max_rows } => {
            let store = BlacklistStore::open(&db).await?;

            let before = store.stats().await?;
            println!("Before prune: total={}", before.total);

            let expired = store.expire(days).await?;
            println!("Expire: removed {} rows older than {} days", expired, days);

            let pruned = store.prune_to_capacity(max_rows).await?;
            println!("Prune: removed {} extra rows above {}", pruned, max_rows);

            let after = store.stats().await?;
            println!(
                "After prune: total={}, min_first={}, max_last={}",
                after.total,
                after.min_first_seen.as_deref().unwrap_or("-"),
                after.max_last_seen.as_deref().unwrap_or("-")
            );

            println!("Running VACUUM to shrink file...");
            store.vacuum().await?;
            store.close().await;
        }
    }

    Ok(())
}
