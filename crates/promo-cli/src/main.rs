use anyhow::{Context, Result};
use chrono::{Datelike, Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use promo_sync::{SyncConfig, SyncPipeline, SyncRunSummary};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "promo-cli")]
#[command(about = "Sync promotion banner dates onto store products")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Read promotions and write/delete product date fields (default).
    Sync(SyncArgs),
    /// Print the vendor plans for a day without contacting the store.
    Plan(DayArgs),
    /// Run the sync on SYNC_CRON until interrupted.
    Schedule,
}

#[derive(Debug, Args, Default)]
struct DayArgs {
    /// Project as of this date (YYYY-MM-DD or M.D); defaults to the local date.
    #[arg(long)]
    today: Option<String>,
    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args, Default)]
struct SyncArgs {
    /// Log intended writes without sending them (overrides DRY_RUN).
    #[arg(long, conflicts_with = "apply")]
    dry_run: bool,
    /// Send writes and deletes (overrides DRY_RUN).
    #[arg(long)]
    apply: bool,
    /// Stop after computing plans; the store is never contacted.
    #[arg(long)]
    db_only: bool,
    #[command(flatten)]
    day: DayArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            if args.dry_run {
                config.dry_run = true;
            }
            if args.apply {
                config.dry_run = false;
            }
            if args.db_only {
                config.db_only = true;
            }
            let today = resolve_today(args.day.today.as_deref())?;
            let summary = SyncPipeline::new(config).run_once(today).await?;
            report(&summary, args.day.json)?;
            if !summary.stats.failures.is_empty() {
                anyhow::bail!("{} field operation(s) failed", summary.stats.failures.len());
            }
        }
        Commands::Plan(args) => {
            config.db_only = true;
            let today = resolve_today(args.today.as_deref())?;
            let summary = SyncPipeline::new(config).run_once(today).await?;
            report(&summary, args.json)?;
        }
        Commands::Schedule => {
            let cron = config.sync_cron.clone();
            let sched = SyncPipeline::new(config).build_scheduler().await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}

fn resolve_today(raw: Option<&str>) -> Result<NaiveDate> {
    let local = Local::now().date_naive();
    match raw {
        Some(raw) => promo_core::normalize_date(raw, local.year())
            .with_context(|| format!("invalid --today {raw:?}")),
        None => Ok(local),
    }
}

fn report(summary: &SyncRunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", summary.to_json_pretty()?);
        return Ok(());
    }
    for plan in &summary.plans {
        println!("{plan}");
    }
    println!(
        "sync complete: run_id={} today={} source={} rows={} in_window={} vendors={} products={} written={} deleted={} failures={} dry_run={} db_only={}",
        summary.run_id,
        summary.today,
        summary.source,
        summary.rows_read,
        summary.rows_in_window,
        summary.plans.len(),
        summary.stats.products_touched,
        summary.stats.fields_written,
        summary.stats.fields_deleted,
        summary.stats.failures.len(),
        summary.dry_run,
        summary.db_only,
    );
    for failure in &summary.stats.failures {
        eprintln!(
            "failed: vendor={} product={} type={} transient={} error={}",
            failure.vendor,
            failure.product_id.as_deref().unwrap_or("-"),
            failure.entry_type.map(|t| t.label()).unwrap_or("-"),
            failure.transient,
            failure.error,
        );
    }
    Ok(())
}
