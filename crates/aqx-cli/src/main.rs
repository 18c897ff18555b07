use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use aqx_storage::PostStore;
use aqx_sync::alerts::TelegramNotifier;
use aqx_sync::{
    daily_close, export_intent_parquet, maybe_build_scheduler, report_daily_markdown,
    IntentPipeline, RunConfig,
};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "aqx-cli")]
#[command(about = "Intent radar: scrape, tag, deduplicate, and report")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Discover, tag, and store posts for every configured keyword once.
    Sync {
        /// Read search hits from a recorded bundle instead of the network.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Create the database and apply the schema.
    Migrate,
    /// Run the dashboard.
    Serve,
    /// Print the daily KPI report as markdown.
    Kpi {
        #[arg(long)]
        day: Option<NaiveDate>,
        #[arg(long, default_value_t = 10)]
        top: i64,
    },
    /// Write the day's intent posts to parquet with a manifest.
    Export {
        #[arg(long)]
        day: Option<NaiveDate>,
        #[arg(long, default_value = "exports")]
        out: PathBuf,
    },
    /// Export, write the daily brief, and send the summary alert when Telegram is configured.
    Close {
        #[arg(long)]
        day: Option<NaiveDate>,
        #[arg(long, default_value = "exports")]
        out: PathBuf,
    },
    /// Run `sync` on the configured cron until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .and_then(|level| EnvFilter::try_new(level).ok())
        })
        .unwrap_or_else(|| EnvFilter::new("info,sqlx=warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn open_store(config: &RunConfig) -> Result<PostStore> {
    PostStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening database {}", config.database_url))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let mut config = RunConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { fixtures: None }) {
        Commands::Sync { fixtures } => {
            if fixtures.is_some() {
                config.fixtures_path = fixtures;
            }
            let pipeline = IntentPipeline::from_config(config).await?;
            let summary = pipeline.run_once().await?;
            for k in &summary.keywords {
                match &k.discovery_error {
                    Some(err) => println!("{}: discovery failed: {err}", k.keyword),
                    None => println!(
                        "{}: discovered={} new={} duplicates={} failed={} rejected={} alerts={}",
                        k.keyword,
                        k.discovered,
                        k.inserted,
                        k.duplicates,
                        k.failed,
                        k.rejected,
                        k.alerts_sent
                    ),
                }
            }
            let totals = summary.totals();
            println!(
                "sync complete: run_id={} new={} duplicates={} failed={} rejected={} reports={}",
                summary.run_id,
                totals.inserted,
                totals.duplicates,
                totals.failed,
                totals.rejected,
                summary.reports_dir.as_deref().unwrap_or("n/a")
            );
        }
        Commands::Migrate => {
            let store = open_store(&config).await?;
            store.migrate().await.context("applying schema")?;
            println!("schema ready at {}", config.database_url);
        }
        Commands::Serve => {
            aqx_web::serve_from_env().await?;
        }
        Commands::Kpi { day, top } => {
            let store = open_store(&config).await?;
            let day = day.unwrap_or_else(|| Utc::now().date_naive());
            print!("{}", report_daily_markdown(&store, day, top).await?);
        }
        Commands::Export { day, out } => {
            let store = open_store(&config).await?;
            let day = day.unwrap_or_else(|| Utc::now().date_naive());
            let manifest = export_intent_parquet(&store, day, &out).await?;
            println!(
                "export complete: day={} rows={} manifest={}",
                manifest.day,
                manifest.rows,
                out.join("manifest.json").display()
            );
        }
        Commands::Close { day, out } => {
            let store = open_store(&config).await?;
            let notifier = config
                .telegram
                .as_ref()
                .map(TelegramNotifier::new)
                .transpose()
                .context("building telegram client")?;
            let day = day.unwrap_or_else(|| Utc::now().date_naive());
            let close = daily_close(&store, notifier.as_ref(), day, &out).await?;
            println!(
                "close complete: day={} rows={} brief={} alert_sent={}",
                close.day, close.manifest.rows, close.brief_path, close.alert_sent
            );
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(IntentPipeline::from_config(config).await?);
            let Some(mut sched) = maybe_build_scheduler(pipeline).await? else {
                anyhow::bail!("scheduler disabled");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
