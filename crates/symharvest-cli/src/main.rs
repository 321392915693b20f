use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use symharvest_core::Category;
use symharvest_storage::connect_store;
use symharvest_sync::{HarvestRuntime, SyncConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "symharvest")]
#[command(about = "Harvest market symbol listings and sync them into the symbol store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest the given categories, or every enabled one from categories.yaml.
    Harvest {
        categories: Vec<String>,
        /// Print each report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Create the symbols table and indexes.
    Migrate,
    /// List the stored rows of one category.
    Show { category: String },
    /// Run harvests on the SYNC_CRON schedule until interrupted.
    Schedule,
}

/// JSON logs when `RUST_LOG_FORMAT=json`, human-readable otherwise.
fn init_tracing() {
    let use_json = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);
    let filter = EnvFilter::from_default_env().add_directive(Level::INFO.into());

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().flatten_event(true).with_current_span(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping at the next round boundary");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Harvest {
        categories: Vec::new(),
        json: false,
    });
    match command {
        Commands::Harvest { categories, json } => {
            let runtime = HarvestRuntime::from_env().await?;
            let categories = if categories.is_empty() {
                runtime.default_categories()
            } else {
                categories
            };
            let cancel = cancel_on_ctrl_c();
            let runs = runtime.pipeline.run_all(&categories, &cancel).await;

            let mut failed = 0;
            for run in &runs {
                match &run.result {
                    Ok(report) if json => {
                        println!("{}", serde_json::to_string(report).context("encoding report")?);
                    }
                    Ok(report) => println!(
                        "{}: written={} rounds={} termination={} run_id={}{}",
                        run.category,
                        report.written_count,
                        report.duration_rounds,
                        report.termination_reason,
                        report.run_id,
                        report
                            .cache_warning
                            .as_ref()
                            .map(|w| format!(" cache_warning=\"{w}\""))
                            .unwrap_or_default()
                    ),
                    Err(err) => {
                        failed += 1;
                        eprintln!("{}: failed: {err}", run.category);
                    }
                }
            }
            println!("harvest complete: categories={} failed={failed}", runs.len());
            if failed > 0 {
                std::process::exit(1);
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = connect_store(&config.database_url)
                .await
                .context("connecting symbol store")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied to {}", redact(&config.database_url));
        }
        Commands::Show { category } => {
            let runtime = HarvestRuntime::from_env().await?;
            let category = Category::parse_enabled(&category)?;
            let rows = runtime
                .cache
                .get_or_load(category, runtime.store.as_ref())
                .await
                .map_err(|err| anyhow::anyhow!("loading {category}: {err}"))?;
            for row in rows.iter() {
                println!(
                    "{:>5}  {:<28} {:<12} {:<10} {}",
                    row.order_index, row.id, row.exchange, row.currency, row.description
                );
            }
            println!("{category}: {} rows", rows.len());
        }
        Commands::Schedule => {
            let runtime = HarvestRuntime::from_env().await?;
            let cancel = CancellationToken::new();
            let Some(mut sched) = runtime.maybe_build_scheduler(cancel.clone()).await? else {
                anyhow::bail!("scheduler disabled; set SYMHARVEST_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %runtime.config.sync_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
            cancel.cancel();
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***{}", &url[..scheme], &url[at..])
        }
        _ => url.to_string(),
    }
}
