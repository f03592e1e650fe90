use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use resao_storage::PgTenderRepository;
use resao_sync::{GateState, Pipeline, PipelineConfig};
use resao_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "resao-cli")]
#[command(about = "Tender results ingestion: scrape, review, import")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (and the scrape scheduler when enabled).
    Serve {
        #[arg(long, env = "RESAO_WEB_PORT", default_value_t = 8000)]
        port: u16,
    },
    /// Scrape once and stage the batch for review.
    Scrape,
    /// Print the gate state.
    Status,
    /// Print whether a staged batch is ready, with a preview.
    Available,
    /// Import the staged batch.
    Import,
    /// Apply PostgreSQL migrations.
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("RESAO_LOG_JSON")
        .is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Serve { port } => {
            let pipeline = Pipeline::build(config).await?;
            let gate = Arc::clone(&pipeline.gate);
            let scheduler = resao_sync::maybe_build_scheduler(&pipeline.config, gate).await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting scrape scheduler")?;
                info!(cron = %pipeline.config.scrape_cron, "scrape scheduler started");
            }
            resao_web::serve(AppState::from_pipeline(&pipeline), port).await?;
        }
        Commands::Scrape => {
            let pipeline = Pipeline::build(config).await?;
            let run_id = pipeline.gate.start_scrape().await?;
            let settled = pipeline.gate.wait_settled(run_id).await;
            match settled.state {
                GateState::Ready { count, .. } => {
                    println!("scrape complete: run_id={run_id} records={count}");
                }
                GateState::Failed { error, .. } => bail!("scrape {run_id} failed: {error}"),
                other => println!("scrape {run_id} settled as {}", other.name()),
            }
        }
        Commands::Status => {
            let pipeline = Pipeline::build(config).await?;
            let snapshot = pipeline.gate.status().await;
            println!("{}", serde_json::to_string_pretty(&snapshot.state)?);
        }
        Commands::Available => {
            let pipeline = Pipeline::build(config).await?;
            println!("{}", serde_json::to_string_pretty(&pipeline.gate.check_available())?);
        }
        Commands::Import => {
            let pipeline = Pipeline::build(config).await?;
            let report = pipeline.gate.confirm_import().await?;
            let stats = &report.stats;
            println!(
                "import complete: run_id={} created={} updated={} unchanged={} skipped={} \
                 conflicts={}",
                report.run_id,
                stats.created,
                stats.updated,
                stats.unchanged,
                stats.skipped_invalid,
                stats.conflict
            );
            for error in &stats.errors {
                eprintln!("  {error}");
            }
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL is not set; the JSON file store needs no migrations");
            };
            let repo = PgTenderRepository::connect(url).await?;
            repo.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
