mod config;
mod db;
mod fetcher;
mod history;
mod locator;
mod model;
mod page;
mod parser;
mod pipeline;
mod server;
mod store;
mod sync;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::Local;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Settings;
use crate::parser::pdf::PdfText;
use crate::pipeline::{Pipeline, Trigger};

#[derive(Parser)]
#[command(name = "pima_scraper", about = "PIMA price bulletin scraper and read API")]
struct Cli {
    /// Extra settings file (TOML/YAML/JSON), applied over ./pima.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Locate, download, extract and persist once
    Run,
    /// Serve /, /precios, /actualizar and refresh on a schedule
    Serve {
        /// Address to bind (overrides settings)
        #[arg(short, long)]
        bind: Option<String>,
        /// Do not run the periodic updater
        #[arg(long)]
        no_schedule: bool,
    },
    /// Print the attachment links found on the bulletin page
    Links,
    /// Print the records of a local PDF as JSON
    Extract {
        file: PathBuf,
    },
    /// Show document cache and run statistics
    Stats {
        /// Recent runs to list
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = config::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Run => {
            let p = build_pipeline(settings)?.with_progress(true);
            let outcome = p.run(Trigger::Cli).await?;
            println!(
                "{} documents, {} records saved to {} ({} new).",
                outcome.documents,
                outcome.record_count,
                p.settings().storage.cache_file.display(),
                outcome.appended
            );
            Ok(())
        }
        Commands::Serve { bind, no_schedule } => {
            let bind = bind.unwrap_or_else(|| settings.server.bind.clone());
            let every = settings.schedule.every;
            let p = Arc::new(build_pipeline(settings)?);
            let shutdown = CancellationToken::new();

            let scheduler = (!no_schedule).then(|| {
                info!("updating every {}", format_duration(every));
                tokio::spawn(server::run_scheduler(Arc::clone(&p), every, shutdown.clone()))
            });

            let signal = shutdown.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutting down");
                signal.cancel();
            });

            let served = server::serve(p, &bind, shutdown.clone()).await;
            shutdown.cancel();
            if let Some(handle) = scheduler {
                let _ = handle.await;
            }
            served
        }
        Commands::Links => {
            let p = build_pipeline(settings)?;
            let links = p.locate().await?;
            for (i, link) in links.iter().enumerate() {
                println!("{:>3}. {}\n     {}", i + 1, link.label, link.url);
            }
            println!("\n{} documents", links.len());
            Ok(())
        }
        Commands::Extract { file } => {
            let bytes = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let fallback = Local::now().format("%d/%m/%Y").to_string();
            let records = parser::extract(&PdfText, &bytes, &fallback)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            eprintln!("{} records", records.len());
            Ok(())
        }
        Commands::Stats { limit } => {
            let conn = db::connect(&settings.storage.db_path)?;
            let s = db::get_stats(&conn)?;
            println!("Documents:    {}", s.documents);
            println!("Runs:         {}", s.runs);
            println!("Failed runs:  {}", s.failed);
            println!("Last success: {}", s.last_success.as_deref().unwrap_or("-"));

            let runs = db::recent_runs(&conn, limit)?;
            if !runs.is_empty() {
                println!(
                    "\n{:>4} | {:<9} | {:<19} | {:<19} | {:>7} | {:>5} | {}",
                    "#", "Trigger", "Started", "Finished", "Records", "New", "Error"
                );
                println!("{}", "-".repeat(90));
                for r in &runs {
                    println!(
                        "{:>4} | {:<9} | {:<19} | {:<19} | {:>7} | {:>5} | {}",
                        r.id,
                        r.trigger,
                        r.started_at,
                        r.finished_at.as_deref().unwrap_or("-"),
                        r.records.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
                        r.appended.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
                        truncate(r.error.as_deref().unwrap_or(""), 40),
                    );
                }
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        eprintln!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn build_pipeline(settings: Settings) -> anyhow::Result<Pipeline> {
    let sync = sync::from_command(settings.storage.sync_command.as_deref());
    Pipeline::new(settings, Arc::new(PdfText), sync)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
