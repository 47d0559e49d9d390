mod config;
mod convert;
mod db;
mod extract;
mod fetch;
mod pipeline;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::anyhow;
use clap::{Parser, Subcommand};

use crate::db::EntityType;
use crate::fetch::SyncMode;

#[derive(Parser)]
#[command(name = "oplake", about = "OpenProject to canonical analytics store synchronizer")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,
    /// Collect raw API pages into the raw store
    Fetch {
        /// Ignore the high-water mark and refetch everything
        #[arg(long)]
        full: bool,
        /// Restrict to these entity types (e.g. work_packages,users)
        #[arg(long, value_delimiter = ',')]
        entities: Option<Vec<EntityType>>,
    },
    /// Flatten raw pages into the structural tables
    Extract {
        /// Restrict to these entity types
        #[arg(long, value_delimiter = ',')]
        entities: Option<Vec<EntityType>>,
    },
    /// Rewrite structural rows into the canonical tables
    Convert,
    /// Fetch + extract + convert in sequence under the sync lease
    Run {
        /// Ignore the high-water mark and refetch everything
        #[arg(long)]
        full: bool,
        /// Restrict fetch/extract to these entity types
        #[arg(long, value_delimiter = ',')]
        entities: Option<Vec<EntityType>>,
        #[arg(long)]
        skip_fetch: bool,
        #[arg(long)]
        skip_extract: bool,
        #[arg(long)]
        skip_convert: bool,
    },
    /// Per-layer row counts and staleness for this connection
    Stats,
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
    let cfg = config::Config::load(&cli.config)?;
    let conn = db::connect(&cfg.db_path)?;
    db::init_schema(&conn)?;

    let result = match cli.command {
        Commands::Init => {
            println!("Initialized schema at {}", cfg.db_path);
            Ok(())
        }
        Commands::Fetch { full, entities } => {
            let opts = pipeline::RunOptions {
                mode: if full { SyncMode::Full } else { SyncMode::Incremental },
                entities,
                skip_extract: true,
                skip_convert: true,
                ..Default::default()
            };
            let report = pipeline::run(&conn, &cfg, &opts).await?;
            report.print();
            exit_code(report)
        }
        Commands::Extract { entities } => {
            let opts = pipeline::RunOptions {
                entities,
                skip_fetch: true,
                skip_convert: true,
                ..Default::default()
            };
            let report = pipeline::run(&conn, &cfg, &opts).await?;
            report.print();
            exit_code(report)
        }
        Commands::Convert => {
            let opts = pipeline::RunOptions {
                skip_fetch: true,
                skip_extract: true,
                ..Default::default()
            };
            let report = pipeline::run(&conn, &cfg, &opts).await?;
            report.print();
            exit_code(report)
        }
        Commands::Run { full, entities, skip_fetch, skip_extract, skip_convert } => {
            let opts = pipeline::RunOptions {
                mode: if full { SyncMode::Full } else { SyncMode::Incremental },
                entities,
                skip_fetch,
                skip_extract,
                skip_convert,
            };
            let report = pipeline::run(&conn, &cfg, &opts).await?;
            report.print();
            exit_code(report)
        }
        Commands::Stats => {
            print_stats(&conn, &cfg)?;
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn exit_code(report: pipeline::RunReport) -> anyhow::Result<()> {
    if report.ok() {
        Ok(())
    } else {
        Err(anyhow!("sync run finished with failures"))
    }
}

fn print_stats(conn: &rusqlite::Connection, cfg: &config::Config) -> anyhow::Result<()> {
    println!("Connection {} ({})", cfg.connection_id, cfg.base_url);
    println!(
        "{:<14} | {:>9} | {:>6} | {:>9} | {}",
        "entity", "raw pages", "errors", "tool rows", "last fetched"
    );
    println!("{}", "-".repeat(70));
    for s in db::entity_stats(conn, cfg.connection_id)? {
        println!(
            "{:<14} | {:>9} | {:>6} | {:>9} | {}",
            s.entity.as_str(),
            s.raw_pages,
            s.raw_errors,
            s.tool_rows,
            s.last_fetched_at.as_deref().unwrap_or("-"),
        );
    }

    let d = db::domain_stats(conn, convert::SOURCE_TAG, cfg.connection_id)?;
    println!("\nCanonical rows:");
    println!("  issues:    {}", d.issues);
    println!("  boards:    {}", d.boards);
    println!("  accounts:  {}", d.accounts);
    println!("  sprints:   {}", d.sprints);
    println!("  worklogs:  {}", d.worklogs);
    Ok(())
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
