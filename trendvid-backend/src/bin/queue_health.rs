//! Queue Health Check
//!
//! Compares waiting/processing queue rows with their task folders and fixes
//! mismatches, once or on an interval.
//!
//! Usage:
//!   cargo run --bin queue_health -- --database-url ./.db/trendvid.db --tasks-dir ../trend-video-backend/tasks
//!   cargo run --bin queue_health -- --watch --interval 5

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenv::dotenv;
use tokio_util::sync::CancellationToken;

use trendvid_backend::db::Database;
use trendvid_backend::health::{report, QueueHealthChecker};

#[derive(Debug, Parser)]
#[command(name = "queue_health", about = "Check queue rows against task folders")]
struct Args {
    /// SQLite database path
    #[arg(long, env = "DATABASE_URL", default_value = "./.db/trendvid.db")]
    database_url: String,

    /// Directory holding one folder per task
    #[arg(long, env = "TASKS_DIR", default_value = "../trend-video-backend/tasks")]
    tasks_dir: PathBuf,

    /// Keep running and check every `interval` minutes
    #[arg(long)]
    watch: bool,

    /// Minutes between checks in watch mode
    #[arg(long, default_value_t = 5)]
    interval: u64,
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let db = match Database::new(&args.database_url) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            eprintln!("Failed to open database {}: {}", args.database_url, e);
            std::process::exit(1);
        }
    };
    let checker = QueueHealthChecker::new(db, args.tasks_dir.clone());

    if !args.watch {
        match checker.check_all() {
            Ok(results) => println!("{}", report(&results)),
            Err(e) => {
                eprintln!("Health check failed: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let interval = Duration::from_secs(args.interval.max(1) * 60);
    checker.run_periodic(interval, shutdown).await;
}
