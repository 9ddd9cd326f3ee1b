use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use dotenv::dotenv;
use tokio_util::sync::CancellationToken;

use trendvid_backend::config::Config;
use trendvid_backend::controllers;
use trendvid_backend::db::Database;
use trendvid_backend::recovery;
use trendvid_backend::workers::{CommandRunner, StageRunner, WorkerPool};
use trendvid_backend::AppState;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()));
        }
    };
    let port = config.port;

    log::info!("Initializing database at {}", config.database_url);
    let db = Database::new(&config.database_url)
        .map_err(|e| std::io::Error::other(format!("Failed to initialize database: {}", e)))?;
    let db = Arc::new(db);

    // Nothing is running yet, so every processing row and lock is orphaned
    if let Err(e) = recovery::recover_stale_processing_jobs(&db) {
        log::error!("[RECOVERY] Startup recovery failed: {}", e);
    }

    std::fs::create_dir_all(&config.tasks_dir)?;

    let state = web::Data::new(AppState::build(config, db));
    let shutdown = CancellationToken::new();
    let mut background = Vec::new();

    if state.config.workers_enabled {
        let runner: Arc<dyn StageRunner> = Arc::new(CommandRunner::new(
            &state.config,
            state.registry.clone(),
            state.tokens.clone(),
        ));
        background.extend(WorkerPool::spawn_all(
            state.queue.clone(),
            state.registry.clone(),
            runner,
            Duration::from_secs(state.config.poll_interval_secs),
            shutdown.clone(),
        ));
        log::info!("Started {} stage workers", background.len());
    } else {
        log::info!("Stage workers disabled (WORKERS_ENABLED=false)");
    }

    if state.config.health_check_interval_minutes > 0 {
        let checker = state.health_checker.clone();
        let interval = Duration::from_secs(state.config.health_check_interval_minutes * 60);
        let token = shutdown.clone();
        background.push(tokio::spawn(async move {
            checker.run_periodic(interval, token).await;
        }));
    }

    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Shutdown requested, stopping workers");
            ctrl_c_token.cancel();
        }
    });

    log::info!("Starting TrendVid backend on port {}", port);

    let app_state = state.clone();
    let result = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(Logger::default())
            .wrap(cors)
            .configure(controllers::health::config)
            .configure(controllers::tasks::config)
            .configure(controllers::queue::config)
            .configure(controllers::automation::config)
            .configure(controllers::admin::config)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await;

    shutdown.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            log::warn!("Background task ended abnormally: {}", e);
        }
    }

    result
}
