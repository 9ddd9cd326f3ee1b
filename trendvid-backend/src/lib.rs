//! trendvid-backend: queue, workers and admin API of the video content pipeline

pub mod artifacts;
pub mod config;
pub mod controllers;
pub mod db;
pub mod error;
pub mod health;
pub mod http_retry;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod workers;
pub mod youtube;

use std::sync::Arc;

use config::Config;
use db::Database;
use health::QueueHealthChecker;
use jobs::JobRegistry;
use queue::QueueManager;
use retry::RetryService;
use youtube::TokenRefresher;

pub struct AppState {
    pub db: Arc<Database>,
    pub config: Config,
    pub queue: Arc<QueueManager>,
    pub registry: Arc<JobRegistry>,
    pub retry: Arc<RetryService>,
    pub health_checker: Arc<QueueHealthChecker>,
    pub tokens: Option<Arc<TokenRefresher>>,
}

impl AppState {
    /// Wire the services around an opened database
    pub fn build(config: Config, db: Arc<Database>) -> Self {
        let queue = Arc::new(QueueManager::new(
            db.clone(),
            config.tasks_dir.clone(),
            config.lock_timeout_minutes,
        ));
        let retry = Arc::new(RetryService::new(
            queue.clone(),
            config.tasks_dir.clone(),
            config.zombie_threshold_minutes,
        ));
        let health_checker = Arc::new(QueueHealthChecker::new(db.clone(), config.tasks_dir.clone()));
        let tokens = config
            .youtube
            .clone()
            .map(|creds| Arc::new(TokenRefresher::new(creds)));

        Self {
            db,
            config,
            queue,
            registry: Arc::new(JobRegistry::new()),
            retry,
            health_checker,
            tokens,
        }
    }
}
