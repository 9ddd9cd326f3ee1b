//! Background pipeline workers
//!
//! - runner.rs: how a stage is executed (external script by default)
//! - worker.rs: polling loop per stage + pool

mod runner;
mod worker;

pub use runner::{extract_youtube_url, CommandRunner, StageContext, StageOutput, StageRunner};
pub use worker::{StageWorker, WorkerPool};
