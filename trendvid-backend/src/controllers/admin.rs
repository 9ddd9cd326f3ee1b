//! Admin API endpoints: stale-job recovery and on-demand health checks

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use serde::Deserialize;
use serde_json::json;

use super::error_response;
use crate::error::Error;
use crate::health;
use crate::middleware::session_auth::validate_request;
use crate::recovery;
use crate::AppState;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/admin")
            .route("/recover-stale-jobs", web::get().to(recover_stale_jobs))
            .route("/recover-stale-jobs", web::post().to(recover_single_task))
            .route("/health-check", web::post().to(run_health_check))
            .route("/queue/cleanup", web::post().to(cleanup_queue))
            .route("/queue", web::delete().to(clear_queue)),
    );
}

#[derive(Debug, Deserialize)]
pub struct RecoverParams {
    threshold: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CleanupParams {
    days: Option<String>,
}

/// Finished rows older than this many days are removed by default
const DEFAULT_CLEANUP_DAYS: i64 = 7;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverTaskRequest {
    task_id: Option<String>,
}

/// Without `threshold` every processing row is failed; with it only rows
/// idle for more than `threshold` minutes.
async fn recover_stale_jobs(
    state: web::Data<AppState>,
    req: HttpRequest,
    query: web::Query<RecoverParams>,
) -> impl Responder {
    if let Err(resp) = validate_request(&state, &req) {
        return resp;
    }

    let result = match query.threshold.as_deref() {
        None => recovery::recover_stale_processing_jobs(&state.db),
        Some(raw) => match raw.trim().parse::<i64>() {
            Ok(minutes) if minutes > 0 => recovery::recover_stale_jobs_by_time(&state.db, minutes),
            _ => {
                return error_response(&Error::validation("threshold must be a positive number"));
            }
        },
    };

    match result {
        Ok(result) => HttpResponse::Ok().json(json!({
            "success": true,
            "message": format!(
                "Recovered {} contents and {} queue rows",
                result.content_recovered, result.queue_recovered
            ),
            "result": result
        })),
        Err(e) => error_response(&e),
    }
}

async fn recover_single_task(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<RecoverTaskRequest>,
) -> impl Responder {
    if let Err(resp) = validate_request(&state, &req) {
        return resp;
    }

    let Some(task_id) = body.task_id.as_deref().filter(|id| !id.is_empty()) else {
        return error_response(&Error::validation("taskId is required"));
    };

    match recovery::recover_task(&state.db, task_id) {
        Ok(result) => HttpResponse::Ok().json(json!({
            "success": true,
            "message": format!("Task {} recovered", task_id),
            "result": result
        })),
        Err(e) => error_response(&e),
    }
}

async fn run_health_check(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    if let Err(resp) = validate_request(&state, &req) {
        return resp;
    }

    match state.health_checker.check_all() {
        Ok(results) => HttpResponse::Ok().json(json!({
            "success": true,
            "checked": results.len(),
            "fixed": results.iter().filter(|r| r.fixed).count(),
            "report": health::report(&results),
            "results": results
        })),
        Err(e) => error_response(&e),
    }
}

/// Delete completed/failed queue rows finished more than `days` days ago
async fn cleanup_queue(
    state: web::Data<AppState>,
    req: HttpRequest,
    query: web::Query<CleanupParams>,
) -> impl Responder {
    if let Err(resp) = validate_request(&state, &req) {
        return resp;
    }

    let days = match query.days.as_deref() {
        None => DEFAULT_CLEANUP_DAYS,
        Some(raw) => match raw.trim().parse::<i64>() {
            Ok(days) if days > 0 => days,
            _ => return error_response(&Error::validation("days must be a positive number")),
        },
    };

    match state.queue.cleanup(days) {
        Ok(deleted) => HttpResponse::Ok().json(json!({
            "success": true,
            "deleted": deleted,
            "days": days
        })),
        Err(e) => error_response(&e),
    }
}

/// Drop every queue row
async fn clear_queue(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    if let Err(resp) = validate_request(&state, &req) {
        return resp;
    }

    match state.queue.clear_all() {
        Ok(deleted) => HttpResponse::Ok().json(json!({
            "success": true,
            "deleted": deleted
        })),
        Err(e) => error_response(&e),
    }
}
