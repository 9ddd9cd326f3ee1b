//! Automation API endpoints
//!
//! Retry, stop and bulk cleanup of pipeline tasks.

use std::str::FromStr;

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use super::error_response;
use crate::db::time::minutes_ago;
use crate::db::DeleteCounts;
use crate::error::Error;
use crate::jobs;
use crate::middleware::session_auth::validate_request;
use crate::models::PipelineStage;
use crate::retry::RetryError;
use crate::AppState;

/// Open attempts older than this are failed by `POST /cleanup`
const STALE_ATTEMPT_MINUTES: i64 = 10;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/automation")
            .route("/retry", web::post().to(retry_task))
            .route("/stop", web::post().to(stop_task))
            .route("/cleanup", web::delete().to(delete_all_tasks))
            .route("/cleanup", web::post().to(fail_stale_attempts)),
    );
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequest {
    task_id: Option<String>,
    #[serde(default)]
    preview: bool,
    force_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    title_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupParams {
    user_id: Option<String>,
}

async fn retry_task(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<RetryRequest>,
) -> impl Responder {
    if let Err(resp) = validate_request(&state, &req) {
        return resp;
    }

    let Some(task_id) = body.task_id.as_deref().filter(|id| !id.is_empty()) else {
        return error_response(&Error::validation("taskId is required"));
    };

    let force_stage = match body.force_type.as_deref().map(PipelineStage::from_str) {
        None => None,
        Some(Ok(stage)) => Some(stage),
        Some(Err(_)) => {
            return error_response(&Error::validation(
                "forceType must be one of script, image, video, youtube",
            ));
        }
    };

    match state.retry.retry(task_id, body.preview, force_stage) {
        Ok(outcome) => HttpResponse::Ok().json(json!({
            "success": true,
            "result": outcome
        })),
        Err(RetryError::Rejected(rejection)) => HttpResponse::BadRequest().json(json!({
            "success": false,
            "error": rejection.message,
            "currentType": rejection.current_type,
            "currentStatus": rejection.current_status,
            "minutesElapsed": rejection.minutes_elapsed
        })),
        Err(RetryError::Failed(e)) => error_response(&e),
    }
}

async fn stop_task(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<StopRequest>,
) -> impl Responder {
    if let Err(resp) = validate_request(&state, &req) {
        return resp;
    }

    let Some(task_id) = body.title_id.as_deref().filter(|id| !id.is_empty()) else {
        return error_response(&Error::validation("Title ID is required"));
    };

    match jobs::stop_task(&state.db, &state.registry, &state.config.tasks_dir, task_id).await {
        Ok(result) => HttpResponse::Ok().json(json!({
            "success": true,
            "message": result.message,
            "result": result
        })),
        Err(e) => error_response(&e),
    }
}

/// Delete every task of a user (all users when `userId` is absent)
async fn delete_all_tasks(
    state: web::Data<AppState>,
    req: HttpRequest,
    query: web::Query<CleanupParams>,
) -> impl Responder {
    if let Err(resp) = validate_request(&state, &req) {
        return resp;
    }

    let task_ids = match state.db.list_task_ids(query.user_id.as_deref()) {
        Ok(ids) => ids,
        Err(e) => return error_response(&e.into()),
    };

    let mut total = DeleteCounts::default();
    for task_id in &task_ids {
        state.registry.cancel(task_id);
        match state.db.delete_task_cascade(task_id) {
            Ok(counts) => {
                total.task += counts.task;
                total.queue += counts.queue;
                total.time_log += counts.time_log;
                total.locks_released += counts.locks_released;
                total.content += counts.content;
            }
            Err(e) => return error_response(&e.into()),
        }
    }

    log::info!(
        "[API] Cleanup removed {} tasks (user: {})",
        task_ids.len(),
        query.user_id.as_deref().unwrap_or("all")
    );

    HttpResponse::Ok().json(json!({
        "success": true,
        "deletedTasks": task_ids.len(),
        "deleted": total
    }))
}

/// Fail processing rows whose open attempt is older than ten minutes
async fn fail_stale_attempts(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    if let Err(resp) = validate_request(&state, &req) {
        return resp;
    }

    let cutoff = minutes_ago(Utc::now(), STALE_ATTEMPT_MINUTES);
    let stuck = match state.db.list_stuck_by_time_log(&cutoff) {
        Ok(rows) => rows,
        Err(e) => return error_response(&e.into()),
    };

    let mut cleaned = Vec::new();
    for (task_id, stage) in stuck {
        let error = format!("{} timed out (over {} minutes)", stage.label(), STALE_ATTEMPT_MINUTES);
        match state.queue.fail(&task_id, stage, &error) {
            Ok(true) => cleaned.push(task_id),
            Ok(false) => {}
            Err(e) => return error_response(&e),
        }
    }

    if !cleaned.is_empty() {
        log::warn!("[API] Failed {} stale attempts: {}", cleaned.len(), cleaned.join(", "));
    }

    HttpResponse::Ok().json(json!({
        "success": true,
        "cleaned": cleaned.len(),
        "taskIds": cleaned
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::test_support::{self, AUTH};
    use crate::db::time::now_str;
    use crate::models::{Content, TaskState, Task};
    use actix_web::{http::StatusCode, test, App};
    use serde_json::Value;

    fn seed(state: &AppState, task_id: &str, user_id: &str) {
        let now = now_str();
        state
            .db
            .insert_task(&Task {
                task_id: task_id.to_string(),
                title: "Ocean facts".to_string(),
                prompt_format: None,
                user_id: user_id.to_string(),
                category: None,
                priority: 0,
                created_at: now.clone(),
                updated_at: now.clone(),
            })
            .unwrap();
        state
            .db
            .insert_content(&Content::new(task_id, user_id, "Ocean facts", &now))
            .unwrap();
        state
            .queue
            .enqueue(task_id, PipelineStage::Script, user_id, &json!({}))
            .unwrap();
    }

    #[actix_web::test]
    async fn test_retry_validation_and_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_support::state(dir.path());
        seed(&state, "t1", "u1");
        let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/automation/retry")
            .insert_header(AUTH)
            .set_json(json!({}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/api/automation/retry")
            .insert_header(AUTH)
            .set_json(json!({"taskId": "t1", "forceType": "upload"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/api/automation/retry")
            .insert_header(AUTH)
            .set_json(json!({"taskId": "t1"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["currentStatus"], "waiting");
        assert_eq!(body["currentType"], "script");

        let req = test::TestRequest::post()
            .uri("/api/automation/retry")
            .insert_header(AUTH)
            .set_json(json!({"taskId": "missing"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_forced_retry_and_preview() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_support::state(dir.path());
        seed(&state, "t1", "u1");
        let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/automation/retry")
            .insert_header(AUTH)
            .set_json(json!({"taskId": "t1", "forceType": "video", "preview": true}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["result"]["retryFromType"], "video");
        assert_eq!(
            state.queue.get_task("t1").unwrap().unwrap().stage,
            PipelineStage::Script
        );

        let req = test::TestRequest::post()
            .uri("/api/automation/retry")
            .insert_header(AUTH)
            .set_json(json!({"taskId": "t1", "forceType": "video"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let row = state.queue.get_task("t1").unwrap().unwrap();
        assert_eq!(row.stage, PipelineStage::Video);
        assert_eq!(row.state, TaskState::Waiting);
    }

    #[actix_web::test]
    async fn test_stop_task() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_support::state(dir.path());
        seed(&state, "t1", "u1");
        let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/automation/stop")
            .insert_header(AUTH)
            .set_json(json!({}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["error"], "Title ID is required");

        let req = test::TestRequest::post()
            .uri("/api/automation/stop")
            .insert_header(AUTH)
            .set_json(json!({"titleId": "t1"}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["result"]["queueCancelled"], 1);

        let row = state.queue.get_task("t1").unwrap().unwrap();
        assert_eq!(row.state, TaskState::Cancelled);

        let req = test::TestRequest::post()
            .uri("/api/automation/stop")
            .insert_header(AUTH)
            .set_json(json!({"titleId": "nope"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_delete_cleanup_by_user() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_support::state(dir.path());
        seed(&state, "t1", "u1");
        seed(&state, "t2", "u1");
        seed(&state, "t3", "u2");
        let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;

        let req = test::TestRequest::delete()
            .uri("/api/automation/cleanup?userId=u1")
            .insert_header(AUTH)
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["deletedTasks"], 2);
        assert_eq!(body["deleted"]["queue"], 2);

        assert!(state.queue.get_task("t1").unwrap().is_none());
        assert!(state.queue.get_task("t3").unwrap().is_some());
    }

    #[actix_web::test]
    async fn test_post_cleanup_fails_stale_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_support::state(dir.path());
        seed(&state, "old", "u1");

        let now = Utc::now();
        state
            .db
            .claim_next(
                PipelineStage::Script,
                1,
                &minutes_ago(now, 30),
                &minutes_ago(now, 60),
            )
            .unwrap();

        let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;
        let req = test::TestRequest::post()
            .uri("/api/automation/cleanup")
            .insert_header(AUTH)
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["cleaned"], 1);

        let row = state.queue.get_task("old").unwrap().unwrap();
        assert_eq!(row.state, TaskState::Failed);
        assert!(state.db.get_lock(PipelineStage::Script).unwrap().map_or(true, |l| !l.is_held()));
    }
}
