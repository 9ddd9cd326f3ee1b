//! Queue API endpoints
//!
//! Read access to the pipeline queue plus cancellation of waiting rows.

use std::str::FromStr;

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use serde::{Deserialize, Serialize};

use super::error_response;
use crate::error::Error;
use crate::middleware::session_auth::validate_request;
use crate::models::{PipelineStage, QueueFilter, QueueSummary, QueueTask, TaskState};
use crate::AppState;

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 500;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/queue")
            .route("", web::get().to(list_queue))
            .route("/summary", web::get().to(get_summary))
            .route("/health", web::get().to(get_health))
            .route("/{task_id}", web::get().to(get_queue_task))
            .route("/{task_id}/cancel", web::post().to(cancel_task)),
    );
}

/// Response for listing the queue
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    success: bool,
    tasks: Vec<QueueTask>,
    total: usize,
    waiting_count: usize,
    processing_count: usize,
    completed_count: usize,
    failed_count: usize,
}

/// Response for a single queue row
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueTaskResponse {
    success: bool,
    task: QueueTask,
    /// Waiting rows of the same stage ahead of this one
    position: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    success: bool,
    summary: QueueSummary,
}

#[derive(Debug, Deserialize)]
pub struct CancelParams {
    #[serde(rename = "type")]
    stage: Option<String>,
}

async fn list_queue(
    state: web::Data<AppState>,
    req: HttpRequest,
    query: web::Query<QueueFilter>,
) -> impl Responder {
    if let Err(resp) = validate_request(&state, &req) {
        return resp;
    }

    let mut filter = query.into_inner();
    filter.limit = Some(filter.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT));

    let tasks = match state.queue.get_queue(&filter) {
        Ok(tasks) => tasks,
        Err(e) => return error_response(&e),
    };

    let count = |s: TaskState| tasks.iter().filter(|t| t.state == s).count();
    let response = ListResponse {
        success: true,
        total: tasks.len(),
        waiting_count: count(TaskState::Waiting),
        processing_count: count(TaskState::Processing),
        completed_count: count(TaskState::Completed),
        failed_count: count(TaskState::Failed),
        tasks,
    };

    HttpResponse::Ok().json(response)
}

async fn get_summary(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    if let Err(resp) = validate_request(&state, &req) {
        return resp;
    }

    match state.queue.get_summary() {
        Ok(summary) => HttpResponse::Ok().json(SummaryResponse {
            success: true,
            summary,
        }),
        Err(e) => error_response(&e),
    }
}

async fn get_health(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    if let Err(resp) = validate_request(&state, &req) {
        return resp;
    }

    match state.queue.get_health_status() {
        Ok(health) => HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "health": health
        })),
        Err(e) => error_response(&e),
    }
}

async fn get_queue_task(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> impl Responder {
    if let Err(resp) = validate_request(&state, &req) {
        return resp;
    }

    let task_id = path.into_inner();
    let task = match state.queue.get_task(&task_id) {
        Ok(Some(task)) => task,
        Ok(None) => return error_response(&Error::not_found("Task in queue", task_id)),
        Err(e) => return error_response(&e),
    };

    match state.queue.get_position(&task_id) {
        Ok(position) => HttpResponse::Ok().json(QueueTaskResponse {
            success: true,
            task,
            position,
        }),
        Err(e) => error_response(&e),
    }
}

async fn cancel_task(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    query: web::Query<CancelParams>,
) -> impl Responder {
    if let Err(resp) = validate_request(&state, &req) {
        return resp;
    }

    let task_id = path.into_inner();
    let stage = match query.stage.as_deref().map(PipelineStage::from_str) {
        None => None,
        Some(Ok(stage)) => Some(stage),
        Some(Err(_)) => {
            return error_response(&Error::validation(format!(
                "Invalid type: {}",
                query.stage.as_deref().unwrap_or_default()
            )));
        }
    };

    let current = match state.queue.get_task(&task_id) {
        Ok(Some(task)) => task,
        Ok(None) => return error_response(&Error::not_found("Task in queue", task_id)),
        Err(e) => return error_response(&e),
    };

    match state.queue.cancel(&task_id, stage) {
        Ok(true) => HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "taskId": task_id,
            "message": "Task cancelled"
        })),
        Ok(false) => error_response(&Error::validation(format!(
            "Only waiting tasks can be cancelled (current: {} / {})",
            current.stage, current.state
        ))),
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::test_support::{self, AUTH};
    use actix_web::{http::StatusCode, test, App};
    use serde_json::{json, Value};

    #[actix_web::test]
    async fn test_list_and_position() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_support::state(dir.path());
        let first = state.queue.create_pipeline("u1", &json!({})).unwrap();
        let second = state.queue.create_pipeline("u2", &json!({})).unwrap();
        let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;

        let req = test::TestRequest::get()
            .uri("/api/queue?status=waiting")
            .insert_header(AUTH)
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["total"], 2);
        assert_eq!(body["waitingCount"], 2);

        let req = test::TestRequest::get()
            .uri("/api/queue?userId=u2")
            .insert_header(AUTH)
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["tasks"][0]["taskId"], second.as_str());

        let req = test::TestRequest::get()
            .uri(&format!("/api/queue/{}", first))
            .insert_header(AUTH)
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["task"]["type"], "script");
        assert_eq!(body["position"], 0);

        let req = test::TestRequest::get()
            .uri("/api/queue/summary")
            .insert_header(AUTH)
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["summary"]["script"]["waiting"], 2);

        let req = test::TestRequest::get()
            .uri("/api/queue/health")
            .insert_header(AUTH)
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["health"]["healthy"], true);
    }

    #[actix_web::test]
    async fn test_cancel_waiting_only() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_support::state(dir.path());
        let task_id = state.queue.create_pipeline("u1", &json!({})).unwrap();
        let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/queue/missing/cancel")
            .insert_header(AUTH)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::post()
            .uri(&format!("/api/queue/{}/cancel?type=image", task_id))
            .insert_header(AUTH)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri(&format!("/api/queue/{}/cancel", task_id))
            .insert_header(AUTH)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let row = state.queue.get_task(&task_id).unwrap().unwrap();
        assert_eq!(row.state, TaskState::Failed);
        assert_eq!(row.error.as_deref(), Some("Cancelled by user"));

        let req = test::TestRequest::post()
            .uri(&format!("/api/queue/{}/cancel", task_id))
            .insert_header(AUTH)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
