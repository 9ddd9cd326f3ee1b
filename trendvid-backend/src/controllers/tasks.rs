//! Task API endpoints
//!
//! A task is created together with its content record, generation settings
//! and a waiting queue row at the script stage.

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use serde::Deserialize;
use serde_json::json;

use super::error_response;
use crate::artifacts;
use crate::db::time::now_str;
use crate::error::Error;
use crate::middleware::session_auth::validate_request;
use crate::models::{Content, ContentSetting, ContentStatus, CreateTaskRequest, PipelineStage, Task};
use crate::queue::new_task_id;
use crate::AppState;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/tasks")
            .route("", web::post().to(create_task))
            .route("", web::get().to(list_tasks))
            .route("/{task_id}", web::get().to(get_task))
            .route("/{task_id}", web::delete().to(delete_task)),
    );
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    user_id: Option<String>,
    limit: Option<u32>,
}

async fn create_task(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<CreateTaskRequest>,
) -> impl Responder {
    if let Err(resp) = validate_request(&state, &req) {
        return resp;
    }

    let body = body.into_inner();
    let title = body.title.trim().to_string();
    if title.is_empty() || body.user_id.trim().is_empty() {
        return error_response(&Error::validation("title and userId are required"));
    }

    let task_id = new_task_id();
    let now = now_str();
    let db = &state.db;

    let task = Task {
        task_id: task_id.clone(),
        title: title.clone(),
        prompt_format: body.prompt_format.clone(),
        user_id: body.user_id.clone(),
        category: body.category.clone(),
        priority: body.priority.unwrap_or(0),
        created_at: now.clone(),
        updated_at: now.clone(),
    };

    let mut content = Content::new(&task_id, &body.user_id, &title, &now);
    content.status = ContentStatus::PENDING.to_string();
    content.youtube_channel = body.youtube_channel.clone();
    content.prompt_format = body.prompt_format.clone();
    content.product_info = body.product_info.clone();
    content.category = body.category.clone();

    let mut setting = ContentSetting::defaults(&task_id);
    if let Some(mode) = body.script_mode.clone() {
        setting.script_mode = mode;
    }
    if let Some(mode) = body.media_mode.clone() {
        setting.media_mode = mode;
    }
    if let Some(voice) = body.tts_voice.clone() {
        setting.tts_voice = voice;
    }
    setting.channel = body.youtube_channel.clone();
    setting.priority = task.priority;
    setting.settings = body.settings.as_ref().map(|s| s.to_string());

    let mut metadata = body.metadata.clone().unwrap_or_else(|| json!({}));
    if let Some(obj) = metadata.as_object_mut() {
        obj.entry("title").or_insert_with(|| json!(title));
        if let Some(format) = &body.prompt_format {
            obj.entry("promptFormat").or_insert_with(|| json!(format));
        }
    }

    let created = std::fs::create_dir_all(artifacts::task_folder(&state.config.tasks_dir, &task_id))
        .map_err(Error::from)
        .and_then(|_| {
            db.create_task_bundle(&task, &content, &setting, PipelineStage::Script, &metadata)
                .map_err(Error::from)
        });

    if let Err(e) = created {
        return error_response(&e);
    }

    log::info!("[API] Created task {} ({})", task_id, title);
    HttpResponse::Created().json(json!({
        "success": true,
        "taskId": task_id,
        "task": task
    }))
}

async fn list_tasks(
    state: web::Data<AppState>,
    req: HttpRequest,
    query: web::Query<ListParams>,
) -> impl Responder {
    if let Err(resp) = validate_request(&state, &req) {
        return resp;
    }

    let limit = query.limit.unwrap_or(50).min(500);
    match state.db.list_tasks(query.user_id.as_deref(), limit) {
        Ok(tasks) => HttpResponse::Ok().json(json!({
            "success": true,
            "total": tasks.len(),
            "tasks": tasks
        })),
        Err(e) => error_response(&e.into()),
    }
}

async fn get_task(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> impl Responder {
    if let Err(resp) = validate_request(&state, &req) {
        return resp;
    }

    let task_id = path.into_inner();
    let db = &state.db;

    let loaded = (|| -> crate::error::Result<_> {
        Ok((
            db.get_task_by_id(&task_id)?,
            db.get_content(&task_id)?,
            db.get_content_setting(&task_id)?,
            state.queue.get_task(&task_id)?,
            db.list_time_logs(&task_id)?,
        ))
    })();

    match loaded {
        Ok((None, _, _, None, _)) => error_response(&Error::not_found("Task", task_id)),
        Ok((task, content, setting, queue, time_logs)) => HttpResponse::Ok().json(json!({
            "success": true,
            "task": task,
            "content": content,
            "settings": setting,
            "queue": queue,
            "timeLogs": time_logs,
            "running": state.registry.get(&task_id)
        })),
        Err(e) => error_response(&e),
    }
}

async fn delete_task(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> impl Responder {
    if let Err(resp) = validate_request(&state, &req) {
        return resp;
    }

    let task_id = path.into_inner();
    if state.registry.cancel(&task_id).is_some() {
        log::info!("[API] Cancelled running job of {} before delete", task_id);
    }

    match state.db.delete_task_cascade(&task_id) {
        Ok(counts) if counts.task == 0 && counts.queue == 0 => {
            error_response(&Error::not_found("Task", task_id))
        }
        Ok(counts) => {
            log::info!("[API] Deleted task {}: {:?}", task_id, counts);
            HttpResponse::Ok().json(json!({
                "success": true,
                "taskId": task_id,
                "deleted": counts
            }))
        }
        Err(e) => error_response(&e.into()),
    }
}
