pub mod admin;
pub mod automation;
pub mod health;
pub mod queue;
pub mod tasks;

use actix_web::HttpResponse;

use crate::error::Error;

/// JSON error body with the status code matching the error kind
pub(crate) fn error_response(err: &Error) -> HttpResponse {
    let body = serde_json::json!({
        "success": false,
        "error": err.to_string()
    });

    match err {
        Error::Validation(_) => HttpResponse::BadRequest().json(body),
        Error::NotFound { .. } => HttpResponse::NotFound().json(body),
        Error::Conflict(_) => HttpResponse::Conflict().json(body),
        _ => {
            log::error!("[API] {}", err);
            HttpResponse::InternalServerError().json(body)
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use actix_web::web;

    use crate::config::Config;
    use crate::db::Database;
    use crate::AppState;

    pub const AUTH: (&str, &str) = ("Authorization", "Bearer test-secret");

    pub fn state(root: &std::path::Path) -> web::Data<AppState> {
        let config = Config::for_tests(root);
        let db = Arc::new(Database::new(&config.database_url).unwrap());
        web::Data::new(AppState::build(config, db))
    }
}
