// Admin token authentication
// Every protected handler calls `validate_request` first and returns the
// error response as-is when it fails.

use actix_web::{HttpRequest, HttpResponse};

use crate::AppState;

pub fn extract_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.trim_start_matches("Bearer ").trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Compare two secrets without stopping at the first differing byte
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for (i, x) in a.iter().enumerate() {
        diff |= usize::from(x ^ b.get(i).copied().unwrap_or(0));
    }
    diff == 0
}

pub fn validate_request(state: &AppState, req: &HttpRequest) -> Result<(), HttpResponse> {
    let token = extract_token(req).ok_or_else(|| {
        HttpResponse::Unauthorized().json(serde_json::json!({
            "success": false,
            "error": "No authorization token provided"
        }))
    })?;

    if constant_time_eq(token.as_bytes(), state.config.secret_key.as_bytes()) {
        Ok(())
    } else {
        log::warn!("[AUTH] Rejected request to {} with invalid token", req.path());
        Err(HttpResponse::Unauthorized().json(serde_json::json!({
            "success": false,
            "error": "Invalid or expired session"
        })))
    }
}
