use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{get, web, HttpResponse};

/// Liveness: the process is serving HTTP.
#[get("/health")]
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

/// Readiness: the feed store answers.
#[get("/health/ready")]
pub async fn ready(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    state.hub.health_check().await.map_err(|e| {
        tracing::warn!(error = %e, "readiness probe failed");
        AppError::ServiceUnavailable("feed store unreachable".into())
    })?;
    Ok(HttpResponse::Ok().body("READY"))
}
