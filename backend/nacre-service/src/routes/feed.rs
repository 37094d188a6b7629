use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::templates;
use actix_web::{get, http::header, web, HttpResponse};

fn feed_id(raw: &str) -> AppResult<&str> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(AppError::BadRequest("missing feed id".into()));
    }
    Ok(id)
}

/// Live view: a terminal page that subscribes over `/websocket`.
#[get("/feed/{id}")]
pub async fn live_view(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let id = feed_id(&path)?;
    if !state.hub.feed_exists(id).await? {
        return Err(AppError::NotFound);
    }
    Ok(HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/html; charset=utf-8"))
        .body(templates::feed_page(&state.base_url, id)))
}

/// Full history snapshot as raw text.
#[get("/plaintext/{id}")]
pub async fn plaintext(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let id = feed_id(&path)?;
    if !state.hub.feed_exists(id).await? {
        return Err(AppError::NotFound);
    }
    let entries = state.hub.get_all(id).await?;
    let body: Vec<u8> = entries.iter().flat_map(|chunk| chunk.iter().copied()).collect();
    Ok(HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/plain; charset=utf-8"))
        .insert_header((header::X_CONTENT_TYPE_OPTIONS, "nosniff"))
        .body(body))
}
