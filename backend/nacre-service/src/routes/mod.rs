pub mod feed;
pub mod health;
pub mod home;
pub mod wsroute;

use crate::error::{AppError, AppResult};
use actix_web::{web, HttpResponse};

/// Register every nacre route on an app.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(home::index)
        .service(health::health)
        .service(health::ready)
        .service(feed::live_view)
        .service(feed::plaintext)
        .service(wsroute::ws_handler)
        .default_service(web::to(not_found));
}

async fn not_found() -> AppResult<HttpResponse> {
    Err(AppError::NotFound)
}
