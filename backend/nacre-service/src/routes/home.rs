use crate::state::AppState;
use crate::templates;
use actix_web::{get, http::header, web, HttpResponse};

#[get("/")]
pub async fn index(state: web::Data<AppState>) -> HttpResponse {
    let host = templates::url_host(&state.base_url);
    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/html; charset=utf-8"))
        .body(templates::home_page(&host, state.tcp_port))
}
