use crate::hub::HubError;
use crate::templates;
use actix_web::http::{header, StatusCode};
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error("feed store error: {0}")]
    Hub(#[from] HubError),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

impl AppError {
    fn title(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "Bad request",
            AppError::NotFound => "Not found",
            AppError::ServiceUnavailable(_) => "Service unavailable",
            _ => "Something went wrong",
        }
    }

    /// Text safe to show to a browser.
    fn public_detail(&self) -> String {
        match self {
            AppError::BadRequest(msg) => msg.clone(),
            AppError::NotFound => {
                "Nothing here. Feeds disappear once their history expires.".to_string()
            }
            _ => "The server could not complete this request. Please try again later.".to_string(),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Hub(_)
            | AppError::Config(_)
            | AppError::StartServer(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "request failed");
        }
        HttpResponse::build(status)
            .insert_header((header::CONTENT_TYPE, "text/html; charset=utf-8"))
            .body(templates::error_page(status, self.title(), &self.public_detail()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::MessageBody;

    #[test]
    fn statuses_follow_error_kind() {
        assert_eq!(AppError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        let store = AppError::from(HubError::MalformedEntry {
            entry_id: "1-0".into(),
            reason: "missing field".into(),
        });
        assert_eq!(store.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn internal_details_stay_out_of_the_page() {
        let err = AppError::from(HubError::MalformedEntry {
            entry_id: "1-0".into(),
            reason: "secret internals".into(),
        });
        let body = err.error_response().into_body().try_into_bytes().unwrap();
        let page = String::from_utf8(body.to_vec()).unwrap();
        assert!(page.contains("500"));
        assert!(!page.contains("secret internals"));
    }
}
