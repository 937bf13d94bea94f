use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    MissingConfiguration(String),
    #[error("{name} not found. Available models are: {}.", .available.join(", "))]
    NotFound {
        name: String,
        available: Vec<String>,
    },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("Model is not loaded.")]
    ModelNotLoaded,
    #[error("a model reload is already in progress or generation leases are outstanding")]
    ReloadInProgress,
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("{0}")]
    Generation(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::ModelNotLoaded => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::ReloadInProgress => StatusCode::CONFLICT,
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::MissingConfiguration(_)
            | ServiceError::NotFound { .. }
            | ServiceError::InvalidConfig(_)
            | ServiceError::Tokenizer(_)
            | ServiceError::Generation(_)
            | ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "detail": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_lists_known_models() {
        let err = ServiceError::NotFound {
            name: "missing".into(),
            available: vec!["demo".into(), "llama3".into()],
        };
        assert_eq!(
            err.to_string(),
            "missing not found. Available models are: demo, llama3."
        );
    }

    #[test]
    fn maps_lifecycle_errors_to_statuses() {
        assert_eq!(
            ServiceError::ModelNotLoaded.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ServiceError::ReloadInProgress.status(), StatusCode::CONFLICT);
        assert_eq!(
            ServiceError::Generation("cuda oom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
