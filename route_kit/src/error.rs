use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::request::RouteRequest;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while declaring controllers or assembling a router.
///
/// These are programmer errors: they abort bootstrap and are never turned
/// into HTTP responses.
#[derive(Error, Debug)]
pub enum Error {
    #[error("class {0} is not a controller")]
    NotAController(&'static str),
    #[error("failed to instantiate controller {name}: {source}")]
    Instantiate {
        name: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("Schema Error: {0}")]
    Schema(String),
    #[error("Config Error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Where a request error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Raised explicitly with a status, e.g. `HttpError::new("Not found", 404)`.
    Http,
    /// Request section rejected by a validation middleware.
    Validation,
    /// Any other failure converted from a handler or middleware.
    Handler,
    /// The handler future was dropped before it completed.
    Cancelled,
}

/// An error travelling through the request error channel.
///
/// Every such error ends up as a JSON body `{message, status, ...data}`
/// unless a controller error handler answers it first.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct HttpError {
    message: String,
    status: Option<StatusCode>,
    data: Option<Map<String, Value>>,
    kind: ErrorKind,
    #[source]
    source: Option<BoxError>,
}

impl HttpError {
    /// An error carrying an HTTP status; codes outside `100..=999` leave it unset.
    pub fn new(message: impl Into<String>, status: u16) -> Self {
        Self {
            message: message.into(),
            status: StatusCode::from_u16(status).ok(),
            data: None,
            kind: ErrorKind::Http,
            source: None,
        }
    }

    pub fn with_status(message: impl Into<String>, status: StatusCode) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
            data: None,
            kind: ErrorKind::Http,
            source: None,
        }
    }

    /// An error without a status of its own; rendered as 500.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            data: None,
            kind: ErrorKind::Handler,
            source: None,
        }
    }

    pub fn from_error<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: error.to_string(),
            status: None,
            data: None,
            kind: ErrorKind::Handler,
            source: Some(Box::new(error)),
        }
    }

    pub(crate) fn validation(message: String, status: StatusCode, data: Map<String, Value>) -> Self {
        Self {
            message,
            status: Some(status),
            data: Some(data),
            kind: ErrorKind::Validation,
            source: None,
        }
    }

    pub(crate) fn cancelled(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: Some(StatusCode::REQUEST_TIMEOUT),
            data: None,
            kind: ErrorKind::Cancelled,
            source: None,
        }
    }

    /// Extra fields merged into the top level of the JSON error body.
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The status the error was raised with, if any.
    pub fn status_code(&self) -> Option<StatusCode> {
        self.status
    }

    /// The status used on the wire.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn data(&self) -> Option<&Map<String, Value>> {
        self.data.as_ref()
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The `{message, status, ...data}` body of the default error response.
    pub fn to_json(&self) -> Value {
        let mut body = Map::new();
        body.insert("message".into(), Value::String(self.message.clone()));
        body.insert("status".into(), Value::from(self.status().as_u16()));
        if let Some(data) = &self.data {
            for (key, value) in data {
                body.insert(key.clone(), value.clone());
            }
        }
        Value::Object(body)
    }
}

impl From<anyhow::Error> for HttpError {
    fn from(error: anyhow::Error) -> Self {
        Self {
            message: error.to_string(),
            status: None,
            data: None,
            kind: ErrorKind::Handler,
            source: Some(error.into()),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (self.status(), axum::Json(self.to_json())).into_response()
    }
}

/// What a controller error handler did with an error.
pub enum ErrorOutcome {
    /// The handler answered the request.
    Respond(Response),
    /// The handler passed the error on to the next handler in line.
    Forward(HttpError),
}

pub type ErrorHandler = Arc<dyn Fn(HttpError, &RouteRequest) -> ErrorOutcome + Send + Sync>;

/// Wraps a closure as an [`ErrorHandler`].
pub fn error_handler<F>(f: F) -> ErrorHandler
where
    F: Fn(HttpError, &RouteRequest) -> ErrorOutcome + Send + Sync + 'static,
{
    Arc::new(f)
}

/// The handler installed by `catch(None)`: answers with the default JSON body.
pub fn default_error_handler() -> ErrorHandler {
    error_handler(|err, _| ErrorOutcome::Respond(err.into_response()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_body_carries_message_and_status() {
        let err = HttpError::new("Test error", 400);
        assert_eq!(err.to_json(), json!({"message": "Test error", "status": 400}));
        assert_eq!(err.kind(), ErrorKind::Http);
    }

    #[test]
    fn missing_status_renders_as_500() {
        let err = HttpError::internal("boom");
        assert_eq!(err.status_code(), None);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_json()["status"], 500);
    }

    #[test]
    fn data_is_merged_at_top_level() {
        let mut data = Map::new();
        data.insert("errors".into(), json!([{"path": "/name", "message": "too short"}]));
        let err = HttpError::new("Validation failed for body", 422).with_data(data);
        let body = err.to_json();
        assert_eq!(body["status"], 422);
        assert_eq!(body["errors"][0]["path"], "/name");
    }

    #[test]
    fn anyhow_errors_keep_their_message() {
        let err: HttpError = anyhow::anyhow!("disk on fire").into();
        assert_eq!(err.message(), "disk on fire");
        assert_eq!(err.kind(), ErrorKind::Handler);
    }
}
