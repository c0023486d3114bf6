//! The `{status, message, ...payload}` envelope returned by every endpoint.

use crate::error::ServiceError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::collections::BTreeMap;

pub const STATUS_OK: u16 = 200;
pub const STATUS_ERROR: u16 = 500;

/// Uniform response body. Payload keys are flattened next to `status` and
/// `message`; absent keys are omitted rather than serialized as null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseEnvelope {
    pub status: u16,
    pub message: String,
    #[serde(flatten)]
    pub payload: BTreeMap<String, String>,
}

impl ResponseEnvelope {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_OK,
            message: message.into(),
            payload: BTreeMap::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR,
            message: message.into(),
            payload: BTreeMap::new(),
        }
    }

    /// Add a payload entry.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_payload<K, V>(mut self, entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.payload
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK
    }
}

impl From<ServiceError> for ResponseEnvelope {
    fn from(err: ServiceError) -> Self {
        ResponseEnvelope::error(err.to_string())
    }
}

impl<T> From<Result<T, ServiceError>> for ResponseEnvelope
where
    T: Into<ResponseEnvelope>,
{
    fn from(result: Result<T, ServiceError>) -> Self {
        match result {
            Ok(value) => value.into(),
            Err(err) => err.into(),
        }
    }
}

impl IntoResponse for ResponseEnvelope {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_flattened() {
        let envelope = ResponseEnvelope::success("Get output")
            .with("out", "hello\n")
            .with("running", "0");
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["status"], 200);
        assert_eq!(json["message"], "Get output");
        assert_eq!(json["out"], "hello\n");
        assert_eq!(json["running"], "0");
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn errors_become_500_envelopes() {
        let envelope: ResponseEnvelope = ServiceError::AlreadyRunning.into();
        assert_eq!(envelope.status, STATUS_ERROR);
        assert_eq!(envelope.message, "Command is running");
        assert!(envelope.payload.is_empty());
        assert!(!envelope.is_success());
    }
}
