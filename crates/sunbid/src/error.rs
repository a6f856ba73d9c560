use crate::config::ConfigError;
use crate::telemetry::TelemetryError;
use crate::workflows::procurement::router::status_for;
use crate::workflows::procurement::{AuditExportError, ProcurementError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;

/// Process-level failure: startup, serving, and the engine surfaced through one type.
#[derive(Debug)]
pub enum AppError {
    Config(ConfigError),
    Telemetry(TelemetryError),
    Io(std::io::Error),
    Server(axum::Error),
    Procurement(ProcurementError),
    Audit(AuditExportError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(err) => write!(f, "configuration error: {}", err),
            AppError::Telemetry(err) => write!(f, "telemetry error: {}", err),
            AppError::Io(err) => write!(f, "io error: {}", err),
            AppError::Server(err) => write!(f, "server error: {}", err),
            AppError::Procurement(err) => write!(f, "procurement error: {}", err),
            AppError::Audit(err) => write!(f, "audit export error: {}", err),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(err) => Some(err),
            AppError::Telemetry(err) => Some(err),
            AppError::Io(err) => Some(err),
            AppError::Server(err) => Some(err),
            AppError::Procurement(err) => Some(err),
            AppError::Audit(err) => Some(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            AppError::Procurement(err) => (status_for(err.kind()), err.kind().label()),
            AppError::Config(_)
            | AppError::Telemetry(_)
            | AppError::Io(_)
            | AppError::Server(_)
            | AppError::Audit(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        let body = Json(json!({ "error": self.to_string(), "kind": kind }));
        (status, body).into_response()
    }
}

impl From<ConfigError> for AppError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<TelemetryError> for AppError {
    fn from(value: TelemetryError) -> Self {
        Self::Telemetry(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<axum::Error> for AppError {
    fn from(value: axum::Error) -> Self {
        Self::Server(value)
    }
}

impl From<ProcurementError> for AppError {
    fn from(value: ProcurementError) -> Self {
        Self::Procurement(value)
    }
}

impl From<AuditExportError> for AppError {
    fn from(value: AuditExportError) -> Self {
        Self::Audit(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn procurement_errors_keep_their_status() {
        let response =
            AppError::from(ProcurementError::AuctionClosed("auction a1".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = AppError::from(std::io::Error::other("disk full")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
