use axum::{
    Json,
    body::Body,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PackageError, PluginError};
use crate::plugin::descriptor::{CapabilityDeclaration, FALLBACK_LOCALE};
use crate::plugin::record::PluginRecord;

#[derive(Debug, Serialize)]
pub struct PluginResponse {
    pub plugin_id: String,
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub plugin_type: String,
    pub state: String,
    pub enabled: bool,
    pub author: Option<String>,
    pub description: Option<String>,
    pub capabilities: Vec<CapabilityDeclaration>,
    pub source_reference: String,
    pub content_hash: String,
    pub created_by: String,
    pub last_error: Option<String>,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PluginResponse {
    pub fn from_record(record: &PluginRecord, locale: Option<&str>) -> Self {
        Self {
            plugin_id: record.plugin_id.clone(),
            name: record.name.clone(),
            version: record.version.clone(),
            plugin_type: record.plugin_type.to_string(),
            state: record.state.to_string(),
            enabled: record.is_enabled(),
            author: record.author.clone(),
            description: record
                .description(locale.unwrap_or(FALLBACK_LOCALE))
                .map(str::to_string),
            capabilities: record.capabilities.clone(),
            source_reference: record.source_reference.clone(),
            content_hash: record.content_hash.clone(),
            created_by: record.created_by.clone(),
            last_error: record.last_error.clone(),
            installed_at: record.installed_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PluginListResponse {
    pub plugins: Vec<PluginResponse>,
}

#[derive(Debug, Deserialize)]
pub struct PluginQuery {
    /// Plugin type filter, e.g. `model-provider`
    #[serde(rename = "type")]
    pub plugin_type: Option<String>,
    pub locale: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LocaleQuery {
    pub locale: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CapabilityQuery {
    /// Capability type filter, e.g. `model`
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InvokeRequest {
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Serialize)]
pub struct InvokeResponse {
    pub capability: String,
    pub output: Value,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn internal(e: impl std::fmt::Display) -> Response<Body> {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(Self::new("INTERNAL", e.to_string())),
        )
            .into_response()
    }

    pub fn not_found(message: impl Into<String>) -> Response<Body> {
        (StatusCode::NOT_FOUND, Json(Self::new("NOT_FOUND", message))).into_response()
    }

    pub fn bad_request(message: impl Into<String>) -> Response<Body> {
        (StatusCode::BAD_REQUEST, Json(Self::new("BAD_REQUEST", message))).into_response()
    }

    pub fn from_plugin_error(err: &PluginError) -> Response<Body> {
        let body = Self {
            code: error_code(err).to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        };
        (status_for(err), Json(body)).into_response()
    }
}

/// HTTP status for each error kind. Parse, state and lookup failures stay
/// distinct so clients can tell them apart.
pub fn status_for(err: &PluginError) -> StatusCode {
    match err {
        PluginError::Descriptor(_) | PluginError::IdentityMismatch { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        PluginError::NotFound { .. } => StatusCode::NOT_FOUND,
        PluginError::InvalidState { .. } | PluginError::CapabilityConflict { .. } => {
            StatusCode::CONFLICT
        }
        PluginError::Activation { .. } | PluginError::Invocation { .. } => StatusCode::BAD_GATEWAY,
        PluginError::Storage { .. } | PluginError::Unavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        PluginError::Package {
            source: PackageError::TooLarge { .. },
            ..
        } => StatusCode::PAYLOAD_TOO_LARGE,
        PluginError::Package { .. } => StatusCode::BAD_GATEWAY,
        PluginError::Cancelled { .. } => StatusCode::BAD_REQUEST,
    }
}

fn error_code(err: &PluginError) -> &'static str {
    match err {
        PluginError::Descriptor(e) => e.kind.as_str(),
        PluginError::NotFound { .. } => "NOT_FOUND",
        PluginError::InvalidState { .. } => "INVALID_STATE",
        PluginError::Storage { .. } => "STORAGE",
        PluginError::Activation { .. } => "ACTIVATION",
        PluginError::Package { .. } => "PACKAGE",
        PluginError::CapabilityConflict { .. } => "CAPABILITY_CONFLICT",
        PluginError::IdentityMismatch { .. } => "IDENTITY_MISMATCH",
        PluginError::Unavailable(_) => "UNAVAILABLE",
        PluginError::Invocation { .. } => "INVOCATION",
        PluginError::Cancelled { .. } => "CANCELLED",
    }
}
