use std::future::Future;
use std::sync::Arc;

use aihub_plugin_interface::{CapabilityType, PluginType};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

use crate::error::PluginError;
use crate::plugin::manager::{OperationContext, PluginManager};
use crate::plugin::package::PackageHandle;

use super::AppState;
use super::models::{
    CapabilityQuery, ErrorResponse, InvokeRequest, InvokeResponse, LocaleQuery, PluginListResponse,
    PluginQuery, PluginResponse,
};

const ACTOR_HEADER: &str = "x-actor";

fn context(headers: &HeaderMap) -> OperationContext {
    let actor = headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("api");
    OperationContext::new(actor)
}

/// Run a mutation on its own task so a client hanging up cannot stop it
/// between two writes.
async fn detached<T, F, Fut>(manager: &Arc<PluginManager>, op: F) -> Result<Result<T, PluginError>, Response<Body>>
where
    T: Send + 'static,
    F: FnOnce(Arc<PluginManager>) -> Fut,
    Fut: Future<Output = Result<T, PluginError>> + Send + 'static,
{
    tokio::spawn(op(Arc::clone(manager)))
        .await
        .map_err(ErrorResponse::internal)
}

fn record_response(result: Result<crate::plugin::PluginRecord, PluginError>, status: StatusCode) -> Response<Body> {
    match result {
        Ok(record) => (status, Json(PluginResponse::from_record(&record, None))).into_response(),
        Err(e) => ErrorResponse::from_plugin_error(&e),
    }
}

pub async fn list_plugins(
    State(state): State<AppState>,
    Query(query): Query<PluginQuery>,
) -> impl IntoResponse {
    let records = match query.plugin_type.as_deref() {
        Some(raw) => match raw.parse::<PluginType>() {
            Ok(plugin_type) => state.manager.get_plugins_by_type(plugin_type),
            Err(e) => return ErrorResponse::bad_request(e.to_string()),
        },
        None => state.manager.list_plugins(),
    };

    match records {
        Ok(records) => {
            let locale = query.locale.as_deref();
            let response = PluginListResponse {
                plugins: records
                    .iter()
                    .map(|r| PluginResponse::from_record(r, locale))
                    .collect(),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => ErrorResponse::from_plugin_error(&e),
    }
}

pub async fn get_plugin(
    State(state): State<AppState>,
    Path(plugin_id): Path<String>,
    Query(query): Query<LocaleQuery>,
) -> impl IntoResponse {
    match state.manager.get_plugin(&plugin_id) {
        Ok(record) => (
            StatusCode::OK,
            Json(PluginResponse::from_record(&record, query.locale.as_deref())),
        )
            .into_response(),
        Err(e) => ErrorResponse::from_plugin_error(&e),
    }
}

/// Install from an uploaded package body.
pub async fn install_plugin(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if body.is_empty() {
        return ErrorResponse::bad_request("Request body must contain a plugin package");
    }
    let ctx = context(&headers);
    let package = PackageHandle::from_bytes("upload", body.to_vec());

    match detached(&state.manager, move |m| async move { m.install_plugin(&package, &ctx).await }).await {
        Ok(result) => record_response(result, StatusCode::CREATED),
        Err(response) => response,
    }
}

pub async fn update_plugin(
    State(state): State<AppState>,
    Path(plugin_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if body.is_empty() {
        return ErrorResponse::bad_request("Request body must contain a plugin package");
    }
    let ctx = context(&headers);
    let package = PackageHandle::from_bytes("upload", body.to_vec());

    match detached(&state.manager, move |m| async move {
        m.update_plugin(&plugin_id, &package, &ctx).await
    })
    .await
    {
        Ok(result) => record_response(result, StatusCode::OK),
        Err(response) => response,
    }
}

pub async fn enable_plugin(
    State(state): State<AppState>,
    Path(plugin_id): Path<String>,
) -> impl IntoResponse {
    match detached(&state.manager, move |m| async move { m.enable_plugin(&plugin_id).await }).await {
        Ok(result) => record_response(result, StatusCode::OK),
        Err(response) => response,
    }
}

pub async fn disable_plugin(
    State(state): State<AppState>,
    Path(plugin_id): Path<String>,
) -> impl IntoResponse {
    match detached(&state.manager, move |m| async move { m.disable_plugin(&plugin_id).await }).await {
        Ok(result) => record_response(result, StatusCode::OK),
        Err(response) => response,
    }
}

pub async fn uninstall_plugin(
    State(state): State<AppState>,
    Path(plugin_id): Path<String>,
) -> impl IntoResponse {
    match detached(&state.manager, move |m| async move { m.uninstall_plugin(&plugin_id).await }).await {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(e)) => ErrorResponse::from_plugin_error(&e),
        Err(response) => response,
    }
}

pub async fn list_capabilities(
    State(state): State<AppState>,
    Query(query): Query<CapabilityQuery>,
) -> impl IntoResponse {
    let capabilities = state.manager.capabilities();
    let entries = match query.kind.as_deref() {
        Some(raw) => match raw.parse::<CapabilityType>() {
            Ok(kind) => capabilities.get_by_type(kind),
            Err(e) => return ErrorResponse::bad_request(e.to_string()),
        },
        None => capabilities.get_all(),
    };
    (StatusCode::OK, Json(entries)).into_response()
}

pub async fn get_capability(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.manager.capabilities().get_by_name(&name) {
        Some(entry) => (StatusCode::OK, Json(entry)).into_response(),
        None => ErrorResponse::not_found(format!("Capability '{}' not found", name)),
    }
}

pub async fn invoke_capability(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<InvokeRequest>,
) -> impl IntoResponse {
    match state.manager.invoke(&name, req.input).await {
        Ok(output) => (
            StatusCode::OK,
            Json(InvokeResponse {
                capability: name,
                output,
            }),
        )
            .into_response(),
        Err(e) => ErrorResponse::from_plugin_error(&e),
    }
}
