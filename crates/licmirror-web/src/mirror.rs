//! Handlers over the local mirror tables and the audit log.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use licmirror_core::{PagedResult, SourceKind};
use licmirror_storage::AuditEntry;
use licmirror_sync::{ReconcileReport, XLSX_CONTENT_TYPE};
use serde_json::Value as JsonValue;

use crate::{AppError, AppState};

pub(crate) async fn list_items(
    state: &AppState,
    kind: SourceKind,
    params: &BTreeMap<String, String>,
) -> Result<Json<PagedResult<JsonValue>>, AppError> {
    Ok(Json(state.service.query(kind, params).await?))
}

pub(crate) async fn export_items(
    state: &AppState,
    kind: SourceKind,
    params: &BTreeMap<String, String>,
) -> Result<Response, AppError> {
    let file = state.service.export(kind, params).await?;
    Ok((
        [
            (header::CONTENT_TYPE, XLSX_CONTENT_TYPE.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file.file_name),
            ),
        ],
        file.bytes,
    )
        .into_response())
}

pub(crate) async fn sync_source(
    state: &AppState,
    kind: SourceKind,
) -> Result<Json<ReconcileReport>, AppError> {
    Ok(Json(state.service.sync(kind).await?))
}

pub(crate) async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<PagedResult<AuditEntry>>, AppError> {
    Ok(Json(state.service.logs(&params).await?))
}
