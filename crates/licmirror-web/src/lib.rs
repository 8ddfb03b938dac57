//! Admin REST API for the license mirror.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{OriginalUri, Query, State},
    http::Method,
    middleware::from_fn_with_state,
    routing::{get, post},
    Json, Router,
};
use licmirror_core::SourceKind;
use licmirror_sync::MirrorService;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::info;

mod error;
mod middleware;
mod mirror;
mod mutations;

pub use error::{AppError, ErrorBody};

pub struct AppState {
    pub service: Arc<MirrorService>,
    /// Expected bearer token; `None` leaves the API open.
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(service: Arc<MirrorService>, admin_token: Option<String>) -> Self {
        Self {
            service,
            admin_token,
        }
    }
}

type Params = Query<BTreeMap<String, String>>;

fn source_routes(kind: SourceKind) -> Router<Arc<AppState>> {
    let base = format!("/{}", kind.slug());
    Router::new()
        .route(
            &format!("{base}/items"),
            get(move |State(state): State<Arc<AppState>>, Query(params): Params| async move {
                mirror::list_items(&state, kind, &params).await
            }),
        )
        .route(
            &format!("{base}/items/export"),
            get(move |State(state): State<Arc<AppState>>, Query(params): Params| async move {
                mirror::export_items(&state, kind, &params).await
            }),
        )
        .route(
            &format!("{base}/sync"),
            post(move |State(state): State<Arc<AppState>>| async move {
                mirror::sync_source(&state, kind).await
            }),
        )
}

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    let api = SourceKind::ALL
        .into_iter()
        .fold(Router::<Arc<AppState>>::new(), |router, kind| {
            router.merge(source_routes(kind))
        })
        .route("/logs", get(mirror::list_logs))
        .merge(mutations::routes())
        .fallback(no_route);

    Router::new()
        .nest("/api", api)
        .layer(from_fn_with_state(state.clone(), middleware::require_admin))
        .layer(from_fn_with_state(state.clone(), middleware::audit_requests))
        .route("/health", get(health))
        .with_state(state)
}

async fn no_route(method: Method, OriginalUri(uri): OriginalUri) -> AppError {
    AppError::NotFound(format!("no route for {method} {}", uri.path()))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<JsonValue> {
    let configured: Vec<&str> = state
        .service
        .configured_sources()
        .into_iter()
        .map(SourceKind::slug)
        .collect();
    Json(json!({ "status": "ok", "configured_sources": configured }))
}

pub async fn serve(bind_addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(addr = %bind_addr, "listening");
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
    .context("serving http")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use licmirror_adapters::{RemoteSource, UpstreamCommand};
    use licmirror_core::FetchedDocument;
    use licmirror_storage::{MemoryAuditLog, MemoryMirrorStore, UpstreamError};
    use tower::ServiceExt;

    pub(crate) struct FixedSource {
        kind: SourceKind,
        documents: Vec<FetchedDocument>,
        pub(crate) executed: Mutex<Vec<UpstreamCommand>>,
    }

    impl FixedSource {
        pub(crate) fn new(kind: SourceKind, documents: Vec<FetchedDocument>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                documents,
                executed: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RemoteSource for FixedSource {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        async fn fetch_collection(&self) -> Result<Vec<FetchedDocument>, UpstreamError> {
            Ok(self.documents.clone())
        }

        async fn execute(&self, command: &UpstreamCommand) -> Result<JsonValue, UpstreamError> {
            self.executed.lock().unwrap().push(command.clone());
            Ok(json!({"accepted": command.path}))
        }
    }

    pub(crate) fn test_app(
        sources: Vec<Arc<FixedSource>>,
        admin_token: Option<&str>,
    ) -> (Router, Arc<MemoryAuditLog>) {
        let audit = Arc::new(MemoryAuditLog::new());
        let service = sources.into_iter().fold(
            MirrorService::new(Arc::new(MemoryMirrorStore::new()), audit.clone()),
            |service, source| service.with_source(source),
        );
        let state = AppState::new(Arc::new(service), admin_token.map(str::to_string));
        (app(state), audit)
    }

    pub(crate) async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, JsonValue) {
        let resp = app
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap_or(JsonValue::Null);
        (status, value)
    }

    fn arca_docs() -> Vec<FetchedDocument> {
        ["A", "B", "A"]
            .iter()
            .enumerate()
            .map(|(i, org)| {
                FetchedDocument::keyed(
                    format!("mac-{i}"),
                    json!({"mac_address": format!("mac-{i}"), "org": org, "status": "True"}),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn health_is_open_and_lists_configured_sources() {
        let (app, _audit) = test_app(vec![FixedSource::new(SourceKind::Arca, Vec::new())], Some("t0ken"));
        let (status, body) = send(&app, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["configured_sources"], json!(["arca"]));
    }

    #[tokio::test]
    async fn api_requires_the_bearer_token_when_configured() {
        let (app, audit) = test_app(Vec::new(), Some("t0ken"));
        let (status, body) = send(&app, "GET", "/api/tsd/items").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/tsd/items")
                    .header(header::AUTHORIZATION, "Bearer t0ken")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let messages: Vec<String> = audit.entries().await.into_iter().map(|e| e.message).collect();
        assert_eq!(
            messages,
            vec!["Request GET /api/tsd/items", "Request GET /api/tsd/items"]
        );
    }

    #[tokio::test]
    async fn sync_then_filtered_items() {
        let (app, _audit) = test_app(vec![FixedSource::new(SourceKind::Arca, arca_docs())], None);
        let (status, report) = send(&app, "POST", "/api/arca/sync").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["written"], 3);

        let (status, page) = send(&app, "GET", "/api/arca/items?org=a&limit=1&page=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 2);
        assert_eq!(page["page"], 2);
        assert_eq!(page["items"].as_array().unwrap().len(), 1);

        let (status, page) = send(&app, "GET", "/api/arca/items?colour=red").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 3);
    }

    #[tokio::test]
    async fn bad_query_input_is_a_400_with_message() {
        let (app, _audit) = test_app(Vec::new(), None);
        let (status, body) = send(&app, "GET", "/api/iiko/items?limit=500").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("limit"));

        let (status, _) = send(&app, "GET", "/api/iiko/items?order=sideways").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "GET", "/api/iiko/items?is_online=maybe").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_source_is_404_and_unconfigured_sync_is_503() {
        let (app, _audit) = test_app(Vec::new(), None);
        let (status, body) = send(&app, "GET", "/api/ebay/items").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "no route for GET /api/ebay/items");

        let (status, body) = send(&app, "POST", "/api/kaspi/sync").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Kaspi is not configured");
    }

    #[tokio::test]
    async fn export_downloads_a_workbook() {
        let (app, _audit) = test_app(vec![FixedSource::new(SourceKind::Arca, arca_docs())], None);
        send(&app, "POST", "/api/arca/sync").await;

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/arca/items/export?org=b")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            licmirror_sync::XLSX_CONTENT_TYPE
        );
        let disposition = resp.headers()[header::CONTENT_DISPOSITION].to_str().unwrap().to_string();
        assert!(disposition.starts_with("attachment; filename=\"arca_licenses_"));
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(body.starts_with(b"PK"));
    }

    #[tokio::test]
    async fn logs_endpoint_pages_audit_entries() {
        let (app, _audit) = test_app(vec![FixedSource::new(SourceKind::Arca, arca_docs())], None);
        send(&app, "POST", "/api/arca/sync").await;

        let (status, logs) = send(&app, "GET", "/api/logs?search=synced").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(logs["total"], 1);
        assert_eq!(logs["items"][0]["message"], "Synced 3 ARCA records");
        assert_eq!(logs["items"][0]["level"], "INFO");

        let (status, _) = send(&app, "GET", "/api/logs?limit=500").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
