use async_trait::async_trait;
use licmirror_core::{FetchedDocument, JsonPath, SourceKind};
use licmirror_storage::{join_url, UpstreamError, UpstreamHttp};
use reqwest::RequestBuilder;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{RemoteSource, UpstreamCommand};

/// How requests to an upstream are authorised.
#[derive(Debug, Clone)]
pub enum HttpAuth {
    Basic {
        username: String,
        password: String,
    },
    /// Static key sent in a named header.
    Header { name: &'static str, value: String },
    /// Bearer token obtained by POSTing `payload` to `login_path` before every
    /// operation.
    BearerLogin {
        login_path: &'static str,
        payload: JsonValue,
    },
}

/// Where the record list lives in the collection response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionShape {
    TopLevelArray,
    ArrayUnder(&'static str),
}

/// Adapter for JSON-over-HTTP upstreams.
#[derive(Debug, Clone)]
pub struct HttpSource {
    kind: SourceKind,
    base_url: String,
    auth: HttpAuth,
    collection_path: &'static str,
    shape: CollectionShape,
    key_path: JsonPath,
    http: UpstreamHttp,
}

impl HttpSource {
    pub fn new(
        kind: SourceKind,
        base_url: impl Into<String>,
        auth: HttpAuth,
        collection_path: &'static str,
        shape: CollectionShape,
        key_path: JsonPath,
        http: UpstreamHttp,
    ) -> Self {
        Self {
            kind,
            base_url: base_url.into(),
            auth,
            collection_path,
            shape,
            key_path,
            http,
        }
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    async fn authorise(&self, request: RequestBuilder) -> Result<RequestBuilder, UpstreamError> {
        match &self.auth {
            HttpAuth::Basic { username, password } => {
                Ok(request.basic_auth(username, Some(password)))
            }
            HttpAuth::Header { name, value } => Ok(request.header(*name, value)),
            HttpAuth::BearerLogin {
                login_path,
                payload,
            } => {
                let token = self.login(login_path, payload).await?;
                Ok(request.bearer_auth(token))
            }
        }
    }

    async fn login(&self, login_path: &str, payload: &JsonValue) -> Result<String, UpstreamError> {
        let request = self.http.client().post(self.url(login_path)).json(payload);
        let response = self
            .http
            .send(request)
            .await
            .map_err(|err| UpstreamError::Login {
                system: self.kind.to_string(),
                reason: err.to_string(),
            })?;
        let body = response.json().map_err(|err| UpstreamError::Login {
            system: self.kind.to_string(),
            reason: err.to_string(),
        })?;
        extract_token(&body).ok_or_else(|| UpstreamError::Login {
            system: self.kind.to_string(),
            reason: "response did not contain a token".to_string(),
        })
    }
}

/// Login responses are either a bare JSON string or `{"token": "..."}`.
pub(crate) fn extract_token(body: &JsonValue) -> Option<String> {
    let token = match body {
        JsonValue::String(token) => token.as_str(),
        JsonValue::Object(map) => map.get("token")?.as_str()?,
        _ => return None,
    };
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Pulls the record array out of a collection response and keys each record.
pub(crate) fn collect_records(
    body: JsonValue,
    shape: CollectionShape,
    key_path: &JsonPath,
    url: &str,
) -> Result<Vec<FetchedDocument>, UpstreamError> {
    let records = match (shape, body) {
        (CollectionShape::TopLevelArray, JsonValue::Array(items)) => items,
        (CollectionShape::ArrayUnder(field), JsonValue::Object(mut map)) => {
            match map.remove(field) {
                Some(JsonValue::Array(items)) => items,
                _ => {
                    return Err(UpstreamError::MalformedBody {
                        url: url.to_string(),
                        reason: format!("expected an array under `{field}`"),
                    })
                }
            }
        }
        _ => {
            return Err(UpstreamError::MalformedBody {
                url: url.to_string(),
                reason: "unexpected collection shape".to_string(),
            })
        }
    };

    Ok(records
        .into_iter()
        .map(|document| FetchedDocument {
            external_key: key_path.text_in(&document).map(|k| k.into_owned()),
            document,
        })
        .collect())
}

#[async_trait]
impl RemoteSource for HttpSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch_collection(&self) -> Result<Vec<FetchedDocument>, UpstreamError> {
        let url = self.url(self.collection_path);
        let request = self.authorise(self.http.client().get(&url)).await?;
        let response = self.http.send(request).await?;
        let documents = collect_records(response.json()?, self.shape, &self.key_path, &url)?;
        debug!(source = %self.kind, count = documents.len(), "fetched collection");
        Ok(documents)
    }

    async fn execute(&self, command: &UpstreamCommand) -> Result<JsonValue, UpstreamError> {
        let mut request = self
            .http
            .client()
            .request(command.method.as_reqwest(), self.url(&command.path));
        if !command.query.is_empty() {
            request = request.query(&command.query);
        }
        if let Some(body) = &command.body {
            request = request.json(body);
        }
        let request = self.authorise(request).await?;
        let response = self.http.send(request).await?;
        Ok(response.json_or_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn token_shapes() {
        assert_eq!(extract_token(&json!("abc")), Some("abc".to_string()));
        assert_eq!(extract_token(&json!({"token": "xyz"})), Some("xyz".to_string()));
        assert_eq!(extract_token(&json!("")), None);
        assert_eq!(extract_token(&json!({"access": "xyz"})), None);
        assert_eq!(extract_token(&json!(42)), None);
    }

    #[test]
    fn records_under_a_field_are_keyed() {
        let body = json!({"details": [
            {"mac_address": "AA:BB", "org": "One"},
            {"org": "No key"}
        ]});
        let docs = collect_records(
            body,
            CollectionShape::ArrayUnder("details"),
            &JsonPath::parse("mac_address"),
            "https://arca.test/allLicences",
        )
        .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].external_key.as_deref(), Some("AA:BB"));
        assert_eq!(docs[1].external_key, None);
    }

    #[test]
    fn missing_or_wrong_shape_is_malformed() {
        for body in [json!({"status": "ok"}), json!({"details": {"a": 1}}), json!([])] {
            let result = collect_records(
                body,
                CollectionShape::ArrayUnder("details"),
                &JsonPath::parse("mac_address"),
                "u",
            );
            assert!(matches!(result, Err(UpstreamError::MalformedBody { .. })));
        }
        let result = collect_records(
            json!({"items": []}),
            CollectionShape::TopLevelArray,
            &JsonPath::parse("id"),
            "u",
        );
        assert!(matches!(result, Err(UpstreamError::MalformedBody { .. })));
    }

    #[test]
    fn numeric_keys_become_text() {
        let docs = collect_records(
            json!([{"_Id": 17}]),
            CollectionShape::TopLevelArray,
            &JsonPath::parse("_Id"),
            "u",
        )
        .unwrap();
        assert_eq!(docs[0].external_key.as_deref(), Some("17"));
    }

    mod live {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        use axum::{
            extract::State,
            http::{header, HeaderMap, StatusCode},
            routing::{get, post},
            Json, Router,
        };
        use licmirror_core::{JsonPath, SourceKind};
        use licmirror_storage::{HttpClientConfig, UpstreamError, UpstreamHttp};
        use serde_json::{json, Value as JsonValue};
        use tokio::net::TcpListener;

        use crate::http_source::{CollectionShape, HttpAuth, HttpSource};
        use crate::{CommandMethod, RemoteSource, UpstreamCommand};

        #[derive(Default)]
        struct Hits {
            logins: AtomicUsize,
            users: AtomicUsize,
        }

        async fn login(State(hits): State<Arc<Hits>>) -> Json<JsonValue> {
            let n = hits.logins.fetch_add(1, Ordering::SeqCst) + 1;
            Json(json!({ "token": format!("tok-{n}") }))
        }

        /// First call lists one user, every later call fails with a 500.
        async fn users(
            State(hits): State<Arc<Hits>>,
            headers: HeaderMap,
        ) -> (StatusCode, Json<JsonValue>) {
            let authorised = headers
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.starts_with("Bearer tok-"));
            if !authorised {
                return (StatusCode::UNAUTHORIZED, Json(json!("no token")));
            }
            match hits.users.fetch_add(1, Ordering::SeqCst) {
                0 => (StatusCode::OK, Json(json!([{ "username": "alice" }]))),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "boom"}))),
            }
        }

        async fn stub_upstream() -> (String, Arc<Hits>) {
            let hits = Arc::new(Hits::default());
            let app = Router::new()
                .route("/login", post(login))
                .route("/bad-login", post(|| async { StatusCode::FORBIDDEN }))
                .route("/empty-login", post(|| async { Json(json!({ "token": "" })) }))
                .route("/users", get(users))
                .route("/partial", get(|| async { "[{\"username\": \"al" }))
                .route("/edit/{id}", post(|| async { "" }))
                .with_state(hits.clone());
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            (format!("http://{addr}/"), hits)
        }

        fn source(base: &str, login_path: &'static str, collection_path: &'static str) -> HttpSource {
            HttpSource::new(
                SourceKind::Tsd,
                base,
                HttpAuth::BearerLogin {
                    login_path,
                    payload: json!({"username": "admin", "password": "pw"}),
                },
                collection_path,
                CollectionShape::TopLevelArray,
                JsonPath::parse("username"),
                UpstreamHttp::new(&HttpClientConfig::default()).unwrap(),
            )
        }

        #[tokio::test]
        async fn every_operation_logs_in_afresh() {
            let (base, hits) = stub_upstream().await;
            let tsd = source(&base, "login", "users");

            let docs = tsd.fetch_collection().await.unwrap();
            assert_eq!(docs.len(), 1);
            assert_eq!(docs[0].external_key.as_deref(), Some("alice"));
            assert_eq!(hits.logins.load(Ordering::SeqCst), 1);

            let err = tsd.fetch_collection().await.unwrap_err();
            assert!(matches!(err, UpstreamError::HttpStatus { status: 500, .. }), "{err}");
            assert_eq!(hits.logins.load(Ordering::SeqCst), 2);

            let reply = tsd
                .execute(&UpstreamCommand::new(CommandMethod::Post, "edit/7", "edit"))
                .await
                .unwrap();
            assert_eq!(reply, json!({"raw_response": null}));
            assert_eq!(hits.logins.load(Ordering::SeqCst), 3);
        }

        #[tokio::test]
        async fn login_failures_are_reported_as_login_errors() {
            let (base, hits) = stub_upstream().await;

            for login_path in ["bad-login", "empty-login"] {
                let err = source(&base, login_path, "users")
                    .fetch_collection()
                    .await
                    .unwrap_err();
                assert!(matches!(err, UpstreamError::Login { .. }), "{err}");
            }
            assert_eq!(hits.users.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn truncated_body_yields_no_records() {
            let (base, _hits) = stub_upstream().await;
            let err = source(&base, "login", "partial")
                .fetch_collection()
                .await
                .unwrap_err();
            assert!(matches!(err, UpstreamError::MalformedBody { .. }), "{err}");
        }
    }
}
