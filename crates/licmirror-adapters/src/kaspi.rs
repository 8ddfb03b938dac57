//! Kaspi users, read straight from the service's MongoDB `User` collection
//! and created through its public register endpoint.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::TryStreamExt;
use licmirror_core::{FetchedDocument, JsonPath, SortDirection, SortSpec, SourceKind};
use licmirror_storage::{join_url, UpstreamError, UpstreamHttp};
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::ClientOptions;
use mongodb::Client;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::profile::{
    ColumnFormat, ExportColumn, ExportLayout, FilterDef, FilterKind, SortField, SourceProfile,
};
use crate::{require, CommandMethod, InvalidCommand, RemoteSource, UpstreamCommand};

const ACCEPTED_STATUSES: [u16; 2] = [200, 201];

#[derive(Debug, Clone)]
pub struct KaspiSettings {
    pub api_url: String,
    pub mongo_uri: String,
    pub database: String,
    pub collection: String,
    pub server_selection_timeout: Duration,
}

impl KaspiSettings {
    pub fn mongo_uri_from_parts(user: &str, password: &str, host: &str, port: &str) -> String {
        format!("mongodb://{user}:{password}@{host}:{port}/")
    }
}

#[derive(Debug, Clone)]
pub struct KaspiSource {
    settings: KaspiSettings,
    http: UpstreamHttp,
}

impl KaspiSource {
    pub fn new(settings: KaspiSettings, http: UpstreamHttp) -> Self {
        Self { settings, http }
    }

    async fn load_raw_users(&self) -> Result<Vec<Document>, mongodb::error::Error> {
        let mut options = ClientOptions::parse(&self.settings.mongo_uri).await?;
        options.server_selection_timeout = Some(self.settings.server_selection_timeout);
        let client = Client::with_options(options)?;
        let collection = client
            .database(&self.settings.database)
            .collection::<Document>(&self.settings.collection);
        let cursor = collection.find(doc! {}).await?;
        cursor.try_collect().await
    }
}

/// Flattens a raw user document (relaxed extended JSON) into the mirrored shape.
pub fn normalize_user(raw: &JsonValue) -> FetchedDocument {
    let mongo_id = match raw.get("_id") {
        Some(JsonValue::String(id)) => Some(id.clone()),
        Some(JsonValue::Object(map)) => map.get("$oid").and_then(JsonValue::as_str).map(str::to_string),
        _ => None,
    };
    let login = JsonPath::parse("UserLogins.0.Login")
        .lookup(raw)
        .and_then(JsonValue::as_str)
        .unwrap_or("Unknown")
        .to_string();
    let is_verified = raw
        .get("IsVerified")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    let role = raw.get("UserRole").cloned().unwrap_or(json!(0));
    let password_hash = raw.get("Password").and_then(JsonValue::as_str).unwrap_or("");
    let created_at = raw.get("CreatedDate").and_then(extended_json_date);

    let document = json!({
        "mongo_id": mongo_id,
        "login": login,
        "role": role,
        "is_verified": is_verified,
        "created_at": created_at,
        "password_hash": password_hash,
    });
    FetchedDocument {
        external_key: mongo_id,
        document,
    }
}

fn extended_json_date(value: &JsonValue) -> Option<String> {
    let parsed: DateTime<Utc> = match value {
        JsonValue::String(text) => DateTime::parse_from_rfc3339(text).ok()?.with_timezone(&Utc),
        JsonValue::Object(map) => match map.get("$date")? {
            JsonValue::String(text) => DateTime::parse_from_rfc3339(text).ok()?.with_timezone(&Utc),
            JsonValue::Object(inner) => {
                let millis = inner.get("$numberLong")?.as_str()?.parse::<i64>().ok()?;
                DateTime::from_timestamp_millis(millis)?
            }
            JsonValue::Number(millis) => DateTime::from_timestamp_millis(millis.as_i64()?)?,
            _ => return None,
        },
        _ => return None,
    };
    Some(parsed.to_rfc3339_opts(SecondsFormat::Secs, true))
}

#[async_trait]
impl RemoteSource for KaspiSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Kaspi
    }

    async fn fetch_collection(&self) -> Result<Vec<FetchedDocument>, UpstreamError> {
        let raw = self
            .load_raw_users()
            .await
            .map_err(|err| UpstreamError::DocumentStore(err.to_string()))?;
        debug!(count = raw.len(), "loaded kaspi users from mongo");
        Ok(raw
            .into_iter()
            .map(|document| normalize_user(&Bson::Document(document).into_relaxed_extjson()))
            .collect())
    }

    async fn execute(&self, command: &UpstreamCommand) -> Result<JsonValue, UpstreamError> {
        let mut request = self
            .http
            .client()
            .request(
                command.method.as_reqwest(),
                join_url(&self.settings.api_url, &command.path),
            )
            .header("accept", "*/*");
        if let Some(body) = &command.body {
            request = request.json(body);
        }
        let response = self.http.send_any_status(request).await?;
        if !ACCEPTED_STATUSES.contains(&response.status.as_u16()) {
            return Err(UpstreamError::HttpStatus {
                status: response.status.as_u16(),
                url: response.url,
                body: String::from_utf8_lossy(&response.body).into_owned(),
            });
        }
        Ok(response.json().unwrap_or_else(
            |_| json!({"status": "ok", "message": "User created (no json response)"}),
        ))
    }
}

pub fn create_user(login: &str, password: &str) -> Result<UpstreamCommand, InvalidCommand> {
    let login = require("login", login)?;
    let password = require("password", password)?;
    Ok(UpstreamCommand::new(
        CommandMethod::Post,
        "Auth/register",
        format!("Created Kaspi user: {login}"),
    )
    .json(json!({
        "userLogin": {"login": login, "authType": 0},
        "password": password,
    })))
}

pub fn profile() -> SourceProfile {
    SourceProfile {
        source: SourceKind::Kaspi,
        default_page_size: 50,
        max_page_size: 500,
        filters: vec![
            FilterDef::new("search", FilterKind::Search(vec![JsonPath::parse("login")])),
            FilterDef::new(
                "status",
                FilterKind::Status {
                    path: JsonPath::parse("is_verified"),
                    truthy: "verified",
                    falsy: "unverified",
                },
            ),
        ],
        sort_fields: vec![
            SortField::new("login", "login"),
            SortField::new("created_at", "created_at"),
            SortField::new("role", "role"),
        ],
        default_sort: SortSpec::by_path("created_at", SortDirection::Desc),
        hidden_fields: vec!["password_hash"],
        export: ExportLayout {
            sheet_name: "KaspiUsers",
            file_noun: "users",
            columns: vec![
                ExportColumn::text("Login", &["login"]),
                ExportColumn::with_format(
                    "Is Verified",
                    &["is_verified"],
                    ColumnFormat::YesNo { yes: "Yes", no: "No" },
                ),
                ExportColumn::text("Role", &["role"]),
                ExportColumn::with_format(
                    "Created At",
                    &["created_at"],
                    ColumnFormat::Date("%Y-%m-%d %H:%M"),
                ),
                ExportColumn::text("Mongo ID", &["mongo_id"]),
            ],
        },
    }
}
