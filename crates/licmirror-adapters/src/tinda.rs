//! Tinda user service: bearer token from `login`, users from `Admin/GetUsers`.

use licmirror_core::{JsonPath, SortSpec, SourceKind};
use licmirror_storage::UpstreamHttp;
use serde::Deserialize;
use serde_json::json;

use crate::profile::{
    ColumnFormat, ExportColumn, ExportLayout, FilterDef, FilterKind, SortField, SourceProfile,
};
use crate::{
    path_segment, require, upstream_date, CollectionShape, CommandMethod, HttpAuth, HttpSource,
    InvalidCommand, UpstreamCommand,
};

/// Document path of the stable upstream identity.
const KEY_PATH: &str = "_Id";

#[derive(Debug, Clone)]
pub struct TindaSettings {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

pub fn source(settings: &TindaSettings, http: UpstreamHttp) -> HttpSource {
    HttpSource::new(
        SourceKind::Tinda,
        settings.base_url.clone(),
        HttpAuth::BearerLogin {
            login_path: "login",
            payload: json!({
                "username": settings.username,
                "password": settings.password,
            }),
        },
        "Admin/GetUsers",
        CollectionShape::TopLevelArray,
        JsonPath::parse(KEY_PATH),
        http,
    )
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub bin: String,
    #[serde(rename = "expireDate")]
    pub expire_date: String,
    #[serde(default = "default_role")]
    pub role: i64,
}

fn default_role() -> i64 {
    1
}

pub fn create_user(user: &NewUser) -> Result<UpstreamCommand, InvalidCommand> {
    let username = require("username", &user.username)?;
    let password = require("password", &user.password)?;
    let expire_date = require("expireDate", &user.expire_date)?;
    Ok(UpstreamCommand::new(
        CommandMethod::Post,
        "Register",
        format!("Created Tinda user {username}"),
    )
    .json(json!({
        "username": username,
        "password": password,
        "org": user.org,
        "bin": user.bin,
        "expireDate": expire_date,
        "role": user.role,
    })))
}

pub fn set_org(user_id: &str, org: &str) -> Result<UpstreamCommand, InvalidCommand> {
    let id = path_segment("user_id", user_id)?;
    let org = require("org", org)?;
    Ok(UpstreamCommand::new(
        CommandMethod::Patch,
        format!("Admin/SetOrg/{id}"),
        format!("Tinda user {id} org -> {org}"),
    )
    .query("Org", org))
}

pub fn set_active(user_id: &str) -> Result<UpstreamCommand, InvalidCommand> {
    let id = path_segment("user_id", user_id)?;
    Ok(UpstreamCommand::new(
        CommandMethod::Patch,
        format!("Admin/SetActive/{id}"),
        format!("Tinda user {id} activation toggled"),
    ))
}

pub fn set_bin(user_id: &str, bin: &str) -> Result<UpstreamCommand, InvalidCommand> {
    let id = path_segment("user_id", user_id)?;
    let bin = require("bin", bin)?;
    Ok(UpstreamCommand::new(
        CommandMethod::Patch,
        format!("Admin/SetBIN/{id}"),
        format!("Tinda user {id} bin -> {bin}"),
    )
    .query("bin", bin))
}

/// The date travels after a literal `&` in the path, not as a query string;
/// the upstream only accepts that form.
pub fn set_expire_date(user_id: &str, expire_date: &str) -> Result<UpstreamCommand, InvalidCommand> {
    let id = path_segment("user_id", user_id)?;
    let date = upstream_date("expire_date", expire_date)?;
    Ok(UpstreamCommand::new(
        CommandMethod::Patch,
        format!("Admin/SetExpireDate/{id}&date={date}"),
        format!("Tinda user {id} expire date -> {date}"),
    ))
}

pub fn profile() -> SourceProfile {
    SourceProfile {
        source: SourceKind::Tinda,
        default_page_size: 10,
        max_page_size: 100,
        filters: vec![
            FilterDef::new(
                "search",
                FilterKind::Search(vec![
                    JsonPath::parse("login"),
                    JsonPath::parse("org"),
                    JsonPath::parse("bin"),
                ]),
            ),
            FilterDef::new(
                "status",
                FilterKind::Status {
                    path: JsonPath::parse("isActive"),
                    truthy: "active",
                    falsy: "inactive",
                },
            ),
            FilterDef::new("org", FilterKind::Contains(JsonPath::parse("org"))),
            FilterDef::new("bin", FilterKind::Contains(JsonPath::parse("bin"))),
        ],
        sort_fields: vec![
            SortField::new("login", "login"),
            SortField::new("org", "org"),
            SortField::new("createDate", "createDate"),
            SortField::new("expireDate", "expireDate"),
        ],
        default_sort: SortSpec::updated_at_desc(),
        hidden_fields: Vec::new(),
        export: ExportLayout {
            sheet_name: "TindaUsers",
            file_noun: "users",
            columns: vec![
                ExportColumn::text("ID", &["_Id"]),
                ExportColumn::text("Login", &["login"]),
                ExportColumn::text("Organization", &["org"]),
                ExportColumn::text("BIN", &["bin"]),
                ExportColumn::text("Role", &["role"]),
                ExportColumn::with_format(
                    "Active",
                    &["isActive"],
                    ColumnFormat::YesNo { yes: "Yes", no: "No" },
                ),
                ExportColumn::with_format(
                    "Created",
                    &["createDate"],
                    ColumnFormat::Date("%Y-%m-%d %H:%M"),
                ),
                ExportColumn::with_format(
                    "Expires",
                    &["expireDate"],
                    ColumnFormat::Date("%Y-%m-%d %H:%M"),
                ),
            ],
        },
    }
}
