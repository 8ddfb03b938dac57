//! TSD device-licensing service. Users are keyed by `username`.

use licmirror_core::{JsonPath, SortSpec, SourceKind};
use licmirror_storage::UpstreamHttp;
use serde::Deserialize;
use serde_json::json;

use crate::profile::{
    ColumnFormat, ExportColumn, ExportLayout, FilterDef, FilterKind, SortField, SourceProfile,
};
use crate::{
    require, CollectionShape, CommandMethod, HttpAuth, HttpSource, InvalidCommand,
    MirrorFollowUp, UpstreamCommand,
};

/// Document path of the stable upstream identity.
const KEY_PATH: &str = "username";

#[derive(Debug, Clone)]
pub struct TsdSettings {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub device_id: String,
    pub device_name: String,
    pub role: String,
}

pub fn source(settings: &TsdSettings, http: UpstreamHttp) -> HttpSource {
    HttpSource::new(
        SourceKind::Tsd,
        settings.base_url.clone(),
        HttpAuth::BearerLogin {
            login_path: "api/Auth/login",
            payload: json!({
                "username": settings.username,
                "password": settings.password,
                "deviceID": settings.device_id,
                "deviceName": settings.device_name,
                "role": settings.role,
            }),
        },
        "api/Admin/GetUsers",
        CollectionShape::TopLevelArray,
        JsonPath::parse(KEY_PATH),
        http,
    )
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub password: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default, rename = "deviceID")]
    pub device_id: Option<String>,
    #[serde(default, rename = "deviceName")]
    pub device_name: Option<String>,
}

fn default_role() -> String {
    "User".to_string()
}

fn admin_command(
    method: CommandMethod,
    path: &str,
    username: &str,
    summary: String,
) -> Result<UpstreamCommand, InvalidCommand> {
    let username = require("username", username)?;
    Ok(UpstreamCommand::new(method, path, summary).query("username", username))
}

pub fn create_user(user: &NewUser) -> Result<UpstreamCommand, InvalidCommand> {
    let username = require("username", &user.username)?;
    let password = require("password", &user.password)?;
    Ok(UpstreamCommand::new(
        CommandMethod::Post,
        "api/Auth/register",
        format!("TSD created user {username}"),
    )
    .json(json!({
        "username": username,
        "password": password,
        "role": user.role,
        "org": user.org,
        "deviceID": user.device_id,
        "deviceName": user.device_name,
    })))
}

pub fn set_password(username: &str, password: &str) -> Result<UpstreamCommand, InvalidCommand> {
    let password = require("password", password)?;
    Ok(admin_command(
        CommandMethod::Patch,
        "api/Auth/changePassword",
        username,
        format!("TSD changed password for {}", username.trim()),
    )?
    .query("password", password))
}

pub fn set_device_count(username: &str, count: u32) -> Result<UpstreamCommand, InvalidCommand> {
    Ok(admin_command(
        CommandMethod::Patch,
        "api/Admin/SetDeviceCount",
        username,
        format!("TSD device count for {} -> {count}", username.trim()),
    )?
    .query("countdevice", count.to_string()))
}

pub fn set_bin(username: &str, bin: &str) -> Result<UpstreamCommand, InvalidCommand> {
    let bin = require("bin", bin)?;
    Ok(admin_command(
        CommandMethod::Patch,
        "api/Admin/SetBIN",
        username,
        format!("TSD bin for {} -> {bin}", username.trim()),
    )?
    .query("bin", bin))
}

pub fn set_org(username: &str, org: &str) -> Result<UpstreamCommand, InvalidCommand> {
    let org = require("org", org)?;
    Ok(admin_command(
        CommandMethod::Patch,
        "api/Admin/SetOrg",
        username,
        format!("TSD org for {} -> {org}", username.trim()),
    )?
    .query("org", org))
}

/// `expire_date` is `YYYY-MM-DDTHH:MM:SS`.
pub fn set_expire_date(username: &str, expire_date: &str) -> Result<UpstreamCommand, InvalidCommand> {
    let expire_date = require("expire_date", expire_date)?;
    Ok(admin_command(
        CommandMethod::Patch,
        "api/Admin/SetExpireDate",
        username,
        format!("TSD expire date for {} -> {expire_date}", username.trim()),
    )?
    .query("expireDate", expire_date))
}

pub fn set_active(username: &str) -> Result<UpstreamCommand, InvalidCommand> {
    admin_command(
        CommandMethod::Patch,
        "api/Admin/SetActiveUser",
        username,
        format!("TSD activation toggled for {}", username.trim()),
    )
}

/// Removes the user upstream and its mirrored row locally.
pub fn delete_user(username: &str) -> Result<UpstreamCommand, InvalidCommand> {
    let key = require("username", username)?;
    Ok(admin_command(
        CommandMethod::Delete,
        "api/Admin/DeleteUser",
        &key,
        format!("TSD deleted user {key}"),
    )?
    .follow_up(MirrorFollowUp::RemoveAndResync { external_key: key }))
}

/// Read-through lookup; the mirror is not touched.
pub fn user_info(username: &str) -> Result<UpstreamCommand, InvalidCommand> {
    Ok(admin_command(
        CommandMethod::Get,
        "api/Admin/GetUserInfo",
        username,
        format!("TSD user info for {}", username.trim()),
    )?
    .follow_up(MirrorFollowUp::Nothing))
}

pub fn profile() -> SourceProfile {
    SourceProfile {
        source: SourceKind::Tsd,
        default_page_size: 10,
        max_page_size: 100,
        filters: vec![
            FilterDef::new(
                "search",
                FilterKind::Search(vec![
                    JsonPath::parse("username"),
                    JsonPath::parse("org"),
                    JsonPath::parse("bin"),
                    JsonPath::parse("deviceName"),
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
            SortField::new("username", "username"),
            SortField::new("org", "org"),
            SortField::new("registerDate", "registerDate"),
            SortField::new("expireDate", "expireDate"),
            SortField::new("availableDeviceCount", "availableDeviceCount"),
        ],
        default_sort: SortSpec::updated_at_desc(),
        hidden_fields: Vec::new(),
        export: ExportLayout {
            sheet_name: "TSDUsers",
            file_noun: "users",
            columns: vec![
                ExportColumn::text("Username", &["username"]),
                ExportColumn::text("Organization", &["org"]),
                ExportColumn::text("BIN", &["bin"]),
                ExportColumn::text("Role", &["role"]),
                ExportColumn::with_format(
                    "Active",
                    &["isActive"],
                    ColumnFormat::YesNo { yes: "Yes", no: "No" },
                ),
                ExportColumn::text("Devices", &["availableDeviceCount"]),
                ExportColumn::with_format(
                    "Registered",
                    &["registerDate"],
                    ColumnFormat::Date("%Y-%m-%d %H:%M"),
                ),
                ExportColumn::with_format(
                    "Expires",
                    &["expireDate"],
                    ColumnFormat::Date("%Y-%m-%d %H:%M"),
                ),
                ExportColumn::text("Device ID", &["deviceID"]),
                ExportColumn::text("Device Name", &["deviceName"]),
            ],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_value<'a>(cmd: &'a UpstreamCommand, name: &str) -> Option<&'a str> {
        cmd.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn admin_commands_carry_username_and_upstream_parameter_names() {
        let cmd = set_device_count("alice", 3).unwrap();
        assert_eq!(cmd.path, "api/Admin/SetDeviceCount");
        assert_eq!(query_value(&cmd, "username"), Some("alice"));
        assert_eq!(query_value(&cmd, "countdevice"), Some("3"));

        let cmd = set_expire_date("alice", "2026-05-01T00:00:00").unwrap();
        assert_eq!(query_value(&cmd, "expireDate"), Some("2026-05-01T00:00:00"));

        let cmd = set_password("alice", "s3cret").unwrap();
        assert_eq!(cmd.path, "api/Auth/changePassword");
    }

    #[test]
    fn delete_removes_the_local_row_and_info_is_read_only() {
        let cmd = delete_user(" alice ").unwrap();
        assert_eq!(cmd.method, CommandMethod::Delete);
        assert_eq!(
            cmd.follow_up,
            MirrorFollowUp::RemoveAndResync {
                external_key: "alice".to_string()
            }
        );

        let info = user_info("alice").unwrap();
        assert_eq!(info.method, CommandMethod::Get);
        assert_eq!(info.follow_up, MirrorFollowUp::Nothing);
    }

    #[test]
    fn blank_username_is_rejected() {
        assert!(set_active("").is_err());
        assert!(set_bin("  ", "123").is_err());
    }
}
