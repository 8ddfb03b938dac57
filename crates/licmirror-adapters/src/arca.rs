//! ARCA license server: HTTP Basic, records under `details`.

use licmirror_core::{JsonPath, SortSpec, SourceKind};
use licmirror_storage::UpstreamHttp;

use crate::profile::{
    ColumnFormat, ExportColumn, ExportLayout, FilterDef, FilterKind, SortField, SourceProfile,
};
use crate::{
    require, CollectionShape, CommandMethod, HttpAuth, HttpSource, InvalidCommand, UpstreamCommand,
};

/// Document path of the stable upstream identity.
const KEY_PATH: &str = "mac_address";

/// Upstream spells this endpoint `unreqister` and its parameter `maccadress`.
pub const DELETE_LICENSE_PATH: &str = "unreqisterLicense";
pub const DELETE_LICENSE_PARAM: &str = "maccadress";

#[derive(Debug, Clone)]
pub struct ArcaSettings {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

pub fn source(settings: &ArcaSettings, http: UpstreamHttp) -> HttpSource {
    HttpSource::new(
        SourceKind::Arca,
        settings.base_url.clone(),
        HttpAuth::Basic {
            username: settings.username.clone(),
            password: settings.password.clone(),
        },
        "allLicences",
        CollectionShape::ArrayUnder("details"),
        JsonPath::parse(KEY_PATH),
        http,
    )
}

pub fn create_license(
    mac_address: &str,
    license_key: &str,
    license_date: &str,
) -> Result<UpstreamCommand, InvalidCommand> {
    let mac_address = require("mac_address", mac_address)?;
    let license_key = require("license_key", license_key)?;
    let license_date = require("license_date", license_date)?;
    Ok(UpstreamCommand::new(
        CommandMethod::Post,
        "createLicences",
        format!("Created ARCA license {mac_address}"),
    )
    .query("mac_address", mac_address)
    .query("license_key", license_key)
    .query("license_date", license_date))
}

pub fn delete_license(mac_address: &str) -> Result<UpstreamCommand, InvalidCommand> {
    let mac_address = require("mac_address", mac_address)?;
    Ok(UpstreamCommand::new(
        CommandMethod::Get,
        DELETE_LICENSE_PATH,
        format!("Deleted ARCA license {mac_address}"),
    )
    .query(DELETE_LICENSE_PARAM, mac_address))
}

pub fn profile() -> SourceProfile {
    SourceProfile {
        source: SourceKind::Arca,
        default_page_size: 10,
        max_page_size: 100,
        filters: vec![
            FilterDef::new(
                "search",
                FilterKind::Search(
                    ["mac_address", "licences_key", "org", "bin"]
                        .into_iter()
                        .map(JsonPath::parse)
                        .collect(),
                ),
            ),
            FilterDef::new(
                "status",
                FilterKind::Status {
                    path: JsonPath::parse("status"),
                    truthy: "active",
                    falsy: "inactive",
                },
            ),
            FilterDef::new("org", FilterKind::Contains(JsonPath::parse("org"))),
            FilterDef::new("bin", FilterKind::Contains(JsonPath::parse("bin"))),
        ],
        sort_fields: vec![
            SortField::new("mac_address", "mac_address"),
            SortField::new("org", "org"),
            SortField::new("status", "status"),
            SortField::new("license_date", "license_date"),
            SortField::new("expire_date", "expire_date"),
        ],
        default_sort: SortSpec::updated_at_desc(),
        hidden_fields: Vec::new(),
        export: ExportLayout {
            sheet_name: "ARCA",
            file_noun: "licenses",
            columns: vec![
                ExportColumn::text("MAC Address", &["mac_address"]),
                ExportColumn::text("License Key", &["licences_key", "license_key"]),
                ExportColumn::with_format(
                    "License Date",
                    &["license_date", "licences_date"],
                    ColumnFormat::Date("%d.%m.%Y"),
                ),
                ExportColumn::with_format(
                    "Active",
                    &["status"],
                    ColumnFormat::YesNo { yes: "Yes", no: "No" },
                ),
                ExportColumn::text("Organization", &["org"]),
                ExportColumn::text("BIN", &["bin"]),
                ExportColumn::with_format(
                    "Expires",
                    &["expire_date"],
                    ColumnFormat::Date("%d.%m.%Y"),
                ),
            ],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delete_keeps_upstream_spelling() {
        let cmd = delete_license(" AA:BB:CC ").unwrap();
        assert_eq!(cmd.method, CommandMethod::Get);
        assert_eq!(cmd.path, "unreqisterLicense");
        assert_eq!(
            cmd.query,
            vec![("maccadress".to_string(), "AA:BB:CC".to_string())]
        );
    }

    #[test]
    fn create_sends_query_parameters_only() {
        let cmd = create_license("AA", "KEY-1", "2025-12-31").unwrap();
        assert_eq!(cmd.path, "createLicences");
        assert!(cmd.body.is_none());
        assert_eq!(cmd.query.len(), 3);
        assert!(create_license("AA", "", "2025-12-31").is_err());
    }

    #[test]
    fn search_spans_mac_key_org_and_bin() {
        let profile = profile();
        let mut params = std::collections::BTreeMap::new();
        params.insert("search".to_string(), "kz-77".to_string());
        let predicate = profile.compile_filters(&params).unwrap();
        assert!(predicate.matches(&json!({"licences_key": "KZ-7788"})));
        assert!(!predicate.matches(&json!({"mac_address": "00:11"})));
    }
}
