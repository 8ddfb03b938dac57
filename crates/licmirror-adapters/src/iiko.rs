//! iiko license manager: `ApiKey` header, top-level array of `{license: {...}}`.

use licmirror_core::{JsonPath, SortSpec, SourceKind};
use licmirror_storage::UpstreamHttp;
use serde_json::json;

use crate::profile::{
    ColumnFormat, ExportColumn, ExportLayout, FilterDef, FilterKind, SortField, SourceProfile,
};
use crate::{
    path_segment, require, CollectionShape, CommandMethod, HttpAuth, HttpSource, InvalidCommand,
    UpstreamCommand,
};

/// Document path of the stable upstream identity.
const KEY_PATH: &str = "license.id";

const DATE_FORMAT: &str = "%d.%m.%Y %H:%M";

#[derive(Debug, Clone)]
pub struct IikoSettings {
    pub api_url: String,
    pub api_key: String,
}

pub fn source(settings: &IikoSettings, http: UpstreamHttp) -> HttpSource {
    HttpSource::new(
        SourceKind::Iiko,
        settings.api_url.clone(),
        HttpAuth::Header {
            name: "ApiKey",
            value: settings.api_key.clone(),
        },
        "",
        CollectionShape::TopLevelArray,
        JsonPath::parse(KEY_PATH),
        http,
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLicense {
    pub uid: String,
    pub title: String,
    pub count: u32,
    pub product_name: String,
    pub product_sub_name: String,
}

impl NewLicense {
    pub fn new(uid: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            title: title.into(),
            count: 1,
            product_name: "iiko".to_string(),
            product_sub_name: "GosuCashRegisterPlugin".to_string(),
        }
    }
}

pub fn create_license(license: &NewLicense) -> Result<UpstreamCommand, InvalidCommand> {
    let uid = path_segment("uid", &license.uid)?;
    let title = require("title", &license.title)?;
    if license.count == 0 {
        return Err(InvalidCommand {
            field: "count",
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(UpstreamCommand::new(
        CommandMethod::Patch,
        uid.clone(),
        format!("Created iiko license {uid} for {title}"),
    )
    .json(json!({
        "uid": uid,
        "title": title,
        "count": license.count,
        "product_name": license.product_name,
        "product_sub_name": license.product_sub_name,
    })))
}

/// Registers a license code as seen by a dummy access point.
pub fn verify_license(license_code: &str) -> Result<UpstreamCommand, InvalidCommand> {
    let code = require("license_code", license_code)?;
    Ok(UpstreamCommand::new(
        CommandMethod::Post,
        "",
        format!("Verified iiko license {code}"),
    )
    .json(json!({
        "license": code,
        "ap_uid": "-",
        "ap_online": false,
    })))
}

pub fn set_active(license_id: &str, active: bool) -> Result<UpstreamCommand, InvalidCommand> {
    let id = path_segment("license_id", license_id)?;
    let verb = if active { "Activated" } else { "Deactivated" };
    Ok(UpstreamCommand::new(
        CommandMethod::Patch,
        format!("edit/{id}"),
        format!("{verb} iiko license {id}"),
    )
    .json(json!({ "isActive": active })))
}

pub fn profile() -> SourceProfile {
    let date = ColumnFormat::Date(DATE_FORMAT);
    SourceProfile {
        source: SourceKind::Iiko,
        default_page_size: 10,
        max_page_size: 100,
        filters: vec![
            FilterDef::new(
                "search",
                FilterKind::Search(vec![
                    JsonPath::parse("license.organization.name"),
                    JsonPath::parse("license.licenseCode"),
                    JsonPath::parse("license.organizationId"),
                ]),
            ),
            FilterDef::new(
                "status",
                FilterKind::Status {
                    path: JsonPath::parse("license.isActive"),
                    truthy: "active",
                    falsy: "expired",
                },
            ),
            FilterDef::new(
                "organization_id",
                FilterKind::Exact(JsonPath::parse("license.organizationId")),
            ),
            FilterDef::new(
                "is_online",
                FilterKind::Flag(JsonPath::parse("license.isOnline")),
            ),
        ],
        sort_fields: vec![
            SortField::new("organization", "license.organization.name"),
            SortField::new("status", "license.isActive"),
            SortField::new("lastRequestDate", "license.lastRequestDate"),
            SortField::new("expirationDate", "license.licenseExpirationDate"),
        ],
        default_sort: SortSpec::updated_at_desc(),
        hidden_fields: Vec::new(),
        export: ExportLayout {
            sheet_name: "Лицензии iiko",
            file_noun: "licenses",
            columns: vec![
                ExportColumn::text("ID организации", &["license.organizationId"]),
                ExportColumn::text("Название организации", &["license.organization.name"]),
                ExportColumn::text("Код лицензии", &["license.licenseCode"]),
                ExportColumn::text("Продукт", &["license.productName"]),
                ExportColumn::text("Подписка", &["license.productSubName"]),
                ExportColumn::text("AP ID", &["license.apUId"]),
                ExportColumn::with_format(
                    "Статус",
                    &["license.isActive"],
                    ColumnFormat::YesNo {
                        yes: "Активна",
                        no: "Истекла",
                    },
                ),
                ExportColumn::with_format(
                    "Онлайн",
                    &["license.isOnline"],
                    ColumnFormat::YesNo { yes: "Да", no: "Нет" },
                ),
                ExportColumn::with_format(
                    "Включена",
                    &["license.isEnabled"],
                    ColumnFormat::YesNo { yes: "Да", no: "Нет" },
                ),
                ExportColumn::with_format("Дата генерации", &["license.generateDate"], date.clone()),
                ExportColumn::with_format(
                    "Последний запрос",
                    &["license.lastRequestDate"],
                    date.clone(),
                ),
                ExportColumn::with_format("Истекает", &["license.licenseExpirationDate"], date),
                ExportColumn::text("ID лицензии", &["license.id"]),
            ],
        },
    }
}
