//! Admin commands passed through to the upstream systems.
//!
//! Every handler validates its input into an [`UpstreamCommand`] and hands it
//! to the service, which re-syncs the mirror once the upstream accepts it.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    routing::{get, post},
    Json, Router,
};
use licmirror_adapters::{arca, iiko, kaspi, tinda, tsd, UpstreamCommand};
use licmirror_core::SourceKind;
use licmirror_sync::MutationOutcome;
use serde::Deserialize;

use crate::{AppError, AppState};

type Outcome = Result<Json<MutationOutcome>, AppError>;
type QueryArg<T> = Result<Query<T>, QueryRejection>;
type JsonArg<T> = Result<Json<T>, JsonRejection>;

async fn run(state: &AppState, kind: SourceKind, command: UpstreamCommand) -> Outcome {
    Ok(Json(state.service.mutate(kind, command).await?))
}

pub(crate) fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/arca/license/create", post(arca_create))
        .route("/arca/license/delete", post(arca_delete))
        .route("/iiko/license/create", post(iiko_create))
        .route("/iiko/license/verify", post(iiko_verify))
        .route("/iiko/license/{id}/set-active", post(iiko_set_active))
        .route("/tinda/users/create", post(tinda_create))
        .route("/tinda/users/{user_id}/set-org", post(tinda_set_org))
        .route("/tinda/users/{user_id}/set-active", post(tinda_set_active))
        .route("/tinda/users/{user_id}/set-bin", post(tinda_set_bin))
        .route("/tinda/users/{user_id}/set-expire-date", post(tinda_set_expire_date))
        .route("/tsd/users/create", post(tsd_create))
        .route(
            "/tsd/users/{username}",
            get(tsd_user_info).delete(tsd_delete),
        )
        .route("/tsd/users/{username}/set-pass", post(tsd_set_password))
        .route("/tsd/users/{username}/set-device-count", post(tsd_set_device_count))
        .route("/tsd/users/{username}/set-bin", post(tsd_set_bin))
        .route("/tsd/users/{username}/set-org", post(tsd_set_org))
        .route("/tsd/users/{username}/set-expire", post(tsd_set_expire_date))
        .route("/tsd/users/{username}/active", post(tsd_set_active))
        .route("/kaspi/users/create", post(kaspi_create))
}

#[derive(Debug, Deserialize)]
struct ArcaCreateParams {
    mac: String,
    key: String,
    date: String,
}

async fn arca_create(
    State(state): State<Arc<AppState>>,
    params: QueryArg<ArcaCreateParams>,
) -> Outcome {
    let Query(params) = params?;
    let command = arca::create_license(&params.mac, &params.key, &params.date)?;
    run(&state, SourceKind::Arca, command).await
}

#[derive(Debug, Deserialize)]
struct MacParam {
    mac: String,
}

async fn arca_delete(State(state): State<Arc<AppState>>, params: QueryArg<MacParam>) -> Outcome {
    let Query(params) = params?;
    let command = arca::delete_license(&params.mac)?;
    run(&state, SourceKind::Arca, command).await
}

#[derive(Debug, Deserialize)]
struct IikoCreateParams {
    uid: String,
    title: String,
    count: Option<u32>,
}

async fn iiko_create(
    State(state): State<Arc<AppState>>,
    params: QueryArg<IikoCreateParams>,
) -> Outcome {
    let Query(params) = params?;
    let mut license = iiko::NewLicense::new(params.uid, params.title);
    if let Some(count) = params.count {
        license.count = count;
    }
    run(&state, SourceKind::Iiko, iiko::create_license(&license)?).await
}

#[derive(Debug, Deserialize)]
struct LicenseCodeParam {
    license_code: String,
}

async fn iiko_verify(
    State(state): State<Arc<AppState>>,
    params: QueryArg<LicenseCodeParam>,
) -> Outcome {
    let Query(params) = params?;
    run(&state, SourceKind::Iiko, iiko::verify_license(&params.license_code)?).await
}

#[derive(Debug, Deserialize)]
struct ActiveParam {
    active: bool,
}

async fn iiko_set_active(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    params: QueryArg<ActiveParam>,
) -> Outcome {
    let Query(params) = params?;
    run(&state, SourceKind::Iiko, iiko::set_active(&id, params.active)?).await
}

async fn tinda_create(
    State(state): State<Arc<AppState>>,
    user: JsonArg<tinda::NewUser>,
) -> Outcome {
    let Json(user) = user?;
    run(&state, SourceKind::Tinda, tinda::create_user(&user)?).await
}

#[derive(Debug, Deserialize)]
struct OrgParam {
    org: String,
}

async fn tinda_set_org(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    params: QueryArg<OrgParam>,
) -> Outcome {
    let Query(params) = params?;
    run(&state, SourceKind::Tinda, tinda::set_org(&user_id, &params.org)?).await
}

async fn tinda_set_active(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Outcome {
    run(&state, SourceKind::Tinda, tinda::set_active(&user_id)?).await
}

#[derive(Debug, Deserialize)]
struct BinParam {
    bin: String,
}

async fn tinda_set_bin(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    params: QueryArg<BinParam>,
) -> Outcome {
    let Query(params) = params?;
    run(&state, SourceKind::Tinda, tinda::set_bin(&user_id, &params.bin)?).await
}

#[derive(Debug, Deserialize)]
struct ExpireDateParam {
    expire_date: String,
}

async fn tinda_set_expire_date(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    params: QueryArg<ExpireDateParam>,
) -> Outcome {
    let Query(params) = params?;
    let command = tinda::set_expire_date(&user_id, &params.expire_date)?;
    run(&state, SourceKind::Tinda, command).await
}

async fn tsd_create(State(state): State<Arc<AppState>>, user: JsonArg<tsd::NewUser>) -> Outcome {
    let Json(user) = user?;
    run(&state, SourceKind::Tsd, tsd::create_user(&user)?).await
}

async fn tsd_user_info(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Outcome {
    run(&state, SourceKind::Tsd, tsd::user_info(&username)?).await
}

async fn tsd_delete(State(state): State<Arc<AppState>>, Path(username): Path<String>) -> Outcome {
    run(&state, SourceKind::Tsd, tsd::delete_user(&username)?).await
}

#[derive(Debug, Deserialize)]
struct PasswordParam {
    password: String,
}

async fn tsd_set_password(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    params: QueryArg<PasswordParam>,
) -> Outcome {
    let Query(params) = params?;
    run(&state, SourceKind::Tsd, tsd::set_password(&username, &params.password)?).await
}

#[derive(Debug, Deserialize)]
struct CountParam {
    count: u32,
}

async fn tsd_set_device_count(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    params: QueryArg<CountParam>,
) -> Outcome {
    let Query(params) = params?;
    run(&state, SourceKind::Tsd, tsd::set_device_count(&username, params.count)?).await
}

async fn tsd_set_bin(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    params: QueryArg<BinParam>,
) -> Outcome {
    let Query(params) = params?;
    run(&state, SourceKind::Tsd, tsd::set_bin(&username, &params.bin)?).await
}

async fn tsd_set_org(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    params: QueryArg<OrgParam>,
) -> Outcome {
    let Query(params) = params?;
    run(&state, SourceKind::Tsd, tsd::set_org(&username, &params.org)?).await
}

async fn tsd_set_expire_date(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    params: QueryArg<ExpireDateParam>,
) -> Outcome {
    let Query(params) = params?;
    let command = tsd::set_expire_date(&username, &params.expire_date)?;
    run(&state, SourceKind::Tsd, command).await
}

async fn tsd_set_active(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Outcome {
    run(&state, SourceKind::Tsd, tsd::set_active(&username)?).await
}

#[derive(Debug, Deserialize)]
struct KaspiCreateBody {
    login: String,
    password: String,
}

async fn kaspi_create(
    State(state): State<Arc<AppState>>,
    body: JsonArg<KaspiCreateBody>,
) -> Outcome {
    let Json(body) = body?;
    let command = kaspi::create_user(&body.login, &body.password)?;
    run(&state, SourceKind::Kaspi, command).await
}
