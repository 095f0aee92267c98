use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use roster_kernel_api::{
    AttendanceRequest, Autosave, CreateStudentRequest, ImportOptions, PollRequest,
    RegisterRequest, Registry, RosterStatus, StudentView, API_CONTRACT_VERSION,
};
use roster_kernel_core::{
    ChannelMessage, ImportSummary, ParticipationLine, PollSummary, RegistryError, RosterId,
    StudentNumber,
};
use roster_kernel_store_file::{FileRosterStore, SaveReport, StoreError};
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod shutdown;

use shutdown::shutdown_signal;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    registry: Registry,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    kind: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    roster_id: String,
}

#[derive(Debug, Parser)]
#[command(name = "roster-kernel-service")]
#[command(about = "Local HTTP service for the student roster")]
struct Args {
    #[arg(long, env = "ROSTER_DATA_DIR", default_value = "./roster-data")]
    data_dir: PathBuf,
    #[arg(long, env = "ROSTER_ID")]
    roster_id: String,
    #[arg(long, env = "ROSTER_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "ROSTER_AUTOSAVE_INTERVAL", default_value_t = 600)]
    autosave_interval_secs: u64,
}

impl ServiceError {
    fn from_error(err: &anyhow::Error) -> Self {
        let (status, kind) = match err.downcast_ref::<RegistryError>() {
            Some(RegistryError::NotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
            Some(RegistryError::Duplicate(_)) => (StatusCode::CONFLICT, "duplicate"),
            Some(RegistryError::AlreadyRegistered(_)) => (StatusCode::CONFLICT, "already_registered"),
            Some(RegistryError::IdentityInUse { .. }) => (StatusCode::CONFLICT, "identity_in_use"),
            Some(RegistryError::InvalidSecret) => (StatusCode::UNAUTHORIZED, "invalid_secret"),
            Some(RegistryError::Validation(_)) => (StatusCode::BAD_REQUEST, "validation"),
            None if err.downcast_ref::<StoreError>().is_some() => {
                (StatusCode::INTERNAL_SERVER_ERROR, "storage")
            }
            None => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            error!(error = %format!("{err:#}"), "request failed");
        }
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            kind,
            error: format!("{err:#}"),
        }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        Self::from_error(&err)
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

type ServiceResult<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

fn envelope<T>(data: T) -> Json<ServiceEnvelope<T>>
where
    T: Serialize,
{
    Json(ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    })
}

fn csv_response(body: String) -> Response {
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/csv; charset=utf-8")], body).into_response()
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/students", get(student_list).post(student_create))
        .route("/v1/students/:number", get(student_show).delete(student_remove))
        .route("/v1/students/:number/reset", post(student_reset))
        .route("/v1/students/:number/secret", post(student_rotate_secret))
        .route("/v1/students/:number/record", get(student_record))
        .route("/v1/register", post(register))
        .route("/v1/identities/:identity_id", get(identity_show))
        .route("/v1/roster/status", get(roster_status))
        .route("/v1/roster/export", get(roster_export))
        .route("/v1/roster/import", post(roster_import))
        .route("/v1/roster/save", post(roster_save))
        .route("/v1/reports/words", post(report_words))
        .route("/v1/reports/poll", post(report_poll))
        .route("/v1/reports/attendance", post(report_attendance))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let roster_id = RosterId::parse(&args.roster_id)?;
    let registry = Registry::create_or_load(FileRosterStore::new(&args.data_dir), roster_id)?;
    let autosave =
        Autosave::spawn(registry.clone(), Duration::from_secs(args.autosave_interval_secs));

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(bind = %args.bind, roster_id = %registry.roster_id(), "roster service listening");
    let served = axum::serve(listener, app(ServiceState { registry }))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let saved = autosave.shutdown().await;
    if let Err(err) = &served {
        warn!(error = %err, "server stopped with an error");
    }
    let report = saved?;
    info!(students = report.students, path = %report.path.display(), "roster saved on shutdown");
    served.context("roster service failed")
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    envelope(HealthResponse { status: "ok", roster_id: state.registry.roster_id().to_string() })
}

async fn student_list(State(state): State<ServiceState>) -> Json<ServiceEnvelope<Vec<StudentView>>> {
    envelope(state.registry.list())
}

async fn student_create(
    State(state): State<ServiceState>,
    Json(request): Json<CreateStudentRequest>,
) -> ServiceResult<StudentView> {
    Ok(envelope(state.registry.create(request)?))
}

async fn student_show(
    State(state): State<ServiceState>,
    Path(number): Path<u64>,
) -> ServiceResult<StudentView> {
    Ok(envelope(state.registry.lookup_by_number(StudentNumber(number))?))
}

async fn student_remove(
    State(state): State<ServiceState>,
    Path(number): Path<u64>,
) -> ServiceResult<StudentView> {
    Ok(envelope(state.registry.remove(StudentNumber(number))?))
}

async fn student_reset(
    State(state): State<ServiceState>,
    Path(number): Path<u64>,
) -> ServiceResult<StudentView> {
    Ok(envelope(state.registry.reset(StudentNumber(number))?))
}

async fn student_rotate_secret(
    State(state): State<ServiceState>,
    Path(number): Path<u64>,
) -> ServiceResult<StudentView> {
    Ok(envelope(state.registry.regenerate_secret(StudentNumber(number))?))
}

async fn student_record(
    State(state): State<ServiceState>,
    Path(number): Path<u64>,
) -> Result<Response, ServiceError> {
    Ok(csv_response(state.registry.export_student_csv(StudentNumber(number))?))
}

async fn register(
    State(state): State<ServiceState>,
    Json(request): Json<RegisterRequest>,
) -> ServiceResult<StudentView> {
    Ok(envelope(state.registry.register(&request.secret, request.platform_identity)?))
}

async fn identity_show(
    State(state): State<ServiceState>,
    Path(identity_id): Path<u64>,
) -> ServiceResult<StudentView> {
    Ok(envelope(state.registry.lookup_by_identity(identity_id)?))
}

async fn roster_status(State(state): State<ServiceState>) -> Json<ServiceEnvelope<RosterStatus>> {
    envelope(state.registry.status())
}

async fn roster_export(State(state): State<ServiceState>) -> Result<Response, ServiceError> {
    Ok(csv_response(state.registry.export_csv()?))
}

async fn roster_import(
    State(state): State<ServiceState>,
    Query(options): Query<ImportOptions>,
    body: Bytes,
) -> Json<ServiceEnvelope<ImportSummary>> {
    envelope(state.registry.import_csv(&body, options))
}

async fn roster_save(State(state): State<ServiceState>) -> ServiceResult<SaveReport> {
    Ok(envelope(state.registry.flush().await?))
}

async fn report_words(
    State(state): State<ServiceState>,
    Json(messages): Json<Vec<ChannelMessage>>,
) -> Json<ServiceEnvelope<Vec<ParticipationLine>>> {
    envelope(state.registry.word_participation(&messages))
}

async fn report_poll(
    State(state): State<ServiceState>,
    Json(request): Json<PollRequest>,
) -> Json<ServiceEnvelope<PollSummary>> {
    envelope(state.registry.summarize_poll(&request))
}

async fn report_attendance(
    State(state): State<ServiceState>,
    Json(request): Json<AttendanceRequest>,
) -> Json<ServiceEnvelope<Vec<String>>> {
    envelope(state.registry.attendance(&request))
}
