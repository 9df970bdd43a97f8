//! Axum HTTP surface for Bayline: platform webhook, reconciliation trigger, and staff job API.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, Path, Query, Request, State},
    http::{header, request::Parts, HeaderMap, Uri},
    routing::{get, post, put},
    Json, Router,
};
use bayline_core::{
    Actor, ChecklistItem, IssueType, Job, JobCommand, JobStateMachine, JobUpdate, NoShowReason,
    NoShowResolution, PaymentStatus, PhotoUpload, Role, VehicleInfo, WorkStatus,
};
use bayline_square::{constant_time_eq, SIGNATURE_HEADER};
use bayline_storage::JobStore;
use bayline_sync::{IngestOutcome, ReconcileSummary, SyncConfig, SyncServices};
use chrono::Utc;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

mod error;

pub use error::{ApiError, ApiErrorBody, ApiResult};

pub const CRATE_NAME: &str = "bayline-web";

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_NAME_HEADER: &str = "x-actor-name";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

#[derive(Clone)]
pub struct AppState {
    pub services: SyncServices,
    pub webhook_url: Option<String>,
    pub cron_secret: Option<String>,
}

impl AppState {
    pub fn new(services: SyncServices, config: &SyncConfig) -> Self {
        Self {
            services,
            webhook_url: config.webhook_url.clone(),
            cron_secret: config.cron_secret.clone(),
        }
    }

    fn store(&self) -> &dyn JobStore {
        self.services.store.as_ref()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/webhooks/square", post(square_webhook_handler))
        .route("/api/cron/reconcile", get(cron_reconcile_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs/by-booking/{booking_id}", get(job_by_booking_handler))
        .route("/api/jobs/{job_id}", get(get_job_handler))
        .route("/api/jobs/{job_id}/status", post(change_status_handler))
        .route("/api/jobs/{job_id}/no-show", post(mark_no_show_handler))
        .route("/api/jobs/{job_id}/no-show/resolve", post(resolve_no_show_handler))
        .route("/api/jobs/{job_id}/issue", post(open_issue_handler))
        .route("/api/jobs/{job_id}/issue/resolve", post(resolve_issue_handler))
        .route("/api/jobs/{job_id}/payment", post(payment_handler))
        .route("/api/jobs/{job_id}/receipt-photos", post(receipt_photo_handler))
        .route("/api/jobs/{job_id}/photos", post(photo_handler))
        .route("/api/jobs/{job_id}/checklist", put(checklist_handler))
        .route("/api/jobs/{job_id}/vehicle", put(vehicle_handler))
        .route("/api/jobs/{job_id}/notes", put(notes_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Identity forwarded by the authenticating proxy in front of this service.
#[derive(Debug, Clone)]
pub struct StaffActor(pub Actor);

impl<S: Send + Sync> FromRequestParts<S> for StaffActor {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let user_id = header(ACTOR_ID_HEADER)
            .ok_or_else(|| ApiError::unauthorized("missing actor identity"))?;
        let name = header(ACTOR_NAME_HEADER).unwrap_or(user_id);
        let role = match header(ACTOR_ROLE_HEADER).map(str::to_ascii_uppercase).as_deref() {
            Some("TECHNICIAN") => Role::Technician,
            Some("MANAGER") => Role::Manager,
            Some("ADMIN") => Role::Admin,
            _ => return Err(ApiError::unauthorized("missing or unknown actor role")),
        };
        Ok(Self(Actor::new(user_id, name, role)))
    }
}

/// `Json` whose rejections use the API error body.
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn square_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> ApiResult<Json<IngestOutcome>> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let url = notification_url(state.webhook_url.as_deref(), &headers, &uri);
    let outcome = state.services.ingest.ingest(&body, signature, &url).await?;
    Ok(Json(outcome))
}

/// The URL the platform signed: the configured one, else rebuilt from the request.
fn notification_url(configured: Option<&str>, headers: &HeaderMap, uri: &Uri) -> String {
    if let Some(url) = configured {
        return url.to_string();
    }
    let value = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let proto = value("x-forwarded-proto").unwrap_or("https");
    let host = value(header::HOST.as_str()).unwrap_or("localhost");
    let path = uri.path_and_query().map_or(uri.path(), |pq| pq.as_str());
    format!("{proto}://{host}{path}")
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReconcileQuery {
    token: Option<String>,
    #[serde(default)]
    dry_run: bool,
    days_back: Option<i64>,
    days_ahead: Option<i64>,
}

async fn cron_reconcile_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReconcileQuery>,
) -> ApiResult<Json<ReconcileSummary>> {
    let authorized = match (state.cron_secret.as_deref(), query.token.as_deref()) {
        (Some(secret), Some(token)) => constant_time_eq(secret.as_bytes(), token.as_bytes()),
        _ => false,
    };
    if !authorized {
        return Err(ApiError::unauthorized("invalid or missing reconcile token"));
    }
    let engine = &state.services.reconcile;
    let window = engine.window(Utc::now(), query.days_back, query.days_ahead)?;
    let summary = engine.run(window, query.dry_run).await?;
    Ok(Json(summary))
}

async fn list_jobs_handler(
    State(state): State<Arc<AppState>>,
    StaffActor(_actor): StaffActor,
) -> ApiResult<Json<Vec<Job>>> {
    let mut jobs = state.store().list_jobs().await?;
    jobs.sort_by(|a, b| {
        a.appointment_time
            .cmp(&b.appointment_time)
            .then_with(|| a.booking_id.cmp(&b.booking_id))
    });
    Ok(Json(jobs))
}

async fn get_job_handler(
    State(state): State<Arc<AppState>>,
    StaffActor(_actor): StaffActor,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    let job = state
        .store()
        .get_job(job_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {job_id} not found")))?;
    Ok(Json(job))
}

async fn job_by_booking_handler(
    State(state): State<Arc<AppState>>,
    StaffActor(_actor): StaffActor,
    Path(booking_id): Path<String>,
) -> ApiResult<Json<Job>> {
    let job = state
        .store()
        .get_job_by_booking_id(&booking_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no job for booking {booking_id}")))?;
    Ok(Json(job))
}

/// Load, run the state machine, persist the resulting staff patch.
async fn run_command(
    state: &AppState,
    job_id: Uuid,
    actor: &Actor,
    command: JobCommand,
) -> ApiResult<Json<Job>> {
    let job = state
        .store()
        .get_job(job_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {job_id} not found")))?;
    let operation = command.name();
    let patch = JobStateMachine::apply(&job, command, actor, Utc::now())?;
    let updated = state
        .store()
        .update_job(job_id, JobUpdate::Staff(patch))
        .await?;
    info!(
        %job_id,
        operation,
        actor = %actor.user_id,
        work_status = %updated.work_status,
        "staff update applied"
    );
    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    to: WorkStatus,
    reason: Option<String>,
}

async fn change_status_handler(
    State(state): State<Arc<AppState>>,
    StaffActor(actor): StaffActor,
    Path(job_id): Path<Uuid>,
    ApiJson(req): ApiJson<StatusRequest>,
) -> ApiResult<Json<Job>> {
    let command = JobCommand::ChangeStatus {
        to: req.to,
        reason: req.reason,
    };
    run_command(&state, job_id, &actor, command).await
}

#[derive(Debug, Deserialize)]
struct NoShowRequest {
    reason: NoShowReason,
    notes: Option<String>,
}

async fn mark_no_show_handler(
    State(state): State<Arc<AppState>>,
    StaffActor(actor): StaffActor,
    Path(job_id): Path<Uuid>,
    ApiJson(req): ApiJson<NoShowRequest>,
) -> ApiResult<Json<Job>> {
    let command = JobCommand::MarkNoShow {
        reason: req.reason,
        notes: req.notes,
    };
    run_command(&state, job_id, &actor, command).await
}

#[derive(Debug, Deserialize)]
struct ResolveNoShowRequest {
    resolution: NoShowResolution,
    notes: Option<String>,
}

async fn resolve_no_show_handler(
    State(state): State<Arc<AppState>>,
    StaffActor(actor): StaffActor,
    Path(job_id): Path<Uuid>,
    ApiJson(req): ApiJson<ResolveNoShowRequest>,
) -> ApiResult<Json<Job>> {
    let command = JobCommand::ResolveNoShow {
        resolution: req.resolution,
        notes: req.notes,
    };
    run_command(&state, job_id, &actor, command).await
}

#[derive(Debug, Deserialize)]
struct IssueRequest {
    #[serde(rename = "type")]
    issue_type: IssueType,
    notes: Option<String>,
}

async fn open_issue_handler(
    State(state): State<Arc<AppState>>,
    StaffActor(actor): StaffActor,
    Path(job_id): Path<Uuid>,
    ApiJson(req): ApiJson<IssueRequest>,
) -> ApiResult<Json<Job>> {
    let command = JobCommand::OpenIssue {
        issue_type: req.issue_type,
        notes: req.notes,
    };
    run_command(&state, job_id, &actor, command).await
}

#[derive(Debug, Default, Deserialize)]
struct NotesOnly {
    notes: Option<String>,
}

async fn resolve_issue_handler(
    State(state): State<Arc<AppState>>,
    StaffActor(actor): StaffActor,
    Path(job_id): Path<Uuid>,
    ApiJson(req): ApiJson<NotesOnly>,
) -> ApiResult<Json<Job>> {
    let command = JobCommand::ResolveIssue { notes: req.notes };
    run_command(&state, job_id, &actor, command).await
}

#[derive(Debug, Deserialize)]
struct PaymentRequest {
    status: PaymentStatus,
    method: Option<String>,
    reason: Option<String>,
}

async fn payment_handler(
    State(state): State<Arc<AppState>>,
    StaffActor(actor): StaffActor,
    Path(job_id): Path<Uuid>,
    ApiJson(req): ApiJson<PaymentRequest>,
) -> ApiResult<Json<Job>> {
    let command = JobCommand::SetPayment {
        status: req.status,
        method: req.method,
        reason: req.reason,
    };
    run_command(&state, job_id, &actor, command).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhotoRequest {
    key: String,
    content_type: Option<String>,
    caption: Option<String>,
}

impl From<PhotoRequest> for PhotoUpload {
    fn from(req: PhotoRequest) -> Self {
        Self {
            key: req.key,
            content_type: req.content_type,
            caption: req.caption,
        }
    }
}

async fn receipt_photo_handler(
    State(state): State<Arc<AppState>>,
    StaffActor(actor): StaffActor,
    Path(job_id): Path<Uuid>,
    ApiJson(req): ApiJson<PhotoRequest>,
) -> ApiResult<Json<Job>> {
    run_command(&state, job_id, &actor, JobCommand::AddReceiptPhoto(req.into())).await
}

async fn photo_handler(
    State(state): State<Arc<AppState>>,
    StaffActor(actor): StaffActor,
    Path(job_id): Path<Uuid>,
    ApiJson(req): ApiJson<PhotoRequest>,
) -> ApiResult<Json<Job>> {
    run_command(&state, job_id, &actor, JobCommand::AddPhoto(req.into())).await
}

#[derive(Debug, Deserialize)]
struct ChecklistRequest {
    items: Vec<ChecklistItem>,
}

async fn checklist_handler(
    State(state): State<Arc<AppState>>,
    StaffActor(actor): StaffActor,
    Path(job_id): Path<Uuid>,
    ApiJson(req): ApiJson<ChecklistRequest>,
) -> ApiResult<Json<Job>> {
    run_command(&state, job_id, &actor, JobCommand::UpdateChecklist(req.items)).await
}

async fn vehicle_handler(
    State(state): State<Arc<AppState>>,
    StaffActor(actor): StaffActor,
    Path(job_id): Path<Uuid>,
    ApiJson(req): ApiJson<VehicleInfo>,
) -> ApiResult<Json<Job>> {
    run_command(&state, job_id, &actor, JobCommand::UpdateVehicleInfo(req)).await
}

#[derive(Debug, Deserialize)]
struct NotesRequest {
    notes: String,
}

async fn notes_handler(
    State(state): State<Arc<AppState>>,
    StaffActor(actor): StaffActor,
    Path(job_id): Path<Uuid>,
    ApiJson(req): ApiJson<NotesRequest>,
) -> ApiResult<Json<Job>> {
    run_command(&state, job_id, &actor, JobCommand::UpdateNotes(req.notes)).await
}
