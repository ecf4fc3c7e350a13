use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use lead_tracker_core::{
    classify, now_utc, since_days, Agent, AgentInput, Attribution, AttributionRules, Caller, Lead,
    LeadInput, LeadProgress, LeadStatus, LoginEvent, LoginEventInput, MisRecord, MisRowInput,
    VisibilityScope,
};
use lead_tracker_store_sqlite::{
    DashboardSummary, IngestReport, LeadFilter, LoginLogEntry, MisAnalytics, MisRecordFilter,
    MisStatistics, MisUpload, SchemaStatus, SqliteTrackerStore, DEFAULT_RECORD_LIMIT,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "lead_service.v1";

/// Header the upstream gateway sets to the authenticated agent's username.
const CALLER_HEADER: &str = "x-agent-username";

const DEFAULT_WINDOW_DAYS: u32 = 30;

#[derive(Debug, Clone)]
struct ServiceState {
    db_path: PathBuf,
    rules: Arc<AttributionRules>,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    rules_version: u32,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    checks: SchemaStatus,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    unauthenticated_total: AtomicU64,
    forbidden_total: AtomicU64,
    not_found_total: AtomicU64,
    validation_error_total: AtomicU64,
    write_conflict_total: AtomicU64,
    schema_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    unauthenticated_total: u64,
    forbidden_total: u64,
    not_found_total: u64,
    validation_error_total: u64,
    write_conflict_total: u64,
    schema_unavailable_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct ClassifyRequest {
    campaign_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ClassifyResponse {
    rules_version: u32,
    campaign_id: Option<String>,
    #[serde(flatten)]
    attribution: Attribution,
}

#[derive(Debug, Clone, Deserialize)]
struct MisUploadRequest {
    file_name: String,
    rows: Vec<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
struct LeadStatusRequest {
    status: LeadStatus,
    notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct LeadDetail {
    lead: Lead,
    progress: Vec<LeadProgress>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct WindowQuery {
    days: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MisRecordsQuery {
    campaign_id: Option<String>,
    owner_tag: Option<String>,
    distributor_only: Option<bool>,
    limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LeadsQuery {
    status: Option<LeadStatus>,
    created_by: Option<i64>,
    campaign_tag: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LoginsQuery {
    days: Option<u32>,
    limit: Option<usize>,
}

#[derive(Debug, Parser)]
#[command(name = "lead-tracker-service")]
#[command(about = "Local HTTP service for the lead tracker")]
struct Args {
    #[arg(long, env = "LEAD_TRACKER_DB", default_value = "./lead_tracker.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "LEAD_TRACKER_BIND", default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    #[arg(long, env = "LEAD_TRACKER_RULES")]
    rules: Option<PathBuf>,
    #[arg(long, env = "LEAD_TRACKER_TIMEOUT_MS", default_value_t = 2500)]
    operation_timeout_ms: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> ServiceFailure {
        ServiceFailure { status, code, message: message.into(), details }
    }

    fn invalid_json(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({ "rejection": rejection.to_string() })),
        )
    }

    fn invalid_query(&self, rejection: &QueryRejection) -> ServiceFailure {
        self.telemetry.record_failure("validation_error", false);
        Self::failure(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text(), None)
    }

    /// Reads the caller's username from the gateway header. Whether that
    /// agent exists and is active is decided later, against the store.
    fn caller_username(&self, headers: &HeaderMap) -> Result<String, ServiceFailure> {
        let username = headers
            .get(CALLER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());

        match username {
            Some(username) => Ok(username.to_string()),
            None => {
                self.telemetry.record_failure("unauthenticated", false);
                Err(Self::failure(
                    StatusCode::UNAUTHORIZED,
                    "unauthenticated",
                    format!("missing `{CALLER_HEADER}` header"),
                    None,
                ))
            }
        }
    }

    fn classify_api_error(
        err: &anyhow::Error,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        let message = err.to_string();
        let diagnostic = format!("{err:#}");
        let normalized = diagnostic.to_ascii_lowercase();

        if normalized.contains("unauthenticated:") {
            return Self::failure(StatusCode::UNAUTHORIZED, "unauthenticated", message, None);
        }

        if normalized.contains("forbidden:") {
            return Self::failure(StatusCode::FORBIDDEN, "forbidden", message, None);
        }

        if normalized.contains("not found:") {
            return Self::failure(StatusCode::NOT_FOUND, "not_found", message, None);
        }

        if normalized.contains("write conflict")
            || normalized.contains("unique constraint failed")
            || normalized.contains("foreign key constraint failed")
        {
            return Self::failure(StatusCode::CONFLICT, "write_conflict", message, None);
        }

        if normalized.contains("validation error:") || normalized.contains("configuration error:") {
            return Self::failure(StatusCode::BAD_REQUEST, "validation_error", message, None);
        }

        if normalized.contains("schema")
            || normalized.contains("sqlite")
            || normalized.contains("database")
            || normalized.contains("no such table")
        {
            return Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "schema_unavailable",
                message,
                None,
            );
        }

        Self::failure(default_status, default_code, message, None)
    }

    /// Opens the store on a blocking thread and runs `op` under the
    /// operation timeout.
    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteTrackerStore, &AttributionRules) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let db_path = self.db_path.clone();
        let rules = Arc::clone(&self.rules);
        let handle = tokio::task::spawn_blocking(move || {
            let mut store = SqliteTrackerStore::open(&db_path)?;
            op(&mut store, rules.as_ref())
        });
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                self.telemetry.record_failure(default_code, true);
                tracing::warn!(operation = operation_label, "operation timed out");
                Self::failure(
                    default_status,
                    default_code,
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_api_error(&err, default_status, default_code);
                if failure.status.is_server_error() {
                    tracing::error!(operation = operation_label, error = %format!("{err:#}"), "operation failed");
                } else {
                    tracing::debug!(operation = operation_label, code = failure.code, "request rejected");
                }
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "invalid_json" => &self.invalid_json_total,
            "unauthenticated" => &self.unauthenticated_total,
            "forbidden" => &self.forbidden_total,
            "not_found" => &self.not_found_total,
            "validation_error" => &self.validation_error_total,
            "write_conflict" => &self.write_conflict_total,
            "schema_unavailable" => &self.schema_unavailable_total,
            "internal_error" => &self.internal_error_total,
            _ => &self.other_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            unauthenticated_total: self.unauthenticated_total.load(Ordering::Relaxed),
            forbidden_total: self.forbidden_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            write_conflict_total: self.write_conflict_total.load(Ordering::Relaxed),
            schema_unavailable_total: self.schema_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope { service_contract_version: SERVICE_CONTRACT_VERSION, data }
}

/// Resolves the caller and their visibility scope for this request only.
fn caller_scope(store: &SqliteTrackerStore, username: &str) -> Result<(Caller, VisibilityScope)> {
    let caller = store.caller_for_username(username)?;
    let scope = store.scope_for(&caller)?;
    Ok((caller, scope))
}

/// Flattens one JSON row into MIS cells. Nulls are dropped; numbers and
/// booleans keep their JSON text.
fn mis_row_from_json(row: BTreeMap<String, Value>) -> MisRowInput {
    let fields = row
        .into_iter()
        .filter_map(|(column, value)| {
            let cell = match value {
                Value::Null => return None,
                Value::String(text) => text,
                other => other.to_string(),
            };
            Some((column.trim().to_string(), cell))
        })
        .collect();
    MisRowInput::from_columns(fields)
}

fn load_rules(path: Option<&FsPath>) -> Result<AttributionRules> {
    let Some(path) = path else {
        return Ok(AttributionRules::v1());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read attribution rules {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    Ok(AttributionRules::from_json(&value)?)
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/ready", get(ready))
        .route("/v1/classify", post(classify_campaign))
        .route("/v1/agents", get(agents_list).post(agents_create))
        .route("/v1/mis/upload", post(mis_upload))
        .route("/v1/mis/records", get(mis_records))
        .route("/v1/mis/stats", get(mis_stats))
        .route("/v1/mis/analytics", get(mis_analytics))
        .route("/v1/mis/uploads", get(mis_uploads))
        .route("/v1/leads", get(leads_list).post(leads_create))
        .route("/v1/leads/:lead_id", get(lead_show))
        .route("/v1/leads/:lead_id/status", post(lead_update_status))
        .route("/v1/logins", get(logins_list).post(logins_record))
        .route("/v1/dashboard", get(dashboard))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lead_tracker_service=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let rules = load_rules(args.rules.as_deref())?;

    let store = SqliteTrackerStore::open(&args.db)?;
    store.migrate()?;
    drop(store);

    let state = ServiceState {
        db_path: args.db,
        rules: Arc::new(rules),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, rules_version = state.rules.rules_version, "lead tracker service listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        rules_version: state.rules.rules_version,
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn ready(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ReadinessResponse>>, ServiceFailure> {
    let status = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "schema_unavailable",
            "schema_status",
            |store, _| store.schema_status(),
        )
        .await?;

    if status.up_to_date {
        return Ok(Json(envelope(ReadinessResponse { status: "ready", checks: status })));
    }

    state.telemetry.record_failure("schema_unavailable", false);
    Err(ServiceState::failure(
        StatusCode::SERVICE_UNAVAILABLE,
        "schema_unavailable",
        "database schema is not ready; restart the service to migrate it",
        Some(json!({
            "current_version": status.current_version,
            "target_version": status.target_version,
        })),
    ))
}

async fn classify_campaign(
    State(state): State<ServiceState>,
    payload: Result<Json<ClassifyRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<ClassifyResponse>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    state.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
    let attribution = classify(request.campaign_id.as_deref(), &state.rules);
    state.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
    Ok(Json(envelope(ClassifyResponse {
        rules_version: state.rules.rules_version,
        campaign_id: request.campaign_id,
        attribution,
    })))
}

async fn agents_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Vec<Agent>>>, ServiceFailure> {
    let username = state.caller_username(&headers)?;
    let agents = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "query_failed", "agents_list", move |store, _| {
            let (_, scope) = caller_scope(store, &username)?;
            store.list_agents(&scope)
        })
        .await?;
    Ok(Json(envelope(agents)))
}

async fn agents_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<AgentInput>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Agent>>, ServiceFailure> {
    let username = state.caller_username(&headers)?;
    let Json(input) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let agent = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "write_failed", "agents_create", move |store, _| {
            let actor = store.caller_for_username(&username)?;
            store.create_agent(&actor, &input)
        })
        .await?;
    Ok(Json(envelope(agent)))
}

async fn mis_upload(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<MisUploadRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<IngestReport>>, ServiceFailure> {
    let username = state.caller_username(&headers)?;
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let report = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "write_failed", "mis_upload", move |store, rules| {
            let uploader = store.caller_for_username(&username)?;
            let rows: Vec<MisRowInput> = request.rows.into_iter().map(mis_row_from_json).collect();
            store.ingest_mis_batch(&uploader, &request.file_name, &rows, rules)
        })
        .await?;
    Ok(Json(envelope(report)))
}

async fn mis_records(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    query: Result<Query<MisRecordsQuery>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<Vec<MisRecord>>>, ServiceFailure> {
    let username = state.caller_username(&headers)?;
    let Query(query) = query.map_err(|rejection| state.invalid_query(&rejection))?;
    let records = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "query_failed", "mis_records", move |store, _| {
            let (_, scope) = caller_scope(store, &username)?;
            store.list_mis_records(
                &scope,
                &MisRecordFilter {
                    campaign_id: query.campaign_id,
                    owner_tag: query.owner_tag,
                    distributor_only: query.distributor_only.unwrap_or(false),
                    limit: query.limit.unwrap_or(DEFAULT_RECORD_LIMIT),
                },
            )
        })
        .await?;
    Ok(Json(envelope(records)))
}

async fn mis_stats(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    query: Result<Query<WindowQuery>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<MisStatistics>>, ServiceFailure> {
    let username = state.caller_username(&headers)?;
    let Query(query) = query.map_err(|rejection| state.invalid_query(&rejection))?;
    let days = query.days.unwrap_or(DEFAULT_WINDOW_DAYS);
    let stats = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "query_failed", "mis_stats", move |store, _| {
            let (_, scope) = caller_scope(store, &username)?;
            store.mis_statistics(&scope, since_days(now_utc(), days))
        })
        .await?;
    Ok(Json(envelope(stats)))
}

async fn mis_analytics(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    query: Result<Query<WindowQuery>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<MisAnalytics>>, ServiceFailure> {
    let username = state.caller_username(&headers)?;
    let Query(query) = query.map_err(|rejection| state.invalid_query(&rejection))?;
    let days = query.days.unwrap_or(DEFAULT_WINDOW_DAYS);
    let analytics = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "query_failed", "mis_analytics", move |store, _| {
            let (_, scope) = caller_scope(store, &username)?;
            store.mis_analytics(&scope, since_days(now_utc(), days))
        })
        .await?;
    Ok(Json(envelope(analytics)))
}

async fn mis_uploads(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Vec<MisUpload>>>, ServiceFailure> {
    let username = state.caller_username(&headers)?;
    let uploads = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "query_failed", "mis_uploads", move |store, _| {
            let (_, scope) = caller_scope(store, &username)?;
            store.list_mis_uploads(&scope)
        })
        .await?;
    Ok(Json(envelope(uploads)))
}

async fn leads_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    query: Result<Query<LeadsQuery>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<Vec<Lead>>>, ServiceFailure> {
    let username = state.caller_username(&headers)?;
    let Query(query) = query.map_err(|rejection| state.invalid_query(&rejection))?;
    let leads = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "query_failed", "leads_list", move |store, _| {
            let (_, scope) = caller_scope(store, &username)?;
            store.list_leads(
                &scope,
                &LeadFilter {
                    status: query.status,
                    created_by: query.created_by.map(lead_tracker_core::AgentId),
                    campaign_tag: query.campaign_tag,
                    limit: query.limit.unwrap_or(DEFAULT_RECORD_LIMIT),
                },
            )
        })
        .await?;
    Ok(Json(envelope(leads)))
}

async fn leads_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<LeadInput>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Lead>>, ServiceFailure> {
    let username = state.caller_username(&headers)?;
    let Json(input) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let lead = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "write_failed", "leads_create", move |store, _| {
            let creator = store.caller_for_username(&username)?;
            store.create_lead(&creator, &input)
        })
        .await?;
    Ok(Json(envelope(lead)))
}

async fn lead_show(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(lead_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<LeadDetail>>, ServiceFailure> {
    let username = state.caller_username(&headers)?;
    let detail = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "query_failed", "lead_show", move |store, _| {
            let (_, scope) = caller_scope(store, &username)?;
            let lead = store
                .get_lead(&scope, lead_id)?
                .ok_or_else(|| anyhow::anyhow!("not found: lead {lead_id}"))?;
            let progress = store.lead_progress(&scope, lead_id)?;
            Ok(LeadDetail { lead, progress })
        })
        .await?;
    Ok(Json(envelope(detail)))
}

async fn lead_update_status(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(lead_id): Path<i64>,
    payload: Result<Json<LeadStatusRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Lead>>, ServiceFailure> {
    let username = state.caller_username(&headers)?;
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let lead = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "lead_update_status",
            move |store, _| {
                let actor = store.caller_for_username(&username)?;
                store.update_lead_status(&actor, lead_id, request.status, request.notes.as_deref())
            },
        )
        .await?;
    Ok(Json(envelope(lead)))
}

async fn logins_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    query: Result<Query<LoginsQuery>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<Vec<LoginLogEntry>>>, ServiceFailure> {
    let username = state.caller_username(&headers)?;
    let Query(query) = query.map_err(|rejection| state.invalid_query(&rejection))?;
    let days = query.days.unwrap_or(DEFAULT_WINDOW_DAYS);
    let logs = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "query_failed", "logins_list", move |store, _| {
            let (_, scope) = caller_scope(store, &username)?;
            store.list_login_logs(
                &scope,
                since_days(now_utc(), days),
                query.limit.unwrap_or(DEFAULT_RECORD_LIMIT),
            )
        })
        .await?;
    Ok(Json(envelope(logs)))
}

async fn logins_record(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<LoginEventInput>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<LoginEvent>>, ServiceFailure> {
    let username = state.caller_username(&headers)?;
    let Json(input) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let event = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "write_failed", "logins_record", move |store, _| {
            let caller = store.caller_for_username(&username)?;
            store.record_login(caller.agent_id, &input)
        })
        .await?;
    Ok(Json(envelope(event)))
}

async fn dashboard(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    query: Result<Query<WindowQuery>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<DashboardSummary>>, ServiceFailure> {
    let username = state.caller_username(&headers)?;
    let Query(query) = query.map_err(|rejection| state.invalid_query(&rejection))?;
    let days = query.days.unwrap_or(DEFAULT_WINDOW_DAYS);
    let summary = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "query_failed", "dashboard", move |store, _| {
            let caller = store.caller_for_username(&username)?;
            store.dashboard(&caller, now_utc(), days)
        })
        .await?;
    Ok(Json(envelope(summary)))
}
