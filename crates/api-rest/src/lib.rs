//! # API REST
//!
//! REST API implementation for the KIA engine.
//!
//! Handles:
//! - HTTP endpoints with axum
//! - OpenAPI/Swagger documentation
//! - REST-specific concerns (request context headers, error mapping, CORS)
//!
//! Uses `api-shared` for the wire types and response envelope.

#![warn(rust_2018_idioms)]

use api_shared::dto::{
    AddVisitReq, CoverageQuery, CoverageRes, DeliveryOutcomeRes, DeliveryRes, EventsQuery,
    ImmunizationRecordRes, ImmunizationStatusRes, OpenPregnancyReq, PregnancyListItem,
    PregnancyListQuery, PregnancyRes, RecordDeliveryReq, RecordDoseReq, ResidentRes, SummaryRes,
    TargetQuery, TargetRes, UpdateRiskReq, VisitRes, WorkerEventRes,
};
use api_shared::{ApiResponse, HealthRes, HealthService, PageQuery};
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use kia_core::config::{months_from_env_value, resolve_data_dir};
use kia_core::constants::{
    DEFAULT_EVENT_LOG_CAPACITY, DEFAULT_IDL_COMPLETION_AGE_MONTHS, DEFAULT_TARGET_MAX_AGE_MONTHS,
};
use kia_core::journal::YamlJournal;
use kia_core::repositories::antenatal::NewVisit;
use kia_core::repositories::delivery::NewDelivery;
use kia_core::repositories::immunization::{DoseStatus, NewDose, TargetFilter};
use kia_core::repositories::pregnancy::{NewPregnancy, PregnancyFilter, RiskAssessment};
use kia_core::{
    CoreConfig, ErrorKind, EventSink, FanOut, KiaEngine, KiaError, KiaResult, LocalResidentDirectory,
    MemoryEventLog, Nik, PageRequest, Period, RequestContext, ShardableUuid, TenantId,
    TracingEventSink, WorkerRef,
};
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const WORKER_ID_HEADER: &str = "x-worker-id";
pub const WORKER_NAME_HEADER: &str = "x-worker-name";

/// Application state for the REST API server.
#[derive(Clone)]
pub struct AppState {
    engine: KiaEngine,
    events: Arc<MemoryEventLog>,
}

impl AppState {
    /// `events` must be (or be fanned out from) the sink the engine publishes to; it backs the
    /// `/events` feed.
    pub fn new(engine: KiaEngine, events: Arc<MemoryEventLog>) -> Self {
        Self { engine, events }
    }

    pub fn engine(&self) -> &KiaEngine {
        &self.engine
    }
}

/// Builds the application state from `KIA_*` environment variables.
///
/// # Environment Variables
/// - `KIA_DATA_DIR`: journal directory, also holding the event feed; memory-only when unset
/// - `KIA_IDL_COMPLETION_AGE_MONTHS`: IDL age gate (default 9)
/// - `KIA_TARGET_MAX_AGE_MONTHS`: upper bound of the target population (default 18)
/// - `KIA_RESIDENTS_FILE`: optional YAML file of residents to seed the directory with
///
/// # Errors
/// Returns an error if a variable is malformed, the data directory cannot be created, or the
/// journal or seed file cannot be read.
pub fn state_from_env() -> anyhow::Result<AppState> {
    let data_dir = resolve_data_dir(std::env::var("KIA_DATA_DIR").ok())?;
    let completion_age = months_from_env_value(
        "KIA_IDL_COMPLETION_AGE_MONTHS",
        std::env::var("KIA_IDL_COMPLETION_AGE_MONTHS").ok(),
        DEFAULT_IDL_COMPLETION_AGE_MONTHS,
    )?;
    let target_max_age = months_from_env_value(
        "KIA_TARGET_MAX_AGE_MONTHS",
        std::env::var("KIA_TARGET_MAX_AGE_MONTHS").ok(),
        DEFAULT_TARGET_MAX_AGE_MONTHS,
    )?;
    let cfg = Arc::new(CoreConfig::new(data_dir, completion_age, target_max_age)?);

    let directory = Arc::new(match cfg.data_dir() {
        Some(dir) => LocalResidentDirectory::open(YamlJournal::new(dir))?,
        None => {
            tracing::warn!("KIA_DATA_DIR not set; records are kept in memory only");
            LocalResidentDirectory::in_memory()
        }
    });
    if let Ok(seed) = std::env::var("KIA_RESIDENTS_FILE") {
        let added = directory.seed_from_file(Path::new(&seed), Utc::now())?;
        tracing::info!("seeded {} residents from {}", added, seed);
    }

    let log = Arc::new(match cfg.data_dir() {
        Some(dir) => MemoryEventLog::open(YamlJournal::new(dir), DEFAULT_EVENT_LOG_CAPACITY)?,
        None => MemoryEventLog::new(),
    });
    let sinks: Vec<Arc<dyn EventSink>> = vec![log.clone(), Arc::new(TracingEventSink)];
    let engine = KiaEngine::open(cfg, directory, Arc::new(FanOut::new(sinks)))?;
    Ok(AppState::new(engine, log))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        resident_by_nik,
        open_pregnancy,
        list_pregnancies,
        get_pregnancy,
        update_risk,
        add_visit,
        list_visits,
        record_delivery,
        get_delivery,
        record_dose,
        immunization_history,
        immunization_status,
        immunization_targets,
        coverage,
        summary,
        events,
    ),
    components(schemas(
        HealthRes,
        ResidentRes,
        OpenPregnancyReq,
        UpdateRiskReq,
        PregnancyRes,
        PregnancyListItem,
        AddVisitReq,
        VisitRes,
        RecordDeliveryReq,
        DeliveryRes,
        DeliveryOutcomeRes,
        RecordDoseReq,
        ImmunizationRecordRes,
        ImmunizationStatusRes,
        TargetRes,
        CoverageRes,
        SummaryRes,
        WorkerEventRes,
    ))
)]
pub struct ApiDoc;

/// The REST router with Swagger UI and permissive CORS.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/residents/by-nik/:nik", get(resident_by_nik))
        .route("/pregnancies", post(open_pregnancy).get(list_pregnancies))
        .route("/pregnancies/:id", get(get_pregnancy))
        .route("/pregnancies/:id/risk", put(update_risk))
        .route("/pregnancies/:id/visits", post(add_visit).get(list_visits))
        .route(
            "/pregnancies/:id/delivery",
            post(record_delivery).get(get_delivery),
        )
        .route(
            "/children/:id/immunizations",
            post(record_dose).get(immunization_history),
        )
        .route("/children/:id/immunization-status", get(immunization_status))
        .route("/immunization-targets", get(immunization_targets))
        .route("/statistics/coverage", get(coverage))
        .route("/statistics/summary", get(summary))
        .route("/events", get(events))
        .merge(
            SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// An error rendered as a failure envelope.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<KiaError> for ApiError {
    fn from(e: KiaError) -> Self {
        let status = match e.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Conflict | ErrorKind::InvalidState => StatusCode::CONFLICT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("internal error: {:?}", e);
            return Self {
                status,
                message: "Internal error".into(),
            };
        }

        tracing::warn!("request rejected ({}): {}", status, e);
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::<()>::failure(self.message))).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;
type Created<T> = Result<(StatusCode, Json<ApiResponse<T>>), ApiError>;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ApiError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("missing {} header", name)))
}

/// Builds the request context from the tenant and worker headers.
fn request_context(headers: &HeaderMap) -> Result<RequestContext, ApiError> {
    let tenant = TenantId::parse(header(headers, TENANT_HEADER)?)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let worker_id = header(headers, WORKER_ID_HEADER)?;
    let worker_name = headers
        .get(WORKER_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(worker_id);
    let worker =
        WorkerRef::new(worker_id, worker_name).map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(RequestContext::new(tenant, worker))
}

fn parse_date(field: &str, value: &str) -> KiaResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| {
        KiaError::validation(format!("{} must be a YYYY-MM-DD date, got '{}'", field, value))
    })
}

fn parse_id(value: &str) -> KiaResult<ShardableUuid> {
    Ok(ShardableUuid::parse(value.trim())?)
}

fn page_request(
    state: &AppState,
    page: Option<u32>,
    per_page: Option<u32>,
    search: Option<String>,
) -> KiaResult<PageRequest> {
    PageRequest::new(state.engine.cfg(), page, per_page, search)
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Health check endpoint for the REST API.
#[axum::debug_handler]
async fn health(State(_state): State<AppState>) -> Json<ApiResponse<HealthRes>> {
    Json(ApiResponse::ok(HealthService::check_health()))
}

#[utoipa::path(
    get,
    path = "/residents/by-nik/{nik}",
    params(("nik" = String, Path, description = "16-digit national identity number")),
    responses(
        (status = 200, description = "Resident", body = ResidentRes),
        (status = 404, description = "No resident with this NIK"),
        (status = 422, description = "Malformed NIK")
    )
)]
#[axum::debug_handler]
async fn resident_by_nik(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(nik): AxumPath<String>,
) -> ApiResult<ResidentRes> {
    let ctx = request_context(&headers)?;
    let nik = Nik::parse(&nik).map_err(KiaError::from)?;
    let resident = state.engine.residents().resolve_by_identifier(&ctx, &nik)?;
    Ok(Json(ApiResponse::ok(ResidentRes::from(&resident))))
}

#[utoipa::path(
    post,
    path = "/pregnancies",
    request_body = OpenPregnancyReq,
    responses(
        (status = 201, description = "Pregnancy opened", body = PregnancyRes),
        (status = 404, description = "Mother not found"),
        (status = 409, description = "Mother already has an open pregnancy"),
        (status = 422, description = "Validation failed")
    )
)]
/// Open a pregnancy for the mother identified by NIK.
#[axum::debug_handler]
async fn open_pregnancy(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<OpenPregnancyReq>,
) -> Created<PregnancyRes> {
    let ctx = request_context(&headers)?;
    let nik = Nik::parse(&req.mother_nik).map_err(KiaError::from)?;
    let mother = state.engine.residents().resolve_by_identifier(&ctx, &nik)?;

    let view = state.engine.pregnancies().open_pregnancy(
        &ctx,
        NewPregnancy {
            resident_id: mother.id,
            lmp_date: parse_date("lmp_date", &req.lmp_date)?,
            gravida: req.gravida,
            parity: req.parity,
            prior_abortions: req.prior_abortions,
            risk_status: req.risk_status.parse()?,
            risk_factors: req.risk_factors,
            free_note: req.note,
        },
    )?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(PregnancyRes::from(&view))),
    ))
}

#[utoipa::path(
    get,
    path = "/pregnancies",
    params(PregnancyListQuery),
    responses(
        (status = 200, description = "Page of pregnancies", body = [PregnancyListItem]),
        (status = 422, description = "Bad filter or paging")
    )
)]
#[axum::debug_handler]
async fn list_pregnancies(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<PregnancyListQuery>,
) -> ApiResult<Vec<PregnancyListItem>> {
    let ctx = request_context(&headers)?;
    let filter = PregnancyFilter {
        state: q.state.as_deref().map(str::parse).transpose()?,
        risk_status: q.risk_status.as_deref().map(str::parse).transpose()?,
        sub_village: q.sub_village,
    };
    let page = page_request(&state, q.page, q.per_page, q.search)?;

    let result = state
        .engine
        .pregnancies()
        .list_pregnancies(&ctx, &filter, &page)?;
    Ok(Json(ApiResponse::page(result, |e| PregnancyListItem::from(&e))))
}

#[utoipa::path(
    get,
    path = "/pregnancies/{id}",
    params(("id" = String, Path, description = "Pregnancy id")),
    responses(
        (status = 200, description = "Pregnancy with derived gestational age", body = PregnancyRes),
        (status = 404, description = "Not found")
    )
)]
#[axum::debug_handler]
async fn get_pregnancy(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<PregnancyRes> {
    let ctx = request_context(&headers)?;
    let view = state.engine.pregnancies().get(&ctx, &parse_id(&id)?)?;
    Ok(Json(ApiResponse::ok(PregnancyRes::from(&view))))
}

#[utoipa::path(
    put,
    path = "/pregnancies/{id}/risk",
    params(("id" = String, Path, description = "Pregnancy id")),
    request_body = UpdateRiskReq,
    responses(
        (status = 200, description = "Risk updated", body = PregnancyRes),
        (status = 404, description = "Not found"),
        (status = 409, description = "Pregnancy is closed")
    )
)]
#[axum::debug_handler]
async fn update_risk(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
    Json(req): Json<UpdateRiskReq>,
) -> ApiResult<PregnancyRes> {
    let ctx = request_context(&headers)?;
    let view = state.engine.pregnancies().update_risk(
        &ctx,
        &parse_id(&id)?,
        RiskAssessment {
            risk_status: req.risk_status.parse()?,
            risk_factors: req.risk_factors,
            note: req.note,
        },
    )?;
    Ok(Json(ApiResponse::ok(PregnancyRes::from(&view))))
}

#[utoipa::path(
    post,
    path = "/pregnancies/{id}/visits",
    params(("id" = String, Path, description = "Pregnancy id")),
    request_body = AddVisitReq,
    responses(
        (status = 201, description = "Visit recorded", body = VisitRes),
        (status = 404, description = "Pregnancy not found"),
        (status = 409, description = "Pregnancy closed or visit number taken"),
        (status = 422, description = "Validation failed")
    )
)]
#[axum::debug_handler]
async fn add_visit(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
    Json(req): Json<AddVisitReq>,
) -> Created<VisitRes> {
    let ctx = request_context(&headers)?;
    let visit = state.engine.antenatal().add_visit(
        &ctx,
        &parse_id(&id)?,
        NewVisit {
            visit_number: req.visit_number,
            visit_date: parse_date("visit_date", &req.visit_date)?,
            weight_kg: req.weight_kg,
            blood_pressure_sys: req.blood_pressure_sys,
            blood_pressure_dia: req.blood_pressure_dia,
            fundal_height_cm: req.fundal_height_cm,
            fetal_heart_rate: req.fetal_heart_rate,
            complaint: req.complaint,
            action_taken: req.action_taken,
            note: req.note,
            supersedes: req.supersedes.as_deref().map(parse_id).transpose()?,
        },
    )?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(VisitRes::from(&visit)))))
}

#[utoipa::path(
    get,
    path = "/pregnancies/{id}/visits",
    params(("id" = String, Path, description = "Pregnancy id"), PageQuery),
    responses(
        (status = 200, description = "Visits, most recent first", body = [VisitRes]),
        (status = 404, description = "Pregnancy not found"),
        (status = 422, description = "Bad paging")
    )
)]
#[axum::debug_handler]
async fn list_visits(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
    Query(q): Query<PageQuery>,
) -> ApiResult<Vec<VisitRes>> {
    let ctx = request_context(&headers)?;
    let page = page_request(&state, q.page, q.per_page, q.search)?;
    let visits = state
        .engine
        .antenatal()
        .page_visits(&ctx, &parse_id(&id)?, &page)?;
    Ok(Json(ApiResponse::page(visits, |v| VisitRes::from(&v))))
}

#[utoipa::path(
    post,
    path = "/pregnancies/{id}/delivery",
    params(("id" = String, Path, description = "Pregnancy id")),
    request_body = RecordDeliveryReq,
    responses(
        (status = 201, description = "Delivery recorded, pregnancy closed, child provisioned", body = DeliveryOutcomeRes),
        (status = 404, description = "Pregnancy not found"),
        (status = 409, description = "Pregnancy already closed"),
        (status = 422, description = "Validation failed")
    )
)]
#[axum::debug_handler]
async fn record_delivery(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
    Json(req): Json<RecordDeliveryReq>,
) -> Created<DeliveryOutcomeRes> {
    let ctx = request_context(&headers)?;
    let outcome = state.engine.deliveries().record_delivery(
        &ctx,
        &parse_id(&id)?,
        NewDelivery {
            delivery_date: parse_date("delivery_date", &req.delivery_date)?,
            place: req.place,
            delivery_type: req.delivery_type.parse()?,
            attendant_type: req.attendant_type.parse()?,
            attendant_name: req.attendant_name,
            maternal_condition: req.maternal_condition.parse()?,
            maternal_complication_note: req.maternal_complication_note,
            infant_condition: req.infant_condition.parse()?,
            birth_weight_g: req.birth_weight_g,
            birth_length_cm: req.birth_length_cm,
            infant_sex: req.infant_sex.parse().map_err(KiaError::from)?,
            infant_name: req.infant_name,
            note: req.note,
        },
    )?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(DeliveryOutcomeRes::from(&outcome))),
    ))
}

#[utoipa::path(
    get,
    path = "/pregnancies/{id}/delivery",
    params(("id" = String, Path, description = "Pregnancy id")),
    responses(
        (status = 200, description = "Delivery", body = DeliveryRes),
        (status = 404, description = "Pregnancy or delivery not found")
    )
)]
#[axum::debug_handler]
async fn get_delivery(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<DeliveryRes> {
    let ctx = request_context(&headers)?;
    let delivery = state.engine.deliveries().get_delivery(&ctx, &parse_id(&id)?)?;
    Ok(Json(ApiResponse::ok(DeliveryRes::from(&delivery))))
}

#[utoipa::path(
    post,
    path = "/children/{id}/immunizations",
    params(("id" = String, Path, description = "Child resident id")),
    request_body = RecordDoseReq,
    responses(
        (status = 201, description = "Dose recorded", body = ImmunizationRecordRes),
        (status = 404, description = "Child not found"),
        (status = 409, description = "Dose already given"),
        (status = 422, description = "Validation failed")
    )
)]
#[axum::debug_handler]
async fn record_dose(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
    Json(req): Json<RecordDoseReq>,
) -> Created<ImmunizationRecordRes> {
    let ctx = request_context(&headers)?;
    let status = match req.status.as_deref() {
        Some(s) => s.parse()?,
        None => DoseStatus::Given,
    };
    let record = state.engine.immunizations().record_dose(
        &ctx,
        &parse_id(&id)?,
        NewDose {
            vaccine: req.vaccine_code.parse()?,
            given_date: parse_date("given_date", &req.given_date)?,
            status,
            posyandu_site: req.posyandu_site,
            administration_site: req.administration_site,
            vaccine_batch: req.vaccine_batch,
            note: req.note,
        },
    )?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(ImmunizationRecordRes::from(&record))),
    ))
}

#[utoipa::path(
    get,
    path = "/children/{id}/immunizations",
    params(("id" = String, Path, description = "Child resident id"), PageQuery),
    responses(
        (status = 200, description = "Dose history, newest first", body = [ImmunizationRecordRes]),
        (status = 404, description = "Child not found")
    )
)]
#[axum::debug_handler]
async fn immunization_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
    Query(q): Query<PageQuery>,
) -> ApiResult<Vec<ImmunizationRecordRes>> {
    let ctx = request_context(&headers)?;
    let page = page_request(&state, q.page, q.per_page, q.search)?;
    let history = state
        .engine
        .immunizations()
        .history(&ctx, &parse_id(&id)?, &page)?;
    Ok(Json(ApiResponse::page(history, |r| {
        ImmunizationRecordRes::from(&r)
    })))
}

#[utoipa::path(
    get,
    path = "/children/{id}/immunization-status",
    params(("id" = String, Path, description = "Child resident id")),
    responses(
        (status = 200, description = "Derived immunization status", body = ImmunizationStatusRes),
        (status = 404, description = "Child not found")
    )
)]
#[axum::debug_handler]
async fn immunization_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<ImmunizationStatusRes> {
    let ctx = request_context(&headers)?;
    let status = state
        .engine
        .immunizations()
        .get_status(&ctx, &parse_id(&id)?)?;
    Ok(Json(ApiResponse::ok(ImmunizationStatusRes::from(&status))))
}

#[utoipa::path(
    get,
    path = "/immunization-targets",
    params(TargetQuery),
    responses(
        (status = 200, description = "Target population page", body = [TargetRes]),
        (status = 422, description = "Bad age window or paging")
    )
)]
#[axum::debug_handler]
async fn immunization_targets(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<TargetQuery>,
) -> ApiResult<Vec<TargetRes>> {
    let ctx = request_context(&headers)?;
    let filter = TargetFilter {
        min_age_months: q.min_age_months,
        max_age_months: q.max_age_months,
        sub_village: q.sub_village,
    };
    let page = page_request(&state, q.page, q.per_page, q.search)?;
    let targets = state
        .engine
        .immunizations()
        .list_targets(&ctx, &filter, &page)?;
    Ok(Json(ApiResponse::page(targets, |t| TargetRes::from(&t))))
}

#[utoipa::path(
    get,
    path = "/statistics/coverage",
    params(CoverageQuery),
    responses(
        (status = 200, description = "Coverage for the period", body = CoverageRes),
        (status = 422, description = "Bad period")
    )
)]
#[axum::debug_handler]
async fn coverage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<CoverageQuery>,
) -> ApiResult<CoverageRes> {
    let ctx = request_context(&headers)?;
    let month = Period::month_of(ctx.today());
    let from = match q.from.as_deref() {
        Some(v) => parse_date("from", v)?,
        None => month.start(),
    };
    let to = match q.to.as_deref() {
        Some(v) => parse_date("to", v)?,
        None => month.end(),
    };

    let coverage = state
        .engine
        .statistics()
        .coverage(&ctx, Period::new(from, to)?)?;
    Ok(Json(ApiResponse::ok(CoverageRes::from(&coverage))))
}

#[utoipa::path(
    get,
    path = "/statistics/summary",
    responses(
        (status = 200, description = "Dashboard summary as of today", body = SummaryRes)
    )
)]
#[axum::debug_handler]
async fn summary(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<SummaryRes> {
    let ctx = request_context(&headers)?;
    let summary = state.engine.statistics().summary(&ctx)?;
    Ok(Json(ApiResponse::ok(SummaryRes::from(&summary))))
}

#[utoipa::path(
    get,
    path = "/events",
    params(EventsQuery),
    responses(
        (status = 200, description = "Worker events for the tenant, oldest first", body = [WorkerEventRes]),
        (status = 422, description = "Bad timestamp or paging")
    )
)]
/// Feed of worker write events consumed by the performance scorer.
#[axum::debug_handler]
async fn events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<EventsQuery>,
) -> ApiResult<Vec<WorkerEventRes>> {
    let ctx = request_context(&headers)?;
    let since = match q.since.as_deref() {
        Some(v) => Some(
            DateTime::parse_from_rfc3339(v.trim())
                .map_err(|_| {
                    KiaError::validation(format!("since must be an RFC 3339 instant, got '{}'", v))
                })?
                .with_timezone(&Utc),
        ),
        None => None,
    };

    let page = page_request(&state, q.page, q.per_page, q.search)?;

    let events = state.events.feed(ctx.tenant(), since, &page);
    Ok(Json(ApiResponse::page(events, |e| WorkerEventRes::from(&e))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Duration;
    use http_body_util::BodyExt;
    use kia_core::residents::NewResident;
    use kia_core::{NonEmptyText, Sex};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const TENANT: &str = "posyandu-melati";

    fn app() -> (Router, Arc<LocalResidentDirectory>) {
        let directory = Arc::new(LocalResidentDirectory::in_memory());
        let log = Arc::new(MemoryEventLog::new());
        let engine = KiaEngine::open(
            Arc::new(CoreConfig::default()),
            directory.clone(),
            log.clone(),
        )
        .expect("engine");
        (router(AppState::new(engine, log)), directory)
    }

    fn register(directory: &LocalResidentDirectory, nik: &str, name: &str, birth: NaiveDate) {
        let ctx = RequestContext::new(
            TenantId::parse(TENANT).expect("tenant"),
            WorkerRef::new("admin", "Admin").expect("worker"),
        );
        directory
            .register(
                &ctx,
                NewResident {
                    nik: Nik::parse(nik).expect("nik"),
                    name: NonEmptyText::new(name).expect("name"),
                    birth_date: birth,
                    sex: Sex::Female,
                    address: None,
                    sub_village: Some("Dusun Krajan".into()),
                },
            )
            .expect("register");
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(TENANT_HEADER, TENANT)
            .header(WORKER_ID_HEADER, "k-01")
            .header(WORKER_NAME_HEADER, "Bu Sri");
        match body {
            Some(b) => builder
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .expect("request"),
            None => builder.body(Body::empty()).expect("request"),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let res = app.clone().oneshot(req).await.expect("response");
        let status = res.status();
        let bytes = res
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    fn day(date: NaiveDate) -> String {
        date.format("%Y-%m-%d").to_string()
    }

    async fn open_pregnancy_for_siti(app: &Router) -> String {
        let (status, body) = send(
            app,
            request(
                "POST",
                "/pregnancies",
                Some(json!({
                    "mother_nik": "3201010101950001",
                    "lmp_date": day(today() - Duration::weeks(30)),
                    "gravida": 1,
                    "parity": 0,
                    "risk_status": "Low"
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["data"]["id"].as_str().expect("id").to_string()
    }

    #[tokio::test]
    async fn test_health_returns_envelope() {
        let (app, _) = app();
        let (status, body) = send(&app, request("GET", "/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["data"]["ok"], json!(true));
    }

    #[tokio::test]
    async fn test_missing_tenant_header_is_bad_request() {
        let (app, _) = app();
        let req = Request::builder()
            .uri("/statistics/summary")
            .body(Body::empty())
            .expect("request");
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], json!(false));
    }

    #[tokio::test]
    async fn test_open_pregnancy_and_duplicate_conflict() {
        let (app, directory) = app();
        register(&directory, "3201010101950001", "Siti Aminah", NaiveDate::from_ymd_opt(1995, 4, 12).expect("date"));

        let id = open_pregnancy_for_siti(&app).await;
        let (status, body) = send(&app, request("GET", &format!("/pregnancies/{id}"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["gestational_age_weeks"], json!(30));
        assert_eq!(body["data"]["trimester"], json!(3));

        let (status, body) = send(
            &app,
            request(
                "POST",
                "/pregnancies",
                Some(json!({
                    "mother_nik": "3201010101950001",
                    "lmp_date": day(today() - Duration::weeks(2)),
                    "gravida": 1,
                    "parity": 0,
                    "risk_status": "Low"
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], json!(false));
        assert!(body["error"].as_str().expect("error").contains("open pregnancy"));

        let (status, body) = send(&app, request("GET", "/pregnancies?search=aminah", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["total"], json!(1));
    }

    #[tokio::test]
    async fn test_unknown_pregnancy_is_not_found() {
        let (app, _) = app();
        let uri = format!("/pregnancies/{}", ShardableUuid::new());
        let (status, body) = send(&app, request("GET", &uri, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], json!(false));
    }

    #[tokio::test]
    async fn test_delivery_flow_over_http() {
        let (app, directory) = app();
        register(&directory, "3201010101950001", "Siti Aminah", NaiveDate::from_ymd_opt(1995, 4, 12).expect("date"));
        let id = open_pregnancy_for_siti(&app).await;

        let delivery = |weight: u32| {
            json!({
                "delivery_date": day(today()),
                "place": "Puskesmas Sukamaju",
                "delivery_type": "Spontaneous",
                "attendant_type": "Midwife",
                "attendant_name": "Bidan Rina",
                "maternal_condition": "Good",
                "infant_condition": "HealthyAlive",
                "birth_weight_g": weight,
                "birth_length_cm": 48.5,
                "infant_sex": "M"
            })
        };

        let uri = format!("/pregnancies/{id}/delivery");
        let (status, _) = send(&app, request("POST", &uri, Some(delivery(400)))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = send(&app, request("POST", &uri, Some(delivery(500)))).await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        let child_id = body["data"]["child"]["id"].as_str().expect("child id").to_string();
        assert_eq!(body["data"]["child"]["name"], json!("Bayi Ny. Siti Aminah"));

        let (status, _) = send(
            &app,
            request(
                "POST",
                &format!("/pregnancies/{id}/visits"),
                Some(json!({"visit_number": 9, "visit_date": day(today())})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let dose_uri = format!("/children/{child_id}/immunizations");
        let dose = json!({"vaccine_code": "HB0", "given_date": day(today())});
        let (status, _) = send(&app, request("POST", &dose_uri, Some(dose.clone()))).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = send(&app, request("POST", &dose_uri, Some(dose))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(
            &app,
            request("GET", &format!("/children/{child_id}/immunization-status"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["doses_given"], json!(["HB0"]));
        assert_eq!(body["data"]["is_complete"], json!(false));

        let (status, body) = send(&app, request("GET", "/statistics/coverage", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total_pemberian"], json!(1));
        assert_eq!(body["data"]["total_target"], json!(1));
        assert_eq!(body["data"]["idl_percentage"], json!(0));

        let (status, body) = send(&app, request("GET", "/events", None)).await;
        assert_eq!(status, StatusCode::OK);
        let entities: Vec<&str> = body["data"]
            .as_array()
            .expect("events")
            .iter()
            .map(|e| e["entity"].as_str().expect("entity"))
            .collect();
        assert_eq!(
            entities,
            vec!["pregnancy", "delivery", "pregnancy", "resident", "immunization"]
        );
    }

    #[tokio::test]
    async fn test_visit_history_and_event_lists_are_paged() {
        let (app, directory) = app();
        register(&directory, "3201010101950001", "Siti Aminah", NaiveDate::from_ymd_opt(1995, 4, 12).expect("date"));
        let id = open_pregnancy_for_siti(&app).await;

        let visits_uri = format!("/pregnancies/{id}/visits");
        for (number, weeks_ago, complaint) in [(1, 8, "mual"), (2, 4, "pusing"), (3, 1, "kaki bengkak")] {
            let (status, body) = send(
                &app,
                request(
                    "POST",
                    &visits_uri,
                    Some(json!({
                        "visit_number": number,
                        "visit_date": day(today() - Duration::weeks(weeks_ago)),
                        "complaint": complaint
                    })),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED, "{body}");
        }

        let (status, body) =
            send(&app, request("GET", &format!("{visits_uri}?page=1&per_page=2"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["total"], json!(3));
        assert_eq!(body["data"].as_array().expect("visits").len(), 2);
        assert_eq!(body["data"][0]["visit_number"], json!(3));

        let (_, body) = send(&app, request("GET", &format!("{visits_uri}?search=pusing"), None)).await;
        assert_eq!(body["meta"]["total"], json!(1));
        assert_eq!(body["data"][0]["visit_number"], json!(2));

        let (status, _) =
            send(&app, request("GET", &format!("{visits_uri}?per_page=0"), None)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = send(&app, request("GET", "/events?page=2&per_page=3", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["total"], json!(4));
        assert_eq!(body["data"].as_array().expect("events").len(), 1);
        assert_eq!(body["data"][0]["entity"], json!("antenatal_visit"));

        let (_, body) = send(&app, request("GET", "/events?search=nobody", None)).await;
        assert_eq!(body["meta"]["total"], json!(0));
    }

    #[tokio::test]
    async fn test_immunization_history_search_filters_records() {
        let (app, directory) = app();
        register(&directory, "3201010101240001", "Rizky", today() - Duration::days(120));
        let (_, body) = send(&app, request("GET", "/residents/by-nik/3201010101240001", None)).await;
        let child_id = body["data"]["id"].as_str().expect("id").to_string();

        let uri = format!("/children/{child_id}/immunizations");
        for code in ["HB0", "BCG", "Polio1"] {
            let (status, _) = send(
                &app,
                request(
                    "POST",
                    &uri,
                    Some(json!({"vaccine_code": code, "given_date": day(today() - Duration::days(60))})),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, body) = send(&app, request("GET", &uri, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["total"], json!(3));

        let (_, body) = send(&app, request("GET", &format!("{uri}?search=bcg"), None)).await;
        assert_eq!(body["meta"]["total"], json!(1));
        assert_eq!(body["data"][0]["vaccine_code"], json!("BCG"));
    }

    #[tokio::test]
    async fn test_unknown_vaccine_code_is_unprocessable() {
        let (app, directory) = app();
        register(&directory, "3201010101950001", "Siti Aminah", NaiveDate::from_ymd_opt(1995, 4, 12).expect("date"));
        let nik_uri = "/residents/by-nik/3201010101950001";
        let (_, body) = send(&app, request("GET", nik_uri, None)).await;
        let id = body["data"]["id"].as_str().expect("id").to_string();

        let (status, body) = send(
            &app,
            request(
                "POST",
                &format!("/children/{id}/immunizations"),
                Some(json!({"vaccine_code": "Rotavirus", "given_date": day(today())})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().expect("error").contains("Rotavirus"));
    }
}
