//! Axum JSON API over the ingestion pipeline and record store.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use rsap_adapters::{
    fallback_profile, AnalyticsEngine, HttpAnalyticsEngine, HttpUserDirectory, UserDirectory,
    UserProfile,
};
use rsap_core::{convert_to_lat_lon, AnomalyRecord, RecordStatus, ServiceError};
use rsap_pipeline::{IngestionService, PipelineConfig, PipelineOrchestrator, RunSummary, Scheduler};
use rsap_storage::{PgRecordRepository, RecordFilter, RecordRepository};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "rsap-web";

const DEFAULT_RANGE_START: &str = "2025-08-01";
const DEFAULT_RANGE_END: &str = "2099-12-31";

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn RecordRepository>,
    pub ingestion: IngestionService,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub scheduler: Arc<Scheduler>,
    pub users: Arc<dyn UserDirectory>,
}

impl AppState {
    pub fn new(
        repo: Arc<dyn RecordRepository>,
        orchestrator: Arc<PipelineOrchestrator>,
        scheduler: Arc<Scheduler>,
        users: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            ingestion: IngestionService::new(repo.clone()),
            repo,
            orchestrator,
            scheduler,
            users,
        }
    }
}

// ---------------------------------------------------------------------------
// Response envelope + error mapping
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ApiEnvelope<T: Serialize> {
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u16>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

fn success<T: Serialize>(message: &str, data: T) -> Response {
    Json(ApiEnvelope {
        code: None,
        message: message.to_string(),
        data: Some(data),
    })
    .into_response()
}

struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

fn status_for(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::InvalidPredicate
        | ServiceError::InvalidIdentifier(_)
        | ServiceError::InvalidDateRange(_)
        | ServiceError::QueryCancelled => StatusCode::BAD_REQUEST,
        ServiceError::QueryTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
        ServiceError::NotFound(_) | ServiceError::ResultRetrievalFailed { .. } => {
            StatusCode::NOT_FOUND
        }
        ServiceError::AlreadyConfirmed(_) | ServiceError::SchedulerAlreadyRunning => {
            StatusCode::CONFLICT
        }
        ServiceError::ConnectionFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::QueryExecutionFailed { .. } | ServiceError::IngestionFailed => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        warn!(code = self.0.code(), %status, error = %self.0, "request failed");
        (
            status,
            Json(ApiEnvelope::<()> {
                code: Some(self.0.code()),
                message: self.0.to_string(),
                data: None,
            }),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Wire DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunRequest {
    #[serde(default)]
    predicate: Option<String>,
    #[serde(default)]
    impact_force_min: Option<f64>,
    #[serde(default)]
    z_axis_vibration_min: Option<f64>,
}

impl RunRequest {
    fn predicate(&self) -> Result<String, ServiceError> {
        if let Some(predicate) = &self.predicate {
            if !predicate.trim().is_empty() {
                return Ok(predicate.clone());
            }
        }
        match (self.impact_force_min, self.z_axis_vibration_min) {
            (Some(impact), Some(vibration)) => Ok(format!(
                "impactForce >= {impact} AND zAxisVibration >= {vibration}"
            )),
            _ => Err(ServiceError::InvalidPredicate),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RecordsQuery {
    page: Option<u32>,
    start: Option<String>,
    end: Option<String>,
    confirmed: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LocationDto {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordDto {
    record_id: String,
    user: UserProfile,
    location: LocationDto,
    detected_at: Option<String>,
    impact: Option<f64>,
    shake: Option<f64>,
    speed: Option<f64>,
    image_url: Option<String>,
    confirmed: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordPageDto {
    content: Vec<RecordDto>,
    page: u32,
    total_pages: u32,
}

// ---------------------------------------------------------------------------
// Router + handlers
// ---------------------------------------------------------------------------

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/pipeline/run", post(pipeline_run_handler))
        .route("/pipeline/run-scheduled-now", post(run_scheduled_handler))
        .route("/records", get(records_handler))
        .route("/records/{id}/confirm", post(confirm_handler))
        .with_state(Arc::new(state))
}

async fn pipeline_run_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> Result<Response, ApiError> {
    let predicate = request.predicate()?;
    info!(predicate, "pipeline run requested");
    let summary: RunSummary = state.orchestrator.run(&predicate).await?;
    Ok(success("pipeline run complete", summary))
}

async fn run_scheduled_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    info!("manual scheduler trigger requested");
    let summary = state.scheduler.trigger_manual().await?;
    Ok(success("scheduled pipeline run complete", summary))
}

async fn records_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecordsQuery>,
) -> Result<Response, ApiError> {
    let start = query
        .start
        .unwrap_or_else(|| DEFAULT_RANGE_START.to_string());
    let end = query.end.unwrap_or_else(|| DEFAULT_RANGE_END.to_string());
    for bound in [&start, &end] {
        if NaiveDate::parse_from_str(bound, "%Y-%m-%d").is_err() {
            return Err(ServiceError::InvalidDateRange(format!("bad bound {bound:?}")).into());
        }
    }
    if start > end {
        return Err(ServiceError::InvalidDateRange(format!(
            "start {start:?} is after end {end:?}"
        ))
        .into());
    }

    let filter = RecordFilter {
        start,
        end,
        status: query.confirmed.map(|confirmed| {
            if confirmed {
                RecordStatus::Confirmed
            } else {
                RecordStatus::Unconfirmed
            }
        }),
    };
    let page = state
        .repo
        .page_by_detected_range(&filter, query.page.unwrap_or(0))
        .await
        .map_err(ServiceError::connection)?;

    let mut content = Vec::with_capacity(page.records.len());
    for record in &page.records {
        content.push(record_dto(record, state.users.as_ref()).await);
    }
    Ok(success(
        "record list fetched",
        RecordPageDto {
            content,
            page: page.page,
            total_pages: page.total_pages,
        },
    ))
}

async fn confirm_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Response, ApiError> {
    state.ingestion.confirm(&id).await?;
    Ok(success("record confirmed", ()))
}

async fn record_dto(record: &AnomalyRecord, users: &dyn UserDirectory) -> RecordDto {
    let user = match record.car_id.as_deref() {
        Some(car_id) => match users.lookup(car_id).await {
            Ok(profile) => profile,
            Err(err) => {
                warn!(%err, car_id, "user lookup failed, substituting fallback");
                fallback_profile(Some(car_id))
            }
        },
        None => fallback_profile(None),
    };
    let position = convert_to_lat_lon(record.location_x, record.location_y);
    RecordDto {
        record_id: record.public_id(),
        user,
        location: LocationDto {
            latitude: position.map(|p| p.latitude),
            longitude: position.map(|p| p.longitude),
        },
        detected_at: record.detected_at.clone(),
        impact: record.impact_force,
        shake: record.z_axis_vibration,
        speed: record.speed,
        image_url: record.object_url.clone(),
        confirmed: record.status == RecordStatus::Confirmed,
    }
}

/// Build the full service from env config and serve it.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env();

    let repo = PgRecordRepository::connect(&config.database_url).await?;
    repo.ensure_schema().await?;
    let repo: Arc<dyn RecordRepository> = Arc::new(repo);

    let engine: Arc<dyn AnalyticsEngine> =
        Arc::new(HttpAnalyticsEngine::new(config.engine_config())?);
    let users: Arc<dyn UserDirectory> = Arc::new(HttpUserDirectory::new(
        config.user_service_url.clone(),
        std::time::Duration::from_secs(config.http_timeout_secs),
    )?);

    let orchestrator = Arc::new(PipelineOrchestrator::from_config(
        &config,
        engine,
        repo.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(orchestrator.clone()));
    if let Some(cron) = scheduler.maybe_build_cron(&config).await? {
        cron.start().await?;
        info!(cron = config.schedule_cron, "daily scheduler started");
    }

    let state = AppState::new(repo, orchestrator, scheduler, users);
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use rsap_adapters::{
        DirectoryError, EngineError, JobStatus, QueryConfig, QueryExecutor, ResultFetcher,
        ResultSet,
    };
    use rsap_core::NewAnomalyRecord;
    use rsap_storage::MemoryRecordRepository;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    struct StubEngine {
        rows: Vec<Vec<Option<String>>>,
    }

    #[async_trait]
    impl AnalyticsEngine for StubEngine {
        async fn start_query(&self, _query: &str) -> Result<String, EngineError> {
            Ok("job-web".to_string())
        }
        async fn query_status(&self, _job_id: &str) -> Result<JobStatus, EngineError> {
            Ok(JobStatus::Succeeded)
        }
        async fn query_results(&self, _job_id: &str) -> Result<ResultSet, EngineError> {
            Ok(ResultSet {
                rows: self.rows.clone(),
            })
        }
    }

    struct StubDirectory;

    #[async_trait]
    impl UserDirectory for StubDirectory {
        async fn lookup(&self, user_id: &str) -> Result<UserProfile, DirectoryError> {
            if user_id == "car-1" {
                Ok(UserProfile {
                    user_id: "u-100".to_string(),
                    user_name: "Jordan Driver".to_string(),
                })
            } else {
                Err(DirectoryError::UnknownUser(user_id.to_string()))
            }
        }
    }

    fn cell(v: &str) -> Option<String> {
        Some(v.to_string())
    }

    fn engine_rows() -> Vec<Vec<Option<String>>> {
        vec![
            vec![
                cell("carId"),
                cell("impactForce"),
                cell("timestamp"),
                cell("locationX"),
                cell("locationY"),
            ],
            vec![
                cell("car-1"),
                cell("9.5"),
                cell("2025-08-27 13:35:52"),
                cell("0.0"),
                cell("0.0"),
            ],
            vec![
                cell("car-2"),
                cell("11.0"),
                cell("2025-08-26 08:00:00"),
                None,
                None,
            ],
        ]
    }

    fn test_state(rows: Vec<Vec<Option<String>>>) -> (AppState, Arc<MemoryRecordRepository>) {
        let repo = Arc::new(MemoryRecordRepository::new());
        let engine: Arc<dyn AnalyticsEngine> = Arc::new(StubEngine { rows });
        let config = QueryConfig {
            database: "road_sensor_lake".into(),
            table: "raw_anomaly_events".into(),
            poll_interval: Duration::from_millis(1),
            max_poll_attempts: 5,
        };
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            QueryExecutor::new(engine.clone(), config),
            ResultFetcher::new(engine),
            IngestionService::new(repo.clone()),
        ));
        let scheduler = Arc::new(Scheduler::new(orchestrator.clone()));
        let state = AppState::new(
            repo.clone() as Arc<dyn RecordRepository>,
            orchestrator,
            scheduler,
            Arc::new(StubDirectory),
        );
        (state, repo)
    }

    async fn seed_record(repo: &MemoryRecordRepository, car: &str, date: &str) -> i64 {
        repo.insert(NewAnomalyRecord {
            car_id: Some(car.to_string()),
            speed: Some(40.0),
            location_x: Some(0.0),
            location_y: Some(0.0),
            impact_force: Some(9.5),
            detected_at: Some(date.to_string()),
            ..Default::default()
        })
        .await
        .unwrap()
        .id
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn pipeline_run_accepts_a_raw_predicate() {
        let (state, repo) = test_state(engine_rows());
        let (status, body) = send(
            app(state),
            post_json("/pipeline/run", json!({"predicate": "impactForce >= 5.0"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["jobId"], "job-web");
        assert_eq!(body["data"]["processedCount"], 2);
        assert_eq!(body["data"]["totalCount"], 2);
        assert_eq!(repo.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn pipeline_run_accepts_threshold_bounds() {
        let (state, _repo) = test_state(engine_rows());
        let (status, body) = send(
            app(state),
            post_json(
                "/pipeline/run",
                json!({"impactForceMin": 5.0, "zAxisVibrationMin": 0.5}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["processedCount"], 2);
    }

    #[tokio::test]
    async fn pipeline_run_without_any_predicate_is_rejected() {
        let (state, _repo) = test_state(engine_rows());
        let (status, body) = send(app(state), post_json("/pipeline/run", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 5031);
    }

    #[tokio::test]
    async fn manual_scheduler_trigger_runs_the_window() {
        let (state, _repo) = test_state(engine_rows());
        let (status, body) =
            send(app(state), post_empty("/pipeline/run-scheduled-now")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["processedCount"], 2);
    }

    #[tokio::test]
    async fn records_listing_builds_enriched_rows() {
        let (state, repo) = test_state(Vec::new());
        seed_record(&repo, "car-1", "2025-08-27").await;
        seed_record(&repo, "car-9", "2025-08-26").await;

        let (status, body) = send(app(state), get("/records")).await;
        assert_eq!(status, StatusCode::OK);
        let content = body["data"]["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(body["data"]["page"], 0);
        assert_eq!(body["data"]["totalPages"], 1);

        // Newest detected date first; id prefix applied.
        assert_eq!(content[0]["recordId"], "p-1");
        assert_eq!(content[0]["user"]["userName"], "Jordan Driver");
        assert_eq!(content[0]["location"]["longitude"], 127.00374);
        assert_eq!(content[0]["location"]["latitude"], 37.55807);
        assert_eq!(content[0]["confirmed"], false);

        // Directory miss falls back to placeholder, never errors.
        assert_eq!(content[1]["user"]["userId"], "car-9");
        assert_eq!(content[1]["user"]["userName"], "unknown");
    }

    #[tokio::test]
    async fn records_listing_honors_filters() {
        let (state, repo) = test_state(Vec::new());
        let confirmed_id = seed_record(&repo, "car-1", "2025-08-27").await;
        seed_record(&repo, "car-2", "2025-08-26").await;
        repo.confirm_unconfirmed(confirmed_id).await.unwrap();

        let app_router = app(state);
        let (status, body) = send(app_router.clone(), get("/records?confirmed=true")).await;
        assert_eq!(status, StatusCode::OK);
        let content = body["data"]["content"].as_array().unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(content[0]["recordId"], "p-1");
        assert_eq!(content[0]["confirmed"], true);

        let (status, body) = send(
            app_router.clone(),
            get("/records?start=2025-08-27&end=2025-08-27"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["content"].as_array().unwrap().len(), 1);

        let (status, body) = send(
            app_router,
            get("/records?start=2025-09-01&end=2025-08-01"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 5044);
    }

    #[tokio::test]
    async fn malformed_date_bounds_carry_an_error_code() {
        let (state, _repo) = test_state(Vec::new());
        let (status, body) = send(app(state), get("/records?start=27-08-2025")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 5044);
        assert!(body["message"].as_str().unwrap().contains("27-08-2025"));
    }

    #[tokio::test]
    async fn confirm_endpoint_maps_the_state_machine_to_statuses() {
        let (state, repo) = test_state(Vec::new());
        seed_record(&repo, "car-1", "2025-08-27").await;
        let app_router = app(state);

        let (status, _body) =
            send(app_router.clone(), post_empty("/records/p-1/confirm")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) =
            send(app_router.clone(), post_empty("/records/p-1/confirm")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], 5042);

        let (status, body) =
            send(app_router.clone(), post_empty("/records/p-999999/confirm")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 5041);

        let (status, body) = send(app_router, post_empty("/records/xyz/confirm")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 5043);
    }
}
