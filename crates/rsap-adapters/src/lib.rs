//! External service clients: the analytical query engine and the user
//! directory. The engine is an opaque async job runner; `QueryExecutor`
//! and `ResultFetcher` wrap it with the pipeline's submit/poll/fetch
//! semantics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rsap_core::ServiceError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "rsap-adapters";

/// Terminal-or-not state of an analytics query job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed { reason: Option<String> },
    Cancelled,
}

/// Raw tabular result set: row 0 is the header, cells may be null.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub rows: Vec<Vec<Option<String>>>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("engine response invalid: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait AnalyticsEngine: Send + Sync {
    async fn start_query(&self, query: &str) -> Result<String, EngineError>;
    async fn query_status(&self, job_id: &str) -> Result<JobStatus, EngineError>;
    async fn query_results(&self, job_id: &str) -> Result<ResultSet, EngineError>;
}

// ---------------------------------------------------------------------------
// HTTP gateway implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub endpoint: String,
    pub database: String,
    pub output_location: String,
    pub workgroup: String,
    pub timeout: Duration,
}

/// Client for the query-gateway HTTP API fronting the object-store engine.
#[derive(Debug, Clone)]
pub struct HttpAnalyticsEngine {
    client: reqwest::Client,
    config: EngineConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartQueryRequest<'a> {
    query: &'a str,
    database: &'a str,
    output_location: &'a str,
    workgroup: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartQueryResponse {
    query_execution_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryStatusResponse {
    state: String,
    #[serde(default)]
    state_change_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryResultsResponse {
    #[serde(default)]
    rows: Vec<Vec<Option<String>>>,
}

impl HttpAnalyticsEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl AnalyticsEngine for HttpAnalyticsEngine {
    async fn start_query(&self, query: &str) -> Result<String, EngineError> {
        let url = format!("{}/v1/queries", self.config.endpoint);
        let body = StartQueryRequest {
            query,
            database: &self.config.database,
            output_location: &self.config.output_location,
            workgroup: &self.config.workgroup,
        };
        let resp: StartQueryResponse = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.query_execution_id)
    }

    async fn query_status(&self, job_id: &str) -> Result<JobStatus, EngineError> {
        let url = format!("{}/v1/queries/{job_id}", self.config.endpoint);
        let resp: QueryStatusResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        match resp.state.as_str() {
            "RUNNING" | "QUEUED" => Ok(JobStatus::Running),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed {
                reason: resp.state_change_reason,
            }),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(EngineError::Protocol(format!("unknown job state {other:?}"))),
        }
    }

    async fn query_results(&self, job_id: &str) -> Result<ResultSet, EngineError> {
        let url = format!("{}/v1/queries/{job_id}/results", self.config.endpoint);
        let resp: QueryResultsResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(ResultSet { rows: resp.rows })
    }
}

// ---------------------------------------------------------------------------
// Query executor: predicate validation + bounded polling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub database: String,
    pub table: String,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
}

impl QueryConfig {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            poll_interval: Duration::from_secs(2),
            max_poll_attempts: 150,
        }
    }
}

/// Submits predicate-qualified SELECTs and blocks until the job reaches a
/// terminal state. The poll loop is the pipeline's only intentional wait;
/// it holds no database resources, and callers may wrap the future in
/// `tokio::time::timeout` for an outer deadline.
#[derive(Clone)]
pub struct QueryExecutor {
    engine: Arc<dyn AnalyticsEngine>,
    config: QueryConfig,
}

impl QueryExecutor {
    pub fn new(engine: Arc<dyn AnalyticsEngine>, config: QueryConfig) -> Self {
        Self { engine, config }
    }

    pub async fn submit_conditional(&self, predicate: &str) -> Result<String, ServiceError> {
        if predicate.trim().is_empty() {
            return Err(ServiceError::InvalidPredicate);
        }
        let sql = format!(
            "SELECT * FROM {}.{} WHERE {}",
            self.config.database, self.config.table, predicate
        );
        info!(predicate, "submitting conditional query");
        let job_id = self
            .engine
            .start_query(&sql)
            .await
            .map_err(|e| ServiceError::QueryExecutionFailed {
                reason: e.to_string(),
            })?;
        info!(%job_id, "query submitted");
        self.await_completion(&job_id).await?;
        info!(%job_id, "query completed");
        Ok(job_id)
    }

    pub async fn await_completion(&self, job_id: &str) -> Result<(), ServiceError> {
        for attempt in 0..self.config.max_poll_attempts {
            let status = self.engine.query_status(job_id).await.map_err(|e| {
                ServiceError::QueryExecutionFailed {
                    reason: e.to_string(),
                }
            })?;
            match status {
                JobStatus::Succeeded => return Ok(()),
                JobStatus::Failed { reason } => {
                    let reason = reason.unwrap_or_else(|| "no reason reported".to_string());
                    warn!(%job_id, reason, "query failed");
                    return Err(ServiceError::QueryExecutionFailed { reason });
                }
                JobStatus::Cancelled => {
                    warn!(%job_id, "query cancelled");
                    return Err(ServiceError::QueryCancelled);
                }
                JobStatus::Running => {
                    debug!(%job_id, attempt, "query still running");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
        let waited =
            self.config.poll_interval * self.config.max_poll_attempts;
        Err(ServiceError::QueryTimeout {
            waited_secs: waited.as_secs(),
        })
    }
}

// ---------------------------------------------------------------------------
// Result fetcher: header-zip materialization
// ---------------------------------------------------------------------------

/// Pulls a completed job's result set and turns it into column→value maps.
/// Header names are lowercased; null cells are left out of the map, which
/// downstream normalization treats the same as null.
#[derive(Clone)]
pub struct ResultFetcher {
    engine: Arc<dyn AnalyticsEngine>,
}

impl ResultFetcher {
    pub fn new(engine: Arc<dyn AnalyticsEngine>) -> Self {
        Self { engine }
    }

    pub async fn fetch(
        &self,
        job_id: &str,
    ) -> Result<Vec<HashMap<String, String>>, ServiceError> {
        let set = self.engine.query_results(job_id).await.map_err(|e| {
            ServiceError::ResultRetrievalFailed {
                reason: e.to_string(),
            }
        })?;
        if set.rows.is_empty() {
            warn!(%job_id, "query returned no rows at all");
            return Ok(Vec::new());
        }

        let header: Vec<String> = set.rows[0]
            .iter()
            .map(|cell| cell.clone().unwrap_or_default().to_lowercase())
            .collect();

        let mut results = Vec::with_capacity(set.rows.len() - 1);
        for row in &set.rows[1..] {
            let mut mapped = HashMap::new();
            // Clamp to the shorter side when cell count != header count.
            for (name, cell) in header.iter().zip(row.iter()) {
                if let Some(value) = cell {
                    mapped.insert(name.clone(), value.clone());
                }
            }
            results.push(mapped);
        }
        info!(%job_id, rows = results.len(), "fetched query results");
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// User directory lookup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    pub user_name: String,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("no directory entry for user {0:?}")]
    UnknownUser(String),
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn lookup(&self, user_id: &str) -> Result<UserProfile, DirectoryError>;
}

/// Placeholder profile substituted when the directory is unreachable or the
/// id is unknown; lookup failures never propagate to the read API.
pub fn fallback_profile(car_id: Option<&str>) -> UserProfile {
    UserProfile {
        user_id: car_id.unwrap_or_default().to_string(),
        user_name: "unknown".to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct HttpUserDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUserDirectory {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl UserDirectory for HttpUserDirectory {
    async fn lookup(&self, user_id: &str) -> Result<UserProfile, DirectoryError> {
        let url = format!("{}/internal/v1/users/{user_id}/admin-info", self.base_url);
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DirectoryError::UnknownUser(user_id.to_string()));
        }
        let profile = response.error_for_status()?.json().await?;
        Ok(profile)
    }
}
