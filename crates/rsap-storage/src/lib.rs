//! Record repository contract + Postgres and in-memory implementations.

use async_trait::async_trait;
use chrono::Utc;
use rsap_core::{AnomalyRecord, NaturalKey, NewAnomalyRecord, RecordStatus};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Acquire, PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "rsap-storage";

pub const PAGE_SIZE: u32 = 10;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

/// Date-range + status filter for the read API. Bounds are inclusive
/// calendar-date strings compared lexically, matching how `detected_at`
/// is stored.
#[derive(Debug, Clone)]
pub struct RecordFilter {
    pub start: String,
    pub end: String,
    pub status: Option<RecordStatus>,
}

#[derive(Debug, Clone)]
pub struct RecordPage {
    pub records: Vec<AnomalyRecord>,
    pub page: u32,
    pub total_pages: u32,
}

/// Per-row tally from one `persist_batch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub saved: usize,
    pub duplicates: usize,
    pub errors: usize,
}

/// Transactional key-by-primary-key store for anomaly records.
///
/// `confirm_unconfirmed` is the compare-and-swap behind the confirmation
/// workflow: it only flips rows still in `unconfirmed`, so two concurrent
/// confirmations of the same id cannot both succeed.
#[async_trait]
pub trait RecordRepository: Send + Sync {
    async fn exists_by_natural_key(&self, key: &NaturalKey) -> Result<bool, StoreError>;
    async fn insert(&self, draft: NewAnomalyRecord) -> Result<AnomalyRecord, StoreError>;
    /// Dedup-and-insert a whole batch inside one transaction. A rejected
    /// row is rolled back alone and tallied; the batch commits or aborts
    /// as a unit, so a systemic fault mid-batch stores nothing.
    async fn persist_batch(&self, drafts: Vec<NewAnomalyRecord>)
        -> Result<BatchOutcome, StoreError>;
    async fn find_by_id(&self, id: i64) -> Result<Option<AnomalyRecord>, StoreError>;
    async fn confirm_unconfirmed(&self, id: i64) -> Result<bool, StoreError>;
    async fn count(&self) -> Result<i64, StoreError>;
    async fn page_by_detected_range(
        &self,
        filter: &RecordFilter,
        page: u32,
    ) -> Result<RecordPage, StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgRecordRepository {
    pool: PgPool,
}

impl PgRecordRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS anomaly_records (
                id BIGSERIAL PRIMARY KEY,
                car_id TEXT,
                speed DOUBLE PRECISION,
                location_x DOUBLE PRECISION,
                location_y DOUBLE PRECISION,
                object_url TEXT,
                impact_force DOUBLE PRECISION,
                z_axis_vibration DOUBLE PRECISION,
                detected_at TEXT,
                status TEXT NOT NULL DEFAULT 'unconfirmed',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<AnomalyRecord, StoreError> {
        let status_raw: String = row.try_get("status")?;
        let status = RecordStatus::parse(&status_raw)
            .ok_or_else(|| StoreError::CorruptRow(format!("unknown status {status_raw:?}")))?;
        Ok(AnomalyRecord {
            id: row.try_get("id")?,
            car_id: row.try_get("car_id")?,
            speed: row.try_get("speed")?,
            location_x: row.try_get("location_x")?,
            location_y: row.try_get("location_y")?,
            object_url: row.try_get("object_url")?,
            impact_force: row.try_get("impact_force")?,
            z_axis_vibration: row.try_get("z_axis_vibration")?,
            detected_at: row.try_get("detected_at")?,
            status,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

// IS NOT DISTINCT FROM: null fields participate in the dedup key as a
// value equal to null.
const KEY_EXISTS_SQL: &str = r#"
    SELECT EXISTS(
        SELECT 1 FROM anomaly_records
         WHERE car_id IS NOT DISTINCT FROM $1
           AND location_x IS NOT DISTINCT FROM $2
           AND location_y IS NOT DISTINCT FROM $3
           AND detected_at IS NOT DISTINCT FROM $4
           AND impact_force IS NOT DISTINCT FROM $5
    ) AS present
"#;

const INSERT_SQL: &str = r#"
    INSERT INTO anomaly_records
        (car_id, speed, location_x, location_y, object_url,
         impact_force, z_axis_vibration, detected_at, status)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'unconfirmed')
    RETURNING *
"#;

/// Dedup check + insert for one row on an already-open connection.
/// Returns whether the row was inserted.
async fn insert_unless_duplicate(
    conn: &mut sqlx::PgConnection,
    draft: &NewAnomalyRecord,
) -> Result<bool, StoreError> {
    let key = draft.natural_key();
    let row = sqlx::query(KEY_EXISTS_SQL)
        .bind(&key.car_id)
        .bind(key.location_x)
        .bind(key.location_y)
        .bind(&key.detected_at)
        .bind(key.impact_force)
        .fetch_one(&mut *conn)
        .await?;
    if row.try_get::<bool, _>("present")? {
        return Ok(false);
    }
    sqlx::query(INSERT_SQL)
        .bind(&draft.car_id)
        .bind(draft.speed)
        .bind(draft.location_x)
        .bind(draft.location_y)
        .bind(&draft.object_url)
        .bind(draft.impact_force)
        .bind(draft.z_axis_vibration)
        .bind(&draft.detected_at)
        .fetch_one(&mut *conn)
        .await?;
    Ok(true)
}

#[async_trait]
impl RecordRepository for PgRecordRepository {
    async fn exists_by_natural_key(&self, key: &NaturalKey) -> Result<bool, StoreError> {
        let row = sqlx::query(KEY_EXISTS_SQL)
            .bind(&key.car_id)
            .bind(key.location_x)
            .bind(key.location_y)
            .bind(&key.detected_at)
            .bind(key.impact_force)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("present")?)
    }

    async fn insert(&self, draft: NewAnomalyRecord) -> Result<AnomalyRecord, StoreError> {
        let row = sqlx::query(INSERT_SQL)
            .bind(&draft.car_id)
            .bind(draft.speed)
            .bind(draft.location_x)
            .bind(draft.location_y)
            .bind(&draft.object_url)
            .bind(draft.impact_force)
            .bind(draft.z_axis_vibration)
            .bind(&draft.detected_at)
            .fetch_one(&self.pool)
            .await?;
        Self::record_from_row(&row)
    }

    async fn persist_batch(
        &self,
        drafts: Vec<NewAnomalyRecord>,
    ) -> Result<BatchOutcome, StoreError> {
        let mut outcome = BatchOutcome::default();
        let mut tx = self.pool.begin().await?;
        for draft in &drafts {
            // Nested transaction = savepoint: a rejected row rolls back
            // alone without poisoning the enclosing batch.
            let mut sp = tx.begin().await?;
            match insert_unless_duplicate(&mut *sp, draft).await {
                Ok(true) => {
                    sp.commit().await?;
                    outcome.saved += 1;
                }
                Ok(false) => {
                    sp.commit().await?;
                    outcome.duplicates += 1;
                }
                Err(err) => {
                    warn!(%err, "row rejected, rolling back its savepoint");
                    sp.rollback().await?;
                    outcome.errors += 1;
                }
            }
        }
        tx.commit().await?;
        debug!(
            saved = outcome.saved,
            duplicates = outcome.duplicates,
            errors = outcome.errors,
            "batch committed"
        );
        Ok(outcome)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<AnomalyRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM anomaly_records WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn confirm_unconfirmed(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE anomaly_records
               SET status = 'confirmed', updated_at = NOW()
             WHERE id = $1 AND status = 'unconfirmed'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM anomaly_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    async fn page_by_detected_range(
        &self,
        filter: &RecordFilter,
        page: u32,
    ) -> Result<RecordPage, StoreError> {
        // Lexical string range over detected_at, like the rest of the store.
        let count_row = match &filter.status {
            Some(status) => sqlx::query(
                "SELECT COUNT(*) AS n FROM anomaly_records \
                 WHERE detected_at >= $1 AND detected_at <= $2 AND status = $3",
            )
            .bind(&filter.start)
            .bind(&filter.end)
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?,
            None => sqlx::query(
                "SELECT COUNT(*) AS n FROM anomaly_records \
                 WHERE detected_at >= $1 AND detected_at <= $2",
            )
            .bind(&filter.start)
            .bind(&filter.end)
            .fetch_one(&self.pool)
            .await?,
        };
        let matched: i64 = count_row.try_get("n")?;
        let total_pages = (matched as u32).div_ceil(PAGE_SIZE);
        let offset = i64::from(page) * i64::from(PAGE_SIZE);

        let rows = match &filter.status {
            Some(status) => sqlx::query(
                "SELECT * FROM anomaly_records \
                 WHERE detected_at >= $1 AND detected_at <= $2 AND status = $3 \
                 ORDER BY detected_at DESC, id DESC LIMIT $4 OFFSET $5",
            )
            .bind(&filter.start)
            .bind(&filter.end)
            .bind(status.as_str())
            .bind(i64::from(PAGE_SIZE))
            .bind(offset)
            .fetch_all(&self.pool)
            .await?,
            None => sqlx::query(
                "SELECT * FROM anomaly_records \
                 WHERE detected_at >= $1 AND detected_at <= $2 \
                 ORDER BY detected_at DESC, id DESC LIMIT $3 OFFSET $4",
            )
            .bind(&filter.start)
            .bind(&filter.end)
            .bind(i64::from(PAGE_SIZE))
            .bind(offset)
            .fetch_all(&self.pool)
            .await?,
        };

        let records = rows
            .iter()
            .map(Self::record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(page, matched, "fetched record page");
        Ok(RecordPage {
            records,
            page,
            total_pages,
        })
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests, offline runs)
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryRecordRepository {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_id: i64,
    rows: Vec<AnomalyRecord>,
}

impl MemoryRecordRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key_of(record: &AnomalyRecord) -> NaturalKey {
    NaturalKey {
        car_id: record.car_id.clone(),
        location_x: record.location_x,
        location_y: record.location_y,
        detected_at: record.detected_at.clone(),
        impact_force: record.impact_force,
    }
}

fn push_record(inner: &mut MemoryInner, draft: NewAnomalyRecord) -> AnomalyRecord {
    inner.next_id += 1;
    let now = Utc::now();
    let record = AnomalyRecord {
        id: inner.next_id,
        car_id: draft.car_id,
        speed: draft.speed,
        location_x: draft.location_x,
        location_y: draft.location_y,
        object_url: draft.object_url,
        impact_force: draft.impact_force,
        z_axis_vibration: draft.z_axis_vibration,
        detected_at: draft.detected_at,
        status: RecordStatus::Unconfirmed,
        created_at: now,
        updated_at: now,
    };
    inner.rows.push(record.clone());
    record
}

#[async_trait]
impl RecordRepository for MemoryRecordRepository {
    async fn exists_by_natural_key(&self, key: &NaturalKey) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.rows.iter().any(|r| key_of(r) == *key))
    }

    async fn insert(&self, draft: NewAnomalyRecord) -> Result<AnomalyRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(push_record(&mut inner, draft))
    }

    async fn persist_batch(
        &self,
        drafts: Vec<NewAnomalyRecord>,
    ) -> Result<BatchOutcome, StoreError> {
        // The whole batch happens under one lock, so it is atomic the same
        // way the Postgres transaction is.
        let mut inner = self.inner.lock().await;
        let mut outcome = BatchOutcome::default();
        for draft in drafts {
            let key = draft.natural_key();
            if inner.rows.iter().any(|r| key_of(r) == key) {
                outcome.duplicates += 1;
                continue;
            }
            push_record(&mut inner, draft);
            outcome.saved += 1;
        }
        Ok(outcome)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<AnomalyRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.rows.iter().find(|r| r.id == id).cloned())
    }

    async fn confirm_unconfirmed(&self, id: i64) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner
            .rows
            .iter_mut()
            .find(|r| r.id == id && r.status == RecordStatus::Unconfirmed)
        {
            Some(record) => {
                record.status = RecordStatus::Confirmed;
                record.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count(&self) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.rows.len() as i64)
    }

    async fn page_by_detected_range(
        &self,
        filter: &RecordFilter,
        page: u32,
    ) -> Result<RecordPage, StoreError> {
        let inner = self.inner.lock().await;
        let mut matched: Vec<AnomalyRecord> = inner
            .rows
            .iter()
            .filter(|r| {
                let in_range = r
                    .detected_at
                    .as_deref()
                    .map(|d| d >= filter.start.as_str() && d <= filter.end.as_str())
                    .unwrap_or(false);
                let status_ok = filter.status.map(|s| r.status == s).unwrap_or(true);
                in_range && status_ok
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            b.detected_at
                .cmp(&a.detected_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        let total_pages = (matched.len() as u32).div_ceil(PAGE_SIZE);
        let start = page as usize * PAGE_SIZE as usize;
        let records = matched
            .into_iter()
            .skip(start)
            .take(PAGE_SIZE as usize)
            .collect();
        Ok(RecordPage {
            records,
            page,
            total_pages,
        })
    }
}
