//! Database layer: pool setup, migrations, and the durable allocation store.
//!
//! Every [`AllocationStore`] method runs inside one SQLite transaction, so a
//! ledger change and its record write commit together or not at all. The
//! seating primitive is a single conditional `UPDATE`:
//!
//! ```sql
//! UPDATE capacity_ledger SET allocated_count = allocated_count + 1
//! WHERE  problem_id = ?1 AND allocated_count < <capacity of active ?1>
//! ```
//!
//! Write primitives open with `BEGIN IMMEDIATE`. SQLite admits one writer at
//! a time, so that statement is serialized against concurrent seatings and
//! retractions, and waiting writers block on the busy timeout. Lock conflicts
//! that outlast it (`SQLITE_BUSY` and friends) are reported as
//! [`AllocationError::Contention`] and retried by the engine.

use std::str::FromStr;
use std::time::Duration;

use allocation_core::{
    AllocationError, AllocationMethod, AllocationRequest, AllocationStore, CapacityEntry,
    LedgerDrift, PhaseGate, Problem, ProblemCatalog, RequestStatus, SeatOutcome, Submission,
};
use async_trait::async_trait;
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use crate::errors::Result;

type StoreResult<T> = allocation_core::Result<T>;

const BUSY_TIMEOUT_SECS: u64 = 5;

/// SQLite result codes that mean "someone else holds the lock".
const CONTENTION_CODES: &[&str] = &["5", "6", "261", "262", "517"];

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    let in_memory = url.contains(":memory:");

    let mut options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS));
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
    if in_memory {
        // The database lives and dies with its connection.
        pool_options = pool_options
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }
    let pool = pool_options.connect_with(options).await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Catalog seeding
// ─────────────────────────────────────────────────────────

/// One entry of the startup problem seed file.
#[derive(Debug, Clone, Deserialize)]
pub struct ProblemSeed {
    pub id: String,
    pub code: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub capacity: u32,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

pub async fn load_seed_file(path: &str) -> Result<Vec<ProblemSeed>> {
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

/// Upsert problem statements. Ledger rows are created for new problems and
/// left untouched for existing ones.
pub async fn seed_problems(pool: &SqlitePool, problems: &[ProblemSeed]) -> Result<usize> {
    let mut tx = pool.begin().await?;
    for problem in problems {
        sqlx::query(
            r#"
            INSERT INTO problem_statements (id, code, title, description, capacity, is_active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (id) DO UPDATE SET
                code        = excluded.code,
                title       = excluded.title,
                description = excluded.description,
                capacity    = excluded.capacity,
                is_active   = excluded.is_active
            "#,
        )
        .bind(&problem.id)
        .bind(&problem.code)
        .bind(&problem.title)
        .bind(&problem.description)
        .bind(i64::from(problem.capacity))
        .bind(problem.is_active)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(problems.len())
}

// ─────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────

const REQUEST_COLUMNS: &str = "id, team_id, preferences, status, resolved_problem_id, \
                               allocation_method, requested_at, resolved_at";

#[derive(Debug, sqlx::FromRow)]
struct RequestRow {
    id: i64,
    team_id: String,
    preferences: String,
    status: String,
    resolved_problem_id: Option<String>,
    allocation_method: Option<String>,
    requested_at: i64,
    resolved_at: Option<i64>,
}

impl RequestRow {
    fn into_request(self) -> StoreResult<AllocationRequest> {
        let preferences: Vec<String> =
            serde_json::from_str(&self.preferences).map_err(AllocationError::store)?;
        let status = RequestStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("unknown status {:?}", self.status)))?;
        let method = match self.allocation_method.as_deref() {
            Some(raw) => Some(
                AllocationMethod::parse(raw)
                    .ok_or_else(|| corrupt(format!("unknown allocation method {raw:?}")))?,
            ),
            None => None,
        };
        Ok(AllocationRequest {
            id: self.id,
            team_id: self.team_id,
            preferences,
            status,
            resolved_problem_id: self.resolved_problem_id,
            method,
            requested_at: self.requested_at,
            resolved_at: self.resolved_at,
        })
    }
}

fn corrupt(message: String) -> AllocationError {
    AllocationError::Store(message.into())
}

fn to_count(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

fn store_err(err: sqlx::Error) -> AllocationError {
    if is_contention(&err) {
        AllocationError::Contention
    } else {
        AllocationError::store(err)
    }
}

fn is_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| CONTENTION_CODES.contains(&&*code))
            .unwrap_or(false),
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

// ─────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────

/// Durable store over the `capacity_ledger` and `project_requests` tables.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open or close preference submission.
    pub async fn set_project_request_open(&self, open: bool) -> Result<()> {
        sqlx::query("UPDATE hackathon_settings SET project_request_open = ?1 WHERE id = 1")
            .bind(open)
            .execute(&self.pool)
            .await?;
        info!("Project requests {}", if open { "opened" } else { "closed" });
        Ok(())
    }

    /// Open a write transaction. `BEGIN IMMEDIATE` takes the write lock up
    /// front, so concurrent writers queue on `busy_timeout` instead of failing
    /// a read-to-write upgrade with `SQLITE_BUSY_SNAPSHOT`.
    async fn begin(&self) -> StoreResult<Transaction<'static, Sqlite>> {
        self.pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(store_err)
    }
}

/// The conditional increment. Returns whether a seat was taken.
async fn try_increment(tx: &mut Transaction<'_, Sqlite>, problem_id: &str) -> StoreResult<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE capacity_ledger
        SET    allocated_count = allocated_count + 1
        WHERE  problem_id = ?1
          AND  allocated_count < (
                   SELECT capacity FROM problem_statements
                   WHERE  id = ?1 AND is_active = 1
               )
        "#,
    )
    .bind(problem_id)
    .execute(&mut **tx)
    .await
    .map_err(store_err)?
    .rows_affected();
    Ok(rows == 1)
}

#[async_trait]
impl AllocationStore for SqliteStore {
    async fn submit(&self, submission: &Submission) -> StoreResult<AllocationRequest> {
        let mut tx = self.begin().await?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT status FROM project_requests WHERE team_id = ?1")
                .bind(&submission.team_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(store_err)?;
        if matches!(existing, Some((ref status,)) if status == RequestStatus::Allocated.as_str()) {
            return Err(AllocationError::AlreadyAllocated {
                team_id: submission.team_id.clone(),
            });
        }

        let first_choice = submission.first_choice();
        let seated = try_increment(&mut tx, first_choice).await?;
        let (status, resolved_problem_id, method, resolved_at) = if seated {
            (
                RequestStatus::Allocated,
                Some(first_choice),
                Some(AllocationMethod::Fcfs.as_str()),
                Some(submission.requested_at),
            )
        } else {
            (RequestStatus::Waitlist, None, None, None)
        };

        let preferences = serde_json::to_string(&submission.preferences)
            .map_err(AllocationError::store)?;
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            r#"
            INSERT INTO project_requests
                (team_id, preferences, status, resolved_problem_id,
                 allocation_method, requested_at, resolved_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (team_id) DO UPDATE SET
                preferences         = excluded.preferences,
                status              = excluded.status,
                resolved_problem_id = excluded.resolved_problem_id,
                allocation_method   = excluded.allocation_method,
                requested_at        = excluded.requested_at,
                resolved_at         = excluded.resolved_at
            RETURNING {REQUEST_COLUMNS}
            "#
        ))
        .bind(&submission.team_id)
        .bind(preferences)
        .bind(status.as_str())
        .bind(resolved_problem_id)
        .bind(method)
        .bind(submission.requested_at)
        .bind(resolved_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        debug!(
            "submit team={} first_choice={first_choice} seated={seated}",
            submission.team_id
        );
        row.into_request()
    }

    async fn seat_waitlisted(
        &self,
        snapshot: &AllocationRequest,
        problem_id: &str,
        resolved_at: i64,
    ) -> StoreResult<SeatOutcome> {
        let mut tx = self.begin().await?;

        let current: Option<(i64, String, String)> = sqlx::query_as(
            "SELECT id, status, preferences FROM project_requests WHERE team_id = ?1",
        )
        .bind(&snapshot.team_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;

        let Some((id, status, preferences)) = current else {
            return Ok(SeatOutcome::Stale);
        };
        let stored: Vec<String> =
            serde_json::from_str(&preferences).map_err(AllocationError::store)?;
        if id != snapshot.id
            || status != RequestStatus::Waitlist.as_str()
            || stored != snapshot.preferences
        {
            return Ok(SeatOutcome::Stale);
        }

        if !try_increment(&mut tx, problem_id).await? {
            return Ok(SeatOutcome::Full);
        }

        let row = sqlx::query_as::<_, RequestRow>(&format!(
            r#"
            UPDATE project_requests
            SET    status = 'allocated',
                   resolved_problem_id = ?1,
                   allocation_method = ?2,
                   resolved_at = ?3
            WHERE  id = ?4
            RETURNING {REQUEST_COLUMNS}
            "#
        ))
        .bind(problem_id)
        .bind(AllocationMethod::Random.as_str())
        .bind(resolved_at)
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        Ok(SeatOutcome::Seated(row.into_request()?))
    }

    async fn retract(&self, team_id: &str) -> StoreResult<AllocationRequest> {
        let mut tx = self.begin().await?;

        let removed = sqlx::query_as::<_, RequestRow>(&format!(
            "DELETE FROM project_requests WHERE team_id = ?1 RETURNING {REQUEST_COLUMNS}"
        ))
        .bind(team_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?
        .ok_or_else(|| AllocationError::NotFound {
            team_id: team_id.to_string(),
        })?;

        if let Some(problem_id) = &removed.resolved_problem_id {
            sqlx::query(
                r#"
                UPDATE capacity_ledger
                SET    allocated_count = allocated_count - 1
                WHERE  problem_id = ?1 AND allocated_count > 0
                "#,
            )
            .bind(problem_id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }

        tx.commit().await.map_err(store_err)?;
        removed.into_request()
    }

    async fn find_by_team(&self, team_id: &str) -> StoreResult<Option<AllocationRequest>> {
        sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM project_requests WHERE team_id = ?1"
        ))
        .bind(team_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?
        .map(RequestRow::into_request)
        .transpose()
    }

    async fn list_requests(&self) -> StoreResult<Vec<AllocationRequest>> {
        sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM project_requests ORDER BY requested_at DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?
        .into_iter()
        .map(RequestRow::into_request)
        .collect()
    }

    async fn waitlisted(&self) -> StoreResult<Vec<AllocationRequest>> {
        sqlx::query_as::<_, RequestRow>(&format!(
            r#"
            SELECT {REQUEST_COLUMNS}
            FROM   project_requests
            WHERE  status = 'waitlist'
            ORDER  BY requested_at ASC, id ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?
        .into_iter()
        .map(RequestRow::into_request)
        .collect()
    }

    async fn capacity_snapshot(&self) -> StoreResult<Vec<CapacityEntry>> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT p.id, p.capacity, COALESCE(l.allocated_count, 0)
            FROM   problem_statements p
            LEFT   JOIN capacity_ledger l ON l.problem_id = p.id
            ORDER  BY p.id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(rows
            .into_iter()
            .map(|(problem_id, capacity, allocated)| CapacityEntry {
                problem_id,
                capacity: to_count(capacity),
                allocated_count: to_count(allocated),
            })
            .collect())
    }

    async fn reconcile(&self) -> StoreResult<Vec<LedgerDrift>> {
        let mut tx = self.begin().await?;

        // Write first so the transaction holds the write lock for the scan.
        sqlx::query(
            "INSERT OR IGNORE INTO capacity_ledger (problem_id, allocated_count) \
             SELECT id, 0 FROM problem_statements",
        )
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT problem_id, ledger_count, record_count FROM (
                SELECT l.problem_id       AS problem_id,
                       l.allocated_count  AS ledger_count,
                       (SELECT COUNT(*) FROM project_requests r
                        WHERE  r.status = 'allocated'
                          AND  r.resolved_problem_id = l.problem_id) AS record_count
                FROM   capacity_ledger l
            )
            WHERE  ledger_count != record_count
            ORDER  BY problem_id ASC
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(store_err)?;

        for (problem_id, _, record_count) in &rows {
            sqlx::query("UPDATE capacity_ledger SET allocated_count = ?1 WHERE problem_id = ?2")
                .bind(record_count)
                .bind(problem_id)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;

        Ok(rows
            .into_iter()
            .map(|(problem_id, ledger_count, record_count)| LedgerDrift {
                problem_id,
                ledger_count: to_count(ledger_count),
                record_count: to_count(record_count),
            })
            .collect())
    }
}

#[async_trait]
impl PhaseGate for SqliteStore {
    async fn is_submission_open(&self) -> StoreResult<bool> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT project_request_open FROM hackathon_settings WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;
        Ok(row.map(|(open,)| open).unwrap_or(false))
    }
}

#[async_trait]
impl ProblemCatalog for SqliteStore {
    async fn list_active_problems(&self) -> StoreResult<Vec<Problem>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT id, capacity FROM problem_statements WHERE is_active = 1 ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows
            .into_iter()
            .map(|(id, capacity)| Problem {
                id,
                capacity: to_count(capacity),
                is_active: true,
            })
            .collect())
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
