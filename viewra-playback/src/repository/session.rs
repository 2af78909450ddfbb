use std::collections::HashMap;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use crate::models::{
    ProviderStats, SessionFilter, SessionRecord, SessionResult, SessionStatus,
    TranscodeProgress, TranscodeRequest, TranscodeStage,
};
use crate::{Error, Result};

const SELECT_COLUMNS: &str = "id, provider_id, status, request, progress, result, \
     content_hash, error, start_time, end_time, last_accessed, directory_path";

/// Durable session state over SQLite. The sole authority for session
/// status; every component mutates through this API.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run pending schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Internal(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Create a queued session for `provider_id`
    pub async fn create(
        &self,
        provider_id: &str,
        request: &TranscodeRequest,
    ) -> Result<SessionRecord> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let record = SessionRecord {
            id,
            provider_id: provider_id.to_string(),
            status: SessionStatus::Queued,
            request: request.clone(),
            progress: TranscodeProgress::default(),
            result: None,
            content_hash: None,
            error: None,
            start_time: now,
            end_time: None,
            last_accessed: now,
            directory_path: SessionRecord::directory_name(request, provider_id, id),
        };

        let request_json = serde_json::to_string(&record.request)?;
        let progress_json = serde_json::to_string(&record.progress)?;

        retrying(|| async {
            sqlx::query(
                "INSERT INTO sessions \
                 (id, provider_id, status, request, progress, start_time, last_accessed, directory_path) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(record.id.to_string())
            .bind(&record.provider_id)
            .bind(record.status.as_str())
            .bind(&request_json)
            .bind(&progress_json)
            .bind(record.start_time)
            .bind(record.last_accessed)
            .bind(&record.directory_path)
            .execute(&self.pool)
            .await
            .map_err(Error::from)
        })
        .await?;

        Ok(record)
    }

    /// Fetch a session and touch `last_accessed`
    pub async fn get(&self, id: Uuid) -> Result<SessionRecord> {
        let row = sqlx::query(&format!(
            "UPDATE sessions SET last_accessed = ? WHERE id = ? RETURNING {SELECT_COLUMNS}"
        ))
        .bind(Utc::now())
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_record(&row),
            None => Err(Error::NotFound(format!("session {id}"))),
        }
    }

    /// Record a progress report. The first report moves a queued session to
    /// running; reports against terminal sessions are dropped. Returns
    /// whether the row changed.
    pub async fn update_progress(&self, id: Uuid, update: &TranscodeProgress) -> Result<bool> {
        // Merge against the current value so late out-of-order reports
        // cannot regress percent or stage.
        let current = self.peek(id).await?;
        if current.status.is_terminal() {
            return Ok(false);
        }
        let merged = current.progress.merged_with(update);
        let progress_json = serde_json::to_string(&merged)?;

        let affected = retrying(|| async {
            sqlx::query(
                "UPDATE sessions SET status = ?, progress = ?, last_accessed = ? \
                 WHERE id = ? AND status IN ('queued', 'running')",
            )
            .bind(SessionStatus::Running.as_str())
            .bind(&progress_json)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(Error::from)
        })
        .await?
        .rows_affected();

        Ok(affected > 0)
    }

    /// Mark a session completed with its published result
    pub async fn complete(&self, id: Uuid, result: &SessionResult) -> Result<bool> {
        let result_json = serde_json::to_string(result)?;
        let progress_json = serde_json::to_string(&TranscodeProgress {
            percent: 100.0,
            stage: TranscodeStage::Done,
            ..TranscodeProgress::default()
        })?;

        let affected = retrying(|| async {
            sqlx::query(
                "UPDATE sessions SET status = 'completed', result = ?, content_hash = ?, \
                 progress = ?, end_time = ?, last_accessed = ?, bytes_processed = ? \
                 WHERE id = ? AND status IN ('queued', 'running')",
            )
            .bind(&result_json)
            .bind(&result.content_hash)
            .bind(&progress_json)
            .bind(Utc::now())
            .bind(Utc::now())
            .bind(result.total_bytes as i64)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(Error::from)
        })
        .await?
        .rows_affected();

        Ok(affected > 0)
    }

    /// Mark a session failed with a human-readable reason
    pub async fn fail(&self, id: Uuid, error: &str) -> Result<bool> {
        let affected = retrying(|| async {
            sqlx::query(
                "UPDATE sessions SET status = 'failed', error = ?, end_time = ?, last_accessed = ? \
                 WHERE id = ? AND status IN ('queued', 'running')",
            )
            .bind(error)
            .bind(Utc::now())
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(Error::from)
        })
        .await?
        .rows_affected();

        Ok(affected > 0)
    }

    /// Cancel a session. Only queued/running sessions transition; calling
    /// on a terminal session is a no-op returning false.
    pub async fn cancel(&self, id: Uuid) -> Result<bool> {
        let affected = retrying(|| async {
            sqlx::query(
                "UPDATE sessions SET status = 'cancelled', end_time = ?, last_accessed = ? \
                 WHERE id = ? AND status IN ('queued', 'running')",
            )
            .bind(Utc::now())
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(Error::from)
        })
        .await?
        .rows_affected();

        Ok(affected > 0)
    }

    /// Cancel with a recorded reason (e.g. "timeout")
    pub async fn cancel_with_reason(&self, id: Uuid, reason: &str) -> Result<bool> {
        let affected = retrying(|| async {
            sqlx::query(
                "UPDATE sessions SET status = 'cancelled', error = ?, end_time = ?, last_accessed = ? \
                 WHERE id = ? AND status IN ('queued', 'running')",
            )
            .bind(reason)
            .bind(Utc::now())
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(Error::from)
        })
        .await?
        .rows_affected();

        Ok(affected > 0)
    }

    /// Whether a session exists and is non-terminal
    pub async fn session_active(&self, id: Uuid) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM sessions WHERE id = ? AND status IN ('queued', 'running')",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// List sessions for a provider, optionally filtered by status, start
    /// time and count
    pub async fn list_by_provider(
        &self,
        provider_id: &str,
        filter: &SessionFilter,
    ) -> Result<Vec<SessionRecord>> {
        let mut sql = format!(
            "SELECT {SELECT_COLUMNS} FROM sessions WHERE provider_id = ?"
        );
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.since.is_some() {
            sql.push_str(" AND start_time >= ?");
        }
        sql.push_str(" ORDER BY start_time DESC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql).bind(provider_id);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(since) = filter.since {
            query = query.bind(since);
        }
        if let Some(limit) = filter.limit {
            query = query.bind(i64::from(limit));
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    /// Aggregated counters for one provider
    pub async fn provider_stats(&self, provider_id: &str) -> Result<ProviderStats> {
        let row = sqlx::query(
            "SELECT \
             COALESCE(SUM(CASE WHEN status IN ('queued', 'running') THEN 1 ELSE 0 END), 0) AS active, \
             COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed, \
             COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed, \
             COALESCE(SUM(bytes_processed), 0) AS bytes_processed \
             FROM sessions WHERE provider_id = ?",
        )
        .bind(provider_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(ProviderStats {
            provider_id: provider_id.to_string(),
            active: row.try_get::<i64, _>("active")? as u64,
            completed: row.try_get::<i64, _>("completed")? as u64,
            failed: row.try_get::<i64, _>("failed")? as u64,
            bytes_processed: row.try_get::<i64, _>("bytes_processed")? as u64,
        })
    }

    /// Count of non-terminal sessions, for admission control
    pub async fn count_active(&self) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM sessions WHERE status IN ('queued', 'running')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    /// Non-terminal session counts per provider, for selection scoring
    pub async fn active_by_provider(&self) -> Result<HashMap<String, u64>> {
        let rows = sqlx::query(
            "SELECT provider_id, COUNT(*) AS n FROM sessions \
             WHERE status IN ('queued', 'running') GROUP BY provider_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::with_capacity(rows.len());
        for row in rows {
            counts.insert(
                row.try_get::<String, _>("provider_id")?,
                row.try_get::<i64, _>("n")? as u64,
            );
        }
        Ok(counts)
    }

    /// Whether any workspace directory name belongs to a live record
    pub async fn directory_known(&self, directory: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM sessions WHERE directory_path = ? LIMIT 1")
            .bind(directory)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Most recent access across sessions referencing a content hash.
    /// Feeds the emergency cleanup's eviction order.
    pub async fn last_access_for_hash(&self, hash: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT MAX(last_accessed) AS latest FROM sessions WHERE content_hash = ?",
        )
        .bind(hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<Option<DateTime<Utc>>, _>("latest")?)
    }

    /// Delete terminal sessions past their retention, returning the removed
    /// records so workspaces can be cascaded
    pub async fn sweep_expired(
        &self,
        retention_completed: Duration,
        retention_failed: Duration,
    ) -> Result<Vec<SessionRecord>> {
        let now = Utc::now();
        let completed_cutoff = now
            - chrono::Duration::from_std(retention_completed)
                .map_err(|e| Error::Internal(e.to_string()))?;
        let failed_cutoff = now
            - chrono::Duration::from_std(retention_failed)
                .map_err(|e| Error::Internal(e.to_string()))?;

        let rows = sqlx::query(&format!(
            "DELETE FROM sessions \
             WHERE (status = 'completed' AND last_accessed < ?) \
                OR (status IN ('failed', 'cancelled') AND last_accessed < ?) \
             RETURNING {SELECT_COLUMNS}"
        ))
        .bind(completed_cutoff)
        .bind(failed_cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    /// Startup recovery: sessions left non-terminal by a previous process
    /// are failed, since their encoder processes did not survive the restart.
    pub async fn recover_orphaned(&self) -> Result<u64> {
        let affected = sqlx::query(
            "UPDATE sessions SET status = 'failed', error = 'process lost on restart', \
             end_time = ?, last_accessed = ? \
             WHERE status IN ('queued', 'running')",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected > 0 {
            warn!(count = affected, "recovered orphaned sessions from previous run");
        }
        Ok(affected)
    }

    /// Read without touching `last_accessed`
    async fn peek(&self, id: Uuid) -> Result<SessionRecord> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM sessions WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_record(&row),
            None => Err(Error::NotFound(format!("session {id}"))),
        }
    }
}

/// Bounded retry for transient storage failures: 3 attempts, 50 ms base
/// exponential backoff. Everything else propagates immediately.
async fn retrying<T, F, Fut>(op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    op.retry(
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(50))
            .with_max_times(3),
    )
    .when(Error::is_transient)
    .await
}

/// Convert a database row to a `SessionRecord`
fn row_to_record(row: &SqliteRow) -> Result<SessionRecord> {
    let id_str: String = row.try_get("id")?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| Error::Internal(format!("malformed session id {id_str}: {e}")))?;

    let status_str: String = row.try_get("status")?;
    let status = SessionStatus::parse(&status_str)
        .ok_or_else(|| Error::Internal(format!("unknown session status {status_str}")))?;

    let request_json: String = row.try_get("request")?;
    let progress_json: String = row.try_get("progress")?;
    let result_json: Option<String> = row.try_get("result")?;

    Ok(SessionRecord {
        id,
        provider_id: row.try_get("provider_id")?,
        status,
        request: serde_json::from_str(&request_json)?,
        progress: serde_json::from_str(&progress_json)?,
        result: result_json.as_deref().map(serde_json::from_str).transpose()?,
        content_hash: row.try_get("content_hash")?,
        error: row.try_get("error")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        last_accessed: row.try_get("last_accessed")?,
        directory_path: row.try_get("directory_path")?,
    })
}
