//! Durable delivery tracking backed by SQLite.

use std::collections::VecDeque;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, warn};

use super::{
    AttemptOutcome, DeliveryAttempt, DeliveryMetrics, DeliveryTracker, ErrorClass, MetricsFilter,
};
use crate::Result;

/// How many attempts the local fallback buffer holds while the store is
/// unavailable. Oldest entries are dropped beyond this.
const FALLBACK_CAPACITY: usize = 1024;

/// Durable tracker: every attempt is a row with an expiry timestamp, so
/// history ages out naturally, and per-`(channel, outcome)` running
/// counters are maintained in the same transaction so metrics reads never
/// scan the attempt log.
///
/// Counters are lifetime totals; only the per-request history expires.
///
/// Store unavailability degrades to a bounded in-process buffer with a
/// warning log; `record` never surfaces an error, because tracking must
/// not block delivery. Buffered attempts are flushed in order on the next
/// successful write.
pub struct SqliteTracker {
    pool: SqlitePool,
    ttl: Duration,
    fallback: Mutex<VecDeque<DeliveryAttempt>>,
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    request_id: String,
    channel: String,
    attempt_number: i64,
    started_at: String,
    finished_at: String,
    outcome: String,
    error_class: Option<String>,
    error_message: Option<String>,
    latency_ms: i64,
}

impl AttemptRow {
    fn into_attempt(self) -> DeliveryAttempt {
        DeliveryAttempt {
            request_id: self.request_id,
            channel: self.channel,
            attempt_number: self.attempt_number.max(0) as u32,
            started_at: parse_timestamp(&self.started_at),
            finished_at: parse_timestamp(&self.finished_at),
            outcome: AttemptOutcome::parse(&self.outcome).unwrap_or(AttemptOutcome::Failed),
            error_class: self.error_class.as_deref().and_then(ErrorClass::parse),
            error_message: self.error_message,
            latency_ms: self.latency_ms.max(0) as u64,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CounterRow {
    channel: String,
    outcome: String,
    count: i64,
    latency_ms_total: i64,
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl SqliteTracker {
    /// Open (creating if missing) the tracking database and ensure the
    /// schema exists. `ttl` is the retention applied to every recorded
    /// attempt.
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS delivery_attempt (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                attempt_number INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                outcome TEXT NOT NULL,
                error_class TEXT,
                error_message TEXT,
                latency_ms INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_delivery_attempt_request
             ON delivery_attempt (request_id)",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_delivery_attempt_expiry
             ON delivery_attempt (expires_at)",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS delivery_counter (
                channel TEXT NOT NULL,
                outcome TEXT NOT NULL,
                count INTEGER NOT NULL,
                latency_ms_total INTEGER NOT NULL,
                PRIMARY KEY (channel, outcome)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            ttl,
            fallback: Mutex::new(VecDeque::new()),
        })
    }

    /// Insert one attempt and bump its running counter atomically.
    async fn insert(&self, attempt: &DeliveryAttempt) -> Result<()> {
        let expires_at = attempt.finished_at.timestamp() + self.ttl.as_secs() as i64;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO delivery_attempt
                (request_id, channel, attempt_number, started_at, finished_at,
                 outcome, error_class, error_message, latency_ms, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&attempt.request_id)
        .bind(&attempt.channel)
        .bind(attempt.attempt_number as i64)
        .bind(attempt.started_at.to_rfc3339())
        .bind(attempt.finished_at.to_rfc3339())
        .bind(attempt.outcome.as_str())
        .bind(attempt.error_class.map(|class| class.as_str()))
        .bind(&attempt.error_message)
        .bind(attempt.latency_ms as i64)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;

        // Counter maintenance is a single upsert statement, so concurrent
        // writers never read-modify-write the totals.
        sqlx::query(
            r#"
            INSERT INTO delivery_counter (channel, outcome, count, latency_ms_total)
            VALUES (?, ?, 1, ?)
            ON CONFLICT (channel, outcome) DO UPDATE SET
                count = count + 1,
                latency_ms_total = latency_ms_total + excluded.latency_ms_total
            "#,
        )
        .bind(&attempt.channel)
        .bind(attempt.outcome.as_str())
        .bind(attempt.latency_ms as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Drain the fallback buffer into the store, oldest first, stopping
    /// at the first failure so order is preserved.
    async fn flush_fallback(&self) {
        loop {
            let next = self.fallback.lock().pop_front();
            let Some(attempt) = next else { return };

            if let Err(error) = self.insert(&attempt).await {
                debug!(%error, "tracking store still unavailable, keeping fallback buffer");
                self.fallback.lock().push_front(attempt);
                return;
            }
        }
    }

    fn buffer_locally(&self, attempt: DeliveryAttempt) {
        let mut fallback = self.fallback.lock();
        if fallback.len() >= FALLBACK_CAPACITY {
            fallback.pop_front();
            warn!("tracking fallback buffer full, dropping oldest attempt");
        }
        fallback.push_back(attempt);
    }

    /// Number of attempts currently parked in the fallback buffer.
    pub fn fallback_len(&self) -> usize {
        self.fallback.lock().len()
    }

    /// Delete attempts whose TTL has passed. Returns the rows removed.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM delivery_attempt WHERE expires_at <= ?")
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if removed > 0 {
            debug!(removed, "swept expired delivery attempts");
        }
        Ok(removed)
    }
}

#[async_trait]
impl DeliveryTracker for SqliteTracker {
    async fn record(&self, attempt: DeliveryAttempt) {
        self.flush_fallback().await;

        if let Err(error) = self.insert(&attempt).await {
            warn!(
                %error,
                request = %attempt.request_id,
                channel = %attempt.channel,
                "tracking store unavailable, buffering attempt locally"
            );
            self.buffer_locally(attempt);
        }
    }

    async fn history(&self, request_id: &str) -> Vec<DeliveryAttempt> {
        let rows: Vec<AttemptRow> = match sqlx::query_as(
            r#"
            SELECT request_id, channel, attempt_number, started_at, finished_at,
                   outcome, error_class, error_message, latency_ms
            FROM delivery_attempt
            WHERE request_id = ? AND expires_at > ?
            ORDER BY id
            "#,
        )
        .bind(request_id)
        .bind(Utc::now().timestamp())
        .fetch_all(&self.pool)
        .await
        {
            Ok(rows) => rows,
            Err(error) => {
                warn!(%error, "tracking store unavailable, serving fallback history");
                Vec::new()
            }
        };

        let mut attempts: Vec<DeliveryAttempt> =
            rows.into_iter().map(AttemptRow::into_attempt).collect();

        // Unflushed attempts are still part of the truth.
        attempts.extend(
            self.fallback
                .lock()
                .iter()
                .filter(|attempt| attempt.request_id == request_id)
                .cloned(),
        );
        attempts
    }

    async fn metrics(&self, filter: &MetricsFilter) -> DeliveryMetrics {
        let query = match &filter.channel {
            Some(channel) => sqlx::query_as(
                "SELECT channel, outcome, count, latency_ms_total
                 FROM delivery_counter WHERE channel = ?",
            )
            .bind(channel.clone()),
            None => sqlx::query_as(
                "SELECT channel, outcome, count, latency_ms_total FROM delivery_counter",
            ),
        };

        let rows: Vec<CounterRow> = match query.fetch_all(&self.pool).await {
            Ok(rows) => rows,
            Err(error) => {
                warn!(%error, "tracking store unavailable, returning empty metrics");
                return DeliveryMetrics::default();
            }
        };

        DeliveryMetrics::from_counts(rows.into_iter().filter_map(|row| {
            let outcome = AttemptOutcome::parse(&row.outcome)?;
            Some((
                row.channel,
                outcome,
                row.count.max(0) as u64,
                row.latency_ms_total.max(0) as u64,
            ))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(request_id: &str, channel: &str, number: u32, outcome: AttemptOutcome) -> DeliveryAttempt {
        let now = Utc::now();
        DeliveryAttempt {
            request_id: request_id.to_string(),
            channel: channel.to_string(),
            attempt_number: number,
            started_at: now,
            finished_at: now,
            outcome,
            error_class: None,
            error_message: None,
            latency_ms: 25,
        }
    }

    async fn tracker_in(dir: &tempfile::TempDir, ttl: Duration) -> SqliteTracker {
        let path = dir.path().join("tracking.db");
        let url = format!("sqlite://{}", path.display());
        SqliteTracker::connect(&url, ttl).await.unwrap()
    }

    #[tokio::test]
    async fn history_round_trips_in_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(&dir, Duration::from_secs(3600)).await;

        tracker
            .record(attempt("req-1", "sms", 1, AttemptOutcome::Failed))
            .await;
        tracker
            .record(attempt("req-1", "sms", 2, AttemptOutcome::Delivered))
            .await;
        tracker
            .record(attempt("req-2", "sms", 1, AttemptOutcome::Delivered))
            .await;

        let history = tracker.history("req-1").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].attempt_number, 1);
        assert_eq!(history[0].outcome, AttemptOutcome::Failed);
        assert_eq!(history[1].attempt_number, 2);
        assert_eq!(history[1].outcome, AttemptOutcome::Delivered);
    }

    #[tokio::test]
    async fn metrics_come_from_running_counters() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(&dir, Duration::from_secs(3600)).await;

        tracker
            .record(attempt("req-1", "sms", 1, AttemptOutcome::Delivered))
            .await;
        tracker
            .record(attempt("req-2", "sms", 1, AttemptOutcome::Exhausted))
            .await;
        tracker
            .record(attempt("req-3", "email", 1, AttemptOutcome::Delivered))
            .await;

        let all = tracker.metrics(&MetricsFilter::default()).await;
        assert!((all.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(all.counts_by_channel["sms"], 2);

        let email = tracker.metrics(&MetricsFilter::channel("email")).await;
        assert!((email.success_rate - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn expired_history_is_hidden_and_swept() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(&dir, Duration::ZERO).await;

        tracker
            .record(attempt("req-1", "sms", 1, AttemptOutcome::Delivered))
            .await;

        assert!(tracker.history("req-1").await.is_empty());
        assert_eq!(tracker.sweep_expired().await.unwrap(), 1);

        // Counters survive expiry; they are lifetime totals.
        let metrics = tracker.metrics(&MetricsFilter::default()).await;
        assert_eq!(metrics.counts_by_outcome["delivered"], 1);
    }

    #[tokio::test]
    async fn store_outage_buffers_locally_without_failing() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(&dir, Duration::from_secs(3600)).await;

        tracker.pool.close().await;

        // Never panics or errors, parks the attempt in the fallback.
        tracker
            .record(attempt("req-1", "sms", 1, AttemptOutcome::Delivered))
            .await;
        assert_eq!(tracker.fallback_len(), 1);

        // Degraded-mode history still reflects the buffered attempt.
        let history = tracker.history("req-1").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, AttemptOutcome::Delivered);
    }
}
