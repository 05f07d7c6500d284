//! Post-call summary persistence.
//!
//! One SQLite row per ended session, keyed by `session_id UNIQUE` so a
//! re-applied end-call can never double-write. All writes go through a
//! single writer task with a bounded queue; a failed write retries at
//! most three times with exponential backoff and is then dropped (the
//! session teardown proceeds regardless).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::session::TranscriptEntry;

/// Maximum write attempts per record.
const WRITE_ATTEMPTS: u32 = 3;

/// Base backoff between retries (doubles per attempt).
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

// ── Record ─────────────────────────────────────────────────────────

/// Everything persisted for one ended session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRecord {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "endedAt")]
    pub ended_at: DateTime<Utc>,
    /// Wall-clock call duration in milliseconds.
    pub duration_ms: i64,
    pub sentiment: String,
    pub intent: String,
    #[serde(rename = "resolutionStatus")]
    pub resolution_status: String,
    #[serde(rename = "keyTopics")]
    pub key_topics: Vec<String>,
    #[serde(rename = "actionItems")]
    pub action_items: Vec<String>,
    #[serde(rename = "frustrationAvg")]
    pub frustration_avg: f64,
    #[serde(rename = "frustrationMax")]
    pub frustration_max: u8,
    #[serde(rename = "frustrationTrend")]
    pub frustration_trend: String,
    #[serde(rename = "escalationCount")]
    pub escalation_count: u32,
    #[serde(rename = "escalationAlerts")]
    pub escalation_alerts: Vec<String>,
    #[serde(rename = "supervisorInterventions")]
    pub supervisor_interventions: u32,
    #[serde(rename = "supervisorId")]
    pub supervisor_id: Option<String>,
    /// Total time under HUMAN control, in milliseconds.
    #[serde(rename = "supervisorTakeoverDuration")]
    pub supervisor_takeover_ms: i64,
    #[serde(rename = "fullSummary")]
    pub full_summary: String,
    pub insights: String,
    pub transcript: Vec<TranscriptEntry>,
    #[serde(rename = "firstMessageAt")]
    pub first_message_at: Option<DateTime<Utc>>,
    #[serde(rename = "lastMessageAt")]
    pub last_message_at: Option<DateTime<Utc>>,
}

// ── Query ──────────────────────────────────────────────────────────

/// Filter/pagination parameters for the history endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SummaryQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub sentiment: Option<String>,
    pub intent: Option<String>,
    pub resolution: Option<String>,
    #[serde(rename = "sortBy")]
    pub sort_by: Option<String>,
    #[serde(rename = "sortOrder")]
    pub sort_order: Option<String>,
}

/// Aggregate stats returned alongside the page.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryStats {
    pub total: i64,
    #[serde(rename = "avgFrustration")]
    pub avg_frustration: f64,
    #[serde(rename = "avgDurationMs")]
    pub avg_duration_ms: f64,
    pub escalated: i64,
    #[serde(rename = "totalInterventions")]
    pub total_interventions: i64,
    #[serde(rename = "bySentiment")]
    pub by_sentiment: Vec<(String, i64)>,
    #[serde(rename = "byIntent")]
    pub by_intent: Vec<(String, i64)>,
}

/// One history page plus aggregates.
#[derive(Debug, Serialize)]
pub struct SummaryPage {
    pub summaries: Vec<SummaryRecord>,
    pub stats: SummaryStats,
}

// ── Store ──────────────────────────────────────────────────────────

pub struct SummaryStore {
    conn: Mutex<Connection>,
}

impl SummaryStore {
    /// Open (or create) the summary database.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create summary dir: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open summary DB: {}", db_path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA temp_store   = MEMORY;",
        )?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS summaries (
                id                        INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id                TEXT NOT NULL UNIQUE,
                created_at                TEXT NOT NULL,
                ended_at                  TEXT NOT NULL,
                duration_ms               INTEGER NOT NULL,
                sentiment                 TEXT NOT NULL DEFAULT 'neutral',
                intent                    TEXT NOT NULL DEFAULT 'unknown',
                resolution_status         TEXT NOT NULL DEFAULT 'unknown',
                key_topics                TEXT NOT NULL DEFAULT '[]',
                action_items              TEXT NOT NULL DEFAULT '[]',
                frustration_avg           REAL NOT NULL DEFAULT 0,
                frustration_max           INTEGER NOT NULL DEFAULT 0,
                frustration_trend         TEXT NOT NULL DEFAULT 'stable',
                escalation_count          INTEGER NOT NULL DEFAULT 0,
                escalation_alerts         TEXT NOT NULL DEFAULT '[]',
                supervisor_interventions  INTEGER NOT NULL DEFAULT 0,
                supervisor_id             TEXT,
                supervisor_takeover_ms    INTEGER NOT NULL DEFAULT 0,
                full_summary              TEXT NOT NULL DEFAULT '',
                insights                  TEXT NOT NULL DEFAULT '',
                transcript                TEXT NOT NULL DEFAULT '[]',
                first_message_at          TEXT,
                last_message_at           TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_summaries_created_at ON summaries(created_at);
            CREATE INDEX IF NOT EXISTS idx_summaries_sentiment ON summaries(sentiment);
            CREATE INDEX IF NOT EXISTS idx_summaries_intent ON summaries(intent);",
        )?;
        Ok(())
    }

    /// Insert a record. A duplicate `session_id` is a no-op, which makes
    /// the end-of-call write idempotent.
    pub fn insert(&self, record: &SummaryRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO summaries
                (session_id, created_at, ended_at, duration_ms, sentiment, intent,
                 resolution_status, key_topics, action_items, frustration_avg,
                 frustration_max, frustration_trend, escalation_count, escalation_alerts,
                 supervisor_interventions, supervisor_id, supervisor_takeover_ms,
                 full_summary, insights, transcript, first_message_at, last_message_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                     ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)
             ON CONFLICT(session_id) DO NOTHING",
            params![
                record.session_id,
                record.created_at.to_rfc3339(),
                record.ended_at.to_rfc3339(),
                record.duration_ms,
                record.sentiment,
                record.intent,
                record.resolution_status,
                serde_json::to_string(&record.key_topics)?,
                serde_json::to_string(&record.action_items)?,
                record.frustration_avg,
                i64::from(record.frustration_max),
                record.frustration_trend,
                i64::from(record.escalation_count),
                serde_json::to_string(&record.escalation_alerts)?,
                i64::from(record.supervisor_interventions),
                record.supervisor_id,
                record.supervisor_takeover_ms,
                record.full_summary,
                record.insights,
                serde_json::to_string(&record.transcript)?,
                record.first_message_at.map(|t| t.to_rfc3339()),
                record.last_message_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Fetch one summary by session id.
    pub fn fetch(&self, session_id: &str) -> Result<Option<SummaryRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM summaries WHERE session_id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![session_id], row_to_record)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Filtered, paged history plus aggregate stats over the same filter.
    pub fn query(&self, q: &SummaryQuery) -> Result<SummaryPage> {
        let conn = self.conn.lock();

        let mut filter = String::from(" WHERE 1=1");
        let mut bind_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        let mut param_idx = 1;

        for (column, value) in [
            ("sentiment", &q.sentiment),
            ("intent", &q.intent),
            ("resolution_status", &q.resolution),
        ] {
            if let Some(value) = value {
                filter.push_str(&format!(" AND {column} = ?{param_idx}"));
                bind_values.push(Box::new(value.clone()));
                param_idx += 1;
            }
        }

        let filter_bind_count = bind_values.len();

        // Sort column is whitelisted; anything else falls back to recency.
        let sort_column = match q.sort_by.as_deref() {
            Some("duration") => "duration_ms",
            Some("frustrationMax") => "frustration_max",
            Some("endedAt") => "ended_at",
            _ => "created_at",
        };
        let sort_order = match q.sort_order.as_deref() {
            Some("asc") => "ASC",
            _ => "DESC",
        };

        let mut sql = format!("SELECT {COLUMNS} FROM summaries{filter}");
        sql.push_str(&format!(" ORDER BY {sort_column} {sort_order}"));

        let limit = q.limit.unwrap_or(50);
        sql.push_str(&format!(" LIMIT ?{param_idx}"));
        bind_values.push(Box::new(limit));
        param_idx += 1;
        if let Some(offset) = q.offset {
            sql.push_str(&format!(" OFFSET ?{param_idx}"));
            bind_values.push(Box::new(offset));
        }

        let params_refs: Vec<&dyn rusqlite::types::ToSql> =
            bind_values.iter().map(|b| b.as_ref()).collect();

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_refs.as_slice(), row_to_record)?;
        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }

        // Aggregates over the same filter (not just the page).
        let stat_refs: Vec<&dyn rusqlite::types::ToSql> = bind_values
            .iter()
            .take(filter_bind_count)
            .map(|b| b.as_ref())
            .collect();
        let stats_sql = format!(
            "SELECT COUNT(*),
                    COALESCE(AVG(frustration_avg), 0),
                    COALESCE(AVG(duration_ms), 0),
                    COALESCE(SUM(CASE WHEN escalation_count > 0 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(supervisor_interventions), 0)
             FROM summaries{filter}"
        );
        let (total, avg_frustration, avg_duration_ms, escalated, total_interventions) = conn
            .query_row(&stats_sql, stat_refs.as_slice(), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?;

        let mut stmt = conn.prepare(&format!(
            "SELECT sentiment, COUNT(*) as cnt FROM summaries{filter}
             GROUP BY sentiment ORDER BY cnt DESC"
        ))?;
        let by_sentiment: Vec<(String, i64)> = stmt
            .query_map(stat_refs.as_slice(), |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();

        let mut stmt = conn.prepare(&format!(
            "SELECT intent, COUNT(*) as cnt FROM summaries{filter}
             GROUP BY intent ORDER BY cnt DESC"
        ))?;
        let by_intent: Vec<(String, i64)> = stmt
            .query_map(stat_refs.as_slice(), |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();

        Ok(SummaryPage {
            summaries,
            stats: SummaryStats {
                total,
                avg_frustration,
                avg_duration_ms,
                escalated,
                total_interventions,
                by_sentiment,
                by_intent,
            },
        })
    }
}

const COLUMNS: &str = "session_id, created_at, ended_at, duration_ms, sentiment, intent,
    resolution_status, key_topics, action_items, frustration_avg, frustration_max,
    frustration_trend, escalation_count, escalation_alerts, supervisor_interventions,
    supervisor_id, supervisor_takeover_ms, full_summary, insights, transcript,
    first_message_at, last_message_at";

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_json_list(raw: String) -> Vec<String> {
    serde_json::from_str(&raw).unwrap_or_default()
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SummaryRecord> {
    Ok(SummaryRecord {
        session_id: row.get(0)?,
        created_at: parse_ts(row.get(1)?),
        ended_at: parse_ts(row.get(2)?),
        duration_ms: row.get(3)?,
        sentiment: row.get(4)?,
        intent: row.get(5)?,
        resolution_status: row.get(6)?,
        key_topics: parse_json_list(row.get(7)?),
        action_items: parse_json_list(row.get(8)?),
        frustration_avg: row.get(9)?,
        frustration_max: row.get::<_, i64>(10)?.clamp(0, 100) as u8,
        frustration_trend: row.get(11)?,
        escalation_count: row.get::<_, i64>(12)?.max(0) as u32,
        escalation_alerts: parse_json_list(row.get(13)?),
        supervisor_interventions: row.get::<_, i64>(14)?.max(0) as u32,
        supervisor_id: row.get(15)?,
        supervisor_takeover_ms: row.get(16)?,
        full_summary: row.get(17)?,
        insights: row.get(18)?,
        transcript: row
            .get::<_, String>(19)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default(),
        first_message_at: row.get::<_, Option<String>>(20)?.map(parse_ts),
        last_message_at: row.get::<_, Option<String>>(21)?.map(parse_ts),
    })
}

// ── Writer task ────────────────────────────────────────────────────

struct WriteRequest {
    record: SummaryRecord,
    ack: oneshot::Sender<Result<()>>,
}

/// Handle for submitting summary writes.
#[derive(Clone)]
pub struct SummaryWriter {
    tx: mpsc::Sender<WriteRequest>,
}

impl SummaryWriter {
    /// Enqueue a record and wait for the write (including retries) to
    /// settle. Returns an error only after all attempts failed.
    pub async fn persist(&self, record: SummaryRecord) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WriteRequest { record, ack })
            .await
            .map_err(|_| anyhow::anyhow!("Summary writer is gone"))?;
        done.await
            .map_err(|_| anyhow::anyhow!("Summary writer dropped the request"))?
    }
}

/// Spawn the single writer task over a bounded queue.
pub fn start_writer(store: Arc<SummaryStore>, queue: usize) -> (SummaryWriter, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<WriteRequest>(queue.max(1));
    let handle = tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let mut outcome = Ok(());
            for attempt in 0..WRITE_ATTEMPTS {
                match store.insert(&request.record) {
                    Ok(()) => {
                        outcome = Ok(());
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            session_id = %request.record.session_id,
                            attempt = attempt + 1,
                            error = %e,
                            "Summary write failed"
                        );
                        outcome = Err(e);
                        if attempt + 1 < WRITE_ATTEMPTS {
                            tokio::time::sleep(RETRY_BACKOFF * 2u32.pow(attempt)).await;
                        }
                    }
                }
            }
            if outcome.is_err() {
                tracing::error!(
                    session_id = %request.record.session_id,
                    "Summary dropped after {WRITE_ATTEMPTS} attempts"
                );
            }
            let _ = request.ack.send(outcome);
        }
        tracing::debug!("Summary writer terminated");
    });
    (SummaryWriter { tx }, handle)
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;

    fn record(session_id: &str) -> SummaryRecord {
        SummaryRecord {
            session_id: session_id.into(),
            created_at: Utc::now(),
            ended_at: Utc::now(),
            duration_ms: 65_000,
            sentiment: "neutral".into(),
            intent: "support".into(),
            resolution_status: "resolved".into(),
            key_topics: vec!["billing".into()],
            action_items: vec!["refund issued".into()],
            frustration_avg: 33.5,
            frustration_max: 85,
            frustration_trend: "falling".into(),
            escalation_count: 1,
            escalation_alerts: vec!["repeated complaints".into()],
            supervisor_interventions: 1,
            supervisor_id: Some("sup42".into()),
            supervisor_takeover_ms: 12_000,
            full_summary: "Customer disputed a charge; resolved with refund.".into(),
            insights: "Billing page confuses customers.".into(),
            transcript: vec![TranscriptEntry {
                role: Role::Customer,
                content: "my bill is wrong".into(),
                timestamp: Utc::now(),
                seq: 1,
            }],
            first_message_at: Some(Utc::now()),
            last_message_at: Some(Utc::now()),
        }
    }

    #[test]
    fn insert_and_fetch_round_trip() {
        let store = SummaryStore::open_in_memory().unwrap();
        store.insert(&record("s1")).unwrap();

        let fetched = store.fetch("s1").unwrap().unwrap();
        assert_eq!(fetched.session_id, "s1");
        assert_eq!(fetched.frustration_max, 85);
        assert_eq!(fetched.key_topics, vec!["billing"]);
        assert_eq!(fetched.supervisor_id.as_deref(), Some("sup42"));
        assert_eq!(fetched.transcript.len(), 1);
        assert_eq!(fetched.transcript[0].content, "my bill is wrong");
    }

    #[test]
    fn fetch_missing_is_none() {
        let store = SummaryStore::open_in_memory().unwrap();
        assert!(store.fetch("ghost").unwrap().is_none());
    }

    #[test]
    fn duplicate_session_id_is_a_no_op() {
        let store = SummaryStore::open_in_memory().unwrap();
        store.insert(&record("s1")).unwrap();

        let mut second = record("s1");
        second.sentiment = "angry".into();
        store.insert(&second).unwrap();

        // The first write wins.
        let fetched = store.fetch("s1").unwrap().unwrap();
        assert_eq!(fetched.sentiment, "neutral");

        let page = store.query(&SummaryQuery::default()).unwrap();
        assert_eq!(page.stats.total, 1);
    }

    #[test]
    fn query_filters_by_sentiment_and_intent() {
        let store = SummaryStore::open_in_memory().unwrap();
        store.insert(&record("s1")).unwrap();
        let mut angry = record("s2");
        angry.sentiment = "angry".into();
        angry.intent = "complaint".into();
        store.insert(&angry).unwrap();

        let q = SummaryQuery {
            sentiment: Some("angry".into()),
            ..Default::default()
        };
        let page = store.query(&q).unwrap();
        assert_eq!(page.summaries.len(), 1);
        assert_eq!(page.summaries[0].session_id, "s2");
        assert_eq!(page.stats.total, 1);

        let q = SummaryQuery {
            intent: Some("support".into()),
            ..Default::default()
        };
        let page = store.query(&q).unwrap();
        assert_eq!(page.summaries.len(), 1);
        assert_eq!(page.summaries[0].session_id, "s1");
    }

    #[test]
    fn query_pagination_and_sort() {
        let store = SummaryStore::open_in_memory().unwrap();
        for i in 0..5 {
            let mut r = record(&format!("s{i}"));
            r.duration_ms = i64::from(i) * 1000;
            store.insert(&r).unwrap();
        }

        let q = SummaryQuery {
            limit: Some(2),
            offset: Some(1),
            sort_by: Some("duration".into()),
            sort_order: Some("asc".into()),
            ..Default::default()
        };
        let page = store.query(&q).unwrap();
        assert_eq!(page.summaries.len(), 2);
        assert_eq!(page.summaries[0].duration_ms, 1000);
        assert_eq!(page.summaries[1].duration_ms, 2000);
        // Stats cover the whole filtered set, not just the page.
        assert_eq!(page.stats.total, 5);
    }

    #[test]
    fn query_rejects_unknown_sort_column() {
        let store = SummaryStore::open_in_memory().unwrap();
        store.insert(&record("s1")).unwrap();
        let q = SummaryQuery {
            sort_by: Some("; DROP TABLE summaries".into()),
            ..Default::default()
        };
        // Falls back to created_at instead of interpolating the input.
        let page = store.query(&q).unwrap();
        assert_eq!(page.summaries.len(), 1);
    }

    #[test]
    fn stats_aggregate_escalations_and_interventions() {
        let store = SummaryStore::open_in_memory().unwrap();
        store.insert(&record("s1")).unwrap();
        let mut calm = record("s2");
        calm.escalation_count = 0;
        calm.supervisor_interventions = 0;
        store.insert(&calm).unwrap();

        let page = store.query(&SummaryQuery::default()).unwrap();
        assert_eq!(page.stats.total, 2);
        assert_eq!(page.stats.escalated, 1);
        assert_eq!(page.stats.total_interventions, 1);
        assert!(page
            .stats
            .by_sentiment
            .iter()
            .any(|(label, count)| label == "neutral" && *count == 2));
    }

    #[tokio::test]
    async fn writer_persists_and_acks() {
        let store = Arc::new(SummaryStore::open_in_memory().unwrap());
        let (writer, handle) = start_writer(Arc::clone(&store), 16);

        writer.persist(record("s1")).await.unwrap();
        assert!(store.fetch("s1").unwrap().is_some());

        drop(writer);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn writer_duplicate_write_is_ok() {
        let store = Arc::new(SummaryStore::open_in_memory().unwrap());
        let (writer, _handle) = start_writer(Arc::clone(&store), 16);

        writer.persist(record("s1")).await.unwrap();
        // Second write of the same session settles fine (no-op).
        writer.persist(record("s1")).await.unwrap();
    }
}
