//! Columnar store access (ClickHouse), bounded by a process-wide semaphore
//! standing in for the connection pool the spec describes (default size
//! 10), since the `clickhouse` crate itself pools HTTP keep-alive
//! connections internally without exposing a pool-size knob.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::config::StoreConfig;
use crate::error::{KubeDoorError, Result};
use crate::model::{AgentStatus, ControlRecord, EventRecord, PeakSample};

const INSERT_BATCH_SIZE: usize = 10_000;

pub struct Store {
    client: clickhouse::Client,
    http: reqwest::Client,
    config: StoreConfig,
    pool: Arc<Semaphore>,
}

impl Store {
    pub fn new(config: &StoreConfig) -> Self {
        let client = clickhouse::Client::default()
            .with_url(config.url())
            .with_user(&config.user)
            .with_password(&config.password)
            .with_database(&config.database);
        Self {
            client,
            http: reqwest::Client::new(),
            config: config.clone(),
            pool: Arc::new(Semaphore::new(config.pool_size)),
        }
    }

    async fn permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        self.pool.acquire().await.map_err(|_| KubeDoorError::PoolExhausted)
    }

    /// Idempotent per-day purge before a harvest re-insert.
    pub async fn delete_peak_samples_for_day(&self, env: &str, date: &str) -> Result<()> {
        let _permit = self.permit().await?;
        self.client
            .query("ALTER TABLE k8s_resources DELETE WHERE env = ? AND date = ?")
            .bind(env)
            .bind(date)
            .execute()
            .await
            .map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))
    }

    /// Batch-insert PeakSample rows, flushing every `INSERT_BATCH_SIZE` rows.
    pub async fn insert_peak_samples(&self, rows: &[PeakSample]) -> Result<()> {
        let _permit = self.permit().await?;
        for chunk in rows.chunks(INSERT_BATCH_SIZE) {
            let mut insert = self
                .client
                .insert("k8s_resources")
                .map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))?;
            for row in chunk {
                insert
                    .write(row)
                    .await
                    .map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))?;
            }
            insert.end().await.map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn peak_samples_for_day(&self, env: &str, date: &str) -> Result<Vec<PeakSample>> {
        let _permit = self.permit().await?;
        self.client
            .query("SELECT ?fields FROM k8s_resources WHERE env = ? AND date = ?")
            .bind(env)
            .bind(date)
            .fetch_all::<PeakSample>()
            .await
            .map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))
    }

    /// The date within the last `lookback_days` maximizing
    /// `Σ pod_count × p95_pod_load` for `env`.
    pub async fn best_peak_day(&self, env: &str, lookback_days: i64) -> Result<Option<String>> {
        let _permit = self.permit().await?;
        #[derive(serde::Deserialize, clickhouse::Row)]
        struct Row {
            date: String,
        }
        let cutoff = (Utc::now().date_naive() - Duration::days(lookback_days))
            .format("%Y-%m-%d")
            .to_string();
        let rows: Vec<Row> = self
            .client
            .query(
                "SELECT date FROM k8s_resources WHERE env = ? AND date >= ? \
                 GROUP BY date ORDER BY sum(pod_count * p95_pod_load) DESC LIMIT 1 \
                 SETTINGS max_threads = 1",
            )
            .bind(env)
            .bind(&cutoff)
            .fetch_all()
            .await
            .map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))?;
        Ok(rows.into_iter().next().map(|r| r.date))
    }

    pub async fn control_record(&self, env: &str, namespace: &str, deployment: &str) -> Result<Option<ControlRecord>> {
        let _permit = self.permit().await?;
        let mut rows = self
            .client
            .query(
                "SELECT ?fields FROM k8s_res_control FINAL \
                 WHERE env = ? AND namespace = ? AND deployment = ?",
            )
            .bind(env)
            .bind(namespace)
            .bind(deployment)
            .fetch_all::<ControlRecord>()
            .await
            .map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))?;
        Ok(rows.pop())
    }

    pub async fn control_records_for_env(&self, env: &str) -> Result<Vec<ControlRecord>> {
        let _permit = self.permit().await?;
        self.client
            .query("SELECT ?fields FROM k8s_res_control FINAL WHERE env = ?")
            .bind(env)
            .fetch_all::<ControlRecord>()
            .await
            .map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))
    }

    pub async fn upsert_control_record(&self, record: &ControlRecord) -> Result<()> {
        let _permit = self.permit().await?;
        let mut insert = self
            .client
            .insert("k8s_res_control")
            .map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))?;
        insert
            .write(record)
            .await
            .map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))?;
        insert.end().await.map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))
    }

    /// Collapse tombstones after a batch of operator-originated DML.
    pub async fn optimize_final(&self, table: &str) -> Result<()> {
        let _permit = self.permit().await?;
        self.client
            .query(&format!("OPTIMIZE TABLE {table} FINAL"))
            .execute()
            .await
            .map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))
    }

    pub async fn agent_status(&self, env: &str) -> Result<Option<AgentStatus>> {
        let _permit = self.permit().await?;
        #[derive(serde::Deserialize, clickhouse::Row)]
        struct Row {
            env: String,
            collect: bool,
            peak_hours: String,
            admission: bool,
            admission_namespace: String,
            nms_not_confirm: bool,
            scheduler: bool,
        }
        let mut rows: Vec<Row> = self
            .client
            .query("SELECT ?fields FROM k8s_agent_status FINAL WHERE env = ?")
            .bind(env)
            .fetch_all()
            .await
            .map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))?;
        Ok(rows.pop().map(|r| AgentStatus {
            env: r.env,
            collect: r.collect,
            peak_hours: r.peak_hours,
            admission: r.admission,
            admission_namespace: r
                .admission_namespace
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            nms_not_confirm: r.nms_not_confirm,
            scheduler: r.scheduler,
            last_heartbeat_at: None,
            online: false,
        }))
    }

    pub async fn upsert_event(&self, event: &EventRecord) -> Result<()> {
        let _permit = self.permit().await?;
        let mut insert = self
            .client
            .insert("k8s_events")
            .map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))?;
        insert
            .write(event)
            .await
            .map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))?;
        insert.end().await.map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))
    }

    /// Stamp the stored `level` to "已告警" on first alert match, regardless
    /// of dedup outcome.
    pub async fn mark_event_alerted(&self, event_uid: &str) -> Result<()> {
        let _permit = self.permit().await?;
        self.client
            .query("ALTER TABLE k8s_events UPDATE level = '已告警' WHERE eventUid = ?")
            .bind(event_uid)
            .execute()
            .await
            .map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))
    }

    /// Event search: `k8s`, `start_time`, `end_time`, `limit` are required;
    /// every other field in `filter` is an equality match, except `message`
    /// (substring) and `count_gte` (inequality).
    pub async fn query_events(&self, filter: &EventQuery) -> Result<Vec<EventRecord>> {
        let _permit = self.permit().await?;
        let mut sql = String::from(
            "SELECT ?fields FROM k8s_events WHERE k8s = ? AND lastTimestamp >= ? AND lastTimestamp <= ?",
        );
        let mut clauses = String::new();
        macro_rules! eq_filter {
            ($field:expr, $column:literal) => {
                if $field.is_some() {
                    clauses.push_str(concat!(" AND ", $column, " = ?"));
                }
            };
        }
        eq_filter!(filter.namespace, "namespace");
        eq_filter!(filter.kind, "kind");
        eq_filter!(filter.name, "name");
        eq_filter!(filter.reason, "reason");
        eq_filter!(filter.level, "level");
        eq_filter!(filter.reporting_component, "reportingComponent");
        eq_filter!(filter.reporting_instance, "reportingInstance");
        if filter.count_gte.is_some() {
            clauses.push_str(" AND count >= ?");
        }
        if filter.message.is_some() {
            clauses.push_str(" AND message LIKE ?");
        }
        sql.push_str(&clauses);
        sql.push_str(" ORDER BY lastTimestamp DESC LIMIT ?");

        let mut q = self
            .client
            .query(&sql)
            .bind(&filter.k8s)
            .bind(&filter.start_time)
            .bind(&filter.end_time);
        if let Some(v) = &filter.namespace {
            q = q.bind(v);
        }
        if let Some(v) = &filter.kind {
            q = q.bind(v);
        }
        if let Some(v) = &filter.name {
            q = q.bind(v);
        }
        if let Some(v) = &filter.reason {
            q = q.bind(v);
        }
        if let Some(v) = &filter.level {
            q = q.bind(v);
        }
        if let Some(v) = &filter.reporting_component {
            q = q.bind(v);
        }
        if let Some(v) = &filter.reporting_instance {
            q = q.bind(v);
        }
        if let Some(v) = filter.count_gte {
            q = q.bind(v);
        }
        if let Some(v) = &filter.message {
            q = q.bind(format!("%{v}%"));
        }
        q.bind(filter.limit)
            .fetch_all::<EventRecord>()
            .await
            .map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))
    }

    /// Flip the admission toggle for `env`, leaving every other column as
    /// stored. A no-op re-invocation (flipping to the state already in
    /// effect) still round-trips through ClickHouse's replacing-merge
    /// semantics rather than special-cased away, matching `ALTER ... UPDATE`
    /// elsewhere in this module.
    pub async fn set_admission(&self, env: &str, enabled: bool) -> Result<()> {
        let _permit = self.permit().await?;
        self.client
            .query("ALTER TABLE k8s_agent_status UPDATE admission = ? WHERE env = ?")
            .bind(enabled)
            .bind(env)
            .execute()
            .await
            .map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))
    }

    /// Constrained SQL pass-through for `/api/sql`: read-only callers may
    /// only run `SELECT`; writers may also run `ALTER`/`INSERT`.
    /// `__KUBEDOORDB__` is replaced with the configured database name so
    /// callers don't need to hardcode it.
    pub async fn run_sql(&self, sql: &str, allow_write: bool) -> Result<Value> {
        let resolved = sql.replace("__KUBEDOORDB__", &self.config.database);
        let keyword = resolved.trim_start().split_whitespace().next().unwrap_or("").to_uppercase();
        let is_select = keyword == "SELECT";
        if !is_select && !allow_write {
            return Err(KubeDoorError::Forbidden("read-only caller may only run SELECT".into()));
        }
        if !is_select && keyword != "ALTER" && keyword != "INSERT" {
            return Err(KubeDoorError::BadRequest(format!("statement type {keyword} is not permitted")));
        }

        let _permit = self.permit().await?;
        let url = format!("{}/?database={}&default_format=JSON", self.config.url(), self.config.database);
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.config.user, Some(&self.config.password))
            .body(resolved)
            .send()
            .await
            .map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(KubeDoorError::StoreUnavailable(format!("clickhouse returned {status}: {text}")));
        }
        if is_select {
            let text = response.text().await.map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))?;
            serde_json::from_str(&text).or(Ok(Value::String(text)))
        } else {
            Ok(json!({ "status": "ok" }))
        }
    }

    /// Distinct values for one event field within `[start_time, end_time]`,
    /// used to populate the search UI's per-field filter menus. `field` is
    /// validated against a fixed column whitelist before it ever reaches
    /// the query string.
    pub async fn event_field_menu(&self, k8s: &str, field: &str, start_time: &str, end_time: &str) -> Result<Vec<String>> {
        const ALLOWED: &[&str] = &["namespace", "kind", "name", "reason", "level", "reportingComponent", "reportingInstance"];
        if !ALLOWED.contains(&field) {
            return Err(KubeDoorError::BadRequest(format!("unsupported menu field {field}")));
        }
        let _permit = self.permit().await?;
        #[derive(serde::Deserialize, clickhouse::Row)]
        struct Row {
            value: String,
        }
        let sql = format!(
            "SELECT DISTINCT {field} AS value FROM k8s_events \
             WHERE k8s = ? AND lastTimestamp >= ? AND lastTimestamp <= ? LIMIT 1000"
        );
        let rows: Vec<Row> = self
            .client
            .query(&sql)
            .bind(k8s)
            .bind(start_time)
            .bind(end_time)
            .fetch_all()
            .await
            .map_err(|e| KubeDoorError::StoreUnavailable(e.to_string()))?;
        Ok(rows.into_iter().map(|r| r.value).collect())
    }
}

/// `/api/events/query` filter set: required window/scope fields plus the
/// optional per-field predicates named in the routing contract.
#[derive(Debug, Default, serde::Deserialize)]
pub struct EventQuery {
    pub k8s: String,
    pub start_time: String,
    pub end_time: String,
    pub limit: u32,
    pub namespace: Option<String>,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub reason: Option<String>,
    pub level: Option<String>,
    pub count_gte: Option<i32>,
    pub reporting_component: Option<String>,
    pub reporting_instance: Option<String>,
    pub message: Option<String>,
}
