//! C3: peak-window metrics harvest and control-table lifecycle.
//!
//! For each collecting env, walk backwards from "yesterday" across a
//! lookback window, skip any day whose peak window hasn't ended yet,
//! purge and re-insert that day's `PeakSample` rows from the eight
//! instant queries, then select the day maximizing
//! `Σ pod_count × p95_pod_load` and derive `ControlRecord` upserts from
//! it — inserting fresh rows (with `pod_count_ai = pod_count_manual = -1`)
//! for a never-seen env, and updating in place for one already tracked.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use futures::future::join_all;

use crate::config::MetricsSourceConfig;
use crate::error::{KubeDoorError, Result};
use crate::metrics_source::{calculate_peak_duration_and_end_time, query_for, MetricsSourceClient, QUERY_NAMES};
use crate::model::{normalize_request, ControlRecord, PeakSample};
use crate::store::Store;

const LOOKBACK_DAYS: i64 = 14;
const NAMESPACE_EXCLUDE: &str = "kube-.*|monitoring|istio-.*";

/// Window the best-peak-day pick is drawn from — distinct from
/// `LOOKBACK_DAYS`, which bounds how far back the harvest walk itself goes.
/// Ported literally from the original's `toDate(today() - 10)`.
const BEST_DAY_LOOKBACK_DAYS: i64 = 10;

pub struct Harvester {
    store: Arc<Store>,
    metrics: Arc<MetricsSourceClient>,
    metrics_config: MetricsSourceConfig,
}

impl Harvester {
    pub fn new(store: Arc<Store>, metrics: Arc<MetricsSourceClient>, metrics_config: MetricsSourceConfig) -> Self {
        Self {
            store,
            metrics,
            metrics_config,
        }
    }

    /// Fan out one harvest pass per collecting env.
    pub async fn harvest_all(&self, envs: &[String], peak_hours: &str) -> Vec<Result<()>> {
        join_all(envs.iter().map(|env| self.harvest_env(env, peak_hours))).await
    }

    pub async fn harvest_env(&self, env: &str, peak_hours: &str) -> Result<()> {
        let today = Utc::now().date_naive();
        let now = Utc::now().naive_utc();

        for offset in 1..=LOOKBACK_DAYS {
            let date = today - Duration::days(offset);
            let (duration, end_dt) = calculate_peak_duration_and_end_time(date, peak_hours)?;
            if end_dt > now {
                continue;
            }
            self.harvest_day(env, date, &duration, end_dt).await?;
        }

        self.refresh_control_records(env).await
    }

    async fn harvest_day(&self, env: &str, date: NaiveDate, duration: &str, end_dt: chrono::NaiveDateTime) -> Result<()> {
        let date_str = date.format("%Y-%m-%d").to_string();
        self.store.delete_peak_samples_for_day(env, &date_str).await?;

        let at_unix = end_dt.and_utc().timestamp();
        let mut columns: HashMap<&'static str, HashMap<(String, String), f64>> = HashMap::new();
        for name in QUERY_NAMES {
            let promql = query_for(name, NAMESPACE_EXCLUDE, &self.metrics_config.prom_k8s_tag_key, env, duration);
            let result = self.metrics.instant_query(&promql, at_unix).await?;
            columns.insert(name, result);
        }

        let keys: std::collections::HashSet<(String, String)> = columns
            .get("pod_num")
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();

        let get = |col: &str, key: &(String, String)| -> f64 {
            columns.get(col).and_then(|m| m.get(key)).copied().unwrap_or(-1.0)
        };

        let rows: Vec<PeakSample> = keys
            .into_iter()
            .map(|key| {
                let pod_count = get("pod_num", &key);
                PeakSample {
                    date: date_str.clone(),
                    env: env.to_string(),
                    namespace: key.0.clone(),
                    deployment: key.1.clone(),
                    pod_count: pod_count as i32,
                    p95_pod_load: get("cpu_use", &key),
                    p95_pod_load_pct: get("cpu_pct", &key),
                    p95_pod_wss_mb: get("mem_use", &key) / 1024.0 / 1024.0,
                    p95_pod_wss_pct: get("mem_pct", &key),
                    limit_cpu_m: (get("cpu_limit", &key) * 1000.0) as i64,
                    limit_mem_mb: (get("mem_limit", &key) / 1024.0 / 1024.0) as i64,
                    request_cpu_m: (get("cpu_request", &key) * 1000.0) as i64,
                    request_mem_mb: (get("mem_request", &key) / 1024.0 / 1024.0) as i64,
                }
            })
            .collect();

        if rows.is_empty() {
            return Ok(());
        }
        self.store.insert_peak_samples(&rows).await
    }

    /// Derive/refresh `ControlRecord`s for `env` from its best peak day.
    /// Never seen before: insert every candidate row with AI/manual pod
    /// counts both disengaged (`-1`). Already tracked: update the observed
    /// baseline in place, leaving AI/manual overrides untouched.
    async fn refresh_control_records(&self, env: &str) -> Result<()> {
        let Some(best_day) = self.store.best_peak_day(env, BEST_DAY_LOOKBACK_DAYS).await? else {
            return Ok(());
        };
        let samples = self.store.peak_samples_for_day(env, &best_day).await?;
        let existing = self.store.control_records_for_env(env).await?;
        let existing_by_key: HashMap<(String, String), ControlRecord> = existing
            .into_iter()
            .map(|cr| ((cr.namespace.clone(), cr.deployment.clone()), cr))
            .collect();

        let now = Utc::now().timestamp();
        for sample in samples {
            let key = (sample.namespace.clone(), sample.deployment.clone());
            // Governed requests are derived from observed peak usage, not
            // copied from the raw harvested request columns (those only
            // feed the PeakSample audit row).
            let request_cpu_m = (sample.p95_pod_load * 1000.0).round() as i64;
            let request_mem_mb = sample.p95_pod_wss_mb.round() as i64;

            let record = match existing_by_key.get(&key) {
                Some(prior) => ControlRecord {
                    pod_count: sample.pod_count,
                    request_cpu_m: normalize_request(request_cpu_m, Some(prior.request_cpu_m), 10),
                    request_mem_mb: normalize_request(request_mem_mb, Some(prior.request_mem_mb), 1),
                    limit_cpu_m: sample.limit_cpu_m,
                    limit_mem_mb: sample.limit_mem_mb,
                    updated_at: now,
                    ..prior.clone()
                },
                None => ControlRecord {
                    env: env.to_string(),
                    namespace: sample.namespace,
                    deployment: sample.deployment,
                    pod_count: sample.pod_count,
                    pod_count_ai: -1,
                    pod_count_manual: -1,
                    request_cpu_m: normalize_request(request_cpu_m, None, 10),
                    request_mem_mb: normalize_request(request_mem_mb, None, 1),
                    limit_cpu_m: sample.limit_cpu_m,
                    limit_mem_mb: sample.limit_mem_mb,
                    scheduler: false,
                    updated_at: now,
                },
            };
            self.store.upsert_control_record(&record).await?;
        }
        self.store.optimize_final("k8s_res_control").await
    }
}

/// Standalone helper used by both the harvest loop and the ad-hoc
/// `init_peak_data`/`cron_peak_data` API handlers to validate a requested
/// env is actually collecting before spending metrics-source calls on it.
pub fn require_collecting(env: &str, collect: bool) -> Result<()> {
    if !collect {
        return Err(KubeDoorError::Forbidden(format!("{env} is not enabled for collection")));
    }
    Ok(())
}
