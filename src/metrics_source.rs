//! Prometheus-compatible instant-query client used by the peak harvester and
//! by the live node-ranking lookups on the scale/rebalance path.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::config::MetricsSourceConfig;
use crate::error::{KubeDoorError, Result};

/// The nine predefined harvest queries. `pod_num` establishes the workload
/// key set (`env@namespace@replicaSetOwner`); the rest merge columns into
/// it, with a missing key defaulting to `-1` at the merge step.
pub const QUERY_NAMES: [&str; 9] = [
    "pod_num",
    "cpu_use",
    "cpu_pct",
    "mem_use",
    "mem_pct",
    "cpu_limit",
    "mem_limit",
    "cpu_request",
    "mem_request",
];

pub fn query_for(name: &str, namespace_exclude: &str, env_tag_key: &str, env: &str, duration: &str) -> String {
    let base_selector = format!(r#"{env_tag_key}="{env}", namespace!~"{namespace_exclude}""#);
    match name {
        "pod_num" => format!(r#"count(kube_pod_info{{{base_selector}}}) by (namespace, owner_name)"#),
        "cpu_use" => format!(
            r#"quantile_over_time(0.95, sum(rate(container_cpu_usage_seconds_total{{{base_selector}}}[{duration}])) by (namespace, owner_name)[{duration}:])"#
        ),
        "cpu_pct" => format!(
            r#"quantile_over_time(0.95, sum(rate(container_cpu_usage_seconds_total{{{base_selector}}}[{duration}])) by (namespace, owner_name)[{duration}:]) / sum(kube_pod_container_resource_limits{{resource="cpu",{base_selector}}}) by (namespace, owner_name)"#
        ),
        "mem_use" => format!(
            r#"quantile_over_time(0.95, sum(container_memory_working_set_bytes{{{base_selector}}}) by (namespace, owner_name)[{duration}:])"#
        ),
        "mem_pct" => format!(
            r#"quantile_over_time(0.95, sum(container_memory_working_set_bytes{{{base_selector}}}) by (namespace, owner_name)[{duration}:]) / sum(kube_pod_container_resource_limits{{resource="memory",{base_selector}}}) by (namespace, owner_name)"#
        ),
        "cpu_limit" => format!(r#"sum(kube_pod_container_resource_limits{{resource="cpu",{base_selector}}}) by (namespace, owner_name)"#),
        "mem_limit" => format!(r#"sum(kube_pod_container_resource_limits{{resource="memory",{base_selector}}}) by (namespace, owner_name)"#),
        "cpu_request" => format!(r#"sum(kube_pod_container_resource_requests{{resource="cpu",{base_selector}}}) by (namespace, owner_name)"#),
        "mem_request" => format!(r#"sum(kube_pod_container_resource_requests{{resource="memory",{base_selector}}}) by (namespace, owner_name)"#),
        other => panic!("unknown harvest query {other}"),
    }
}

#[derive(Debug, Deserialize)]
struct PromResponse {
    status: String,
    data: PromData,
}

#[derive(Debug, Deserialize)]
struct PromData {
    result: Vec<PromSeries>,
}

#[derive(Debug, Deserialize)]
struct PromSeries {
    metric: HashMap<String, String>,
    value: (f64, String),
}

pub struct MetricsSourceClient {
    http: reqwest::Client,
    config: MetricsSourceConfig,
}

impl MetricsSourceClient {
    pub fn new(config: MetricsSourceConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Low-level instant query returning each series' full label set
    /// alongside its value. A metrics-source failure logs and returns an
    /// empty vec so the caller can continue partially.
    async fn query_series(&self, promql: &str, at_unix_secs: i64) -> Result<Vec<(HashMap<String, String>, f64)>> {
        let url = format!("{}/api/v1/query", self.config.prom_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .query(&[("query", promql), ("time", &at_unix_secs.to_string())])
            .send()
            .await
            .map_err(|e| KubeDoorError::MetricsUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "metrics_source_query_failed");
            return Ok(Vec::new());
        }

        let parsed: PromResponse = response
            .json()
            .await
            .map_err(|e| KubeDoorError::MetricsUnavailable(e.to_string()))?;

        if parsed.status != "success" {
            return Ok(Vec::new());
        }

        Ok(parsed
            .data
            .result
            .into_iter()
            .map(|series| {
                let value = series.value.1.parse().unwrap_or(-1.0);
                (series.metric, value)
            })
            .collect())
    }

    /// Run a single instant query at `at_unix_secs`, keyed by `namespace` +
    /// an owner label. Missing columns default to `-1` downstream.
    pub async fn instant_query(&self, promql: &str, at_unix_secs: i64) -> Result<HashMap<(String, String), f64>> {
        let series = self.query_series(promql, at_unix_secs).await?;
        Ok(series
            .into_iter()
            .map(|(metric, value)| {
                let namespace = metric.get("namespace").cloned().unwrap_or_default();
                let owner = metric.get("owner_name").cloned().unwrap_or_default();
                ((namespace, owner), value)
            })
            .collect())
    }

    /// Live per-node CPU ranking, ascending by load, for scale/rebalance
    /// node selection.
    pub async fn node_cpu_rank(&self) -> Result<Vec<(String, f64)>> {
        let promql = r#"sum(rate(node_cpu_seconds_total{mode!="idle"}[5m])) by (node) / count(node_cpu_seconds_total{mode="idle"}) by (node)"#;
        let values = self.instant_query(promql, chrono::Utc::now().timestamp()).await?;
        let mut ranked: Vec<(String, f64)> = values
            .into_iter()
            .map(|((_, owner), v)| (owner, v))
            .collect();
        ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(ranked)
    }

    /// The (namespace, owner) set currently scheduled on `node`, used by
    /// the `/api/balance_node` top-K computation to find what a rebalance
    /// would actually move.
    pub async fn workloads_on_node(&self, node: &str, namespace_exclude: &str) -> Result<HashSet<(String, String)>> {
        let promql = format!(
            r#"count(kube_pod_info{{node="{node}", namespace!~"{namespace_exclude}"}} * on (namespace,pod) group_left (owner_name) kube_pod_owner{{owner_is_controller="true", owner_kind="ReplicaSet"}}) by (namespace, owner_name)"#
        );
        let series = self.query_series(&promql, chrono::Utc::now().timestamp()).await?;
        Ok(series
            .into_iter()
            .map(|(metric, _)| {
                let namespace = metric.get("namespace").cloned().unwrap_or_default();
                let owner = metric.get("owner_name").cloned().unwrap_or_default();
                (namespace, owner)
            })
            .collect())
    }
}

/// Compute the query-range duration string (e.g. "4h0m0s") and the
/// end-of-window unix timestamp from a `HH:MM:SS-HH:MM:SS` peak window on a
/// given calendar date.
pub fn calculate_peak_duration_and_end_time(
    date: chrono::NaiveDate,
    peak_hours: &str,
) -> Result<(String, chrono::NaiveDateTime)> {
    let (start_s, end_s) = peak_hours
        .split_once('-')
        .ok_or_else(|| KubeDoorError::BadRequest(format!("malformed peak_hours {peak_hours}")))?;
    let start = chrono::NaiveTime::parse_from_str(start_s, "%H:%M:%S")
        .map_err(|_| KubeDoorError::BadRequest(format!("malformed peak_hours start {start_s}")))?;
    let end = chrono::NaiveTime::parse_from_str(end_s, "%H:%M:%S")
        .map_err(|_| KubeDoorError::BadRequest(format!("malformed peak_hours end {end_s}")))?;

    let start_dt = date.and_time(start);
    let end_dt = date.and_time(end);
    let span = end_dt - start_dt;
    let total_secs = span.num_seconds().max(0);
    let h = total_secs / 3600;
    let m = (total_secs % 3600) / 60;
    let s = total_secs % 60;
    Ok((format!("{h}h{m}m{s}s"), end_dt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_spans_hours_minutes_seconds() {
        let date = chrono::NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
        let (duration, end) = calculate_peak_duration_and_end_time(date, "02:00:00-06:30:15").unwrap();
        assert_eq!(duration, "4h30m15s");
        assert_eq!(end.format("%H:%M:%S").to_string(), "06:30:15");
    }

    #[test]
    fn duration_rejects_malformed_window() {
        let date = chrono::NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
        assert!(calculate_peak_duration_and_end_time(date, "bogus").is_err());
    }

    #[test]
    fn query_for_pod_num_includes_namespace_exclusion() {
        let q = query_for("pod_num", "kube-.*", "k8s_cluster", "c1", "4h0m0s");
        assert!(q.contains("namespace!~\"kube-.*\""));
        assert!(q.contains("k8s_cluster=\"c1\""));
    }
}
