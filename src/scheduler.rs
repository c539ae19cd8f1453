//! C4: node-affinity scale and rebalance scheduler.
//!
//! Two operations, both driven off live `kube_pod_info`-derived CPU
//! ranking and the force-balance label `{namespace}.{deployment} =
//! FIXED_VALUE` on candidate nodes: a labeled scale (grow/shrink the set
//! of nodes pinned to a workload) and a node rebalance (move a workload's
//! pinned footprint from one node to another). Conflicting label writes
//! are retried a bounded number of times with a short pause and a
//! re-read, mirroring the patch-and-retry discipline used elsewhere for
//! workload patches.

use std::collections::HashSet;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::Client;
use regex::Regex;
use serde_json::json;

use crate::error::{KubeDoorError, Result};
use crate::metrics_source::MetricsSourceClient;
use crate::model::{ControlRecord, FIXED_VALUE};

const MAX_LABEL_RETRIES: u32 = 3;
const RETRY_PAUSE_MS: u64 = 1000;

fn label_key(namespace: &str, deployment: &str) -> String {
    format!("{namespace}.{deployment}")
}

fn pod_name_matches_deployment(pod_name: &str, deployment: &str) -> bool {
    let pattern = format!(r"^{}-[a-z0-9]+-[a-z0-9]+$", regex::escape(deployment));
    Regex::new(&pattern).map(|re| re.is_match(pod_name)).unwrap_or(false)
}

pub struct Scheduler {
    client: Client,
    metrics: std::sync::Arc<MetricsSourceClient>,
}

impl Scheduler {
    pub fn new(client: Client, metrics: std::sync::Arc<MetricsSourceClient>) -> Self {
        Self { client, metrics }
    }

    async fn labeled_nodes(&self, namespace: &str, deployment: &str) -> Result<HashSet<String>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let key = label_key(namespace, deployment);
        let list = nodes
            .list(&ListParams::default())
            .await
            .map_err(|e| KubeDoorError::Internal(e.to_string()))?;
        Ok(list
            .items
            .into_iter()
            .filter(|n| n.metadata.labels.as_ref().and_then(|l| l.get(&key)).map(|v| v == FIXED_VALUE).unwrap_or(false))
            .filter_map(|n| n.metadata.name)
            .collect())
    }

    async fn set_node_label(&self, node_name: &str, key: &str, value: Option<&str>) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let patch = match value {
            Some(v) => json!({ "metadata": { "labels": { key: v } } }),
            None => json!({ "metadata": { "labels": { key: serde_json::Value::Null } } }),
        };

        let mut attempt = 0;
        loop {
            let result = nodes
                .patch(node_name, &PatchParams::apply("kubedoor-scheduler"), &Patch::Merge(&patch))
                .await;
            match result {
                Ok(_) => return Ok(()),
                Err(e) if attempt < MAX_LABEL_RETRIES => {
                    attempt += 1;
                    tracing::warn!(node = node_name, attempt, error = %e, "node_label_patch_retry");
                    tokio::time::sleep(std::time::Duration::from_millis(RETRY_PAUSE_MS)).await;
                }
                Err(e) => return Err(KubeDoorError::Internal(e.to_string())),
            }
        }
    }

    async fn delete_workload_pods_on_node(&self, namespace: &str, deployment: &str, node_name: &str) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().fields(&format!("spec.nodeName={node_name}")))
            .await
            .map_err(|e| KubeDoorError::Internal(e.to_string()))?;
        for pod in list.items {
            let Some(name) = pod.metadata.name else { continue };
            if !pod_name_matches_deployment(&name, deployment) {
                continue;
            }
            pods.delete(&name, &DeleteParams::default())
                .await
                .map_err(|e| KubeDoorError::Internal(e.to_string()))?;
        }
        Ok(())
    }

    /// Grow or shrink the labeled node set for a workload to `target`
    /// nodes (inclusive of any `isolate_offset` already baked into
    /// `target` by the caller). `ranked` is the live per-node CPU ranking;
    /// when the coordinator already enriched the forwarded request with
    /// one (per §4.1's `add_label` pre-processing rule), pass it through
    /// instead of re-querying the metrics source here.
    pub async fn labeled_scale(&self, namespace: &str, deployment: &str, target: usize, ranked: Option<Vec<(String, f64)>>) -> Result<()> {
        let key = label_key(namespace, deployment);
        let existing = self.labeled_nodes(namespace, deployment).await?;
        let ranked = match ranked {
            Some(r) => r,
            None => self.metrics.node_cpu_rank().await?,
        };

        if target > existing.len() {
            let needed = target - existing.len();
            let candidates: Vec<&str> = ranked
                .iter()
                .map(|(node, _)| node.as_str())
                .filter(|n| !existing.contains(*n))
                .take(needed)
                .collect();
            for node in candidates {
                self.set_node_label(node, &key, Some(FIXED_VALUE)).await?;
            }
        } else if target < existing.len() {
            let to_remove = existing.len() - target;
            let mut ranked_desc = ranked;
            ranked_desc.reverse();
            let candidates: Vec<&str> = ranked_desc
                .iter()
                .map(|(node, _)| node.as_str())
                .filter(|n| existing.contains(*n))
                .take(to_remove)
                .collect();
            for node in candidates {
                self.set_node_label(node, &key, None).await?;
                self.delete_workload_pods_on_node(namespace, deployment, node).await?;
            }
        }
        Ok(())
    }

    /// Move a workload's pinned footprint from `source_node` to
    /// `target_node`: unlabel the source, label the target, delete the
    /// workload's pods still scheduled on the source so they reschedule
    /// onto the target via affinity.
    pub async fn rebalance_node(&self, namespace: &str, deployment: &str, source_node: &str, target_node: &str) -> Result<()> {
        let key = label_key(namespace, deployment);
        self.set_node_label(target_node, &key, Some(FIXED_VALUE)).await?;
        self.set_node_label(source_node, &key, None).await?;
        self.delete_workload_pods_on_node(namespace, deployment, source_node).await
    }

    /// Select rebalance candidates from `source_node`'s governed
    /// workloads, sorted descending by the requested resource, excluding
    /// anything already pinned on `target_node`.
    pub fn select_rebalance_candidates<'a>(
        records: &'a [ControlRecord],
        by_cpu: bool,
        target_node_labels: &HashSet<String>,
        top_n: usize,
    ) -> Vec<&'a ControlRecord> {
        let mut candidates: Vec<&ControlRecord> = records
            .iter()
            .filter(|r| !target_node_labels.contains(&label_key(&r.namespace, &r.deployment)))
            .collect();
        candidates.sort_by(|a, b| {
            let (av, bv) = if by_cpu {
                (a.request_cpu_m, b.request_cpu_m)
            } else {
                (a.request_mem_mb, b.request_mem_mb)
            };
            bv.cmp(&av)
        });
        candidates.truncate(top_n);
        candidates
    }
}
