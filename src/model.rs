use serde::{Deserialize, Serialize};

/// Sentinel node-label value marking a node as hosting replicas of a
/// force-balanced workload under `{namespace}.{deployment} = FIXED_VALUE`.
pub const FIXED_VALUE: &str = "true";

/// One row per workload per peak-window day, as harvested from the metrics
/// source. Keyed by (date, env, namespace, deployment).
#[derive(Debug, Clone, Serialize, Deserialize, clickhouse::Row)]
pub struct PeakSample {
    pub date: String,
    pub env: String,
    pub namespace: String,
    pub deployment: String,
    pub pod_count: i32,
    pub p95_pod_load: f64,
    pub p95_pod_load_pct: f64,
    pub p95_pod_wss_mb: f64,
    pub p95_pod_wss_pct: f64,
    pub limit_cpu_m: i64,
    pub limit_mem_mb: i64,
    pub request_cpu_m: i64,
    pub request_mem_mb: i64,
}

/// Governance source of truth for one workload: the row the admission
/// engine reads to compute a verdict.
#[derive(Debug, Clone, Serialize, Deserialize, clickhouse::Row)]
pub struct ControlRecord {
    pub env: String,
    pub namespace: String,
    pub deployment: String,
    pub pod_count: i32,
    pub pod_count_ai: i32,
    pub pod_count_manual: i32,
    pub request_cpu_m: i64,
    pub request_mem_mb: i64,
    pub limit_cpu_m: i64,
    pub limit_mem_mb: i64,
    pub scheduler: bool,
    pub updated_at: i64,
}

impl ControlRecord {
    /// Precedence: manual if set (>= 0), else ai if set (>= 0), else observed.
    pub fn effective_pod_count(&self) -> i32 {
        if self.pod_count_manual >= 0 {
            self.pod_count_manual
        } else if self.pod_count_ai >= 0 {
            self.pod_count_ai
        } else {
            self.pod_count
        }
    }
}

/// Normalize a harvested usage-derived request value before it lands in a
/// `ControlRecord`, per the invariant `request_cpu_m >= 10` /
/// `request_mem_mb >= 1`. `computed < 0` means the source metric was
/// missing — keep whatever the row already carried (or `floor` for a
/// never-seen workload) rather than writing a negative request. A
/// non-negative value under `floor` is raised to it.
pub fn normalize_request(computed: i64, existing: Option<i64>, floor: i64) -> i64 {
    if computed < 0 {
        existing.unwrap_or(floor)
    } else if computed < floor {
        floor
    } else {
        computed
    }
}

/// Per-cluster toggles, one row per env, mutated only through the operator
/// path and read by the admission fast-path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub env: String,
    pub collect: bool,
    pub peak_hours: String,
    pub admission: bool,
    pub admission_namespace: Vec<String>,
    pub nms_not_confirm: bool,
    pub scheduler: bool,
    pub last_heartbeat_at: Option<i64>,
    pub online: bool,
}

impl AgentStatus {
    pub fn new(env: impl Into<String>) -> Self {
        Self {
            env: env.into(),
            collect: false,
            peak_hours: "02:00:00-06:00:00".to_string(),
            admission: false,
            admission_namespace: Vec::new(),
            nms_not_confirm: false,
            scheduler: false,
            last_heartbeat_at: None,
            online: false,
        }
    }
}

/// A K8s event as observed by the agent watch, normalized for storage.
/// `eventUid` is the replacing-merge key; a newer `lastTimestamp` supersedes.
#[derive(Debug, Clone, Serialize, Deserialize, clickhouse::Row)]
pub struct EventRecord {
    #[serde(rename = "eventUid")]
    pub event_uid: String,
    #[serde(rename = "eventStatus")]
    pub event_status: String,
    pub level: String,
    pub count: i32,
    pub kind: String,
    pub k8s: String,
    pub namespace: String,
    pub name: String,
    pub reason: String,
    pub message: String,
    #[serde(rename = "firstTimestamp")]
    pub first_timestamp: String,
    #[serde(rename = "lastTimestamp")]
    pub last_timestamp: String,
    #[serde(rename = "reportingComponent")]
    pub reporting_component: String,
    #[serde(rename = "reportingInstance")]
    pub reporting_instance: String,
}

impl EventRecord {
    pub fn is_valid(&self) -> bool {
        if self.count < 0 {
            return false;
        }
        if !matches!(self.event_status.as_str(), "ADDED" | "MODIFIED" | "DELETED") {
            return false;
        }
        if !matches!(self.level.as_str(), "Normal" | "Warning") {
            return false;
        }
        self.last_timestamp >= self.first_timestamp
    }
}

/// Coordinator's answer to an agent's admission control-record query.
///
/// Replaces the ambiguous `[code, msg]` / 8-tuple overloaded JSON array with
/// a tagged variant, per the wire-shape design note.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum AdmisReply {
    /// Namespace is not in the cluster's admission_namespace allow-list, or
    /// the workload is unknown and `nms_not_confirm=true`.
    Passthrough { msg: String },
    /// Workload is unknown and strict mode is on, or a store error occurred.
    Denied { code: u16, msg: String },
    /// The governance row exists; admit with this enforced shape.
    Govern {
        pod_count: i32,
        pod_count_ai: i32,
        pod_count_manual: i32,
        req_cpu: i64,
        req_mem: i64,
        lim_cpu: i64,
        lim_mem: i64,
        scheduler: bool,
    },
}

impl From<&ControlRecord> for AdmisReply {
    fn from(cr: &ControlRecord) -> Self {
        AdmisReply::Govern {
            pod_count: cr.pod_count,
            pod_count_ai: cr.pod_count_ai,
            pod_count_manual: cr.pod_count_manual,
            req_cpu: cr.request_cpu_m,
            req_mem: cr.request_mem_mb,
            lim_cpu: cr.limit_cpu_m,
            lim_mem: cr.limit_mem_mb,
            scheduler: cr.scheduler,
        }
    }
}
