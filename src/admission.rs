//! Admission decision engine (C2): turns an incoming Deployment/Scale
//! AdmissionReview plus the coordinator's control-record answer into a JSON
//! patch enforcing governance values.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::model::{AdmisReply, FIXED_VALUE};

const TEMP_SCALE_WINDOW_MINUTES: i64 = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionObject {
    pub metadata: ObjectMetadata,
    pub spec: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectMetadata {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub annotations: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionRequest {
    pub uid: String,
    pub kind: String,
    pub operation: String,
    pub object: AdmissionObject,
    #[serde(default)]
    pub old_object: Option<AdmissionObject>,
}

/// Extra facts about the live Deployment that only the agent's cluster
/// client can supply: the pod template's `app` label and the rolling
/// update's configured `maxUnavailable`.
#[derive(Debug, Clone)]
pub struct DeploymentFacts {
    pub app_label: String,
    pub max_unavailable: MaxUnavailable,
    pub has_fixed_value_affinity: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum MaxUnavailable {
    Absolute(i64),
    Fraction(f64),
    Percent(f64),
}

impl MaxUnavailable {
    pub fn parse(raw: &str) -> Self {
        if let Some(pct) = raw.strip_suffix('%') {
            MaxUnavailable::Percent(pct.trim().parse().unwrap_or(0.0))
        } else if raw.contains('.') {
            MaxUnavailable::Fraction(raw.parse().unwrap_or(0.0))
        } else {
            MaxUnavailable::Absolute(raw.parse().unwrap_or(1))
        }
    }

    fn as_value_and_effective(&self, replicas: i64) -> (Value, i64) {
        match self {
            MaxUnavailable::Absolute(n) => (json!(n), *n),
            MaxUnavailable::Fraction(f) => (json!(f), (*f * replicas as f64) as i64),
            MaxUnavailable::Percent(p) => {
                let s = format!("{p}%");
                (json!(s), ((p / 100.0) * replicas as f64) as i64)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum AdmissionVerdict {
    Allow,
    AllowWithPatch { patch: Vec<Value> },
    Deny { code: u16, message: String },
}

impl AdmissionVerdict {
    /// Build the AdmissionReview v1 response body.
    pub fn into_response(self, uid: String) -> Value {
        match self {
            AdmissionVerdict::Allow => json!({
                "apiVersion": "admission.k8s.io/v1",
                "kind": "AdmissionReview",
                "response": { "uid": uid, "allowed": true },
            }),
            AdmissionVerdict::AllowWithPatch { patch } => {
                let encoded = BASE64.encode(serde_json::to_vec(&patch).unwrap_or_default());
                json!({
                    "apiVersion": "admission.k8s.io/v1",
                    "kind": "AdmissionReview",
                    "response": {
                        "uid": uid,
                        "allowed": true,
                        "patchType": "JSONPatch",
                        "patch": encoded,
                    },
                })
            }
            AdmissionVerdict::Deny { code, message } => json!({
                "apiVersion": "admission.k8s.io/v1",
                "kind": "AdmissionReview",
                "response": {
                    "uid": uid,
                    "allowed": false,
                    "status": { "code": code, "message": message },
                },
            }),
        }
    }
}

/// Returns `true` when the `scale.temp` annotation is fresh (within the
/// temporary-scale window) and the operation shape matches a bare scale.
///
/// The annotation encodes `"YYYY-MM-DD HH:MM:SS@OLD-->NEW"`; only the
/// timestamp before `@` matters for freshness.
pub fn temp_scale_bypass(
    annotations: &std::collections::HashMap<String, String>,
    kind: &str,
    operation: &str,
    template_unchanged: bool,
    replicas_changed: bool,
) -> bool {
    let Some(raw) = annotations.get("scale.temp") else {
        return false;
    };
    let Some(time_part) = raw.split('@').next() else {
        return false;
    };
    let Ok(stamp) = NaiveDateTime::parse_from_str(time_part, "%Y-%m-%d %H:%M:%S") else {
        return false;
    };
    let now = Utc::now().naive_utc();
    if now - stamp > ChronoDuration::minutes(TEMP_SCALE_WINDOW_MINUTES) {
        return false;
    }
    (kind == "Scale" && operation == "UPDATE")
        || (kind == "Deployment" && operation == "UPDATE" && template_unchanged && replicas_changed)
}

/// Compose the affinity object for force-balance scheduling: required
/// nodeAffinity keyed `{namespace}.{deployment} = FIXED_VALUE`, plus
/// podAntiAffinity on the workload's `app` label across
/// `kubernetes.io/hostname`.
pub fn build_affinity(namespace: &str, deployment: &str, app_label: &str) -> Value {
    json!({
        "nodeAffinity": {
            "requiredDuringSchedulingIgnoredDuringExecution": {
                "nodeSelectorTerms": [{
                    "matchExpressions": [{
                        "key": format!("{namespace}.{deployment}"),
                        "operator": "In",
                        "values": [FIXED_VALUE],
                    }]
                }]
            }
        },
        "podAntiAffinity": {
            "requiredDuringSchedulingIgnoredDuringExecution": [{
                "labelSelector": {
                    "matchExpressions": [{
                        "key": "app",
                        "operator": "In",
                        "values": [app_label],
                    }]
                },
                "topologyKey": "kubernetes.io/hostname",
            }]
        },
    })
}

/// Clamp `maxUnavailable` so that `replicas * maxUnavailable >= 1`; if the
/// configured value would round to zero disruption budget, force `1`.
pub fn clamp_max_unavailable(existing: MaxUnavailable, replicas: i64) -> Value {
    let (value, effective) = existing.as_value_and_effective(replicas);
    if effective < 1 {
        json!(1)
    } else {
        value
    }
}

/// Build the full JSON-patch list for a CREATE or template-changing UPDATE,
/// in the fixed order the design requires: affinity, maxUnavailable,
/// replicas, container resources.
pub fn build_full_patch(
    namespace: &str,
    deployment: &str,
    reply_govern: &AdmisReply,
    facts: Option<&DeploymentFacts>,
) -> Vec<Value> {
    let AdmisReply::Govern {
        pod_count,
        pod_count_ai,
        pod_count_manual,
        req_cpu,
        req_mem,
        lim_cpu,
        lim_mem,
        scheduler,
    } = reply_govern
    else {
        return Vec::new();
    };

    let effective_pod_count = if *pod_count_manual >= 0 {
        *pod_count_manual
    } else if *pod_count_ai >= 0 {
        *pod_count_ai
    } else {
        *pod_count
    };

    let mut patch = Vec::new();

    if *scheduler {
        if let Some(facts) = facts {
            patch.push(json!({
                "op": "replace",
                "path": "/spec/template/spec/affinity",
                "value": build_affinity(namespace, deployment, &facts.app_label),
            }));
            let max_unavail = clamp_max_unavailable(facts.max_unavailable, effective_pod_count as i64);
            patch.push(json!({
                "op": "replace",
                "path": "/spec/strategy/rollingUpdate/maxUnavailable",
                "value": max_unavail,
            }));
        }
    } else if let Some(facts) = facts {
        if facts.has_fixed_value_affinity {
            patch.push(json!({
                "op": "replace",
                "path": "/spec/template/spec/affinity",
                "value": {},
            }));
        }
    }

    patch.push(json!({
        "op": "replace",
        "path": "/spec/replicas",
        "value": effective_pod_count,
    }));

    let mut resources = json!({ "requests": {}, "limits": {} });
    if *req_cpu > 0 {
        resources["requests"]["cpu"] = json!(format!("{req_cpu}m"));
    }
    if *req_mem > 0 {
        resources["requests"]["memory"] = json!(format!("{req_mem}Mi"));
    }
    if *lim_cpu > 0 {
        resources["limits"]["cpu"] = json!(format!("{lim_cpu}m"));
    }
    if *lim_mem > 0 {
        resources["limits"]["memory"] = json!(format!("{lim_mem}Mi"));
    }
    patch.push(json!({
        "op": "add",
        "path": "/spec/template/spec/containers/0/resources",
        "value": resources,
    }));

    patch
}

/// The decision table from the component design: what kind of patch (if
/// any) a request warrants, given whether the pod template changed and
/// whether replicas changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchShape {
    ReplicasOnly,
    Full,
    AdmitNoPatch,
}

pub fn patch_shape(kind: &str, operation: &str, template_changed: bool, replicas_changed: bool) -> PatchShape {
    match (kind, operation, template_changed, replicas_changed) {
        ("Scale", "UPDATE", _, _) => PatchShape::ReplicasOnly,
        ("Deployment", "CREATE", _, _) => PatchShape::Full,
        ("Deployment", "UPDATE", true, _) => PatchShape::Full,
        ("Deployment", "UPDATE", false, true) => PatchShape::ReplicasOnly,
        ("Deployment", "UPDATE", false, false) => PatchShape::AdmitNoPatch,
        _ => PatchShape::AdmitNoPatch,
    }
}

/// Core decision function: pure, synchronous, and independent of any I/O.
/// The caller (the agent's HTTP handler) is responsible for the coordinator
/// round-trip that produces `reply` and for supplying `facts` when a full
/// patch might be needed.
pub fn decide(
    req: &AdmissionRequest,
    reply: &AdmisReply,
    template_changed: bool,
    replicas_changed: bool,
    facts: Option<&DeploymentFacts>,
) -> AdmissionVerdict {
    if temp_scale_bypass(
        &req.object.metadata.annotations,
        &req.kind,
        &req.operation,
        !template_changed,
        replicas_changed,
    ) {
        return AdmissionVerdict::Allow;
    }

    match reply {
        AdmisReply::Passthrough { .. } => AdmissionVerdict::Allow,
        AdmisReply::Denied { code, msg } => AdmissionVerdict::Deny {
            code: *code,
            message: msg.clone(),
        },
        AdmisReply::Govern { pod_count, pod_count_ai, pod_count_manual, .. } => {
            let effective = if *pod_count_manual >= 0 {
                *pod_count_manual
            } else if *pod_count_ai >= 0 {
                *pod_count_ai
            } else {
                *pod_count
            };
            match patch_shape(&req.kind, &req.operation, template_changed, replicas_changed) {
                PatchShape::AdmitNoPatch => AdmissionVerdict::Allow,
                PatchShape::ReplicasOnly => AdmissionVerdict::AllowWithPatch {
                    patch: vec![json!({
                        "op": "replace",
                        "path": "/spec/replicas",
                        "value": effective,
                    })],
                },
                PatchShape::Full => AdmissionVerdict::AllowWithPatch {
                    patch: build_full_patch(
                        &req.object.metadata.namespace,
                        &req.object.metadata.name,
                        reply,
                        facts,
                    ),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn govern(pod_count: i32) -> AdmisReply {
        AdmisReply::Govern {
            pod_count,
            pod_count_ai: -1,
            pod_count_manual: -1,
            req_cpu: 500,
            req_mem: 512,
            lim_cpu: 1000,
            lim_mem: 1024,
            scheduler: false,
        }
    }

    fn req(kind: &str, operation: &str, annotations: HashMap<String, String>) -> AdmissionRequest {
        AdmissionRequest {
            uid: "u1".into(),
            kind: kind.into(),
            operation: operation.into(),
            object: AdmissionObject {
                metadata: ObjectMetadata {
                    namespace: "prod".into(),
                    name: "api".into(),
                    annotations,
                },
                spec: json!({}),
            },
            old_object: None,
        }
    }

    // Scenario 1: Scale subresource admit.
    #[test]
    fn scale_subresource_patches_replicas_to_control_record() {
        let request = req("Scale", "UPDATE", HashMap::new());
        let reply = govern(5);
        let verdict = decide(&request, &reply, false, true, None);
        match verdict {
            AdmissionVerdict::AllowWithPatch { patch } => {
                assert_eq!(patch, vec![json!({"op":"replace","path":"/spec/replicas","value":5})]);
            }
            other => panic!("expected patch, got {other:?}"),
        }
    }

    // Scenario 2: temporary bypass.
    #[test]
    fn fresh_scale_temp_bypasses_enforcement() {
        let mut annotations = HashMap::new();
        annotations.insert(
            "scale.temp".to_string(),
            format!("{}@5-->2", Utc::now().naive_utc().format("%Y-%m-%d %H:%M:%S")),
        );
        let request = req("Scale", "UPDATE", annotations);
        let reply = govern(5);
        let verdict = decide(&request, &reply, false, true, None);
        assert_eq!(verdict, AdmissionVerdict::Allow);
    }

    #[test]
    fn stale_scale_temp_does_not_bypass() {
        let mut annotations = HashMap::new();
        let stale = Utc::now().naive_utc() - ChronoDuration::minutes(10);
        annotations.insert(
            "scale.temp".to_string(),
            format!("{}@5-->2", stale.format("%Y-%m-%d %H:%M:%S")),
        );
        let request = req("Scale", "UPDATE", annotations);
        let reply = govern(5);
        let verdict = decide(&request, &reply, false, true, None);
        assert_ne!(verdict, AdmissionVerdict::Allow);
    }

    // Scenario 3: non-governed namespace.
    #[test]
    fn passthrough_admits_without_patch() {
        let request = req("Deployment", "UPDATE", HashMap::new());
        let reply = AdmisReply::Passthrough { msg: "non-governed".into() };
        let verdict = decide(&request, &reply, false, false, None);
        assert_eq!(verdict, AdmissionVerdict::Allow);
    }

    // Scenario 4: unknown workload, strict mode.
    #[test]
    fn denied_reply_surfaces_as_deny_verdict() {
        let request = req("Deployment", "CREATE", HashMap::new());
        let reply = AdmisReply::Denied {
            code: 404,
            msg: "unknown workload prod/api".into(),
        };
        let verdict = decide(&request, &reply, true, false, None);
        match verdict {
            AdmissionVerdict::Deny { code, .. } => assert_eq!(code, 404),
            other => panic!("expected deny, got {other:?}"),
        }
    }

    #[test]
    fn deployment_update_no_template_no_replicas_admits_without_patch() {
        let request = req("Deployment", "UPDATE", HashMap::new());
        let reply = govern(3);
        let verdict = decide(&request, &reply, false, false, None);
        assert_eq!(verdict, AdmissionVerdict::Allow);
    }

    #[test]
    fn create_builds_full_patch_with_affinity_when_scheduler_on() {
        let request = req("Deployment", "CREATE", HashMap::new());
        let reply = AdmisReply::Govern {
            pod_count: 3,
            pod_count_ai: -1,
            pod_count_manual: -1,
            req_cpu: 500,
            req_mem: 512,
            lim_cpu: 1000,
            lim_mem: 1024,
            scheduler: true,
        };
        let facts = DeploymentFacts {
            app_label: "api".into(),
            max_unavailable: MaxUnavailable::Percent(20.0),
            has_fixed_value_affinity: false,
        };
        let verdict = decide(&request, &reply, true, false, Some(&facts));
        match verdict {
            AdmissionVerdict::AllowWithPatch { patch } => {
                assert_eq!(patch[0]["path"], "/spec/template/spec/affinity");
                assert_eq!(
                    patch[0]["value"]["nodeAffinity"]["requiredDuringSchedulingIgnoredDuringExecution"]
                        ["nodeSelectorTerms"][0]["matchExpressions"][0]["key"],
                    "prod.api"
                );
                assert_eq!(patch[1]["path"], "/spec/strategy/rollingUpdate/maxUnavailable");
                let last = patch.last().unwrap();
                assert_eq!(last["path"], "/spec/template/spec/containers/0/resources");
                assert_eq!(last["value"]["requests"]["cpu"], "500m");
            }
            other => panic!("expected patch, got {other:?}"),
        }
    }

    #[test]
    fn clamp_forces_one_when_fraction_rounds_to_zero() {
        let clamped = clamp_max_unavailable(MaxUnavailable::Percent(5.0), 3);
        assert_eq!(clamped, json!(1));
    }

    #[test]
    fn clamp_preserves_value_when_sufficient() {
        let clamped = clamp_max_unavailable(MaxUnavailable::Absolute(2), 10);
        assert_eq!(clamped, json!(2));
    }

    #[test]
    fn scheduler_off_clears_existing_fixed_value_affinity() {
        let reply = govern(3);
        let facts = DeploymentFacts {
            app_label: "api".into(),
            max_unavailable: MaxUnavailable::Absolute(1),
            has_fixed_value_affinity: true,
        };
        let patch = build_full_patch("prod", "api", &reply, Some(&facts));
        assert_eq!(patch[0]["path"], "/spec/template/spec/affinity");
        assert_eq!(patch[0]["value"], json!({}));
    }

    #[test]
    fn resources_leave_existing_when_value_not_positive() {
        let reply = AdmisReply::Govern {
            pod_count: 3,
            pod_count_ai: -1,
            pod_count_manual: -1,
            req_cpu: -1,
            req_mem: 512,
            lim_cpu: -1,
            lim_mem: 1024,
            scheduler: false,
        };
        let patch = build_full_patch("prod", "api", &reply, None);
        let resources = patch.last().unwrap();
        assert!(resources["value"]["requests"].get("cpu").is_none());
        assert_eq!(resources["value"]["requests"]["memory"], "512Mi");
    }

    #[test]
    fn max_unavailable_parses_percent_fraction_and_absolute() {
        assert!(matches!(MaxUnavailable::parse("20%"), MaxUnavailable::Percent(p) if p == 20.0));
        assert!(matches!(MaxUnavailable::parse("0.25"), MaxUnavailable::Fraction(f) if f == 0.25));
        assert!(matches!(MaxUnavailable::parse("2"), MaxUnavailable::Absolute(2)));
    }

    #[test]
    fn into_response_encodes_patch_as_base64() {
        let verdict = AdmissionVerdict::AllowWithPatch {
            patch: vec![json!({"op":"replace","path":"/spec/replicas","value":5})],
        };
        let response = verdict.into_response("abc".into());
        let patch_b64 = response["response"]["patch"].as_str().unwrap();
        let decoded = BASE64.decode(patch_b64).unwrap();
        let value: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value[0]["value"], 5);
    }
}
