use serde_json::{json, Value};

/// Build a minimal Scale-subresource AdmissionRequest body for integration
/// tests against the decision engine's JSON-shaped public surface.
pub fn make_scale_request(namespace: &str, name: &str, replicas: i64) -> Value {
    json!({
        "uid": "test-uid",
        "kind": "Scale",
        "operation": "UPDATE",
        "object": {
            "metadata": { "namespace": namespace, "name": name, "annotations": {} },
            "spec": { "replicas": replicas },
        },
    })
}

pub fn make_deployment_request(namespace: &str, name: &str, replicas: i64, template_tag: &str) -> Value {
    json!({
        "uid": "test-uid",
        "kind": "Deployment",
        "operation": "CREATE",
        "object": {
            "metadata": { "namespace": namespace, "name": name, "annotations": {} },
            "spec": { "replicas": replicas, "template": { "image": template_tag } },
        },
    })
}
