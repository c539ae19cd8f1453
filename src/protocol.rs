use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::AdmisReply;

/// Frames exchanged over the agent's persistent bidirectional session, all
/// JSON objects discriminated on `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// A→C liveness tick, sent every 4 s.
    Heartbeat,

    /// C→A synchronous remote call; the agent must reply with a `Response`
    /// carrying the same `request_id`.
    Request {
        request_id: u64,
        method: String,
        path: String,
        query: Value,
        body: Value,
    },

    /// A→C completion of a `Request`.
    Response {
        request_id: u64,
        status: u16,
        body: Value,
    },

    /// A→C the agent's admission webhook asks the coordinator to resolve
    /// the governance record for (namespace, deployment).
    AdmisRequest {
        request_id: u64,
        namespace: String,
        deployment: String,
    },

    /// C→A the coordinator's answer to an `AdmisRequest`.
    AdmisResponse {
        request_id: u64,
        reply: AdmisReply,
    },

    /// C→A begin streaming logs for a browser-side connection.
    StartPodLogs {
        connection_id: String,
        namespace: String,
        pod_name: String,
        container: String,
    },

    /// C→A cancel a previously started log stream.
    StopPodLogs { connection_id: String },

    /// A→C log-stream control or data frame.
    PodLogs {
        connection_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        line: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A→C one observed Kubernetes event.
    K8sEvent { data: Value, timestamp: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_round_trips() {
        let frame = Frame::Heartbeat;
        let encoded = serde_json::to_string(&frame).unwrap();
        assert!(encoded.contains("\"type\":\"heartbeat\""));
        let decoded: Frame = serde_json::from_str(&encoded).unwrap();
        assert!(matches!(decoded, Frame::Heartbeat));
    }

    #[test]
    fn admis_request_round_trips() {
        let frame = Frame::AdmisRequest {
            request_id: 7,
            namespace: "prod".into(),
            deployment: "api".into(),
        };
        let encoded = serde_json::to_string(&frame).unwrap();
        let decoded: Frame = serde_json::from_str(&encoded).unwrap();
        match decoded {
            Frame::AdmisRequest { request_id, namespace, deployment } => {
                assert_eq!(request_id, 7);
                assert_eq!(namespace, "prod");
                assert_eq!(deployment, "api");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn admis_response_carries_govern_reply() {
        let frame = Frame::AdmisResponse {
            request_id: 1,
            reply: AdmisReply::Govern {
                pod_count: 3,
                pod_count_ai: -1,
                pod_count_manual: -1,
                req_cpu: 500,
                req_mem: 512,
                lim_cpu: 1000,
                lim_mem: 1024,
                scheduler: false,
            },
        };
        let encoded = serde_json::to_string(&frame).unwrap();
        assert!(encoded.contains("\"kind\":\"Govern\""));
    }
}
