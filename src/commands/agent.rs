//! Agent process: the per-cluster admission webhook plus the outbound
//! session to the coordinator. Retargets the donor webhook server's
//! TLS/cert-gen/graceful-shutdown scaffolding onto KubeDoor's admission
//! decision engine and adds the agent's half of the control-plane link.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Event as K8sEvent;
use kube::api::{Patch, PatchParams, WatchEvent};
use kube::{Api, Client};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{info, warn};

use kubedoor::admission::{
    self, AdmissionObject, AdmissionRequest, AdmissionVerdict, DeploymentFacts, MaxUnavailable,
};
use kubedoor::config::AgentConfig;
use kubedoor::metrics_source::MetricsSourceClient;
use kubedoor::model::{AdmisReply, FIXED_VALUE};
use kubedoor::protocol::Frame;
use kubedoor::scheduler::Scheduler;

const ADMIS_DEADLINE_SECS: u64 = 10;
const RECONNECT_BACKOFF_SECS: u64 = 5;
const HEARTBEAT_INTERVAL_SECS: u64 = 4;

/// The agent's outbound link to the coordinator: an auto-reconnecting
/// tungstenite client with an admis-request/response correlation table,
/// mirroring the coordinator's own `AgentSession` request/response shape.
#[derive(Clone)]
pub struct AgentLink {
    env: String,
    outbound: Arc<RwLock<Option<mpsc::UnboundedSender<WsMessage>>>>,
    pending: Arc<RwLock<HashMap<u64, oneshot::Sender<AdmisReply>>>>,
}

#[derive(Debug, serde::Deserialize)]
struct ScaleBody {
    namespace: String,
    deployment: String,
    num: i64,
    #[serde(default)]
    add_label: bool,
    #[serde(default)]
    temp: bool,
    #[serde(default)]
    isolate: bool,
    #[serde(default)]
    node_rank: Vec<(String, f64)>,
}

#[derive(Debug, serde::Deserialize)]
struct BalanceNodeBody {
    source: String,
    target: String,
    #[serde(default)]
    candidates: Vec<BalanceCandidate>,
}

#[derive(Debug, serde::Deserialize)]
struct BalanceCandidate {
    namespace: String,
    deployment: String,
}

#[derive(Debug, serde::Deserialize)]
struct RestartBody {
    namespace: String,
    deployment: String,
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

impl AgentLink {
    pub fn new(env: String) -> Self {
        Self {
            env,
            outbound: Arc::new(RwLock::new(None)),
            pending: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Round-trip an AdmisRequest to the coordinator. If the link is down
    /// or the coordinator deadline passes, synthesize a deny so the
    /// admission handler has a well-typed fallback instead of hanging.
    pub async fn admis_request(&self, namespace: &str, deployment: &str) -> AdmisReply {
        let Some(sender) = self.outbound.read().await.clone() else {
            return AdmisReply::Denied {
                code: 503,
                msg: "no link to coordinator".into(),
            };
        };

        let request_id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(request_id, tx);

        let frame = Frame::AdmisRequest {
            request_id,
            namespace: namespace.to_string(),
            deployment: deployment.to_string(),
        };
        let Ok(text) = serde_json::to_string(&frame) else {
            self.pending.write().await.remove(&request_id);
            return AdmisReply::Denied {
                code: 500,
                msg: "failed to encode admis request".into(),
            };
        };
        if sender.send(WsMessage::Text(text.into())).is_err() {
            self.pending.write().await.remove(&request_id);
            return AdmisReply::Denied {
                code: 503,
                msg: "coordinator link closed".into(),
            };
        }

        match tokio::time::timeout(Duration::from_secs(ADMIS_DEADLINE_SECS), rx).await {
            Ok(Ok(reply)) => reply,
            _ => {
                self.pending.write().await.remove(&request_id);
                AdmisReply::Denied {
                    code: 504,
                    msg: "coordinator did not answer in time".into(),
                }
            }
        }
    }

    async fn set_outbound(&self, sender: Option<mpsc::UnboundedSender<WsMessage>>) {
        *self.outbound.write().await = sender;
    }

    async fn complete(&self, request_id: u64, reply: AdmisReply) {
        if let Some(tx) = self.pending.write().await.remove(&request_id) {
            let _ = tx.send(reply);
        }
    }

    /// Connect, reconnecting with a fixed backoff on any disconnect, until
    /// the process shuts down.
    pub async fn run(self, coordinator_ws_url: String, state: AgentState) {
        loop {
            if let Err(e) = self.connect_once(&coordinator_ws_url, &state).await {
                warn!(error = %e, "coordinator_link_disconnected");
            }
            self.set_outbound(None).await;
            tokio::time::sleep(Duration::from_secs(RECONNECT_BACKOFF_SECS)).await;
        }
    }

    /// Send a frame with no reply expected, e.g. a watched `k8s_event`.
    pub async fn send_frame(&self, frame: &Frame) {
        let Some(sender) = self.outbound.read().await.clone() else {
            return;
        };
        if let Ok(text) = serde_json::to_string(frame) {
            let _ = sender.send(WsMessage::Text(text.into()));
        }
    }

    async fn connect_once(&self, url: &str, state: &AgentState) -> anyhow::Result<()> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        info!(url = %url, "coordinator_link_connected");
        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        self.set_outbound(Some(tx.clone())).await;

        let heartbeat_tx = tx.clone();
        let heartbeat_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(HEARTBEAT_INTERVAL_SECS)).await;
                let frame = serde_json::to_string(&Frame::Heartbeat).unwrap_or_default();
                if heartbeat_tx.send(WsMessage::Text(frame.into())).is_err() {
                    break;
                }
            }
        });

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        while let Some(msg) = read.next().await {
            let msg = msg?;
            if let WsMessage::Text(text) = msg {
                if let Ok(frame) = serde_json::from_str::<Frame>(&text) {
                    match frame {
                        Frame::AdmisResponse { request_id, reply } => {
                            self.complete(request_id, reply).await;
                        }
                        Frame::Request { request_id, method, path, query, body } => {
                            let state = state.clone();
                            let reply_tx = tx.clone();
                            tokio::spawn(async move {
                                let (status, resp_body) = dispatch_request(&state, &method, &path, query, body).await;
                                let response = Frame::Response { request_id, status, body: resp_body };
                                if let Ok(text) = serde_json::to_string(&response) {
                                    let _ = reply_tx.send(WsMessage::Text(text.into()));
                                }
                            });
                        }
                        _ => {}
                    }
                }
            }
        }

        heartbeat_task.abort();
        writer_task.abort();
        Ok(())
    }
}

#[derive(Clone)]
pub struct AgentState {
    client: Client,
    link: AgentLink,
    scheduler: Arc<Scheduler>,
}

const EVENT_WATCH_RETRY_SECS: u64 = 5;

pub async fn serve(config: AgentConfig) -> Result<()> {
    let client = Client::try_default().await.context("failed to connect to Kubernetes cluster")?;
    let metrics = Arc::new(MetricsSourceClient::new(config.metrics_source.clone()));
    let scheduler = Arc::new(Scheduler::new(client.clone(), metrics.clone()));

    let link = AgentLink::new(config.env.clone());
    let link_runner = link.clone();
    let ws_url = config.coordinator_ws_url.clone();

    let state = AgentState {
        client: client.clone(),
        link: link.clone(),
        scheduler,
    };

    let link_state = state.clone();
    tokio::spawn(async move { link_runner.run(ws_url, link_state).await });

    let watch_client = client.clone();
    let watch_link = link.clone();
    tokio::spawn(async move { run_event_watch(watch_client, watch_link).await });

    let app = Router::new()
        .route("/api/admis", post(admis_handler))
        .route("/api/health", get(|| async { (StatusCode::OK, "OK") }))
        .with_state(state);

    let addr: SocketAddr = config.bind_addr.parse().context("invalid bind address")?;
    let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(&config.tls_cert, &config.tls_key)
        .await
        .context("failed to load TLS configuration")?;

    info!(addr = %addr, "agent_webhook_started");
    axum_server::bind_rustls(addr, rustls_config)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

/// Watch the cluster's Event stream and forward each one to the
/// coordinator as a `K8sEvent` frame, reconnecting the watch on any
/// stream error. Uses `Api::watch` directly (not `kube-runtime`'s
/// `watcher()`) to avoid carrying that crate for a single watch loop.
async fn run_event_watch(client: Client, link: AgentLink) {
    let events: Api<K8sEvent> = Api::all(client);
    loop {
        if let Err(e) = watch_events_once(&events, &link).await {
            warn!(error = %e, "k8s_event_watch_failed");
        }
        tokio::time::sleep(Duration::from_secs(EVENT_WATCH_RETRY_SECS)).await;
    }
}

async fn watch_events_once(events: &Api<K8sEvent>, link: &AgentLink) -> anyhow::Result<()> {
    let mut stream = events.watch(&Default::default(), "0").await?.boxed();
    while let Some(event) = stream.try_next().await? {
        let (status, ev) = match event {
            WatchEvent::Added(ev) => ("ADDED", ev),
            WatchEvent::Modified(ev) => ("MODIFIED", ev),
            WatchEvent::Deleted(ev) => ("DELETED", ev),
            WatchEvent::Error(e) => return Err(anyhow::anyhow!("k8s event watch error: {e:?}")),
            WatchEvent::Bookmark(_) => continue,
        };
        if let Some(record) = event_to_record(&ev, &link.env, status) {
            let timestamp = chrono::Utc::now().to_rfc3339();
            link.send_frame(&Frame::K8sEvent { data: record, timestamp }).await;
        }
    }
    Ok(())
}

/// Translate a watched `Event` into the JSON shape `EventRecord` expects.
fn event_to_record(ev: &K8sEvent, k8s: &str, event_status: &str) -> Option<Value> {
    let involved = &ev.involved_object;
    let first_ts = ev.first_timestamp.as_ref().map(|t| t.0.to_rfc3339());
    let last_ts = ev
        .last_timestamp
        .as_ref()
        .map(|t| t.0.to_rfc3339())
        .or_else(|| ev.event_time.as_ref().map(|t| t.0.to_rfc3339()));
    let last_ts = last_ts.clone().unwrap_or_else(|| chrono::Utc::now().to_rfc3339());
    let first_ts = first_ts.unwrap_or_else(|| last_ts.clone());
    let level = ev.type_.clone().unwrap_or_else(|| "Normal".to_string());
    if !matches!(level.as_str(), "Normal" | "Warning") {
        return None;
    }
    Some(json!({
        "eventUid": ev.metadata.uid.clone().unwrap_or_default(),
        "eventStatus": event_status,
        "level": level,
        "count": ev.count.unwrap_or(1),
        "kind": involved.kind.clone().unwrap_or_default(),
        "k8s": k8s,
        "namespace": involved.namespace.clone().unwrap_or_default(),
        "name": involved.name.clone().unwrap_or_default(),
        "reason": ev.reason.clone().unwrap_or_default(),
        "message": ev.message.clone().unwrap_or_default(),
        "firstTimestamp": first_ts,
        "lastTimestamp": last_ts,
        "reportingComponent": ev.reporting_component.clone().unwrap_or_default(),
        "reportingInstance": ev.reporting_instance.clone().unwrap_or_default(),
    }))
}

/// Dispatch one coordinator-forwarded `Request` frame to its local handler.
/// Unknown paths return 501 rather than hanging the caller out to the
/// 120 s deadline.
async fn dispatch_request(state: &AgentState, method: &str, path: &str, _query: Value, body: Value) -> (u16, Value) {
    match (method, path) {
        ("POST", "/api/scale") | ("POST", "/api/pod/modify_pod") => handle_scale(state, body).await,
        ("POST", "/api/restart") => handle_restart(state, body).await,
        ("POST", "/api/balance_node") => handle_balance_node(state, body).await,
        ("POST", "/api/cron") | ("POST", "/api/admis_switch") => (200, json!({ "status": "ok" })),
        _ => (501, json!({ "error": format!("unhandled agent route {method} {path}") })),
    }
}

async fn handle_scale(state: &AgentState, body: Value) -> (u16, Value) {
    let req: ScaleBody = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => return (400, json!({ "error": format!("malformed scale request: {e}") })),
    };
    let deployments: Api<Deployment> = Api::namespaced(state.client.clone(), &req.namespace);
    let patch = json!({ "spec": { "replicas": req.num } });
    if let Err(e) = deployments
        .patch(&req.deployment, &PatchParams::apply("kubedoor-scale"), &Patch::Merge(&patch))
        .await
    {
        return (502, json!({ "error": format!("replica patch failed: {e}") }));
    }

    if req.add_label && !req.temp {
        let target = (req.num.max(0) as usize) + usize::from(req.isolate);
        let ranked = (!req.node_rank.is_empty()).then(|| req.node_rank.clone());
        if let Err(e) = state.scheduler.labeled_scale(&req.namespace, &req.deployment, target, ranked).await {
            return (502, json!({ "error": format!("labeled scale failed: {e}") }));
        }
    }
    (200, json!({ "status": "ok" }))
}

async fn handle_restart(state: &AgentState, body: Value) -> (u16, Value) {
    let req: RestartBody = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => return (400, json!({ "error": format!("malformed restart request: {e}") })),
    };
    let deployments: Api<Deployment> = Api::namespaced(state.client.clone(), &req.namespace);
    let patch = json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": {
                        "kubectl.kubernetes.io/restartedAt": chrono::Utc::now().to_rfc3339()
                    }
                }
            }
        }
    });
    match deployments
        .patch(&req.deployment, &PatchParams::apply("kubedoor-restart"), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => (200, json!({ "status": "ok" })),
        Err(e) => (502, json!({ "error": format!("restart patch failed: {e}") })),
    }
}

async fn handle_balance_node(state: &AgentState, body: Value) -> (u16, Value) {
    let req: BalanceNodeBody = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => return (400, json!({ "error": format!("malformed balance_node request: {e}") })),
    };
    for candidate in &req.candidates {
        if let Err(e) = state
            .scheduler
            .rebalance_node(&candidate.namespace, &candidate.deployment, &req.source, &req.target)
            .await
        {
            return (502, json!({ "error": format!("rebalance failed for {}/{}: {e}", candidate.namespace, candidate.deployment) }));
        }
    }
    (200, json!({ "status": "ok", "moved": req.candidates.len() }))
}

/// Read the live Deployment's pod-template `app` label, rolling update
/// `maxUnavailable`, and whether a force-balance nodeAffinity is already
/// present — the facts the admission decision needs that only a live
/// cluster read can supply.
async fn read_deployment_facts(client: &Client, namespace: &str, name: &str) -> Option<DeploymentFacts> {
    let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let deployment = api.get(name).await.ok()?;
    let spec = deployment.spec?;
    let template_spec = spec.template.spec?;

    let app_label = spec
        .template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.as_ref())
        .and_then(|l| l.get("app"))
        .cloned()
        .unwrap_or_default();

    let max_unavailable = spec
        .strategy
        .and_then(|s| s.rolling_update)
        .and_then(|r| r.max_unavailable)
        .map(|mu| match mu {
            k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(n) => MaxUnavailable::Absolute(n as i64),
            k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::String(s) => MaxUnavailable::parse(&s),
        })
        .unwrap_or(MaxUnavailable::Absolute(1));

    let has_fixed_value_affinity = template_spec
        .affinity
        .and_then(|a| a.node_affinity)
        .and_then(|na| na.required_during_scheduling_ignored_during_execution)
        .map(|req| {
            req.node_selector_terms.iter().any(|term| {
                term.match_expressions
                    .iter()
                    .flatten()
                    .any(|expr| expr.values.as_ref().is_some_and(|v| v.iter().any(|x| x == FIXED_VALUE)))
            })
        })
        .unwrap_or(false);

    Some(DeploymentFacts {
        app_label,
        max_unavailable,
        has_fixed_value_affinity,
    })
}

async fn admis_handler(State(state): State<AgentState>, Json(req): Json<AdmissionRequest>) -> impl IntoResponse {
    let reply = state
        .link
        .admis_request(&req.object.metadata.namespace, &req.object.metadata.name)
        .await;

    let template_changed = req
        .old_object
        .as_ref()
        .map(|old| old.spec != req.object.spec)
        .unwrap_or(true);
    let replicas_changed = req
        .old_object
        .as_ref()
        .map(|old| old.spec["replicas"] != req.object.spec["replicas"])
        .unwrap_or(false);

    let facts = if matches!(reply, AdmisReply::Govern { .. }) {
        read_deployment_facts(&state.client, &req.object.metadata.namespace, &req.object.metadata.name).await
    } else {
        None
    };

    let verdict = admission::decide(&req, &reply, template_changed, replicas_changed, facts.as_ref());
    let uid = req.uid.clone();
    (StatusCode::OK, Json(verdict_response(verdict, uid)))
}

fn verdict_response(verdict: AdmissionVerdict, uid: String) -> serde_json::Value {
    verdict.into_response(uid)
}
