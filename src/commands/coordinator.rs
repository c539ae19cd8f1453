//! Coordinator process: the control-plane hub agents dial into, plus the
//! REST gateway that forwards browser/API calls onto the right agent
//! session. Reuses the donor webhook server's router/graceful-shutdown
//! shape, retargeted onto a WebSocket hub instead of a single admission
//! endpoint.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use kubedoor::config::{update_image_config_from_env, CoordinatorConfig, UpdateImageConfig};
use kubedoor::error::KubeDoorError;
use kubedoor::events::notifier::LoggingNotifier;
use kubedoor::events::rules::RuleConfig;
use kubedoor::events::EventProcessor;
use kubedoor::harvest::Harvester;
use kubedoor::metrics;
use kubedoor::metrics_source::MetricsSourceClient;
use kubedoor::model::AdmisReply;
use kubedoor::protocol::Frame;
use kubedoor::session::SessionMap;
use kubedoor::store::{EventQuery, Store};

const HEARTBEAT_SWEEP_INTERVAL_SECS: u64 = 3;
const BALANCE_NAMESPACE_EXCLUDE: &str = "kube-.*|monitoring|istio-.*";
const BALANCE_TOP_N: usize = 5;

/// A browser-side log-stream socket, keyed by `connection_id`, so an
/// inbound `pod_logs` frame from any agent session can be routed to the
/// one browser that started it.
#[derive(Clone, Default)]
struct LogStreamRegistry {
    inner: Arc<RwLock<HashMap<String, tokio::sync::mpsc::UnboundedSender<WsMessage>>>>,
}

impl LogStreamRegistry {
    async fn register(&self, id: String, tx: tokio::sync::mpsc::UnboundedSender<WsMessage>) {
        self.inner.write().await.insert(id, tx);
    }

    async fn unregister(&self, id: &str) {
        self.inner.write().await.remove(id);
    }

    async fn dispatch(&self, id: &str, frame: &Frame) {
        if let Some(tx) = self.inner.read().await.get(id) {
            if let Ok(text) = serde_json::to_string(frame) {
                let _ = tx.send(WsMessage::Text(text));
            }
        }
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct CoordinatorState {
    pub sessions: SessionMap,
    pub store: Arc<Store>,
    pub events: Arc<EventProcessor>,
    pub harvester: Arc<Harvester>,
    pub metrics: Arc<MetricsSourceClient>,
    pub update_image: Arc<UpdateImageConfig>,
    log_streams: LogStreamRegistry,
}

pub async fn serve(config: CoordinatorConfig) -> Result<()> {
    let store = Arc::new(Store::new(&config.store));
    let metrics = Arc::new(MetricsSourceClient::new(config.metrics_source.clone()));
    let harvester = Arc::new(Harvester::new(store.clone(), metrics.clone(), config.metrics_source.clone()));
    let events = Arc::new(EventProcessor::new(
        store.clone(),
        RuleConfig::default(),
        config.notifier.alert_dedup_window_secs,
        Arc::new(LoggingNotifier),
    ));

    let state = CoordinatorState {
        sessions: SessionMap::new(),
        store,
        events,
        harvester,
        metrics,
        update_image: Arc::new(update_image_config_from_env()),
        log_streams: LogStreamRegistry::default(),
    };

    let sweep_sessions = state.sessions.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(HEARTBEAT_SWEEP_INTERVAL_SECS)).await;
            sweep_sessions.sweep_heartbeats().await;
        }
    });

    let app = build_router(state);
    let addr: SocketAddr = config.bind_addr.parse().context("invalid bind address")?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut shutdown_rx = shutdown_tx.subscribe();

    info!(addr = %addr, "coordinator_started");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
        let _ = shutdown_rx.recv().await;
    });

    tokio::select! {
        result = server => { result?; }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown_signal_received");
            let _ = shutdown_tx.send(());
        }
    }

    Ok(())
}

fn build_router(state: CoordinatorState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/ws/pod-logs", get(pod_logs_ws_handler))
        .route("/api/agent_status/{env}", get(agent_status_handler))
        .route("/api/control_records/{env}", get(control_records_handler))
        .route("/api/gateway/{env}/{*path}", post(gateway_handler))
        .route("/api/cron_peak_data/{env}", post(cron_peak_data_handler))
        .route("/api/init_peak_data", get(init_peak_data_handler))
        .route("/api/events/query", post(events_query_handler))
        .route("/api/events/menu", get(events_menu_handler))
        .route("/api/sql", post(sql_handler))
        .route("/api/update-image", post(update_image_handler))
        .route("/api/scale", post(scale_handler))
        .route("/api/pod/modify_pod", post(modify_pod_handler))
        .route("/api/balance_node", post(balance_node_handler))
        .route("/api/restart", post(restart_handler))
        .route("/api/cron", post(cron_handler))
        .route("/api/admis_switch", post(admis_switch_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Pull the `env` the caller wants to reach out of the query string and
/// resolve its session, or fail with the same 503-shaped error the
/// WebSocket-level `Frame::Request` path would eventually hit anyway.
async fn resolve_session(state: &CoordinatorState, params: &HashMap<String, String>) -> Result<Arc<kubedoor::session::AgentSession>, KubeDoorError> {
    let env = params.get("env").cloned().unwrap_or_default();
    if env.is_empty() {
        return Err(KubeDoorError::BadRequest("missing env query parameter".into()));
    }
    state.sessions.get(&env).await.ok_or(KubeDoorError::SessionOffline(env))
}

/// Plain-forward: no coordinator-side pre-processing, the agent dispatch
/// table is where any real behavior lives.
async fn forward_to_agent(state: &CoordinatorState, params: &HashMap<String, String>, path: &str, body: Value) -> axum::response::Response {
    let session = match resolve_session(state, params).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    match session.call("POST", path, Value::Null, body).await {
        Ok((status, resp_body)) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, Json(resp_body)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn restart_handler(
    State(state): State<CoordinatorState>,
    Query(params): Query<HashMap<String, String>>,
    body: Option<Json<Value>>,
) -> impl IntoResponse {
    forward_to_agent(&state, &params, "/api/restart", body.map(|Json(v)| v).unwrap_or(Value::Null)).await
}

async fn cron_handler(
    State(state): State<CoordinatorState>,
    Query(params): Query<HashMap<String, String>>,
    body: Option<Json<Value>>,
) -> impl IntoResponse {
    forward_to_agent(&state, &params, "/api/cron", body.map(|Json(v)| v).unwrap_or(Value::Null)).await
}

/// `/api/update-image`: gate per §6 — `X-User-Permission: rw` bypasses,
/// otherwise the caller must fall inside the configured env's (or
/// `default`'s) allowed operation window.
async fn update_image_handler(
    State(state): State<CoordinatorState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let env = params.get("env").cloned().unwrap_or_default();
    let is_rw = headers.get("X-User-Permission").and_then(|v| v.to_str().ok()) == Some("rw");
    if !is_rw {
        let window = state.update_image.get(&env).or_else(|| state.update_image.get("default"));
        let allowed = match window {
            Some(w) if w.is_operation_allowed => is_within_window(&w.allowed_operation_period),
            _ => false,
        };
        if !allowed {
            return KubeDoorError::Forbidden("update-image is outside its authorized window".into()).into_response();
        }
    }

    let session = match resolve_session(&state, &params).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    match session.call("POST", "/api/update-image", Value::Null, body).await {
        Ok((status, resp_body)) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, Json(resp_body)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// `"HH:MM-HH:MM"`, may cross midnight. Current time must fall in
/// `[start, end)`, with `end` allowed to be strictly before `start` on the
/// clock (wraps past midnight).
fn is_within_window(period: &str) -> bool {
    let Some((start_s, end_s)) = period.split_once('-') else {
        return false;
    };
    let Ok(start) = chrono::NaiveTime::parse_from_str(start_s, "%H:%M") else {
        return false;
    };
    let Ok(end) = chrono::NaiveTime::parse_from_str(end_s, "%H:%M") else {
        return false;
    };
    let now = chrono::Utc::now().time();
    if start <= end {
        now >= start && now < end
    } else {
        now >= start || now < end
    }
}

/// `/api/scale` and `/api/pod/modify_pod`: when `add_label=true`, enrich
/// the forwarded body with a live per-node CPU ranking so the agent's
/// `Scheduler` doesn't have to re-query the metrics source.
async fn scale_core(state: &CoordinatorState, params: &HashMap<String, String>, path: &str, mut body: Value) -> axum::response::Response {
    if body.get("add_label").and_then(Value::as_bool).unwrap_or(false) {
        match state.metrics.node_cpu_rank().await {
            Ok(ranked) => {
                if let Some(obj) = body.as_object_mut() {
                    obj.insert("node_rank".into(), json!(ranked));
                }
            }
            Err(e) => warn!(error = %e, "node_cpu_rank_lookup_failed"),
        }
    }
    forward_to_agent(state, params, path, body).await
}

async fn scale_handler(
    State(state): State<CoordinatorState>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    scale_core(&state, &params, "/api/scale", body).await
}

async fn modify_pod_handler(
    State(state): State<CoordinatorState>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    scale_core(&state, &params, "/api/pod/modify_pod", body).await
}

#[derive(Debug, serde::Deserialize)]
struct BalanceNodeRequest {
    env: String,
    source: String,
    target: String,
    #[serde(default)]
    by_cpu: bool,
}

/// `/api/balance_node`: compute the top-`BALANCE_TOP_N` workloads pinned
/// to `source` (by requested CPU or memory) that aren't already pinned to
/// `target`, then forward the enriched candidate list.
async fn balance_node_handler(State(state): State<CoordinatorState>, Json(req): Json<BalanceNodeRequest>) -> impl IntoResponse {
    let Some(session) = state.sessions.get(&req.env).await else {
        return KubeDoorError::SessionOffline(req.env).into_response();
    };

    let records = match state.store.control_records_for_env(&req.env).await {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    let target_workloads = match state.metrics.workloads_on_node(&req.target, BALANCE_NAMESPACE_EXCLUDE).await {
        Ok(w) => w,
        Err(e) => return e.into_response(),
    };
    let target_labels: std::collections::HashSet<String> =
        target_workloads.into_iter().map(|(ns, dep)| format!("{ns}.{dep}")).collect();

    let candidates = kubedoor::scheduler::Scheduler::select_rebalance_candidates(&records, req.by_cpu, &target_labels, BALANCE_TOP_N);
    let body = json!({
        "source": req.source,
        "target": req.target,
        "candidates": candidates.iter().map(|c| json!({ "namespace": c.namespace, "deployment": c.deployment })).collect::<Vec<_>>(),
    });

    match session.call("POST", "/api/balance_node", Value::Null, body).await {
        Ok((status, resp_body)) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, Json(resp_body)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, serde::Deserialize)]
struct AdmisSwitchRequest {
    env: String,
    action: String,
}

/// `/api/admis_switch`: flip the admission toggle in the store directly —
/// this is a coordinator-local DB flag, not an agent-forwarded call, since
/// `resolve_admis` reads it straight from `AgentStatus`.
async fn admis_switch_handler(State(state): State<CoordinatorState>, Json(req): Json<AdmisSwitchRequest>) -> impl IntoResponse {
    let enabled = match req.action.as_str() {
        "on" => true,
        "off" => false,
        other => return KubeDoorError::BadRequest(format!("unknown admis_switch action {other}")).into_response(),
    };
    match state.store.set_admission(&req.env, enabled).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, serde::Deserialize)]
struct SqlRequest {
    sql: String,
}

/// `/api/sql`: `X-User-Permission: rw` unlocks `ALTER`/`INSERT` in addition
/// to `SELECT`.
async fn sql_handler(State(state): State<CoordinatorState>, headers: HeaderMap, Json(req): Json<SqlRequest>) -> impl IntoResponse {
    let allow_write = headers.get("X-User-Permission").and_then(|v| v.to_str().ok()) == Some("rw");
    match state.store.run_sql(&req.sql, allow_write).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn events_menu_handler(State(state): State<CoordinatorState>, Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    let (Some(k8s), Some(field), Some(start), Some(end)) =
        (params.get("k8s"), params.get("field"), params.get("start_time"), params.get("end_time"))
    else {
        return KubeDoorError::BadRequest("k8s, field, start_time, end_time are required".into()).into_response();
    };
    match state.store.event_field_menu(k8s, field, start, end).await {
        Ok(values) => (StatusCode::OK, Json(values)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// `/api/init_peak_data`: same harvest path as `cron_peak_data`, but
/// triggerable on demand for a not-yet-collecting env with an
/// operator-supplied `peak_hours` instead of the stored one.
async fn init_peak_data_handler(State(state): State<CoordinatorState>, Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    let Some(env) = params.get("env") else {
        return KubeDoorError::BadRequest("env is required".into()).into_response();
    };
    let peak_hours = params
        .get("peak_hours")
        .cloned()
        .unwrap_or_else(|| "02:00:00-06:00:00".to_string());
    match state.harvester.harvest_env(env, &peak_hours).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Browser-side log-stream endpoint: allocate a `connection_id`, tell the
/// owning agent to start streaming, and relay any `pod_logs` frame that
/// agent emits for this connection back to the browser until either side
/// disconnects.
async fn pod_logs_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<CoordinatorState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_pod_logs_socket(socket, state, params))
}

async fn handle_pod_logs_socket(socket: WebSocket, state: CoordinatorState, params: HashMap<String, String>) {
    let (mut sink, mut stream) = socket.split();

    let (env, namespace, pod_name, container) = (
        params.get("env").cloned().unwrap_or_default(),
        params.get("namespace").cloned().unwrap_or_default(),
        params.get("pod_name").cloned().unwrap_or_default(),
        params.get("container").cloned().unwrap_or_default(),
    );
    let Some(session) = state.sessions.get(&env).await else {
        let _ = sink.send(WsMessage::Close(None)).await;
        return;
    };

    let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed).to_string();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    state.log_streams.register(connection_id.clone(), tx).await;

    let _ = session.send_frame(&Frame::StartPodLogs {
        connection_id: connection_id.clone(),
        namespace,
        pod_name,
        container,
    });

    let relay_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Any inbound message from the browser (besides close) ends the
    // stream; there is nothing else the client is expected to send.
    while stream.next().await.is_some() {}

    let _ = session.send_frame(&Frame::StopPodLogs { connection_id: connection_id.clone() });
    state.log_streams.unregister(&connection_id).await;
    relay_task.abort();
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e).into_response(),
    }
}

/// Run a harvest pass for `env` on demand, bypassing the scheduled cron
/// loop — used by both the `cron_peak_data` endpoint and the manual
/// `init_peak_data` first-run path.
async fn cron_peak_data_handler(State(state): State<CoordinatorState>, Path(env): Path<String>) -> impl IntoResponse {
    let status = match state.store.agent_status(&env).await {
        Ok(Some(s)) => s,
        Ok(None) => return KubeDoorError::NotFound(env).into_response(),
        Err(e) => return e.into_response(),
    };
    if let Err(e) = kubedoor::harvest::require_collecting(&env, status.collect) {
        return e.into_response();
    }
    match state.harvester.harvest_env(&env, &status.peak_hours).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn events_query_handler(State(state): State<CoordinatorState>, Json(filter): Json<EventQuery>) -> impl IntoResponse {
    match state.store.query_events(&filter).await {
        Ok(events) => (StatusCode::OK, Json(events)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<CoordinatorState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

/// One agent's session lifetime: register, read frames until disconnect,
/// mark offline. `AdmisRequest` is answered synchronously from the store;
/// `Response`/`Heartbeat` drive the pending-call table and the liveness
/// clock respectively.
async fn handle_agent_socket(socket: WebSocket, state: CoordinatorState) {
    let (mut sink, mut stream) = socket.split();

    // The first frame on a fresh connection must identify the env; until
    // then there is nothing to register a session under.
    let Some(Ok(axum::extract::ws::Message::Text(first))) = stream.next().await else {
        return;
    };
    let env = match serde_json::from_str::<Value>(&first) {
        Ok(v) => v["env"].as_str().unwrap_or_default().to_string(),
        Err(_) => return,
    };
    if env.is_empty() {
        return;
    }

    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let session = match state.sessions.register(env.clone(), "1".into(), outbound_tx).await {
        Ok(s) => s,
        Err(e) => {
            warn!(env = %env, error = %e, "agent_session_register_failed");
            return;
        }
    };
    metrics::WS_SESSIONS.inc();

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        let axum::extract::ws::Message::Text(text) = msg else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
            continue;
        };
        match frame {
            Frame::Heartbeat => session.touch_heartbeat().await,
            Frame::Response { request_id, status, body } => {
                session.complete(request_id, status, body).await;
            }
            Frame::AdmisRequest { request_id, namespace, deployment } => {
                let reply = resolve_admis(&state, &env, &namespace, &deployment).await;
                let _ = session.send_frame(&Frame::AdmisResponse { request_id, reply });
            }
            Frame::K8sEvent { data, timestamp } => {
                handle_event_frame(&state, &env, data, timestamp).await;
            }
            Frame::PodLogs { ref connection_id, .. } => {
                state.log_streams.dispatch(connection_id, &frame).await;
            }
            _ => {}
        }
    }

    state.sessions.mark_offline(&env).await;
    metrics::WS_SESSIONS.dec();
    writer_task.abort();
}

async fn resolve_admis(state: &CoordinatorState, env: &str, namespace: &str, deployment: &str) -> AdmisReply {
    let _timer = metrics::REQUEST_DURATION.start_timer();
    let status = match state.store.agent_status(env).await {
        Ok(Some(s)) => s,
        Ok(None) => {
            return AdmisReply::Passthrough {
                msg: "cluster not registered".into(),
            }
        }
        Err(e) => {
            return AdmisReply::Denied {
                code: 503,
                msg: format!("store unavailable: {e}"),
            }
        }
    };

    if !status.admission || !status.admission_namespace.iter().any(|n| n == namespace) {
        return AdmisReply::Passthrough {
            msg: "namespace not under admission control".into(),
        };
    }

    match state.store.control_record(env, namespace, deployment).await {
        Ok(Some(record)) => AdmisReply::from(&record),
        Ok(None) if status.nms_not_confirm => AdmisReply::Passthrough {
            msg: "workload not yet governed".into(),
        },
        Ok(None) => AdmisReply::Denied {
            code: 404,
            msg: format!("no governance record for {namespace}/{deployment}"),
        },
        Err(e) => AdmisReply::Denied {
            code: 503,
            msg: format!("store unavailable: {e}"),
        },
    }
}

async fn handle_event_frame(state: &CoordinatorState, env: &str, data: Value, _timestamp: String) {
    let Ok(record) = serde_json::from_value(data) else {
        warn!(env = %env, "malformed_k8s_event_frame");
        return;
    };
    let now = chrono::Utc::now().timestamp();
    if let Err(e) = state.events.process_event(env, record, now).await {
        warn!(env = %env, error = %e, "event_processing_failed");
    }
}

async fn agent_status_handler(State(state): State<CoordinatorState>, Path(env): Path<String>) -> impl IntoResponse {
    let result = match state.store.agent_status(&env).await {
        Ok(Some(status)) => (StatusCode::OK, Json(json!(status_with_liveness(&state, &env, status).await))).into_response(),
        Ok(None) => KubeDoorError::NotFound(env).into_response(),
        Err(e) => e.into_response(),
    };
    metrics::REQUESTS_TOTAL
        .with_label_values(&["/api/agent_status", result.status().as_str()])
        .inc();
    result
}

async fn status_with_liveness(state: &CoordinatorState, env: &str, mut status: kubedoor::model::AgentStatus) -> kubedoor::model::AgentStatus {
    if let Some(session) = state.sessions.get(env).await {
        status.online = session.is_online();
        status.last_heartbeat_at = Some(*session.last_heartbeat_at.read().await);
    }
    status
}

async fn control_records_handler(State(state): State<CoordinatorState>, Path(env): Path<String>) -> impl IntoResponse {
    match state.store.control_records_for_env(&env).await {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Forward an arbitrary REST call onto the agent session for `env`.
async fn gateway_handler(
    State(state): State<CoordinatorState>,
    Path((env, path)): Path<(String, String)>,
    body: Option<Json<Value>>,
) -> impl IntoResponse {
    let Some(session) = state.sessions.get(&env).await else {
        return KubeDoorError::SessionOffline(env).into_response();
    };
    let body = body.map(|Json(v)| v).unwrap_or(Value::Null);
    match session.call("POST", &format!("/{path}"), Value::Null, body).await {
        Ok((status, resp_body)) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, Json(resp_body)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubedoor::config::StoreConfig;

    fn store() -> Arc<Store> {
        Arc::new(Store::new(&StoreConfig {
            host: "localhost".into(),
            http_port: 8123,
            user: "default".into(),
            password: String::new(),
            database: "kubedoor".into(),
            pool_size: 4,
        }))
    }

    fn metrics_client() -> Arc<MetricsSourceClient> {
        Arc::new(MetricsSourceClient::new(kubedoor::config::MetricsSourceConfig {
            prom_url: "http://localhost".into(),
            prom_type: "prometheus".into(),
            prom_k8s_tag_key: "k8s_cluster".into(),
        }))
    }

    fn state() -> CoordinatorState {
        CoordinatorState {
            sessions: SessionMap::new(),
            store: store(),
            events: Arc::new(EventProcessor::new(store(), RuleConfig::default(), 300, Arc::new(LoggingNotifier))),
            harvester: Arc::new(Harvester::new(
                store(),
                metrics_client(),
                kubedoor::config::MetricsSourceConfig {
                    prom_url: "http://localhost".into(),
                    prom_type: "prometheus".into(),
                    prom_k8s_tag_key: "k8s_cluster".into(),
                },
            )),
            metrics: metrics_client(),
            update_image: Arc::new(UpdateImageConfig::default()),
            log_streams: LogStreamRegistry::default(),
        }
    }

    #[tokio::test]
    async fn resolve_admis_denies_when_store_is_unreachable() {
        // No ClickHouse server is reachable in the unit-test environment,
        // so the store round trip fails and admission must fail closed.
        let reply = resolve_admis(&state(), "c1", "ns", "dep").await;
        match reply {
            AdmisReply::Denied { code, .. } => assert_eq!(code, 503),
            other => panic!("expected denied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn gateway_handler_fails_fast_for_unknown_env() {
        let state = state();
        assert!(state.sessions.get("unknown").await.is_none());
    }
}
