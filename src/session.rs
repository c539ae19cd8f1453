use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};

use crate::error::{KubeDoorError, Result};
use crate::protocol::Frame;

const HEARTBEAT_TIMEOUT_SECS: i64 = 5;
const REQUEST_DEADLINE_SECS: u64 = 120;

/// One live session for a managed cluster.
///
/// `pendingRequests` is mutated only by the session's own reader task, per
/// the shared-resource policy: the coordinator's REST handlers only insert
/// waiters and the reader task drains them on a matching `Response`/
/// `AdmisResponse` frame.
pub struct AgentSession {
    pub env: String,
    pub version: String,
    outbound: mpsc::UnboundedSender<Message>,
    pending: RwLock<HashMap<u64, oneshot::Sender<(u16, Value)>>>,
    pub last_heartbeat_at: RwLock<i64>,
    pub online: std::sync::atomic::AtomicBool,
}

impl AgentSession {
    fn new(env: String, version: String, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            env,
            version,
            outbound,
            pending: RwLock::new(HashMap::new()),
            last_heartbeat_at: RwLock::new(Utc::now().timestamp()),
            online: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub async fn touch_heartbeat(&self) {
        *self.last_heartbeat_at.write().await = Utc::now().timestamp();
        self.online.store(true, Ordering::Relaxed);
    }

    /// Send a `Request` frame and await its matching `Response` within the
    /// coordinator-side deadline.
    pub async fn call(&self, method: &str, path: &str, query: Value, body: Value) -> Result<(u16, Value)> {
        if !self.is_online() {
            return Err(KubeDoorError::SessionOffline(self.env.clone()));
        }
        let request_id = next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(request_id, tx);

        let frame = Frame::Request {
            request_id,
            method: method.to_string(),
            path: path.to_string(),
            query,
            body,
        };
        let text = serde_json::to_string(&frame).map_err(|e| KubeDoorError::Internal(e.to_string()))?;
        if self.outbound.send(Message::Text(text)).is_err() {
            self.pending.write().await.remove(&request_id);
            return Err(KubeDoorError::SessionOffline(self.env.clone()));
        }

        match tokio::time::timeout(std::time::Duration::from_secs(REQUEST_DEADLINE_SECS), rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(KubeDoorError::RequestTimeout),
            Err(_) => {
                self.pending.write().await.remove(&request_id);
                Err(KubeDoorError::RequestTimeout)
            }
        }
    }

    /// Resolve a pending waiter when the reader task observes a `Response`.
    pub async fn complete(&self, request_id: u64, status: u16, body: Value) {
        if let Some(tx) = self.pending.write().await.remove(&request_id) {
            let _ = tx.send((status, body));
        }
    }

    pub fn send_frame(&self, frame: &Frame) -> Result<()> {
        let text = serde_json::to_string(frame).map_err(|e| KubeDoorError::Internal(e.to_string()))?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| KubeDoorError::SessionOffline(self.env.clone()))
    }
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// The `env → session` map. Guarded by a read-mostly lock: lookups for the
/// REST gateway and the heartbeat sweep read it far more often than a new
/// connection writes it.
#[derive(Default, Clone)]
pub struct SessionMap {
    inner: Arc<RwLock<HashMap<String, Arc<AgentSession>>>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session for `env`. Rejects a second connection while
    /// the prior session for the same env is still online (409-shaped
    /// conflict).
    pub async fn register(
        &self,
        env: String,
        version: String,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Result<Arc<AgentSession>> {
        let mut guard = self.inner.write().await;
        if let Some(existing) = guard.get(&env) {
            if existing.is_online() {
                return Err(KubeDoorError::DuplicateSession(env));
            }
        }
        let session = Arc::new(AgentSession::new(env.clone(), version, outbound));
        info!(env = %env, "agent_session_registered");
        guard.insert(env, session.clone());
        Ok(session)
    }

    pub async fn get(&self, env: &str) -> Option<Arc<AgentSession>> {
        self.inner.read().await.get(env).cloned()
    }

    pub async fn mark_offline(&self, env: &str) {
        if let Some(session) = self.inner.read().await.get(env) {
            session.online.store(false, Ordering::Relaxed);
            warn!(env = %env, "agent_session_offline");
        }
    }

    pub async fn all(&self) -> Vec<Arc<AgentSession>> {
        self.inner.read().await.values().cloned().collect()
    }

    /// One liveness sweep tick: mark any session whose last heartbeat is
    /// older than the timeout as offline. Run every 3 s by the caller.
    pub async fn sweep_heartbeats(&self) {
        let now = Utc::now().timestamp();
        for session in self.all().await {
            if !session.is_online() {
                continue;
            }
            let last = *session.last_heartbeat_at.read().await;
            if now - last > HEARTBEAT_TIMEOUT_SECS {
                session.online.store(false, Ordering::Relaxed);
                warn!(env = %session.env, "agent_heartbeat_timeout");
            }
        }
    }
}
