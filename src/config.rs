use crate::error::{KubeDoorError, Result};

fn required(name: &'static str) -> Result<String> {
    std::env::var(name).map_err(|_| KubeDoorError::ConfigMissing(name))
}

fn optional(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Columnar-store connection parameters, loaded once at process startup.
///
/// Missing required variables are a fatal startup condition per the
/// error-handling design: invalid environment configuration aborts before
/// the server binds.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub host: String,
    pub http_port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub pool_size: usize,
}

impl StoreConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: required("CK_HOST")?,
            http_port: optional("CK_HTTP_PORT", "8123")
                .parse()
                .map_err(|_| KubeDoorError::ConfigMissing("CK_HTTP_PORT"))?,
            user: required("CK_USER")?,
            password: required("CK_PASSWORD")?,
            database: required("CK_DATABASE")?,
            pool_size: optional("CK_POOL_SIZE", "10")
                .parse()
                .unwrap_or(10),
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.http_port)
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSourceConfig {
    pub prom_url: String,
    pub prom_type: String,
    pub prom_k8s_tag_key: String,
}

impl MetricsSourceConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            prom_url: required("PROM_URL")?,
            prom_type: optional("PROM_TYPE", "prometheus"),
            prom_k8s_tag_key: optional("PROM_K8S_TAG_KEY", "k8s_cluster"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub msg_type: String,
    pub msg_token: String,
    pub alert_dedup_window_secs: i64,
}

impl NotifierConfig {
    pub fn from_env() -> Self {
        Self {
            msg_type: optional("MSG_TYPE", "wecom"),
            msg_token: optional("MSG_TOKEN", ""),
            alert_dedup_window_secs: optional("ALERT_DEDUP_WINDOW", "300")
                .parse()
                .unwrap_or(300),
        }
    }
}

/// Coordinator process configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub bind_addr: String,
    pub store: StoreConfig,
    pub metrics_source: MetricsSourceConfig,
    pub notifier: NotifierConfig,
}

impl CoordinatorConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bind_addr: optional("KUBEDOOR_COORDINATOR_ADDR", "0.0.0.0:8080"),
            store: StoreConfig::from_env()?,
            metrics_source: MetricsSourceConfig::from_env()?,
            notifier: NotifierConfig::from_env(),
        })
    }
}

/// Agent process configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub env: String,
    pub bind_addr: String,
    pub coordinator_ws_url: String,
    pub tls_cert: String,
    pub tls_key: String,
    pub metrics_source: MetricsSourceConfig,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            env: required("KUBEDOOR_ENV")?,
            bind_addr: optional("KUBEDOOR_AGENT_ADDR", "0.0.0.0:8443"),
            coordinator_ws_url: required("KUBEDOOR_COORDINATOR_URL")?,
            tls_cert: optional("KUBEDOOR_TLS_CERT", "tls.crt"),
            tls_key: optional("KUBEDOOR_TLS_KEY", "tls.key"),
            metrics_source: MetricsSourceConfig::from_env()?,
        })
    }
}

/// `UPDATE_IMAGE` env var: per-env (or `"default"`) windows during which an
/// unauthorized caller of `/api/update-image` is allowed through. Parsed
/// once at coordinator startup; `X-User-Permission: rw` bypasses it
/// entirely per §6.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct UpdateImageWindow {
    pub is_operation_allowed: bool,
    pub allowed_operation_period: String,
    #[serde(default)]
    pub user: Vec<String>,
}

pub type UpdateImageConfig = std::collections::HashMap<String, UpdateImageWindow>;

pub fn update_image_config_from_env() -> UpdateImageConfig {
    std::env::var("UPDATE_IMAGE")
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}
