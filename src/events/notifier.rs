//! Pluggable outbound alert delivery.
//!
//! The chat-transport integrations (WeCom, DingTalk, Feishu, Slack) are out
//! of scope; `LoggingNotifier` stands in so the ambient observability path
//! — a matched, deduped alert always produces a structured log line — is
//! still exercised end to end.

use async_trait::async_trait;

use crate::events::rules::{Rule, Severity};

#[derive(Debug, Clone)]
pub struct AlertMessage {
    pub rule_name: String,
    pub severity: Severity,
    pub env: String,
    pub namespace: String,
    pub name: String,
    pub reason: String,
    pub message: String,
}

impl AlertMessage {
    pub fn from_rule(rule: &Rule, env: &str, namespace: &str, name: &str, reason: &str, message: &str) -> Self {
        Self {
            rule_name: rule.name.clone(),
            severity: rule.severity.unwrap_or(Severity::Warning),
            env: env.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, msg: &AlertMessage);
}

pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, msg: &AlertMessage) {
        tracing::warn!(
            rule = %msg.rule_name,
            severity = ?msg.severity,
            emoji = msg.severity.emoji(),
            env = %msg.env,
            namespace = %msg.namespace,
            name = %msg.name,
            reason = %msg.reason,
            "event_alert_fired: {}",
            msg.message
        );
    }
}
