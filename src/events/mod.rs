//! C5: event ingestion and alerting.
//!
//! An agent-observed Kubernetes event arrives as a `Frame::K8sEvent`,
//! is normalized into an `EventRecord`, persisted, and — unless it is a
//! `DELETED` transition or matches a global ignore rule — evaluated
//! against the ordered alert rule set. Any alert-rule match stamps the
//! record `已告警` in the store regardless of dedup outcome; only the
//! dedup-surviving match actually reaches the notifier.

pub mod dedup;
pub mod notifier;
pub mod rules;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{KubeDoorError, Result};
use crate::model::EventRecord;
use crate::store::Store;

use dedup::DedupCache;
use notifier::{AlertMessage, Notifier};
use rules::{AlertRuleMatcher, EventFields, RuleConfig};

/// Parse an event timestamp strictly. The original ingestion pipeline
/// silently substituted "now" for unparseable or missing timestamps; this
/// is a deliberate behavior change — an event with a timestamp that cannot
/// be parsed is a data integrity problem, not a transient condition to
/// paper over, so ingestion now fails loudly instead.
pub fn parse_event_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if raw.is_empty() {
        return Err(KubeDoorError::BadRequest("event timestamp is empty".into()));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| KubeDoorError::BadRequest(format!("malformed event timestamp {raw}: {e}")))
}

fn event_fields(env: &str, event: &EventRecord) -> EventFields {
    let mut fields = HashMap::new();
    fields.insert("env".to_string(), env.to_string());
    fields.insert("kind".to_string(), event.kind.clone());
    fields.insert("namespace".to_string(), event.namespace.clone());
    fields.insert("name".to_string(), event.name.clone());
    fields.insert("reason".to_string(), event.reason.clone());
    fields.insert("message".to_string(), event.message.clone());
    fields.insert("level".to_string(), event.level.clone());
    fields.insert("reporting_component".to_string(), event.reporting_component.clone());
    fields.insert("count".to_string(), event.count.to_string());
    fields
}

pub struct EventProcessor {
    store: Arc<Store>,
    matcher: Mutex<AlertRuleMatcher>,
    dedup: Mutex<DedupCache>,
    notifier: Arc<dyn Notifier>,
}

impl EventProcessor {
    pub fn new(store: Arc<Store>, rule_config: RuleConfig, dedup_window_secs: i64, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            matcher: Mutex::new(AlertRuleMatcher::new(rule_config)),
            dedup: Mutex::new(DedupCache::new(dedup_window_secs)),
            notifier,
        }
    }

    pub async fn reload_rules(&self, rule_config: RuleConfig) {
        self.matcher.lock().await.reload(rule_config);
    }

    /// Validate, persist, and — for non-DELETED events — evaluate for
    /// alerting. Returns `Ok(true)` if a notification was actually sent.
    pub async fn process_event(&self, env: &str, event: EventRecord, now: i64) -> Result<bool> {
        if !event.is_valid() {
            return Err(KubeDoorError::BadRequest(format!(
                "invalid event record {}",
                event.event_uid
            )));
        }
        parse_event_timestamp(&event.last_timestamp)?;

        self.store.upsert_event(&event).await?;

        if event.event_status == "DELETED" {
            return Ok(false);
        }

        let fields = event_fields(env, &event);
        let matched_rule = {
            let matcher = self.matcher.lock().await;
            matcher.match_rules(&fields).cloned()
        };

        let Some(rule) = matched_rule else {
            return Ok(false);
        };

        self.store.mark_event_alerted(&event.event_uid).await?;

        let should_notify = self.dedup.lock().await.should_notify(&event.event_uid, now);
        if should_notify {
            let msg = AlertMessage::from_rule(&rule, env, &event.namespace, &event.name, &event.reason, &event.message);
            self.notifier.notify(&msg).await;
        }
        Ok(should_notify)
    }
}
