use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use kubedoor::events::dedup::DedupCache;
use kubedoor::events::notifier::{AlertMessage, Notifier};
use kubedoor::events::rules::{AlertRuleMatcher, RuleConfig};

// ══════════════════════════════════════════════════════════════════
// C5 event ingestion & alerting integration tests (no ClickHouse
// required)
//
// Exercises the full in-memory alert pipeline: raw event fields → the
// ordered global-ignore/alert-rule matcher → the per-event-UID dedup
// cache → the notifier. `EventProcessor::process_event` itself also
// persists to the store on every call, so its own module tests cover
// the store-touching half; this file drives the pipeline the way
// `process_event` does internally, without a reachable ClickHouse.
// ══════════════════════════════════════════════════════════════════

#[derive(Default)]
struct CapturingNotifier {
    sent: Mutex<Vec<AlertMessage>>,
}

#[async_trait]
impl Notifier for CapturingNotifier {
    async fn notify(&self, msg: &AlertMessage) {
        self.sent.lock().unwrap().push(msg.clone());
    }
}

fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn crash_loop_rule_config() -> RuleConfig {
    serde_json::from_str(
        r#"{
            "global_ignore_rules": [
                {"name": "ignore-succeeded-pods", "conditions": {"reason": {"equals": "Completed"}}}
            ],
            "alert_rules": [
                {"name": "crash-loop", "severity": "critical", "conditions": {"reason": {"contains": ["BackOff", "CrashLoop"]}}}
            ]
        }"#,
    )
    .unwrap()
}

/// Runs one event through the matcher → dedup → notify pipeline the way
/// `EventProcessor::process_event` does, returning whether a notification
/// actually fired.
async fn run_pipeline(
    matcher: &AlertRuleMatcher,
    dedup: &Mutex<DedupCache>,
    notifier: &dyn Notifier,
    env: &str,
    event_uid: &str,
    event_fields: &HashMap<String, String>,
    now: i64,
) -> bool {
    let Some(rule) = matcher.match_rules(event_fields) else {
        return false;
    };
    let should_notify = dedup.lock().unwrap().should_notify(event_uid, now);
    if should_notify {
        let msg = AlertMessage::from_rule(
            &rule,
            env,
            event_fields.get("namespace").map(String::as_str).unwrap_or_default(),
            event_fields.get("name").map(String::as_str).unwrap_or_default(),
            event_fields.get("reason").map(String::as_str).unwrap_or_default(),
            event_fields.get("message").map(String::as_str).unwrap_or_default(),
        );
        notifier.notify(&msg).await;
    }
    should_notify
}

#[tokio::test]
async fn a_crash_looping_pod_fires_exactly_once_within_the_dedup_window() {
    let matcher = AlertRuleMatcher::new(crash_loop_rule_config());
    let dedup = Mutex::new(DedupCache::new(300));
    let notifier = CapturingNotifier::default();

    let event = fields(&[
        ("namespace", "prod"),
        ("name", "web-0"),
        ("reason", "CrashLoopBackOff"),
        ("message", "back-off restarting failed container"),
    ]);

    let first = run_pipeline(&matcher, &dedup, &notifier, "c1", "uid-1", &event, 1000).await;
    let second = run_pipeline(&matcher, &dedup, &notifier, "c1", "uid-1", &event, 1100).await;

    assert!(first);
    assert!(!second);
    assert_eq!(notifier.sent.lock().unwrap().len(), 1);
    assert_eq!(notifier.sent.lock().unwrap()[0].rule_name, "crash-loop");
}

#[tokio::test]
async fn the_same_event_uid_alerts_again_once_the_dedup_window_has_elapsed() {
    let matcher = AlertRuleMatcher::new(crash_loop_rule_config());
    let dedup = Mutex::new(DedupCache::new(300));
    let notifier = CapturingNotifier::default();

    let event = fields(&[("reason", "BackOff"), ("namespace", "prod"), ("name", "web-0"), ("message", "m")]);

    run_pipeline(&matcher, &dedup, &notifier, "c1", "uid-1", &event, 1000).await;
    let third = run_pipeline(&matcher, &dedup, &notifier, "c1", "uid-1", &event, 1301).await;

    assert!(third);
    assert_eq!(notifier.sent.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn a_globally_ignored_reason_never_reaches_the_notifier_even_on_first_sight() {
    let matcher = AlertRuleMatcher::new(crash_loop_rule_config());
    let dedup = Mutex::new(DedupCache::new(300));
    let notifier = CapturingNotifier::default();

    let event = fields(&[("reason", "Completed"), ("namespace", "prod"), ("name", "job-1"), ("message", "m")]);
    let notified = run_pipeline(&matcher, &dedup, &notifier, "c1", "uid-2", &event, 1000).await;

    assert!(!notified);
    assert!(notifier.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn an_event_matching_no_alert_rule_is_silently_dropped_from_the_alert_path() {
    let matcher = AlertRuleMatcher::new(crash_loop_rule_config());
    let dedup = Mutex::new(DedupCache::new(300));
    let notifier = CapturingNotifier::default();

    let event = fields(&[("reason", "Scheduled"), ("namespace", "prod"), ("name", "pod-1"), ("message", "m")]);
    let notified = run_pipeline(&matcher, &dedup, &notifier, "c1", "uid-3", &event, 1000).await;

    assert!(!notified);
}
