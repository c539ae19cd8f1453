//! Ordered, first-match-wins alert rule engine.
//!
//! Rules are loaded from a JSON config with two top-level arrays:
//! `global_ignore_rules` (checked first, any match drops the event from the
//! alert path entirely) and `alert_rules` (ordered, first enabled match
//! wins). Ported field-for-field from the matching engine described in the
//! component design for event ingestion & alerting.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

impl Severity {
    pub fn emoji(&self) -> &'static str {
        match self {
            Severity::Critical => "🚨",
            Severity::Warning => "⚠️",
            Severity::Info => "ℹ️",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldConditions {
    #[serde(default)]
    pub contains: Option<Value>,
    #[serde(default)]
    pub not_contains: Option<Value>,
    #[serde(default)]
    pub starts_with: Option<Value>,
    #[serde(default)]
    pub not_starts_with: Option<Value>,
    #[serde(default)]
    pub ends_with: Option<Value>,
    #[serde(default)]
    pub not_ends_with: Option<Value>,
    #[serde(default)]
    pub equals: Option<Value>,
    #[serde(default)]
    pub not_equals: Option<Value>,
    #[serde(default)]
    pub greater_than: Option<i64>,
    #[serde(default)]
    pub less_than: Option<i64>,
    #[serde(default)]
    pub greater_equal: Option<i64>,
    #[serde(default)]
    pub less_equal: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub severity: Option<Severity>,
    pub conditions: HashMap<String, FieldConditions>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RuleConfig {
    #[serde(default)]
    pub global_ignore_rules: Vec<Rule>,
    #[serde(default)]
    pub alert_rules: Vec<Rule>,
}

/// Any event field value, keyed by field name, as a string map — the event
/// record is flattened to this shape before matching.
pub type EventFields = HashMap<String, String>;

fn any_matches(values: &Value, event_value: &str, predicate: impl Fn(&str, &str) -> bool) -> bool {
    let event_lower = event_value.to_lowercase();
    let list: Vec<String> = match values {
        Value::Array(arr) => arr.iter().map(|v| v.to_string().trim_matches('"').to_string()).collect(),
        other => vec![other.to_string().trim_matches('"').to_string()],
    };
    list.iter().any(|v| predicate(&v.to_lowercase(), &event_lower))
}

/// Evaluate a single field's conditions against the event. Absent fields:
/// `not_*` predicates match (vacuously true), all other predicate kinds
/// fail. An unrecognized/empty condition set defaults to matching (true).
fn match_field_condition(fields: &EventFields, field_name: &str, cond: &FieldConditions) -> bool {
    let Some(value) = fields.get(field_name) else {
        return cond.not_contains.is_some() || cond.not_starts_with.is_some() || cond.not_ends_with.is_some();
    };

    if let Some(v) = &cond.contains {
        return any_matches(v, value, |needle, hay| hay.contains(needle));
    }
    if let Some(v) = &cond.not_contains {
        return !any_matches(v, value, |needle, hay| hay.contains(needle));
    }
    if let Some(v) = &cond.starts_with {
        return any_matches(v, value, |needle, hay| hay.starts_with(needle));
    }
    if let Some(v) = &cond.not_starts_with {
        return !any_matches(v, value, |needle, hay| hay.starts_with(needle));
    }
    if let Some(v) = &cond.ends_with {
        return any_matches(v, value, |needle, hay| hay.ends_with(needle));
    }
    if let Some(v) = &cond.not_ends_with {
        return !any_matches(v, value, |needle, hay| hay.ends_with(needle));
    }
    if let Some(v) = &cond.equals {
        let needle = v.to_string().trim_matches('"').to_lowercase();
        return value.to_lowercase() == needle;
    }
    if let Some(v) = &cond.not_equals {
        let needle = v.to_string().trim_matches('"').to_lowercase();
        return value.to_lowercase() != needle;
    }

    if field_name == "count" {
        let Ok(num) = value.parse::<i64>() else {
            return false;
        };
        if let Some(gt) = cond.greater_than {
            return num > gt;
        }
        if let Some(lt) = cond.less_than {
            return num < lt;
        }
        if let Some(ge) = cond.greater_equal {
            return num >= ge;
        }
        if let Some(le) = cond.less_equal {
            return num <= le;
        }
    }

    true
}

fn match_conditions(fields: &EventFields, conditions: &HashMap<String, FieldConditions>) -> bool {
    conditions.iter().all(|(field, cond)| match_field_condition(fields, field, cond))
}

pub struct AlertRuleMatcher {
    config: RuleConfig,
}

impl AlertRuleMatcher {
    pub fn new(config: RuleConfig) -> Self {
        Self { config }
    }

    pub fn reload(&mut self, config: RuleConfig) {
        self.config = config;
    }

    pub fn should_ignore(&self, fields: &EventFields) -> bool {
        self.config
            .global_ignore_rules
            .iter()
            .filter(|r| r.enabled)
            .any(|r| match_conditions(fields, &r.conditions))
    }

    /// Returns the first enabled rule that matches, or `None`. DELETED
    /// events and ignore-matched events must be filtered by the caller
    /// before calling this.
    pub fn match_rules<'a>(&'a self, fields: &EventFields) -> Option<&'a Rule> {
        if self.should_ignore(fields) {
            return None;
        }
        self.config
            .alert_rules
            .iter()
            .filter(|r| r.enabled)
            .find(|r| match_conditions(fields, &r.conditions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> EventFields {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn rule_config(json: &str) -> RuleConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn absent_field_matches_not_contains() {
        let cond = FieldConditions {
            contains: None,
            not_contains: Some(serde_json::json!("boom")),
            starts_with: None,
            not_starts_with: None,
            ends_with: None,
            not_ends_with: None,
            equals: None,
            not_equals: None,
            greater_than: None,
            less_than: None,
            greater_equal: None,
            less_equal: None,
        };
        let event = fields(&[("namespace", "prod")]);
        assert!(match_field_condition(&event, "reason", &cond));
    }

    #[test]
    fn absent_field_fails_contains() {
        let cond = FieldConditions {
            contains: Some(serde_json::json!("boom")),
            not_contains: None,
            starts_with: None,
            not_starts_with: None,
            ends_with: None,
            not_ends_with: None,
            equals: None,
            not_equals: None,
            greater_than: None,
            less_than: None,
            greater_equal: None,
            less_equal: None,
        };
        let event = fields(&[("namespace", "prod")]);
        assert!(!match_field_condition(&event, "reason", &cond));
    }

    #[test]
    fn contains_is_case_insensitive_and_any_of_list() {
        let config = rule_config(
            r#"{"alert_rules":[{"name":"r1","conditions":{"reason":{"contains":["BackOff","OOMKilled"]}}}]}"#,
        );
        let matcher = AlertRuleMatcher::new(config);
        let event = fields(&[("reason", "crashloopbackoff")]);
        assert!(matcher.match_rules(&event).is_some());
    }

    #[test]
    fn count_greater_than_matches_numeric_field() {
        let config = rule_config(
            r#"{"alert_rules":[{"name":"r1","conditions":{"count":{"greater_than":5}}}]}"#,
        );
        let matcher = AlertRuleMatcher::new(config);
        assert!(matcher.match_rules(&fields(&[("count", "10")])).is_some());
        assert!(matcher.match_rules(&fields(&[("count", "3")])).is_none());
    }

    #[test]
    fn ignore_rules_are_checked_before_alert_rules() {
        let config = rule_config(
            r#"{
                "global_ignore_rules":[{"name":"ignore-probe","conditions":{"reason":{"equals":"Unhealthy"}}}],
                "alert_rules":[{"name":"any","conditions":{}}]
            }"#,
        );
        let matcher = AlertRuleMatcher::new(config);
        assert!(matcher.match_rules(&fields(&[("reason", "Unhealthy")])).is_none());
    }

    #[test]
    fn first_match_wins_in_array_order() {
        let config = rule_config(
            r#"{
                "alert_rules":[
                    {"name":"first","conditions":{"reason":{"contains":"BackOff"}}},
                    {"name":"second","conditions":{}}
                ]
            }"#,
        );
        let matcher = AlertRuleMatcher::new(config);
        let matched = matcher.match_rules(&fields(&[("reason", "BackOff")])).unwrap();
        assert_eq!(matched.name, "first");
    }

    #[test]
    fn disabled_rule_is_skipped() {
        let config = rule_config(
            r#"{"alert_rules":[{"name":"r1","enabled":false,"conditions":{}}]}"#,
        );
        let matcher = AlertRuleMatcher::new(config);
        assert!(matcher.match_rules(&fields(&[("reason", "x")])).is_none());
    }

    #[test]
    fn conjunction_requires_all_fields_to_match() {
        let config = rule_config(
            r#"{"alert_rules":[{"name":"r1","conditions":{
                "reason":{"equals":"BackOff"},
                "namespace":{"equals":"prod"}
            }}]}"#,
        );
        let matcher = AlertRuleMatcher::new(config);
        assert!(matcher
            .match_rules(&fields(&[("reason", "BackOff"), ("namespace", "prod")]))
            .is_some());
        assert!(matcher
            .match_rules(&fields(&[("reason", "BackOff"), ("namespace", "staging")]))
            .is_none());
    }
}
