//! Declarative rule evaluation: compiled conditions over event fields,
//! AND/OR/NOT composition, and action side-effects (deny/transform/tag/
//! priority/route).

use nervus_core::{Event, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One of the 15 fixed comparison operators a `Condition` may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Regex,
    In,
    NotIn,
    GreaterThan,
    LessThan,
    Between,
    Exists,
    NotExists,
    Empty,
    NotEmpty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
    #[serde(default = "default_case_sensitive")]
    pub case_sensitive: bool,
}

fn default_case_sensitive() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Logic {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Allow,
    Deny,
    Transform {
        #[serde(default)]
        event_type: Option<String>,
        #[serde(default)]
        action: Option<String>,
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        add_tags: Vec<String>,
        #[serde(default)]
        set_metadata: HashMap<String, Value>,
    },
    Tag {
        tag: String,
    },
    Priority {
        value: Value,
    },
    Route {
        route: String,
        #[serde(default)]
        target_subscribers: Vec<String>,
    },
}

/// A compiled filter rule. Regex conditions are compiled once at
/// [`FilterEngine::add_rule`] time and cached in a side table keyed by
/// `(rule_id, field)`; an invalid pattern fails admission outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub id: String,
    pub logic: Logic,
    pub conditions: Vec<Condition>,
    pub priority: i64,
    pub enabled: bool,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone)]
pub struct FilterResult {
    pub allowed: bool,
    pub transformed: Event,
    pub actions: Vec<Action>,
    pub matched_rules: Vec<String>,
    pub metadata: HashMap<String, Value>,
}

impl FilterResult {
    fn passthrough(event: Event) -> Self {
        Self {
            allowed: true,
            transformed: event,
            actions: Vec::new(),
            matched_rules: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

fn field_value<'a>(event: &'a Event, field: &str) -> Option<Value> {
    if let Some(key) = field.strip_prefix("metadata.") {
        return event.metadata.get(key).cloned();
    }
    if let Some(key) = field.strip_prefix("payload.") {
        return match &event.payload {
            Value::Object(map) => map.get(key).cloned(),
            _ => None,
        };
    }
    match field {
        "id" => Some(Value::String(event.id.clone())),
        "type" => Some(Value::String(event.event_type.clone())),
        "action" => Some(Value::String(event.action.clone())),
        "source" => Some(Value::String(event.source.clone())),
        "version" => Some(Value::String(event.version.clone())),
        "repository" => event.repository.clone().map(Value::String),
        "session_id" => event.session_id.clone().map(Value::String),
        "user_id" => event.user_id.clone().map(Value::String),
        "client_id" => event.client_id.clone().map(Value::String),
        "correlation_id" => event.correlation_id.clone().map(Value::String),
        _ => None,
    }
}

fn as_str(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn eq_case(a: &str, b: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        a == b
    } else {
        a.eq_ignore_ascii_case(b)
    }
}

struct RegexCache {
    table: HashMap<(String, String), Regex>,
}

impl RegexCache {
    fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    fn insert(&mut self, rule_id: &str, field: &str, pattern: &str) -> Result<()> {
        let re = Regex::new(pattern)
            .map_err(|e| nervus_core::Error::Validation(format!("invalid regex: {}", e)))?;
        self.table
            .insert((rule_id.to_string(), field.to_string()), re);
        Ok(())
    }

    fn remove_rule(&mut self, rule_id: &str) {
        self.table.retain(|(rid, _), _| rid != rule_id);
    }

    fn get(&self, rule_id: &str, field: &str) -> Option<&Regex> {
        self.table.get(&(rule_id.to_string(), field.to_string()))
    }
}

/// Evaluates a single condition against an event. Never throws: an unknown
/// operator or unresolvable field evaluates to `false`.
fn evaluate_condition(event: &Event, rule_id: &str, cond: &Condition, regexes: &RegexCache) -> bool {
    let resolved = field_value(event, &cond.field);

    match cond.operator {
        Operator::Exists => resolved.is_some(),
        Operator::NotExists => resolved.is_none(),
        Operator::Empty => match &resolved {
            None => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::Array(a)) => a.is_empty(),
            Some(Value::Object(o)) => o.is_empty(),
            Some(Value::Null) => true,
            _ => false,
        },
        Operator::NotEmpty => !matches!(
            &resolved,
            None | Some(Value::Null)
        ) && match &resolved {
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
            _ => true,
        },
        _ => {
            let Some(actual) = resolved else { return false };
            match cond.operator {
                Operator::Equals => as_str(&actual)
                    .map(|a| eq_case(&a, &cond.value.to_string().trim_matches('"').to_string(), cond.case_sensitive))
                    .unwrap_or(actual == cond.value),
                Operator::NotEquals => !(as_str(&actual)
                    .map(|a| eq_case(&a, &cond.value.to_string().trim_matches('"').to_string(), cond.case_sensitive))
                    .unwrap_or(actual == cond.value)),
                Operator::Contains => match (&actual, &cond.value) {
                    (Value::String(s), Value::String(needle)) => {
                        if cond.case_sensitive {
                            s.contains(needle.as_str())
                        } else {
                            s.to_lowercase().contains(&needle.to_lowercase())
                        }
                    }
                    (Value::Array(items), needle) => items.contains(needle),
                    _ => false,
                },
                Operator::NotContains => match (&actual, &cond.value) {
                    (Value::String(s), Value::String(needle)) => {
                        if cond.case_sensitive {
                            !s.contains(needle.as_str())
                        } else {
                            !s.to_lowercase().contains(&needle.to_lowercase())
                        }
                    }
                    (Value::Array(items), needle) => !items.contains(needle),
                    _ => true,
                },
                Operator::StartsWith => match (as_str(&actual), as_str(&cond.value)) {
                    (Some(a), Some(b)) => {
                        if cond.case_sensitive {
                            a.starts_with(&b)
                        } else {
                            a.to_lowercase().starts_with(&b.to_lowercase())
                        }
                    }
                    _ => false,
                },
                Operator::EndsWith => match (as_str(&actual), as_str(&cond.value)) {
                    (Some(a), Some(b)) => {
                        if cond.case_sensitive {
                            a.ends_with(&b)
                        } else {
                            a.to_lowercase().ends_with(&b.to_lowercase())
                        }
                    }
                    _ => false,
                },
                Operator::Regex => {
                    let Some(re) = regexes.get(rule_id, &cond.field) else {
                        return false;
                    };
                    as_str(&actual).map(|a| re.is_match(&a)).unwrap_or(false)
                }
                Operator::In => match &cond.value {
                    Value::Array(items) => items.contains(&actual),
                    _ => false,
                },
                Operator::NotIn => match &cond.value {
                    Value::Array(items) => !items.contains(&actual),
                    _ => true,
                },
                Operator::GreaterThan => match (as_f64(&actual), as_f64(&cond.value)) {
                    (Some(a), Some(b)) => a > b,
                    _ => false,
                },
                Operator::LessThan => match (as_f64(&actual), as_f64(&cond.value)) {
                    (Some(a), Some(b)) => a < b,
                    _ => false,
                },
                Operator::Between => match (&cond.value, as_f64(&actual)) {
                    (Value::Array(bounds), Some(a)) if bounds.len() == 2 => {
                        match (as_f64(&bounds[0]), as_f64(&bounds[1])) {
                            (Some(lo), Some(hi)) => a >= lo && a <= hi,
                            _ => false,
                        }
                    }
                    _ => false,
                },
                Operator::Exists | Operator::NotExists | Operator::Empty | Operator::NotEmpty => {
                    unreachable!("handled above")
                }
            }
        }
    }
}

fn evaluate_logic(event: &Event, rule: &FilterRule, regexes: &RegexCache) -> bool {
    match rule.logic {
        Logic::And => rule
            .conditions
            .iter()
            .all(|c| evaluate_condition(event, &rule.id, c, regexes)),
        Logic::Or => rule
            .conditions
            .iter()
            .any(|c| evaluate_condition(event, &rule.id, c, regexes)),
        Logic::Not => !rule
            .conditions
            .iter()
            .any(|c| evaluate_condition(event, &rule.id, c, regexes)),
    }
}

fn apply_transform(
    event: &Event,
    event_type: &Option<String>,
    action: &Option<String>,
    source: &Option<String>,
    add_tags: &[String],
    set_metadata: &HashMap<String, Value>,
) -> Event {
    let mut cloned = event.clone();
    if let Some(t) = event_type {
        cloned.event_type = t.clone();
    }
    if let Some(a) = action {
        cloned.action = a.clone();
    }
    if let Some(s) = source {
        cloned.source = s.clone();
    }
    cloned.tags.extend(add_tags.iter().cloned());
    for (k, v) in set_metadata {
        cloned.metadata.insert(k.clone(), v.clone());
    }
    cloned
}

/// Registry of compiled rules plus their cached regex operands. Public
/// surface mirrors §4.B: `add_rule`/`remove_rule`/`get_rule`/`list_rules`,
/// `apply_filters`, `quick_filter`, `combine_filters`.
pub struct FilterEngine {
    rules: HashMap<String, FilterRule>,
    regexes: RegexCache,
}

impl Default for FilterEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterEngine {
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
            regexes: RegexCache::new(),
        }
    }

    /// Compiles any regex operands and admits the rule. Invalid regex
    /// fails admission; no partial state is left behind.
    pub fn add_rule(&mut self, rule: FilterRule) -> Result<()> {
        for cond in &rule.conditions {
            if cond.operator == Operator::Regex {
                if let Some(pattern) = cond.value.as_str() {
                    self.regexes.insert(&rule.id, &cond.field, pattern)?;
                } else {
                    return Err(nervus_core::Error::Validation(
                        "regex condition value must be a string".to_string(),
                    ));
                }
            }
        }
        self.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    pub fn remove_rule(&mut self, rule_id: &str) -> bool {
        self.regexes.remove_rule(rule_id);
        self.rules.remove(rule_id).is_some()
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<&FilterRule> {
        self.rules.get(rule_id)
    }

    pub fn list_rules(&self) -> Vec<&FilterRule> {
        let mut rules: Vec<&FilterRule> = self.rules.values().collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        rules
    }

    /// Evaluates enabled rules priority-descending, applying actions as
    /// they match. `deny` short-circuits: no later rule is evaluated.
    pub fn apply_filters(&self, event: &Event) -> FilterResult {
        let mut result = FilterResult::passthrough(event.clone());
        let mut rules: Vec<&FilterRule> = self.rules.values().filter(|r| r.enabled).collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        for rule in rules {
            if !evaluate_logic(&result.transformed, rule, &self.regexes) {
                continue;
            }
            result.matched_rules.push(rule.id.clone());
            let mut denied = false;
            for action in &rule.actions {
                result.actions.push(action.clone());
                match action {
                    Action::Allow => {}
                    Action::Deny => {
                        result.allowed = false;
                        denied = true;
                    }
                    Action::Transform {
                        event_type,
                        action: act,
                        source,
                        add_tags,
                        set_metadata,
                    } => {
                        result.transformed = apply_transform(
                            &result.transformed,
                            event_type,
                            act,
                            source,
                            add_tags,
                            set_metadata,
                        );
                    }
                    Action::Tag { tag } => {
                        result.transformed.tags.insert(tag.clone());
                    }
                    Action::Priority { value } => {
                        result
                            .transformed
                            .metadata
                            .insert("filter_priority".to_string(), value.clone());
                    }
                    Action::Route {
                        route,
                        target_subscribers,
                    } => {
                        result
                            .metadata
                            .insert("route".to_string(), Value::String(route.clone()));
                        result.metadata.insert(
                            "target_subscribers".to_string(),
                            Value::Array(
                                target_subscribers
                                    .iter()
                                    .map(|s| Value::String(s.clone()))
                                    .collect(),
                            ),
                        );
                    }
                }
                if denied {
                    break;
                }
            }
            if denied {
                break;
            }
        }
        result
    }

    /// Evaluates a single ad hoc [`nervus_core::Filter`] without consulting
    /// the rule table.
    pub fn quick_filter(&self, event: &Event, filter: &nervus_core::Filter) -> bool {
        filter.matches(event)
    }
}

/// AND-merges two value-object filters (§4.B).
pub fn combine_filters(a: &nervus_core::Filter, b: &nervus_core::Filter) -> nervus_core::Filter {
    a.combine(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mk_event(source: &str, event_type: &str, action: &str) -> Event {
        Event::new("e1", event_type, action, source, Value::Null).unwrap()
    }

    #[test]
    fn deny_short_circuits() {
        let mut engine = FilterEngine::new();
        engine
            .add_rule(FilterRule {
                id: "R1".to_string(),
                logic: Logic::And,
                conditions: vec![Condition {
                    field: "source".to_string(),
                    operator: Operator::Equals,
                    value: json!("banned"),
                    case_sensitive: true,
                }],
                priority: 10,
                enabled: true,
                actions: vec![Action::Deny],
            })
            .unwrap();
        engine
            .add_rule(FilterRule {
                id: "R2".to_string(),
                logic: Logic::And,
                conditions: vec![Condition {
                    field: "type".to_string(),
                    operator: Operator::Equals,
                    value: json!("custom"),
                    case_sensitive: true,
                }],
                priority: 5,
                enabled: true,
                actions: vec![Action::Tag {
                    tag: "seen".to_string(),
                }],
            })
            .unwrap();

        let event = mk_event("banned", "custom", "act");
        let result = engine.apply_filters(&event);
        assert!(!result.allowed);
        assert_eq!(result.matched_rules, vec!["R1".to_string()]);
        assert!(!result.transformed.tags.contains("seen"));
    }

    #[test]
    fn regex_operator_matches_pattern() {
        let mut engine = FilterEngine::new();
        engine
            .add_rule(FilterRule {
                id: "R1".to_string(),
                logic: Logic::And,
                conditions: vec![Condition {
                    field: "action".to_string(),
                    operator: Operator::Regex,
                    value: json!("^login_.*"),
                    case_sensitive: true,
                }],
                priority: 1,
                enabled: true,
                actions: vec![Action::Tag {
                    tag: "login".to_string(),
                }],
            })
            .unwrap();

        let matching = mk_event("s", "t", "login_ok");
        let not_matching = mk_event("s", "t", "logout");
        assert!(engine.apply_filters(&matching).transformed.tags.contains("login"));
        assert!(!engine.apply_filters(&not_matching).transformed.tags.contains("login"));
    }

    #[test]
    fn invalid_regex_fails_admission() {
        let mut engine = FilterEngine::new();
        let err = engine.add_rule(FilterRule {
            id: "R1".to_string(),
            logic: Logic::And,
            conditions: vec![Condition {
                field: "action".to_string(),
                operator: Operator::Regex,
                value: json!("(unterminated"),
                case_sensitive: true,
            }],
            priority: 1,
            enabled: true,
            actions: vec![],
        });
        assert!(err.is_err());
        assert!(engine.get_rule("R1").is_none());
    }

    #[test]
    fn unknown_field_never_panics() {
        let engine = FilterEngine::new();
        let event = mk_event("s", "t", "a");
        let cond = Condition {
            field: "metadata.nope".to_string(),
            operator: Operator::Equals,
            value: json!("x"),
            case_sensitive: true,
        };
        assert!(!evaluate_condition(&event, "rule", &cond, &engine.regexes));
    }

    #[test]
    fn combine_filters_is_most_restrictive() {
        let a = nervus_core::Filter {
            types: vec!["memory.update".to_string()],
            after: Some(10),
            ..Default::default()
        };
        let b = nervus_core::Filter {
            types: vec!["task.completed".to_string()],
            after: Some(20),
            ..Default::default()
        };
        let combined = combine_filters(&a, &b);
        assert_eq!(combined.types.len(), 2);
        assert_eq!(combined.after, Some(20));
    }
}
