//! Audit log: a bounded record of every mutation a pipeline run performs.
//!
//! The log is a ring of at most `max_entries` items; on overflow the oldest
//! 20% are dropped in one batch so appends stay cheap.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Decision,
    Error,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Decision => "decision",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub actor: String,
    pub target: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct AuditLog {
    max_entries: usize,
    entries: Vec<AuditEntry>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(Self::MAX_ENTRIES)
    }
}

impl AuditLog {
    pub const MAX_ENTRIES: usize = 500;

    pub fn new(max_entries: usize) -> Self {
        Self { max_entries, entries: Vec::new() }
    }

    pub fn log(
        &mut self,
        action: AuditAction,
        actor: &str,
        target: &str,
        old_value: Option<Value>,
        new_value: Option<Value>,
        reason: Option<String>,
    ) {
        if self.entries.len() >= self.max_entries {
            let remove_count = self.max_entries / 5;
            self.entries.drain(..remove_count);
            tracing::debug!("[audit] dropped {} oldest entries", remove_count);
        }

        if matches!(action, AuditAction::Error | AuditAction::Decision) {
            tracing::info!("[audit] {}: {} -> {}", action.as_str(), actor, target);
        }

        self.entries.push(AuditEntry {
            action,
            actor: actor.to_string(),
            target: target.to_string(),
            old_value: old_value.map(summarize),
            new_value: new_value.map(summarize),
            reason,
            timestamp: Utc::now(),
        });
    }

    pub fn log_create(&mut self, actor: &str, target: &str, value: Value) {
        self.log(AuditAction::Create, actor, target, None, Some(value), None);
    }

    pub fn log_update(&mut self, actor: &str, target: &str, old: Value, new: Value) {
        self.log(AuditAction::Update, actor, target, Some(old), Some(new), None);
    }

    pub fn log_decision(&mut self, actor: &str, target: &str, value: Value, method: &str) {
        self.log(AuditAction::Decision, actor, target, None, Some(value), Some(method.to_string()));
    }

    pub fn log_error(&mut self, actor: &str, target: &str, error: &str) {
        self.log(
            AuditAction::Error,
            actor,
            target,
            None,
            Some(Value::String(error.to_string())),
            None,
        );
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn by_action(&self, action: AuditAction) -> Vec<&AuditEntry> {
        self.entries.iter().filter(|e| e.action == action).collect()
    }

    pub fn by_target(&self, target: &str) -> Vec<&AuditEntry> {
        self.entries.iter().filter(|e| e.target.contains(target)).collect()
    }

    pub fn error_count(&self) -> usize {
        self.by_action(AuditAction::Error).len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Keep audit entries small: long strings and big collections are replaced
/// by short descriptions.
fn summarize(value: Value) -> Value {
    match value {
        Value::String(s) if s.chars().count() > 200 => {
            let prefix: String = s.chars().take(200).collect();
            Value::String(format!("{}...", prefix))
        },
        Value::Array(items) if items.len() > 10 => Value::String(format!("[{} items]", items.len())),
        Value::Object(map) if map.len() > 20 => {
            Value::String(format!("{{object with {} keys}}", map.len()))
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_overflow_drops_oldest_fifth() {
        let mut log = AuditLog::new(10);
        for i in 0..10 {
            log.log_create("test", &format!("target:{}", i), json!(i));
        }
        assert_eq!(log.len(), 10);

        // 11th entry triggers a 20% drop (2 entries), then appends
        log.log_create("test", "target:10", json!(10));
        assert_eq!(log.len(), 9);
        assert_eq!(log.entries()[0].target, "target:2");
    }

    #[test]
    fn test_bounded_at_max() {
        let mut log = AuditLog::default();
        for i in 0..600 {
            log.log_create("agent", &format!("field:{}", i), json!(i));
        }
        assert!(log.len() <= AuditLog::MAX_ENTRIES);
    }

    #[test]
    fn test_summarize_large_values() {
        let mut log = AuditLog::default();
        log.log_create("parser", "parsed_data", json!("x".repeat(500)));

        let entry = &log.entries()[0];
        let summarized = entry.new_value.as_ref().unwrap().as_str().unwrap();
        assert!(summarized.len() < 250);
        assert!(summarized.ends_with("..."));
    }

    #[test]
    fn test_filters() {
        let mut log = AuditLog::default();
        log.log_decision("decision_manager", "decision:name", json!("Kim"), "unanimous");
        log.log_error("system", "stage:parsing", "boom");

        assert_eq!(log.by_action(AuditAction::Decision).len(), 1);
        assert_eq!(log.error_count(), 1);
        assert_eq!(log.by_target("stage:").len(), 1);
    }
}
