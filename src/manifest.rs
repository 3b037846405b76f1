use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ConductorError, Result};

fn default_priority() -> i64 {
    10
}

/// One task descriptor, as written by planning tooling and stored in the backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Logical task kind; rewritten to a pool-specific name at routing time.
    pub task: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
    /// Older manifests carry a top-level description instead of `meta`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Carried through, never consulted: the backlog drains FIFO.
    #[serde(default = "default_priority")]
    pub priority: i64,
}

impl ManifestEntry {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            meta: Map::new(),
            description: None,
            priority: default_priority(),
        }
    }

    /// Parses and validates one manifest line or backlog payload.
    pub fn parse(raw: &str) -> Result<Self> {
        let entry: ManifestEntry = serde_json::from_str(raw)
            .map_err(|e| ConductorError::MalformedEntry(e.to_string()))?;
        entry.validate()?;
        Ok(entry)
    }

    pub fn validate(&self) -> Result<()> {
        if self.task.trim().is_empty() {
            return Err(ConductorError::MalformedEntry(
                "task name must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Human-readable label used in the execution log.
    pub fn label(&self) -> String {
        for key in ["id", "description"] {
            match self.meta.get(key) {
                Some(Value::String(s)) if !s.is_empty() => return s.clone(),
                Some(Value::Number(n)) => return n.to_string(),
                _ => {}
            }
        }
        match &self.description {
            Some(d) if !d.is_empty() => d.clone(),
            _ => "Unknown".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_applies_defaults() {
        let entry = ManifestEntry::parse(r#"{"task": "tasks.debug_task"}"#).unwrap();
        assert_eq!(entry.task, "tasks.debug_task");
        assert!(entry.args.is_empty());
        assert!(entry.kwargs.is_empty());
        assert_eq!(entry.priority, 10);
        assert_eq!(entry.label(), "Unknown");
    }

    #[test]
    fn parse_rejects_blank_task() {
        let err = ManifestEntry::parse(r#"{"task": "  "}"#).unwrap_err();
        assert!(matches!(err, ConductorError::MalformedEntry(_)));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            ManifestEntry::parse("{not json"),
            Err(ConductorError::MalformedEntry(_))
        ));
        assert!(matches!(
            ManifestEntry::parse(r#"{"args": [1]}"#),
            Err(ConductorError::MalformedEntry(_))
        ));
    }

    #[test]
    fn label_prefers_meta_id() {
        let entry = ManifestEntry::parse(
            r#"{"task": "t", "meta": {"id": "Task-07", "description": "seventh"}, "description": "legacy"}"#,
        )
        .unwrap();
        assert_eq!(entry.label(), "Task-07");
    }

    #[test]
    fn label_falls_back_to_legacy_description() {
        let entry =
            ManifestEntry::parse(r#"{"task": "t", "description": "Debug echo 3"}"#).unwrap();
        assert_eq!(entry.label(), "Debug echo 3");
    }

    #[test]
    fn payload_keeps_args_and_kwargs() {
        let mut entry = ManifestEntry::new("tasks.rag.process_batch");
        entry.args = vec![json!(1), json!("chapter-2")];
        entry.kwargs.insert("seconds".into(), json!(3));
        let back = ManifestEntry::parse(&entry.to_payload().unwrap()).unwrap();
        assert_eq!(back, entry);
    }
}
