//! Routing vocabulary shared by the dispatcher and the conductor.
//!
//! A [`RoutingTable`] maps each logical task kind found in manifests to the
//! concrete task name a metal worker or a cloud worker understands. Kinds
//! missing from the table are rejected instead of being submitted verbatim.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ConductorError, Result};

/// How the conductor chooses a destination for each backlog entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Fill the metal queue first, spill over to cloud within budget.
    #[default]
    HybridSupervisor,
    ForceMetal,
    ForceCloud,
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingStrategy::HybridSupervisor => write!(f, "hybrid_supervisor"),
            RoutingStrategy::ForceMetal => write!(f, "force_metal"),
            RoutingStrategy::ForceCloud => write!(f, "force_cloud"),
        }
    }
}

/// One of the two worker pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Metal,
    Cloud,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Metal => write!(f, "metal"),
            Destination::Cloud => write!(f, "cloud"),
        }
    }
}

/// Worker-specific task names for one logical kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskVariants {
    pub metal: String,
    pub cloud: String,
}

impl TaskVariants {
    pub fn new(metal: impl Into<String>, cloud: impl Into<String>) -> Self {
        Self {
            metal: metal.into(),
            cloud: cloud.into(),
        }
    }

    /// Same task name on both pools.
    pub fn identity(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            metal: name.clone(),
            cloud: name,
        }
    }

    fn for_destination(&self, destination: Destination) -> &str {
        match destination {
            Destination::Metal => &self.metal,
            Destination::Cloud => &self.cloud,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingTable {
    kinds: BTreeMap<String, TaskVariants>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.insert(
            "tasks.rag.process_batch",
            TaskVariants::new(
                "tasks.rag.process_batch_ollama",
                "tasks.rag.process_batch_gemini",
            ),
        );
        for name in [
            "tasks.debug_task",
            "tasks.sleep_task",
            "tasks.fast_crud_task",
            "tasks.sleep_crud_task",
        ] {
            table.insert(name, TaskVariants::identity(name));
        }
        table
    }
}

impl RoutingTable {
    pub fn empty() -> Self {
        Self {
            kinds: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, kind: impl Into<String>, variants: TaskVariants) {
        self.kinds.insert(kind.into(), variants);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Resolve a logical task kind to the task name submitted to `destination`.
    pub fn resolve(&self, kind: &str, destination: Destination) -> Result<&str> {
        self.kinds
            .get(kind)
            .map(|variants| variants.for_destination(destination))
            .ok_or_else(|| ConductorError::UnknownTaskKind(kind.to_string()))
    }

    /// Rejects blank kinds and blank variant names.
    pub fn validate(&self) -> Result<()> {
        if self.kinds.is_empty() {
            return Err(ConductorError::Config(
                "routing table must declare at least one task kind".into(),
            ));
        }
        for (kind, variants) in &self.kinds {
            if kind.trim().is_empty() {
                return Err(ConductorError::Config(
                    "routing table contains an empty task kind".into(),
                ));
            }
            if variants.metal.trim().is_empty() || variants.cloud.trim().is_empty() {
                return Err(ConductorError::Config(format!(
                    "routing entry `{kind}` must name both a metal and a cloud variant"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_rewrites_rag_batches() {
        let table = RoutingTable::default();
        assert_eq!(
            table
                .resolve("tasks.rag.process_batch", Destination::Metal)
                .unwrap(),
            "tasks.rag.process_batch_ollama"
        );
        assert_eq!(
            table
                .resolve("tasks.rag.process_batch", Destination::Cloud)
                .unwrap(),
            "tasks.rag.process_batch_gemini"
        );
    }

    #[test]
    fn identity_kinds_keep_their_name() {
        let table = RoutingTable::default();
        assert_eq!(
            table.resolve("tasks.debug_task", Destination::Cloud).unwrap(),
            "tasks.debug_task"
        );
    }

    #[test]
    fn unknown_kind_fails_fast() {
        let table = RoutingTable::default();
        let err = table
            .resolve("tasks.nope", Destination::Metal)
            .unwrap_err();
        assert!(matches!(err, ConductorError::UnknownTaskKind(kind) if kind == "tasks.nope"));
    }

    #[test]
    fn validate_rejects_blank_variant() {
        let mut table = RoutingTable::empty();
        table.insert("tasks.x", TaskVariants::new("tasks.x_local", " "));
        assert!(table.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_table() {
        assert!(RoutingTable::empty().validate().is_err());
        assert!(RoutingTable::default().validate().is_ok());
    }

    #[test]
    fn strategy_serde_names() {
        let s: RoutingStrategy = serde_json::from_str("\"force_cloud\"").unwrap();
        assert_eq!(s, RoutingStrategy::ForceCloud);
        assert_eq!(
            serde_json::to_string(&RoutingStrategy::HybridSupervisor).unwrap(),
            "\"hybrid_supervisor\""
        );
        assert!(serde_json::from_str::<RoutingStrategy>("\"round_robin\"").is_err());
    }

    #[test]
    fn table_deserializes_from_toml_map() {
        let table: RoutingTable = toml::from_str(
            r#"
            ["tasks.summarize"]
            metal = "tasks.summarize_llama"
            cloud = "tasks.summarize_gemini"
            "#,
        )
        .unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.resolve("tasks.summarize", Destination::Metal).unwrap(),
            "tasks.summarize_llama"
        );
    }

    #[test]
    fn destination_names_match_log_fields() {
        assert_eq!(Destination::Metal.to_string(), "metal");
        assert_eq!(Destination::Cloud.to_string(), "cloud");
    }
}
