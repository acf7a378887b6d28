//! Flat namespace over many servers, with conflict resolution.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::ConflictResolution;
use crate::error::{McpError, Result};
use crate::types::{McpPrompt, McpResource, McpTool};

/// A capability that can be exposed under another name.
pub trait Exposable: Clone + Send + Sync + 'static {
    /// The name the owning server knows it by.
    fn local_name(&self) -> &str;

    fn exposed_as(&self, exposed: &str) -> Self;
}

impl Exposable for McpTool {
    fn local_name(&self) -> &str {
        &self.name
    }

    fn exposed_as(&self, exposed: &str) -> Self {
        Self {
            name: exposed.to_string(),
            ..self.clone()
        }
    }
}

impl Exposable for McpPrompt {
    fn local_name(&self) -> &str {
        &self.name
    }

    fn exposed_as(&self, exposed: &str) -> Self {
        Self {
            name: exposed.to_string(),
            ..self.clone()
        }
    }
}

/// Resources are keyed by URI.
impl Exposable for McpResource {
    fn local_name(&self) -> &str {
        &self.uri
    }

    fn exposed_as(&self, exposed: &str) -> Self {
        Self {
            uri: exposed.to_string(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry<T> {
    pub capability: T,
    pub server: String,
    pub original_name: String,
    pub exposed_name: String,
    pub registered_at: DateTime<Utc>,
}

/// A finished, read-only namespace for one capability kind.
#[derive(Debug, Clone)]
pub struct CapabilityRegistry<T> {
    entries: HashMap<String, RegistryEntry<T>>,
    order: Vec<String>,
    conflicts: usize,
}

impl<T> Default for CapabilityRegistry<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            conflicts: 0,
        }
    }
}

impl<T: Exposable> CapabilityRegistry<T> {
    pub fn get(&self, exposed: &str) -> Option<&RegistryEntry<T>> {
        self.entries.get(exposed)
    }

    /// Entries in registration order.
    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry<T>> {
        self.order.iter().filter_map(|name| self.entries.get(name))
    }

    /// Capabilities under their exposed names, in registration order.
    pub fn capabilities(&self) -> Vec<T> {
        self.entries()
            .map(|entry| entry.capability.exposed_as(&entry.exposed_name))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn conflicts(&self) -> usize {
        self.conflicts
    }
}

/// Accumulates registrations; the registry only exists once `build` runs.
pub struct RegistryBuilder<T> {
    strategy: ConflictResolution,
    registry: CapabilityRegistry<T>,
}

impl<T: Exposable> RegistryBuilder<T> {
    pub fn new(strategy: ConflictResolution) -> Self {
        Self {
            strategy,
            registry: CapabilityRegistry::default(),
        }
    }

    /// Register `capability` from `server`. Returns the exposed name, or
    /// `None` when the capability was skipped.
    pub fn register(&mut self, server: &str, capability: T) -> Result<Option<String>> {
        let original = capability.local_name().to_string();

        let exposed = match self.registry.entries.get(&original) {
            None => original.clone(),
            Some(existing) => {
                self.registry.conflicts += 1;
                let existing_server = existing.server.clone();
                match self.strategy {
                    ConflictResolution::Error => {
                        return Err(McpError::Conflict {
                            name: original,
                            existing_server,
                            server: server.to_string(),
                        });
                    }
                    ConflictResolution::FirstWins => {
                        debug!(
                            "'{}' from '{}' shadowed by '{}', skipping",
                            original, server, existing_server
                        );
                        return Ok(None);
                    }
                    ConflictResolution::Prefix => {
                        let renamed = format!("{}.{}", server, original);
                        if self.registry.entries.contains_key(&renamed) {
                            warn!("'{}' is already registered, skipping", renamed);
                            return Ok(None);
                        }
                        debug!(
                            "'{}' from '{}' conflicts with '{}', exposing as '{}'",
                            original, server, existing_server, renamed
                        );
                        renamed
                    }
                }
            }
        };

        self.registry.order.push(exposed.clone());
        self.registry.entries.insert(
            exposed.clone(),
            RegistryEntry {
                capability,
                server: server.to_string(),
                original_name: original,
                exposed_name: exposed.clone(),
                registered_at: Utc::now(),
            },
        );
        Ok(Some(exposed))
    }

    pub fn conflicts(&self) -> usize {
        self.registry.conflicts
    }

    pub fn build(self) -> CapabilityRegistry<T> {
        self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{resource, tool};

    #[test]
    fn test_prefix_renames_later_duplicate() {
        let mut builder = RegistryBuilder::new(ConflictResolution::Prefix);
        assert_eq!(
            builder.register("fs", tool("query", "fs")).unwrap().as_deref(),
            Some("query")
        );
        assert_eq!(
            builder.register("db", tool("query", "db")).unwrap().as_deref(),
            Some("db.query")
        );
        let registry = builder.build();

        assert_eq!(registry.conflicts(), 1);
        let entry = registry.get("db.query").unwrap();
        assert_eq!(entry.server, "db");
        assert_eq!(entry.original_name, "query");
        let names: Vec<String> = registry.capabilities().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["query", "db.query"]);
    }

    #[test]
    fn test_first_wins_skips_later_duplicate() {
        let mut builder = RegistryBuilder::new(ConflictResolution::FirstWins);
        builder.register("fs", tool("query", "fs")).unwrap();
        assert_eq!(builder.register("db", tool("query", "db")).unwrap(), None);
        let registry = builder.build();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.conflicts(), 1);
        assert_eq!(registry.get("query").unwrap().server, "fs");
    }

    #[test]
    fn test_error_strategy_refuses_duplicate() {
        let mut builder = RegistryBuilder::new(ConflictResolution::Error);
        builder.register("fs", tool("query", "fs")).unwrap();
        match builder.register("db", tool("query", "db")) {
            Err(McpError::Conflict {
                name,
                existing_server,
                server,
            }) => {
                assert_eq!(name, "query");
                assert_eq!(existing_server, "fs");
                assert_eq!(server, "db");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(builder.conflicts(), 1);
        assert!(builder.build().get("db.query").is_none());
    }

    #[test]
    fn test_resources_conflict_on_uri() {
        let mut builder = RegistryBuilder::new(ConflictResolution::Prefix);
        builder.register("a", resource("file:///x", "x")).unwrap();
        builder.register("b", resource("file:///x", "x")).unwrap();
        let registry = builder.build();
        let uris: Vec<String> = registry.capabilities().into_iter().map(|r| r.uri).collect();
        assert_eq!(uris, vec!["file:///x", "b.file:///x"]);
    }
}
