// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! rumi-vocab
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// How to resolve two aliases of one group carrying different values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollisionStrategy {
    /// Keep the value seen first (canonical key before aliases).
    KeepFirst,
    /// Keep the value seen last.
    KeepLast,
    /// Fail the normalization.
    Raise,
    /// Collect all colliding values into a list.
    MergeList,
    /// Log a warning and keep the first value.
    #[default]
    Warn,
}

/// Raised by [`CollisionStrategy::Raise`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("vocabulary key collision on {key:?}")]
pub struct VocabKeyCollisionError {
    /// Canonical key the colliding aliases map to.
    pub key: String,
}

/// One change applied during normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// An alias was rewritten to its canonical key.
    Renamed {
        /// Alias as it appeared in the input.
        from: String,
        /// Canonical key it became.
        to: String,
    },
    /// Two aliases of one group carried different values.
    Collision {
        /// Canonical key the aliases map to.
        key: String,
        /// Strategy-specific description of the resolution.
        resolution: String,
    },
}

impl Change {
    /// Stable label, `COLLISION:<key>` for collisions.
    pub fn label(&self) -> String {
        match self {
            Self::Renamed { from, to } => format!("RENAMED:{from}->{to}"),
            Self::Collision { key, .. } => format!("COLLISION:{key}"),
        }
    }
}

/// Optional caller-supplied collision resolver: `(key, existing, new)` →
/// merged value. Takes precedence over the strategy.
pub type CollisionCallback<'a> = &'a dyn Fn(&str, &Value, &Value) -> Value;

/// Synonym groups and canonical-key normalization.
#[derive(Debug, Default, Clone)]
pub struct VocabRegistry {
    // alias → canonical
    canonical: BTreeMap<String, String>,
    // canonical → aliases in registration order (canonical first)
    groups: BTreeMap<String, Vec<String>>,
}

impl VocabRegistry {
    /// Empty registry: every key is its own canonical form.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synonym group. The first entry is the canonical key.
    pub fn register_group(&mut self, aliases: &[&str]) {
        let Some(canonical) = aliases.first() else {
            return;
        };
        let members: Vec<String> = aliases.iter().map(|a| a.to_string()).collect();
        for alias in &members {
            self.canonical.insert(alias.clone(), canonical.to_string());
        }
        self.groups.insert(canonical.to_string(), members);
    }

    /// Canonical form of a key (the key itself when unregistered).
    pub fn canonical_key<'a>(&'a self, key: &'a str) -> &'a str {
        self.canonical.get(key).map(String::as_str).unwrap_or(key)
    }

    /// Normalize a map's keys using the default [`CollisionStrategy::Warn`].
    pub fn normalize_keys(
        &self,
        data: &Map<String, Value>,
    ) -> Result<(Map<String, Value>, Vec<Change>), VocabKeyCollisionError> {
        self.normalize_keys_with(data, CollisionStrategy::default(), None)
    }

    /// Normalize a map's keys with an explicit strategy and optional
    /// callback resolver.
    ///
    /// Within a synonym group, the canonical key is considered before its
    /// aliases (in registration order), so "first" is deterministic whatever
    /// the input map's ordering. Unregistered keys pass through unchanged.
    pub fn normalize_keys_with(
        &self,
        data: &Map<String, Value>,
        strategy: CollisionStrategy,
        on_collision: Option<CollisionCallback<'_>>,
    ) -> Result<(Map<String, Value>, Vec<Change>), VocabKeyCollisionError> {
        let mut out = Map::new();
        let mut changes = Vec::new();

        for key in self.visit_order(data) {
            let value = &data[&key];
            let canonical = self.canonical_key(&key).to_string();
            if canonical != key {
                changes.push(Change::Renamed {
                    from: key.clone(),
                    to: canonical.clone(),
                });
            }
            match out.get(&canonical) {
                None => {
                    out.insert(canonical, value.clone());
                }
                Some(existing) if existing == value => {}
                Some(existing) => {
                    let resolved = if let Some(callback) = on_collision {
                        changes.push(Change::Collision {
                            key: canonical.clone(),
                            resolution: "callback".to_string(),
                        });
                        callback(&canonical, existing, value)
                    } else {
                        match strategy {
                            CollisionStrategy::Raise => {
                                return Err(VocabKeyCollisionError { key: canonical });
                            }
                            CollisionStrategy::KeepFirst => {
                                changes.push(Change::Collision {
                                    key: canonical.clone(),
                                    resolution: "keep_first".to_string(),
                                });
                                existing.clone()
                            }
                            CollisionStrategy::KeepLast => {
                                changes.push(Change::Collision {
                                    key: canonical.clone(),
                                    resolution: "keep_last".to_string(),
                                });
                                value.clone()
                            }
                            CollisionStrategy::MergeList => {
                                changes.push(Change::Collision {
                                    key: canonical.clone(),
                                    resolution: "merge_list".to_string(),
                                });
                                merge_into_list(existing, value)
                            }
                            CollisionStrategy::Warn => {
                                warn!(
                                    target: "rumi.vocab",
                                    key = %canonical,
                                    "vocabulary key collision, keeping first value"
                                );
                                changes.push(Change::Collision {
                                    key: canonical.clone(),
                                    resolution: "warn_keep_first".to_string(),
                                });
                                existing.clone()
                            }
                        }
                    };
                    out.insert(canonical, resolved);
                }
            }
        }
        Ok((out, changes))
    }

    // Canonical members first (in registration order), then everything else
    // in the map's own order.
    fn visit_order(&self, data: &Map<String, Value>) -> Vec<String> {
        let mut order = Vec::with_capacity(data.len());
        for members in self.groups.values() {
            for member in members {
                if data.contains_key(member) {
                    order.push(member.clone());
                }
            }
        }
        for key in data.keys() {
            if !order.contains(key) {
                order.push(key.clone());
            }
        }
        order
    }
}

fn merge_into_list(existing: &Value, new: &Value) -> Value {
    let mut items = match existing {
        Value::Array(a) => a.clone(),
        other => vec![other.clone()],
    };
    items.push(new.clone());
    Value::Array(items)
}
