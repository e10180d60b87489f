//! Host state capture, diffing, and restore.
//!
//! The engine never inspects host state itself; it consumes a
//! [`StateProvider`] supplied by the embedding application. Snapshots feed
//! two features: before/after diffs on every dispatched command, and
//! transaction rollback.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// How much of the host state to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetailLevel {
    /// Entity names only.
    Summary,
    /// Names plus primary properties.
    Standard,
    /// Everything the provider can see.
    Full,
}

impl DetailLevel {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Standard => "standard",
            Self::Full => "full",
        }
    }
}

impl Default for DetailLevel {
    fn default() -> Self {
        Self::Standard
    }
}

impl std::fmt::Display for DetailLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// A captured copy of relevant host state.
///
/// Held entirely in process memory; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// When the snapshot was taken.
    pub captured_at: DateTime<Utc>,
    /// Detail level the provider captured at.
    pub detail: DetailLevel,
    /// Named host entities and their captured properties.
    pub entities: BTreeMap<String, Value>,
    /// Host-global settings (active scene, current frame, modes).
    #[serde(default)]
    pub globals: Value,
}

impl StateSnapshot {
    /// Creates an empty snapshot at the given detail level.
    #[must_use]
    pub fn empty(detail: DetailLevel) -> Self {
        Self {
            captured_at: Utc::now(),
            detail,
            entities: BTreeMap::new(),
            globals: Value::Null,
        }
    }

    /// Returns the number of captured entities.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}

/// Entities that changed between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    /// Entities present after but not before.
    pub added: Vec<String>,
    /// Entities present before but not after.
    pub removed: Vec<String>,
    /// Entities present in both with different captured properties.
    pub modified: Vec<String>,
}

impl ChangeSet {
    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// Returns the total number of changed entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }
}

/// Host state collaborator contract.
///
/// Implementations are called on the apply thread only; they do not need
/// internal locking against the engine, though they may be read from other
/// threads by the host itself.
pub trait StateProvider: Send + Sync {
    /// Captures the current host state.
    ///
    /// # Errors
    ///
    /// Returns an error if the host state cannot be read.
    fn capture(&self, detail: DetailLevel) -> Result<StateSnapshot>;

    /// Computes which entities changed between two snapshots.
    ///
    /// The default implementation compares the entity maps by name and
    /// captured value.
    fn diff(&self, before: &StateSnapshot, after: &StateSnapshot) -> ChangeSet {
        let mut changes = ChangeSet::default();
        for (name, value) in &after.entities {
            match before.entities.get(name) {
                None => changes.added.push(name.clone()),
                Some(previous) if previous != value => changes.modified.push(name.clone()),
                Some(_) => {}
            }
        }
        for name in before.entities.keys() {
            if !after.entities.contains_key(name) {
                changes.removed.push(name.clone());
            }
        }
        changes
    }

    /// Restores the host to a previously captured snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the host state could not be restored.
    fn restore(&self, snapshot: &StateSnapshot) -> Result<()>;
}

/// A provider for hosts without state capture: empty snapshots, trivial
/// restore.
#[derive(Debug, Default)]
pub struct NullStateProvider;

impl StateProvider for NullStateProvider {
    fn capture(&self, detail: DetailLevel) -> Result<StateSnapshot> {
        Ok(StateSnapshot::empty(detail))
    }

    fn restore(&self, _snapshot: &StateSnapshot) -> Result<()> {
        Ok(())
    }
}

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("state provider lock poisoned")
}

/// An in-memory entity table implementing [`StateProvider`].
///
/// Suitable for tests and for hosts whose state already lives in a plain
/// entity map. Handlers mutate the table through
/// [`MemoryStateProvider::insert`]/[`MemoryStateProvider::remove`]; capture
/// clones it, restore replaces it wholesale.
#[derive(Debug, Default)]
pub struct MemoryStateProvider {
    entities: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStateProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the table lock is poisoned.
    pub fn insert(&self, name: impl Into<String>, value: Value) -> Result<()> {
        let mut entities = self.entities.write().map_err(poison_err)?;
        entities.insert(name.into(), value);
        Ok(())
    }

    /// Removes an entity, returning true if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the table lock is poisoned.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let mut entities = self.entities.write().map_err(poison_err)?;
        Ok(entities.remove(name).is_some())
    }

    /// Returns a copy of an entity's captured value.
    ///
    /// # Errors
    ///
    /// Returns an error if the table lock is poisoned.
    pub fn get(&self, name: &str) -> Result<Option<Value>> {
        let entities = self.entities.read().map_err(poison_err)?;
        Ok(entities.get(name).cloned())
    }

    /// Returns true if an entity exists under the name.
    ///
    /// # Errors
    ///
    /// Returns an error if the table lock is poisoned.
    pub fn contains(&self, name: &str) -> Result<bool> {
        let entities = self.entities.read().map_err(poison_err)?;
        Ok(entities.contains_key(name))
    }

    /// Returns the number of entities.
    ///
    /// # Errors
    ///
    /// Returns an error if the table lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let entities = self.entities.read().map_err(poison_err)?;
        Ok(entities.len())
    }

    /// Returns true if the table is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the table lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl StateProvider for MemoryStateProvider {
    fn capture(&self, detail: DetailLevel) -> Result<StateSnapshot> {
        let entities = self.entities.read().map_err(poison_err)?;
        let captured = match detail {
            // Summary keeps names only.
            DetailLevel::Summary => entities
                .keys()
                .map(|name| (name.clone(), Value::Null))
                .collect(),
            DetailLevel::Standard | DetailLevel::Full => entities.clone(),
        };
        drop(entities);

        Ok(StateSnapshot {
            captured_at: Utc::now(),
            detail,
            entities: captured,
            globals: Value::Null,
        })
    }

    fn restore(&self, snapshot: &StateSnapshot) -> Result<()> {
        let mut entities = self.entities.write().map_err(poison_err)?;
        *entities = snapshot.entities.clone();
        Ok(())
    }
}
