//! Recording of entity update notifications.
//!
//! The [`UpdateJournal`] keeps every add/update/remove notification a
//! registry emits, in order, with the serialized old and new states. It is
//! attached to a registry as an ordinary listener and is meant for
//! diagnostics and tests.
//!
//! # Example
//!
//! ```
//! use strata_ecs::prelude::*;
//! # #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
//! # struct Tag { id: String }
//! # impl ComponentData for Tag {
//! #     fn id(&self) -> &str { &self.id }
//! #     fn kind(&self) -> &'static str { "tag" }
//! #     fn with_id(&self, id: &str) -> Self { Tag { id: id.to_owned() } }
//! # }
//!
//! let mut registry = EntityRegistry::<EntityData<Tag>>::in_memory();
//! let (journal, _listener) = UpdateJournal::attach(&mut registry).unwrap();
//!
//! registry.add(EntityData::new("a", "A")).unwrap();
//! let _ = registry.update(EntityData::new("a", "Renamed")).unwrap();
//!
//! let journal = journal.lock();
//! assert_eq!(journal.len(), 2);
//! assert_eq!(journal.of_kind(UpdateKind::Update).count(), 1);
//! ```

use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::registry::{EntityRegistry, ListenerId, UpdateKind};
use crate::EcsError;

// ---------------------------------------------------------------------------
// EntityUpdate
// ---------------------------------------------------------------------------

/// One recorded notification.
///
/// - **Add**: `old` is `None`, `new` is `Some`.
/// - **Update**: both are `Some`.
/// - **Remove**: `old` is `Some`, `new` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    /// Position in the journal, starting at 0.
    pub sequence: u64,
    /// The entity the notification was about.
    pub entity_id: String,
    /// What happened.
    pub kind: UpdateKind,
    /// Serialized state before the change.
    pub old: Option<serde_json::Value>,
    /// Serialized state after the change.
    pub new: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// UpdateJournal
// ---------------------------------------------------------------------------

/// Ordered log of [`EntityUpdate`] entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateJournal {
    updates: Vec<EntityUpdate>,
    next_sequence: u64,
}

impl UpdateJournal {
    /// An empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a new shared journal to `registry`.
    pub fn attach<T: Entity>(
        registry: &mut EntityRegistry<T>,
    ) -> Result<(Arc<Mutex<Self>>, ListenerId), EcsError> {
        let journal = Arc::new(Mutex::new(Self::new()));
        let sink = Arc::clone(&journal);
        let listener = registry.subscribe(move |handle, kind, old, new| {
            let old = old
                .map(|e| serde_json::to_value(&**e))
                .transpose()
                .with_context(|| format!("serializing old state of '{}'", handle.id()))?;
            let new = new
                .map(|e| serde_json::to_value(&**e))
                .transpose()
                .with_context(|| format!("serializing new state of '{}'", handle.id()))?;
            sink.lock().record(handle.id(), kind, old, new);
            Ok(())
        })?;
        Ok((journal, listener))
    }

    /// Append an entry and return its sequence number.
    pub fn record(
        &mut self,
        entity_id: &str,
        kind: UpdateKind,
        old: Option<serde_json::Value>,
        new: Option<serde_json::Value>,
    ) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.updates.push(EntityUpdate {
            sequence,
            entity_id: entity_id.to_owned(),
            kind,
            old,
            new,
        });
        sequence
    }

    /// Drop every entry. Sequence numbers keep counting.
    pub fn clear(&mut self) {
        self.updates.clear();
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    /// Whether the journal is empty.
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// All entries in order.
    pub fn all(&self) -> &[EntityUpdate] {
        &self.updates
    }

    /// Entries about `entity_id`.
    pub fn for_entity<'a>(&'a self, entity_id: &'a str) -> impl Iterator<Item = &'a EntityUpdate> {
        self.updates.iter().filter(move |u| u.entity_id == entity_id)
    }

    /// Entries of one kind.
    pub fn of_kind(&self, kind: UpdateKind) -> impl Iterator<Item = &EntityUpdate> {
        self.updates.iter().filter(move |u| u.kind == kind)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
