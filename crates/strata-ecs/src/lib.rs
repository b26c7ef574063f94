//! Strata ECS -- entity registry with template/variant persistence.
//!
//! Entities are hierarchical, component-bearing snapshots. Any entity may be
//! declared a *variant* of a template entity; on disk it then stores only the
//! structural delta against its (fully composed) template. When a template
//! changes, the registry recomposes every variant from the template's current
//! state and propagates the update transitively down the template chain.
//!
//! The crate is organised leaf-first:
//!
//! - [`entity`]: data contracts ([`Entity`](entity::Entity),
//!   [`ComponentData`](entity::ComponentData), the ready-made
//!   [`EntityData`](entity::EntityData)).
//! - [`pose`]: local/global transforms.
//! - [`store`]: where documents physically live (directory or memory).
//! - [`templates`]: the template I/O layer (save, compose, lazy load).
//! - [`registry`]: the live entity graph, variant index and update fan-out.
//! - [`hierarchy`]: parent/child and subtree-variant helpers.
//! - [`journal`]: a recording listener for update notifications.
//! - [`coalesce`]: per-id last-writer-wins background job queue.
//!
//! # Quick Start
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use strata_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
//! struct Size { id: String, size: u32 }
//!
//! impl ComponentData for Size {
//!     fn id(&self) -> &str { &self.id }
//!     fn kind(&self) -> &'static str { "size" }
//!     fn with_id(&self, id: &str) -> Self { Self { id: id.to_owned(), ..self.clone() } }
//! }
//!
//! let mut registry = EntityRegistry::<EntityData<Size>>::in_memory();
//! let template = EntityData::new("A", "Box").with_component(Size { id: "A".into(), size: 1 });
//! registry.add(template).unwrap();
//!
//! let variant = registry.create_variant_of("A").unwrap();
//! let variant_id = variant.id().to_owned();
//!
//! let mut edited = (*registry.get_entity("A").unwrap().data().unwrap()).clone();
//! edited.components.get_mut("A").unwrap().size = 2;
//! let _write = registry.update(edited).unwrap();
//!
//! let composed = registry.get_entity(&variant_id).unwrap().data().unwrap();
//! assert_eq!(composed.components[&variant_id].size, 2);
//! ```

#![deny(unsafe_code)]

pub mod coalesce;
pub mod config;
pub mod entity;
pub mod hierarchy;
pub mod ids;
pub mod journal;
pub mod pose;
pub mod registry;
pub mod store;
pub mod templates;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by registry, template and storage operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// An entity with this id is already registered.
    #[error("entity '{id}' is already registered")]
    DuplicateId { id: String },

    /// The entity (or its stored document) does not exist.
    #[error("entity '{id}' not found")]
    NotFound { id: String },

    /// The operation is not valid for the current graph state.
    #[error("invalid operation: {reason}")]
    InvalidOperation { reason: String },

    /// A composed document does not survive a deserialize/serialize round
    /// trip, i.e. the entity type silently drops fields.
    #[error("entity '{id}' does not round-trip through its type, residual delta: {residual}")]
    RoundTripMismatch { id: String, residual: String },

    /// The registry, template store or entity handle has been disposed.
    #[error("{what} has been disposed")]
    Disposed { what: String },

    /// The template chain is deeper than allowed (or contains a cycle).
    #[error("template chain of '{id}' exceeds the maximum depth of {max}")]
    TemplateDepthExceeded { id: String, max: usize },

    /// Variant propagation recursed deeper than allowed.
    #[error("variant propagation through '{id}' exceeds the maximum depth of {max}")]
    PropagationDepthExceeded { id: String, max: usize },

    /// The id cannot be used as a document name.
    #[error("'{id}' is not a valid document id: {reason}")]
    InvalidId { id: String, reason: &'static str },

    /// Converting an entity or stored document to/from JSON failed.
    #[error("serialization of '{id}' failed: {source}")]
    Serialization {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    /// The structural diff codec rejected a document or delta.
    #[error(transparent)]
    Diff(#[from] strata_diff::DiffError),

    /// The document store failed.
    #[error("storage i/o for '{id}' failed: {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },
}

impl EcsError {
    pub(crate) fn not_found(id: &str) -> Self {
        EcsError::NotFound { id: id.to_owned() }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        EcsError::InvalidOperation {
            reason: reason.into(),
        }
    }

    pub(crate) fn disposed(what: &str) -> Self {
        EcsError::Disposed {
            what: what.to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::coalesce::CoalescingQueue;
    pub use crate::config::RegistryConfig;
    pub use crate::entity::{ComponentData, ComponentVariant, Entity, EntityData};
    pub use crate::hierarchy::{EntityDataMutators, HierarchyMutators};
    pub use crate::ids::IdGenerator;
    pub use crate::journal::{EntityUpdate, UpdateJournal};
    pub use crate::pose::Pose;
    pub use crate::registry::{
        EntityHandle, EntityRegistry, LifecycleState, ListenerId, UpdateKind,
    };
    pub use crate::store::{DirectoryStore, DocumentStore, MemoryStore};
    pub use crate::templates::{PendingSave, StoredDocument, TemplatesIo};
    pub use crate::EcsError;
    pub use strata_diff::{JsonDiff, StructuralDiff};
}
