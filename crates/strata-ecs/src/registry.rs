//! The [`EntityRegistry`] owns the live entity graph.
//!
//! It keeps every entity behind an [`EntityHandle`], maintains the
//! template -> variants index, detects real changes on update, fans out
//! notifications, and propagates template changes to every variant by
//! recomposing it through the [`TemplatesIo`] layer.
//!
//! # Update algorithm
//!
//! 1. Look up the handle; fail if unknown or disposed.
//! 2. If the new value is the same `Arc` or compares equal, stop.
//! 3. If the serialized forms do not differ, swap the stored `Arc` and stop
//!    (no notification, no propagation).
//! 4. Otherwise store it, notify listeners, run the handle's update
//!    callback, and recompose + update every registered variant the same
//!    way, recursively.
//!
//! Step 3 keeps a template edit from cascading into variants that already
//! override the changed fields.
//!
//! # Listener failures
//!
//! Listeners return `anyhow::Result<()>`. A failing listener is logged and
//! skipped: the remaining listeners still run and propagation continues.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::RegistryConfig;
use crate::entity::{ComponentData, Entity};
use crate::store::{DocumentStore, MemoryStore};
use crate::templates::{PendingSave, StoredDocument, TemplatesIo};
use crate::EcsError;

// ---------------------------------------------------------------------------
// UpdateKind
// ---------------------------------------------------------------------------

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateKind {
    /// The entity was registered. No old state.
    Add,
    /// The entity's content changed.
    Update,
    /// The entity was destroyed. No new state.
    Remove,
}

// ---------------------------------------------------------------------------
// EntityHandle
// ---------------------------------------------------------------------------

/// Lifecycle of an [`EntityHandle`]. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LifecycleState {
    /// Live and usable.
    Active = 0,
    /// Disposal has begun; every operation is rejected.
    DisposingStarted = 1,
    /// Fully disposed.
    Disposed = 2,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LifecycleState::Active,
            1 => LifecycleState::DisposingStarted,
            _ => LifecycleState::Disposed,
        }
    }
}

/// Callback run after an entity's content changed: `(old, new)`.
pub type UpdateCallback<T> = Box<dyn Fn(&Arc<T>, &Arc<T>) + Send + Sync>;

struct HandleInner<T> {
    id: String,
    data: RwLock<Arc<T>>,
    state: AtomicU8,
    on_update: RwLock<Option<UpdateCallback<T>>>,
}

/// A shared wrapper around one registered entity.
///
/// Clones refer to the same entity. The registry swaps the wrapped snapshot
/// on every update, so a handle always reads the current state until the
/// entity is destroyed.
pub struct EntityHandle<T> {
    inner: Arc<HandleInner<T>>,
}

impl<T> Clone for EntityHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Entity> EntityHandle<T> {
    fn new(data: Arc<T>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: data.id().to_owned(),
                data: RwLock::new(data),
                state: AtomicU8::new(LifecycleState::Active as u8),
                on_update: RwLock::new(None),
            }),
        }
    }

    /// The entity id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Whether disposal has started (or finished).
    pub fn is_disposed(&self) -> bool {
        self.state() != LifecycleState::Active
    }

    fn ensure_active(&self) -> Result<(), EcsError> {
        if self.is_disposed() {
            Err(EcsError::Disposed {
                what: format!("entity '{}'", self.inner.id),
            })
        } else {
            Ok(())
        }
    }

    /// The current snapshot.
    pub fn data(&self) -> Result<Arc<T>, EcsError> {
        self.ensure_active()?;
        Ok(Arc::clone(&self.inner.data.read()))
    }

    /// Install the per-entity update callback, replacing any previous one.
    pub fn set_on_update<F>(&self, callback: F) -> Result<(), EcsError>
    where
        F: Fn(&Arc<T>, &Arc<T>) + Send + Sync + 'static,
    {
        self.ensure_active()?;
        *self.inner.on_update.write() = Some(Box::new(callback));
        Ok(())
    }

    /// Remove the per-entity update callback.
    pub fn clear_on_update(&self) {
        *self.inner.on_update.write() = None;
    }

    /// Whether both handles wrap the same registered entity.
    pub fn same_entity(&self, other: &EntityHandle<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn replace(&self, data: Arc<T>) {
        *self.inner.data.write() = data;
    }

    fn invoke_on_update(&self, old: &Arc<T>, new: &Arc<T>) {
        if let Some(callback) = self.inner.on_update.read().as_ref() {
            callback(old, new);
        }
    }

    /// Move `Active -> DisposingStarted -> Disposed`. Disposing twice fails.
    fn dispose(&self) -> Result<(), EcsError> {
        self.inner
            .state
            .compare_exchange(
                LifecycleState::Active as u8,
                LifecycleState::DisposingStarted as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| EcsError::Disposed {
                what: format!("entity '{}'", self.inner.id),
            })?;
        *self.inner.on_update.write() = None;
        self.inner
            .state
            .store(LifecycleState::Disposed as u8, Ordering::Release);
        Ok(())
    }
}

impl<T> fmt::Debug for EntityHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityHandle")
            .field("id", &self.inner.id)
            .field(
                "state",
                &LifecycleState::from_u8(self.inner.state.load(Ordering::Acquire)),
            )
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// Identifies a subscribed listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Entity update listener: `(entity, kind, old, new)`.
pub type EntityListener<T> = Box<
    dyn FnMut(&EntityHandle<T>, UpdateKind, Option<&Arc<T>>, Option<&Arc<T>>) -> anyhow::Result<()>
        + Send,
>;

// ---------------------------------------------------------------------------
// EntityRegistry
// ---------------------------------------------------------------------------

/// The live entity graph plus its template/variant index.
///
/// Single-writer: every mutating call takes `&mut self`, so concurrent
/// mutation must be serialized by the owner.
pub struct EntityRegistry<T: Entity> {
    entities: HashMap<String, EntityHandle<T>>,
    variants_by_template_id: HashMap<String, BTreeSet<String>>,
    templates: TemplatesIo<T>,
    listeners: Vec<(ListenerId, EntityListener<T>)>,
    next_listener_id: u64,
    /// Writes produced by calls that do not hand back a `PendingSave`.
    deferred: PendingSave,
    config: RegistryConfig,
    disposed: bool,
}

impl<T: Entity> EntityRegistry<T> {
    /// A registry persisting to `store`.
    pub fn new(store: Arc<dyn DocumentStore>, config: RegistryConfig) -> Self {
        let templates = TemplatesIo::new(store, config.clone());
        Self::with_templates(templates)
    }

    /// A registry over an existing template layer.
    pub fn with_templates(templates: TemplatesIo<T>) -> Self {
        let config = templates.config().clone();
        Self {
            entities: HashMap::new(),
            variants_by_template_id: HashMap::new(),
            templates,
            listeners: Vec::new(),
            next_listener_id: 0,
            deferred: PendingSave::none(),
            config,
            disposed: false,
        }
    }

    /// A registry backed by a fresh [`MemoryStore`] and default config.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), RegistryConfig::default())
    }

    /// The template layer.
    pub fn templates(&self) -> &TemplatesIo<T> {
        &self.templates
    }

    /// The template layer, mutably.
    pub fn templates_mut(&mut self) -> &mut TemplatesIo<T> {
        &mut self.templates
    }

    fn ensure_active(&self) -> Result<(), EcsError> {
        if self.disposed {
            Err(EcsError::disposed("entity registry"))
        } else {
            Ok(())
        }
    }

    // -- queries ------------------------------------------------------------

    /// The handle for `id`.
    pub fn get_entity(&self, id: &str) -> Result<EntityHandle<T>, EcsError> {
        self.ensure_active()?;
        self.entities
            .get(id)
            .cloned()
            .ok_or_else(|| EcsError::not_found(id))
    }

    /// The handle for `id`, or `None` if unknown.
    pub fn try_get_entity(&self, id: &str) -> Result<Option<EntityHandle<T>>, EcsError> {
        self.ensure_active()?;
        Ok(self.entities.get(id).cloned())
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> Result<bool, EcsError> {
        self.ensure_active()?;
        Ok(self.entities.contains_key(id))
    }

    /// Number of registered entities.
    pub fn len(&self) -> Result<usize, EcsError> {
        self.ensure_active()?;
        Ok(self.entities.len())
    }

    /// Whether no entity is registered.
    pub fn is_empty(&self) -> Result<bool, EcsError> {
        self.ensure_active()?;
        Ok(self.entities.is_empty())
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Result<Vec<String>, EcsError> {
        self.ensure_active()?;
        let mut ids: Vec<String> = self.entities.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Ids of the registered variants of `template_id`, sorted.
    pub fn variants_of(&self, template_id: &str) -> Result<Vec<String>, EcsError> {
        self.ensure_active()?;
        Ok(self.indexed_variants(template_id))
    }

    fn indexed_variants(&self, template_id: &str) -> Vec<String> {
        self.variants_by_template_id
            .get(template_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of templates with at least one registered variant.
    pub fn template_count(&self) -> Result<usize, EcsError> {
        self.ensure_active()?;
        Ok(self.variants_by_template_id.len())
    }

    // -- listeners ----------------------------------------------------------

    /// Subscribe to add/update/remove notifications.
    pub fn subscribe<F>(&mut self, listener: F) -> Result<ListenerId, EcsError>
    where
        F: FnMut(&EntityHandle<T>, UpdateKind, Option<&Arc<T>>, Option<&Arc<T>>) -> anyhow::Result<()>
            + Send
            + 'static,
    {
        self.ensure_active()?;
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        let listener: EntityListener<T> = Box::new(listener);
        self.listeners.push((id, listener));
        Ok(id)
    }

    /// Detach a listener. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&mut self, id: ListenerId) -> Result<bool, EcsError> {
        self.ensure_active()?;
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        Ok(self.listeners.len() != before)
    }

    fn notify(
        &mut self,
        handle: &EntityHandle<T>,
        kind: UpdateKind,
        old: Option<&Arc<T>>,
        new: Option<&Arc<T>>,
    ) {
        for (listener_id, listener) in &mut self.listeners {
            if let Err(error) = listener(handle, kind, old, new) {
                tracing::warn!(
                    listener = listener_id.0,
                    entity_id = %handle.id(),
                    ?kind,
                    %error,
                    "entity listener failed -- continuing fan-out"
                );
            }
        }
    }

    // -- add ----------------------------------------------------------------

    /// Register a new entity.
    ///
    /// Its document is staged in the template layer right away, so variants
    /// of it can be created immediately. The store write is deferred until
    /// [`flush`](Self::flush).
    pub fn add(&mut self, data: T) -> Result<EntityHandle<T>, EcsError> {
        self.ensure_active()?;
        if self.entities.contains_key(data.id()) {
            return Err(EcsError::DuplicateId {
                id: data.id().to_owned(),
            });
        }
        self.ensure_acyclic_template(&data)?;
        let pending = self.templates.stage_save(&data)?;
        self.deferred.merge(pending);
        Ok(self.register(Arc::new(data)))
    }

    /// Insert into the map and index and announce it. No persistence.
    fn register(&mut self, data: Arc<T>) -> EntityHandle<T> {
        let handle = EntityHandle::new(Arc::clone(&data));
        self.entities.insert(data.id().to_owned(), handle.clone());
        if let Some(template_id) = data.template_id() {
            self.variants_by_template_id
                .entry(template_id.to_owned())
                .or_default()
                .insert(data.id().to_owned());
        }
        tracing::debug!(entity_id = %data.id(), template_id = ?data.template_id(), "entity added");
        self.notify(&handle, UpdateKind::Add, None, Some(&data));
        handle
    }

    // -- update -------------------------------------------------------------

    /// Replace an entity's state.
    ///
    /// The in-memory update, notifications and variant propagation all
    /// complete before this returns. The returned [`PendingSave`] is the
    /// store write; a failed write is not rolled back from memory.
    ///
    /// Pointing an entity at a template whose chain leads back to the entity
    /// itself fails with [`EcsError::InvalidOperation`] and changes nothing.
    pub fn update(&mut self, data: T) -> Result<PendingSave, EcsError> {
        self.ensure_active()?;
        self.get_entity(data.id())?.data()?;
        self.ensure_acyclic_template(&data)?;
        let pending = self.templates.stage_save(&data)?;
        self.update_in_memory(Arc::new(data), 0)?;
        Ok(pending)
    }

    /// Walk the stored template chain of `data` and reject it if it passes
    /// through `data` itself.
    fn ensure_acyclic_template(&self, data: &T) -> Result<(), EcsError> {
        let mut next = data.template_id();
        let mut depth = 0;
        while let Some(template_id) = next {
            if template_id == data.id() {
                return Err(EcsError::invalid(format!(
                    "'{}' cannot be a variant of '{}': its template chain leads back to itself",
                    data.id(),
                    data.template_id().unwrap_or_default()
                )));
            }
            depth += 1;
            if depth > self.config.max_template_depth {
                return Err(EcsError::TemplateDepthExceeded {
                    id: data.id().to_owned(),
                    max: self.config.max_template_depth,
                });
            }
            next = self
                .templates
                .cached_document(template_id)
                .and_then(StoredDocument::template_id);
        }
        Ok(())
    }

    fn update_in_memory(&mut self, new: Arc<T>, depth: usize) -> Result<(), EcsError> {
        if depth > self.config.max_propagation_depth {
            return Err(EcsError::PropagationDepthExceeded {
                id: new.id().to_owned(),
                max: self.config.max_propagation_depth,
            });
        }
        let handle = self.get_entity(new.id())?;
        let old = handle.data()?;

        if Arc::ptr_eq(&old, &new) || *old == *new {
            return Ok(());
        }
        if !self.templates.has_changes(&old, &new)? {
            handle.replace(new);
            return Ok(());
        }

        self.reindex_template(&old, &new);
        handle.replace(Arc::clone(&new));
        self.notify(&handle, UpdateKind::Update, Some(&old), Some(&new));
        handle.invoke_on_update(&old, &new);

        let variants = self.indexed_variants(new.id());
        if !variants.is_empty() {
            tracing::debug!(
                template_id = %new.id(),
                variants = variants.len(),
                depth,
                "propagating template change"
            );
        }
        for variant_id in variants {
            let composed = self.templates.load_template_instance(&variant_id)?;
            self.update_in_memory(Arc::new(composed), depth + 1)?;
        }
        Ok(())
    }

    /// Keep the variant index in sync when an update moves an entity to a
    /// different template.
    fn reindex_template(&mut self, old: &T, new: &T) {
        if old.template_id() == new.template_id() {
            return;
        }
        if let Some(previous) = old.template_id() {
            self.unindex_variant(previous, old.id());
        }
        if let Some(next) = new.template_id() {
            self.variants_by_template_id
                .entry(next.to_owned())
                .or_default()
                .insert(new.id().to_owned());
        }
    }

    fn unindex_variant(&mut self, template_id: &str, variant_id: &str) {
        if let Some(set) = self.variants_by_template_id.get_mut(template_id) {
            set.remove(variant_id);
            if set.is_empty() {
                self.variants_by_template_id.remove(template_id);
            }
        }
    }

    // -- destroy ------------------------------------------------------------

    /// Remove an entity.
    ///
    /// Every registered variant of it is first detached: it keeps its
    /// composed state but stops being a variant (an `Update` notification),
    /// and its document is restaged in full. The entity is then dropped from
    /// the variant index, listeners are notified, and the handle and every
    /// component are disposed. Its stored document is deleted at the next
    /// [`flush`](Self::flush).
    /// Children are not touched; see [`hierarchy::destroy`](crate::hierarchy::destroy).
    pub fn destroy(&mut self, id: &str) -> Result<(), EcsError> {
        self.ensure_active()?;
        let handle = self.get_entity(id)?;
        let data = handle.data()?;

        for variant_id in self.indexed_variants(id) {
            self.detach_variant(&variant_id)?;
        }

        self.entities.remove(id);
        if let Some(template_id) = data.template_id() {
            self.unindex_variant(template_id, id);
        }
        self.variants_by_template_id.remove(id);

        self.notify(&handle, UpdateKind::Remove, Some(&data), None);
        handle.dispose()?;
        for component in data.components().values() {
            component.dispose();
        }

        let pending = self.templates.delete(id)?;
        self.deferred.merge(pending);
        tracing::debug!(entity_id = %id, "entity destroyed");
        Ok(())
    }

    /// Turn a variant into a standalone entity with the same state.
    fn detach_variant(&mut self, variant_id: &str) -> Result<(), EcsError> {
        let mut detached = (*self.get_entity(variant_id)?.data()?).clone();
        detached.set_template_id(None);
        let pending = self.templates.stage_save(&detached)?;
        self.deferred.merge(pending);
        tracing::debug!(entity_id = %variant_id, "detached variant from its destroyed template");
        self.update_in_memory(Arc::new(detached), 0)
    }

    // -- variants -----------------------------------------------------------

    /// Register a variant of `template` whose ids are remapped through
    /// `new_ids_lookup`.
    pub fn create_variant(
        &mut self,
        template: &T,
        new_ids_lookup: &HashMap<String, String>,
    ) -> Result<EntityHandle<T>, EcsError> {
        self.ensure_active()?;
        let variant = self
            .templates
            .create_variant_instance_with(template, new_ids_lookup)?;
        self.add(variant)
    }

    /// Register a variant of the entity `template_id` under a fresh id.
    pub fn create_variant_of(&mut self, template_id: &str) -> Result<EntityHandle<T>, EcsError> {
        let template = self.get_entity(template_id)?.data()?;
        let variant = self.templates.create_variant_instance_of(&template)?;
        self.add(variant)
    }

    // -- persistence --------------------------------------------------------

    /// Load every stored document and register the composed entities.
    ///
    /// Returns the handles in id order. Loaded entities are not written back.
    pub async fn load_scene_graph_from_disk(&mut self) -> Result<Vec<EntityHandle<T>>, EcsError> {
        self.ensure_active()?;
        self.templates.load_all_template_files_into_memory().await?;

        let mut handles = Vec::new();
        for id in self.templates.cached_ids() {
            if self.entities.contains_key(&id) {
                return Err(EcsError::DuplicateId { id });
            }
            let data = self.templates.load_template_instance(&id)?;
            handles.push(self.register(Arc::new(data)));
        }
        tracing::debug!(entities = handles.len(), "scene graph loaded");
        Ok(handles)
    }

    /// Queue a write produced outside [`update`](Self::update).
    pub(crate) fn defer(&mut self, pending: PendingSave) {
        self.deferred.merge(pending);
    }

    /// Number of deferred store writes waiting for [`flush`](Self::flush).
    pub fn deferred_writes(&self) -> Result<usize, EcsError> {
        self.ensure_active()?;
        Ok(self.deferred.len())
    }

    /// Run every deferred store write.
    pub async fn flush(&mut self) -> Result<(), EcsError> {
        self.ensure_active()?;
        std::mem::take(&mut self.deferred).await
    }

    // -- disposal -----------------------------------------------------------

    /// Tear the registry down.
    ///
    /// Clears the variant index, disposes the template layer, disposes every
    /// handle and detaches all listeners. Deferred writes are dropped. Every
    /// later call fails with [`EcsError::Disposed`]. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.variants_by_template_id.clear();
        self.templates.dispose();
        for (_, handle) in self.entities.drain() {
            // Only fails if already disposed, which a registered handle never is.
            let _ = handle.dispose();
        }
        self.listeners.clear();
        let dropped = std::mem::take(&mut self.deferred).len();
        tracing::debug!(dropped_writes = dropped, "entity registry disposed");
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl<T: Entity> fmt::Debug for EntityRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("entities", &self.entities.len())
            .field("templates", &self.variants_by_template_id.len())
            .field("listeners", &self.listeners.len())
            .field("deferred_writes", &self.deferred.len())
            .field("disposed", &self.disposed)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ComponentData, EntityData};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        id: String,
        value: i64,
    }

    impl ComponentData for Counter {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> &'static str {
            "counter"
        }

        fn with_id(&self, id: &str) -> Self {
            Self {
                id: id.to_owned(),
                value: self.value,
            }
        }
    }

    type Data = EntityData<Counter>;

    fn counter(id: &str, value: i64) -> Data {
        EntityData::new(id, "counter").with_component(Counter {
            id: id.to_owned(),
            value,
        })
    }

    #[test]
    fn handle_lifecycle_is_monotonic() {
        let handle = EntityHandle::new(Arc::new(counter("a", 0)));
        assert_eq!(handle.state(), LifecycleState::Active);
        handle.dispose().unwrap();
        assert_eq!(handle.state(), LifecycleState::Disposed);
        assert!(matches!(handle.data(), Err(EcsError::Disposed { .. })));
        assert!(handle.dispose().is_err());
        assert!(handle.set_on_update(|_, _| {}).is_err());
    }

    #[test]
    fn handles_share_state() {
        let mut registry = EntityRegistry::<Data>::in_memory();
        let first = registry.add(counter("a", 1)).unwrap();
        let second = registry.get_entity("a").unwrap();
        assert!(first.same_entity(&second));

        let _ = registry.update(counter("a", 2)).unwrap();
        assert_eq!(first.data().unwrap().components["a"].value, 2);
    }

    #[test]
    fn equal_value_is_a_noop() {
        let mut registry = EntityRegistry::<Data>::in_memory();
        let handle = registry.add(counter("a", 1)).unwrap();
        let before = handle.data().unwrap();

        let _ = registry.update(counter("a", 1)).unwrap();
        // Equal values short circuit and keep the stored snapshot.
        assert!(Arc::ptr_eq(&before, &handle.data().unwrap()));
    }

    #[test]
    fn on_update_callback_sees_old_and_new() {
        let mut registry = EntityRegistry::<Data>::in_memory();
        let handle = registry.add(counter("a", 1)).unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        handle
            .set_on_update(move |old, new| {
                sink.lock()
                    .push((old.components["a"].value, new.components["a"].value));
            })
            .unwrap();

        let _ = registry.update(counter("a", 2)).unwrap();
        let _ = registry.update(counter("a", 5)).unwrap();
        assert_eq!(*seen.lock(), vec![(1, 2), (2, 5)]);
    }

    #[test]
    fn unsubscribe_detaches_listener() {
        let mut registry = EntityRegistry::<Data>::in_memory();
        let count = Arc::new(parking_lot::Mutex::new(0));
        let sink = Arc::clone(&count);
        let id = registry
            .subscribe(move |_, _, _, _| {
                *sink.lock() += 1;
                Ok(())
            })
            .unwrap();
        registry.add(counter("a", 1)).unwrap();
        assert!(registry.unsubscribe(id).unwrap());
        assert!(!registry.unsubscribe(id).unwrap());
        registry.add(counter("b", 1)).unwrap();
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn update_moves_entity_between_templates() {
        let mut registry = EntityRegistry::<Data>::in_memory();
        registry.add(counter("t1", 1)).unwrap();
        registry.add(counter("t2", 2)).unwrap();
        let v = registry.create_variant_of("t1").unwrap();
        let v_id = v.id().to_owned();
        assert_eq!(registry.variants_of("t1").unwrap(), vec![v_id.clone()]);

        let mut moved = (*v.data().unwrap()).clone();
        moved.template_id = Some("t2".to_owned());
        let _ = registry.update(moved).unwrap();

        assert!(registry.variants_of("t1").unwrap().is_empty());
        assert_eq!(registry.variants_of("t2").unwrap(), vec![v_id]);
    }

    #[test]
    fn destroying_a_template_detaches_its_variants() {
        let mut registry = EntityRegistry::<Data>::in_memory();
        registry.add(counter("t", 3)).unwrap();
        let v = registry.create_variant_of("t").unwrap();

        registry.destroy("t").unwrap();
        let detached = v.data().unwrap();
        assert_eq!(detached.template_id, None);
        assert_eq!(detached.components[v.id()].value, 3);
        assert_eq!(registry.template_count().unwrap(), 0);
        assert!(!registry.templates().is_cached("t"));
        assert!(matches!(
            registry.templates().cached_document(v.id()),
            Some(StoredDocument::Template { .. })
        ));
    }

    #[test]
    fn queries_fail_after_dispose() {
        let mut registry = EntityRegistry::<Data>::in_memory();
        registry.add(counter("a", 1)).unwrap();
        registry.dispose();
        assert!(matches!(registry.contains("a"), Err(EcsError::Disposed { .. })));
        assert!(registry.len().is_err());
        assert!(registry.is_empty().is_err());
        assert!(registry.ids().is_err());
        assert!(registry.variants_of("a").is_err());
        assert!(registry.template_count().is_err());
        assert!(registry.deferred_writes().is_err());
        assert!(registry.subscribe(|_, _, _, _| Ok(())).is_err());
        assert!(registry.unsubscribe(ListenerId(0)).is_err());
    }

    #[test]
    fn propagation_depth_is_bounded() {
        let config = RegistryConfig {
            max_propagation_depth: 1,
            ..RegistryConfig::default()
        };
        let mut registry =
            EntityRegistry::<Data>::new(Arc::new(MemoryStore::new()), config);
        registry.add(counter("t0", 0)).unwrap();
        let t1 = registry.create_variant_of("t0").unwrap().id().to_owned();
        registry.create_variant_of(&t1).unwrap();

        // t0 -> t1 -> t2 needs depth 2.
        let err = registry.update(counter("t0", 9)).unwrap_err();
        assert!(matches!(err, EcsError::PropagationDepthExceeded { .. }));
    }
}
