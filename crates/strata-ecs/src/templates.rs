//! Template I/O: persisting entities as deltas against their templates.
//!
//! Every entity is stored as one [`StoredDocument`]:
//!
//! - A plain entity (no template) stores its full serialized state.
//! - A variant stores the id of its template plus the structural delta
//!   between the *rebased* composed template and itself.
//!
//! Rebasing means taking the composed template and remapping its own id to
//! the variant's id (so the template's primary component lines up with the
//! variant's primary component) and pointing its template link at the
//! template. A variant that only differs from its template by identity thus
//! stores no delta at all, and every field it does not override keeps
//! following the template.
//!
//! Documents are cached in memory keyed by entity id. Composition is lazy:
//! loading only parses documents, and [`TemplatesIo::compose_full_document`]
//! walks the template chain on demand.
//!
//! # Example
//!
//! ```
//! # let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! # rt.block_on(async {
//! use std::sync::Arc;
//! use strata_ecs::prelude::*;
//! # #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
//! # struct Tag { id: String }
//! # impl ComponentData for Tag {
//! #     fn id(&self) -> &str { &self.id }
//! #     fn kind(&self) -> &'static str { "tag" }
//! #     fn with_id(&self, id: &str) -> Self { Tag { id: id.to_owned() } }
//! # }
//!
//! let store = Arc::new(MemoryStore::new());
//! let mut io = TemplatesIo::<EntityData<Tag>>::new(store.clone(), RegistryConfig::default());
//!
//! let lamp = EntityData::new("lamp", "Lamp");
//! io.save(&lamp).await.unwrap();
//!
//! let variant = io.create_variant_instance_of(&lamp).unwrap();
//! io.save(&variant).await.unwrap();
//!
//! // The variant only differs by identity, so it stores no delta.
//! match io.cached_document(&variant.id).unwrap() {
//!     StoredDocument::Variant { diff, .. } => assert!(diff.is_none()),
//!     StoredDocument::Template { .. } => unreachable!(),
//! }
//! assert_eq!(io.load_template_instance(&variant.id).unwrap(), variant);
//! # });
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_diff::{JsonDiff, StructuralDiff};

use crate::config::RegistryConfig;
use crate::entity::Entity;
use crate::ids::IdGenerator;
use crate::store::DocumentStore;
use crate::EcsError;

// ---------------------------------------------------------------------------
// StoredDocument
// ---------------------------------------------------------------------------

/// The persisted form of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredDocument {
    /// Full serialized state of an entity with no template.
    Template {
        /// The serialized entity.
        entity: Value,
    },
    /// A variant: its template and the delta against the rebased template.
    Variant {
        /// Id of the template entity.
        template_id: String,
        /// Delta from the rebased composed template; `None` if identical.
        #[serde(default)]
        diff: Option<Value>,
    },
}

impl StoredDocument {
    /// The template id, for variant documents.
    pub fn template_id(&self) -> Option<&str> {
        match self {
            StoredDocument::Template { .. } => None,
            StoredDocument::Variant { template_id, .. } => Some(template_id),
        }
    }
}

// ---------------------------------------------------------------------------
// PendingSave
// ---------------------------------------------------------------------------

type WriteFuture = BoxFuture<'static, Result<(), EcsError>>;

/// The persistence half of a save: zero or more store writes that run when
/// awaited.
///
/// The in-memory half (document cache, registry state) has already been
/// applied by the time a `PendingSave` exists. Dropping it without awaiting
/// skips the writes; nothing in memory is rolled back.
#[must_use = "store writes only happen when the PendingSave is awaited"]
#[derive(Default)]
pub struct PendingSave {
    writes: Vec<WriteFuture>,
}

impl PendingSave {
    /// A save with nothing to write.
    pub fn none() -> Self {
        Self::default()
    }

    pub(crate) fn from_future<F>(write: F) -> Self
    where
        F: Future<Output = Result<(), EcsError>> + Send + 'static,
    {
        Self {
            writes: vec![Box::pin(write)],
        }
    }

    /// Fold another pending save into this one.
    pub fn merge(&mut self, other: PendingSave) {
        self.writes.extend(other.writes);
    }

    /// Number of queued writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Run every queued write concurrently. Fails with the first error.
    pub async fn wait(self) -> Result<(), EcsError> {
        future::try_join_all(self.writes).await?;
        Ok(())
    }
}

impl IntoFuture for PendingSave {
    type Output = Result<(), EcsError>;
    type IntoFuture = BoxFuture<'static, Result<(), EcsError>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl fmt::Debug for PendingSave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSave")
            .field("writes", &self.writes.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TemplatesIo
// ---------------------------------------------------------------------------

/// BLAKE3 hashes of encoded documents, per id.
#[derive(Debug, Default)]
struct WriteLedger {
    /// Last document staged. A queued write only runs while it still matches.
    staged: HashMap<String, blake3::Hash>,
    /// Last document the store confirmed writing.
    written: HashMap<String, blake3::Hash>,
}

/// Persists entities of type `T` as template documents or variant deltas
/// and recomposes them on demand.
///
/// Single-writer: no internal locking around the cache.
pub struct TemplatesIo<T: Entity> {
    store: Arc<dyn DocumentStore>,
    codec: Arc<dyn StructuralDiff>,
    cache: HashMap<String, StoredDocument>,
    hashes: Arc<Mutex<WriteLedger>>,
    ids: IdGenerator,
    config: RegistryConfig,
    disposed: bool,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> TemplatesIo<T> {
    /// A template layer over `store` using the default [`JsonDiff`] codec.
    pub fn new(store: Arc<dyn DocumentStore>, config: RegistryConfig) -> Self {
        Self::with_codec(store, Arc::new(JsonDiff), config)
    }

    /// A template layer with a custom diff codec.
    pub fn with_codec(
        store: Arc<dyn DocumentStore>,
        codec: Arc<dyn StructuralDiff>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            store,
            codec,
            cache: HashMap::new(),
            hashes: Arc::new(Mutex::new(WriteLedger::default())),
            ids: IdGenerator::from_entropy(),
            config,
            disposed: false,
            _entity: PhantomData,
        }
    }

    /// Replace the id generator, e.g. with a seeded one for tests.
    pub fn with_id_generator(mut self, ids: IdGenerator) -> Self {
        self.ids = ids;
        self
    }

    /// The configuration in use.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// A fresh, unused entity id.
    pub fn fresh_id(&mut self) -> String {
        self.ids.next_id()
    }

    fn ensure_active(&self) -> Result<(), EcsError> {
        if self.disposed {
            Err(EcsError::disposed("template store"))
        } else {
            Ok(())
        }
    }

    // -- cache access -------------------------------------------------------

    /// Whether a document for `id` is cached.
    pub fn is_cached(&self, id: &str) -> bool {
        self.cache.contains_key(id)
    }

    /// The cached document for `id`.
    pub fn cached_document(&self, id: &str) -> Option<&StoredDocument> {
        self.cache.get(id)
    }

    /// Ids of all cached documents, sorted.
    pub fn cached_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cache.keys().cloned().collect();
        ids.sort();
        ids
    }

    // -- loading ------------------------------------------------------------

    /// Read and parse every document in the store into the cache.
    ///
    /// Files are read concurrently. Nothing is composed yet. Returns the
    /// number of documents loaded.
    pub async fn load_all_template_files_into_memory(&mut self) -> Result<usize, EcsError> {
        self.ensure_active()?;
        let ids = self.store.list_ids().await?;
        let reads = ids.into_iter().map(|id| {
            let store = Arc::clone(&self.store);
            async move {
                let parsed = match store.read(&id).await? {
                    Some(bytes) => Some((id.clone(), parse_document(&id, &bytes)?)),
                    // Deleted between listing and reading.
                    None => None,
                };
                Ok::<_, EcsError>(parsed)
            }
        });
        let documents = future::try_join_all(reads).await?;

        let mut loaded = 0;
        for (id, document) in documents.into_iter().flatten() {
            self.cache.insert(id, document);
            loaded += 1;
        }
        tracing::debug!(documents = loaded, "loaded template documents into memory");
        Ok(loaded)
    }

    /// Make sure `id` and its whole template chain are cached, reading
    /// missing documents from the store.
    async fn ensure_chain_loaded(&mut self, id: &str) -> Result<(), EcsError> {
        let mut current = id.to_owned();
        for _ in 0..=self.config.max_template_depth {
            if !self.cache.contains_key(&current) {
                let bytes = self
                    .store
                    .read(&current)
                    .await?
                    .ok_or_else(|| EcsError::not_found(&current))?;
                let document = parse_document(&current, &bytes)?;
                tracing::debug!(entity_id = %current, "lazily loaded template document");
                self.cache.insert(current.clone(), document);
            }
            match self.cache.get(&current).and_then(StoredDocument::template_id) {
                Some(template_id) => current = template_id.to_owned(),
                None => return Ok(()),
            }
        }
        Err(EcsError::TemplateDepthExceeded {
            id: id.to_owned(),
            max: self.config.max_template_depth,
        })
    }

    // -- composition --------------------------------------------------------

    /// The full serialized state of `id`, composed from the cache.
    ///
    /// Fails with [`EcsError::NotFound`] if `id` or any template in its chain
    /// is not cached.
    pub fn compose_full_document(&self, id: &str) -> Result<Value, EcsError> {
        self.ensure_active()?;
        self.compose_at(id, 0)
    }

    /// Like [`compose_full_document`](Self::compose_full_document), but when
    /// `allow_lazy_load` is set, missing documents in the chain are first
    /// read from the store.
    pub async fn compose_full_document_lazy(
        &mut self,
        id: &str,
        allow_lazy_load: bool,
    ) -> Result<Value, EcsError> {
        self.ensure_active()?;
        if allow_lazy_load {
            self.ensure_chain_loaded(id).await?;
        }
        self.compose_at(id, 0)
    }

    fn compose_at(&self, id: &str, depth: usize) -> Result<Value, EcsError> {
        if depth > self.config.max_template_depth {
            return Err(EcsError::TemplateDepthExceeded {
                id: id.to_owned(),
                max: self.config.max_template_depth,
            });
        }
        match self.cache.get(id).ok_or_else(|| EcsError::not_found(id))? {
            StoredDocument::Template { entity } => Ok(entity.clone()),
            StoredDocument::Variant { template_id, diff } => {
                let template = self.compose_at(template_id, depth + 1)?;
                let base = self.rebase(template_id, template, id)?;
                match diff {
                    Some(diff) => Ok(self.codec.patch(&base, diff)?),
                    None => Ok(base),
                }
            }
        }
    }

    /// The composed template document as seen from `variant_id`.
    fn rebase(&self, template_id: &str, template: Value, variant_id: &str) -> Result<Value, EcsError> {
        let mut rebased: T = from_value(template_id, template)?;
        let lookup = HashMap::from([(template_id.to_owned(), variant_id.to_owned())]);
        rebased.remap_ids(&lookup);
        rebased.set_template_id(Some(template_id.to_owned()));
        to_value(variant_id, &rebased)
    }

    /// Compose `id` and deserialize it into `T`.
    ///
    /// With `verify_round_trip` enabled, the instance is serialized again and
    /// compared with the composed document; any residual delta means `T`
    /// drops fields and fails with [`EcsError::RoundTripMismatch`].
    pub fn load_template_instance(&self, id: &str) -> Result<T, EcsError> {
        let document = self.compose_full_document(id)?;
        self.instantiate(id, document)
    }

    /// Like [`load_template_instance`](Self::load_template_instance) with
    /// optional lazy loading of the template chain.
    pub async fn load_template_instance_lazy(
        &mut self,
        id: &str,
        allow_lazy_load: bool,
    ) -> Result<T, EcsError> {
        let document = self.compose_full_document_lazy(id, allow_lazy_load).await?;
        self.instantiate(id, document)
    }

    fn instantiate(&self, id: &str, document: Value) -> Result<T, EcsError> {
        let instance: T = from_value(id, document.clone())?;
        if self.config.verify_round_trip {
            let reserialized = to_value(id, &instance)?;
            if let Some(residual) = self.codec.diff(&document, &reserialized)? {
                tracing::error!(
                    entity_id = %id,
                    residual = %residual,
                    "composed entity does not round-trip through its type"
                );
                return Err(EcsError::RoundTripMismatch {
                    id: id.to_owned(),
                    residual: residual.to_string(),
                });
            }
        }
        Ok(instance)
    }

    // -- saving -------------------------------------------------------------

    /// The document that would be stored for `entity` right now.
    pub fn document_for(&self, entity: &T) -> Result<StoredDocument, EcsError> {
        self.ensure_active()?;
        let own = to_value(entity.id(), entity)?;
        match entity.template_id() {
            None => Ok(StoredDocument::Template { entity: own }),
            Some(template_id) => {
                let template = self.compose_at(template_id, 1)?;
                let base = self.rebase(template_id, template, entity.id())?;
                Ok(StoredDocument::Variant {
                    template_id: template_id.to_owned(),
                    diff: self.codec.diff(&base, &own)?,
                })
            }
        }
    }

    /// The synchronous half of a save: compute the document, update the
    /// cache, and hand back the store write.
    ///
    /// Variants need their template chain cached; use [`save`](Self::save)
    /// to load it lazily. If the encoded document is byte-identical to the
    /// last one written to the store for this id, no write is queued. A
    /// write that runs after a newer document was staged (or the id was
    /// deleted) does nothing.
    pub fn stage_save(&mut self, entity: &T) -> Result<PendingSave, EcsError> {
        let document = self.document_for(entity)?;
        let id = entity.id().to_owned();
        let bytes = serde_json::to_vec_pretty(&document).map_err(|source| EcsError::Serialization {
            id: id.clone(),
            source,
        })?;
        let hash = blake3::hash(&bytes);
        self.cache.insert(id.clone(), document);

        {
            let mut hashes = self.hashes.lock();
            hashes.staged.insert(id.clone(), hash);
            if hashes.written.get(&id) == Some(&hash) {
                tracing::trace!(entity_id = %id, "document unchanged -- skipping write");
                return Ok(PendingSave::none());
            }
        }

        tracing::debug!(entity_id = %id, bytes = bytes.len(), "staged template document");
        let store = Arc::clone(&self.store);
        let hashes = Arc::clone(&self.hashes);
        Ok(PendingSave::from_future(async move {
            if hashes.lock().staged.get(&id) != Some(&hash) {
                tracing::trace!(entity_id = %id, "superseded by a newer save -- skipping write");
                return Ok(());
            }
            match store.write(&id, bytes).await {
                Ok(()) => {
                    hashes.lock().written.insert(id, hash);
                    Ok(())
                }
                Err(err) => {
                    hashes.lock().written.remove(&id);
                    Err(err)
                }
            }
        }))
    }

    /// Save `entity`, lazily loading its template chain first.
    pub async fn save(&mut self, entity: &T) -> Result<(), EcsError> {
        self.ensure_active()?;
        if let Some(template_id) = entity.template_id() {
            let template_id = template_id.to_owned();
            self.ensure_chain_loaded(&template_id).await?;
        }
        self.stage_save(entity)?.await
    }

    /// Drop the cached document for `id` and delete it from the store.
    /// Nothing happens if no document was cached.
    pub fn delete(&mut self, id: &str) -> Result<PendingSave, EcsError> {
        self.ensure_active()?;
        if self.cache.remove(id).is_none() {
            return Ok(PendingSave::none());
        }
        self.hashes.lock().staged.remove(id);
        let store = Arc::clone(&self.store);
        let hashes = Arc::clone(&self.hashes);
        let id = id.to_owned();
        Ok(PendingSave::from_future(async move {
            if hashes.lock().staged.contains_key(&id) {
                tracing::trace!(entity_id = %id, "saved again since the delete -- skipping it");
                return Ok(());
            }
            store.delete(&id).await?;
            hashes.lock().written.remove(&id);
            Ok(())
        }))
    }

    // -- variants -----------------------------------------------------------

    /// A new variant of `template` with a freshly generated id.
    ///
    /// Fails with [`EcsError::InvalidOperation`] if `template` has not been
    /// saved (or loaded) as a template yet.
    pub fn create_variant_instance_of(&mut self, template: &T) -> Result<T, EcsError> {
        let new_id = self.fresh_id();
        let lookup = HashMap::from([(template.id().to_owned(), new_id)]);
        self.create_variant_instance_with(template, &lookup)
    }

    /// A new variant of `template` with its ids remapped through `lookup`,
    /// which must contain a new id for the template itself.
    pub fn create_variant_instance_with(
        &self,
        template: &T,
        lookup: &HashMap<String, String>,
    ) -> Result<T, EcsError> {
        self.ensure_active()?;
        if !self.cache.contains_key(template.id()) {
            return Err(EcsError::invalid(format!(
                "cannot create a variant of '{}': it is not a registered template",
                template.id()
            )));
        }
        if !lookup.contains_key(template.id()) {
            return Err(EcsError::invalid(format!(
                "id lookup has no new id for template '{}'",
                template.id()
            )));
        }
        let mut variant = template.clone();
        variant.remap_ids(lookup);
        variant.set_template_id(Some(template.id().to_owned()));
        Ok(variant)
    }

    /// Whether `old` and `new` differ structurally once serialized.
    pub fn has_changes(&self, old: &T, new: &T) -> Result<bool, EcsError> {
        let old = to_value(old.id(), old)?;
        let new = to_value(new.id(), new)?;
        Ok(self.codec.diff(&old, &new)?.is_some())
    }

    /// Clear the cache. Every later call fails with [`EcsError::Disposed`].
    pub fn dispose(&mut self) {
        self.cache.clear();
        *self.hashes.lock() = WriteLedger::default();
        self.disposed = true;
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl<T: Entity> fmt::Debug for TemplatesIo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplatesIo")
            .field("store", &self.store)
            .field("cached", &self.cache.len())
            .field("disposed", &self.disposed)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_document(id: &str, bytes: &[u8]) -> Result<StoredDocument, EcsError> {
    serde_json::from_slice(bytes).map_err(|source| EcsError::Serialization {
        id: id.to_owned(),
        source,
    })
}

fn to_value<T: Serialize>(id: &str, value: &T) -> Result<Value, EcsError> {
    serde_json::to_value(value).map_err(|source| EcsError::Serialization {
        id: id.to_owned(),
        source,
    })
}

fn from_value<T: serde::de::DeserializeOwned>(id: &str, value: Value) -> Result<T, EcsError> {
    serde_json::from_value(value).map_err(|source| EcsError::Serialization {
        id: id.to_owned(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ComponentData, EntityData};
    use crate::store::MemoryStore;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Shape {
        id: String,
        size: u32,
        #[serde(default)]
        color: String,
    }

    impl ComponentData for Shape {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> &'static str {
            "shape"
        }

        fn with_id(&self, id: &str) -> Self {
            Self {
                id: id.to_owned(),
                ..self.clone()
            }
        }
    }

    type Data = EntityData<Shape>;

    fn shape(id: &str, size: u32, color: &str) -> Shape {
        Shape {
            id: id.to_owned(),
            size,
            color: color.to_owned(),
        }
    }

    fn verifying_config() -> RegistryConfig {
        RegistryConfig {
            verify_round_trip: true,
            ..RegistryConfig::default()
        }
    }

    fn setup() -> (Arc<MemoryStore>, TemplatesIo<Data>) {
        let store = Arc::new(MemoryStore::new());
        let io = TemplatesIo::new(store.clone(), verifying_config())
            .with_id_generator(IdGenerator::seeded(42));
        (store, io)
    }

    fn template() -> Data {
        EntityData::new("A", "Box").with_component(shape("A", 1, "red"))
    }

    #[test]
    fn template_document_stores_full_state() {
        let (_store, mut io) = setup();
        let a = template();
        let _ = io.stage_save(&a).unwrap();
        match io.cached_document("A").unwrap() {
            StoredDocument::Template { entity } => {
                assert_eq!(entity, &serde_json::to_value(&a).unwrap())
            }
            other => panic!("expected template document, got {other:?}"),
        }
    }

    #[test]
    fn variant_stores_only_overrides() {
        let (_store, mut io) = setup();
        let a = template();
        let _ = io.stage_save(&a).unwrap();

        let mut b = io.create_variant_instance_of(&a).unwrap();
        b.components.get_mut(&b.id).unwrap().color = "blue".to_owned();
        let _ = io.stage_save(&b).unwrap();

        let expected_diff = json!({
            "op": "object",
            "fields": {
                "components": {
                    "op": "object",
                    "fields": {
                        b.id.clone(): {
                            "op": "object",
                            "fields": { "color": { "op": "replace", "value": "blue" } }
                        }
                    }
                }
            }
        });
        assert_eq!(
            io.cached_document(&b.id),
            Some(&StoredDocument::Variant {
                template_id: "A".to_owned(),
                diff: Some(expected_diff),
            })
        );
    }

    #[test]
    fn composition_follows_template_changes() {
        let (_store, mut io) = setup();
        let a = template();
        let _ = io.stage_save(&a).unwrap();
        let mut b = io.create_variant_instance_of(&a).unwrap();
        b.components.get_mut(&b.id).unwrap().color = "blue".to_owned();
        let _ = io.stage_save(&b).unwrap();

        let mut a2 = a.clone();
        a2.components.get_mut("A").unwrap().size = 5;
        a2.components.get_mut("A").unwrap().color = "green".to_owned();
        let _ = io.stage_save(&a2).unwrap();

        let composed = io.load_template_instance(&b.id).unwrap();
        let primary = &composed.components[&b.id];
        assert_eq!(primary.size, 5);
        assert_eq!(primary.color, "blue");
        assert_eq!(composed.template_id.as_deref(), Some("A"));
    }

    #[test]
    fn composition_is_idempotent() {
        let (_store, mut io) = setup();
        let a = template();
        let _ = io.stage_save(&a).unwrap();
        let b = io.create_variant_instance_of(&a).unwrap();
        let _ = io.stage_save(&b).unwrap();

        let first = io.compose_full_document(&b.id).unwrap();
        let second = io.compose_full_document(&b.id).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn composing_unknown_id_is_not_found() {
        let (_store, io) = setup();
        assert!(matches!(
            io.compose_full_document("missing"),
            Err(EcsError::NotFound { .. })
        ));
    }

    #[test]
    fn variant_of_unsaved_template_is_invalid() {
        let (_store, mut io) = setup();
        let err = io.create_variant_instance_of(&template()).unwrap_err();
        assert!(matches!(err, EcsError::InvalidOperation { .. }));
    }

    #[test]
    fn template_cycle_is_reported() {
        let (_store, mut io) = setup();
        // Hand-crafted documents pointing at each other.
        io.cache.insert(
            "x".to_owned(),
            StoredDocument::Variant {
                template_id: "y".to_owned(),
                diff: None,
            },
        );
        io.cache.insert(
            "y".to_owned(),
            StoredDocument::Variant {
                template_id: "x".to_owned(),
                diff: None,
            },
        );
        assert!(matches!(
            io.compose_full_document("x"),
            Err(EcsError::TemplateDepthExceeded { .. })
        ));
    }

    #[test]
    fn has_changes_compares_content() {
        let (_store, io) = setup();
        let a = template();
        assert!(!io.has_changes(&a, &a.clone()).unwrap());
        let mut renamed = a.clone();
        renamed.name = "Crate".to_owned();
        assert!(io.has_changes(&a, &renamed).unwrap());
    }

    #[tokio::test]
    async fn identical_save_skips_the_write() {
        let (store, mut io) = setup();
        let a = template();
        io.save(&a).await.unwrap();
        io.save(&a).await.unwrap();
        assert_eq!(store.write_count(), 1);

        let mut a2 = a.clone();
        a2.name = "Crate".to_owned();
        io.save(&a2).await.unwrap();
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn dropped_save_does_not_suppress_the_next_one() {
        let (store, mut io) = setup();
        let a = template();
        drop(io.stage_save(&a).unwrap());
        assert_eq!(store.write_count(), 0);

        io.save(&a).await.unwrap();
        assert_eq!(store.write_count(), 1);
        assert!(store.get("A").is_some());
    }

    #[tokio::test]
    async fn stale_write_is_skipped_once_superseded() {
        let (store, mut io) = setup();
        let a = template();
        let first = io.stage_save(&a).unwrap();
        let mut renamed = a.clone();
        renamed.name = "Crate".to_owned();
        io.save(&renamed).await.unwrap();
        first.await.unwrap();

        assert_eq!(store.write_count(), 1);
        let stored: StoredDocument = serde_json::from_slice(&store.get("A").unwrap()).unwrap();
        assert_eq!(stored, io.document_for(&renamed).unwrap());
    }

    #[tokio::test]
    async fn lazy_load_walks_the_template_chain() {
        let (store, mut io) = setup();
        let a = template();
        io.save(&a).await.unwrap();
        let b = io.create_variant_instance_of(&a).unwrap();
        io.save(&b).await.unwrap();

        // A second layer over the same store starts with an empty cache.
        let mut fresh: TemplatesIo<Data> = TemplatesIo::new(store.clone(), verifying_config());
        assert!(matches!(
            fresh.compose_full_document_lazy(&b.id, false).await,
            Err(EcsError::NotFound { .. })
        ));
        let loaded = fresh.load_template_instance_lazy(&b.id, true).await.unwrap();
        assert_eq!(loaded, b);
        assert!(fresh.is_cached("A"));
    }

    #[tokio::test]
    async fn load_all_parses_every_document() {
        let (store, mut io) = setup();
        let a = template();
        io.save(&a).await.unwrap();
        let b = io.create_variant_instance_of(&a).unwrap();
        io.save(&b).await.unwrap();

        let mut fresh: TemplatesIo<Data> = TemplatesIo::new(store, verifying_config());
        assert_eq!(fresh.load_all_template_files_into_memory().await.unwrap(), 2);
        assert_eq!(fresh.cached_ids().len(), 2);
        assert_eq!(fresh.load_template_instance(&b.id).unwrap(), b);
    }

    #[tokio::test]
    async fn dropped_fields_fail_the_round_trip_check() {
        let store = Arc::new(MemoryStore::new());
        // A document written by a type with a field `Data` does not know.
        let document = json!({
            "kind": "template",
            "entity": { "id": "old", "name": "Legacy", "legacy_flag": true }
        });
        store.insert("old", serde_json::to_vec(&document).unwrap());

        let mut io: TemplatesIo<Data> = TemplatesIo::new(store, verifying_config());
        let err = io.load_template_instance_lazy("old", true).await.unwrap_err();
        assert!(matches!(err, EcsError::RoundTripMismatch { .. }));
    }

    #[tokio::test]
    async fn delete_removes_cached_documents_only() {
        let (store, mut io) = setup();
        io.save(&template()).await.unwrap();
        assert!(!io.delete("A").unwrap().is_empty());
        assert!(io.delete("A").unwrap().is_empty());
        // The first PendingSave was dropped, so the file is still there.
        assert!(store.get("A").is_some());

        io.save(&template()).await.unwrap();
        io.delete("A").unwrap().await.unwrap();
        assert!(store.get("A").is_none());
        assert!(!io.is_cached("A"));
    }

    #[test]
    fn disposed_layer_rejects_calls() {
        let (_store, mut io) = setup();
        io.dispose();
        assert!(matches!(
            io.stage_save(&template()),
            Err(EcsError::Disposed { .. })
        ));
        assert!(matches!(
            io.compose_full_document("A"),
            Err(EcsError::Disposed { .. })
        ));
    }
}
