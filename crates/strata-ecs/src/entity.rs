//! Entity and component data contracts.
//!
//! The core never owns a concrete entity type. It works against the
//! [`Entity`] trait, which exposes exactly what the template layer and the
//! registry need: ids, the template link, hierarchy links, the component map
//! and id remapping. [`EntityData`] is the ready-made implementation most
//! callers use, generic over their own component type.
//!
//! Entities are treated as copy-on-write snapshots: the registry stores them
//! behind `Arc` and replaces them wholesale on update.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use glam::Mat4;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::EcsError;

// ---------------------------------------------------------------------------
// ComponentData
// ---------------------------------------------------------------------------

/// A component attached to an entity.
///
/// Component types are usually an enum over concrete variants. A single
/// entity may hold at most one component of each concrete variant, as
/// reported by [`kind`](Self::kind).
pub trait ComponentData:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Component id. The component whose id equals the owning entity's id is
    /// that entity's *primary* component.
    fn id(&self) -> &str;

    /// Whether the component is active.
    fn is_active(&self) -> bool {
        true
    }

    /// Name of the concrete variant, e.g. `"mesh"` or `"label"`.
    fn kind(&self) -> &'static str;

    /// A copy of this component carrying a different id.
    fn with_id(&self, id: &str) -> Self;

    /// Release external resources held by the component. Called once when
    /// the owning entity is destroyed.
    fn dispose(&self) {}
}

/// Typed access to one concrete variant of a component type `C`.
pub trait ComponentVariant<C>: Sized {
    /// Returns the variant if `component` is one.
    fn extract(component: &C) -> Option<&Self>;
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// The contract the registry and template layer need from an entity type.
///
/// `PartialEq` is the cheap "nothing changed" check used before any
/// structural diff is computed.
pub trait Entity:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The component type held by this entity.
    type Component: ComponentData;

    /// Globally unique id within a registry.
    fn id(&self) -> &str;

    /// Human label, not unique.
    fn name(&self) -> &str;

    /// Id of the template this entity is a variant of, if any.
    fn template_id(&self) -> Option<&str>;

    /// Point this entity at a different template (or none).
    fn set_template_id(&mut self, template_id: Option<String>);

    /// Transform relative to the parent. `None` means identity.
    fn local_pose(&self) -> Option<&Mat4>;

    /// Components keyed by component id.
    fn components(&self) -> &BTreeMap<String, Self::Component>;

    /// Id of the parent entity, if any.
    fn parent_id(&self) -> Option<&str>;

    /// Ids of the child entities, in order.
    fn children_ids(&self) -> &[String];

    /// Whether the entity is active.
    fn is_active(&self) -> bool;

    /// Rewrite every id this entity stores (its own id, parent, children,
    /// component keys and component ids) through `lookup`. Ids missing from
    /// `lookup` stay as they are. The template id is never remapped.
    fn remap_ids(&mut self, lookup: &HashMap<String, String>);

    /// The component keyed by the entity's own id.
    fn primary_component(&self) -> Option<&Self::Component> {
        self.components().get(self.id())
    }

    /// The component of variant `V`, if the entity has one.
    ///
    /// Checks the primary component before scanning the rest. Debug builds
    /// assert that at most one component of `V` exists.
    fn try_get_component<V>(&self) -> Option<&V>
    where
        V: ComponentVariant<Self::Component>,
    {
        let found = self
            .primary_component()
            .and_then(V::extract)
            .or_else(|| self.components().values().find_map(V::extract));
        debug_assert!(
            self.components()
                .values()
                .filter(|c| V::extract(c).is_some())
                .count()
                <= 1,
            "entity '{}' holds more than one component of the requested variant",
            self.id()
        );
        found
    }

    /// Like [`try_get_component`](Self::try_get_component) but fails with
    /// [`EcsError::NotFound`] when the entity has no such component.
    fn get_component<V>(&self) -> Result<&V, EcsError>
    where
        V: ComponentVariant<Self::Component>,
    {
        self.try_get_component::<V>().ok_or_else(|| EcsError::NotFound {
            id: format!("{}/{}", self.id(), std::any::type_name::<V>()),
        })
    }
}

// ---------------------------------------------------------------------------
// EntityData
// ---------------------------------------------------------------------------

fn default_active() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

/// The standard entity shape.
///
/// Optional fields are omitted from the serialized form when empty so that
/// template documents stay small and variant deltas only carry real
/// differences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "C: Serialize", deserialize = "C: DeserializeOwned"))]
pub struct EntityData<C> {
    /// Globally unique id.
    pub id: String,
    /// Human label.
    pub name: String,
    /// Template this entity is a variant of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// Transform relative to the parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_pose: Option<Mat4>,
    /// Components keyed by component id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, C>,
    /// Parent entity id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Child entity ids, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children_ids: Vec<String>,
    /// Whether the entity is active.
    #[serde(default = "default_active", skip_serializing_if = "is_true")]
    pub is_active: bool,
}

impl<C: ComponentData> EntityData<C> {
    /// A new active entity with no components, parent or template.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            template_id: None,
            local_pose: None,
            components: BTreeMap::new(),
            parent_id: None,
            children_ids: Vec::new(),
            is_active: true,
        }
    }

    /// Add (or replace) a component, keyed by its id.
    pub fn with_component(mut self, component: C) -> Self {
        self.components.insert(component.id().to_owned(), component);
        self
    }

    /// Set the local pose.
    pub fn with_local_pose(mut self, pose: Mat4) -> Self {
        self.local_pose = Some(pose);
        self
    }

    /// Set the parent id. Does not touch the parent entity.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Append a child id. Does not touch the child entity.
    pub fn with_child(mut self, child_id: impl Into<String>) -> Self {
        self.children_ids.push(child_id.into());
        self
    }
}

impl<C: ComponentData> Entity for EntityData<C> {
    type Component = C;

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn template_id(&self) -> Option<&str> {
        self.template_id.as_deref()
    }

    fn set_template_id(&mut self, template_id: Option<String>) {
        self.template_id = template_id;
    }

    fn local_pose(&self) -> Option<&Mat4> {
        self.local_pose.as_ref()
    }

    fn components(&self) -> &BTreeMap<String, C> {
        &self.components
    }

    fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    fn children_ids(&self) -> &[String] {
        &self.children_ids
    }

    fn is_active(&self) -> bool {
        self.is_active
    }

    fn remap_ids(&mut self, lookup: &HashMap<String, String>) {
        if let Some(new_id) = lookup.get(&self.id) {
            self.id = new_id.clone();
        }
        if let Some(new_parent) = self.parent_id.as_ref().and_then(|p| lookup.get(p)) {
            self.parent_id = Some(new_parent.clone());
        }
        for child in &mut self.children_ids {
            if let Some(new_child) = lookup.get(child) {
                *child = new_child.clone();
            }
        }
        self.components = std::mem::take(&mut self.components)
            .into_iter()
            .map(|(key, component)| match lookup.get(&key) {
                Some(new_key) => (new_key.clone(), component.with_id(new_key)),
                None => (key, component),
            })
            .collect();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    enum Part {
        Shape(Shape),
        Label(Label),
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Shape {
        id: String,
        size: u32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Label {
        id: String,
        text: String,
    }

    impl ComponentData for Part {
        fn id(&self) -> &str {
            match self {
                Part::Shape(s) => &s.id,
                Part::Label(l) => &l.id,
            }
        }

        fn kind(&self) -> &'static str {
            match self {
                Part::Shape(_) => "shape",
                Part::Label(_) => "label",
            }
        }

        fn with_id(&self, id: &str) -> Self {
            match self {
                Part::Shape(s) => Part::Shape(Shape {
                    id: id.to_owned(),
                    ..s.clone()
                }),
                Part::Label(l) => Part::Label(Label {
                    id: id.to_owned(),
                    ..l.clone()
                }),
            }
        }
    }

    impl ComponentVariant<Part> for Shape {
        fn extract(component: &Part) -> Option<&Self> {
            match component {
                Part::Shape(s) => Some(s),
                _ => None,
            }
        }
    }

    impl ComponentVariant<Part> for Label {
        fn extract(component: &Part) -> Option<&Self> {
            match component {
                Part::Label(l) => Some(l),
                _ => None,
            }
        }
    }

    fn boxed(id: &str) -> EntityData<Part> {
        EntityData::new(id, "Box")
            .with_component(Part::Shape(Shape {
                id: id.to_owned(),
                size: 1,
            }))
            .with_component(Part::Label(Label {
                id: format!("{id}.label"),
                text: "hello".to_owned(),
            }))
    }

    #[test]
    fn serde_roundtrip_is_semantic_equality() {
        let entity = boxed("A")
            .with_parent("root")
            .with_child("c1")
            .with_local_pose(Mat4::from_translation(glam::Vec3::new(1.0, 2.0, 3.0)));
        let json = serde_json::to_value(&entity).unwrap();
        let back: EntityData<Part> = serde_json::from_value(json).unwrap();
        assert_eq!(back, entity);
    }

    #[test]
    fn empty_fields_are_omitted() {
        let json = serde_json::to_value(EntityData::<Part>::new("A", "Box")).unwrap();
        assert_eq!(json, serde_json::json!({ "id": "A", "name": "Box" }));
    }

    #[test]
    fn primary_component_is_keyed_by_entity_id() {
        let entity = boxed("A");
        assert_eq!(entity.primary_component().map(|c| c.kind()), Some("shape"));
    }

    #[test]
    fn typed_component_lookup() {
        let entity = boxed("A");
        assert_eq!(entity.get_component::<Shape>().unwrap().size, 1);
        assert_eq!(entity.try_get_component::<Label>().unwrap().text, "hello");

        let bare = EntityData::<Part>::new("B", "Empty");
        assert!(bare.try_get_component::<Shape>().is_none());
        assert!(matches!(
            bare.get_component::<Shape>(),
            Err(EcsError::NotFound { .. })
        ));
    }

    #[test]
    fn remap_rewrites_all_links_but_template() {
        let mut entity = boxed("A").with_parent("P").with_child("C").with_child("D");
        entity.template_id = Some("T".to_owned());
        let lookup: HashMap<String, String> = [("A", "A2"), ("P", "P2"), ("C", "C2"), ("T", "T2")]
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();

        entity.remap_ids(&lookup);

        assert_eq!(entity.id, "A2");
        assert_eq!(entity.parent_id.as_deref(), Some("P2"));
        assert_eq!(entity.children_ids, vec!["C2".to_owned(), "D".to_owned()]);
        assert_eq!(entity.template_id.as_deref(), Some("T"));
        assert_eq!(entity.primary_component().unwrap().id(), "A2");
        assert!(entity.components.contains_key("A.label"));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "more than one component")]
    fn duplicate_variant_is_caught_in_debug() {
        let entity = boxed("A").with_component(Part::Shape(Shape {
            id: "extra".to_owned(),
            size: 9,
        }));
        let _ = entity.try_get_component::<Shape>();
    }
}
