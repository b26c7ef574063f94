//! Parent/child and subtree operations layered on the registry.
//!
//! The registry stores `parent_id`/`children_ids` as plain ids and never
//! keeps them symmetric by itself. The helpers here update both sides of a
//! link through registry updates. Because the concrete entity type belongs
//! to the caller, edits go through a [`HierarchyMutators`] implementation.
//!
//! Store writes produced here are deferred on the registry; call
//! [`EntityRegistry::flush`] to persist them.

use std::collections::{HashMap, HashSet, VecDeque};

use glam::Mat4;

use crate::entity::{ComponentData, Entity, EntityData};
use crate::pose::{compose, Pose};
use crate::registry::{EntityHandle, EntityRegistry};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Mutators
// ---------------------------------------------------------------------------

/// Produces edited copies of an entity's hierarchy links.
pub trait HierarchyMutators<T> {
    /// A copy of `entity` with its parent set to `parent_id`.
    fn set_parent_id(&self, entity: &T, parent_id: Option<&str>) -> T;

    /// A copy of `parent` with `child_id` appended to its children.
    fn add_child_id(&self, parent: &T, child_id: &str) -> T;

    /// A copy of `parent` without `child_id` among its children.
    fn remove_child_id(&self, parent: &T, child_id: &str) -> T;
}

/// [`HierarchyMutators`] for [`EntityData`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityDataMutators;

impl<C: ComponentData> HierarchyMutators<EntityData<C>> for EntityDataMutators {
    fn set_parent_id(&self, entity: &EntityData<C>, parent_id: Option<&str>) -> EntityData<C> {
        let mut edited = entity.clone();
        edited.parent_id = parent_id.map(str::to_owned);
        edited
    }

    fn add_child_id(&self, parent: &EntityData<C>, child_id: &str) -> EntityData<C> {
        let mut edited = parent.clone();
        edited.children_ids.push(child_id.to_owned());
        edited
    }

    fn remove_child_id(&self, parent: &EntityData<C>, child_id: &str) -> EntityData<C> {
        let mut edited = parent.clone();
        edited.children_ids.retain(|c| c != child_id);
        edited
    }
}

// ---------------------------------------------------------------------------
// Linking
// ---------------------------------------------------------------------------

/// Whether `ancestor` is `id` itself or appears on `id`'s parent chain.
fn is_self_or_ancestor<T: Entity>(
    registry: &EntityRegistry<T>,
    ancestor: &str,
    id: &str,
) -> Result<bool, EcsError> {
    let mut seen = HashSet::new();
    let mut current = Some(id.to_owned());
    while let Some(cursor) = current {
        if cursor == ancestor {
            return Ok(true);
        }
        if !seen.insert(cursor.clone()) {
            // Pre-existing cycle that does not pass through `ancestor`.
            return Ok(false);
        }
        current = match registry.try_get_entity(&cursor)? {
            Some(handle) => handle.data()?.parent_id().map(str::to_owned),
            None => None,
        };
    }
    Ok(false)
}

fn update_deferred<T: Entity>(registry: &mut EntityRegistry<T>, data: T) -> Result<(), EcsError> {
    let pending = registry.update(data)?;
    registry.defer(pending);
    Ok(())
}

/// Register `child` under the existing entity `parent_id`.
///
/// The child's parent link and the parent's children list are only edited
/// when they do not already say so. Fails with
/// [`EcsError::InvalidOperation`] if the link would create a cycle or the
/// mutator does not produce the requested parent.
pub fn add_child<T, M>(
    registry: &mut EntityRegistry<T>,
    parent_id: &str,
    child: T,
    mutators: &M,
) -> Result<EntityHandle<T>, EcsError>
where
    T: Entity,
    M: HierarchyMutators<T> + ?Sized,
{
    registry.get_entity(parent_id)?;
    if is_self_or_ancestor(registry, child.id(), parent_id)? {
        return Err(EcsError::invalid(format!(
            "adding '{}' under '{parent_id}' would make it its own ancestor",
            child.id()
        )));
    }

    let handle = registry.add(child)?;
    let child = handle.data()?;
    if child.parent_id() != Some(parent_id) {
        let linked = mutators.set_parent_id(&child, Some(parent_id));
        if linked.parent_id() != Some(parent_id) {
            return Err(EcsError::invalid(format!(
                "mutator set parent of '{}' to {:?}, expected '{parent_id}'",
                linked.id(),
                linked.parent_id()
            )));
        }
        update_deferred(registry, linked)?;
    }

    let parent = registry.get_entity(parent_id)?.data()?;
    if !parent.children_ids().iter().any(|c| c == handle.id()) {
        update_deferred(registry, mutators.add_child_id(&parent, handle.id()))?;
    }
    Ok(handle)
}

/// Detach `child_id` from its parent. Returns `false` if it had none.
///
/// The parent's children list is edited first, then the child's link.
pub fn remove_from_parent<T, M>(
    registry: &mut EntityRegistry<T>,
    child_id: &str,
    mutators: &M,
) -> Result<bool, EcsError>
where
    T: Entity,
    M: HierarchyMutators<T> + ?Sized,
{
    let child = registry.get_entity(child_id)?.data()?;
    let Some(parent_id) = child.parent_id().map(str::to_owned) else {
        return Ok(false);
    };

    if let Some(parent) = registry.try_get_entity(&parent_id)? {
        let parent = parent.data()?;
        if parent.children_ids().iter().any(|c| c == child_id) {
            update_deferred(registry, mutators.remove_child_id(&parent, child_id))?;
        }
    }
    update_deferred(registry, mutators.set_parent_id(&child, None))?;
    Ok(true)
}

/// Move `child_id` under `new_parent_id`, or to the root with `None`.
///
/// Always detaches from the old parent before attaching to the new one.
pub fn set_parent<T, M>(
    registry: &mut EntityRegistry<T>,
    child_id: &str,
    new_parent_id: Option<&str>,
    mutators: &M,
) -> Result<(), EcsError>
where
    T: Entity,
    M: HierarchyMutators<T> + ?Sized,
{
    let child = registry.get_entity(child_id)?.data()?;
    if let Some(new_parent_id) = new_parent_id {
        registry.get_entity(new_parent_id)?;
        if is_self_or_ancestor(registry, child_id, new_parent_id)? {
            return Err(EcsError::invalid(format!(
                "moving '{child_id}' under '{new_parent_id}' would make it its own ancestor"
            )));
        }
    }
    if child.parent_id() == new_parent_id {
        return Ok(());
    }

    remove_from_parent(registry, child_id, mutators)?;
    let Some(new_parent_id) = new_parent_id else {
        return Ok(());
    };

    let child = registry.get_entity(child_id)?.data()?;
    let linked = mutators.set_parent_id(&child, Some(new_parent_id));
    if linked.parent_id() != Some(new_parent_id) {
        return Err(EcsError::invalid(format!(
            "mutator set parent of '{child_id}' to {:?}, expected '{new_parent_id}'",
            linked.parent_id()
        )));
    }
    update_deferred(registry, linked)?;

    let parent = registry.get_entity(new_parent_id)?.data()?;
    if !parent.children_ids().iter().any(|c| c == child_id) {
        update_deferred(registry, mutators.add_child_id(&parent, child_id))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Destroy
// ---------------------------------------------------------------------------

/// Destroy `id` and its whole subtree, children before parents.
///
/// With `remove_child_id_from_parent`, the root is first unlisted from its
/// parent's children. Returns `false` if `id` is not registered.
pub fn destroy<T, M>(
    registry: &mut EntityRegistry<T>,
    id: &str,
    remove_child_id_from_parent: bool,
    mutators: &M,
) -> Result<bool, EcsError>
where
    T: Entity,
    M: HierarchyMutators<T> + ?Sized,
{
    let Some(handle) = registry.try_get_entity(id)? else {
        return Ok(false);
    };
    if remove_child_id_from_parent {
        let data = handle.data()?;
        if let Some(parent_id) = data.parent_id() {
            if let Some(parent) = registry.try_get_entity(parent_id)? {
                let parent = parent.data()?;
                if parent.children_ids().iter().any(|c| c == id) {
                    update_deferred(registry, mutators.remove_child_id(&parent, id))?;
                }
            }
        }
    }
    let mut visited = HashSet::new();
    destroy_subtree(registry, id, &mut visited)?;
    Ok(true)
}

fn destroy_subtree<T: Entity>(
    registry: &mut EntityRegistry<T>,
    id: &str,
    visited: &mut HashSet<String>,
) -> Result<(), EcsError> {
    if !visited.insert(id.to_owned()) {
        return Ok(());
    }
    let Some(handle) = registry.try_get_entity(id)? else {
        return Ok(());
    };
    let children = handle.data()?.children_ids().to_vec();
    for child in &children {
        destroy_subtree(registry, child, visited)?;
    }
    registry.destroy(id)
}

// ---------------------------------------------------------------------------
// Subtree variants
// ---------------------------------------------------------------------------

/// Create a variant of the whole subtree rooted at `root_id`.
///
/// Every node gets a fresh id; children lists and parent links inside the
/// copy point at the new ids. Nodes are registered leaves first, the root
/// last. The new root is detached from any parent.
pub fn create_variant<T, M>(
    registry: &mut EntityRegistry<T>,
    root_id: &str,
    mutators: &M,
) -> Result<EntityHandle<T>, EcsError>
where
    T: Entity,
    M: HierarchyMutators<T> + ?Sized,
{
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([root_id.to_owned()]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        let data = registry.get_entity(&id)?.data()?;
        queue.extend(data.children_ids().iter().cloned());
        order.push(data);
    }

    let lookup: HashMap<String, String> = order
        .iter()
        .map(|node| (node.id().to_owned(), registry.templates_mut().fresh_id()))
        .collect();

    for node in order.iter().skip(1).rev() {
        registry.create_variant(node, &lookup)?;
    }

    let root = &order[0];
    let variant = registry
        .templates()
        .create_variant_instance_with(root, &lookup)?;
    let variant = if variant.parent_id().is_some() {
        mutators.set_parent_id(&variant, None)
    } else {
        variant
    };
    tracing::debug!(
        template_id = %root_id,
        variant_id = %variant.id(),
        nodes = order.len(),
        "created subtree variant"
    );
    registry.add(variant)
}

// ---------------------------------------------------------------------------
// Poses
// ---------------------------------------------------------------------------

/// The global transform of `id`: its local transform composed under every
/// ancestor's. Missing local transforms are the identity.
pub fn global_pose_matrix<T: Entity>(registry: &EntityRegistry<T>, id: &str) -> Result<Mat4, EcsError> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = Some(id.to_owned());
    while let Some(cursor) = current {
        if !seen.insert(cursor.clone()) {
            return Err(EcsError::invalid(format!(
                "parent chain of '{id}' contains a cycle through '{cursor}'"
            )));
        }
        let data = registry.get_entity(&cursor)?.data()?;
        current = data.parent_id().map(str::to_owned);
        chain.push(data);
    }
    Ok(chain
        .iter()
        .rev()
        .fold(Mat4::IDENTITY, |global, node| compose(&global, node.local_pose())))
}

/// [`global_pose_matrix`] decomposed into a [`Pose`].
pub fn global_pose<T: Entity>(registry: &EntityRegistry<T>, id: &str) -> Result<Pose, EcsError> {
    Ok(Pose::from_matrix(&global_pose_matrix(registry, id)?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
