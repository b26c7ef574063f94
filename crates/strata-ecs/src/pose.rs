//! Decomposed transforms.
//!
//! Entities store their local transform as an optional [`Mat4`]. [`Pose`] is
//! the decomposed position/rotation/scale view of such a matrix.
//!
//! Composition order: a child's global transform is its local transform
//! followed by its parent's global transform. In glam's column-vector
//! convention that is `parent_global * child_local`.

use glam::{Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Position, rotation and scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Translation.
    pub position: Vec3,
    /// Orientation.
    pub rotation: Quat,
    /// Per-axis scale.
    pub scale: Vec3,
}

impl Pose {
    /// The identity pose.
    pub const IDENTITY: Pose = Pose {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    /// A pose with unit scale.
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self {
            position,
            rotation,
            scale: Vec3::ONE,
        }
    }

    /// The affine matrix for this pose (scale, then rotate, then translate).
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// Decompose an affine matrix. Shear is not representable and is lost.
    pub fn from_matrix(matrix: &Mat4) -> Self {
        let (scale, rotation, position) = matrix.to_scale_rotation_translation();
        Self {
            position,
            rotation,
            scale,
        }
    }

    /// Compose this (local) pose under `parent`.
    pub fn under(&self, parent: &Pose) -> Pose {
        Pose::from_matrix(&compose(&parent.to_matrix(), Some(&self.to_matrix())))
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Compose a local transform under a parent's global transform. A missing
/// local transform is the identity.
pub fn compose(parent_global: &Mat4, local: Option<&Mat4>) -> Mat4 {
    match local {
        Some(local) => *parent_global * *local,
        None => *parent_global,
    }
}
