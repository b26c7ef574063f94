//! Registry and template-layer configuration.

use serde::{Deserialize, Serialize};

/// Default bound for both template chains and variant propagation.
pub const DEFAULT_MAX_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// RegistryConfig
// ---------------------------------------------------------------------------

/// Configuration shared by [`EntityRegistry`](crate::registry::EntityRegistry)
/// and [`TemplatesIo`](crate::templates::TemplatesIo).
///
/// Deserializes with defaults for any missing field, so a partial config
/// file (or `{}`) is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum number of template hops while composing a variant. A template
    /// cycle surfaces as
    /// [`EcsError::TemplateDepthExceeded`](crate::EcsError::TemplateDepthExceeded).
    pub max_template_depth: usize,
    /// Maximum recursion depth of template-to-variant update propagation.
    pub max_propagation_depth: usize,
    /// Re-serialize every composed entity and fail if it differs from the
    /// composed document. On by default in debug builds only.
    pub verify_round_trip: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_template_depth: DEFAULT_MAX_DEPTH,
            max_propagation_depth: DEFAULT_MAX_DEPTH,
            verify_round_trip: cfg!(debug_assertions),
        }
    }
}
