use serde::{Deserialize, Serialize};

/// Capacities of the physical handler registry.
///
/// Both tables are fixed-size and sized once when the registry is
/// created; running out of either is reported as
/// [`InterceptError::OutOfResources`].
///
/// [`InterceptError::OutOfResources`]: vmexit_core::InterceptError::OutOfResources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Maximum number of handler types.
    pub max_types: usize,

    /// Maximum number of simultaneously registered handler ranges.
    pub max_handlers: usize,
}

impl HandlerConfig {
    /// Default number of handler types.
    pub const DEFAULT_MAX_TYPES: usize = 32;

    /// Default number of handler ranges.
    pub const DEFAULT_MAX_HANDLERS: usize = 4096;

    /// Sets the handler type capacity.
    pub fn with_max_types(self, max_types: usize) -> Self {
        Self { max_types, ..self }
    }

    /// Sets the handler range capacity.
    pub fn with_max_handlers(self, max_handlers: usize) -> Self {
        Self {
            max_handlers,
            ..self
        }
    }
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_types: Self::DEFAULT_MAX_TYPES,
            max_handlers: Self::DEFAULT_MAX_HANDLERS,
        }
    }
}
