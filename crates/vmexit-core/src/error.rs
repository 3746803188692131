use crate::Pa;

/// An error that can occur in the interception core.
#[derive(thiserror::Error, Debug)]
pub enum InterceptError {
    /// A caller passed a malformed or inconsistent argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The range start lies above its end.
    #[error("Invalid range {first}..={last}")]
    InvalidRange {
        /// First address of the range.
        first: Pa,

        /// Last address of the range.
        last: Pa,
    },

    /// The range intersects a range that is already registered.
    #[error("Range {first}..={last} overlaps a registered handler")]
    RangeOverlap {
        /// First address of the rejected range.
        first: Pa,

        /// Last address of the rejected range.
        last: Pa,
    },

    /// A fixed-capacity table is full.
    #[error("Out of resources: {0}")]
    OutOfResources(&'static str),

    /// The requested entry does not exist.
    #[error("Not found")]
    NotFound,

    /// The range is not contained in a single registered RAM range.
    #[error("Range {first}..={last} is not backed by a RAM range")]
    NoRamRange {
        /// First address of the rejected range.
        first: Pa,

        /// Last address of the rejected range.
        last: Pa,
    },

    /// The operation is not permitted for this handler.
    #[error("Access denied")]
    AccessDenied,

    /// Operation not supported.
    #[error("Operation not supported")]
    NotSupported,

    /// The secondary execution engine rejected a protection change.
    #[error("Protection notifier failed for {address}")]
    Notifier {
        /// The page whose protection could not be updated.
        address: Pa,

        /// The notifier's error.
        #[source]
        source: Box<InterceptError>,
    },

    /// An error reported by an execution backend.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl InterceptError {
    /// Wraps a backend-specific error.
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }
}
