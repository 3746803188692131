use serde::{Deserialize, Serialize};
use vmexit_core::Pa;

/// A registered handler range as carried across save and restore.
///
/// Types are referred to by description since type handles are not stable
/// across VM instances. The serialized layout is versioned by whoever
/// stores it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SavedHandler {
    /// Description of the handler type.
    pub type_name: String,

    /// First address of the range.
    pub first: Pa,

    /// Last address of the range (inclusive).
    pub last: Pa,

    /// The user tag.
    pub user_tag: u64,

    /// Description of the range itself. Empty falls back to the type
    /// description.
    #[serde(default)]
    pub description: String,
}
