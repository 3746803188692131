use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use vmexit_core::{HandlerKind, InterceptError, PageAccessState};

use crate::PhysAccessHandler;

bitflags::bitflags! {
    /// Flags of a handler type.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct HandlerTypeFlags: u8 {
        /// Invoke the callback with the registry lock held.
        const KEEP_LOCK = 1 << 0;

        /// Accesses must never be handled inside the hardware-accelerated
        /// path; pages are flagged so the accelerator always exits.
        const NOT_IN_ACCEL = 1 << 1;

        /// The user argument is a 32-bit index into a table owned by the
        /// registering device rather than an opaque 64-bit tag.
        const OWNER_INDEXED = 1 << 2;
    }
}

/// A small integer naming a registered [`HandlerType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypeHandle(pub u32);

impl std::fmt::Display for TypeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable descriptor of how a class of intercepted accesses is handled.
pub struct HandlerType {
    kind: HandlerKind,
    page_state: PageAccessState,
    flags: HandlerTypeFlags,
    handler: Arc<dyn PhysAccessHandler>,
    description: String,
}

impl HandlerType {
    /// Returns the handler kind.
    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    /// Returns the state pages covered by this type must carry.
    pub fn page_state(&self) -> PageAccessState {
        self.page_state
    }

    /// Returns the type flags.
    pub fn flags(&self) -> HandlerTypeFlags {
        self.flags
    }

    /// Returns the access callback.
    pub fn handler(&self) -> &Arc<dyn PhysAccessHandler> {
        &self.handler
    }

    /// Returns the unique type description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Checks whether ranges of this type must consist of whole pages.
    pub fn requires_full_pages(&self) -> bool {
        self.kind.requires_full_pages()
            || (self.kind == HandlerKind::Write && self.flags.contains(HandlerTypeFlags::NOT_IN_ACCEL))
    }
}

impl std::fmt::Debug for HandlerType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("HandlerType")
            .field("kind", &self.kind)
            .field("page_state", &self.page_state)
            .field("flags", &self.flags)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Fixed-capacity table of handler types.
///
/// Types are registered once during VM construction and are never updated
/// or removed. They are referenced by [`TypeHandle`], and by description
/// when a saved handler list is replayed.
pub struct HandlerTypeTable {
    types: Vec<HandlerType>,
    names: IndexMap<String, TypeHandle>,
    capacity: usize,
}

impl HandlerTypeTable {
    /// Creates an empty table that holds up to `capacity` types.
    pub fn new(capacity: usize) -> Self {
        Self {
            types: Vec::with_capacity(capacity),
            names: IndexMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Registers a new handler type.
    ///
    /// Fails with [`InterceptError::OutOfResources`] once the table is
    /// full, and with [`InterceptError::InvalidArgument`] if the description
    /// is empty or already taken.
    pub fn register(
        &mut self,
        kind: HandlerKind,
        flags: HandlerTypeFlags,
        handler: Arc<dyn PhysAccessHandler>,
        description: impl Into<String>,
    ) -> Result<TypeHandle, InterceptError> {
        let description = description.into();

        if description.is_empty() {
            return Err(InterceptError::InvalidArgument("empty handler type description"));
        }

        if self.names.contains_key(&description) {
            return Err(InterceptError::InvalidArgument("duplicate handler type description"));
        }

        if self.types.len() >= self.capacity {
            return Err(InterceptError::OutOfResources("handler type table is full"));
        }

        let handle = TypeHandle(self.types.len() as u32);

        tracing::debug!(%handle, %kind, ?flags, %description, "handler type registered");

        self.names.insert(description.clone(), handle);
        self.types.push(HandlerType {
            kind,
            page_state: kind.page_state(),
            flags,
            handler,
            description,
        });

        Ok(handle)
    }

    /// Returns the type behind `handle`.
    pub fn get(&self, handle: TypeHandle) -> Option<&HandlerType> {
        self.types.get(handle.0 as usize)
    }

    /// Looks up a type by its description.
    pub fn lookup_by_name(&self, description: &str) -> Option<TypeHandle> {
        self.names.get(description).copied()
    }

    /// Returns the number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Checks whether no type is registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Returns the maximum number of types.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates over the registered types in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (TypeHandle, &HandlerType)> {
        self.names
            .values()
            .map(|&handle| (handle, &self.types[handle.0 as usize]))
    }
}
