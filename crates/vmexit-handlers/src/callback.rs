use vmexit_core::{InterceptError, Pa, VcpuId};

use crate::{PhysHandlerState, PhysHandlers};

/// The direction of an intercepted access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    /// The guest reads from the range.
    Read,

    /// The guest writes to the range.
    Write,
}

/// An intercepted guest-physical access.
#[derive(Debug)]
pub struct PhysAccess<'a> {
    /// The vCPU performing the access.
    vcpu: VcpuId,

    /// The accessed guest-physical address.
    address: Pa,

    /// The direction of the access.
    access_type: AccessType,

    /// The bytes being written, or the buffer a read fills.
    buffer: &'a mut [u8],
}

impl<'a> PhysAccess<'a> {
    /// Creates a new access descriptor.
    pub fn new(vcpu: VcpuId, address: Pa, access_type: AccessType, buffer: &'a mut [u8]) -> Self {
        Self {
            vcpu,
            address,
            access_type,
            buffer,
        }
    }

    /// Returns the vCPU performing the access.
    pub fn vcpu(&self) -> VcpuId {
        self.vcpu
    }

    /// Returns the accessed address.
    pub fn address(&self) -> Pa {
        self.address
    }

    /// Returns the direction of the access.
    pub fn access_type(&self) -> AccessType {
        self.access_type
    }

    /// Returns the access size in bytes.
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the data buffer.
    pub fn buffer(&self) -> &[u8] {
        &*self.buffer
    }

    /// Returns the data buffer for filling in read results.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut *self.buffer
    }
}

/// The per-registration argument passed to a handler callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerUser {
    /// An opaque 64-bit tag.
    Tag(u64),

    /// A 32-bit index into a table owned by the device; used by types
    /// registered with [`HandlerTypeFlags::OWNER_INDEXED`].
    ///
    /// [`HandlerTypeFlags::OWNER_INDEXED`]: crate::HandlerTypeFlags::OWNER_INDEXED
    Owner(u32),
}

impl HandlerUser {
    /// Returns the raw 64-bit value.
    pub fn raw(self) -> u64 {
        match self {
            Self::Tag(tag) => tag,
            Self::Owner(index) => index as u64,
        }
    }
}

/// How the access that triggered a callback should be completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessOutcome {
    /// The callback fully handled the access.
    Handled,

    /// Perform the access against the page's backing memory.
    Default,

    /// Defer to the instruction emulator.
    Emulate,
}

/// The view of the registry a callback receives.
///
/// Which variant is passed is decided by the handler type's
/// [`KEEP_LOCK`] flag.
///
/// [`KEEP_LOCK`]: crate::HandlerTypeFlags::KEEP_LOCK
pub enum HandlerContext<'a> {
    /// The VM-wide registry lock is held for the duration of the callback.
    ///
    /// The callback may use the state directly but must not call into
    /// [`PhysHandlers`], which would deadlock.
    Locked(&'a mut PhysHandlerState),

    /// The lock was released before the callback was invoked. The callback
    /// may call any [`PhysHandlers`] operation.
    Unlocked(&'a PhysHandlers),
}

impl HandlerContext<'_> {
    /// Checks whether the registry lock is held.
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked(_))
    }
}

/// A callback invoked for intercepted accesses to a handler range.
pub trait PhysAccessHandler: Send + Sync {
    /// Handles one intercepted access.
    fn handle(
        &self,
        ctx: HandlerContext<'_>,
        access: &mut PhysAccess<'_>,
        user: HandlerUser,
    ) -> Result<AccessOutcome, InterceptError>;
}
