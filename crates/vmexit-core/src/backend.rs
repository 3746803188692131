use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::{HandlerKind, Hpa, InterceptError, MemoryAccess, Pa, PageAccessState, PageType};

/// A change of host-side protection for one guest page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageProtectionChange {
    /// The guest-physical address of the page.
    pub address: Pa,

    /// The host backing of the page.
    pub host: Hpa,

    /// The new protection.
    pub protection: MemoryAccess,

    /// The backing type of the page.
    pub page_type: PageType,

    /// The page access state that produced `protection`.
    pub state: PageAccessState,
}

/// The secondary execution engine whose page protection must follow the
/// physical handler registry.
///
/// Implementations are shared across vCPU threads, hence the `Send + Sync`
/// bound.
pub trait ProtectionNotifier: Send + Sync {
    /// Returns whether the engine is currently in use.
    ///
    /// When `false`, no protection notifications are delivered.
    fn is_active(&self) -> bool {
        true
    }

    /// Called for every page whose access state actually changed.
    fn page_protection_changed(&self, change: &PageProtectionChange) -> Result<(), InterceptError>;

    /// Called after a handler range was registered.
    fn handler_registered(
        &self,
        kind: HandlerKind,
        first: Pa,
        len: u64,
    ) -> Result<(), InterceptError> {
        let _ = (kind, first, len);
        Ok(())
    }

    /// Called after a handler range was deregistered.
    fn handler_deregistered(&self, kind: HandlerKind, first: Pa, len: u64) {
        let _ = (kind, first, len);
    }
}

/// Bounds for one extended execution quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecLimits {
    /// Instructions to execute before giving up early is allowed.
    pub min_instructions: u32,

    /// Hard upper bound on executed instructions.
    pub max_instructions: u32,

    /// Stop after this many consecutive instructions that would not have
    /// caused a VM exit.
    pub max_instructions_without_exit: u16,
}

impl ExecLimits {
    /// Limits that execute only the exiting instruction.
    pub const SINGLE: Self = Self {
        min_instructions: 1,
        max_instructions: 1,
        max_instructions_without_exit: 1,
    };
}

/// Statistics of one execution quantum, as reported by the backend.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecStats {
    /// Instructions executed.
    pub instructions: u32,

    /// Instructions executed that would have caused a VM exit.
    pub exits: u32,

    /// The largest number of instructions observed between two such
    /// exit-worthy instructions.
    pub max_exit_distance: u32,

    /// The quantum was cut short because a halt was requested.
    pub abandoned: bool,
}

/// An execution backend able to emulate or replay guest instructions on
/// behalf of the exit policy.
pub trait ExecBackend {
    /// Returns whether extended, instruction-bounded execution is
    /// available right now.
    fn can_exec_with_max(&self) -> bool;

    /// Executes guest instructions within `limits`.
    ///
    /// `will_exit` tells the backend the exiting instruction has not been
    /// completed yet. Implementations must poll `halt` at their natural
    /// check-ins and return early with [`ExecStats::abandoned`] set when it
    /// is raised.
    ///
    /// Returning [`InterceptError::NotSupported`] signals that the backend
    /// cannot honor the request in its current mode.
    fn exec_for_exits(
        &mut self,
        will_exit: bool,
        limits: ExecLimits,
        halt: &HaltSignal,
    ) -> Result<ExecStats, InterceptError>;
}

/// A cross-thread request to stop the current execution quantum of a
/// vCPU.
#[derive(Debug, Default, Clone)]
pub struct HaltSignal(Arc<AtomicBool>);

impl HaltSignal {
    /// Creates a new, lowered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Lowers the signal.
    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Checks whether the signal is raised.
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
