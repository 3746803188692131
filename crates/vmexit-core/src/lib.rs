//! Shared vocabulary of the VM-exit interception core.
//!
//! This crate defines the address types, page states, protection flags,
//! the error type and the traits through which the interception core talks
//! to the hypervisor around it: the secondary execution engine that mirrors
//! page protection ([`ProtectionNotifier`]) and the instruction emulator
//! that executes guest code on behalf of the exit policy ([`ExecBackend`]).

mod backend;
mod core;
mod error;

pub use self::{
    backend::{
        ExecBackend, ExecLimits, ExecStats, HaltSignal, PageProtectionChange, ProtectionNotifier,
    },
    core::{
        Gfn, HandlerKind, Hpa, MemoryAccess, PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE, Pa,
        PageAccessState, PageType, VcpuId, page_count,
    },
    error::InterceptError,
};
