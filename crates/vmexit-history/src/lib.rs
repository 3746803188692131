//! Per-vCPU VM-exit history and adaptive execution policy.
//!
//! Every VM exit is recorded in an [`ExitHistoryCache`] keyed by the
//! program counter and the exit type. Sites that exit often and in quick
//! succession are handed to the [`ExitPolicyEngine`], which first probes
//! them and then, if more exits keep following, executes them in extended
//! quanta through an [`ExecBackend`] instead of returning to the host for
//! every single instruction.
//!
//! [`ExecBackend`]: vmexit_core::ExecBackend
//!
//! Record actions only move forward:
//!
//! ```text
//! Free -> Normal -> ExecProbe -> ExecWithMax
//!                            \-> NormalProbed
//! ```
//!
//! The single way back is a demotion to `Normal` when the backend loses
//! the ability to run extended quanta. A demoted site has to build up a
//! fresh run of hits before it is marked again.

mod cache;
mod config;
mod exit;
mod policy;
mod record;
mod vcpu;

pub use self::{
    cache::{
        CacheStats, ExitHistoryCache, ExitHistoryEntry, ExitSlot, HISTORY_LENGTH, UNKNOWN_PC,
    },
    config::HistoryConfig,
    exit::{ExitFlags, ExitFlagsAndType, ExitKind, ExitKinds, em, nem},
    policy::{ExecResult, ExitPolicyEngine, PolicyStats},
    record::{ExitAction, ExitRecord},
    vcpu::VcpuExitHistory,
};
