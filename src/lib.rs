//! VM-exit interception core.
//!
//! This crate bundles the pieces a hypervisor needs between a VM exit and
//! the decision how to resume the guest:
//!
//! - [`handlers`]: guest-physical access handlers, their range registry
//!   and the page protection derived from it,
//! - [`history`]: the per-vCPU exit history and the adaptive execution
//!   policy built on top of it.
//!
//! The shared vocabulary of both lives in [`vmexit_core`] and is
//! re-exported at the crate root.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub use vmexit_core::*;

/// Guest-physical access handlers.
#[cfg(feature = "handlers")]
#[cfg_attr(docsrs, doc(cfg(feature = "handlers")))]
pub mod handlers {
    pub use vmexit_handlers::*;
}

/// Per-vCPU exit history and execution policy.
#[cfg(feature = "history")]
#[cfg_attr(docsrs, doc(cfg(feature = "history")))]
pub mod history {
    pub use vmexit_history::*;
}
