//! Guest-physical access handlers.
//!
//! Devices register a [`HandlerType`] once, then bind guest-physical
//! ranges to it. Every access to a registered range is intercepted and
//! routed to the type's [`PhysAccessHandler`] instead of going to memory.
//!
//! The registry keeps three structures consistent:
//!
//! - the [`HandlerTypeTable`], fixed after VM construction,
//! - the [`PhysHandlerTree`] of registered ranges, which is authoritative,
//! - the per-page [`PageAccessState`] in [`PhysMemory`], derived from the
//!   tree and mirrored into the secondary execution engine through a
//!   [`ProtectionNotifier`].
//!
//! [`PageAccessState`]: vmexit_core::PageAccessState
//! [`ProtectionNotifier`]: vmexit_core::ProtectionNotifier
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use vmexit_core::{HandlerKind, Hpa, InterceptError, Pa, PageAccessState, PageType};
//! use vmexit_handlers::{
//!     AccessOutcome, HandlerContext, HandlerTypeFlags, HandlerUser, PhysAccess,
//!     PhysAccessHandler, PhysHandlers,
//! };
//!
//! struct Uart;
//!
//! impl PhysAccessHandler for Uart {
//!     fn handle(
//!         &self,
//!         _ctx: HandlerContext<'_>,
//!         _access: &mut PhysAccess<'_>,
//!         _user: HandlerUser,
//!     ) -> Result<AccessOutcome, InterceptError> {
//!         Ok(AccessOutcome::Handled)
//!     }
//! }
//!
//! # fn main() -> Result<(), InterceptError> {
//! let handlers = PhysHandlers::default();
//! handlers.register_ram(Pa(0), 16, Hpa(0x1_0000_0000), PageType::Ram, "ram")?;
//!
//! let uart = handlers.register_type(
//!     HandlerKind::Mmio,
//!     HandlerTypeFlags::empty(),
//!     Arc::new(Uart),
//!     "uart",
//! )?;
//!
//! handlers.register(Pa(0x3000), Pa(0x3fff), uart, 0, "uart0")?;
//! assert_eq!(handlers.page_state(Pa(0x3010)), Some(PageAccessState::All));
//! # Ok(())
//! # }
//! ```

mod callback;
mod config;
mod handlers;
mod memory;
mod saved;
mod state;
mod sync;
mod tree;
mod types;


pub use self::{
    callback::{
        AccessOutcome, AccessType, HandlerContext, HandlerUser, PhysAccess, PhysAccessHandler,
    },
    config::HandlerConfig,
    handlers::PhysHandlers,
    memory::{PageFrame, PhysMemory, RamRange},
    saved::SavedHandler,
    state::PhysHandlerState,
    sync::page_protection,
    tree::{HandlerRecord, HandlerStats, Iter, PhysHandlerTree, RecordHandle},
    types::{HandlerType, HandlerTypeFlags, HandlerTypeTable, TypeHandle},
};
