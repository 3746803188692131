//! Publication of per-page access states derived from the handler tree.
//!
//! The tree is authoritative; the page states in [`PhysMemory`] and the
//! protection of the secondary execution engine are caches of it. Every
//! mutation of the tree is followed by one of the operations here, and each
//! page whose state changes is reported to the [`ProtectionNotifier`]
//! exactly once.

use indexmap::IndexMap;
use vmexit_core::{
    InterceptError, MemoryAccess, PAGE_SIZE, Pa, PageAccessState, PageProtectionChange, PageType,
    ProtectionNotifier,
};

use crate::{HandlerRecord, HandlerTypeFlags, HandlerTypeTable, PhysHandlerTree, PhysMemory};

/// Returns the host protection the secondary engine must apply to a page.
pub fn page_protection(page_type: PageType, state: PageAccessState) -> MemoryAccess {
    match (page_type, state) {
        (PageType::Mmio, _) => MemoryAccess::empty(),
        (_, PageAccessState::All) => MemoryAccess::empty(),
        (PageType::Rom, _) => MemoryAccess::RX,
        (PageType::Ram, PageAccessState::Write) => MemoryAccess::RX,
        (PageType::Ram, PageAccessState::None | PageAccessState::Disabled) => MemoryAccess::RWX,
    }
}

/// Walks the handler tree and writes page access states.
pub(crate) struct PageStateSync<'a> {
    tree: &'a PhysHandlerTree,
    types: &'a HandlerTypeTable,
    memory: &'a mut PhysMemory,
    notifier: Option<&'a dyn ProtectionNotifier>,
    error: Option<InterceptError>,
}

impl<'a> PageStateSync<'a> {
    pub fn new(
        tree: &'a PhysHandlerTree,
        types: &'a HandlerTypeTable,
        memory: &'a mut PhysMemory,
        notifier: Option<&'a dyn ProtectionNotifier>,
    ) -> Self {
        Self {
            tree,
            types,
            memory,
            notifier: notifier.filter(|notifier| notifier.is_active()),
            error: None,
        }
    }

    /// Returns the first notifier failure of the walk.
    pub fn finish(self) -> Result<(), InterceptError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Raises the pages of a freshly inserted record to its type's state.
    ///
    /// States only ever go up here; a page shared with a stronger
    /// neighbouring handler keeps the stronger state.
    pub fn on_insert(&mut self, record: &HandlerRecord) {
        let Some((state, not_in_accel)) = type_state(self.types, record) else {
            return;
        };

        for address in pages_of(record) {
            let Some(page) = self.memory.page(address).copied() else {
                continue;
            };

            let not_in_accel = not_in_accel || page.not_in_accel();

            if page.state() < state {
                self.set(address, state, not_in_accel);
            }
            else if let Some(page) = self.memory.page_mut(address) {
                page.set_state(page.state(), not_in_accel);
            }
        }
    }

    /// Resets the pages of a record that has already been removed from the
    /// tree.
    ///
    /// Pages the record covered entirely go back to
    /// [`PageAccessState::None`]. Partially covered edge pages are
    /// recomputed from the remaining records sharing them.
    pub fn on_remove(&mut self, record: &HandlerRecord) {
        for address in pages_of(record) {
            let (state, not_in_accel) = if record.covers_page(address) {
                (PageAccessState::None, false)
            }
            else {
                expected_state(self.tree, self.types, address)
            };

            self.set(address, state, not_in_accel);
        }
    }

    /// Recomputes every page state from scratch.
    ///
    /// The first pass clears all pages covered by any record in ascending
    /// order, the second ORs each record's state in descending order. Pages
    /// carrying a state without any covering record are cleared last.
    /// Temporarily disabled pages come back armed. Only pages whose final
    /// state differs from their state before the rebuild are reported.
    pub fn rebuild_all(&mut self) {
        let tree = self.tree;
        let mut previous: IndexMap<Pa, PageAccessState> = IndexMap::new();

        for (_, record) in tree.iter() {
            for address in pages_of(record) {
                if let Some(page) = self.memory.page_mut(address) {
                    previous.entry(address).or_insert(page.state());
                    page.set_state(PageAccessState::None, false);
                }
            }
        }

        for (_, record) in tree.iter_rev() {
            let Some((state, not_in_accel)) = type_state(self.types, record) else {
                continue;
            };

            for address in pages_of(record) {
                if let Some(page) = self.memory.page_mut(address) {
                    page.set_state(
                        page.state().merge(state),
                        page.not_in_accel() || not_in_accel,
                    );
                }
            }
        }

        let orphans: Vec<_> = self
            .memory
            .pages()
            .filter(|(address, page)| {
                page.state() != PageAccessState::None && !previous.contains_key(address)
            })
            .map(|(address, page)| (address, page.state()))
            .collect();

        for (address, state) in orphans {
            tracing::debug!(%address, %state, "clearing orphaned page state");
            previous.insert(address, state);

            if let Some(page) = self.memory.page_mut(address) {
                page.set_state(PageAccessState::None, false);
            }
        }

        for (address, old) in previous {
            if self.memory.page(address).is_some_and(|page| page.state() != old) {
                self.notify(address);
            }
        }
    }

    /// Switches monitoring of one page off.
    pub fn disable_page(&mut self, address: Pa) {
        self.set(address, PageAccessState::Disabled, false);
    }

    /// Re-arms every disabled page of `record`.
    pub fn reset(&mut self, record: &HandlerRecord) {
        let Some((state, not_in_accel)) = type_state(self.types, record) else {
            return;
        };

        for address in pages_of(record) {
            let disabled = self
                .memory
                .page(address)
                .is_some_and(|page| page.state() == PageAccessState::Disabled);

            if disabled {
                self.set(address, state, not_in_accel);
            }
        }
    }

    fn set(&mut self, address: Pa, state: PageAccessState, not_in_accel: bool) {
        let Some(page) = self.memory.page_mut(address) else {
            return;
        };

        let changed = page.state() != state;
        page.set_state(state, not_in_accel);

        if changed {
            self.notify(address);
        }
    }

    fn notify(&mut self, address: Pa) {
        let Some(notifier) = self.notifier else {
            return;
        };

        let Some(page) = self.memory.page(address) else {
            return;
        };

        let change = PageProtectionChange {
            address: address.page_base(),
            host: page.host(),
            protection: page_protection(page.page_type(), page.state()),
            page_type: page.page_type(),
            state: page.state(),
        };

        if let Err(err) = notifier.page_protection_changed(&change) {
            tracing::error!(
                address = %change.address,
                protection = %change.protection,
                %err,
                "protection notifier failed"
            );

            if self.error.is_none() {
                self.error = Some(InterceptError::Notifier {
                    address: change.address,
                    source: Box::new(err),
                });
            }
        }
    }
}

/// Computes the state a page must carry given the current tree, together
/// with whether any covering type keeps it out of the accelerated path.
pub(crate) fn expected_state(
    tree: &PhysHandlerTree,
    types: &HandlerTypeTable,
    address: Pa,
) -> (PageAccessState, bool) {
    let mut state = PageAccessState::None;
    let mut not_in_accel = false;

    for handle in tree.intersecting(address.page_base(), address.page_last()) {
        let Some(record) = tree.get(handle) else {
            continue;
        };

        if let Some((record_state, record_not_in_accel)) = type_state(types, record) {
            state = state.merge(record_state);
            not_in_accel |= record_not_in_accel;
        }
    }

    (state, not_in_accel)
}

fn type_state(types: &HandlerTypeTable, record: &HandlerRecord) -> Option<(PageAccessState, bool)> {
    let ty = types.get(record.type_handle())?;
    Some((
        ty.page_state(),
        ty.flags().contains(HandlerTypeFlags::NOT_IN_ACCEL),
    ))
}

/// Iterates over the page base addresses touched by a record.
fn pages_of(record: &HandlerRecord) -> impl Iterator<Item = Pa> + use<> {
    let first = record.first().page_base();
    (0..record.page_count()).map(move |index| first + index * PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protection_table() {
        let rwx = MemoryAccess::RWX;
        let rx = MemoryAccess::RX;
        let none = MemoryAccess::empty();

        for (page_type, expected) in [
            (PageType::Ram, [rwx, rwx, rx, none]),
            (PageType::Rom, [rx, rx, rx, none]),
            (PageType::Mmio, [none, none, none, none]),
        ] {
            let states = [
                PageAccessState::None,
                PageAccessState::Disabled,
                PageAccessState::Write,
                PageAccessState::All,
            ];

            for (state, expected) in states.into_iter().zip(expected) {
                assert_eq!(
                    page_protection(page_type, state),
                    expected,
                    "{page_type:?} {state}"
                );
            }
        }
    }
}
