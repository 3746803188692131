use std::sync::Arc;

use vmexit_core::{
    HandlerKind, Hpa, InterceptError, Pa, PageAccessState, PageType, ProtectionNotifier,
};

use crate::{
    HandlerConfig, HandlerRecord, HandlerType, HandlerTypeFlags, HandlerTypeTable,
    PhysAccessHandler, PhysHandlerTree, PhysMemory, RecordHandle, SavedHandler, TypeHandle,
    sync::{PageStateSync, expected_state},
};

/// The VM-wide state of the physical handler registry.
///
/// Holds the handler type table, the tree of registered ranges and the
/// guest page-frame store, and keeps the page access states in sync with
/// the tree after every mutation.
///
/// Shared between vCPUs through [`PhysHandlers`], which guards it with a
/// single lock. Callbacks of [`KEEP_LOCK`] types receive it directly.
///
/// [`PhysHandlers`]: crate::PhysHandlers
/// [`KEEP_LOCK`]: HandlerTypeFlags::KEEP_LOCK
pub struct PhysHandlerState {
    pub(crate) types: HandlerTypeTable,
    pub(crate) tree: PhysHandlerTree,
    pub(crate) memory: PhysMemory,
    notifier: Option<Arc<dyn ProtectionNotifier>>,
}

impl PhysHandlerState {
    /// Creates an empty registry.
    pub fn new(config: HandlerConfig) -> Self {
        Self {
            types: HandlerTypeTable::new(config.max_types),
            tree: PhysHandlerTree::new(config.max_handlers),
            memory: PhysMemory::new(),
            notifier: None,
        }
    }

    /// Sets the secondary execution engine to notify of protection
    /// changes.
    pub fn with_notifier(self, notifier: Arc<dyn ProtectionNotifier>) -> Self {
        Self {
            notifier: Some(notifier),
            ..self
        }
    }

    /// Returns the handler type table.
    pub fn types(&self) -> &HandlerTypeTable {
        &self.types
    }

    /// Returns the tree of registered ranges.
    pub fn tree(&self) -> &PhysHandlerTree {
        &self.tree
    }

    /// Returns the guest page-frame store.
    pub fn memory(&self) -> &PhysMemory {
        &self.memory
    }

    /// Registers a handler type. See [`HandlerTypeTable::register`].
    pub fn register_type(
        &mut self,
        kind: HandlerKind,
        flags: HandlerTypeFlags,
        handler: Arc<dyn PhysAccessHandler>,
        description: impl Into<String>,
    ) -> Result<TypeHandle, InterceptError> {
        self.types.register(kind, flags, handler, description)
    }

    /// Registers guest memory. See [`PhysMemory::register`].
    pub fn register_ram(
        &mut self,
        first: Pa,
        pages: u64,
        host: Hpa,
        page_type: PageType,
        description: impl Into<String>,
    ) -> Result<(), InterceptError> {
        self.memory.register(first, pages, host, page_type, description)
    }

    /// Registers a handler for the inclusive range `first..=last`.
    ///
    /// On success the covered pages carry the type's access state and the
    /// secondary engine has been told about every changed page. If the
    /// engine rejects a change the registration is rolled back and the
    /// error returned.
    ///
    /// # Errors
    ///
    /// - [`InterceptError::InvalidRange`] if `first > last`.
    /// - [`InterceptError::InvalidArgument`] for an unknown type, a range
    ///   not made of whole pages where the type requires it, or an owner
    ///   index that does not fit in 32 bits.
    /// - [`InterceptError::NoRamRange`] if the range is not inside a single
    ///   registered RAM range.
    /// - [`InterceptError::RangeOverlap`] and
    ///   [`InterceptError::OutOfResources`] from the tree.
    /// - [`InterceptError::Notifier`] if the secondary engine failed.
    pub fn register(
        &mut self,
        first: Pa,
        last: Pa,
        type_handle: TypeHandle,
        user_tag: u64,
        description: impl Into<String>,
    ) -> Result<RecordHandle, InterceptError> {
        let kind = self.validate(first, last, type_handle, user_tag)?.kind();
        let description = description.into();

        let handle = self.tree.insert(HandlerRecord::new(
            first,
            last,
            type_handle,
            user_tag,
            description.as_str(),
        ))?;

        let mut result = {
            let mut sync = PageStateSync::new(
                &self.tree,
                &self.types,
                &mut self.memory,
                self.notifier.as_deref(),
            );

            if let Some(record) = self.tree.get(handle) {
                sync.on_insert(record);
            }

            sync.finish()
        };

        if result.is_ok()
            && let Some(notifier) = self.active_notifier()
        {
            result = notifier.handler_registered(kind, first, last - first + 1);
        }

        if let Err(err) = result {
            tracing::warn!(%first, %last, %err, "rolling back handler registration");
            self.rollback(handle);
            return Err(err);
        }

        tracing::debug!(%first, %last, %kind, %handle, %description, "handler registered");
        Ok(handle)
    }

    /// Deregisters the handler behind `handle`.
    ///
    /// Fails with [`InterceptError::NotFound`] if it was already removed.
    /// Notifier failures are returned after the registry is consistent
    /// again; the handler is gone either way.
    pub fn deregister(&mut self, handle: RecordHandle) -> Result<(), InterceptError> {
        let record = self.tree.remove(handle)?;

        let result = {
            let mut sync = PageStateSync::new(
                &self.tree,
                &self.types,
                &mut self.memory,
                self.notifier.as_deref(),
            );
            sync.on_remove(&record);
            sync.finish()
        };

        let kind = self.types.get(record.type_handle()).map(HandlerType::kind);
        if let (Some(notifier), Some(kind)) = (self.active_notifier(), kind) {
            notifier.handler_deregistered(kind, record.first(), record.len());
        }

        tracing::debug!(
            first = %record.first(),
            last = %record.last(),
            %handle,
            description = record.description(),
            "handler deregistered"
        );

        result
    }

    /// Deregisters the handler starting at `first`.
    pub fn deregister_at(&mut self, first: Pa) -> Result<(), InterceptError> {
        let handle = self.tree.find_by_first(first).ok_or(InterceptError::NotFound)?;
        self.deregister(handle)
    }

    /// Finds the handler registered for exactly `first..=last`.
    pub fn find_exact(&self, first: Pa, last: Pa) -> Option<RecordHandle> {
        self.tree.find_exact(first, last)
    }

    /// Returns the record behind `handle`.
    pub fn record(&self, handle: RecordHandle) -> Option<&HandlerRecord> {
        self.tree.get(handle)
    }

    /// Finds the handler whose range contains `address`.
    pub fn lookup(&self, address: Pa) -> Option<(RecordHandle, &HandlerRecord)> {
        let handle = self.tree.lookup(address)?;
        Some((handle, self.tree.get(handle)?))
    }

    /// Checks whether a handler covers `address`.
    pub fn is_registered(&self, address: Pa) -> bool {
        self.tree.lookup(address).is_some()
    }

    /// Checks whether the handler covering `address` intercepts reads as
    /// well as writes.
    pub fn is_all(&self, address: Pa) -> bool {
        self.lookup(address)
            .and_then(|(_, record)| self.types.get(record.type_handle()))
            .is_some_and(|ty| ty.kind() != HandlerKind::Write)
    }

    /// Returns the access state of the page containing `address`.
    pub fn page_state(&self, address: Pa) -> Option<PageAccessState> {
        self.memory.page(address).map(|page| page.state())
    }

    /// Replaces the user tag of the handler starting at `first`.
    pub fn change_user_tag(&mut self, first: Pa, user_tag: u64) -> Result<(), InterceptError> {
        let handle = self.tree.find_by_first(first).ok_or(InterceptError::NotFound)?;
        let type_handle = self
            .tree
            .get(handle)
            .ok_or(InterceptError::NotFound)?
            .type_handle();

        let owner_indexed = self
            .types
            .get(type_handle)
            .is_some_and(|ty| ty.flags().contains(HandlerTypeFlags::OWNER_INDEXED));

        if owner_indexed && u32::try_from(user_tag).is_err() {
            return Err(InterceptError::InvalidArgument("owner index must fit in 32 bits"));
        }

        if let Some(record) = self.tree.get_mut(handle) {
            record.set_user_tag(user_tag);
        }

        Ok(())
    }

    /// Temporarily switches off monitoring of one page of the handler
    /// starting at `first`.
    ///
    /// The page stays [`PageAccessState::Disabled`] until [`reset`] or
    /// [`rebuild_all`]. Only write and all-access handlers support this,
    /// and only for pages they cover entirely.
    ///
    /// [`reset`]: Self::reset
    /// [`rebuild_all`]: Self::rebuild_all
    pub fn page_temp_off(&mut self, first: Pa, page: Pa) -> Result<(), InterceptError> {
        let handle = self.tree.find_by_first(first).ok_or(InterceptError::NotFound)?;
        let record = self.tree.get(handle).ok_or(InterceptError::NotFound)?;
        let ty = self
            .types
            .get(record.type_handle())
            .ok_or(InterceptError::NotFound)?;

        if ty.kind() == HandlerKind::Mmio {
            return Err(InterceptError::AccessDenied);
        }

        if !record.covers_page(page) {
            return Err(InterceptError::InvalidArgument(
                "page is not fully covered by the handler",
            ));
        }

        if self.page_state(page) == Some(PageAccessState::Disabled) {
            return Ok(());
        }

        let tmp_off_pages = record.tmp_off_pages() + 1;

        let result = {
            let mut sync = PageStateSync::new(
                &self.tree,
                &self.types,
                &mut self.memory,
                self.notifier.as_deref(),
            );
            sync.disable_page(page);
            sync.finish()
        };

        if let Some(record) = self.tree.get_mut(handle) {
            record.set_tmp_off_pages(tmp_off_pages);
        }

        tracing::debug!(%first, page = %page.page_base(), "page monitoring off");
        result
    }

    /// Re-arms every temporarily disabled page of the handler starting at
    /// `first`.
    pub fn reset(&mut self, first: Pa) -> Result<(), InterceptError> {
        let handle = self.tree.find_by_first(first).ok_or(InterceptError::NotFound)?;

        let result = {
            let mut sync = PageStateSync::new(
                &self.tree,
                &self.types,
                &mut self.memory,
                self.notifier.as_deref(),
            );

            if let Some(record) = self.tree.get(handle) {
                sync.reset(record);
            }

            sync.finish()
        };

        if let Some(record) = self.tree.get_mut(handle) {
            record.set_tmp_off_pages(0);
        }

        result
    }

    /// Recomputes every page access state from the tree.
    pub fn rebuild_all(&mut self) -> Result<(), InterceptError> {
        let result = {
            let mut sync = PageStateSync::new(
                &self.tree,
                &self.types,
                &mut self.memory,
                self.notifier.as_deref(),
            );
            sync.rebuild_all();
            sync.finish()
        };

        self.tree.for_each_mut(|record| record.set_tmp_off_pages(0));

        tracing::debug!(handlers = self.tree.len(), "page states rebuilt");
        result
    }

    /// Replays a saved handler list and rebuilds all page states.
    ///
    /// Returns the number of restored handlers. Types are resolved by
    /// description; an unknown type fails with [`InterceptError::NotFound`].
    /// On any failure none of the saved handlers stays registered.
    pub fn restore(
        &mut self,
        saved: impl IntoIterator<Item = SavedHandler>,
    ) -> Result<usize, InterceptError> {
        let mut inserted = Vec::new();
        let mut restored = Vec::new();

        for entry in saved {
            match self.restore_one(entry) {
                Ok((handle, registration)) => {
                    inserted.push(handle);
                    restored.push(registration);
                }
                Err(err) => {
                    for handle in inserted {
                        let _ = self.tree.remove(handle);
                    }

                    tracing::warn!(%err, "restore failed, no handler was kept");
                    return Err(err);
                }
            }
        }

        self.rebuild_all()?;

        if let Some(notifier) = self.active_notifier() {
            for &(kind, first, len) in &restored {
                notifier.handler_registered(kind, first, len)?;
            }
        }

        tracing::debug!(count = restored.len(), "handlers restored");
        Ok(restored.len())
    }

    fn restore_one(
        &mut self,
        entry: SavedHandler,
    ) -> Result<(RecordHandle, (HandlerKind, Pa, u64)), InterceptError> {
        let type_handle = self
            .types
            .lookup_by_name(&entry.type_name)
            .ok_or(InterceptError::NotFound)?;

        let kind = self
            .validate(entry.first, entry.last, type_handle, entry.user_tag)?
            .kind();

        let description = if entry.description.is_empty() {
            entry.type_name
        }
        else {
            entry.description
        };

        let handle = self.tree.insert(HandlerRecord::new(
            entry.first,
            entry.last,
            type_handle,
            entry.user_tag,
            description,
        ))?;

        Ok((handle, (kind, entry.first, entry.last - entry.first + 1)))
    }

    /// Returns the registered handlers in the form [`restore`] accepts.
    ///
    /// [`restore`]: Self::restore
    pub fn saved_handlers(&self) -> Vec<SavedHandler> {
        self.tree
            .iter()
            .filter_map(|(_, record)| {
                let ty = self.types.get(record.type_handle())?;

                Some(SavedHandler {
                    type_name: ty.description().to_owned(),
                    first: record.first(),
                    last: record.last(),
                    user_tag: record.user_tag(),
                    description: record.description().to_owned(),
                })
            })
            .collect()
    }

    /// Recomputes the expected state of every page and counts the pages
    /// whose published state differs.
    ///
    /// Temporarily disabled pages under an active handler are accepted.
    pub fn verify_page_states(&self) -> usize {
        let mut mismatches = 0;

        for (address, page) in self.memory.pages() {
            let (expected, _) = expected_state(&self.tree, &self.types, address);
            let actual = page.state();

            if actual == expected || (actual == PageAccessState::Disabled && expected.is_active()) {
                continue;
            }

            tracing::warn!(%address, %expected, %actual, "page state out of sync");
            mismatches += 1;
        }

        mismatches
    }

    /// Calls `visitor` for every handler in ascending address order.
    pub fn visit_ascending(&self, visitor: impl FnMut(RecordHandle, &HandlerRecord)) {
        self.tree.visit_ascending(visitor);
    }

    /// Calls `visitor` for every handler in descending address order.
    pub fn visit_descending(&self, visitor: impl FnMut(RecordHandle, &HandlerRecord)) {
        self.tree.visit_descending(visitor);
    }

    fn active_notifier(&self) -> Option<&dyn ProtectionNotifier> {
        self.notifier
            .as_deref()
            .filter(|notifier| notifier.is_active())
    }

    fn validate(
        &self,
        first: Pa,
        last: Pa,
        type_handle: TypeHandle,
        user_tag: u64,
    ) -> Result<&HandlerType, InterceptError> {
        if first > last {
            return Err(InterceptError::InvalidRange { first, last });
        }

        let ty = self
            .types
            .get(type_handle)
            .ok_or(InterceptError::InvalidArgument("unknown handler type"))?;

        if ty.requires_full_pages() && !(first.is_page_aligned() && last.is_page_last()) {
            return Err(InterceptError::InvalidArgument(
                "range must consist of whole pages",
            ));
        }

        if ty.flags().contains(HandlerTypeFlags::OWNER_INDEXED) && u32::try_from(user_tag).is_err()
        {
            return Err(InterceptError::InvalidArgument("owner index must fit in 32 bits"));
        }

        if !self.memory.contains(first, last) {
            return Err(InterceptError::NoRamRange { first, last });
        }

        Ok(ty)
    }

    fn rollback(&mut self, handle: RecordHandle) {
        let Ok(record) = self.tree.remove(handle) else {
            return;
        };

        let mut sync = PageStateSync::new(
            &self.tree,
            &self.types,
            &mut self.memory,
            self.notifier.as_deref(),
        );
        sync.on_remove(&record);

        if let Err(err) = sync.finish() {
            tracing::error!(
                first = %record.first(),
                last = %record.last(),
                %err,
                "protection notifier failed during rollback"
            );
        }
    }
}
