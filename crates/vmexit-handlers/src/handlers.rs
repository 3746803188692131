use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use vmexit_core::{
    HandlerKind, Hpa, InterceptError, Pa, PageAccessState, PageType, ProtectionNotifier,
};

use crate::{
    AccessOutcome, HandlerConfig, HandlerContext, HandlerRecord, HandlerTypeFlags, HandlerUser,
    PhysAccess, PhysAccessHandler, PhysHandlerState, RecordHandle, SavedHandler, TypeHandle,
};

/// The physical handler registry shared by all vCPUs of a VM.
///
/// Every operation takes one VM-wide lock around [`PhysHandlerState`].
/// Use [`lock`] to batch several operations under one acquisition.
///
/// [`lock`]: Self::lock
pub struct PhysHandlers {
    state: Mutex<PhysHandlerState>,
}

impl PhysHandlers {
    /// Creates an empty registry.
    pub fn new(config: HandlerConfig) -> Self {
        Self::from(PhysHandlerState::new(config))
    }

    /// Sets the secondary execution engine to notify of protection
    /// changes.
    pub fn with_notifier(self, notifier: Arc<dyn ProtectionNotifier>) -> Self {
        let state = self
            .state
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);

        Self::from(state.with_notifier(notifier))
    }

    /// Acquires the registry lock.
    ///
    /// The registry stays usable after a panic while the lock was held;
    /// every mutation leaves the tree consistent before it can panic.
    pub fn lock(&self) -> MutexGuard<'_, PhysHandlerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a handler type.
    pub fn register_type(
        &self,
        kind: HandlerKind,
        flags: HandlerTypeFlags,
        handler: Arc<dyn PhysAccessHandler>,
        description: impl Into<String>,
    ) -> Result<TypeHandle, InterceptError> {
        self.lock().register_type(kind, flags, handler, description)
    }

    /// Registers guest memory.
    pub fn register_ram(
        &self,
        first: Pa,
        pages: u64,
        host: Hpa,
        page_type: PageType,
        description: impl Into<String>,
    ) -> Result<(), InterceptError> {
        self.lock()
            .register_ram(first, pages, host, page_type, description)
    }

    /// Registers a handler range. See [`PhysHandlerState::register`].
    pub fn register(
        &self,
        first: Pa,
        last: Pa,
        type_handle: TypeHandle,
        user_tag: u64,
        description: impl Into<String>,
    ) -> Result<RecordHandle, InterceptError> {
        self.lock()
            .register(first, last, type_handle, user_tag, description)
    }

    /// Deregisters a handler range.
    pub fn deregister(&self, handle: RecordHandle) -> Result<(), InterceptError> {
        self.lock().deregister(handle)
    }

    /// Deregisters the handler starting at `first`.
    pub fn deregister_at(&self, first: Pa) -> Result<(), InterceptError> {
        self.lock().deregister_at(first)
    }

    /// Finds the handler registered for exactly `first..=last`.
    pub fn find_exact(&self, first: Pa, last: Pa) -> Option<RecordHandle> {
        self.lock().find_exact(first, last)
    }

    /// Returns a copy of the record behind `handle`.
    pub fn record(&self, handle: RecordHandle) -> Option<HandlerRecord> {
        self.lock().record(handle).cloned()
    }

    /// Returns a copy of the handler whose range contains `address`.
    pub fn lookup(&self, address: Pa) -> Option<(RecordHandle, HandlerRecord)> {
        self.lock()
            .lookup(address)
            .map(|(handle, record)| (handle, record.clone()))
    }

    /// Checks whether a handler covers `address`.
    pub fn is_registered(&self, address: Pa) -> bool {
        self.lock().is_registered(address)
    }

    /// Checks whether the handler covering `address` intercepts all
    /// accesses.
    pub fn is_all(&self, address: Pa) -> bool {
        self.lock().is_all(address)
    }

    /// Returns the access state of the page containing `address`.
    pub fn page_state(&self, address: Pa) -> Option<PageAccessState> {
        self.lock().page_state(address)
    }

    /// Replaces the user tag of the handler starting at `first`.
    pub fn change_user_tag(&self, first: Pa, user_tag: u64) -> Result<(), InterceptError> {
        self.lock().change_user_tag(first, user_tag)
    }

    /// Temporarily switches off monitoring of one page.
    pub fn page_temp_off(&self, first: Pa, page: Pa) -> Result<(), InterceptError> {
        self.lock().page_temp_off(first, page)
    }

    /// Re-arms the temporarily disabled pages of a handler.
    pub fn reset(&self, first: Pa) -> Result<(), InterceptError> {
        self.lock().reset(first)
    }

    /// Recomputes every page access state from the tree.
    pub fn rebuild_all(&self) -> Result<(), InterceptError> {
        self.lock().rebuild_all()
    }

    /// Replays a saved handler list.
    pub fn restore(
        &self,
        saved: impl IntoIterator<Item = SavedHandler>,
    ) -> Result<usize, InterceptError> {
        self.lock().restore(saved)
    }

    /// Returns the registered handlers in the form [`restore`] accepts.
    ///
    /// [`restore`]: Self::restore
    pub fn saved_handlers(&self) -> Vec<SavedHandler> {
        self.lock().saved_handlers()
    }

    /// Counts pages whose published state disagrees with the tree.
    pub fn verify_page_states(&self) -> usize {
        self.lock().verify_page_states()
    }

    /// Dispatches an intercepted access to the handler covering it.
    ///
    /// Returns [`AccessOutcome::Default`] without invoking any callback if
    /// no handler covers the address or monitoring of the page is
    /// temporarily off. Callbacks of [`KEEP_LOCK`] types run with the
    /// registry lock held, all others after it was released.
    ///
    /// [`KEEP_LOCK`]: HandlerTypeFlags::KEEP_LOCK
    pub fn handle_access(&self, access: &mut PhysAccess<'_>) -> Result<AccessOutcome, InterceptError> {
        let address = access.address();
        let mut state = self.lock();

        if state.page_state(address) == Some(PageAccessState::Disabled) {
            tracing::trace!(%address, "page monitoring is off");
            return Ok(AccessOutcome::Default);
        }

        let Some((handle, record)) = state.lookup(address) else {
            tracing::trace!(%address, "no handler");
            return Ok(AccessOutcome::Default);
        };

        let ty = state
            .types()
            .get(record.type_handle())
            .ok_or(InterceptError::NotFound)?;

        let handler = Arc::clone(ty.handler());
        let keep_lock = ty.flags().contains(HandlerTypeFlags::KEEP_LOCK);
        let user = if ty.flags().contains(HandlerTypeFlags::OWNER_INDEXED) {
            HandlerUser::Owner(record.user_tag() as u32)
        }
        else {
            HandlerUser::Tag(record.user_tag())
        };

        if let Some(record) = state.tree.get_mut(handle) {
            record.stats_mut().hits += 1;
        }

        tracing::trace!(
            %address,
            vcpu = %access.vcpu(),
            access = ?access.access_type(),
            %handle,
            keep_lock,
            "dispatching access"
        );

        let start = Instant::now();
        let result;

        let mut state = if keep_lock {
            result = handler.handle(HandlerContext::Locked(&mut *state), access, user);
            state
        }
        else {
            drop(state);
            result = handler.handle(HandlerContext::Unlocked(self), access, user);
            self.lock()
        };

        let ticks = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);
        if let Some(record) = state.tree.get_mut(handle) {
            record.stats_mut().ticks += ticks;
        }

        result
    }
}

impl From<PhysHandlerState> for PhysHandlers {
    fn from(state: PhysHandlerState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }
}

impl Default for PhysHandlers {
    fn default() -> Self {
        Self::new(HandlerConfig::default())
    }
}
