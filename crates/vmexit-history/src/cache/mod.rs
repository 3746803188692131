//! Per-vCPU table of recently seen exit sites.


use std::collections::VecDeque;

use vmexit_core::{InterceptError, VcpuId};
use zerocopy::{FromZeros, IntoBytes};

use crate::{ExitAction, ExitFlags, ExitFlagsAndType, ExitRecord, HistoryConfig};

/// Program counter value of an exit whose PC has not been read yet.
pub const UNKNOWN_PC: u64 = u64::MAX;

/// Number of exits kept in the history ring.
pub const HISTORY_LENGTH: usize = 256;

/// Identifies the record an exit resolved to.
///
/// A slot stays valid only as long as the record still holds the same
/// key; [`ExitHistoryCache::record`] returns `None` once it was recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitSlot {
    index: u32,
    flat_pc: u64,
    flags_and_type: ExitFlagsAndType,
}

impl ExitSlot {
    /// Returns the index of the record in the table.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Returns the program counter of the key.
    pub fn flat_pc(&self) -> u64 {
        self.flat_pc
    }

    /// Returns the exit type and flags of the key.
    pub fn flags_and_type(&self) -> ExitFlagsAndType {
        self.flags_and_type
    }
}

/// One exit in the history ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitHistoryEntry {
    exit_no: u64,
    flat_pc: u64,
    flags_and_type: ExitFlagsAndType,
    timestamp: u64,
    slot: Option<u32>,
}

impl ExitHistoryEntry {
    /// Returns the exit number.
    pub fn exit_no(&self) -> u64 {
        self.exit_no
    }

    /// Returns the program counter, or [`UNKNOWN_PC`].
    pub fn flat_pc(&self) -> u64 {
        self.flat_pc
    }

    /// Returns the exit type and flags.
    pub fn flags_and_type(&self) -> ExitFlagsAndType {
        self.flags_and_type
    }

    /// Returns the timestamp passed by the caller.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Returns the index of the record the exit resolved to.
    pub fn slot(&self) -> Option<u32> {
        self.slot
    }
}

/// Counters of an [`ExitHistoryCache`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Exits seen.
    pub exits: u64,

    /// Exits that hit an existing record.
    pub hits: u64,

    /// Records claimed for a new key.
    pub new_records: u64,

    /// Claims that overwrote a record of another key.
    pub replaced: u64,

    /// Exits of a kind that is not tracked.
    pub untracked: u64,
}

/// Fixed-capacity exit history of one vCPU.
pub struct ExitHistoryCache {
    vcpu: VcpuId,
    config: HistoryConfig,
    records: Box<[ExitRecord]>,
    mask: usize,
    exit_no: u64,
    history: VecDeque<ExitHistoryEntry>,
    stats: CacheStats,
}

impl ExitHistoryCache {
    /// Creates an empty history.
    pub fn new(vcpu: VcpuId, config: HistoryConfig) -> Result<Self, InterceptError> {
        config.validate()?;

        let capacity = config.capacity;
        Ok(Self {
            vcpu,
            config,
            records: vec![ExitRecord::new_zeroed(); capacity].into_boxed_slice(),
            mask: capacity - 1,
            exit_no: 0,
            history: VecDeque::with_capacity(HISTORY_LENGTH),
            stats: CacheStats::default(),
        })
    }

    /// Returns the vCPU this history belongs to.
    pub fn vcpu(&self) -> VcpuId {
        self.vcpu
    }

    /// Returns the configuration.
    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Records a VM exit.
    ///
    /// Returns the record the exit resolved to, or `None` when the exit is
    /// not tracked or its PC is still [`UNKNOWN_PC`]. The exit is added to
    /// the history ring either way.
    pub fn add_exit(
        &mut self,
        flags_and_type: ExitFlagsAndType,
        flat_pc: u64,
        timestamp: u64,
    ) -> Option<ExitSlot> {
        self.exit_no += 1;
        self.stats.exits += 1;

        if self.history.len() == HISTORY_LENGTH {
            self.history.pop_back();
        }

        self.history.push_front(ExitHistoryEntry {
            exit_no: self.exit_no,
            flat_pc,
            flags_and_type,
            timestamp,
            slot: None,
        });

        if !self.config.tracks(flags_and_type.kind()) {
            self.stats.untracked += 1;
            return None;
        }

        let slot = self.track(flags_and_type, flat_pc);
        self.set_current_slot(slot);
        slot
    }

    /// Replaces the exit type of the current exit.
    pub fn update_flags_and_type(&mut self, flags_and_type: ExitFlagsAndType) -> Option<ExitSlot> {
        let flat_pc = self.history.front()?.flat_pc;
        self.refine(flags_and_type, flat_pc)
    }

    /// Replaces the exit type and PC of the current exit.
    pub fn update_flags_and_type_and_pc(
        &mut self,
        flags_and_type: ExitFlagsAndType,
        flat_pc: u64,
    ) -> Option<ExitSlot> {
        self.refine(flags_and_type, flat_pc)
    }

    /// Supplies the PC of the current exit.
    ///
    /// `flattened` tells whether the code-segment base is folded into
    /// `flat_pc`. Unflattened PCs are marked with
    /// [`ExitFlags::UNFLATTENED_PC`] so they never match flattened ones.
    pub fn update_pc(&mut self, flat_pc: u64, flattened: bool) -> Option<ExitSlot> {
        let current = self.history.front()?.flags_and_type;
        let flags_and_type = if flattened {
            current.without_flags(ExitFlags::UNFLATTENED_PC)
        }
        else {
            current.with_flags(ExitFlags::UNFLATTENED_PC)
        };

        self.refine(flags_and_type, flat_pc)
    }

    /// Returns the record behind `slot`, unless it was recycled.
    pub fn record(&self, slot: ExitSlot) -> Option<&ExitRecord> {
        self.records
            .get(slot.index as usize)
            .filter(|record| record.matches(slot.flags_and_type, slot.flat_pc))
    }

    pub(crate) fn record_mut(&mut self, slot: ExitSlot) -> Option<&mut ExitRecord> {
        self.records
            .get_mut(slot.index as usize)
            .filter(|record| record.matches(slot.flags_and_type, slot.flat_pc))
    }

    /// Returns the table index a key hashes to.
    pub fn slot_of(&self, flags_and_type: ExitFlagsAndType, flat_pc: u64) -> usize {
        let key = flat_pc ^ u64::from(flags_and_type.0).wrapping_mul(0xff51_afd7_ed55_8ccd);
        (key.wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 32) as usize & self.mask
    }

    /// Returns the number of records in use.
    pub fn occupancy(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.action() != ExitAction::Free)
            .count()
    }

    /// Returns the number of the latest exit.
    pub fn exit_count(&self) -> u64 {
        self.exit_no
    }

    /// Iterates over the history ring, newest exit first.
    pub fn recent(&self) -> impl Iterator<Item = &ExitHistoryEntry> {
        self.history.iter()
    }

    /// Returns the counters.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Returns the raw record table.
    pub fn as_bytes(&self) -> &[u8] {
        self.records.as_bytes()
    }

    /// Forgets all records, the history ring and the counters.
    pub fn reset(&mut self) {
        self.records.fill(ExitRecord::new_zeroed());
        self.history.clear();
        self.exit_no = 0;
        self.stats = CacheStats::default();
    }

    fn refine(&mut self, flags_and_type: ExitFlagsAndType, flat_pc: u64) -> Option<ExitSlot> {
        let entry = self.history.front_mut()?;
        entry.flags_and_type = flags_and_type;
        entry.flat_pc = flat_pc;

        let slot = self.track(flags_and_type, flat_pc);
        self.set_current_slot(slot);
        slot
    }

    fn track(&mut self, flags_and_type: ExitFlagsAndType, flat_pc: u64) -> Option<ExitSlot> {
        if !self.config.tracks(flags_and_type.kind()) || flat_pc == UNKNOWN_PC {
            return None;
        }

        Some(self.resolve(flags_and_type, flat_pc, self.exit_no))
    }

    fn set_current_slot(&mut self, slot: Option<ExitSlot>) {
        if let Some(entry) = self.history.front_mut() {
            entry.slot = slot.map(|slot| slot.index);
        }
    }

    fn resolve(&mut self, flags_and_type: ExitFlagsAndType, flat_pc: u64, exit_no: u64) -> ExitSlot {
        let index = self.slot_of(flags_and_type, flat_pc);
        let record = &mut self.records[index];

        if record.matches(flags_and_type, flat_pc) {
            if exit_no > record.last_exit_no() {
                let distance = exit_no - record.last_exit_no();
                record.hit(exit_no);
                self.stats.hits += 1;

                if record.action() == ExitAction::Normal
                    && record.hits() >= self.config.probe_hit_threshold
                    && distance <= self.config.probe_window
                {
                    record.set_action(ExitAction::ExecProbe);

                    tracing::debug!(
                        vcpu = %self.vcpu,
                        flat_pc,
                        %flags_and_type,
                        hits = record.hits(),
                        "exit site marked for probing"
                    );
                }
            }
        }
        else {
            if record.action() != ExitAction::Free {
                self.stats.replaced += 1;

                tracing::trace!(
                    vcpu = %self.vcpu,
                    index,
                    evicted_pc = record.flat_pc(),
                    flat_pc,
                    "exit record recycled"
                );
            }

            record.claim(flags_and_type, flat_pc, exit_no);
            self.stats.new_records += 1;
        }

        ExitSlot {
            index: index as u32,
            flat_pc,
            flags_and_type,
        }
    }
}

impl std::fmt::Debug for ExitHistoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ExitHistoryCache")
            .field("vcpu", &self.vcpu)
            .field("capacity", &self.records.len())
            .field("exit_no", &self.exit_no)
            .field("stats", &self.stats)
            .finish()
    }
}
