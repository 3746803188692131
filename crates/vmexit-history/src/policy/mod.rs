//! Adaptive execution policy driven by the exit history.
//!
//! A hot exit site is first probed: one bounded quantum is executed to see
//! whether further exit-worthy instructions follow closely. A site that
//! keeps exiting is then run in extended quanta bounded by the distance
//! learned during the probe. Everything else is handled one instruction at
//! a time.

#[cfg(test)]
mod tests;

use vmexit_core::{ExecBackend, ExecLimits, ExecStats, HaltSignal, InterceptError};

use crate::{ExitAction, ExitHistoryCache, ExitSlot, HistoryConfig};

/// Outcome of [`ExitPolicyEngine::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecResult {
    /// The action that was carried out.
    pub action: ExitAction,

    /// Guest execution moved past the exiting instruction.
    pub continued: bool,

    /// Statistics reported by the backend.
    pub stats: ExecStats,
}

/// Counters of an [`ExitPolicyEngine`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PolicyStats {
    /// Exits handled one instruction at a time.
    pub normal: u64,

    /// Probes run.
    pub probes: u64,

    /// Probes that promoted their site to extended execution.
    pub probes_to_exec_with_max: u64,

    /// Probes that settled their site on normal handling.
    pub probes_to_normal: u64,

    /// Extended quanta run.
    pub exec_with_max: u64,

    /// Sites demoted because the backend could not run extended quanta.
    pub demotions: u64,

    /// Quanta cut short by a halt request.
    pub abandoned: u64,

    /// Instructions executed in any mode.
    pub instructions: u64,

    /// Exit-worthy instructions executed without leaving to the host.
    pub exits: u64,
}

/// Picks and carries out the execution mode for each tracked exit.
#[derive(Debug)]
pub struct ExitPolicyEngine {
    probe_limits: ExecLimits,
    exec_max_instructions: u32,
    halt: HaltSignal,
    stats: PolicyStats,
}

impl ExitPolicyEngine {
    /// Creates an engine with the probe and quantum bounds of `config`.
    pub fn new(config: &HistoryConfig) -> Self {
        Self {
            probe_limits: ExecLimits {
                min_instructions: config.probe_min_instructions,
                max_instructions: config.exec_max_instructions,
                max_instructions_without_exit: config.probe_max_instructions_without_exit,
            },
            exec_max_instructions: config.exec_max_instructions,
            halt: HaltSignal::new(),
            stats: PolicyStats::default(),
        }
    }

    /// Returns a handle other threads can raise to cut the current quantum
    /// short.
    pub fn halt_signal(&self) -> HaltSignal {
        self.halt.clone()
    }

    /// Returns the counters.
    pub fn stats(&self) -> &PolicyStats {
        &self.stats
    }

    /// Handles the exit that resolved to `slot`.
    ///
    /// A slot whose record was recycled in the meantime is handled as
    /// [`ExitAction::Normal`].
    pub fn execute(
        &mut self,
        cache: &mut ExitHistoryCache,
        slot: ExitSlot,
        backend: &mut dyn ExecBackend,
        will_exit: bool,
    ) -> Result<ExecResult, InterceptError> {
        let Some(record) = cache.record(slot) else {
            return self.single(backend, will_exit, ExitAction::Normal);
        };

        match record.action() {
            ExitAction::ExecProbe => self.probe(cache, slot, backend, will_exit),
            ExitAction::ExecWithMax => {
                let limits = ExecLimits {
                    min_instructions: 1,
                    max_instructions: self.exec_max_instructions,
                    max_instructions_without_exit: record.max_instructions_without_exit().max(1),
                };

                self.exec_with_max(cache, slot, backend, will_exit, limits)
            }
            ExitAction::Free => self.single(backend, will_exit, ExitAction::Normal),
            action @ (ExitAction::Normal | ExitAction::NormalProbed) => {
                self.single(backend, will_exit, action)
            }
        }
    }

    fn probe(
        &mut self,
        cache: &mut ExitHistoryCache,
        slot: ExitSlot,
        backend: &mut dyn ExecBackend,
        will_exit: bool,
    ) -> Result<ExecResult, InterceptError> {
        let Some(stats) = self.extended(cache, slot, backend, will_exit, self.probe_limits)? else {
            return self.single(backend, will_exit, ExitAction::Normal);
        };

        self.stats.probes += 1;

        let result = ExecResult {
            action: ExitAction::ExecProbe,
            continued: stats.instructions > 0,
            stats,
        };

        if stats.abandoned {
            return Ok(result);
        }

        let Some(record) = cache.record_mut(slot) else {
            return Ok(result);
        };

        if stats.exits >= 2 {
            let max = self.probe_limits.max_instructions_without_exit;
            let distance = stats.max_exit_distance.clamp(1, u32::from(max));
            let distance = u16::try_from(distance).unwrap_or(max);

            record.set_action(ExitAction::ExecWithMax);
            record.set_max_instructions_without_exit(distance);
            self.stats.probes_to_exec_with_max += 1;

            tracing::debug!(
                flat_pc = record.flat_pc(),
                exits = stats.exits,
                distance,
                "probe found repeating exits"
            );
        }
        else {
            record.set_action(ExitAction::NormalProbed);
            self.stats.probes_to_normal += 1;

            tracing::debug!(
                flat_pc = record.flat_pc(),
                exits = stats.exits,
                "probe found no repeating exits"
            );
        }

        Ok(result)
    }

    fn exec_with_max(
        &mut self,
        cache: &mut ExitHistoryCache,
        slot: ExitSlot,
        backend: &mut dyn ExecBackend,
        will_exit: bool,
        limits: ExecLimits,
    ) -> Result<ExecResult, InterceptError> {
        let Some(stats) = self.extended(cache, slot, backend, will_exit, limits)? else {
            return self.single(backend, will_exit, ExitAction::Normal);
        };

        self.stats.exec_with_max += 1;

        Ok(ExecResult {
            action: ExitAction::ExecWithMax,
            continued: stats.instructions > 0,
            stats,
        })
    }

    /// Runs one extended quantum.
    ///
    /// Returns `None` when the quantum did not run and the exit must be
    /// handled one instruction at a time. If that is because the backend
    /// lacks the capability, the site has been demoted to
    /// [`ExitAction::Normal`].
    fn extended(
        &mut self,
        cache: &mut ExitHistoryCache,
        slot: ExitSlot,
        backend: &mut dyn ExecBackend,
        will_exit: bool,
        limits: ExecLimits,
    ) -> Result<Option<ExecStats>, InterceptError> {
        if self.halt.is_raised() {
            tracing::trace!(flat_pc = slot.flat_pc(), "halt pending, extended execution skipped");
            return Ok(None);
        }

        if !backend.can_exec_with_max() {
            self.demote(cache, slot);
            return Ok(None);
        }

        let stats = match backend.exec_for_exits(will_exit, limits, &self.halt) {
            Ok(stats) => stats,
            Err(InterceptError::NotSupported) => {
                self.demote(cache, slot);
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        self.account(&stats);

        if stats.abandoned {
            self.stats.abandoned += 1;
            tracing::trace!(flat_pc = slot.flat_pc(), "quantum abandoned");
        }

        Ok(Some(stats))
    }

    fn single(
        &mut self,
        backend: &mut dyn ExecBackend,
        will_exit: bool,
        action: ExitAction,
    ) -> Result<ExecResult, InterceptError> {
        let stats = backend.exec_for_exits(will_exit, ExecLimits::SINGLE, &self.halt)?;

        self.stats.normal += 1;
        self.account(&stats);

        Ok(ExecResult {
            action,
            continued: stats.instructions > 0,
            stats,
        })
    }

    fn demote(&mut self, cache: &mut ExitHistoryCache, slot: ExitSlot) {
        let Some(record) = cache.record_mut(slot) else {
            return;
        };

        if self.stats.demotions == 0 {
            tracing::warn!(
                flat_pc = record.flat_pc(),
                action = %record.action(),
                "backend cannot run extended quanta, demoting exit site"
            );
        }
        else {
            tracing::trace!(
                flat_pc = record.flat_pc(),
                action = %record.action(),
                "demoting exit site"
            );
        }

        record.set_action(ExitAction::Normal);
        record.restart_hits();
        self.stats.demotions += 1;
    }

    fn account(&mut self, stats: &ExecStats) {
        self.stats.instructions += u64::from(stats.instructions);
        self.stats.exits += u64::from(stats.exits);
    }
}
