use vmexit_core::{ExecBackend, HaltSignal, InterceptError, VcpuId};

use crate::{ExecResult, ExitFlagsAndType, ExitHistoryCache, ExitPolicyEngine, HistoryConfig};

/// The exit history of one vCPU together with its execution policy.
#[derive(Debug)]
pub struct VcpuExitHistory {
    cache: ExitHistoryCache,
    engine: ExitPolicyEngine,
}

impl VcpuExitHistory {
    /// Creates the history of `vcpu`.
    pub fn new(vcpu: VcpuId, config: HistoryConfig) -> Result<Self, InterceptError> {
        let engine = ExitPolicyEngine::new(&config);
        let cache = ExitHistoryCache::new(vcpu, config)?;
        Ok(Self { cache, engine })
    }

    /// Returns the exit history.
    pub fn cache(&self) -> &ExitHistoryCache {
        &self.cache
    }

    /// Returns the exit history for refining the current exit.
    pub fn cache_mut(&mut self) -> &mut ExitHistoryCache {
        &mut self.cache
    }

    /// Returns the execution policy.
    pub fn engine(&self) -> &ExitPolicyEngine {
        &self.engine
    }

    /// Returns the halt signal of the execution policy.
    pub fn halt_signal(&self) -> HaltSignal {
        self.engine.halt_signal()
    }

    /// Records an exit and handles it according to its history.
    ///
    /// Returns `None` when the exit is not tracked; the caller handles it
    /// on its own.
    pub fn on_exit(
        &mut self,
        flags_and_type: ExitFlagsAndType,
        flat_pc: u64,
        timestamp: u64,
        backend: &mut dyn ExecBackend,
        will_exit: bool,
    ) -> Result<Option<ExecResult>, InterceptError> {
        let Some(slot) = self.cache.add_exit(flags_and_type, flat_pc, timestamp) else {
            return Ok(None);
        };

        self.engine
            .execute(&mut self.cache, slot, backend, will_exit)
            .map(Some)
    }

    /// Supplies the PC of an exit that was recorded without one, then
    /// handles it.
    pub fn on_pc_resolved(
        &mut self,
        flat_pc: u64,
        flattened: bool,
        backend: &mut dyn ExecBackend,
        will_exit: bool,
    ) -> Result<Option<ExecResult>, InterceptError> {
        let Some(slot) = self.cache.update_pc(flat_pc, flattened) else {
            return Ok(None);
        };

        self.engine
            .execute(&mut self.cache, slot, backend, will_exit)
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use vmexit_core::{ExecLimits, ExecStats};

    use super::*;
    use crate::{ExitAction, ExitKind, UNKNOWN_PC};

    struct Interpreter {
        executed: u32,
    }

    impl ExecBackend for Interpreter {
        fn can_exec_with_max(&self) -> bool {
            true
        }

        fn exec_for_exits(
            &mut self,
            _will_exit: bool,
            limits: ExecLimits,
            _halt: &HaltSignal,
        ) -> Result<ExecStats, InterceptError> {
            self.executed += limits.min_instructions;

            Ok(ExecStats {
                instructions: limits.min_instructions,
                exits: limits.min_instructions / 4,
                max_exit_distance: 4,
                abandoned: false,
            })
        }
    }

    #[test]
    fn hot_port_loop_gets_extended_quanta() -> Result<(), InterceptError> {
        let mut history = VcpuExitHistory::new(VcpuId(0), HistoryConfig::default())?;
        let mut backend = Interpreter { executed: 0 };
        let ft = ExitFlagsAndType::new(ExitKind::Vmx, 30);

        let mut actions = Vec::new();
        for timestamp in 0..20 {
            let result = history.on_exit(ft, 0x8000_1000, timestamp, &mut backend, true)?;
            actions.push(result.map(|result| result.action));
        }

        assert_eq!(actions[0], Some(ExitAction::Normal));
        assert_eq!(actions[15], Some(ExitAction::ExecProbe));
        assert_eq!(actions[16], Some(ExitAction::ExecWithMax));
        assert_eq!(history.engine().stats().probes_to_exec_with_max, 1);
        assert_eq!(backend.executed, 15 + 75 + 4);
        Ok(())
    }

    #[test]
    fn deferred_pc() -> Result<(), InterceptError> {
        let mut history = VcpuExitHistory::new(VcpuId(0), HistoryConfig::default())?;
        let mut backend = Interpreter { executed: 0 };
        let ft = ExitFlagsAndType::new(ExitKind::Svm, 0x7b);

        assert_eq!(history.on_exit(ft, UNKNOWN_PC, 0, &mut backend, true)?, None);
        assert_eq!(backend.executed, 0);

        let result = history.on_pc_resolved(0x1000, true, &mut backend, true)?;
        assert_eq!(result.map(|result| result.action), Some(ExitAction::Normal));
        assert_eq!(history.cache().exit_count(), 1);
        Ok(())
    }
}
