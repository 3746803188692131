use std::collections::VecDeque;

use proptest::prelude::*;
use vmexit_core::VcpuId;

use super::*;
use crate::{ExitFlagsAndType, ExitKind, ExitRecord, em};

////////////////////////////////////////////////////////////////////////////////
// Mock backend
////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct MockBackend {
    incapable: bool,
    script: VecDeque<Result<ExecStats, InterceptError>>,
    calls: Vec<(bool, ExecLimits)>,
}

impl MockBackend {
    fn push(&mut self, result: Result<ExecStats, InterceptError>) -> &mut Self {
        self.script.push_back(result);
        self
    }
}

impl ExecBackend for MockBackend {
    fn can_exec_with_max(&self) -> bool {
        !self.incapable
    }

    fn exec_for_exits(
        &mut self,
        will_exit: bool,
        limits: ExecLimits,
        _halt: &HaltSignal,
    ) -> Result<ExecStats, InterceptError> {
        self.calls.push((will_exit, limits));

        self.script.pop_front().unwrap_or(Ok(ExecStats {
            instructions: limits.min_instructions,
            ..ExecStats::default()
        }))
    }
}

fn quantum(instructions: u32, exits: u32, max_exit_distance: u32) -> ExecStats {
    ExecStats {
        instructions,
        exits,
        max_exit_distance,
        abandoned: false,
    }
}

////////////////////////////////////////////////////////////////////////////////
// Helpers
////////////////////////////////////////////////////////////////////////////////

const PC: u64 = 0xfffff806_1000_2000;

fn setup() -> (ExitHistoryCache, ExitPolicyEngine) {
    let config = HistoryConfig::default();
    let engine = ExitPolicyEngine::new(&config);
    let cache = ExitHistoryCache::new(VcpuId(1), config).expect("valid config");
    (cache, engine)
}

fn ft() -> ExitFlagsAndType {
    ExitFlagsAndType::new(ExitKind::Em, em::IO_PORT_READ)
}

/// Adds exits at `PC` until the site is marked for probing.
fn heat(cache: &mut ExitHistoryCache) -> ExitSlot {
    loop {
        let slot = cache.add_exit(ft(), PC, 0).expect("tracked");
        if cache.record(slot).map(ExitRecord::action) == Some(ExitAction::ExecProbe) {
            return slot;
        }
    }
}

fn action(cache: &ExitHistoryCache, slot: ExitSlot) -> Option<ExitAction> {
    cache.record(slot).map(ExitRecord::action)
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////

#[test]
fn normal_sites_execute_one_instruction() -> Result<(), InterceptError> {
    let (mut cache, mut engine) = setup();
    let mut backend = MockBackend::default();

    let slot = cache.add_exit(ft(), PC, 0).expect("tracked");
    let result = engine.execute(&mut cache, slot, &mut backend, true)?;

    assert_eq!(result.action, ExitAction::Normal);
    assert!(result.continued);
    assert_eq!(backend.calls, vec![(true, ExecLimits::SINGLE)]);
    assert_eq!(engine.stats().normal, 1);
    Ok(())
}

#[test]
fn successful_probe_enables_extended_execution() -> Result<(), InterceptError> {
    let (mut cache, mut engine) = setup();
    let mut backend = MockBackend::default();
    backend.push(Ok(quantum(200, 5, 12)));

    let slot = heat(&mut cache);
    let result = engine.execute(&mut cache, slot, &mut backend, true)?;

    assert_eq!(result.action, ExitAction::ExecProbe);
    assert_eq!(result.stats.exits, 5);
    assert_eq!(
        backend.calls[0].1,
        ExecLimits {
            min_instructions: 75,
            max_instructions: 8192,
            max_instructions_without_exit: 24,
        }
    );

    let record = cache.record(slot).expect("live record");
    assert_eq!(record.action(), ExitAction::ExecWithMax);
    assert_eq!(record.max_instructions_without_exit(), 12);

    let slot = cache.add_exit(ft(), PC, 0).expect("tracked");
    let result = engine.execute(&mut cache, slot, &mut backend, false)?;

    assert_eq!(result.action, ExitAction::ExecWithMax);
    assert_eq!(
        backend.calls[1],
        (
            false,
            ExecLimits {
                min_instructions: 1,
                max_instructions: 8192,
                max_instructions_without_exit: 12,
            }
        )
    );

    assert_eq!(engine.stats().probes_to_exec_with_max, 1);
    assert_eq!(engine.stats().exec_with_max, 1);
    Ok(())
}

#[test]
fn learned_distance_is_clamped() -> Result<(), InterceptError> {
    for (observed, learned) in [(1000, 24), (0, 1), (7, 7)] {
        let (mut cache, mut engine) = setup();
        let mut backend = MockBackend::default();
        backend.push(Ok(quantum(100, 3, observed)));

        let slot = heat(&mut cache);
        engine.execute(&mut cache, slot, &mut backend, true)?;

        let record = cache.record(slot).expect("live record");
        assert_eq!(record.max_instructions_without_exit(), learned);
    }

    Ok(())
}

#[test]
fn probe_without_repeats_settles_on_normal() -> Result<(), InterceptError> {
    let (mut cache, mut engine) = setup();
    let mut backend = MockBackend::default();
    backend.push(Ok(quantum(75, 1, 0)));

    let slot = heat(&mut cache);
    engine.execute(&mut cache, slot, &mut backend, true)?;
    assert_eq!(action(&cache, slot), Some(ExitAction::NormalProbed));

    // More hits never restart probing.
    for _ in 0..100 {
        let slot = cache.add_exit(ft(), PC, 0).expect("tracked");
        let result = engine.execute(&mut cache, slot, &mut backend, true)?;
        assert_eq!(result.action, ExitAction::NormalProbed);
    }

    assert_eq!(action(&cache, slot), Some(ExitAction::NormalProbed));
    assert_eq!(engine.stats().probes, 1);
    assert_eq!(engine.stats().probes_to_normal, 1);
    Ok(())
}

#[test]
fn capability_loss_demotes_to_normal() -> Result<(), InterceptError> {
    let (mut cache, mut engine) = setup();
    let mut backend = MockBackend {
        incapable: true,
        ..MockBackend::default()
    };

    let slot = heat(&mut cache);
    let result = engine.execute(&mut cache, slot, &mut backend, true)?;

    assert_eq!(result.action, ExitAction::Normal);
    assert_eq!(backend.calls, vec![(true, ExecLimits::SINGLE)]);
    assert_eq!(action(&cache, slot), Some(ExitAction::Normal));
    assert_eq!(engine.stats().demotions, 1);
    Ok(())
}

#[test]
fn demoted_sites_need_a_fresh_streak() -> Result<(), InterceptError> {
    let (mut cache, mut engine) = setup();
    let mut backend = MockBackend {
        incapable: true,
        ..MockBackend::default()
    };

    let mut marked = Vec::new();
    for exit in 0..50 {
        let slot = cache.add_exit(ft(), PC, 0).expect("tracked");
        if action(&cache, slot) == Some(ExitAction::ExecProbe) {
            marked.push(exit);
        }

        let result = engine.execute(&mut cache, slot, &mut backend, true)?;
        assert_eq!(result.action, ExitAction::Normal);
    }

    assert_eq!(marked, [15, 30, 45]);
    assert_eq!(engine.stats().demotions, 3);
    assert_eq!(engine.stats().normal, 50);
    assert!(
        backend
            .calls
            .iter()
            .all(|&(_, limits)| limits == ExecLimits::SINGLE)
    );
    Ok(())
}

#[test]
fn unsupported_quantum_demotes_to_normal() -> Result<(), InterceptError> {
    let (mut cache, mut engine) = setup();
    let mut backend = MockBackend::default();
    backend.push(Ok(quantum(100, 4, 3)));

    let slot = heat(&mut cache);
    engine.execute(&mut cache, slot, &mut backend, true)?;
    assert_eq!(action(&cache, slot), Some(ExitAction::ExecWithMax));

    backend.push(Err(InterceptError::NotSupported));

    let slot = cache.add_exit(ft(), PC, 0).expect("tracked");
    let result = engine.execute(&mut cache, slot, &mut backend, true)?;

    assert_eq!(result.action, ExitAction::Normal);
    assert_eq!(backend.calls.len(), 3);
    assert_eq!(backend.calls[2].1, ExecLimits::SINGLE);
    assert_eq!(action(&cache, slot), Some(ExitAction::Normal));
    Ok(())
}

#[test]
fn backend_failures_propagate() {
    let (mut cache, mut engine) = setup();
    let mut backend = MockBackend::default();
    backend.push(Err(InterceptError::backend(std::io::Error::other("emulator crashed"))));

    let slot = heat(&mut cache);
    let result = engine.execute(&mut cache, slot, &mut backend, true);

    assert!(matches!(result, Err(InterceptError::Backend(_))));
    assert_eq!(action(&cache, slot), Some(ExitAction::ExecProbe));
}

#[test]
fn pending_halt_skips_extended_execution() -> Result<(), InterceptError> {
    let (mut cache, mut engine) = setup();
    let mut backend = MockBackend::default();

    let slot = heat(&mut cache);
    engine.halt_signal().raise();

    let result = engine.execute(&mut cache, slot, &mut backend, true)?;
    assert_eq!(result.action, ExitAction::Normal);
    assert_eq!(backend.calls, vec![(true, ExecLimits::SINGLE)]);
    assert_eq!(action(&cache, slot), Some(ExitAction::ExecProbe));
    assert_eq!(engine.stats().demotions, 0);
    Ok(())
}

#[test]
fn abandoned_probe_is_not_a_verdict() -> Result<(), InterceptError> {
    let (mut cache, mut engine) = setup();
    let mut backend = MockBackend::default();
    backend.push(Ok(ExecStats {
        abandoned: true,
        ..quantum(10, 3, 2)
    }));

    let slot = heat(&mut cache);
    let result = engine.execute(&mut cache, slot, &mut backend, true)?;

    assert!(result.stats.abandoned);
    assert_eq!(action(&cache, slot), Some(ExitAction::ExecProbe));
    assert_eq!(engine.stats().abandoned, 1);
    Ok(())
}

#[test]
fn recycled_slot_is_handled_normally() -> Result<(), InterceptError> {
    let (mut cache, mut engine) = setup();
    let mut backend = MockBackend::default();

    let slot = heat(&mut cache);
    cache.reset();

    let result = engine.execute(&mut cache, slot, &mut backend, true)?;
    assert_eq!(result.action, ExitAction::Normal);
    assert_eq!(backend.calls, vec![(true, ExecLimits::SINGLE)]);
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// Escalation order
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
struct Step {
    capable: bool,
    outcome: Option<(u32, bool)>,
}

fn step() -> impl Strategy<Value = Step> {
    (
        prop::bool::weighted(0.9),
        prop::option::weighted(0.9, (0u32..4, prop::bool::weighted(0.1))),
    )
        .prop_map(|(capable, outcome)| Step { capable, outcome })
}

fn allowed(before: ExitAction, after: ExitAction, demotion_possible: bool) -> bool {
    use ExitAction::*;

    match (before, after) {
        (a, b) if a == b => true,
        (Free, Normal) => true,
        (Normal, ExecProbe) => true,
        (ExecProbe, ExecWithMax | NormalProbed) => true,
        (ExecProbe | ExecWithMax, Normal) => demotion_possible,
        _ => false,
    }
}

proptest! {
    #[test]
    fn actions_escalate_in_order(steps in prop::collection::vec(step(), 1..200)) {
        let config = HistoryConfig::default().with_probe_trigger(3, 8);
        let mut engine = ExitPolicyEngine::new(&config);
        let mut cache = ExitHistoryCache::new(VcpuId(0), config).expect("valid config");

        let mut current = ExitAction::Free;

        for step in steps {
            let slot = cache.add_exit(ft(), PC, 0).expect("tracked");
            let after_exit = action(&cache, slot).expect("live record");
            prop_assert!(allowed(current, after_exit, false), "{current} -> {after_exit}");

            let mut backend = MockBackend {
                incapable: !step.capable,
                ..MockBackend::default()
            };

            // Only an extended quantum may be refused; single steps always
            // run.
            let extended = step.capable
                && matches!(after_exit, ExitAction::ExecProbe | ExitAction::ExecWithMax);

            let demotion_possible = match step.outcome {
                Some((exits, abandoned)) => {
                    backend.push(Ok(ExecStats {
                        abandoned,
                        ..quantum(100, exits, 5)
                    }));
                    !step.capable
                }
                None if extended => {
                    backend.push(Err(InterceptError::NotSupported));
                    true
                }
                None => !step.capable,
            };

            engine
                .execute(&mut cache, slot, &mut backend, true)
                .expect("recoverable");

            let after_execute = action(&cache, slot).expect("live record");
            prop_assert!(
                allowed(after_exit, after_execute, demotion_possible),
                "{after_exit} -> {after_execute}"
            );

            current = after_execute;
        }
    }
}
