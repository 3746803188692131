use serde::{Deserialize, Serialize};
use vmexit_core::InterceptError;

use crate::{ExitKind, ExitKinds};

/// Tuning of the exit history and the execution policy.
///
/// All thresholds count exits or instructions, never time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Master switch for exit history tracking.
    pub enabled: bool,

    /// Exit kinds that are never tracked.
    pub disabled_kinds: ExitKinds,

    /// Number of exit records per vCPU. Must be a power of two.
    pub capacity: usize,

    /// Hits after which a record is considered for probing.
    pub probe_hit_threshold: u64,

    /// The previous hit must be at most this many exits ago for the
    /// threshold to trigger a probe.
    pub probe_window: u64,

    /// Instructions without an exit-worthy instruction after which a
    /// probe stops.
    pub probe_max_instructions_without_exit: u16,

    /// Instructions a probe executes before it may stop early.
    pub probe_min_instructions: u32,

    /// Upper bound on instructions in one extended execution quantum.
    pub exec_max_instructions: u32,
}

impl HistoryConfig {
    /// Default record count.
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Default hit threshold for probing.
    pub const DEFAULT_PROBE_HIT_THRESHOLD: u64 = 16;

    /// Default probe window in exits.
    pub const DEFAULT_PROBE_WINDOW: u64 = 512;

    /// Default probe distance for hardware-assisted execution.
    pub const DEFAULT_PROBE_MAX_INSTRUCTIONS_WITHOUT_EXIT: u16 = 24;

    /// Default probe distance for the native execution engine.
    pub const NEM_PROBE_MAX_INSTRUCTIONS_WITHOUT_EXIT: u16 = 32;

    /// Default quantum length.
    pub const DEFAULT_EXEC_MAX_INSTRUCTIONS: u32 = 8192;

    /// Returns defaults suited to the native execution engine.
    pub fn nem() -> Self {
        Self::default()
            .with_probe_max_instructions_without_exit(Self::NEM_PROBE_MAX_INSTRUCTIONS_WITHOUT_EXIT)
    }

    /// Enables or disables tracking.
    pub fn with_enabled(self, enabled: bool) -> Self {
        Self { enabled, ..self }
    }

    /// Excludes an exit kind from tracking.
    pub fn with_disabled_kind(self, kind: ExitKind) -> Self {
        Self {
            disabled_kinds: self.disabled_kinds | kind.mask(),
            ..self
        }
    }

    /// Sets the record count.
    pub fn with_capacity(self, capacity: usize) -> Self {
        Self { capacity, ..self }
    }

    /// Sets the hit threshold and window for probing.
    pub fn with_probe_trigger(self, probe_hit_threshold: u64, probe_window: u64) -> Self {
        Self {
            probe_hit_threshold,
            probe_window,
            ..self
        }
    }

    /// Sets the probe distance. The minimum probe length follows it.
    pub fn with_probe_max_instructions_without_exit(self, max: u16) -> Self {
        Self {
            probe_max_instructions_without_exit: max,
            probe_min_instructions: (u32::from(max) + 1) * 3,
            ..self
        }
    }

    /// Sets the quantum length.
    pub fn with_exec_max_instructions(self, exec_max_instructions: u32) -> Self {
        Self {
            exec_max_instructions,
            ..self
        }
    }

    /// Checks whether exits of `kind` are tracked.
    pub fn tracks(&self, kind: Option<ExitKind>) -> bool {
        match kind {
            Some(kind) => self.enabled && !self.disabled_kinds.contains(kind.mask()),
            None => false,
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), InterceptError> {
        if !self.capacity.is_power_of_two() || !(16..=1 << 16).contains(&self.capacity) {
            return Err(InterceptError::InvalidArgument(
                "capacity must be a power of two between 16 and 65536",
            ));
        }

        if self.probe_hit_threshold < 2 {
            return Err(InterceptError::InvalidArgument("probe hit threshold must be at least 2"));
        }

        if self.probe_max_instructions_without_exit < 2 {
            return Err(InterceptError::InvalidArgument(
                "probe distance must be at least 2 instructions",
            ));
        }

        if self.exec_max_instructions < 16 {
            return Err(InterceptError::InvalidArgument(
                "quantum must be at least 16 instructions",
            ));
        }

        if self.probe_min_instructions > self.exec_max_instructions {
            return Err(InterceptError::InvalidArgument(
                "minimum probe length exceeds the quantum",
            ));
        }

        Ok(())
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            disabled_kinds: ExitKinds::empty(),
            capacity: Self::DEFAULT_CAPACITY,
            probe_hit_threshold: Self::DEFAULT_PROBE_HIT_THRESHOLD,
            probe_window: Self::DEFAULT_PROBE_WINDOW,
            probe_max_instructions_without_exit: Self::DEFAULT_PROBE_MAX_INSTRUCTIONS_WITHOUT_EXIT,
            probe_min_instructions: (Self::DEFAULT_PROBE_MAX_INSTRUCTIONS_WITHOUT_EXIT as u32 + 1)
                * 3,
            exec_max_instructions: Self::DEFAULT_EXEC_MAX_INSTRUCTIONS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = HistoryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.probe_min_instructions, 75);
        assert!(HistoryConfig::nem().validate().is_ok());
        assert_eq!(HistoryConfig::nem().probe_min_instructions, 99);
    }

    #[test]
    fn rejects_out_of_range_values() {
        for config in [
            HistoryConfig::default().with_capacity(1000),
            HistoryConfig::default().with_capacity(8),
            HistoryConfig::default().with_probe_trigger(1, 10),
            HistoryConfig::default().with_probe_max_instructions_without_exit(1),
            HistoryConfig::default().with_exec_max_instructions(15),
            HistoryConfig::default().with_exec_max_instructions(64),
        ] {
            assert!(
                matches!(config.validate(), Err(InterceptError::InvalidArgument(_))),
                "{config:?}"
            );
        }
    }

    #[test]
    fn tracking_switches() {
        let config = HistoryConfig::default().with_disabled_kind(ExitKind::Xcpt);
        assert!(config.tracks(Some(ExitKind::Vmx)));
        assert!(!config.tracks(Some(ExitKind::Xcpt)));
        assert!(!config.tracks(None));
        assert!(!config.with_enabled(false).tracks(Some(ExitKind::Vmx)));
    }
}
