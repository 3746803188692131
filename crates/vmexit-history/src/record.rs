use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::ExitFlagsAndType;

/// What to do the next time an exit site is hit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExitAction {
    /// The record is unused.
    #[default]
    Free = 0,

    /// Handle the exit by executing the exiting instruction only.
    Normal = 1,

    /// Like [`Normal`](Self::Normal), but a probe already decided that
    /// extended execution does not pay off here.
    NormalProbed = 2,

    /// Run one probing quantum to learn whether more exits follow.
    ExecProbe = 3,

    /// Run an extended quantum bounded by the learned exit distance.
    ExecWithMax = 4,
}

impl ExitAction {
    /// Returns whether the action runs more than the exiting instruction.
    pub fn is_extended(self) -> bool {
        matches!(self, Self::ExecProbe | Self::ExecWithMax)
    }
}

impl TryFrom<u8> for ExitAction {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Free),
            1 => Ok(Self::Normal),
            2 => Ok(Self::NormalProbed),
            3 => Ok(Self::ExecProbe),
            4 => Ok(Self::ExecWithMax),
            _ => Err(value),
        }
    }
}

impl std::fmt::Display for ExitAction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Normal => write!(f, "normal"),
            Self::NormalProbed => write!(f, "normal-probed"),
            Self::ExecProbe => write!(f, "exec-probe"),
            Self::ExecWithMax => write!(f, "exec-with-max"),
        }
    }
}

/// One entry of the exit history table.
///
/// The layout is fixed so the whole table can be zero-initialised and
/// dumped as raw bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ExitRecord {
    flat_pc: u64,
    flags_and_type: u32,
    action: u8,
    reserved: u8,
    max_instructions_without_exit: u16,
    last_exit_no: u64,
    hits: u64,
}

const _: () = assert!(size_of::<ExitRecord>() == 32);

impl ExitRecord {
    pub(crate) fn claim(&mut self, flags_and_type: ExitFlagsAndType, flat_pc: u64, exit_no: u64) {
        *self = Self {
            flat_pc,
            flags_and_type: flags_and_type.0,
            action: ExitAction::Normal as u8,
            reserved: 0,
            max_instructions_without_exit: 0,
            last_exit_no: exit_no,
            hits: 1,
        };
    }

    /// Returns whether the record holds the given key.
    pub fn matches(&self, flags_and_type: ExitFlagsAndType, flat_pc: u64) -> bool {
        self.action() != ExitAction::Free
            && self.flat_pc == flat_pc
            && self.flags_and_type == flags_and_type.0
    }

    /// Returns the program counter of the exit site.
    pub fn flat_pc(&self) -> u64 {
        self.flat_pc
    }

    /// Returns the exit type and flags of the exit site.
    pub fn flags_and_type(&self) -> ExitFlagsAndType {
        ExitFlagsAndType(self.flags_and_type)
    }

    /// Returns the action. A corrupt discriminator reads as
    /// [`ExitAction::Free`].
    pub fn action(&self) -> ExitAction {
        ExitAction::try_from(self.action).unwrap_or_default()
    }

    pub(crate) fn set_action(&mut self, action: ExitAction) {
        self.action = action as u8;
    }

    /// Returns the learned instruction distance bound for
    /// [`ExitAction::ExecWithMax`].
    pub fn max_instructions_without_exit(&self) -> u16 {
        self.max_instructions_without_exit
    }

    pub(crate) fn set_max_instructions_without_exit(&mut self, max: u16) {
        self.max_instructions_without_exit = max;
    }

    /// Returns the exit number of the latest hit.
    pub fn last_exit_no(&self) -> u64 {
        self.last_exit_no
    }

    /// Returns the number of hits.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub(crate) fn hit(&mut self, exit_no: u64) {
        self.hits += 1;
        self.last_exit_no = exit_no;
    }

    /// Counts the latest hit as the first one again.
    pub(crate) fn restart_hits(&mut self) {
        self.hits = 1;
    }
}
