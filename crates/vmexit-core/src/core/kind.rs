use serde::{Deserialize, Serialize};

use crate::InterceptError;

/// The class of guest-physical accesses a handler type intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum HandlerKind {
    /// Memory-mapped I/O. Every access is intercepted and the range
    /// has no RAM backing the guest may touch directly.
    Mmio = 1,

    /// Only writes are intercepted; reads go to RAM.
    Write = 2,

    /// Both reads and writes are intercepted.
    All = 3,
}

impl HandlerKind {
    /// Returns the page access state pages covered by a handler of this
    /// kind must carry.
    pub const fn page_state(self) -> PageAccessState {
        match self {
            Self::Write => PageAccessState::Write,
            Self::All | Self::Mmio => PageAccessState::All,
        }
    }

    /// Checks whether ranges of this kind must consist of whole pages.
    pub const fn requires_full_pages(self) -> bool {
        matches!(self, Self::All | Self::Mmio)
    }
}

impl TryFrom<u32> for HandlerKind {
    type Error = InterceptError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Mmio),
            2 => Ok(Self::Write),
            3 => Ok(Self::All),
            _ => Err(InterceptError::InvalidArgument("unknown handler kind")),
        }
    }
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Mmio => f.write_str("mmio"),
            Self::Write => f.write_str("write"),
            Self::All => f.write_str("all"),
        }
    }
}

/// Per-page interception state.
///
/// The numeric values are ordered by strength, and combining two states
/// is a bitwise OR. For the states handlers produce ([`None`], [`Write`],
/// [`All`]) the OR is also the maximum.
///
/// [`None`]: Self::None
/// [`Write`]: Self::Write
/// [`All`]: Self::All
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum PageAccessState {
    /// No handler covers the page.
    #[default]
    None = 0,

    /// A handler covers the page but its monitoring is temporarily off.
    Disabled = 1,

    /// Writes to the page are intercepted.
    Write = 2,

    /// Every access to the page is intercepted.
    All = 3,
}

impl PageAccessState {
    /// Converts the two low bits of `bits` into a state.
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::None,
            1 => Self::Disabled,
            2 => Self::Write,
            _ => Self::All,
        }
    }

    /// Returns the raw two-bit value.
    pub const fn bits(self) -> u8 {
        self as u8
    }

    /// Combines two states.
    pub const fn merge(self, other: Self) -> Self {
        Self::from_bits(self.bits() | other.bits())
    }

    /// Checks whether accesses to the page are intercepted at all.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Write | Self::All)
    }
}

impl std::fmt::Display for PageAccessState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Disabled => f.write_str("disabled"),
            Self::Write => f.write_str("write"),
            Self::All => f.write_str("all"),
        }
    }
}

/// The kind of backing behind a guest page.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageType {
    /// Ordinary guest RAM.
    #[default]
    Ram,

    /// Read-only memory; writes never reach the backing.
    Rom,

    /// Device memory without RAM backing.
    Mmio,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_raw() {
        assert_eq!(HandlerKind::try_from(1).ok(), Some(HandlerKind::Mmio));
        assert_eq!(HandlerKind::try_from(3).ok(), Some(HandlerKind::All));
        assert!(matches!(
            HandlerKind::try_from(0),
            Err(InterceptError::InvalidArgument(_))
        ));
        assert!(HandlerKind::try_from(4).is_err());
    }

    #[test]
    fn derived_page_state() {
        assert_eq!(HandlerKind::Write.page_state(), PageAccessState::Write);
        assert_eq!(HandlerKind::All.page_state(), PageAccessState::All);
        assert_eq!(HandlerKind::Mmio.page_state(), PageAccessState::All);
    }

    #[test]
    fn merge_is_max_for_handler_states() {
        use PageAccessState::*;

        for a in [None, Write, All] {
            for b in [None, Write, All] {
                assert_eq!(a.merge(b), a.max(b));
            }
        }
    }
}
