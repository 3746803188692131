use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Host-side protection of a guest page as seen by the secondary
    /// execution engine.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MemoryAccess: u8 {
        /// Read permission.
        const R = 0b00000001;

        /// Write permission.
        const W = 0b00000010;

        /// Execute permission.
        const X = 0b00000100;

        /// Combined Read and Execute permissions.
        const RX = Self::R.bits() | Self::X.bits();

        /// Full access: Read, Write, and Execute permissions.
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

impl std::fmt::Display for MemoryAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let flag = |access, c| if self.contains(access) { c } else { '-' };

        write!(
            f,
            "{}{}{}",
            flag(MemoryAccess::R, 'r'),
            flag(MemoryAccess::W, 'w'),
            flag(MemoryAccess::X, 'x')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(MemoryAccess::RWX.to_string(), "rwx");
        assert_eq!(MemoryAccess::RX.to_string(), "r-x");
        assert_eq!(MemoryAccess::empty().to_string(), "---");
    }
}
