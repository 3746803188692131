use serde::{Deserialize, Serialize};

/// The namespace an exit type belongs to.
///
/// Exit types are only unique within their kind: VMX exit reason 30 and
/// SVM exit code 30 are unrelated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExitKind {
    /// Generic exits recorded by the execution manager itself.
    Em = 0,

    /// Intel VT-x basic exit reasons.
    Vmx = 1,

    /// AMD-V exit codes.
    Svm = 2,

    /// Exits of the native execution engine.
    Nem = 3,

    /// Guest exceptions.
    Xcpt = 4,
}

impl ExitKind {
    /// Returns the mask bit of this kind in [`ExitKinds`].
    pub const fn mask(self) -> ExitKinds {
        ExitKinds::from_bits_truncate(1 << self as u8)
    }
}

bitflags::bitflags! {
    /// A set of [`ExitKind`]s.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ExitKinds: u8 {
        /// [`ExitKind::Em`].
        const EM = 1 << 0;

        /// [`ExitKind::Vmx`].
        const VMX = 1 << 1;

        /// [`ExitKind::Svm`].
        const SVM = 1 << 2;

        /// [`ExitKind::Nem`].
        const NEM = 1 << 3;

        /// [`ExitKind::Xcpt`].
        const XCPT = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Flags carried in the upper bits of [`ExitFlagsAndType`].
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ExitFlags: u32 {
        /// The PC is the raw instruction pointer; the code-segment base has
        /// not been folded in.
        const UNFLATTENED_PC = 1 << 17;

        /// The exit was recorded by the hardware-assisted path.
        const HM = 1 << 18;
    }
}

/// An exit type, its kind and flags packed into 32 bits.
///
/// | bits    | content        |
/// |---------|----------------|
/// | 0..12   | exit type      |
/// | 12..15  | [`ExitKind`]   |
/// | 17..    | [`ExitFlags`]  |
#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExitFlagsAndType(pub u32);

impl ExitFlagsAndType {
    /// Mask of the exit type.
    pub const TYPE_MASK: u32 = 0x0fff;

    /// Mask of the kind.
    pub const KIND_MASK: u32 = 0x7000;

    /// Shift of the kind.
    pub const KIND_SHIFT: u32 = 12;

    /// Packs an exit type of the given kind.
    pub const fn new(kind: ExitKind, exit_type: u16) -> Self {
        Self(((kind as u32) << Self::KIND_SHIFT) | (exit_type as u32 & Self::TYPE_MASK))
    }

    /// Returns the kind, or `None` for an unknown discriminator.
    pub const fn kind(self) -> Option<ExitKind> {
        match (self.0 & Self::KIND_MASK) >> Self::KIND_SHIFT {
            0 => Some(ExitKind::Em),
            1 => Some(ExitKind::Vmx),
            2 => Some(ExitKind::Svm),
            3 => Some(ExitKind::Nem),
            4 => Some(ExitKind::Xcpt),
            _ => None,
        }
    }

    /// Returns the exit type within its kind.
    pub const fn exit_type(self) -> u16 {
        (self.0 & Self::TYPE_MASK) as u16
    }

    /// Returns the flags.
    pub const fn flags(self) -> ExitFlags {
        ExitFlags::from_bits_truncate(self.0)
    }

    /// Returns a copy with `flags` set.
    pub const fn with_flags(self, flags: ExitFlags) -> Self {
        Self(self.0 | flags.bits())
    }

    /// Returns a copy with `flags` cleared.
    pub const fn without_flags(self, flags: ExitFlags) -> Self {
        Self(self.0 & !flags.bits())
    }
}

impl std::fmt::Debug for ExitFlagsAndType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ExitFlagsAndType")
            .field("kind", &self.kind())
            .field("type", &self.exit_type())
            .field("flags", &self.flags())
            .finish()
    }
}

impl std::fmt::Display for ExitFlagsAndType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Exit types of [`ExitKind::Em`].
pub mod em {
    /// Port I/O read.
    pub const IO_PORT_READ: u16 = 1;
    /// Port I/O write.
    pub const IO_PORT_WRITE: u16 = 2;
    /// String port I/O read.
    pub const IO_PORT_STR_READ: u16 = 3;
    /// String port I/O write.
    pub const IO_PORT_STR_WRITE: u16 = 4;
    /// MMIO access of unknown direction.
    pub const MMIO: u16 = 5;
    /// MMIO read.
    pub const MMIO_READ: u16 = 6;
    /// MMIO write.
    pub const MMIO_WRITE: u16 = 7;
    /// MSR read.
    pub const MSR_READ: u16 = 8;
    /// MSR write.
    pub const MSR_WRITE: u16 = 9;
    /// CPUID.
    pub const CPUID: u16 = 10;
    /// RDTSC.
    pub const RDTSC: u16 = 11;
}

/// Exit types of [`ExitKind::Nem`].
pub mod nem {
    /// Unmapped or protected memory access.
    pub const MEMORY_ACCESS: u16 = 1;
    /// Interrupt window opened.
    pub const INTERRUPT_WINDOW: u16 = 2;
    /// HLT.
    pub const HALT: u16 = 3;
    /// An exception the engine could not deliver.
    pub const UNRECOVERABLE_EXCEPTION: u16 = 4;
}
