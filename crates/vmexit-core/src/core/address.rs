use super::macros::impl_address;

impl_address!(Gfn, "Guest Frame Number");
impl_address!(Pa, "Guest Physical Address");
impl_address!(Hpa, "Host Physical Address");

/// The number of bits in a page offset.
pub const PAGE_SHIFT: u32 = 12;

/// The size of a guest page in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Mask selecting the offset within a page.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

impl Gfn {
    /// Returns the physical address of the first byte of the frame.
    pub const fn pa(self) -> Pa {
        Pa(self.0 << PAGE_SHIFT)
    }
}

impl Pa {
    /// Returns the frame number containing this address.
    pub const fn gfn(self) -> Gfn {
        Gfn(self.0 >> PAGE_SHIFT)
    }

    /// Returns the offset of this address within its page.
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }

    /// Returns the address of the first byte of the containing page.
    pub const fn page_base(self) -> Pa {
        Pa(self.0 & !PAGE_OFFSET_MASK)
    }

    /// Returns the address of the last byte of the containing page.
    pub const fn page_last(self) -> Pa {
        Pa(self.0 | PAGE_OFFSET_MASK)
    }

    /// Checks whether the address is the first byte of a page.
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Checks whether the address is the last byte of a page.
    pub const fn is_page_last(self) -> bool {
        self.page_offset() == PAGE_OFFSET_MASK
    }
}

impl Hpa {
    /// Returns the host address shifted by whole pages.
    pub const fn add_pages(self, pages: u64) -> Hpa {
        Hpa(self.0 + (pages << PAGE_SHIFT))
    }
}

/// Returns the number of pages touched by the inclusive range
/// `first..=last`.
///
/// The range must be well-formed (`first <= last`).
pub const fn page_count(first: Pa, last: Pa) -> u64 {
    (last.0 >> PAGE_SHIFT) - (first.0 >> PAGE_SHIFT) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_helpers() {
        let pa = Pa(0xa050);
        assert_eq!(pa.gfn(), Gfn(0xa));
        assert_eq!(pa.page_offset(), 0x50);
        assert_eq!(pa.page_base(), Pa(0xa000));
        assert_eq!(pa.page_last(), Pa(0xafff));
        assert!(!pa.is_page_aligned());
        assert!(Pa(0x1fff).is_page_last());
        assert_eq!(Gfn(0x1).pa(), Pa(0x1000));
    }

    #[test]
    fn page_count_spans() {
        assert_eq!(page_count(Pa(0x1000), Pa(0x1fff)), 1);
        assert_eq!(page_count(Pa(0x1fff), Pa(0x2000)), 2);
        assert_eq!(page_count(Pa(0xa000), Pa(0xa0ff)), 1);
        assert_eq!(page_count(Pa(0x0), Pa(0x3fff)), 4);
    }

    #[test]
    fn formatting() {
        assert_eq!(format!("{}", Pa(0x1500)), "0x0000000000001500");
        assert_eq!(format!("{:x}", Hpa(0xabc)), "abc");
        assert_eq!(Pa(0x2000) - Pa(0x1000), 0x1000);
        assert_eq!(Pa(u64::MAX).checked_add(1), None);
    }
}
