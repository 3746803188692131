use vmexit_core::{Hpa, InterceptError, PAGE_SHIFT, PAGE_SIZE, Pa, PageAccessState, PageType};

/// Per-page record of guest-physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFrame {
    host: Hpa,
    page_type: PageType,
    state: PageAccessState,
    not_in_accel: bool,
}

impl PageFrame {
    /// Returns the host backing of the page.
    pub fn host(&self) -> Hpa {
        self.host
    }

    /// Returns the backing type.
    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    /// Returns the interception state.
    pub fn state(&self) -> PageAccessState {
        self.state
    }

    /// Checks whether the accelerated path must never handle the page.
    pub fn not_in_accel(&self) -> bool {
        self.not_in_accel
    }

    pub(crate) fn set_state(&mut self, state: PageAccessState, not_in_accel: bool) {
        self.state = state;
        self.not_in_accel = not_in_accel;
    }
}

/// A contiguous range of guest-physical pages.
#[derive(Debug)]
pub struct RamRange {
    first: Pa,
    last: Pa,
    description: String,
    pages: Vec<PageFrame>,
}

impl RamRange {
    /// Returns the first address of the range.
    pub fn first(&self) -> Pa {
        self.first
    }

    /// Returns the last address of the range.
    pub fn last(&self) -> Pa {
        self.last
    }

    /// Returns the description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the page frames.
    pub fn pages(&self) -> &[PageFrame] {
        &self.pages
    }

    fn contains(&self, first: Pa, last: Pa) -> bool {
        self.first <= first && last <= self.last
    }

    fn index_of(&self, address: Pa) -> usize {
        ((address - self.first) >> PAGE_SHIFT) as usize
    }
}

/// The guest-physical page-frame store.
///
/// Page access states are only written by page state synchronization;
/// everything else reads them.
#[derive(Debug, Default)]
pub struct PhysMemory {
    /// Sorted by first address, never overlapping.
    ranges: Vec<RamRange>,
}

impl PhysMemory {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `pages` pages of guest-physical memory at `first`, backed
    /// contiguously by host memory starting at `host`.
    pub fn register(
        &mut self,
        first: Pa,
        pages: u64,
        host: Hpa,
        page_type: PageType,
        description: impl Into<String>,
    ) -> Result<(), InterceptError> {
        if !first.is_page_aligned() {
            return Err(InterceptError::InvalidArgument("RAM range must be page aligned"));
        }

        if pages == 0 {
            return Err(InterceptError::InvalidArgument("RAM range must not be empty"));
        }

        let last = pages
            .checked_mul(PAGE_SIZE)
            .and_then(|size| first.checked_add(size - 1))
            .ok_or(InterceptError::InvalidArgument("RAM range wraps around"))?;

        let position = self.ranges.partition_point(|range| range.last < first);
        if let Some(next) = self.ranges.get(position)
            && next.first <= last
        {
            return Err(InterceptError::RangeOverlap { first, last });
        }

        let description = description.into();
        tracing::debug!(%first, %last, %description, "RAM range registered");

        let pages = (0..pages)
            .map(|index| PageFrame {
                host: match page_type {
                    PageType::Mmio => Hpa(0),
                    _ => host.add_pages(index),
                },
                page_type,
                state: PageAccessState::None,
                not_in_accel: false,
            })
            .collect();

        self.ranges.insert(
            position,
            RamRange {
                first,
                last,
                description,
                pages,
            },
        );

        Ok(())
    }

    /// Returns the registered ranges in ascending order.
    pub fn ranges(&self) -> &[RamRange] {
        &self.ranges
    }

    /// Checks whether `first..=last` lies inside a single registered range.
    pub fn contains(&self, first: Pa, last: Pa) -> bool {
        self.range_index(first)
            .is_some_and(|index| self.ranges[index].contains(first, last))
    }

    /// Returns the page containing `address`.
    pub fn page(&self, address: Pa) -> Option<&PageFrame> {
        let range = &self.ranges[self.range_index(address)?];
        range.pages.get(range.index_of(address))
    }

    pub(crate) fn page_mut(&mut self, address: Pa) -> Option<&mut PageFrame> {
        let position = self.range_index(address)?;
        let range = &mut self.ranges[position];
        let index = range.index_of(address);
        range.pages.get_mut(index)
    }

    /// Iterates over every page with its guest-physical address.
    pub fn pages(&self) -> impl Iterator<Item = (Pa, &PageFrame)> {
        self.ranges.iter().flat_map(|range| {
            range
                .pages
                .iter()
                .enumerate()
                .map(|(index, page)| (range.first + ((index as u64) << PAGE_SHIFT), page))
        })
    }

    fn range_index(&self, address: Pa) -> Option<usize> {
        let position = self.ranges.partition_point(|range| range.last < address);
        let range = self.ranges.get(position)?;
        (range.first <= address).then_some(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() -> Result<(), InterceptError> {
        let mut memory = PhysMemory::new();
        memory.register(Pa(0x10000), 16, Hpa(0x8000_0000), PageType::Ram, "high")?;
        memory.register(Pa(0x0), 16, Hpa(0x4000_0000), PageType::Ram, "low")?;

        assert_eq!(memory.ranges()[0].description(), "low");
        assert_eq!(memory.page(Pa(0x1234)).map(PageFrame::host), Some(Hpa(0x4000_1000)));
        assert_eq!(memory.page(Pa(0x10fff)).map(PageFrame::host), Some(Hpa(0x8000_0000)));
        assert!(memory.page(Pa(0x20000)).is_none());

        assert!(memory.contains(Pa(0x0), Pa(0xffff)));
        assert!(!memory.contains(Pa(0xf000), Pa(0x10fff)));
        assert_eq!(memory.pages().count(), 32);
        Ok(())
    }

    #[test]
    fn page_states_are_writable_in_place() -> Result<(), InterceptError> {
        let mut memory = PhysMemory::new();
        memory.register(Pa(0x0), 4, Hpa(0x4000_0000), PageType::Ram, "low")?;
        memory.register(Pa(0x10000), 4, Hpa(0x8000_0000), PageType::Ram, "high")?;

        let page = memory.page_mut(Pa(0x11234)).ok_or(InterceptError::NotFound)?;
        page.set_state(PageAccessState::Write, true);

        let page = memory.page(Pa(0x11000)).ok_or(InterceptError::NotFound)?;
        assert_eq!(page.state(), PageAccessState::Write);
        assert!(page.not_in_accel());
        assert_eq!(memory.page(Pa(0x1000)).map(PageFrame::state), Some(PageAccessState::None));
        assert!(memory.page_mut(Pa(0x5000)).is_none());
        Ok(())
    }

    #[test]
    fn rejects_overlapping_ranges() -> Result<(), InterceptError> {
        let mut memory = PhysMemory::new();
        memory.register(Pa(0x4000), 4, Hpa(0), PageType::Ram, "a")?;

        assert!(matches!(
            memory.register(Pa(0x7000), 1, Hpa(0), PageType::Ram, "b"),
            Err(InterceptError::RangeOverlap { .. })
        ));
        assert!(matches!(
            memory.register(Pa(0x1000), 4, Hpa(0), PageType::Ram, "c"),
            Err(InterceptError::RangeOverlap { .. })
        ));
        assert!(matches!(
            memory.register(Pa(0x1001), 1, Hpa(0), PageType::Ram, "d"),
            Err(InterceptError::InvalidArgument(_))
        ));

        memory.register(Pa(0x8000), 1, Hpa(0), PageType::Mmio, "e")?;
        Ok(())
    }
}
