//! Range-indexed collection of registered handler ranges.
//!
//! The tree is an AVL tree over a fixed-capacity slab of nodes. Nodes refer
//! to their children by slab index, and each caches the height of its
//! subtree. Live ranges never overlap, so ordering nodes by their first
//! address orders the ranges completely, and a plain descent answers every
//! point and interval query in `O(log n)`.

#[cfg(test)]
mod tests;

use smallvec::SmallVec;
use vmexit_core::{InterceptError, Pa, page_count};

use crate::TypeHandle;

/// Index used for "no node".
const NIL: u32 = u32::MAX;

/// Refers to one registered range.
///
/// A handle stays unique for the lifetime of the tree: once its range is
/// removed the handle never resolves again, even after the underlying slot
/// has been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordHandle {
    index: u32,
    generation: u32,
}

impl std::fmt::Display for RecordHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// Access counters of a handler range.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HandlerStats {
    /// Number of dispatched accesses.
    pub hits: u64,

    /// Nanoseconds spent in the callback.
    pub ticks: u64,
}

/// One registered guest-physical range bound to a handler type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerRecord {
    first: Pa,
    last: Pa,
    type_handle: TypeHandle,
    user_tag: u64,
    description: String,
    tmp_off_pages: u32,
    stats: HandlerStats,
}

impl HandlerRecord {
    /// Creates a record for the inclusive range `first..=last`.
    pub fn new(
        first: Pa,
        last: Pa,
        type_handle: TypeHandle,
        user_tag: u64,
        description: impl Into<String>,
    ) -> Self {
        Self {
            first,
            last,
            type_handle,
            user_tag,
            description: description.into(),
            tmp_off_pages: 0,
            stats: HandlerStats::default(),
        }
    }

    /// Returns the first address of the range.
    pub fn first(&self) -> Pa {
        self.first
    }

    /// Returns the last address of the range (inclusive).
    pub fn last(&self) -> Pa {
        self.last
    }

    /// Returns the length of the range in bytes.
    pub fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    /// Returns the number of pages the range touches.
    pub fn page_count(&self) -> u64 {
        page_count(self.first, self.last)
    }

    /// Checks whether `address` lies inside the range.
    pub fn contains(&self, address: Pa) -> bool {
        self.first <= address && address <= self.last
    }

    /// Checks whether the range covers the whole page containing
    /// `address`.
    pub fn covers_page(&self, address: Pa) -> bool {
        self.first <= address.page_base() && address.page_last() <= self.last
    }

    /// Returns the handler type.
    pub fn type_handle(&self) -> TypeHandle {
        self.type_handle
    }

    /// Returns the user tag passed to the callback.
    pub fn user_tag(&self) -> u64 {
        self.user_tag
    }

    /// Returns the description given at registration.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the number of pages with temporarily disabled monitoring.
    pub fn tmp_off_pages(&self) -> u32 {
        self.tmp_off_pages
    }

    /// Returns the access counters.
    pub fn stats(&self) -> HandlerStats {
        self.stats
    }

    pub(crate) fn set_user_tag(&mut self, user_tag: u64) {
        self.user_tag = user_tag;
    }

    pub(crate) fn set_tmp_off_pages(&mut self, pages: u32) {
        self.tmp_off_pages = pages;
    }

    pub(crate) fn stats_mut(&mut self) -> &mut HandlerStats {
        &mut self.stats
    }
}

#[derive(Debug)]
struct Node {
    record: HandlerRecord,
    left: u32,
    right: u32,
    height: u8,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Balanced tree of non-overlapping handler ranges.
#[derive(Debug)]
pub struct PhysHandlerTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: u32,
    len: usize,
    capacity: usize,
}

impl PhysHandlerTree {
    /// Creates an empty tree holding at most `capacity` ranges.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: NIL,
            len: 0,
            capacity: capacity.min(NIL as usize),
        }
    }

    /// Returns the number of live ranges.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Checks whether the tree holds no range.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the maximum number of live ranges.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Inserts a record.
    ///
    /// # Errors
    ///
    /// - [`InterceptError::InvalidRange`] if the first address lies above
    ///   the last.
    /// - [`InterceptError::RangeOverlap`] if the range intersects a live
    ///   range.
    /// - [`InterceptError::OutOfResources`] if the tree is full.
    pub fn insert(&mut self, record: HandlerRecord) -> Result<RecordHandle, InterceptError> {
        let (first, last) = (record.first, record.last);

        if first > last {
            return Err(InterceptError::InvalidRange { first, last });
        }

        if self.find_overlap(first, last).is_some() {
            return Err(InterceptError::RangeOverlap { first, last });
        }

        if self.len >= self.capacity {
            return Err(InterceptError::OutOfResources("handler tree is full"));
        }

        let index = self.alloc(record);
        self.root = self.insert_at(self.root, index);
        self.len += 1;

        Ok(RecordHandle {
            index,
            generation: self.slots[index as usize].generation,
        })
    }

    /// Removes the record behind `handle` and returns it.
    ///
    /// Fails with [`InterceptError::NotFound`] if the record was already
    /// removed.
    pub fn remove(&mut self, handle: RecordHandle) -> Result<HandlerRecord, InterceptError> {
        let first = self.get(handle).ok_or(InterceptError::NotFound)?.first;

        self.root = self.remove_at(self.root, first);
        self.len -= 1;

        let slot = &mut self.slots[handle.index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        let node = slot.node.take().ok_or(InterceptError::NotFound)?;
        self.free.push(handle.index);

        Ok(node.record)
    }

    /// Removes the record starting exactly at `first`.
    pub fn remove_by_first(&mut self, first: Pa) -> Result<HandlerRecord, InterceptError> {
        let handle = self.find_by_first(first).ok_or(InterceptError::NotFound)?;
        self.remove(handle)
    }

    /// Returns the record behind `handle`, if it is still live.
    pub fn get(&self, handle: RecordHandle) -> Option<&HandlerRecord> {
        let slot = self.slots.get(handle.index as usize)?;

        if slot.generation != handle.generation {
            return None;
        }

        slot.node.as_ref().map(|node| &node.record)
    }

    /// Returns the record behind `handle` mutably, if it is still live.
    ///
    /// The range itself cannot be changed through this reference.
    pub fn get_mut(&mut self, handle: RecordHandle) -> Option<&mut HandlerRecord> {
        let slot = self.slots.get_mut(handle.index as usize)?;

        if slot.generation != handle.generation {
            return None;
        }

        slot.node.as_mut().map(|node| &mut node.record)
    }

    /// Finds the record registered for exactly `first..=last`.
    pub fn find_exact(&self, first: Pa, last: Pa) -> Option<RecordHandle> {
        let handle = self.find_by_first(first)?;

        match self.get(handle) {
            Some(record) if record.last == last => Some(handle),
            _ => None,
        }
    }

    /// Finds the record starting exactly at `first`.
    pub fn find_by_first(&self, first: Pa) -> Option<RecordHandle> {
        let index = self.lookup_index(first)?;

        (self.node(index).record.first == first).then(|| self.handle_of(index))
    }

    /// Finds the record containing `address`.
    pub fn lookup(&self, address: Pa) -> Option<RecordHandle> {
        self.lookup_index(address).map(|index| self.handle_of(index))
    }

    /// Finds the record containing `address`, or else the lowest record
    /// above it.
    pub fn lookup_matching_or_above(&self, address: Pa) -> Option<RecordHandle> {
        let mut candidate = NIL;
        let mut current = self.root;

        while current != NIL {
            let node = self.node(current);

            if address < node.record.first {
                candidate = current;
                current = node.left;
            }
            else if address > node.record.last {
                current = node.right;
            }
            else {
                return Some(self.handle_of(current));
            }
        }

        (candidate != NIL).then(|| self.handle_of(candidate))
    }

    /// Finds the record containing `address`, or else the highest record
    /// below it.
    pub fn lookup_matching_or_below(&self, address: Pa) -> Option<RecordHandle> {
        let mut candidate = NIL;
        let mut current = self.root;

        while current != NIL {
            let node = self.node(current);

            if address > node.record.last {
                candidate = current;
                current = node.right;
            }
            else if address < node.record.first {
                current = node.left;
            }
            else {
                return Some(self.handle_of(current));
            }
        }

        (candidate != NIL).then(|| self.handle_of(candidate))
    }

    /// Returns the handles of all records intersecting `first..=last`, in
    /// ascending order.
    pub fn intersecting(&self, first: Pa, last: Pa) -> SmallVec<[RecordHandle; 4]> {
        let mut result = SmallVec::new();
        let mut cursor = self.lookup_matching_or_above(first);

        while let Some(handle) = cursor {
            let record = &self.node(handle.index).record;

            if record.first > last {
                break;
            }

            result.push(handle);

            cursor = match record.last.checked_add(1) {
                Some(next) => self.lookup_matching_or_above(next),
                None => None,
            };
        }

        result
    }

    /// Calls `visitor` for every live record in ascending address order.
    pub fn visit_ascending(&self, mut visitor: impl FnMut(RecordHandle, &HandlerRecord)) {
        for (handle, record) in self.iter() {
            visitor(handle, record);
        }
    }

    /// Calls `visitor` for every live record in descending address order.
    pub fn visit_descending(&self, mut visitor: impl FnMut(RecordHandle, &HandlerRecord)) {
        for (handle, record) in self.iter_rev() {
            visitor(handle, record);
        }
    }

    /// Calls `visitor` for every live record in slot order, allowing the
    /// non-range fields to be modified.
    pub fn for_each_mut(&mut self, mut visitor: impl FnMut(&mut HandlerRecord)) {
        for slot in &mut self.slots {
            if let Some(node) = &mut slot.node {
                visitor(&mut node.record);
            }
        }
    }

    /// Iterates over live records in ascending address order.
    pub fn iter(&self) -> Iter<'_> {
        Iter::new(self, false)
    }

    /// Iterates over live records in descending address order.
    pub fn iter_rev(&self) -> Iter<'_> {
        Iter::new(self, true)
    }

    /// Returns the height of the tree.
    pub fn height(&self) -> u8 {
        self.height_of(self.root)
    }

    fn handle_of(&self, index: u32) -> RecordHandle {
        RecordHandle {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn lookup_index(&self, address: Pa) -> Option<u32> {
        let mut current = self.root;

        while current != NIL {
            let node = self.node(current);

            if address < node.record.first {
                current = node.left;
            }
            else if address > node.record.last {
                current = node.right;
            }
            else {
                return Some(current);
            }
        }

        None
    }

    fn find_overlap(&self, first: Pa, last: Pa) -> Option<u32> {
        let mut current = self.root;

        while current != NIL {
            let node = self.node(current);

            if last < node.record.first {
                current = node.left;
            }
            else if first > node.record.last {
                current = node.right;
            }
            else {
                return Some(current);
            }
        }

        None
    }

    fn alloc(&mut self, record: HandlerRecord) -> u32 {
        let node = Node {
            record,
            left: NIL,
            right: NIL,
            height: 1,
        };

        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].node = Some(node);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                (self.slots.len() - 1) as u32
            }
        }
    }

    //
    // Node access. Indices reachable from the root always refer to
    // occupied slots.
    //

    fn node(&self, index: u32) -> &Node {
        match &self.slots[index as usize].node {
            Some(node) => node,
            None => unreachable!("dangling tree index {index}"),
        }
    }

    fn node_mut(&mut self, index: u32) -> &mut Node {
        match &mut self.slots[index as usize].node {
            Some(node) => node,
            None => unreachable!("dangling tree index {index}"),
        }
    }

    fn height_of(&self, index: u32) -> u8 {
        match index {
            NIL => 0,
            _ => self.node(index).height,
        }
    }

    fn update_height(&mut self, index: u32) {
        let node = self.node(index);
        let height = 1 + self.height_of(node.left).max(self.height_of(node.right));
        self.node_mut(index).height = height;
    }

    fn balance_factor(&self, index: u32) -> i16 {
        let node = self.node(index);
        self.height_of(node.left) as i16 - self.height_of(node.right) as i16
    }

    fn rotate_right(&mut self, index: u32) -> u32 {
        let pivot = self.node(index).left;
        let moved = self.node(pivot).right;

        self.node_mut(index).left = moved;
        self.node_mut(pivot).right = index;
        self.update_height(index);
        self.update_height(pivot);
        pivot
    }

    fn rotate_left(&mut self, index: u32) -> u32 {
        let pivot = self.node(index).right;
        let moved = self.node(pivot).left;

        self.node_mut(index).right = moved;
        self.node_mut(pivot).left = index;
        self.update_height(index);
        self.update_height(pivot);
        pivot
    }

    fn rebalance(&mut self, index: u32) -> u32 {
        self.update_height(index);

        match self.balance_factor(index) {
            2.. => {
                let left = self.node(index).left;
                if self.balance_factor(left) < 0 {
                    let rotated = self.rotate_left(left);
                    self.node_mut(index).left = rotated;
                }
                self.rotate_right(index)
            }
            ..=-2 => {
                let right = self.node(index).right;
                if self.balance_factor(right) > 0 {
                    let rotated = self.rotate_right(right);
                    self.node_mut(index).right = rotated;
                }
                self.rotate_left(index)
            }
            _ => index,
        }
    }

    fn insert_at(&mut self, current: u32, index: u32) -> u32 {
        if current == NIL {
            return index;
        }

        if self.node(index).record.first < self.node(current).record.first {
            let left = self.insert_at(self.node(current).left, index);
            self.node_mut(current).left = left;
        }
        else {
            let right = self.insert_at(self.node(current).right, index);
            self.node_mut(current).right = right;
        }

        self.rebalance(current)
    }

    fn remove_at(&mut self, current: u32, first: Pa) -> u32 {
        if current == NIL {
            return NIL;
        }

        let key = self.node(current).record.first;

        if first < key {
            let left = self.remove_at(self.node(current).left, first);
            self.node_mut(current).left = left;
        }
        else if first > key {
            let right = self.remove_at(self.node(current).right, first);
            self.node_mut(current).right = right;
        }
        else {
            let (left, right) = {
                let node = self.node(current);
                (node.left, node.right)
            };

            if left == NIL {
                return right;
            }

            if right == NIL {
                return left;
            }

            let (right, successor) = self.remove_min(right);
            let successor_node = self.node_mut(successor);
            successor_node.left = left;
            successor_node.right = right;
            return self.rebalance(successor);
        }

        self.rebalance(current)
    }

    /// Detaches the minimum of the subtree rooted at `current`. Returns the
    /// new subtree root and the detached node.
    fn remove_min(&mut self, current: u32) -> (u32, u32) {
        let left = self.node(current).left;

        if left == NIL {
            return (self.node(current).right, current);
        }

        let (left, min) = self.remove_min(left);
        self.node_mut(current).left = left;
        (self.rebalance(current), min)
    }
}

/// In-order iterator over a [`PhysHandlerTree`].
pub struct Iter<'a> {
    tree: &'a PhysHandlerTree,
    stack: SmallVec<[u32; 32]>,
    reverse: bool,
}

impl<'a> Iter<'a> {
    fn new(tree: &'a PhysHandlerTree, reverse: bool) -> Self {
        let mut iter = Self {
            tree,
            stack: SmallVec::new(),
            reverse,
        };
        iter.descend(tree.root);
        iter
    }

    fn descend(&mut self, mut current: u32) {
        while current != NIL {
            self.stack.push(current);
            let node = self.tree.node(current);
            current = if self.reverse { node.right } else { node.left };
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = (RecordHandle, &'a HandlerRecord);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.stack.pop()?;
        let tree = self.tree;
        let node = tree.node(index);

        self.descend(if self.reverse { node.left } else { node.right });
        Some((tree.handle_of(index), &node.record))
    }
}
