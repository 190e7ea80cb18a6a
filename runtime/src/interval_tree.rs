// Copyright 2024 autortfm contributors
// SPDX-License-Identifier: Apache-2.0

//! Red-black tree of `[start, end)` byte ranges tracking memory allocated
//! during the current transaction ("new memory"). Writes landing entirely in
//! tracked ranges need no undo logging: the whole allocation disappears on
//! abort.
//!
//! Nodes live in parallel arrays keyed by a dense index instead of being
//! heap-allocated individually, so teardown is a truncation and the tree is
//! cheap to reset between transactions. Stored ranges are always disjoint;
//! a range abutting an existing node extends that node instead of adding
//! one.

const NIL: u32 = u32::MAX;

pub struct IntervalTree {
    starts: Vec<usize>,
    ends: Vec<usize>,
    lefts: Vec<u32>,
    rights: Vec<u32>,
    parents: Vec<u32>,
    reds: Vec<bool>,
    root: u32,
}

impl IntervalTree {
    pub fn new() -> Self {
        Self {
            starts: Vec::new(),
            ends: Vec::new(),
            lefts: Vec::new(),
            rights: Vec::new(),
            parents: Vec::new(),
            reds: Vec::new(),
            root: NIL,
        }
    }

    pub fn node_count(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root == NIL
    }

    /// Truncates the arrays; O(1) amortized, capacity kept.
    pub fn reset(&mut self) {
        self.starts.clear();
        self.ends.clear();
        self.lefts.clear();
        self.rights.clear();
        self.parents.clear();
        self.reds.clear();
        self.root = NIL;
    }

    /// Records `[address, address + size)`. Returns false without inserting
    /// if the range overlaps an already tracked range (an overlap here is a
    /// caller bug: the same memory reported allocated twice). An exactly
    /// abutting range extends the existing node in O(log n).
    pub fn insert(&mut self, address: usize, size: usize) -> bool {
        if size == 0 {
            return true;
        }
        let (start, end) = (address, address + size);

        let mut node = self.root;
        let mut attach = NIL;
        let mut attach_left = false;
        // Greatest start <= start seen on the path, and least start > start.
        let mut pred = NIL;
        let mut succ = NIL;

        while node != NIL {
            attach = node;
            if start < self.starts[node as usize] {
                succ = node;
                attach_left = true;
                node = self.lefts[node as usize];
            } else {
                pred = node;
                attach_left = false;
                node = self.rights[node as usize];
            }
        }

        // Disjointness means only the neighbors can overlap.
        if pred != NIL && start < self.ends[pred as usize] {
            return false;
        }
        if succ != NIL && self.starts[succ as usize] < end {
            return false;
        }

        // Coalesce with an exactly abutting neighbor.
        if pred != NIL && self.ends[pred as usize] == start {
            self.ends[pred as usize] = end;
            return true;
        }
        if succ != NIL && self.starts[succ as usize] == end {
            self.starts[succ as usize] = start;
            return true;
        }

        let fresh = self.push_node(start, end, attach);
        if attach == NIL {
            self.root = fresh;
        } else if attach_left {
            self.lefts[attach as usize] = fresh;
        } else {
            self.rights[attach as usize] = fresh;
        }
        self.fixup(fresh);
        true
    }

    /// True if any byte of `[address, address + size)` intersects a tracked
    /// range.
    pub fn contains(&self, address: usize, size: usize) -> bool {
        if size == 0 || self.root == NIL {
            return false;
        }
        let (start, end) = (address, address + size);
        let mut node = self.root;
        let mut pred = NIL;
        let mut succ = NIL;
        while node != NIL {
            if start < self.ends[node as usize] && self.starts[node as usize] < end {
                return true;
            }
            if start < self.starts[node as usize] {
                succ = node;
                node = self.lefts[node as usize];
            } else {
                pred = node;
                node = self.rights[node as usize];
            }
        }
        (pred != NIL && start < self.ends[pred as usize])
            || (succ != NIL && self.starts[succ as usize] < end)
    }

    /// Forgets `[address, address + size)` if it lies entirely inside one
    /// tracked range, shrinking or splitting that range as needed. Returns
    /// false (without changing the tree) when the bytes are not fully
    /// tracked. Frees are rare next to insertions and lookups, so the tree
    /// is rebuilt from the surviving ranges rather than carrying a
    /// structural delete.
    pub fn remove(&mut self, address: usize, size: usize) -> bool {
        if size == 0 {
            return true;
        }
        let (start, end) = (address, address + size);

        let mut kept = Vec::with_capacity(self.node_count() + 1);
        let mut found = false;
        self.for_each(|s, e| {
            if !found && s <= start && end <= e {
                found = true;
                if s < start {
                    kept.push((s, start));
                }
                if end < e {
                    kept.push((end, e));
                }
            } else {
                kept.push((s, e));
            }
        });
        if !found {
            return false;
        }

        self.reset();
        for (s, e) in kept {
            // Survivors were disjoint before the rebuild and a gap now sits
            // where the freed bytes were, so re-insertion cannot fail.
            self.insert(s, e - s);
        }
        true
    }

    /// Re-inserts every range of `other` into `self` (nested commit).
    pub fn merge(&mut self, other: &IntervalTree) {
        other.for_each(|start, end| {
            if !self.insert(start, end - start) {
                // Child allocations are disjoint from the parent's by
                // construction; an overlap means a double did_allocate.
                log::warn!(
                    "new-memory merge dropped overlapping range {:#x}..{:#x}",
                    start,
                    end
                );
            }
        });
    }

    /// In-order traversal over `(start, end)` pairs.
    pub fn for_each(&self, mut f: impl FnMut(usize, usize)) {
        let mut stack = Vec::new();
        let mut node = self.root;
        while node != NIL || !stack.is_empty() {
            while node != NIL {
                stack.push(node);
                node = self.lefts[node as usize];
            }
            let top = stack.pop().expect("in-order stack underflow");
            f(self.starts[top as usize], self.ends[top as usize]);
            node = self.rights[top as usize];
        }
    }

    fn push_node(&mut self, start: usize, end: usize, parent: u32) -> u32 {
        let index = self.starts.len() as u32;
        self.starts.push(start);
        self.ends.push(end);
        self.lefts.push(NIL);
        self.rights.push(NIL);
        self.parents.push(parent);
        self.reds.push(true);
        index
    }

    fn is_red(&self, node: u32) -> bool {
        node != NIL && self.reds[node as usize]
    }

    fn rotate_left(&mut self, x: u32) {
        let y = self.rights[x as usize];
        debug_assert!(y != NIL);
        self.rights[x as usize] = self.lefts[y as usize];
        if self.lefts[y as usize] != NIL {
            self.parents[self.lefts[y as usize] as usize] = x;
        }
        self.parents[y as usize] = self.parents[x as usize];
        let p = self.parents[x as usize];
        if p == NIL {
            self.root = y;
        } else if self.lefts[p as usize] == x {
            self.lefts[p as usize] = y;
        } else {
            self.rights[p as usize] = y;
        }
        self.lefts[y as usize] = x;
        self.parents[x as usize] = y;
    }

    fn rotate_right(&mut self, x: u32) {
        let y = self.lefts[x as usize];
        debug_assert!(y != NIL);
        self.lefts[x as usize] = self.rights[y as usize];
        if self.rights[y as usize] != NIL {
            self.parents[self.rights[y as usize] as usize] = x;
        }
        self.parents[y as usize] = self.parents[x as usize];
        let p = self.parents[x as usize];
        if p == NIL {
            self.root = y;
        } else if self.rights[p as usize] == x {
            self.rights[p as usize] = y;
        } else {
            self.lefts[p as usize] = y;
        }
        self.rights[y as usize] = x;
        self.parents[x as usize] = y;
    }

    /// Standard recolor/rotate pass after attaching a red leaf.
    fn fixup(&mut self, mut node: u32) {
        while node != self.root && self.is_red(self.parents[node as usize]) {
            let parent = self.parents[node as usize];
            let grand = self.parents[parent as usize];
            if parent == self.lefts[grand as usize] {
                let uncle = self.rights[grand as usize];
                if self.is_red(uncle) {
                    self.reds[parent as usize] = false;
                    self.reds[uncle as usize] = false;
                    self.reds[grand as usize] = true;
                    node = grand;
                } else {
                    if node == self.rights[parent as usize] {
                        node = parent;
                        self.rotate_left(node);
                    }
                    let parent = self.parents[node as usize];
                    let grand = self.parents[parent as usize];
                    self.reds[parent as usize] = false;
                    self.reds[grand as usize] = true;
                    self.rotate_right(grand);
                }
            } else {
                let uncle = self.lefts[grand as usize];
                if self.is_red(uncle) {
                    self.reds[parent as usize] = false;
                    self.reds[uncle as usize] = false;
                    self.reds[grand as usize] = true;
                    node = grand;
                } else {
                    if node == self.lefts[parent as usize] {
                        node = parent;
                        self.rotate_right(node);
                    }
                    let parent = self.parents[node as usize];
                    let grand = self.parents[parent as usize];
                    self.reds[parent as usize] = false;
                    self.reds[grand as usize] = true;
                    self.rotate_left(grand);
                }
            }
        }
        self.reds[self.root as usize] = false;
    }
}

impl Default for IntervalTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(tree: &IntervalTree) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        tree.for_each(|s, e| out.push((s, e)));
        out
    }

    #[test]
    fn test_insert_and_contains() {
        let mut tree = IntervalTree::new();
        assert!(tree.insert(0x1000, 0x100));
        assert!(tree.insert(0x3000, 0x100));

        assert!(tree.contains(0x1000, 1));
        assert!(tree.contains(0x10ff, 1));
        assert!(tree.contains(0x0fff, 2)); // straddles the front edge
        assert!(!tree.contains(0x1100, 1));
        assert!(!tree.contains(0x0fff, 1));
        assert!(!tree.contains(0x2000, 0x100));
    }

    #[test]
    fn test_overlap_rejected() {
        let mut tree = IntervalTree::new();
        assert!(tree.insert(0x1000, 0x100));
        assert!(!tree.insert(0x1080, 0x10));
        assert!(!tree.insert(0x0f80, 0x100));
        assert!(!tree.insert(0x1000, 0x100));
        assert_eq!(tree.node_count(), 1);
    }

    #[test]
    fn test_abutting_ranges_coalesce() {
        let mut tree = IntervalTree::new();
        assert!(tree.insert(0x1000, 0x100));
        // extends the end
        assert!(tree.insert(0x1100, 0x100));
        // extends the start
        assert!(tree.insert(0x0f00, 0x100));
        assert_eq!(tree.node_count(), 1);
        assert_eq!(ranges(&tree), vec![(0x0f00, 0x1200)]);
        assert!(tree.contains(0x0f00, 0x300));
    }

    #[test]
    fn test_in_order_and_balance_under_many_inserts() {
        let mut tree = IntervalTree::new();
        // interleaved inserts with gaps so nothing coalesces
        for i in (0..1000usize).rev() {
            assert!(tree.insert(i * 0x20, 0x10));
        }
        let rs = ranges(&tree);
        assert_eq!(rs.len(), 1000);
        assert!(rs.windows(2).all(|w| w[0].1 <= w[1].0));
        for i in 0..1000usize {
            assert!(tree.contains(i * 0x20, 0x10));
            assert!(!tree.contains(i * 0x20 + 0x10, 0x10));
        }
    }

    #[test]
    fn test_merge_folds_other_tree_in() {
        let mut parent = IntervalTree::new();
        let mut child = IntervalTree::new();
        assert!(parent.insert(0x1000, 0x100));
        assert!(child.insert(0x5000, 0x100));
        assert!(child.insert(0x1100, 0x100)); // abuts the parent range

        parent.merge(&child);
        assert!(parent.contains(0x5000, 0x100));
        assert_eq!(ranges(&parent), vec![(0x1000, 0x1200), (0x5000, 0x5100)]);
    }

    #[test]
    fn test_remove_whole_range_allows_reinsertion() {
        let mut tree = IntervalTree::new();
        assert!(tree.insert(0x1000, 0x100));
        assert!(tree.insert(0x3000, 0x100));

        assert!(tree.remove(0x1000, 0x100));
        assert!(!tree.contains(0x1000, 0x100));
        assert!(tree.contains(0x3000, 0x100));
        // the address space can be reused
        assert!(tree.insert(0x1000, 0x100));
    }

    #[test]
    fn test_remove_splits_and_shrinks() {
        let mut tree = IntervalTree::new();
        assert!(tree.insert(0x1000, 0x300));

        // middle: splits into two
        assert!(tree.remove(0x1100, 0x100));
        assert_eq!(ranges(&tree), vec![(0x1000, 0x1100), (0x1200, 0x1300)]);
        assert!(!tree.contains(0x1100, 0x100));

        // front edge: shrinks
        assert!(tree.remove(0x1000, 0x80));
        assert_eq!(ranges(&tree), vec![(0x1080, 0x1100), (0x1200, 0x1300)]);

        // freed bytes are insertable again
        assert!(tree.insert(0x1100, 0x100));
        assert_eq!(ranges(&tree), vec![(0x1080, 0x1300)]);
    }

    #[test]
    fn test_remove_rejects_untracked_and_straddling_ranges() {
        let mut tree = IntervalTree::new();
        assert!(tree.insert(0x1000, 0x100));
        assert!(tree.insert(0x1200, 0x100));

        assert!(!tree.remove(0x2000, 0x10));
        // spans the gap between two ranges
        assert!(!tree.remove(0x1080, 0x200));
        assert_eq!(ranges(&tree), vec![(0x1000, 0x1100), (0x1200, 0x1300)]);
    }

    #[test]
    fn test_reset() {
        let mut tree = IntervalTree::new();
        assert!(tree.insert(0x1000, 0x100));
        tree.reset();
        assert!(tree.is_empty());
        assert!(!tree.contains(0x1000, 1));
        assert!(tree.insert(0x1000, 0x100));
    }
}
