//! Trees: Morton-sorted quadrant sequences with per-level bookkeeping.
//!
//! This module carries the structural predicates on a single tree, the
//! interval completion between two quadrants, linearization, and the
//! ownership trim. Callers insert quadrants in Morton order or sort
//! afterwards; the container itself never reorders.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};

use itertools::Itertools;

use crate::constants::MAX_LEVEL_SLOTS;
use crate::types::forest::PayloadPool;
use crate::types::quadrant::{compare, Dim, LocIdx, Quadrant};

/// One tree of the forest: a quadrant sequence plus derived bookkeeping.
#[derive(Clone, Debug)]
pub struct Tree {
    pub quadrants: Vec<Quadrant>,
    /// Prefix sum of the sizes of prior local trees.
    pub quadrants_offset: LocIdx,
    pub quadrants_per_level: [LocIdx; MAX_LEVEL_SLOTS],
    /// Highest level with a nonzero count.
    pub maxlevel: u8,
    /// Deepest first descendant of the first quadrant.
    pub first_desc: Quadrant,
    /// Deepest last descendant of the last quadrant.
    pub last_desc: Quadrant,
}

impl Default for Tree {
    fn default() -> Self {
        Tree::new()
    }
}

impl Tree {
    /// An empty tree.
    pub fn new() -> Tree {
        Tree {
            quadrants: Vec::new(),
            quadrants_offset: 0,
            quadrants_per_level: [0; MAX_LEVEL_SLOTS],
            maxlevel: 0,
            first_desc: Quadrant::root(),
            last_desc: Quadrant::root(),
        }
    }

    /// Build a tree from a quadrant sequence and recount.
    pub fn from_quadrants(quadrants: Vec<Quadrant>, dim: Dim) -> Tree {
        let mut tree = Tree::new();
        tree.quadrants = quadrants;
        tree.recount(dim);
        tree
    }

    pub fn len(&self) -> usize {
        self.quadrants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quadrants.is_empty()
    }

    /// Append a quadrant, keeping the per-level counts current.
    pub fn push(&mut self, q: Quadrant) {
        self.quadrants_per_level[q.level as usize] += 1;
        if q.level > self.maxlevel {
            self.maxlevel = q.level;
        }
        self.quadrants.push(q);
    }

    /// Sort the sequence into Morton order.
    pub fn sort(&mut self) {
        self.quadrants.sort();
    }

    /// Locate `q` in the sorted sequence.
    pub fn find(&self, q: &Quadrant) -> Result<usize, usize> {
        self.quadrants.binary_search(q)
    }

    /// Rebuild per-level counts, maxlevel and the descendant cache.
    pub fn recount(&mut self, dim: Dim) {
        self.quadrants_per_level = [0; MAX_LEVEL_SLOTS];
        self.maxlevel = 0;
        for q in &self.quadrants {
            self.quadrants_per_level[q.level as usize] += 1;
            if q.level > self.maxlevel {
                self.maxlevel = q.level;
            }
        }
        let l = dim.max_level();
        if let (Some(first), Some(last)) = (self.quadrants.first(), self.quadrants.last()) {
            self.first_desc = first.first_descendant(l, dim);
            self.last_desc = last.last_descendant(l, dim);
        } else {
            self.first_desc = Quadrant::root();
            self.last_desc = Quadrant::root();
        }
    }

    /// Strict Morton increase over the whole sequence.
    pub fn is_sorted(&self) -> bool {
        self.quadrants
            .iter()
            .tuple_windows()
            .all(|(a, b)| compare(a, b) == std::cmp::Ordering::Less)
    }

    /// Sorted with no ancestor-descendant pair.
    pub fn is_linear(&self, dim: Dim) -> bool {
        self.is_sorted()
            && self
                .quadrants
                .iter()
                .tuple_windows()
                .all(|(a, b)| !a.is_ancestor(b, dim))
    }

    /// Sorted, except that two quadrants both lying in the same outside
    /// corner (or outside edge in 3D) of the extended band may appear in
    /// any order and may overlap.
    pub fn is_almost_sorted(&self, dim: Dim) -> bool {
        self.quadrants.iter().tuple_windows().all(|(a, b)| {
            compare(a, b) == std::cmp::Ordering::Less || shared_outside_region(a, b, dim)
        })
    }

    /// Every consecutive pair tiles on without gap.
    pub fn is_complete(&self, dim: Dim) -> bool {
        self.is_sorted()
            && self
                .quadrants
                .iter()
                .tuple_windows()
                .all(|(a, b)| a.is_next(b, dim))
    }

    /// Remove each quadrant that equals or contains its successor,
    /// releasing payloads; counts are rebuilt. Returns the number of
    /// quadrants dropped. The sequence must be sorted.
    pub fn linearize(&mut self, dim: Dim, mut pool: Option<&mut PayloadPool>) -> usize {
        debug_assert!(self.is_sorted() || self.quadrants.is_empty());
        let n = self.quadrants.len();
        let mut kept = 0;
        for i in 0..n {
            let drop = i + 1 < n && {
                let q = &self.quadrants[i];
                let next = &self.quadrants[i + 1];
                q == next || q.is_ancestor(next, dim)
            };
            if drop {
                if let Some(pool) = pool.as_deref_mut() {
                    pool.release(self.quadrants[i].data);
                }
            } else {
                self.quadrants[kept] = self.quadrants[i];
                kept += 1;
            }
        }
        self.quadrants.truncate(kept);
        self.recount(dim);
        n - kept
    }

    /// Drop quadrants outside the unit root, and outside the half-open
    /// ownership window of deepest-level Morton indices when one is given
    /// (the partial-ownership case of the first or last local tree).
    pub fn remove_nonowned(
        &mut self,
        dim: Dim,
        window: Option<(u64, u64)>,
        mut pool: Option<&mut PayloadPool>,
    ) {
        self.quadrants.retain(|q| {
            let mut owned = q.is_inside_root(dim);
            if owned {
                if let Some((first, next)) = window {
                    let idx = q.morton_index(dim);
                    owned = idx >= first && idx < next;
                }
            }
            if !owned {
                if let Some(pool) = pool.as_deref_mut() {
                    pool.release(q.data);
                }
            }
            owned
        });
        self.recount(dim);
    }

    /// Complete a linear tree into a full tiling of its root by filling
    /// every Morton gap with maximal quadrants.
    pub fn complete(&mut self, dim: Dim) {
        debug_assert!(self.is_linear(dim));
        let total = Quadrant::root().num_cells(dim);
        let mut out = Vec::with_capacity(self.quadrants.len());
        let mut pos = 0u64;
        for q in &self.quadrants {
            fill_gap(pos, q.morton_index(dim), dim, &mut out);
            out.push(*q);
            pos = q.morton_index(dim) + q.num_cells(dim);
        }
        fill_gap(pos, total, dim, &mut out);
        self.quadrants = out;
        self.recount(dim);
    }
}

impl Deref for Tree {
    type Target = Vec<Quadrant>;

    fn deref(&self) -> &Self::Target {
        &self.quadrants
    }
}

impl DerefMut for Tree {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.quadrants
    }
}

/// Classify which side of the root a quadrant lies on per axis
/// (-1, 0, +1); `None` for quadrants inside the root.
fn outside_region(q: &Quadrant, dim: Dim) -> Option<[i8; 3]> {
    let r = dim.root_len();
    let mut region = [0i8; 3];
    for axis in 0..dim.axes() {
        let c = q.coord(axis);
        region[axis] = if c < 0 {
            -1
        } else if c >= r {
            1
        } else {
            0
        };
    }
    if region == [0; 3] {
        None
    } else {
        Some(region)
    }
}

/// Whether both quadrants sit in the same outside corner or outside edge
/// region, where overlap is admissible.
fn shared_outside_region(a: &Quadrant, b: &Quadrant, dim: Dim) -> bool {
    match (outside_region(a, dim), outside_region(b, dim)) {
        (Some(ra), Some(rb)) => {
            ra == rb && ra.iter().filter(|&&s| s != 0).count() >= 2
        }
        _ => false,
    }
}

/// Insert the minimal sorted sequence of quadrants covering the Morton
/// interval between `a` and `b`, which must satisfy `a < b`. The
/// inclusion flags prepend `a` and append `b` themselves.
pub fn complete_region(
    a: &Quadrant,
    include_a: bool,
    b: &Quadrant,
    include_b: bool,
    dim: Dim,
) -> Vec<Quadrant> {
    assert!(compare(a, b) == std::cmp::Ordering::Less);
    debug_assert!(!a.is_ancestor(b, dim));

    let mut out = Vec::new();
    if include_a {
        out.push(*a);
    }

    let nca = a.nearest_common_ancestor(b, dim);
    let mut work: VecDeque<Quadrant> = nca.children(dim).into_iter().collect();
    while let Some(w) = work.pop_front() {
        if *a < w && w < *b && !w.is_ancestor(b, dim) {
            out.push(w);
        } else if w.is_ancestor(a, dim) || w.is_ancestor(b, dim) {
            // Depth first: the children replace their parent at the head
            // of the queue in ascending child order, so emission stays in
            // Morton order.
            for (i, c) in w.children(dim).into_iter().enumerate() {
                work.insert(i, c);
            }
        }
    }

    if include_b {
        out.push(*b);
    }
    out
}

/// Cover `[from, to)` in deepest-level Morton indices with maximal
/// quadrants, appending them in order.
pub fn fill_gap(mut from: u64, to: u64, dim: Dim, out: &mut Vec<Quadrant>) {
    let d = dim.axes() as u32;
    let max_level = dim.max_level() as u32;
    while from < to {
        let mut level = dim.max_level();
        // Coarsen while the block stays aligned and inside the gap.
        while level > 0 {
            let cells = 1u64 << (d * (max_level - level as u32 + 1));
            if from % cells == 0 && from + cells <= to {
                level -= 1;
            } else {
                break;
            }
        }
        let q = Quadrant::from_morton_index(from, level, dim);
        from += q.num_cells(dim);
        out.push(q);
    }
}
