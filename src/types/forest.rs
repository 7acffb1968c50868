//! The forest: a sequence of trees distributed across processes.

use memoffset::offset_of;
use mpi::{
    collective::SystemOperation,
    datatype::{Equivalence, UncommittedUserDatatype, UserDatatype},
    traits::*,
    Address,
};

use log::{debug, warn};

use crate::balance::{balance_border, balance_subtree, Balance};
use crate::checksum::{checksum, combine, stream_len};
use crate::overlap::{compute_overlap, uniqify_overlap, TaggedQuadrant};
use crate::tree::Tree;
use crate::types::connectivity::Connectivity;
use crate::types::quadrant::{Coord, Dim, GlobIdx, LocIdx, Quadrant, TopIdx};

/// Callback that fills the payload of a freshly materialized quadrant.
pub type InitFn = fn(&mut [u8], TopIdx, &Quadrant);

/// Fixed-size payload arena with index handles and a free list.
///
/// Handles are stable across allocation and release; the balance hash
/// tables key on quadrant coordinates, never on payload addresses, so
/// reuse is safe.
#[derive(Clone, Debug)]
pub struct PayloadPool {
    data_size: usize,
    storage: Vec<u8>,
    free: Vec<i64>,
}

impl PayloadPool {
    pub fn new(data_size: usize) -> PayloadPool {
        PayloadPool {
            data_size,
            storage: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Number of handles currently live.
    pub fn live(&self) -> usize {
        if self.data_size == 0 {
            return 0;
        }
        self.storage.len() / self.data_size - self.free.len()
    }

    /// Hand out a zeroed payload slot; -1 when the forest carries none.
    pub fn allocate(&mut self) -> i64 {
        if self.data_size == 0 {
            return -1;
        }
        if let Some(idx) = self.free.pop() {
            self.bytes_mut(idx).fill(0);
            return idx;
        }
        let idx = (self.storage.len() / self.data_size) as i64;
        self.storage.resize(self.storage.len() + self.data_size, 0);
        idx
    }

    pub fn release(&mut self, idx: i64) {
        if idx >= 0 {
            debug_assert!((idx as usize + 1) * self.data_size <= self.storage.len());
            self.free.push(idx);
        }
    }

    pub fn bytes(&self, idx: i64) -> &[u8] {
        let at = idx as usize * self.data_size;
        &self.storage[at..at + self.data_size]
    }

    pub fn bytes_mut(&mut self, idx: i64) -> &mut [u8] {
        let at = idx as usize * self.data_size;
        &mut self.storage[at..at + self.data_size]
    }
}

/// A partition marker: the deepest-level first corner of the first leaf a
/// process owns, together with its tree.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Position {
    pub which_tree: TopIdx,
    pub x: Coord,
    pub y: Coord,
    pub z: Coord,
}

unsafe impl Equivalence for Position {
    type Out = UserDatatype;
    fn equivalent_datatype() -> Self::Out {
        UserDatatype::structured(
            &[1, 3],
            &[
                offset_of!(Position, which_tree) as Address,
                offset_of!(Position, x) as Address,
            ],
            &[
                UncommittedUserDatatype::contiguous(1, &TopIdx::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &Coord::equivalent_datatype()).as_ref(),
            ],
        )
    }
}

impl Position {
    pub fn new(which_tree: TopIdx, q: &Quadrant) -> Position {
        Position {
            which_tree,
            x: q.x,
            y: q.y,
            z: q.z,
        }
    }

    /// The end sentinel: one past the last tree.
    pub fn sentinel(num_trees: TopIdx) -> Position {
        Position {
            which_tree: num_trees,
            x: 0,
            y: 0,
            z: 0,
        }
    }

    pub fn as_quadrant(&self, dim: Dim) -> Quadrant {
        Quadrant::new(self.x, self.y, self.z, dim.max_level())
    }

    /// Deepest-level Morton index within the position's tree.
    pub fn morton_index(&self, dim: Dim) -> u64 {
        self.as_quadrant(dim).morton_index(dim)
    }
}

/// A forest of quadtrees or octrees, with the replicated partition state.
pub struct Forest {
    pub connectivity: Connectivity,
    /// All trees of the connectivity; trees outside the local range stay
    /// empty.
    pub trees: Vec<Tree>,
    /// First and last locally nonempty tree; (-1, -2) on an empty rank.
    pub first_local_tree: TopIdx,
    pub last_local_tree: TopIdx,
    pub local_num_quadrants: LocIdx,
    pub global_num_quadrants: GlobIdx,
    /// Prefix sums of per-process quadrant counts, length P + 1.
    pub global_first_quadrant: Vec<GlobIdx>,
    /// First owned leaf position per process, length P + 1 with sentinel.
    pub global_first_position: Vec<Position>,
    pub mpirank: i32,
    pub mpisize: i32,
    pub data_size: usize,
    pub user_pool: PayloadPool,
    pub init_fn: Option<InitFn>,
}

impl Forest {
    /// Build a uniformly refined forest collectively over `comm`.
    pub fn new<C: Communicator>(
        comm: &C,
        connectivity: Connectivity,
        initial_level: u8,
        data_size: usize,
        init_fn: Option<InitFn>,
    ) -> Forest {
        Forest::build(
            connectivity,
            initial_level,
            data_size,
            init_fn,
            comm.rank(),
            comm.size(),
        )
    }

    /// A single-process forest, for serial callers and tests.
    pub fn new_serial(
        connectivity: Connectivity,
        initial_level: u8,
        data_size: usize,
        init_fn: Option<InitFn>,
    ) -> Forest {
        Forest::build(connectivity, initial_level, data_size, init_fn, 0, 1)
    }

    fn build(
        connectivity: Connectivity,
        initial_level: u8,
        data_size: usize,
        init_fn: Option<InitFn>,
        rank: i32,
        size: i32,
    ) -> Forest {
        let dim = connectivity.dim();
        assert!(initial_level <= dim.max_level());
        let num_trees = connectivity.num_trees();
        let d = dim.axes() as u32;
        let per_tree: GlobIdx = 1 << (d * initial_level as u32);
        let global_num = per_tree * num_trees as GlobIdx;
        let shift = d * (dim.max_level() - initial_level) as u32;

        let global_first_quadrant: Vec<GlobIdx> = (0..=size as GlobIdx)
            .map(|p| p * global_num / size as GlobIdx)
            .collect();
        let global_first_position: Vec<Position> = global_first_quadrant
            .iter()
            .map(|&g| {
                if g >= global_num {
                    Position::sentinel(num_trees)
                } else {
                    let tree = (g / per_tree) as TopIdx;
                    let q =
                        Quadrant::from_morton_index((g % per_tree) as u64 << shift, initial_level, dim);
                    Position::new(tree, &q)
                }
            })
            .collect();

        let mut forest = Forest {
            connectivity,
            trees: (0..num_trees).map(|_| Tree::new()).collect(),
            first_local_tree: -1,
            last_local_tree: -2,
            local_num_quadrants: 0,
            global_num_quadrants: global_num,
            global_first_quadrant,
            global_first_position,
            mpirank: rank,
            mpisize: size,
            data_size,
            user_pool: PayloadPool::new(data_size),
            init_fn,
        };

        let my_first = forest.global_first_quadrant[rank as usize];
        let my_end = forest.global_first_quadrant[rank as usize + 1];
        for g in my_first..my_end {
            let tree = (g / per_tree) as TopIdx;
            let mut q = Quadrant::from_morton_index((g % per_tree) as u64 << shift, initial_level, dim);
            q.data = forest.user_pool.allocate();
            if let Some(init) = forest.init_fn {
                if q.data >= 0 {
                    init(forest.user_pool.bytes_mut(q.data), tree, &q);
                }
            }
            forest.trees[tree as usize].push(q);
        }
        forest.refresh_local_meta();
        forest
    }

    pub fn dim(&self) -> Dim {
        self.connectivity.dim()
    }

    /// Recompute tree offsets, descendant caches, the local tree range
    /// and the local count from the tree contents.
    pub fn refresh_local_meta(&mut self) {
        let dim = self.dim();
        self.first_local_tree = -1;
        self.last_local_tree = -2;
        let mut offset: LocIdx = 0;
        for (t, tree) in self.trees.iter_mut().enumerate() {
            tree.recount(dim);
            tree.quadrants_offset = offset;
            offset += tree.len() as LocIdx;
            if !tree.is_empty() {
                if self.first_local_tree < 0 {
                    self.first_local_tree = t as TopIdx;
                }
                self.last_local_tree = t as TopIdx;
            }
        }
        self.local_num_quadrants = offset;
    }

    /// Iterate the indices of locally nonempty trees.
    pub fn local_trees(&self) -> impl Iterator<Item = TopIdx> + '_ {
        self.trees
            .iter()
            .enumerate()
            .filter(|(_, tree)| !tree.is_empty())
            .map(|(t, _)| t as TopIdx)
    }

    /// The half-open ownership window of deepest Morton indices for one
    /// local tree, or None when the whole tree is owned.
    pub fn tree_window(&self, which_tree: TopIdx) -> Option<(u64, u64)> {
        let dim = self.dim();
        let r = self.mpirank as usize;
        let total = Quadrant::root().num_cells(dim);
        let first_pos = &self.global_first_position[r];
        let next_pos = &self.global_first_position[r + 1];
        let start = if first_pos.which_tree == which_tree {
            first_pos.morton_index(dim)
        } else {
            0
        };
        let end = if next_pos.which_tree == which_tree {
            next_pos.morton_index(dim)
        } else {
            total
        };
        if start == 0 && end == total {
            None
        } else {
            Some((start, end))
        }
    }

    /// Checksum of the locally owned quadrants, with the stream length
    /// needed to chain across ranks.
    pub fn checksum_local(&self) -> (u32, u64) {
        let dim = self.dim();
        let mut crc = 0u32;
        let mut len = 0u64;
        for tree in &self.trees {
            let part = checksum(&tree.quadrants, dim);
            let part_len = stream_len(tree.len(), dim);
            crc = combine(crc, part, part_len);
            len += part_len;
        }
        (crc, len)
    }

    /// The forest checksum, identical on every rank and independent of
    /// the process count for the same leaf sequence.
    pub fn checksum_global<C: CommunicatorCollectives>(&self, comm: &C) -> u32 {
        let (crc, len) = self.checksum_local();
        let local = [crc as u64, len];
        let mut all = vec![0u64; 2 * self.mpisize as usize];
        comm.all_gather_into(&local[..], &mut all[..]);
        let mut acc_crc = 0u32;
        for p in 0..self.mpisize as usize {
            acc_crc = combine(acc_crc, all[2 * p] as u32, all[2 * p + 1]);
        }
        acc_crc
    }

    /// Per-rank validity: tree structure, bookkeeping and the boundary
    /// agreement with the replicated partition vectors.
    pub fn is_valid_local(&self) -> bool {
        let dim = self.dim();
        let r = self.mpirank as usize;

        let mut offset: LocIdx = 0;
        for (t, tree) in self.trees.iter().enumerate() {
            if tree.quadrants_offset != offset {
                warn!("tree {} offset mismatch", t);
                return false;
            }
            offset += tree.len() as LocIdx;
            if !tree.is_linear(dim) {
                warn!("tree {} is not linear", t);
                return false;
            }
            let mut copy = tree.clone();
            copy.recount(dim);
            if copy.quadrants_per_level != tree.quadrants_per_level
                || copy.maxlevel != tree.maxlevel
            {
                warn!("tree {} per-level counts stale", t);
                return false;
            }
            if !tree.is_empty()
                && (copy.first_desc != tree.first_desc || copy.last_desc != tree.last_desc)
            {
                warn!("tree {} descendant cache stale", t);
                return false;
            }
            for q in tree.quadrants.iter() {
                if !q.is_valid(dim) {
                    warn!("tree {} holds an invalid quadrant", t);
                    return false;
                }
            }
        }
        if offset != self.local_num_quadrants {
            warn!("local quadrant count mismatch");
            return false;
        }

        let gfq = &self.global_first_quadrant;
        if gfq[0] != 0 || gfq[self.mpisize as usize] != self.global_num_quadrants {
            warn!("global prefix endpoints wrong");
            return false;
        }
        if gfq[r + 1] - gfq[r] != self.local_num_quadrants as GlobIdx {
            warn!("global prefix disagrees with local count");
            return false;
        }
        if gfq.windows(2).any(|w| w[0] > w[1]) {
            warn!("global prefix not monotone");
            return false;
        }

        if self.local_num_quadrants == 0 {
            if self.first_local_tree != -1 || self.last_local_tree != -2 {
                warn!("empty rank with nonempty tree range");
                return false;
            }
            return true;
        }

        // Boundary quadrants must agree with the partition markers.
        let first_pos = &self.global_first_position[r];
        let first_tree = &self.trees[self.first_local_tree as usize];
        if first_pos.which_tree != self.first_local_tree
            || first_tree.first_desc != first_pos.as_quadrant(dim)
        {
            warn!("first position marker disagrees with first leaf");
            return false;
        }
        let next_pos = &self.global_first_position[r + 1];
        let last_tree = &self.trees[self.last_local_tree as usize];
        let end_index = last_tree.last_desc.morton_index(dim) + 1;
        let ok = if next_pos.which_tree == self.last_local_tree {
            next_pos.morton_index(dim) == end_index
        } else {
            next_pos.which_tree > self.last_local_tree
                && end_index == Quadrant::root().num_cells(dim)
        };
        if !ok {
            warn!("successor position marker disagrees with last leaf");
            return false;
        }
        true
    }

    /// Collective validity; a single failing rank fails every rank.
    pub fn is_valid<C: CommunicatorCollectives>(&self, comm: &C) -> bool {
        let local_fail: i32 = i32::from(!self.is_valid_local());
        let mut global_fail: i32 = 0;
        comm.all_reduce_into(&local_fail, &mut global_fail, SystemOperation::bitwise_or());
        global_fail == 0
    }

    /// Process-local part of 2:1 balance: grade every local tree, then
    /// trade split seeds across tree boundaries through the overlap until
    /// no seeds remain. Cross-process seed exchange stays with the
    /// caller.
    pub fn balance_local(&mut self, btype: Balance) {
        let dim = self.dim();
        let locals: Vec<TopIdx> = self.local_trees().collect();
        for &t in &locals {
            let window = self.tree_window(t);
            balance_subtree(
                &mut self.trees[t as usize],
                dim,
                btype,
                window,
                Some(&mut self.user_pool),
                self.init_fn,
                t,
            );
        }

        let max_rounds = dim.max_level() as usize + 1;
        for round in 0..max_rounds {
            let borders: Vec<Vec<Quadrant>> =
                self.trees.iter().map(|t| t.quadrants.clone()).collect();
            let inputs: Vec<TaggedQuadrant> = locals
                .iter()
                .flat_map(|&t| {
                    self.trees[t as usize].quadrants.iter().map(move |q| TaggedQuadrant {
                        which_tree: t,
                        quad: *q,
                    })
                })
                .collect();
            let mut seeds = compute_overlap(&self.connectivity, &inputs, &borders, btype);
            uniqify_overlap(&mut seeds, &[]);
            if seeds.is_empty() {
                debug!("balance_local: settled after {} rounds", round);
                break;
            }

            let mut touched = Vec::new();
            for &t in &locals {
                let tree_seeds: Vec<Quadrant> = seeds
                    .iter()
                    .filter(|s| s.which_tree == t)
                    .map(|s| s.quad)
                    .collect();
                if tree_seeds.is_empty() {
                    continue;
                }
                touched.push(t);
                // Group the seeds under their containing leaves; walk the
                // leaves from the back so splices keep indices stable.
                let tree = &mut self.trees[t as usize];
                let mut by_leaf: Vec<(usize, Vec<Quadrant>)> = Vec::new();
                for s in tree_seeds {
                    let at = tree.quadrants.partition_point(|q| *q <= s);
                    assert!(at > 0, "seed without a containing leaf");
                    let leaf = at - 1;
                    debug_assert!(tree.quadrants[leaf].is_ancestor(&s, dim));
                    match by_leaf.iter_mut().find(|(i, _)| *i == leaf) {
                        Some((_, list)) => list.push(s),
                        None => by_leaf.push((leaf, vec![s])),
                    }
                }
                by_leaf.sort_by(|a, b| b.0.cmp(&a.0));
                for (leaf, leaf_seeds) in by_leaf {
                    let p = tree.quadrants[leaf];
                    let mut filling = balance_border(&p, &leaf_seeds, dim, btype);
                    self.user_pool.release(p.data);
                    for q in filling.iter_mut() {
                        q.data = self.user_pool.allocate();
                        if let Some(init) = self.init_fn {
                            if q.data >= 0 {
                                init(self.user_pool.bytes_mut(q.data), t, q);
                            }
                        }
                    }
                    tree.quadrants.splice(leaf..=leaf, filling);
                }
                tree.recount(dim);
            }
            // Splitting border leaves may unbalance tree interiors.
            for t in touched {
                let window = self.tree_window(t);
                balance_subtree(
                    &mut self.trees[t as usize],
                    dim,
                    btype,
                    window,
                    Some(&mut self.user_pool),
                    self.init_fn,
                    t,
                );
            }
        }

        self.refresh_local_meta();
        if self.mpisize == 1 {
            self.global_num_quadrants = self.local_num_quadrants as GlobIdx;
            self.global_first_quadrant = vec![0, self.global_num_quadrants];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp_tree(bytes: &mut [u8], tree: TopIdx, _q: &Quadrant) {
        bytes[0] = tree as u8;
    }

    #[test]
    fn test_pool_reuse() {
        let mut pool = PayloadPool::new(8);
        let a = pool.allocate();
        let b = pool.allocate();
        assert_ne!(a, b);
        pool.bytes_mut(a).fill(7);
        pool.release(a);
        let c = pool.allocate();
        assert_eq!(c, a);
        assert_eq!(pool.bytes(c), &[0u8; 8]);
        assert_eq!(pool.live(), 2);
    }

    #[test]
    fn test_new_serial_uniform() {
        let conn = Connectivity::two_trees(Dim::Two);
        let forest = Forest::new_serial(conn, 2, 4, Some(stamp_tree));
        assert_eq!(forest.global_num_quadrants, 32);
        assert_eq!(forest.local_num_quadrants, 32);
        assert_eq!(forest.first_local_tree, 0);
        assert_eq!(forest.last_local_tree, 1);
        assert!(forest.is_valid_local());
        for t in 0..2 {
            let tree = &forest.trees[t];
            assert_eq!(tree.len(), 16);
            assert!(tree.is_complete(Dim::Two));
            for q in tree.quadrants.iter() {
                assert_eq!(forest.user_pool.bytes(q.data)[0], t as u8);
            }
        }
    }

    #[test]
    fn test_uniform_3d() {
        let conn = Connectivity::unit_cube();
        let forest = Forest::new_serial(conn, 1, 0, None);
        assert_eq!(forest.local_num_quadrants, 8);
        assert!(forest.is_valid_local());
        assert!(forest.trees[0].is_complete(Dim::Three));
    }

    #[test]
    fn test_is_valid_detects_corruption() {
        let conn = Connectivity::unit_square();
        let mut forest = Forest::new_serial(conn, 1, 0, None);
        assert!(forest.is_valid_local());
        forest.global_first_quadrant[1] += 1;
        assert!(!forest.is_valid_local());
    }

    #[test]
    fn test_balance_local_across_face() {
        let dim = Dim::Two;
        let conn = Connectivity::two_trees(dim);
        let mut forest = Forest::new_serial(conn, 1, 0, None);

        // Refine tree 1 hard against its -x face, which faces tree 0.
        let mut seeded = Tree::from_quadrants(vec![Quadrant::root().child(0, dim).child(0, dim).child(0, dim).child(0, dim)], dim);
        seeded.complete(dim);
        forest.trees[1] = seeded;
        forest.refresh_local_meta();
        forest.global_num_quadrants = forest.local_num_quadrants as GlobIdx;
        forest.global_first_quadrant = vec![0, forest.global_num_quadrants];

        forest.balance_local(Balance::Face);

        for t in 0..2 {
            assert!(forest.trees[t].is_complete(dim));
        }
        // No further seeds anywhere: the forest is balanced across the
        // shared face.
        let borders: Vec<Vec<Quadrant>> =
            forest.trees.iter().map(|t| t.quadrants.clone()).collect();
        let inputs: Vec<TaggedQuadrant> = (0..2)
            .flat_map(|t| {
                forest.trees[t].quadrants.iter().map(move |q| TaggedQuadrant {
                    which_tree: t as TopIdx,
                    quad: *q,
                })
            })
            .collect();
        let seeds = compute_overlap(&forest.connectivity, &inputs, &borders, Balance::Face);
        assert!(seeds.is_empty());
        // Tree 0 had to refine toward the face: more than four leaves now.
        assert!(forest.trees[0].len() > 4);
        assert!(forest.is_valid_local());
    }

    #[test]
    fn test_checksum_local_chains_trees() {
        let conn = Connectivity::two_trees(Dim::Two);
        let forest = Forest::new_serial(conn, 2, 0, None);
        let (crc, len) = forest.checksum_local();
        let all: Vec<Quadrant> = forest
            .trees
            .iter()
            .flat_map(|t| t.quadrants.iter().copied())
            .collect();
        assert_eq!(crc, checksum(&all, Dim::Two));
        assert_eq!(len, stream_len(all.len(), Dim::Two));
    }
}
