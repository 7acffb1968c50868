//! Local 2:1 balance of a tree, and the border variant used across trees.
//!
//! The sweep walks levels from the finest down. Every quadrant at the
//! current level, from the input sequence and from the candidates
//! accumulated so far, proposes its siblings, its parent and the parent's
//! neighbors touching it; proposals are deduplicated through a per-level
//! hash bank and appended to per-level outlists, which cascades the
//! grading towards the coarse levels. Afterwards the accepted candidates
//! are merged into the tree, which is trimmed and linearized.

use std::collections::HashMap;

use log::debug;

use crate::tree::{fill_gap, Tree};
use crate::types::forest::{InitFn, PayloadPool};
use crate::types::quadrant::{Dim, Quadrant, TopIdx};

/// Which neighbor relations the 2:1 condition is enforced over. `None`
/// performs completion only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Balance {
    None,
    Face,
    Edge,
    Corner,
}

impl Balance {
    pub fn includes_face(self) -> bool {
        self >= Balance::Face
    }

    pub fn includes_edge(self, dim: Dim) -> bool {
        dim == Dim::Three && self >= Balance::Edge
    }

    /// Corner balance is selector 2 in 2D and selector 3 in 3D.
    pub fn includes_corner(self, dim: Dim) -> bool {
        match dim {
            Dim::Two => self >= Balance::Edge,
            Dim::Three => self >= Balance::Corner,
        }
    }
}

/// How a candidate entered the bank: directly, or as the parent of a
/// processed quadrant. A parent that is found again as a parent proves its
/// own chain has already been generated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CandKind {
    Inserted,
    Parent,
}

/// Spatial admissibility of candidates.
enum Bound {
    /// The extended 3x3 insulation of the tree root; candidates inside
    /// the root are rejected when their trigger lies outside it, since
    /// cross-tree influence travels through the overlap machinery.
    Insulation,
    /// Strictly inside one containing quadrant (border balance).
    Within(Quadrant),
}

struct Sweep<'a> {
    dim: Dim,
    btype: Balance,
    input: &'a [Quadrant],
    bound: Bound,
    outlist: Vec<Vec<Quadrant>>,
    hash: Vec<HashMap<Quadrant, CandKind>>,
}

impl<'a> Sweep<'a> {
    fn new(dim: Dim, btype: Balance, input: &'a [Quadrant], maxlevel: usize, bound: Bound) -> Self {
        Sweep {
            dim,
            btype,
            input,
            bound,
            outlist: vec![Vec::new(); maxlevel + 1],
            hash: vec![HashMap::new(); maxlevel + 1],
        }
    }

    fn admissible(&self, cand: &Quadrant, trigger_inside: bool) -> bool {
        match &self.bound {
            Bound::Insulation => {
                cand.is_inside_3x3(self.dim)
                    && (trigger_inside || !cand.is_inside_root(self.dim))
            }
            Bound::Within(p) => p.is_ancestor(cand, self.dim),
        }
    }

    fn try_insert(&mut self, cand: Quadrant, kind: CandKind) {
        let level = cand.level as usize;
        if let Some(existing) = self.hash[level].get_mut(&cand) {
            // A parent found again as a parent has had its chain
            // generated already; recording the kind keeps that knowledge.
            if kind == CandKind::Parent {
                *existing = CandKind::Parent;
            }
            return;
        }
        if self.input.binary_search(&cand).is_ok() {
            // Present in the tree already; remember a parent sighting but
            // do not duplicate the quadrant.
            if kind == CandKind::Parent {
                self.hash[level].insert(cand, kind);
            }
            return;
        }
        self.hash[level].insert(cand, kind);
        self.outlist[level].push(cand);
    }

    /// Stage-1 candidates of one processed quadrant.
    fn process(&mut self, q: Quadrant, skip_siblings: bool) {
        let dim = self.dim;
        let trigger_inside = q.is_inside_root(dim);
        let cid = q.child_id(dim);

        if !skip_siblings && trigger_inside {
            for id in 0..dim.num_children() {
                if id != cid {
                    let s = q.sibling(id, dim);
                    if self.admissible(&s, trigger_inside) {
                        self.try_insert(s, CandKind::Inserted);
                    }
                }
            }
        }

        let p = q.parent(dim);
        if self.admissible(&p, trigger_inside) {
            self.try_insert(p, CandKind::Parent);
        }

        if self.btype.includes_face() {
            for axis in 0..dim.axes() {
                let face = 2 * axis + ((cid >> axis) & 1);
                let n = p.face_neighbor(face, dim);
                if self.admissible(&n, trigger_inside) {
                    self.try_insert(n, CandKind::Inserted);
                }
            }
        }
        if self.btype.includes_edge(dim) {
            for edge in 0..dim.num_edges() {
                let n = p.edge_neighbor(edge, dim);
                if self.admissible(&n, trigger_inside) {
                    self.try_insert(n, CandKind::Inserted);
                }
            }
        }
        if self.btype.includes_corner(dim) {
            let n = p.corner_neighbor(cid, dim);
            if self.admissible(&n, trigger_inside) {
                self.try_insert(n, CandKind::Inserted);
            }
        }
    }

    /// Bottom-up over levels down to `minlevel`. Candidate lists grow
    /// while they are scanned; everything accumulated at a level is
    /// processed at that level.
    fn run(&mut self, minlevel: usize) {
        let maxlevel = self.outlist.len() - 1;
        let nc = self.dim.num_children();
        for level in (minlevel..=maxlevel).rev() {
            let mut i = 0;
            while i < self.input.len() {
                let q = self.input[i];
                if q.level as usize != level {
                    i += 1;
                    continue;
                }
                if i + nc <= self.input.len()
                    && Quadrant::is_family(&self.input[i..i + nc], self.dim)
                {
                    // A complete family needs no sibling stage.
                    for j in 0..nc {
                        self.process(self.input[i + j], true);
                    }
                    i += nc;
                } else {
                    self.process(q, false);
                    i += 1;
                }
            }
            let mut k = 0;
            while k < self.outlist[level].len() {
                let q = self.outlist[level][k];
                self.process(q, false);
                k += 1;
            }
        }
    }

    fn into_candidates(self) -> Vec<Quadrant> {
        self.outlist.into_iter().flatten().collect()
    }
}

/// Balance one tree in place. The input must be almost sorted; it need
/// not be linear or complete. On return the tree is sorted, linear,
/// complete over its owned range, and graded 2:1 for the selected
/// neighbor kinds.
///
/// `window`, when given, is the half-open ownership range of deepest
/// Morton indices used by the trim (first or last local tree).
pub fn balance_subtree(
    tree: &mut Tree,
    dim: Dim,
    btype: Balance,
    window: Option<(u64, u64)>,
    mut pool: Option<&mut PayloadPool>,
    init: Option<InitFn>,
    which_tree: TopIdx,
) {
    assert!(!tree.is_empty(), "cannot balance an empty tree");
    assert!(tree.is_almost_sorted(dim), "balance input must be almost sorted");

    let maxlevel = tree.maxlevel as usize;
    let input = tree.quadrants.clone();
    let mut sweep = Sweep::new(dim, btype, &input, maxlevel, Bound::Insulation);
    sweep.run(1);
    let candidates = sweep.into_candidates();
    debug!(
        "balance_subtree: {} candidates for {} quadrants",
        candidates.len(),
        input.len()
    );

    for cand in candidates {
        if cand.is_inside_root(dim) {
            let mut q = cand;
            if let Some(pool) = pool.as_deref_mut() {
                q.data = pool.allocate();
                if let Some(init) = init {
                    init(pool.bytes_mut(q.data), which_tree, &q);
                }
            }
            tree.push(q);
        }
    }
    tree.sort();
    tree.remove_nonowned(dim, window, pool.as_deref_mut());
    tree.linearize(dim, pool);

    if window.is_none() && !tree.is_empty() {
        debug_assert!(tree.is_complete(dim));
    }
}

/// Balance the interior of one containing quadrant `p`, seeded by
/// zero-child descendants produced by the overlap step. Returns the
/// sorted linear sequence that tiles `p` exactly and replaces it.
///
/// Gaps between the graded neighborhoods of the seeds are closed by the
/// Morton-successor walk, each emitted quadrant the largest that fits the
/// remaining gap.
pub fn balance_border(p: &Quadrant, seeds: &[Quadrant], dim: Dim, btype: Balance) -> Vec<Quadrant> {
    debug_assert!(seeds.iter().all(|s| p.is_ancestor(s, dim)));
    if seeds.is_empty() {
        return vec![*p];
    }

    let mut sorted = seeds.to_vec();
    sorted.sort();
    sorted.dedup();
    let maxlevel = sorted.iter().map(|q| q.level).max().unwrap() as usize;

    let candidates = {
        let mut sweep = Sweep::new(dim, btype, &sorted, maxlevel, Bound::Within(*p));
        sweep.run(p.level as usize + 1);
        sweep.into_candidates()
    };

    let mut all = sorted;
    all.extend(candidates);
    all.sort();
    let mut filled = Tree::from_quadrants(all, dim);
    filled.linearize(dim, None);

    let start = p.morton_index(dim);
    let end = start + p.num_cells(dim);
    let mut out = Vec::with_capacity(filled.len());
    let mut pos = start;
    for q in filled.quadrants.iter() {
        fill_gap(pos, q.morton_index(dim), dim, &mut out);
        out.push(*q);
        pos = q.morton_index(dim) + q.num_cells(dim);
    }
    fill_gap(pos, end, dim, &mut out);
    out
}
