//! Overlap: the quadrants a neighboring tree or process needs in order to
//! balance its own leaves against this one's refinement.
//!
//! For every input quadrant the 3x3 (3x3x3) insulation of same-level
//! cells is walked. Cells landing in another tree are carried across the
//! connectivity's face, edge or corner transform; the neighbor tree's
//! border sequence is range-searched between the cell's first and last
//! descendants, and strictly finer quadrants found there are reported in
//! the input quadrant's own frame.

use std::cmp::Ordering;

use crate::balance::Balance;
use crate::types::connectivity::Connectivity;
use crate::types::quadrant::{Coord, Dim, Quadrant, TopIdx};

/// A quadrant tagged with the tree it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaggedQuadrant {
    pub which_tree: TopIdx,
    pub quad: Quadrant,
}

impl Ord for TaggedQuadrant {
    fn cmp(&self, other: &Self) -> Ordering {
        self.which_tree
            .cmp(&other.which_tree)
            .then_with(|| self.quad.cmp(&other.quad))
    }
}

impl PartialOrd for TaggedQuadrant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The kind of insulation cell a neighbor was found through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CellKind {
    Face,
    Edge,
    Corner,
}

/// The seed ancestor that a finer remote quadrant forces an input
/// quadrant to split down to: the descendant of `q` at one level coarser
/// than `r`, nearest to `r`.
fn balance_seed(q: &Quadrant, r: &Quadrant, dim: Dim) -> Quadrant {
    let level = r.level - 1;
    debug_assert!(level > q.level);
    let h = Quadrant::len(level, dim) as i64;
    let mut seed = Quadrant::new(0, 0, 0, level);
    for axis in 0..dim.axes() {
        let lo = q.coord(axis) as i64;
        let hi = lo + q.side(dim) as i64 - h;
        let aligned = (r.coord(axis) as i64) & !(h - 1);
        seed.set_coord(axis, aligned.clamp(lo, hi) as Coord);
    }
    debug_assert!(q.is_ancestor(&seed, dim));
    seed
}

/// Face-neighbor balance test: the seed of `q` forced by `r` across a
/// shared face, if `r` is strictly finer than `q.level + 1`.
pub fn balance_face_test(q: &Quadrant, r: &Quadrant, dim: Dim) -> Option<Quadrant> {
    (r.level > q.level + 1).then(|| balance_seed(q, r, dim))
}

/// Edge-neighbor balance test (3D).
pub fn balance_edge_test(q: &Quadrant, r: &Quadrant, dim: Dim) -> Option<Quadrant> {
    debug_assert!(dim == Dim::Three);
    (r.level > q.level + 1).then(|| balance_seed(q, r, dim))
}

/// Corner-neighbor balance test.
pub fn balance_corner_test(q: &Quadrant, r: &Quadrant, dim: Dim) -> Option<Quadrant> {
    (r.level > q.level + 1).then(|| balance_seed(q, r, dim))
}

/// Quadrants of `border` whose anchors lie within `cell`.
fn within_cell<'a>(border: &'a [Quadrant], cell: &Quadrant, dim: Dim) -> &'a [Quadrant] {
    let l = dim.max_level();
    let first = cell.first_descendant(l, dim);
    let last = cell.last_descendant(l, dim);
    let lo = border.partition_point(|b| *b < first);
    let hi = border.partition_point(|b| *b <= last);
    &border[lo..hi]
}

/// Walk the insulation of `q` in tree `t` and report, in `q`'s frame,
/// every border quadrant strictly finer than `q.level + 1` together with
/// the cell kind it was reached through.
fn for_each_influencer<F>(
    conn: &Connectivity,
    t: TopIdx,
    q: &Quadrant,
    borders: &[Vec<Quadrant>],
    btype: Balance,
    mut report: F,
) where
    F: FnMut(CellKind, Quadrant),
{
    let dim = conn.dim();
    let h = q.side(dim);
    let r = dim.root_len();
    let ksteps: &[Coord] = if dim == Dim::Three { &[-1, 0, 1] } else { &[0] };

    for &k in ksteps {
        for j in [-1, 0, 1] {
            for i in [-1, 0, 1] {
                if i == 0 && j == 0 && k == 0 {
                    continue;
                }
                let mut cell = *q;
                cell.x += i * h;
                cell.y += j * h;
                cell.z += k * h;

                // Classify the cell against the root and gate on the
                // selected balance kinds.
                let mut signs = [0i8; 3];
                for axis in 0..dim.axes() {
                    let c = cell.coord(axis);
                    signs[axis] = if c < 0 {
                        -1
                    } else if c >= r {
                        1
                    } else {
                        0
                    };
                }
                let outside = signs.iter().filter(|&&s| s != 0).count();
                let kind = match (dim, outside) {
                    (_, 0) | (_, 1) => CellKind::Face,
                    (Dim::Three, 2) => CellKind::Edge,
                    _ => CellKind::Corner,
                };
                let wanted = match kind {
                    CellKind::Face => btype.includes_face(),
                    CellKind::Edge => btype.includes_edge(dim),
                    CellKind::Corner => btype.includes_corner(dim),
                };
                if !wanted {
                    continue;
                }

                let floor = q.level + 1;
                if outside == 0 {
                    for cand in within_cell(&borders[t as usize], &cell, dim) {
                        if cand.level > floor {
                            report(kind, *cand);
                        }
                    }
                } else if outside == 1 {
                    let axis = signs.iter().position(|&s| s != 0).unwrap();
                    let face = 2 * axis + usize::from(signs[axis] > 0);
                    if let Some(ft) = conn.face_transform(t, face) {
                        let mapped = ft.apply(&cell, dim);
                        let back = ft.invert(t, face as u8);
                        for cand in within_cell(&borders[ft.ntree as usize], &mapped, dim) {
                            if cand.level > floor {
                                report(kind, back.apply(cand, dim));
                            }
                        }
                    }
                } else if kind == CellKind::Edge {
                    let axis = signs.iter().position(|&s| s == 0).unwrap();
                    let bits = edge_bits(&signs, axis);
                    let edge = 4 * axis + bits;
                    for et in conn.edge_transforms(t, edge) {
                        let mapped = et.apply(&cell, dim);
                        for cand in within_cell(&borders[et.ntree as usize], &mapped, dim) {
                            if cand.level > floor {
                                report(kind, et.apply_inverse(cand, dim));
                            }
                        }
                    }
                } else {
                    let mut corner = 0;
                    for axis in 0..dim.axes() {
                        if signs[axis] > 0 {
                            corner |= 1 << axis;
                        }
                    }
                    for ct in conn.corner_transforms(t, corner) {
                        let mapped = ct.apply(&cell, dim);
                        for cand in within_cell(&borders[ct.ntree as usize], &mapped, dim) {
                            if cand.level > floor {
                                report(kind, ct.apply_inverse(cand, dim));
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Bits of an edge index: which side of the two transverse axes the cell
/// lies on.
fn edge_bits(signs: &[i8; 3], along: usize) -> usize {
    let mut bits = 0;
    let mut k = 0;
    for axis in 0..3 {
        if axis == along {
            continue;
        }
        if signs[axis] > 0 {
            bits |= 1 << k;
        }
        k += 1;
    }
    bits
}

/// For each input quadrant, the minimal split seeds its tree must refine
/// to in order to stay balanced against the borders, each emitted as the
/// zero-sibling of the seed and tagged with the input's tree.
pub fn compute_overlap(
    conn: &Connectivity,
    inputs: &[TaggedQuadrant],
    borders: &[Vec<Quadrant>],
    btype: Balance,
) -> Vec<TaggedQuadrant> {
    let dim = conn.dim();
    let mut out = Vec::new();
    for inp in inputs {
        for_each_influencer(conn, inp.which_tree, &inp.quad, borders, btype, |kind, r| {
            let seed = match kind {
                CellKind::Face => balance_face_test(&inp.quad, &r, dim),
                CellKind::Edge => balance_edge_test(&inp.quad, &r, dim),
                CellKind::Corner => balance_corner_test(&inp.quad, &r, dim),
            };
            if let Some(seed) = seed {
                out.push(TaggedQuadrant {
                    which_tree: inp.which_tree,
                    quad: seed.sibling(0, dim),
                });
            }
        });
    }
    out
}

/// The legacy variant: report the influencing quadrants themselves,
/// carried into the input quadrant's frame.
pub fn compute_overlap_legacy(
    conn: &Connectivity,
    inputs: &[TaggedQuadrant],
    borders: &[Vec<Quadrant>],
    btype: Balance,
) -> Vec<TaggedQuadrant> {
    let mut out = Vec::new();
    for inp in inputs {
        for_each_influencer(conn, inp.which_tree, &inp.quad, borders, btype, |_, r| {
            out.push(TaggedQuadrant {
                which_tree: inp.which_tree,
                quad: r,
            });
        });
    }
    out
}

/// Sort by `(tree, Morton)`, drop exact duplicates and entries present in
/// the skip list.
pub fn uniqify_overlap(out: &mut Vec<TaggedQuadrant>, skip: &[TaggedQuadrant]) {
    let mut skip = skip.to_vec();
    skip.sort();
    out.sort();
    out.dedup();
    out.retain(|entry| skip.binary_search(entry).is_err());
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::tree::Tree;

    /// Two face-joined trees: tree 0 at level 1, tree 1 refined to
    /// `level` against its -x face.
    fn two_tree_fixture(level: u8) -> (Connectivity, Vec<Vec<Quadrant>>) {
        let dim = Dim::Two;
        let conn = Connectivity::two_trees(dim);
        let tree0 = Quadrant::root().children(dim);

        let mut seed = Quadrant::root();
        for _ in 0..level {
            seed = seed.child(0, dim);
        }
        let mut tree1 = Tree::from_quadrants(vec![seed], dim);
        tree1.complete(dim);
        (conn, vec![tree0, tree1.quadrants])
    }

    #[test]
    fn test_overlap_seeds_across_face() {
        let dim = Dim::Two;
        let (conn, borders) = two_tree_fixture(4);
        let inputs: Vec<TaggedQuadrant> = borders[0]
            .iter()
            .map(|q| TaggedQuadrant {
                which_tree: 0,
                quad: *q,
            })
            .collect();

        let mut seeds = compute_overlap(&conn, &inputs, &borders, Balance::Face);
        uniqify_overlap(&mut seeds, &[]);
        assert!(!seeds.is_empty());
        for s in &seeds {
            assert_eq!(s.which_tree, 0);
            assert!(s.quad.is_inside_root(dim));
            assert_eq!(s.quad.child_id(dim), 0);
            // Seeds split the +x boundary leaf of tree 0.
            let owner = Quadrant::root().child(1, dim);
            assert!(owner.is_ancestor(&s.quad, dim));
        }
        // The deepest forcing quadrant is at level 4, so the finest seed
        // splits down to level 3.
        assert_eq!(seeds.iter().map(|s| s.quad.level).max().unwrap(), 3);
    }

    #[test]
    fn test_overlap_quiet_when_graded() {
        // A level-2 refinement does not force a level-1 neighbor to split.
        let (conn, borders) = two_tree_fixture(2);
        let inputs: Vec<TaggedQuadrant> = borders[0]
            .iter()
            .map(|q| TaggedQuadrant {
                which_tree: 0,
                quad: *q,
            })
            .collect();
        let seeds = compute_overlap(&conn, &inputs, &borders, Balance::Face);
        assert!(seeds.is_empty());
    }

    #[test]
    fn test_overlap_legacy_reports_remote() {
        let dim = Dim::Two;
        let (conn, borders) = two_tree_fixture(4);
        let boundary_leaf = TaggedQuadrant {
            which_tree: 0,
            quad: Quadrant::root().child(1, dim),
        };
        let mut out = compute_overlap_legacy(&conn, &[boundary_leaf], &borders, Balance::Face);
        uniqify_overlap(&mut out, &[]);
        assert!(!out.is_empty());
        for entry in &out {
            // Influencers live beyond tree 0's +x face, in extended
            // coordinates, strictly finer than level 2.
            assert!(entry.quad.x >= dim.root_len());
            assert!(!entry.quad.is_inside_root(dim));
            assert!(entry.quad.level > boundary_leaf.quad.level + 1);
        }
    }

    #[test]
    fn test_overlap_same_tree_influence() {
        let dim = Dim::Two;
        let conn = Connectivity::unit_square();
        // A coarse leaf and, elsewhere in the same tree, a deep one.
        let coarse = Quadrant::root().child(0, dim);
        let mut deep = Tree::from_quadrants(
            vec![Quadrant::root().child(1, dim).child(0, dim).child(0, dim).child(0, dim)],
            dim,
        );
        deep.complete(dim);
        let inputs = [TaggedQuadrant {
            which_tree: 0,
            quad: coarse,
        }];
        let seeds = compute_overlap(&conn, &inputs, &[deep.quadrants.clone()], Balance::Face);
        assert!(!seeds.is_empty());
        for s in &seeds {
            assert!(coarse.is_ancestor(&s.quad, dim));
        }
    }

    #[test]
    fn test_uniqify_overlap() {
        let dim = Dim::Two;
        let a = TaggedQuadrant {
            which_tree: 0,
            quad: Quadrant::root().child(0, dim),
        };
        let b = TaggedQuadrant {
            which_tree: 1,
            quad: Quadrant::root().child(0, dim),
        };
        let c = TaggedQuadrant {
            which_tree: 0,
            quad: Quadrant::root().child(2, dim),
        };
        let mut out = vec![b, a, c, a, b];
        uniqify_overlap(&mut out, &[c]);
        assert_eq!(out, vec![a, b]);
    }
}
