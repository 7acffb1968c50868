//! Coarse tree topology and inter-tree coordinate transforms.
//!
//! The connectivity is a consumed lookup API: it names, for every tree
//! face (and corner, and edge in 3D), the neighboring tree and the integer
//! transform that carries quadrant coordinates across the shared entity.
//! Construction of general topologies is out of scope; the builders below
//! cover single roots, face-joined pairs and rectangular bricks.

use crate::types::quadrant::{transverse_axes, Coord, Dim, Quadrant, TopIdx};

/// Affine coordinate map across a shared tree face.
///
/// Nine integers describe the map: an axis permutation, a per-axis sign
/// and a per-axis offset. Target coordinate `j` is computed as
/// `sign[j] * q[perm[j]] + offs[j]`, minus the quadrant side length when
/// the sign is negative so anchors stay anchors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaceTransform {
    pub ntree: TopIdx,
    pub nface: u8,
    pub perm: [usize; 3],
    pub sign: [i32; 3],
    pub offs: [i64; 3],
}

impl FaceTransform {
    /// Carry a quadrant across the face into the neighbor tree's frame.
    pub fn apply(&self, q: &Quadrant, dim: Dim) -> Quadrant {
        let h = q.side(dim) as i64;
        let mut r = Quadrant::new(0, 0, 0, q.level);
        for j in 0..dim.axes() {
            let src = q.coord(self.perm[j]) as i64;
            let mut c = self.sign[j] as i64 * src + self.offs[j];
            if self.sign[j] < 0 {
                c -= h;
            }
            r.set_coord(j, c as Coord);
        }
        r
    }

    /// The transform carrying neighbor-frame coordinates back across.
    pub fn invert(&self, my_tree: TopIdx, my_face: u8) -> FaceTransform {
        let mut perm = [0usize; 3];
        let mut sign = [1i32; 3];
        let mut offs = [0i64; 3];
        for j in 0..3 {
            let i = self.perm[j];
            perm[i] = j;
            sign[i] = self.sign[j];
            offs[i] = if self.sign[j] > 0 {
                -self.offs[j]
            } else {
                self.offs[j]
            };
        }
        FaceTransform {
            ntree: my_tree,
            nface: my_face,
            perm,
            sign,
            offs,
        }
    }
}

/// Diagonal neighbor across a tree corner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CornerTransform {
    pub ntree: TopIdx,
    pub corner: u8,
    pub ncorner: u8,
}

impl CornerTransform {
    /// Carry a quadrant sitting beyond `corner` of its tree into the
    /// neighbor tree, where it touches `ncorner` from the inside.
    pub fn apply(&self, q: &Quadrant, dim: Dim) -> Quadrant {
        let h = q.side(dim) as i64;
        let r = dim.root_len() as i64;
        let mut out = Quadrant::new(0, 0, 0, q.level);
        for axis in 0..dim.axes() {
            let c = q.coord(axis) as i64;
            // Outward distance past the shared corner along this axis.
            let delta = if self.corner & (1 << axis) != 0 {
                c - r
            } else {
                -c - h
            };
            let mapped = if self.ncorner & (1 << axis) != 0 {
                r - h - delta
            } else {
                delta
            };
            out.set_coord(axis, mapped as Coord);
        }
        out
    }

    /// Carry a quadrant lying inside the neighbor tree near `ncorner`
    /// back into the home tree's extended frame beyond `corner`.
    pub fn apply_inverse(&self, r: &Quadrant, dim: Dim) -> Quadrant {
        let h = r.side(dim) as i64;
        let root = dim.root_len() as i64;
        let mut out = Quadrant::new(0, 0, 0, r.level);
        for axis in 0..dim.axes() {
            let c = r.coord(axis) as i64;
            let delta = if self.ncorner & (1 << axis) != 0 {
                root - h - c
            } else {
                c
            };
            let home = if self.corner & (1 << axis) != 0 {
                root + delta
            } else {
                -delta - h
            };
            out.set_coord(axis, home as Coord);
        }
        out
    }
}

/// Neighbor across a tree edge (3D only).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EdgeTransform {
    pub ntree: TopIdx,
    pub edge: u8,
    pub nedge: u8,
    /// 0 keeps the along-edge direction, 1 reverses it.
    pub orientation: u8,
}

impl EdgeTransform {
    /// Carry a quadrant sitting beyond `edge` of its tree into the
    /// neighbor tree, where it touches `nedge` from the inside.
    pub fn apply(&self, q: &Quadrant, dim: Dim) -> Quadrant {
        debug_assert!(dim == Dim::Three);
        let h = q.side(dim) as i64;
        let r = dim.root_len() as i64;
        let axis = self.edge as usize / 4;
        let bits = self.edge as usize % 4;
        let naxis = self.nedge as usize / 4;
        let nbits = self.nedge as usize % 4;
        let (t0, t1) = transverse_axes(axis);
        let (n0, n1) = transverse_axes(naxis);

        let mut out = Quadrant::new(0, 0, 0, q.level);
        let along = q.coord(axis) as i64;
        out.set_coord(
            naxis,
            if self.orientation == 0 {
                along
            } else {
                r - h - along
            } as Coord,
        );
        for (k, (src, dst)) in [(t0, n0), (t1, n1)].iter().enumerate() {
            let c = q.coord(*src) as i64;
            let delta = if bits & (1 << k) != 0 { c - r } else { -c - h };
            let mapped = if nbits & (1 << k) != 0 {
                r - h - delta
            } else {
                delta
            };
            out.set_coord(*dst, mapped as Coord);
        }
        out
    }

    /// Carry a quadrant lying inside the neighbor tree near `nedge` back
    /// into the home tree's extended frame beyond `edge`.
    pub fn apply_inverse(&self, q: &Quadrant, dim: Dim) -> Quadrant {
        debug_assert!(dim == Dim::Three);
        let h = q.side(dim) as i64;
        let r = dim.root_len() as i64;
        let axis = self.edge as usize / 4;
        let bits = self.edge as usize % 4;
        let naxis = self.nedge as usize / 4;
        let nbits = self.nedge as usize % 4;
        let (t0, t1) = transverse_axes(axis);
        let (n0, n1) = transverse_axes(naxis);

        let mut out = Quadrant::new(0, 0, 0, q.level);
        let along = q.coord(naxis) as i64;
        out.set_coord(
            axis,
            if self.orientation == 0 {
                along
            } else {
                r - h - along
            } as Coord,
        );
        for (k, (src, dst)) in [(n0, t0), (n1, t1)].iter().enumerate() {
            let c = q.coord(*src) as i64;
            let delta = if nbits & (1 << k) != 0 { r - h - c } else { c };
            let home = if bits & (1 << k) != 0 { r + delta } else { -delta - h };
            out.set_coord(*dst, home as Coord);
        }
        out
    }
}

/// The coarse topology: a fixed graph of trees glued along faces, edges
/// and corners.
#[derive(Clone, Debug)]
pub struct Connectivity {
    dim: Dim,
    num_trees: TopIdx,
    /// Neighbor tree per (tree, face); the tree itself on the boundary.
    tree_to_tree: Vec<TopIdx>,
    /// `nface + num_faces * orientation` per (tree, face); the face
    /// itself with orientation zero on the boundary.
    tree_to_face: Vec<u8>,
    /// Diagonal neighbors per (tree, corner).
    corner_links: Vec<Vec<CornerTransform>>,
    /// Neighbors per (tree, edge), 3D only.
    edge_links: Vec<Vec<EdgeTransform>>,
}

impl Connectivity {
    /// A single unit square with all boundary faces.
    pub fn unit_square() -> Connectivity {
        Connectivity::single_tree(Dim::Two)
    }

    /// A single unit cube with all boundary faces.
    pub fn unit_cube() -> Connectivity {
        Connectivity::single_tree(Dim::Three)
    }

    fn single_tree(dim: Dim) -> Connectivity {
        let faces = dim.num_faces();
        Connectivity {
            dim,
            num_trees: 1,
            tree_to_tree: vec![0; faces],
            tree_to_face: (0..faces as u8).collect(),
            corner_links: vec![Vec::new(); dim.num_corners()],
            edge_links: vec![Vec::new(); dim.num_edges()],
        }
    }

    /// Two trees sharing the +x face of tree 0 and the -x face of tree 1.
    pub fn two_trees(dim: Dim) -> Connectivity {
        let faces = dim.num_faces();
        let mut conn = Connectivity {
            dim,
            num_trees: 2,
            tree_to_tree: Vec::with_capacity(2 * faces),
            tree_to_face: Vec::with_capacity(2 * faces),
            corner_links: vec![Vec::new(); 2 * dim.num_corners()],
            edge_links: vec![Vec::new(); 2 * dim.num_edges()],
        };
        for t in 0..2 {
            for f in 0..faces {
                conn.tree_to_tree.push(t as TopIdx);
                conn.tree_to_face.push(f as u8);
            }
        }
        conn.join_faces(0, 1, 1, 0, 0);
        conn
    }

    /// An `nx` by `ny` grid of trees with face and corner links.
    pub fn brick2d(nx: TopIdx, ny: TopIdx) -> Connectivity {
        assert!(nx > 0 && ny > 0);
        let dim = Dim::Two;
        let faces = dim.num_faces();
        let num_trees = nx * ny;
        let mut conn = Connectivity {
            dim,
            num_trees,
            tree_to_tree: Vec::with_capacity((num_trees as usize) * faces),
            tree_to_face: Vec::with_capacity((num_trees as usize) * faces),
            corner_links: vec![Vec::new(); (num_trees as usize) * dim.num_corners()],
            edge_links: Vec::new(),
        };
        for t in 0..num_trees {
            for f in 0..faces {
                conn.tree_to_tree.push(t);
                conn.tree_to_face.push(f as u8);
            }
        }
        let tree = |i: TopIdx, j: TopIdx| j * nx + i;
        for j in 0..ny {
            for i in 0..nx {
                let t = tree(i, j);
                if i + 1 < nx {
                    conn.join_faces(t, tree(i + 1, j), 1, 0, 0);
                }
                if j + 1 < ny {
                    conn.join_faces(t, tree(i, j + 1), 3, 2, 0);
                }
                // Diagonal corner links, both diagonals.
                if i + 1 < nx && j + 1 < ny {
                    conn.join_corners(t, tree(i + 1, j + 1), 3, 0);
                }
                if i > 0 && j + 1 < ny {
                    conn.join_corners(t, tree(i - 1, j + 1), 2, 1);
                }
            }
        }
        conn
    }

    fn join_faces(&mut self, t0: TopIdx, t1: TopIdx, f0: usize, f1: usize, orientation: u8) {
        let faces = self.dim.num_faces();
        self.tree_to_tree[t0 as usize * faces + f0] = t1;
        self.tree_to_face[t0 as usize * faces + f0] = f1 as u8 + faces as u8 * orientation;
        self.tree_to_tree[t1 as usize * faces + f1] = t0;
        self.tree_to_face[t1 as usize * faces + f1] = f0 as u8 + faces as u8 * orientation;
    }

    fn join_corners(&mut self, t0: TopIdx, t1: TopIdx, c0: u8, c1: u8) {
        let corners = self.dim.num_corners();
        self.corner_links[t0 as usize * corners + c0 as usize].push(CornerTransform {
            ntree: t1,
            corner: c0,
            ncorner: c1,
        });
        self.corner_links[t1 as usize * corners + c1 as usize].push(CornerTransform {
            ntree: t0,
            corner: c1,
            ncorner: c0,
        });
    }

    /// Spatial dimension shared by all trees.
    pub fn dim(&self) -> Dim {
        self.dim
    }

    /// Number of trees in the topology.
    pub fn num_trees(&self) -> TopIdx {
        self.num_trees
    }

    /// The face transform across face `f` of `tree`, or None on the
    /// domain boundary.
    pub fn face_transform(&self, tree: TopIdx, face: usize) -> Option<FaceTransform> {
        let dim = self.dim;
        let faces = dim.num_faces();
        let idx = tree as usize * faces + face;
        let ntree = self.tree_to_tree[idx];
        let code = self.tree_to_face[idx] as usize;
        let (nface, orientation) = (code % faces, code / faces);
        if ntree == tree && nface == face {
            return None;
        }

        let r = dim.root_len() as i64;
        let axis = face / 2;
        let naxis = nface / 2;
        let mut perm = [0usize; 3];
        let mut sign = [1i32; 3];
        let mut offs = [0i64; 3];
        perm[2] = 2;

        // Normal axis: outward depth past `face` becomes inward depth
        // behind `nface`.
        perm[naxis] = axis;
        match (face & 1, nface & 1) {
            (1, 0) => {
                sign[naxis] = 1;
                offs[naxis] = -r;
            }
            (0, 1) => {
                sign[naxis] = 1;
                offs[naxis] = r;
            }
            (1, 1) => {
                sign[naxis] = -1;
                offs[naxis] = 2 * r;
            }
            _ => {
                sign[naxis] = -1;
                offs[naxis] = 0;
            }
        }

        // Tangential axes in ascending order, bitwise reversal per the
        // orientation code.
        match dim {
            Dim::Two => {
                let t = 1 - axis;
                let nt = 1 - naxis;
                perm[nt] = t;
                if orientation & 1 != 0 {
                    sign[nt] = -1;
                    offs[nt] = r;
                }
            }
            Dim::Three => {
                let (t0, t1) = transverse_axes(axis);
                let (n0, n1) = transverse_axes(naxis);
                for (k, (t, nt)) in [(t0, n0), (t1, n1)].iter().enumerate() {
                    perm[*nt] = *t;
                    if orientation & (1 << k) != 0 {
                        sign[*nt] = -1;
                        offs[*nt] = r;
                    }
                }
            }
        }

        Some(FaceTransform {
            ntree,
            nface: nface as u8,
            perm,
            sign,
            offs,
        })
    }

    /// Diagonal neighbors across corner `c` of `tree`.
    pub fn corner_transforms(&self, tree: TopIdx, corner: usize) -> &[CornerTransform] {
        &self.corner_links[tree as usize * self.dim.num_corners() + corner]
    }

    /// Neighbors across edge `e` of `tree` (3D).
    pub fn edge_transforms(&self, tree: TopIdx, edge: usize) -> &[EdgeTransform] {
        &self.edge_links[tree as usize * self.dim.num_edges() + edge]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_faces() {
        let conn = Connectivity::unit_square();
        for f in 0..4 {
            assert!(conn.face_transform(0, f).is_none());
        }
        let conn = Connectivity::unit_cube();
        for f in 0..6 {
            assert!(conn.face_transform(0, f).is_none());
        }
    }

    #[test]
    fn test_two_trees_face_transform() {
        let dim = Dim::Two;
        let conn = Connectivity::two_trees(dim);
        let ft = conn.face_transform(0, 1).unwrap();
        assert_eq!(ft.ntree, 1);
        assert_eq!(ft.nface, 0);

        // A quadrant one step beyond tree 0's +x face lands at tree 1's
        // -x face with the tangential coordinate preserved.
        let h = Quadrant::len(2, dim);
        let r = dim.root_len();
        let q = Quadrant::new(r, 3 * h, 0, 2);
        let t = ft.apply(&q, dim);
        assert_eq!(t, Quadrant::new(0, 3 * h, 0, 2));
        assert!(t.is_inside_root(dim));
    }

    #[test]
    fn test_face_transform_roundtrip() {
        for &dim in &[Dim::Two, Dim::Three] {
            let conn = Connectivity::two_trees(dim);
            let ft = conn.face_transform(0, 1).unwrap();
            let back = ft.invert(0, 1);
            let h = Quadrant::len(3, dim);
            let r = dim.root_len();
            let mut q = Quadrant::new(r, 2 * h, 0, 3);
            if dim == Dim::Three {
                q.z = 5 * h;
            }
            assert_eq!(back.apply(&ft.apply(&q, dim), dim), q);
        }
    }

    #[test]
    fn test_both_sides_agree() {
        let dim = Dim::Two;
        let conn = Connectivity::two_trees(dim);
        let fwd = conn.face_transform(0, 1).unwrap();
        let rev = conn.face_transform(1, 0).unwrap();
        // A cell in tree 1's extended frame is the image of a tree 0
        // interior cell under the opposite transform.
        let h = Quadrant::len(1, dim);
        let inside1 = Quadrant::new(-h, 0, 0, 1);
        let mapped = rev.apply(&inside1, dim);
        assert_eq!(fwd.apply(&mapped, dim), inside1);
    }

    #[test]
    fn test_brick_corner_transform() {
        let dim = Dim::Two;
        let conn = Connectivity::brick2d(2, 2);
        let links = conn.corner_transforms(0, 3);
        assert_eq!(links.len(), 1);
        let ct = links[0];
        assert_eq!(ct.ntree, 3);
        assert_eq!(ct.ncorner, 0);

        // The insulation cell diagonally past tree 0's top-right corner is
        // tree 3's origin cell.
        let r = dim.root_len();
        let q = Quadrant::new(r, r, 0, 4);
        assert_eq!(ct.apply(&q, dim), Quadrant::new(0, 0, 0, 4));
        assert_eq!(ct.apply_inverse(&ct.apply(&q, dim), dim), q);

        let deeper = Quadrant::new(r + Quadrant::len(5, dim), r, 0, 5);
        assert_eq!(ct.apply_inverse(&ct.apply(&deeper, dim), dim), deeper);
    }

    #[test]
    fn test_edge_transform_apply() {
        let dim = Dim::Three;
        // An artificial link: edge 11 (along z, high x, high y) meets edge
        // 8 (along z, low x, low y) with the direction preserved.
        let et = EdgeTransform {
            ntree: 1,
            edge: 11,
            nedge: 8,
            orientation: 0,
        };
        let r = dim.root_len();
        let h = Quadrant::len(2, dim);
        let q = Quadrant::new(r, r, 2 * h, 2);
        assert_eq!(et.apply(&q, dim), Quadrant::new(0, 0, 2 * h, 2));

        let flipped = EdgeTransform { orientation: 1, ..et };
        assert_eq!(flipped.apply(&q, dim), Quadrant::new(0, 0, r - 3 * h, 2));

        for t in [et, flipped] {
            assert_eq!(t.apply_inverse(&t.apply(&q, dim), dim), q);
        }
    }
}
