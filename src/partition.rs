//! Partition-given redistribution: rearrange quadrants across processes
//! so each ends up with a caller-specified count, preserving the global
//! Morton order and the per-quadrant payloads.

use log::debug;
use mpi::traits::*;

use crate::constants::TAG_PARTITION_GIVEN;
use crate::tree::Tree;
use crate::types::forest::{Forest, Position};
use crate::types::quadrant::{Coord, GlobIdx, LocIdx, Quadrant, TopIdx};

/// Bytes of one quadrant on the wire: `x`, `y`, `z`, `level` as four
/// native 32-bit words, no padding.
const QUAD_BYTES: usize = 16;

/// One contiguous piece of this rank's old range destined for a peer, as
/// local offsets into the flattened quadrant sequence.
#[derive(Debug, PartialEq, Eq)]
struct Piece {
    peer: usize,
    begin: usize,
    count: usize,
}

/// Intersect `[start, end)` with every interval of `prefix` and keep the
/// nonempty pieces, offset relative to `start`.
fn intersect_ranges(start: GlobIdx, end: GlobIdx, prefix: &[GlobIdx]) -> Vec<Piece> {
    let mut pieces = Vec::new();
    for peer in 0..prefix.len() - 1 {
        let s = start.max(prefix[peer]);
        let e = end.min(prefix[peer + 1]);
        if e > s {
            pieces.push(Piece {
                peer,
                begin: (s - start) as usize,
                count: (e - s) as usize,
            });
        }
    }
    pieces
}

/// Trees spanned by process `peer`'s old range, per the replicated
/// position markers: first tree and slot count.
fn tree_span(positions: &[Position], peer: usize) -> (TopIdx, usize) {
    let first = positions[peer].which_tree;
    let last = positions[peer + 1].which_tree;
    (first, (last - first + 1) as usize)
}

fn push_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

fn read_i32(buf: &[u8], at: &mut usize) -> i32 {
    let v = i32::from_ne_bytes(buf[*at..*at + 4].try_into().unwrap());
    *at += 4;
    v
}

/// Pack one piece: per-tree counts over the sender's tree span, then the
/// quadrant records, then the payloads as a tight `data_size` stride.
fn pack_piece(
    slice: &[(TopIdx, Quadrant)],
    first_tree: TopIdx,
    num_trees: usize,
    payload_of: impl Fn(i64) -> Option<Vec<u8>>,
    data_size: usize,
) -> Vec<u8> {
    let mut counts = vec![0 as LocIdx; num_trees];
    for (t, _) in slice {
        counts[(t - first_tree) as usize] += 1;
    }
    let mut buf = Vec::with_capacity(num_trees * 4 + slice.len() * (QUAD_BYTES + data_size));
    for c in &counts {
        push_i32(&mut buf, *c);
    }
    for (_, q) in slice {
        push_i32(&mut buf, q.x);
        push_i32(&mut buf, q.y);
        push_i32(&mut buf, q.z);
        push_i32(&mut buf, q.level as i32);
    }
    for (_, q) in slice {
        if data_size > 0 {
            match payload_of(q.data) {
                Some(bytes) => buf.extend_from_slice(&bytes),
                None => buf.extend(std::iter::repeat(0).take(data_size)),
            }
        }
    }
    buf
}

/// Inverse of `pack_piece`; payload bytes are returned per quadrant.
fn unpack_piece(
    buf: &[u8],
    first_tree: TopIdx,
    num_trees: usize,
    data_size: usize,
) -> Vec<(TopIdx, Quadrant, Vec<u8>)> {
    let mut at = 0;
    let counts: Vec<LocIdx> = (0..num_trees).map(|_| read_i32(buf, &mut at)).collect();
    let total: usize = counts.iter().map(|&c| c as usize).sum();

    let mut out = Vec::with_capacity(total);
    for (slot, &c) in counts.iter().enumerate() {
        for _ in 0..c {
            let x = read_i32(buf, &mut at) as Coord;
            let y = read_i32(buf, &mut at) as Coord;
            let z = read_i32(buf, &mut at) as Coord;
            let level = read_i32(buf, &mut at) as u8;
            out.push((
                first_tree + slot as TopIdx,
                Quadrant::new(x, y, z, level),
                Vec::new(),
            ));
        }
    }
    if data_size > 0 {
        for entry in out.iter_mut() {
            entry.2 = buf[at..at + data_size].to_vec();
            at += data_size;
        }
    }
    debug_assert_eq!(at, buf.len());
    out
}

/// Redistribute the forest so process `i` owns exactly `new_counts[i]`
/// quadrants in global Morton order. Payloads travel with their
/// quadrants; the replicated partition vectors are refreshed. Returns
/// the global number of quadrants that changed ranks.
pub fn partition_given<C: Communicator + CommunicatorCollectives>(
    forest: &mut Forest,
    comm: &C,
    new_counts: &[LocIdx],
) -> GlobIdx {
    let dim = forest.dim();
    let num_procs = forest.mpisize as usize;
    let rank = forest.mpirank as usize;
    assert_eq!(new_counts.len(), num_procs);

    let old_prefix = forest.global_first_quadrant.clone();
    let mut new_prefix = vec![0 as GlobIdx; num_procs + 1];
    for (i, &c) in new_counts.iter().enumerate() {
        assert!(c >= 0);
        new_prefix[i + 1] = new_prefix[i] + c as GlobIdx;
    }
    assert_eq!(
        new_prefix[num_procs], forest.global_num_quadrants,
        "new counts must preserve the global total"
    );

    let shipped: GlobIdx = forest.global_num_quadrants
        - (0..num_procs)
            .map(|j| {
                let s = old_prefix[j].max(new_prefix[j]);
                let e = old_prefix[j + 1].min(new_prefix[j + 1]);
                (e - s).max(0)
            })
            .sum::<GlobIdx>();
    if shipped == 0 {
        return 0;
    }
    debug!(
        "partition_given: shipping {} of {} quadrants",
        shipped, forest.global_num_quadrants
    );

    let old_positions = forest.global_first_position.clone();
    let flat: Vec<(TopIdx, Quadrant)> = forest
        .trees
        .iter()
        .enumerate()
        .flat_map(|(t, tree)| tree.quadrants.iter().map(move |q| (t as TopIdx, *q)))
        .collect();

    let my_old = (old_prefix[rank], old_prefix[rank + 1]);
    let my_new = (new_prefix[rank], new_prefix[rank + 1]);
    let sends = intersect_ranges(my_old.0, my_old.1, &new_prefix);
    let recvs = intersect_ranges(my_new.0, my_new.1, &old_prefix);

    // Pack every outgoing piece before anything is torn down.
    let (my_first_tree, my_num_trees) = tree_span(&old_positions, rank);
    let mut send_bufs: Vec<Option<Vec<u8>>> = (0..num_procs).map(|_| None).collect();
    for piece in sends.iter().filter(|s| s.peer != rank) {
        let slice = &flat[piece.begin..piece.begin + piece.count];
        let buf = pack_piece(
            slice,
            my_first_tree,
            my_num_trees,
            |data| {
                (data >= 0).then(|| forest.user_pool.bytes(data).to_vec())
            },
            forest.data_size,
        );
        send_bufs[piece.peer] = Some(buf);
    }

    // Receive buffers have a size known from the replicated state alone.
    let mut recv_bufs: Vec<Option<Vec<u8>>> = (0..num_procs).map(|_| None).collect();
    for piece in recvs.iter().filter(|r| r.peer != rank) {
        let (_, ntrees) = tree_span(&old_positions, piece.peer);
        let size = ntrees * 4 + piece.count * (QUAD_BYTES + forest.data_size);
        recv_bufs[piece.peer] = Some(vec![0u8; size]);
    }

    mpi::request::scope(|scope| {
        let mut recv_reqs = Vec::new();
        for (peer, buf) in recv_bufs.iter_mut().enumerate() {
            if let Some(buf) = buf {
                recv_reqs.push(
                    comm.process_at_rank(peer as i32).immediate_receive_into_with_tag(
                        scope,
                        &mut buf[..],
                        TAG_PARTITION_GIVEN,
                    ),
                );
            }
        }
        let mut send_reqs = Vec::new();
        for (peer, buf) in send_bufs.iter().enumerate() {
            if let Some(buf) = buf {
                send_reqs.push(comm.process_at_rank(peer as i32).immediate_send_with_tag(
                    scope,
                    &buf[..],
                    TAG_PARTITION_GIVEN,
                ));
            }
        }
        for req in recv_reqs {
            req.wait_without_status();
        }
        for req in send_reqs {
            req.wait_without_status();
        }
    });

    // Free payloads of everything this rank no longer owns.
    for (i, (_, q)) in flat.iter().enumerate() {
        let g = my_old.0 + i as GlobIdx;
        if g < my_new.0 || g >= my_new.1 {
            forest.user_pool.release(q.data);
        }
    }

    // Assemble the new local sequence in peer order, which is global
    // Morton order.
    let num_trees = forest.connectivity.num_trees();
    let mut new_trees: Vec<Tree> = (0..num_trees).map(|_| Tree::new()).collect();
    for piece in &recvs {
        if piece.peer == rank {
            let keep_from = (my_new.0 + piece.begin as GlobIdx - my_old.0) as usize;
            for (t, q) in &flat[keep_from..keep_from + piece.count] {
                new_trees[*t as usize].push(*q);
            }
        } else {
            let (first_tree, ntrees) = tree_span(&old_positions, piece.peer);
            let buf = recv_bufs[piece.peer].as_ref().unwrap();
            for (t, mut q, payload) in unpack_piece(buf, first_tree, ntrees, forest.data_size) {
                q.data = forest.user_pool.allocate();
                if q.data >= 0 {
                    forest.user_pool.bytes_mut(q.data).copy_from_slice(&payload);
                }
                new_trees[t as usize].push(q);
            }
        }
    }

    forest.trees = new_trees;
    forest.refresh_local_meta();
    debug_assert_eq!(
        forest.local_num_quadrants as GlobIdx,
        my_new.1 - my_new.0
    );
    forest.global_first_quadrant = new_prefix;

    // Refresh the first-position markers; empty ranks inherit their
    // successor's position.
    let my_pos = if forest.local_num_quadrants > 0 {
        let first = &forest.trees[forest.first_local_tree as usize];
        Position::new(forest.first_local_tree, &first.first_desc)
    } else {
        Position {
            which_tree: -1,
            x: 0,
            y: 0,
            z: 0,
        }
    };
    let mut gathered = vec![Position::default(); num_procs];
    comm.all_gather_into(&my_pos, &mut gathered[..]);
    let mut positions = gathered;
    positions.push(Position::sentinel(num_trees));
    for j in (0..num_procs).rev() {
        if positions[j].which_tree < 0 {
            positions[j] = positions[j + 1];
        }
    }
    forest.global_first_position = positions;

    shipped
}

/// Decide which side of the process boundary `partition[rank]` a family
/// of adjacent quadrants starting at `family_start` belongs on: the side
/// owning strictly more of it, ties to the lower rank. Returns the
/// corrected boundary.
pub fn partition_correction(
    partition: &[GlobIdx],
    rank: usize,
    family_start: GlobIdx,
    family_size: usize,
) -> GlobIdx {
    let boundary = partition[rank];
    debug_assert!(
        family_start <= boundary && boundary < family_start + family_size as GlobIdx,
        "boundary must fall inside the family"
    );
    let below = (boundary - family_start) as usize;
    let above = family_size - below;
    if above > below {
        family_start
    } else {
        family_start + family_size as GlobIdx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::types::quadrant::Dim;

    #[test]
    fn test_intersect_ranges() {
        // Four peers owning 4 quadrants each.
        let prefix = vec![0, 4, 8, 12, 16];
        let pieces = intersect_ranges(2, 11, &prefix);
        assert_eq!(
            pieces,
            vec![
                Piece { peer: 0, begin: 0, count: 2 },
                Piece { peer: 1, begin: 2, count: 4 },
                Piece { peer: 2, begin: 6, count: 3 },
            ]
        );
        assert!(intersect_ranges(5, 5, &prefix).is_empty());
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let dim = Dim::Two;
        let data_size = 6;
        let quads: Vec<(TopIdx, Quadrant)> = Quadrant::root()
            .children(dim)
            .into_iter()
            .enumerate()
            .map(|(i, mut q)| {
                q.data = i as i64;
                (1 + (i / 2) as TopIdx, q)
            })
            .collect();
        let buf = pack_piece(
            &quads,
            1,
            3,
            |data| Some(vec![data as u8; data_size]),
            data_size,
        );
        assert_eq!(buf.len(), 3 * 4 + 4 * (QUAD_BYTES + data_size));

        let out = unpack_piece(&buf, 1, 3, data_size);
        assert_eq!(out.len(), 4);
        for (i, (t, q, payload)) in out.iter().enumerate() {
            assert_eq!(*t, quads[i].0);
            assert_eq!(*q, quads[i].1);
            assert_eq!(payload, &vec![i as u8; data_size]);
        }
    }

    #[test]
    fn test_pack_empty_tree_slots() {
        let dim = Dim::Two;
        let q = Quadrant::root().child(3, dim);
        let buf = pack_piece(&[(2, q)], 0, 4, |_| None, 0);
        let out = unpack_piece(&buf, 0, 4, 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, 2);
        assert_eq!(out[0].1, q);
    }

    #[test]
    fn test_partition_correction() {
        let d2 = 4;
        // Family [8, 12); boundary at 9: one below, three above.
        assert_eq!(partition_correction(&[0, 9, 16], 1, 8, d2), 8);
        // Boundary at 11: three below, one above.
        assert_eq!(partition_correction(&[0, 11, 16], 1, 8, d2), 12);
        // Tie goes to the lower rank.
        assert_eq!(partition_correction(&[0, 10, 16], 1, 8, d2), 12);
    }
}
