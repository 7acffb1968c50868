//! Collective tests for `quadforest`, run under mpirun with any number
//! of ranks:
//!
//! ```text
//! mpirun -n 4 cargo run --release -p parallel-tests
//! ```

use mpi::topology::SystemCommunicator;
use mpi::traits::*;

use quadforest::partition::partition_given;
use quadforest::types::forest::Forest;
use quadforest::types::quadrant::{Dim, LocIdx, Quadrant, TopIdx};
use quadforest::Connectivity;

/// Payload initializer: remember the tree and level of each quadrant.
fn stamp(bytes: &mut [u8], tree: TopIdx, q: &Quadrant) {
    bytes[0] = tree as u8;
    bytes[1] = q.level;
}

fn uniform_forest(world: &SystemCommunicator, level: u8) -> Forest {
    Forest::new(
        world,
        Connectivity::two_trees(Dim::Two),
        level,
        8,
        Some(stamp),
    )
}

/// The per-process counts of the even split used by forest construction.
fn even_counts(total: i64, size: usize) -> Vec<LocIdx> {
    (0..size)
        .map(|p| {
            ((p as i64 + 1) * total / size as i64 - p as i64 * total / size as i64) as LocIdx
        })
        .collect()
}

/// Concentrating every quadrant on rank zero empties the others and
/// preserves the checksum.
fn test_partition_to_rank_zero(world: &SystemCommunicator) {
    let mut forest = uniform_forest(world, 2);
    let before = forest.checksum_global(world);
    let total = forest.global_num_quadrants;

    let mut counts = vec![0 as LocIdx; world.size() as usize];
    counts[0] = total as LocIdx;
    partition_given(&mut forest, world, &counts);

    assert!(forest.is_valid(world));
    assert_eq!(forest.checksum_global(world), before);
    if world.rank() == 0 {
        assert_eq!(forest.local_num_quadrants as i64, total);
    } else {
        assert_eq!(forest.local_num_quadrants, 0);
        assert_eq!(forest.first_local_tree, -1);
        assert_eq!(forest.last_local_tree, -2);
    }
}

/// Shuffling everything to the last rank and back to the even split is a
/// round trip: checksum invariant, payloads traveling with quadrants.
fn test_partition_cycle(world: &SystemCommunicator) {
    let mut forest = uniform_forest(world, 2);
    let before = forest.checksum_global(world);
    let total = forest.global_num_quadrants;
    let size = world.size() as usize;

    let mut counts = vec![0 as LocIdx; size];
    counts[size - 1] = total as LocIdx;
    partition_given(&mut forest, world, &counts);
    assert!(forest.is_valid(world));
    assert_eq!(forest.checksum_global(world), before);

    partition_given(&mut forest, world, &even_counts(total, size));
    assert!(forest.is_valid(world));
    assert_eq!(forest.checksum_global(world), before);

    for (t, tree) in forest.trees.iter().enumerate() {
        for q in tree.quadrants.iter() {
            assert_eq!(forest.user_pool.bytes(q.data)[0], t as u8);
            assert_eq!(forest.user_pool.bytes(q.data)[1], q.level);
        }
    }
}

/// The forest checksum does not depend on the number of ranks holding it.
fn test_checksum_across_process_counts(world: &SystemCommunicator) {
    let forest = uniform_forest(world, 3);
    let global = forest.checksum_global(world);

    let serial = Forest::new_serial(Connectivity::two_trees(Dim::Two), 3, 8, Some(stamp));
    let (serial_crc, _) = serial.checksum_local();
    assert_eq!(global, serial_crc);
}

/// A single corrupted rank fails validation on every rank.
fn test_validity_is_collective(world: &SystemCommunicator) {
    let mut forest = uniform_forest(world, 1);
    assert!(forest.is_valid(world));

    if world.rank() == world.size() - 1 {
        forest.global_first_quadrant[0] = 1;
    }
    assert!(!forest.is_valid(world));
}

fn main() {
    env_logger::init();
    let universe = mpi::initialize().unwrap();
    let world = universe.world();

    test_partition_to_rank_zero(&world);
    test_partition_cycle(&world);
    test_checksum_across_process_counts(&world);
    test_validity_is_collective(&world);

    if world.rank() == 0 {
        println!("parallel-tests passed on {} ranks", world.size());
    }
}
