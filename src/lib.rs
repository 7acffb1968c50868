//! Data structures and functions for parallel forests of quadtrees and
//! octrees: Morton-ordered quadrant algebra, subtree completion, local
//! 2:1 balance, cross-tree overlap and partition-given redistribution
//! over MPI.

pub mod balance;
pub mod checksum;
pub mod constants;
pub mod overlap;
pub mod partition;
pub mod tree;
pub mod types;

pub use balance::{balance_border, balance_subtree, Balance};
pub use partition::{partition_correction, partition_given};
pub use tree::{complete_region, Tree};
pub use types::connectivity::Connectivity;
pub use types::forest::Forest;
pub use types::quadrant::{Dim, Quadrant};
