//! Core data types: quadrants, tree connectivity and the forest.

pub mod connectivity;
pub mod forest;
pub mod quadrant;
