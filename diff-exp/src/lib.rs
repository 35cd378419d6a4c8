//! Differential expression between clusters for marker gene detection.

/// p-value distributions and multiple testing correction
pub mod dist;

/// Marker tables and consensus ranking
pub mod markers;

/// Pairwise cluster comparisons
pub mod pairwise;

pub use crate::markers::{
    combine_all, find_markers, marker_tables, multi_marker_stats, ConsensusTable, MarkerRow, MarkerTable,
};
pub use crate::pairwise::{pairwise_tests, MarkerTest, PairwiseResult};
