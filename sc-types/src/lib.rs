//! Shared data types for single-cell analysis: the count matrix and its gene
//! annotation, per-cell metadata, reduced representations and cluster partitions.

/// Per-cell metadata table
pub mod cells;

/// The session record tying counts and attachments together
pub mod experiment;

/// Sparse count matrices and gene tables
pub mod matrix;

/// Cluster partitions
pub mod partition;

/// PCA and visual embeddings
pub mod reduced;

/// Labelled expression reference for annotation
pub mod reference;

pub use cells::CellTable;
pub use experiment::Experiment;
pub use matrix::{CountMatrix, Counts, GeneTable, LogCounts};
pub use partition::Partition;
pub use reduced::{EmbeddingKind, Pca, VisualEmbedding};
pub use reference::ReferenceAtlas;
