//! # sc-explore: exploratory single-cell RNA-seq analysis
//!
//! Quality control, normalization, feature selection, dimensionality
//! reduction, graph clustering, marker detection and reference-based
//! annotation of a droplet count matrix, run as one seeded pipeline.

/// Reference-based cell type annotation
pub mod annotation;

/// Graph clustering of cells
pub mod clustering;

/// Pipeline configuration
pub mod config;

/// Dimensionality reduction methods
pub mod dim_red;

/// Highly variable gene selection
pub mod hvg;

/// Nearest-neighbor graphs
pub mod nn;

/// Count matrix normalization methods
pub mod normalization;

/// Stage orchestration
pub mod pipeline;

/// Per-cell quality control
pub mod qc;

/// Tables and the run summary
pub mod report;

pub mod stats;

pub use config::PipelineConfig;
pub use pipeline::{Acquired, AnalysisOutputs, Pipeline};
