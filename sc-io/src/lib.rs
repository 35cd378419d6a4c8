//! Getting data in and out: dataset download, quantification import, gene
//! symbol mapping, reference atlases and tabular output.

/// Dataset and reference download
pub mod fetch;

/// 10x and alevin quantification directories
pub mod layout;

pub mod mtx;

/// Reference atlas loading
pub mod reference;

/// Gene identifier to symbol mapping
pub mod symbols;

pub mod write;

pub use layout::{read_quant_dir, QuantLayout, RawQuant};
pub use symbols::{annotate, GeneSymbolMap};
