#![deny(warnings)]

pub mod curve_fit;
pub mod fuzzy;
pub mod knn;
pub mod optimize;
pub mod umap;

pub use umap::Umap;

pub type Q = f64;
