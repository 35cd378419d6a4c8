//! Community detection on weighted undirected graphs
#![deny(missing_docs)]

/// Data structure for storing a clustering of nodes
pub mod clustering;

/// Data structure for storing a weighted, undirected graph (aka network)
pub mod network;

/// Flow-based clustering by minimizing the two-level map equation
pub mod infomap;

/// Louvain modularity optimization
pub mod louvain;

/// Clustering objective functions
pub mod objective;

/// Agglomerative clustering on random-walk distances
pub mod walktrap;

mod local_moving;


pub use clustering::{Clustering, SimpleClustering};
pub use infomap::Infomap;
pub use louvain::Louvain;
pub use network::Network;
pub use objective::modularity;
pub use walktrap::Walktrap;

trait ZeroVec {
    fn zero_len(&mut self, len: usize);
}

impl<T: Default> ZeroVec for Vec<T> {
    fn zero_len(&mut self, len: usize) {
        self.clear();
        self.resize_with(len, T::default)
    }
}
