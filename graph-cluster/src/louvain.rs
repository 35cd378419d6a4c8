use crate::local_moving::LocalMoving;
use crate::{Clustering, Network, SimpleClustering};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// Default resolution for Louvain
pub const DEFAULT_RESOLUTION: f64 = 1.0;

/// Louvain modularity optimization: local moving followed by aggregation,
/// repeated on the aggregate network until nothing moves.
pub struct Louvain {
    rng: ChaCha20Rng,
    local_moving: LocalMoving,
}

impl Louvain {
    /// Initialize with the given resolution. A seed of 0 is used when none is supplied.
    pub fn new(resolution: f64, seed: Option<u64>) -> Louvain {
        Louvain {
            rng: ChaCha20Rng::seed_from_u64(seed.unwrap_or_default()),
            local_moving: LocalMoving::new(resolution),
        }
    }

    /// Iterate the Louvain algorithm one step. Returns true if cluster labels were updated.
    pub fn iterate<C: Clustering>(&mut self, n: &Network, c: &mut C) -> bool {
        let mut update = self.local_moving.iterate(n, c, &mut self.rng);

        if c.n_clusters() == n.nodes() {
            return update;
        }

        let reduced_n = n.create_reduced_network(c);
        let mut reduced_clusters = C::singletons(reduced_n.nodes());
        update |= self.iterate(&reduced_n, &mut reduced_clusters);
        c.collapse(&reduced_clusters);

        update
    }

    /// Run to convergence from singleton clusters
    pub fn run(&mut self, n: &Network) -> SimpleClustering {
        let mut c = SimpleClustering::singletons(n.nodes());
        // each iteration can only increase modularity, so this terminates
        for _ in 0..100 {
            if !self.iterate(n, &mut c) {
                break;
            }
        }
        c
    }
}
