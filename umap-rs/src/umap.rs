use crate::curve_fit::find_ab_params;
use crate::optimize::State;
use crate::{fuzzy, knn, Q};
use anyhow::{bail, Error};
use log::info;
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

/// UMAP parameters. `Umap::default()` matches the settings used for
/// single-cell visualisation: 15 neighbors, `min_dist` 0.01, `spread` 1.
#[derive(Clone, Debug)]
pub struct Umap {
    pub n_neighbors: usize,
    pub dimensions: usize,
    pub min_dist: Q,
    pub spread: Q,
    pub learning_rate: Q,
    pub local_connectivity: Q,
    pub negative_sample_rate: usize,
    pub repulsion_strength: Q,
    pub set_op_mix_ratio: Q,
    /// Fixed number of epochs; by default 500 up to 10,000 points and 200 above
    pub n_epochs: Option<usize>,
}

impl Default for Umap {
    fn default() -> Self {
        Umap {
            n_neighbors: 15,
            dimensions: 2,
            min_dist: 0.01,
            spread: 1.0,
            learning_rate: 1.0,
            local_connectivity: 1.0,
            negative_sample_rate: 5,
            repulsion_strength: 1.0,
            set_op_mix_ratio: 1.0,
            n_epochs: None,
        }
    }
}

impl Umap {
    pub fn new(dimensions: usize, min_dist: Q, spread: Q, n_neighbors: usize, n_epochs: Option<usize>) -> Umap {
        Umap {
            n_neighbors,
            dimensions,
            min_dist,
            spread,
            n_epochs,
            ..Umap::default()
        }
    }

    pub(crate) fn get_num_epochs(&self, rows: usize) -> usize {
        if let Some(n) = self.n_epochs {
            return n;
        }
        if rows <= 10_000 {
            500
        } else {
            200
        }
    }

    /// Build the graph and optimizer state for rows of `x`, without running any epochs.
    pub fn initialize_fit(&self, x: &Array2<Q>, seed: u64) -> Result<State, Error> {
        if self.n_epochs == Some(0) {
            bail!("number of epochs, if provided, must be greater than 0");
        }
        if self.dimensions == 0 {
            bail!("embedding needs at least one dimension");
        }
        let n = x.nrows();
        if n < 2 {
            bail!("UMAP needs at least 2 points, got {}", n);
        }
        let k = if self.n_neighbors >= n {
            info!("{} neighbors requested, but only {} available", self.n_neighbors, n - 1);
            n - 1
        } else {
            self.n_neighbors
        };

        let n_epochs = self.get_num_epochs(n);
        let (indices, distances) = knn::nearest_neighbors(x, k)?;
        let graph = fuzzy::fuzzy_simplicial_set(&indices, &distances, self.local_connectivity, self.set_op_mix_ratio);
        let ab = find_ab_params(self.spread, self.min_dist);

        let mut random = Pcg64Mcg::seed_from_u64(seed);
        let embedding = Array2::from_shape_simple_fn((n, self.dimensions), || random.gen_range(-10.0..10.0));

        let state = State::new(
            embedding,
            &graph,
            n_epochs,
            ab,
            self.learning_rate,
            self.repulsion_strength,
            self.negative_sample_rate,
            random,
        );
        info!(
            "UMAP on {} points: {} neighbors, {} edges, {} epochs, a = {:.4}, b = {:.4}",
            n,
            k,
            state.num_samples(),
            n_epochs,
            ab.0,
            ab.1
        );
        Ok(state)
    }

    /// Embed the rows of `x`. The result is fully determined by `seed`.
    pub fn fit(&self, x: &Array2<Q>, seed: u64) -> Result<Array2<Q>, Error> {
        let mut state = self.initialize_fit(x, seed)?;
        state.optimize();
        Ok(state.into_embedding())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand_distr::{Distribution, Normal};

    /// two well separated Gaussian blobs in 5 dimensions
    fn blobs(n: usize) -> Array2<Q> {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let noise = Normal::new(0.0, 1.0).unwrap();
        Array2::from_shape_fn((2 * n, 5), |(i, _)| {
            let center = if i < n { 0.0 } else { 20.0 };
            center + noise.sample(&mut rng)
        })
    }

    fn centroid(e: &Array2<Q>, rows: std::ops::Range<usize>) -> (Q, Q) {
        let m = rows.len() as Q;
        let (mut x, mut y) = (0.0, 0.0);
        for i in rows {
            x += e[[i, 0]];
            y += e[[i, 1]];
        }
        (x / m, y / m)
    }

    #[test]
    fn test_separates_blobs() -> Result<(), Error> {
        let data = blobs(40);
        let umap = Umap::new(2, 0.1, 1.0, 10, Some(200));
        let e = umap.fit(&data, 0)?;
        assert_eq!(e.dim(), (80, 2));
        assert!(e.iter().all(|v| v.is_finite()));

        let (ax, ay) = centroid(&e, 0..40);
        let (bx, by) = centroid(&e, 40..80);
        let between = ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt();
        let within = (0..40)
            .map(|i| ((e[[i, 0]] - ax).powi(2) + (e[[i, 1]] - ay).powi(2)).sqrt())
            .sum::<Q>()
            / 40.0;
        assert!(between > 2.0 * within, "between {between}, within {within}");
        Ok(())
    }

    #[test]
    fn test_deterministic() -> Result<(), Error> {
        let data = blobs(15);
        let umap = Umap::new(2, 0.01, 1.0, 5, Some(50));
        assert_eq!(umap.fit(&data, 7)?, umap.fit(&data, 7)?);
        Ok(())
    }

    #[test]
    fn test_bad_input() {
        let data = Array2::zeros((1, 3));
        assert!(Umap::default().fit(&data, 0).is_err());
        let data = Array2::zeros((5, 3));
        assert!(Umap::new(2, 0.1, 1.0, 3, Some(0)).fit(&data, 0).is_err());
    }
}
