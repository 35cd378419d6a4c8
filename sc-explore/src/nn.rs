use anyhow::{bail, Error};
use ball_tree::{BallTree, Point};
use graph_cluster::Network;
use log::info;
use ndarray::parallel::prelude::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(PartialEq)]
struct Pt(Vec<f64>);

impl Point for Pt {
    fn distance(&self, other: &Self) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|p| (p.1 - p.0).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    fn move_towards(&self, other: &Self, d: f64) -> Self {
        let total_dist = self.distance(other);
        let frac = if total_dist == 0.0 { 0.0 } else { d / total_dist };

        Pt(self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(&s, &o)| s + frac * (o - s))
            .collect())
    }
}

/// Compute the `k` nearest neighbors of each row in `v`, using Euclidean distance, excluding the
/// row itself. Returns the neighbor indices and distances, nearest first.
pub fn knn(v: &ArrayView2<f64>, k: usize) -> Result<(Array2<usize>, Array2<f64>), Error> {
    let (cells, _) = v.dim();
    if k == 0 || k >= cells {
        bail!("cannot find {} neighbors among {} points", k, cells);
    }

    info!("constructing ball tree of {} points", cells);
    let points: Vec<Pt> = v.outer_iter().map(|row| Pt(row.to_vec())).collect();
    let values: Vec<usize> = (0..cells).collect();
    let ball_tree = BallTree::new(points, values);

    info!("querying points for {} neighbors", k);
    let mut indices = Array2::from_elem((cells, k), usize::MAX);
    let mut distances = Array2::from_elem((cells, k), f64::INFINITY);
    indices
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(distances.axis_iter_mut(Axis(0)))
        .enumerate()
        .for_each_init(
            || ball_tree.query(),
            |query, (cell, (mut idx, mut dist))| {
                let mut ind = 0;
                let pt = Pt(v.row(cell).to_vec());
                for (_, d, &j) in query.nn(&pt).take(k + 1) {
                    if j != cell && ind < k {
                        idx[ind] = j;
                        dist[ind] = d;
                        ind += 1;
                    }
                }
            },
        );
    Ok((indices, distances))
}

/// Edge weighting of the shared nearest neighbor graph
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnnWeight {
    /// `k - r/2`, where `r` is the smallest rank sum over shared neighbors
    Rank,
    /// number of shared neighbors
    Number,
    /// shared neighbors over the union of both neighbor sets
    Jaccard,
}

const MIN_RANK_WEIGHT: f64 = 1e-6;

/// Shared nearest neighbor graph over the rows of `scores`. Each cell is its
/// own rank 0 neighbor, so two cells are connected whenever either one is in
/// the other's `k` nearest neighbors or they have a neighbor in common.
pub fn build_snn_graph(scores: &Array2<f64>, k: usize, weight: SnnWeight) -> Result<Network, Error> {
    let n = scores.nrows();
    let (indices, _) = knn(&scores.view(), k)?;

    // for each cell, the cells listing it as a neighbor and at which rank
    let mut holders: Vec<Vec<(usize, usize)>> = (0..n).map(|i| vec![(i, 0)]).collect();
    for (i, row) in indices.outer_iter().enumerate() {
        for (r, &j) in row.iter().enumerate() {
            holders[j].push((i, r + 1));
        }
    }

    let per_cell: Vec<Vec<(usize, usize, f64)>> = (0..n)
        .into_par_iter()
        .map(|i| {
            // other cell -> (shared count, smallest rank sum)
            let mut shared: HashMap<usize, (usize, usize)> = HashMap::new();
            let own = std::iter::once(i).chain(indices.row(i).into_iter().copied());
            for (ri, nb) in own.enumerate() {
                for &(j, rj) in &holders[nb] {
                    if j <= i {
                        continue;
                    }
                    let e = shared.entry(j).or_insert((0, usize::MAX));
                    e.0 += 1;
                    e.1 = e.1.min(ri + rj);
                }
            }
            let mut edges: Vec<(usize, usize, f64)> = shared
                .into_iter()
                .map(|(j, (count, rank))| {
                    let w = match weight {
                        SnnWeight::Rank => (k as f64 - 0.5 * rank as f64).max(MIN_RANK_WEIGHT),
                        SnnWeight::Number => count as f64,
                        SnnWeight::Jaccard => count as f64 / (2 * (k + 1) - count) as f64,
                    };
                    (i, j, w)
                })
                .collect();
            edges.sort_by_key(|&(_, j, _)| j);
            edges
        })
        .collect();

    let network = Network::from_edges(n, per_cell.into_iter().flatten());
    info!("SNN graph over {} cells with k = {} has {} edges", n, k, network.edge_count());
    Ok(network)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, s};
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};
    use rand_pcg::Pcg64Mcg;

    fn distance(v1: &[f64], other: &[f64]) -> f64 {
        let mut d = 0.0;
        for i in 0..v1.len() {
            d += (other[i] - v1[i]).powi(2);
        }
        d.sqrt()
    }

    // Basic n^2 knn algorithm, for testing purposes
    fn exhaustive_knn(v: &ArrayView2<f64>, k: usize) -> Array2<usize> {
        let cells = v.shape()[0];
        let mut nns = Vec::new();
        assert!(k < cells);

        let mut output = Array2::zeros((cells, k));

        for cell in 0..cells {
            nns.clear();
            let my_point = v.row(cell).to_vec();

            for other_cell in 0..cells {
                if cell == other_cell {
                    continue;
                }
                let other_point = v.row(other_cell).to_vec();
                nns.push((distance(&my_point, &other_point), other_cell));
            }

            nns.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

            for i in 0..k {
                output[(cell, i)] = nns[i].1
            }
        }

        output
    }

    fn validate_knn(v: &ArrayView2<f64>) {
        let full_knn = exhaustive_knn(v, std::cmp::min(v.shape()[0] - 1, 50));

        for k in &[1, 5, 10, 25, 50] {
            if k >= &v.shape()[0] {
                continue;
            }

            let (fast_knn, _) = knn(v, *k).unwrap();
            let slow_knn = full_knn.slice(s![.., 0..*k]).to_owned();

            assert_eq!(fast_knn, slow_knn);
        }
    }

    #[test]
    fn test_knn() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let dist = Normal::new(0.0f64, 1.0f64).unwrap();

        for ncells in &[3, 5, 50, 100] {
            for d in &[1, 2, 3, 5, 10, 20, 50] {
                let v = Array2::from_shape_simple_fn((*ncells, *d), || dist.sample(&mut rng));
                validate_knn(&v.view());
            }
        }
    }

    #[test]
    fn test_knn_distances() {
        let v = arr2(&[[0.0, 0.0], [3.0, 4.0], [0.0, 1.0]]);
        let (idx, dist) = knn(&v.view(), 2).unwrap();
        assert_eq!(idx.row(0).to_vec(), vec![2, 1]);
        assert_eq!(dist.row(0).to_vec(), vec![1.0, 5.0]);
        assert!(knn(&v.view(), 3).is_err());
        assert!(knn(&v.view(), 0).is_err());
    }

    #[test]
    fn test_symmetry() {
        // A bunch of equally distant points, with one outlier
        let mut v = Array2::<f64>::eye(5);
        v[(0, 4)] = 3.0f64;

        let (knn, _) = knn(&v.view(), 4).unwrap();

        // There are some degeneracies in the distances,
        // but the ball tree is still deterministc
        let correct = arr2(&[[4, 2, 1, 3], [4, 2, 3, 0], [4, 1, 3, 0], [4, 1, 2, 0], [2, 1, 3, 0]]);
        assert_eq!(knn, correct);
    }

    fn pairs() -> Array2<f64> {
        arr2(&[[0.0], [1.0], [10.0], [11.0]])
    }

    fn edges(network: &Network) -> Vec<(usize, usize, f64)> {
        let mut out = Vec::new();
        for i in 0..network.nodes() {
            for (j, w) in network.neighbors(i) {
                if i < j {
                    out.push((i, j, w));
                }
            }
        }
        out
    }

    #[test]
    fn test_snn_weights() {
        let rank = build_snn_graph(&pairs(), 1, SnnWeight::Rank).unwrap();
        assert_eq!(edges(&rank), vec![(0, 1, 0.5), (2, 3, 0.5)]);

        let number = build_snn_graph(&pairs(), 1, SnnWeight::Number).unwrap();
        assert_eq!(edges(&number), vec![(0, 1, 2.0), (2, 3, 2.0)]);

        let jaccard = build_snn_graph(&pairs(), 1, SnnWeight::Jaccard).unwrap();
        assert_eq!(edges(&jaccard), vec![(0, 1, 1.0), (2, 3, 1.0)]);
    }

    #[test]
    fn test_snn_blobs_stay_apart() {
        let mut rng = Pcg64Mcg::seed_from_u64(11);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let v = Array2::from_shape_fn((60, 3), |(i, _)| (if i < 30 { 0.0 } else { 50.0 }) + noise.sample(&mut rng));
        let network = build_snn_graph(&v, 5, SnnWeight::Rank).unwrap();
        for (i, j, w) in edges(&network) {
            assert_eq!(i < 30, j < 30, "edge {i}-{j}");
            assert!(w > 0.0 && w <= 5.0);
        }
    }
}
