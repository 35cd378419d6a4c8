//! Fuzzy simplicial set of a kNN graph.
//!
//! Each point gets a local metric: distances beyond its nearest neighbor
//! (`rho`) are scaled by `sigma`, chosen so the memberships of its k neighbors
//! sum to `log2(k)`. The directed memberships are then symmetrized with a
//! fuzzy union.

use crate::Q;
use log::debug;
use ndarray::{Array2, ArrayView1};
use sprs::{CsMat, TriMat};

const NITER: usize = 64;
const SMOOTH_K_TOLERANCE: Q = 1e-5;
const MIN_K_DIST_SCALE: Q = 1e-3;

/// Fuzzy graph over `n` points from their kNN indices and distances (neighbors
/// exclude the point itself). `set_op_mix_ratio` of 1 is a pure fuzzy union,
/// 0 a pure fuzzy intersection.
pub fn fuzzy_simplicial_set(
    knn_indices: &Array2<usize>,
    knn_distances: &Array2<Q>,
    local_connectivity: Q,
    set_op_mix_ratio: Q,
) -> CsMat<Q> {
    let n_points = knn_indices.nrows();
    let (sigmas, rhos) = smooth_knn_distances(knn_distances, local_connectivity);
    let directed = membership_strengths(knn_indices, knn_distances, &sigmas, &rhos).to_csr();
    let transpose = directed.transpose_view().to_csr();

    let product = sprs::binop::mul_mat_same_storage(&directed, &transpose);
    let union = &(&directed + &transpose) - &product;
    let graph = &(&union * set_op_mix_ratio) + &(&product * (1.0 - set_op_mix_ratio));
    debug!("fuzzy simplicial set over {} points has {} edges", n_points, graph.nnz());
    graph
}

/// Per-point `(sigma, rho)`
fn smooth_knn_distances(knn_distances: &Array2<Q>, local_connectivity: Q) -> (Vec<Q>, Vec<Q>) {
    let (n, k) = knn_distances.dim();
    let mean_distance = knn_distances.mean().unwrap_or(0.0);
    let mut sigmas = vec![0.0; n];
    let mut rhos = vec![0.0; n];

    for (i, row) in knn_distances.outer_iter().enumerate() {
        let non_zero: Vec<Q> = row.iter().copied().filter(|&d| d > 0.0).collect();
        if non_zero.len() as Q >= local_connectivity {
            let index = local_connectivity.floor() as usize;
            let interpolation = local_connectivity - local_connectivity.floor();
            if index > 0 {
                rhos[i] = non_zero[index - 1];
                if interpolation > SMOOTH_K_TOLERANCE && index < non_zero.len() {
                    rhos[i] += interpolation * (non_zero[index] - non_zero[index - 1]);
                }
            } else {
                rhos[i] = interpolation * non_zero[0];
            }
        } else if let Some(&m) = non_zero.iter().max_by(|a, b| a.total_cmp(b)) {
            rhos[i] = m;
        }

        let sigma = smooth_knn_dist(row, rhos[i], k);
        let floor = if rhos[i] > 0.0 {
            MIN_K_DIST_SCALE * row.mean().unwrap_or(0.0)
        } else {
            MIN_K_DIST_SCALE * mean_distance
        };
        sigmas[i] = sigma.max(floor);
    }
    (sigmas, rhos)
}

/// Binary search for sigma such that the memberships sum to log2(k)
fn smooth_knn_dist(distances: ArrayView1<Q>, rho: Q, k: usize) -> Q {
    let target = (k as Q).log2();
    let mut lo = 0.0;
    let mut mid = 1.0;
    let mut hi = Q::INFINITY;

    for _ in 0..NITER {
        let psum: Q = distances.iter().map(|&d| (-((d - rho).max(0.0) / mid)).exp()).sum();
        if (psum - target).abs() < SMOOTH_K_TOLERANCE {
            break;
        }
        if psum > target {
            hi = mid;
            mid = (lo + hi) / 2.0;
        } else {
            lo = mid;
            if hi == Q::INFINITY {
                mid *= 2.0;
            } else {
                mid = (lo + hi) / 2.0;
            }
        }
    }
    mid
}

/// Directed membership of each neighbor `j` in point `i`'s local set, as a (j, i) triplet
fn membership_strengths(knn_indices: &Array2<usize>, knn_distances: &Array2<Q>, sigmas: &[Q], rhos: &[Q]) -> TriMat<Q> {
    let (n, k) = knn_indices.dim();
    let mut tri = TriMat::with_capacity((n, n), n * k);
    for i in 0..n {
        for j in 0..k {
            let neighbor = knn_indices[[i, j]];
            if neighbor == i {
                continue;
            }
            let d = knn_distances[[i, j]] - rhos[i];
            let val = if d <= 0.0 || sigmas[i] == 0.0 {
                1.0
            } else {
                (-d / sigmas[i]).exp()
            };
            tri.add_triplet(neighbor, i, val);
        }
    }
    tri
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_smooth_knn_dist() {
        let dists = arr1(&[0., 1., 2., 3., 4., 5.]);
        let sigma = smooth_knn_dist(dists.view(), 1.0, 6);
        let psum: Q = dists.iter().map(|&d| (-((d - 1.0f64).max(0.0) / sigma)).exp()).sum();
        assert!((psum - 6f64.log2()).abs() <= SMOOTH_K_TOLERANCE);
    }

    #[test]
    fn test_rhos() {
        let knn_distances = arr2(&[[0., 0., 0.0], [1., 2., 3.], [2., 4., 5.], [3., 4., 5.]]);
        let (_, rhos) = smooth_knn_distances(&knn_distances, 1.0);
        assert_eq!(rhos, vec![0.0, 1.0, 2.0, 3.0]);

        let knn_distances = arr2(&[[0., 1., 2.], [0., 2., 3.]]);
        let (_, rhos) = smooth_knn_distances(&knn_distances, 1.5);
        assert_eq!(rhos, vec![1.5, 2.5]);
    }

    #[test]
    fn test_graph_is_symmetric() {
        let knns = arr2(&[[1, 2], [2, 0], [1, 0]]);
        let dists = arr2(&[[1.5, 2.0], [0.5, 1.5], [0.5, 2.0]]);
        let graph = fuzzy_simplicial_set(&knns, &dists, 1.0, 1.0);
        assert_eq!(graph.shape(), (3, 3));
        for (&v, (r, c)) in graph.iter() {
            let t = graph.get(c, r).copied().unwrap_or(0.0);
            assert!((v - t).abs() < 1e-12);
            assert!((0.0..=1.0).contains(&v));
        }
        // each point's nearest neighbor has full membership
        assert_eq!(graph.get(1, 2).copied(), Some(1.0));
    }
}
