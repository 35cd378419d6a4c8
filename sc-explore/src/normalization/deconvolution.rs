//! Size factors by pooling cells and deconvolving the pool factors.
//!
//! Counts of many cells summed together are far less sparse than those of a
//! single cell, so a robust ratio against an average pseudo-cell is available
//! for each pool. Every pool's factor is the sum of its members' factors,
//! which gives an over-determined linear system for the per-cell factors.
//! Cells are pooled within clusters of similar composition and the clusters
//! are then rescaled against each other.

use super::{centre_size_factors, library_size_factors, log_normalize_counts};
use crate::dim_red::pca_logcounts;
use crate::hvg::log_expression_stats;
use crate::nn::{build_snn_graph, SnnWeight};
use crate::stats::median_mut;
use anyhow::{bail, format_err, Error};
use graph_cluster::{Clustering, Walktrap};
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;
use sc_types::partition::relabel_by_size;
use sc_types::CountMatrix;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Weight of the extra equations tying each cell to its library size factor
const LOW_WEIGHT: f64 = 1e-6;

/// Settings for quick clustering and pooled size factor estimation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeconvolutionParams {
    /// pool sizes; sizes larger than a cluster are skipped
    pub sizes: Vec<usize>,
    /// minimum average scaled count of a gene used for the pool ratios
    pub min_mean: f64,
    /// cluster before pooling; otherwise all cells form one pool
    pub cluster: bool,
    /// minimum cluster size after merging, at most half the cells
    pub min_cluster_size: usize,
    /// neighbors in the quick clustering SNN graph
    pub knn: usize,
    /// principal components used by the quick clustering
    pub n_pcs: usize,
    /// most variable genes used by the quick clustering
    pub n_genes: usize,
    /// replace non-positive estimates with library size factors instead of failing
    pub positive: bool,
}

impl Default for DeconvolutionParams {
    fn default() -> Self {
        DeconvolutionParams {
            sizes: (21..=101).step_by(10).collect(),
            min_mean: 0.1,
            cluster: true,
            min_cluster_size: 100,
            knn: 10,
            n_pcs: 50,
            n_genes: 2000,
            positive: true,
        }
    }
}

impl DeconvolutionParams {
    fn min_pool(&self) -> usize {
        self.sizes.iter().copied().min().unwrap_or(1)
    }
}

/// Coarse clustering of cells with similar composition: library size
/// normalization, PCA on the most variable genes, a rank-weighted SNN graph
/// and walktrap. Clusters smaller than the minimum size are merged into
/// their nearest neighbor by centroid distance. Labels are ordered by size.
pub fn quick_cluster(counts: &CountMatrix, params: &DeconvolutionParams, seed: u64) -> Result<Vec<usize>, Error> {
    let n = counts.n_cells();
    let min_size = params.min_cluster_size.min(n / 2);
    if min_size < params.min_pool() || n <= params.knn + 1 {
        info!("{} cells are too few to cluster before pooling, using a single cluster", n);
        return Ok(vec![0; n]);
    }

    let sf = library_size_factors(counts)?;
    let logcounts = log_normalize_counts(&counts.matrix, &sf, 1.0)?;
    let (_, vars) = log_expression_stats(&logcounts);
    let mut genes: Vec<usize> = (0..vars.len()).filter(|&g| vars[g] > 0.0).collect();
    genes.sort_by(|&a, &b| vars[b].total_cmp(&vars[a]).then_with(|| a.cmp(&b)));
    genes.truncate(params.n_genes);
    genes.sort_unstable();
    if genes.len() < 2 {
        warn!("fewer than 2 variable genes, using a single cluster");
        return Ok(vec![0; n]);
    }

    let d = params.n_pcs.min(n - 1).min(genes.len() - 1).max(1);
    let pca = pca_logcounts(&logcounts, &genes, d, seed)?;
    let network = build_snn_graph(&pca.scores, params.knn.min(n - 1), SnnWeight::Rank)?;
    let labels = Walktrap::default().run(&network).clustering.labels();
    let merged = merge_small_clusters(labels, &pca.scores, min_size);
    info!(
        "quick clustering found {} clusters of at least {} cells",
        merged.iter().max().map_or(0, |&m| m + 1),
        min_size
    );
    Ok(merged)
}

/// Repeatedly merge the smallest cluster below `min_size` into the cluster
/// with the nearest centroid, until none is left or one cluster remains.
fn merge_small_clusters(mut labels: Vec<usize>, scores: &Array2<f64>, min_size: usize) -> Vec<usize> {
    loop {
        labels = relabel_by_size(labels);
        let k = labels.iter().max().map_or(0, |&m| m + 1);
        if k <= 1 {
            return labels;
        }
        let mut sizes = vec![0usize; k];
        let mut centroids = Array2::<f64>::zeros((k, scores.ncols()));
        for (cell, &l) in labels.iter().enumerate() {
            sizes[l] += 1;
            let mut c = centroids.row_mut(l);
            c += &scores.row(cell);
        }
        // labels are ordered by size, so the last is the smallest
        let small = k - 1;
        if sizes[small] >= min_size {
            return labels;
        }
        for (l, mut c) in centroids.axis_iter_mut(Axis(0)).enumerate() {
            c /= sizes[l] as f64;
        }
        let target = (0..small)
            .min_by(|&a, &b| {
                let da = centroid_distance(&centroids, small, a);
                let db = centroid_distance(&centroids, small, b);
                da.total_cmp(&db)
            })
            .unwrap_or(0);
        debug!("merging cluster of {} cells into cluster {}", sizes[small], target);
        for l in labels.iter_mut() {
            if *l == small {
                *l = target;
            }
        }
    }
}

fn centroid_distance(c: &Array2<f64>, a: usize, b: usize) -> f64 {
    c.row(a).iter().zip(c.row(b)).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Order cells by library size and lay them out on a ring: odd ranks in
/// increasing order followed by even ranks in decreasing order. Sliding
/// windows over the ring then mix small and large cells.
fn ring_order(lib: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..lib.len()).collect();
    order.sort_by(|&a, &b| lib[a].total_cmp(&lib[b]).then_with(|| a.cmp(&b)));
    let mut ring: Vec<usize> = order.iter().step_by(2).copied().collect();
    ring.extend(order.iter().skip(1).step_by(2).rev());
    ring
}

/// Factors of the cells of one cluster relative to its own pseudo-cell,
/// in the scale of the cluster's library sizes.
fn cluster_factors(counts: &CountMatrix, cells: &[usize], lib: &[f64], params: &DeconvolutionParams) -> Result<Vec<f64>, Error> {
    let n = cells.len();
    let cluster_lib: Vec<f64> = cells.iter().map(|&c| lib[c]).collect();
    let mean_lib = cluster_lib.iter().sum::<f64>() / n as f64;
    let lib_norm: Vec<f64> = cluster_lib.iter().map(|l| l / mean_lib).collect();

    // average of the library-size-scaled counts
    let mut ave = vec![0.0; counts.n_genes()];
    for (i, &c) in cells.iter().enumerate() {
        if let Some(col) = counts.matrix.outer_view(c) {
            for (g, &v) in col.iter() {
                ave[g] += v as f64 / lib_norm[i];
            }
        }
    }
    ave.iter_mut().for_each(|a| *a /= n as f64);
    let mut genes: Vec<usize> = (0..ave.len()).filter(|&g| ave[g] >= params.min_mean && ave[g] > 0.0).collect();
    if genes.is_empty() {
        warn!("no gene reaches an average of {} in a cluster of {} cells, using all expressed genes", params.min_mean, n);
        genes = (0..ave.len()).filter(|&g| ave[g] > 0.0).collect();
    }
    if genes.is_empty() {
        bail!("a cluster of {} cells has no expressed genes", n);
    }
    let mut lookup = vec![None; counts.n_genes()];
    for (j, &g) in genes.iter().enumerate() {
        lookup[g] = Some(j);
    }
    let pseudo: Array1<f64> = genes.iter().map(|&g| ave[g]).collect();

    let mut scaled = Array2::<f64>::zeros((n, genes.len()));
    for (i, &c) in cells.iter().enumerate() {
        if let Some(col) = counts.matrix.outer_view(c) {
            for (g, &v) in col.iter() {
                if let Some(j) = lookup[g] {
                    scaled[(i, j)] = v as f64 / lib_norm[i];
                }
            }
        }
    }

    let ring = ring_order(&cluster_lib);
    let mut system = PoolSystem::new(n);
    let mut ratios = vec![0.0; genes.len()];
    for &size in params.sizes.iter().filter(|&&s| s <= n) {
        let mut pool = Array1::<f64>::zeros(genes.len());
        for &cell in &ring[..size] {
            pool += &scaled.row(cell);
        }
        for start in 0..n {
            for (r, (p, q)) in ratios.iter_mut().zip(pool.iter().zip(pseudo.iter())) {
                *r = p / q;
            }
            let factor = median_mut(&mut ratios).unwrap_or(0.0);
            let members = (0..size).map(|a| (ring[(start + a) % n], 1.0)).collect();
            system.push(members, factor);
            pool -= &scaled.row(ring[start]);
            pool += &scaled.row(ring[(start + size) % n]);
        }
    }
    let w = LOW_WEIGHT.sqrt();
    for i in 0..n {
        system.push(vec![(i, w)], w);
    }

    let x = system
        .solve()
        .ok_or_else(|| format_err!("pooled size factor system for a cluster of {} cells is singular", n))?;
    Ok(x.iter().zip(&lib_norm).map(|(x, l)| x * l).collect())
}

/// Over-determined sparse system `A x = b` solved by least squares through
/// a QR factorization of `A`. Rows are factored in blocks: each block is
/// stacked under the current triangular factor and factored again, so at most
/// two blocks of `n` rows are held at once.
struct PoolSystem {
    n: usize,
    r: DMatrix<f64>,
    qtb: DVector<f64>,
    pending: Vec<(Vec<(usize, f64)>, f64)>,
}

impl PoolSystem {
    fn new(n: usize) -> PoolSystem {
        PoolSystem {
            n,
            r: DMatrix::zeros(n, n),
            qtb: DVector::zeros(n),
            pending: Vec::with_capacity(n),
        }
    }

    fn push(&mut self, row: Vec<(usize, f64)>, rhs: f64) {
        self.pending.push((row, rhs));
        if self.pending.len() >= self.n {
            self.fold();
        }
    }

    /// Factor the pending rows into `r` and `qtb`
    fn fold(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let n = self.n;
        let m = n + self.pending.len();
        let mut a = DMatrix::<f64>::zeros(m, n);
        let mut b = DVector::<f64>::zeros(m);
        a.rows_mut(0, n).copy_from(&self.r);
        b.rows_mut(0, n).copy_from(&self.qtb);
        for (k, (row, rhs)) in self.pending.drain(..).enumerate() {
            for (j, v) in row {
                a[(n + k, j)] += v;
            }
            b[n + k] = rhs;
        }
        let qr = a.qr();
        self.qtb = qr.q().transpose() * b;
        self.r = qr.r();
    }

    fn solve(mut self) -> Option<DVector<f64>> {
        self.fold();
        let scale = self.r.diagonal().amax();
        if self.r.diagonal().iter().any(|d| d.abs() <= scale * f64::EPSILON) {
            return None;
        }
        self.r.solve_upper_triangular(&self.qtb)
    }
}

/// Mean of `count / factor` per gene over the cells of a cluster
fn normalized_profile(counts: &CountMatrix, cells: &[usize], factors: &[f64]) -> Vec<f64> {
    let mut prof = vec![0.0; counts.n_genes()];
    let mut used = 0usize;
    for &c in cells {
        if factors[c] <= 0.0 {
            continue;
        }
        used += 1;
        if let Some(col) = counts.matrix.outer_view(c) {
            for (g, &v) in col.iter() {
                prof[g] += v as f64 / factors[c];
            }
        }
    }
    prof.iter_mut().for_each(|p| *p /= used.max(1) as f64);
    prof
}

/// Pooled size factors for every cell given a clustering of the cells. Each
/// cluster must hold at least as many cells as the smallest pool size and
/// every cell must have a nonzero total count. The factors are centred to
/// unit mean.
pub fn compute_sum_factors(counts: &CountMatrix, clusters: &[usize], params: &DeconvolutionParams) -> Result<Vec<f64>, Error> {
    let n = counts.n_cells();
    if clusters.len() != n {
        bail!("{} cluster labels for {} cells", clusters.len(), n);
    }
    if params.sizes.is_empty() {
        bail!("no pool sizes given");
    }
    let lib = counts.col_sums();
    if let Some(c) = lib.iter().position(|&l| l <= 0.0) {
        bail!("cell {} ({}) has a zero total count", c, counts.barcodes[c]);
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (cell, &l) in clusters.iter().enumerate() {
        groups.entry(l).or_default().push(cell);
    }
    let mut groups: Vec<Vec<usize>> = groups.into_values().collect();
    // the largest cluster is the reference for rescaling
    groups.sort_by(|a, b| b.len().cmp(&a.len()));
    let min_pool = params.min_pool();
    if let Some(g) = groups.iter().find(|g| g.len() < min_pool) {
        bail!(
            "a cluster of {} cells is smaller than the minimum pool size {}",
            g.len(),
            min_pool
        );
    }
    info!(
        "pooled size factors for {} cells in {} clusters, pool sizes {:?}",
        n,
        groups.len(),
        params.sizes
    );

    let per_cluster: Vec<Vec<f64>> = groups
        .par_iter()
        .map(|cells| cluster_factors(counts, cells, &lib, params))
        .collect::<Result<_, _>>()?;
    let mut factors = vec![0.0; n];
    for (cells, f) in groups.iter().zip(&per_cluster) {
        for (&c, &v) in cells.iter().zip(f) {
            factors[c] = v;
        }
    }

    let reference = normalized_profile(counts, &groups[0], &factors);
    for cells in groups.iter().skip(1) {
        let prof = normalized_profile(counts, cells, &factors);
        let mut ratios: Vec<f64> = prof
            .iter()
            .zip(&reference)
            .filter(|(&p, &r)| p > 0.0 && r > 0.0)
            .map(|(p, r)| p / r)
            .collect();
        let scale = match median_mut(&mut ratios) {
            Some(s) if s > 0.0 => s,
            _ => {
                warn!("cluster of {} cells shares no genes with the reference cluster, not rescaled", cells.len());
                1.0
            }
        };
        debug!("rescaling cluster of {} cells by {:.4}", cells.len(), scale);
        for &c in cells {
            factors[c] *= scale;
        }
    }

    let bad: Vec<usize> = (0..n).filter(|&c| !(factors[c] > 0.0)).collect();
    if !bad.is_empty() {
        if !params.positive {
            bail!("{} cells have non-positive pooled size factors", bad.len());
        }
        warn!(
            "{} cells have non-positive pooled size factors, using their library size factors",
            bad.len()
        );
        centre_size_factors(&mut factors)?;
        let mean_lib = lib.iter().sum::<f64>() / n as f64;
        for c in bad {
            factors[c] = lib[c] / mean_lib;
        }
    }
    centre_size_factors(&mut factors)?;
    Ok(factors)
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use sc_types::GeneTable;

    fn matrix(dense: &Array2<u32>) -> CountMatrix {
        let ids: Vec<String> = (0..dense.nrows()).map(|i| format!("G{i}")).collect();
        let genes = GeneTable::new(ids.clone(), ids, "MT-").unwrap();
        let barcodes = (0..dense.ncols()).map(|i| format!("C{i}")).collect();
        CountMatrix::from_dense(genes, barcodes, dense).unwrap()
    }

    /// cells sharing one composition at different sequencing depths
    fn scaled_profiles(depths: &[u32]) -> Array2<u32> {
        Array2::from_shape_fn((40, depths.len()), |(g, c)| depths[c] * (2 + (g as u32 % 7)))
    }

    #[test]
    fn test_ring_order() {
        let lib = [50.0, 10.0, 40.0, 20.0, 30.0];
        // ranks: 1 -> 10, 3 -> 20, 4 -> 30, 2 -> 40, 0 -> 50
        assert_eq!(ring_order(&lib), vec![1, 4, 0, 2, 3]);
    }

    #[test]
    fn test_pool_system_least_squares() {
        // x0 + x1 = 3, x1 = 2, x0 = 1.2, folded in two blocks
        let mut system = PoolSystem::new(2);
        system.push(vec![(0, 1.0), (1, 1.0)], 3.0);
        system.push(vec![(1, 1.0)], 2.0);
        system.push(vec![(0, 1.0)], 1.2);
        let x = system.solve().unwrap();
        assert_approx_eq!(x[0], 3.4 / 3.0, 1e-12);
        assert_approx_eq!(x[1], 5.8 / 3.0, 1e-12);

        // x1 never appears
        let mut system = PoolSystem::new(2);
        system.push(vec![(0, 1.0)], 1.0);
        system.push(vec![(0, 2.0)], 2.0);
        assert!(system.solve().is_none());
    }

    #[test]
    fn test_equal_composition_matches_library_size() {
        let depths: Vec<u32> = (0..30).map(|i| 1 + i % 5).collect();
        let m = matrix(&scaled_profiles(&depths));
        let sf = compute_sum_factors(&m, &vec![0; 30], &DeconvolutionParams::default()).unwrap();
        let lib = library_size_factors(&m).unwrap();
        for (a, b) in sf.iter().zip(&lib) {
            assert_approx_eq!(*a, *b, 1e-6);
        }
    }

    #[test]
    fn test_clusters_rescaled() {
        // the second cluster is sequenced twice as deep
        let mut depths: Vec<u32> = (0..25).map(|i| 1 + i % 4).collect();
        depths.extend((0..25).map(|i| 2 * (1 + i % 4)));
        let m = matrix(&scaled_profiles(&depths));
        let clusters: Vec<usize> = (0..50).map(|i| i / 25).collect();
        let sf = compute_sum_factors(&m, &clusters, &DeconvolutionParams::default()).unwrap();
        let lib = library_size_factors(&m).unwrap();
        for (a, b) in sf.iter().zip(&lib) {
            assert_approx_eq!(*a, *b, 1e-6);
        }
        assert_approx_eq!(sf.iter().sum::<f64>() / 50.0, 1.0);
    }

    #[test]
    fn test_preconditions() {
        let depths: Vec<u32> = (0..30).map(|i| 1 + i % 5).collect();
        let mut dense = scaled_profiles(&depths);
        let m = matrix(&dense);
        let params = DeconvolutionParams::default();
        // second cluster below the smallest pool size
        let clusters: Vec<usize> = (0..30).map(|i| usize::from(i >= 25)).collect();
        assert!(compute_sum_factors(&m, &clusters, &params).is_err());
        assert!(compute_sum_factors(&m, &[0; 3], &params).is_err());

        dense.column_mut(4).fill(0);
        assert!(compute_sum_factors(&matrix(&dense), &vec![0; 30], &params).is_err());
    }

    #[test]
    fn test_merge_small_clusters() {
        // three groups along a line; the tiny one sits next to the second
        let mut scores = Array2::zeros((13, 1));
        let mut labels = Vec::new();
        for i in 0..13 {
            let (label, x) = match i {
                0..=5 => (0, 0.0),
                6..=10 => (1, 10.0),
                _ => (2, 9.0),
            };
            scores[(i, 0)] = x + 0.01 * i as f64;
            labels.push(label);
        }
        let merged = merge_small_clusters(labels, &scores, 3);
        // the merged cluster is now the largest and takes label 0
        assert_eq!(&merged[..6], &[1; 6]);
        assert!(merged[6..].iter().all(|&l| l == 0));
        // nothing to merge when every cluster is large enough
        let same = merge_small_clusters(vec![0, 0, 1, 1], &Array2::zeros((4, 1)), 2);
        assert_eq!(same, vec![0, 0, 1, 1]);
    }
}
