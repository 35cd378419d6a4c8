//! Principal components of the log-expression of selected genes, the choice
//! of how many to keep, and the 2D layouts computed from them.
//!
//! The decomposition runs on the dense cells x genes matrix, centred per gene
//! but not scaled. Large problems use IRLBA for the leading singular triplets.
//! Small ones, or requests for nearly all components, use a full SVD.

use crate::normalization::Normalized;
use anyhow::{bail, Error};
use log::{debug, info};
use nalgebra::DMatrix;
use ndarray::{s, Array1, Array2, Axis};
use sc_types::matrix::dense_cells_by_rows;
use sc_types::{EmbeddingKind, LogCounts, Pca, VisualEmbedding};
use serde::{Deserialize, Serialize};
use tsne_rs::Tsne;
use umap_rs::Umap;

/// IRLBA svd method
pub mod irlba;

/// `(U, d, V)` with the singular values in decreasing order
pub(crate) type PcaResult = (Array2<f64>, Array1<f64>, Array2<f64>);

/// The `k` leading singular triplets from a full dense SVD.
pub(crate) fn full_svd(a: &Array2<f64>, k: usize) -> Result<PcaResult, Error> {
    let (u, d, vt) = irlba::sorted_svd(a)?;
    let k = k.min(d.len());
    Ok((
        u.slice(s![.., ..k]).to_owned(),
        d.slice(s![..k]).to_owned(),
        vt.slice(s![..k, ..]).t().to_owned(),
    ))
}

/// Flip components so the largest loading of each is positive. Singular
/// vectors are only defined up to sign, and this keeps the result independent
/// of the solver used.
fn fix_signs(u: &mut Array2<f64>, v: &mut Array2<f64>) {
    for c in 0..v.ncols() {
        let largest = v.column(c).iter().copied().fold(0.0f64, |best, x| if x.abs() > best.abs() { x } else { best });
        if largest < 0.0 {
            v.column_mut(c).mapv_inplace(|x| -x);
            u.column_mut(c).mapv_inplace(|x| -x);
        }
    }
}

/// PCA of the cells on the rows `genes` of a genes x cells log-expression
/// matrix, keeping `ncomp` components. The seed only affects the IRLBA start
/// vector; converged results do not depend on it beyond numerical noise.
pub fn pca_logcounts(logcounts: &LogCounts, genes: &[usize], ncomp: usize, seed: u64) -> Result<Pca, Error> {
    let n = logcounts.cols();
    let p = genes.len();
    if n < 2 {
        bail!("PCA needs at least 2 cells, got {}", n);
    }
    if p == 0 {
        bail!("PCA needs at least one gene");
    }
    if ncomp == 0 {
        bail!("PCA needs at least one component");
    }
    if let Some(&g) = genes.iter().find(|&&g| g >= logcounts.rows()) {
        bail!("gene index {} out of range for {} genes", g, logcounts.rows());
    }

    let mut x = dense_cells_by_rows(logcounts, genes);
    let Some(means) = x.mean_axis(Axis(0)) else {
        bail!("empty matrix");
    };
    x -= &means;
    let total_var: f64 = x.axis_iter(Axis(1)).map(|c| c.dot(&c)).sum::<f64>() / (n - 1) as f64;

    let rank = n.min(p);
    let k = ncomp.min(rank);
    let (mut u, d, mut v) = if k + 1 >= rank {
        debug!("full SVD of a {}x{} matrix", n, p);
        full_svd(&x, k)?
    } else {
        irlba::Irlba::new(seed).run(&x, k)?
    };
    fix_signs(&mut u, &mut v);

    let scores = &u * &d;
    let sdev = d.mapv(|s| s / ((n - 1) as f64).sqrt());
    let percent_var = sdev
        .iter()
        .map(|s| if total_var > 0.0 { s * s / total_var * 100.0 } else { 0.0 })
        .collect();

    Ok(Pca {
        scores,
        sdev,
        percent_var,
        rotation: v,
        genes: genes.to_vec(),
    })
}

/// PCA on the highly variable genes of normalized data.
pub fn run_pca(normalized: &Normalized, hvgs: &[usize], ncomp: usize, seed: u64) -> Result<Pca, Error> {
    info!("PCA on {} cells and {} genes, {} components", normalized.n_cells(), hvgs.len(), ncomp);
    let pca = pca_logcounts(&normalized.logcounts, hvgs, ncomp, seed)?;
    let explained: f64 = pca.percent_var.iter().sum();
    info!("{} components explain {:.1}% of the variance", pca.n_components(), explained);
    Ok(pca)
}

/// Number of components to keep: the point of the variance curve furthest
/// below the straight line joining its first and last points. If no point lies
/// below that line all components are kept. 1-based.
pub fn find_elbow_point(percent_var: &[f64]) -> usize {
    let n = percent_var.len();
    if n < 3 {
        return n.max(1);
    }
    let mut v = percent_var.to_vec();
    v.sort_by(|a, b| b.total_cmp(a));

    let range = v[0] - v[n - 1];
    let (dx, dy) = ((n - 1) as f64, -range);
    let l2 = dx.hypot(dy);
    let (dx, dy) = (dx / l2, dy / l2);

    let mut best: Option<(usize, f64)> = None;
    for (i, &y) in v.iter().enumerate() {
        let dx0 = i as f64;
        let dy0 = y - v[0];
        let parallel = ((dx0 * dx).powi(2) + (dy0 * dy).powi(2)).sqrt();
        let nx = dx0 - dx * parallel;
        let ny = dy0 - dy * parallel;
        if nx < 0.0 && ny < 0.0 {
            let dist = nx.hypot(ny);
            if best.map_or(true, |(_, b)| dist > b) {
                best = Some((i + 1, dist));
            }
        }
    }
    best.map_or(n, |(i, _)| i)
}

/// t-SNE settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TsneParams {
    /// leading PCs used as input; all retained PCs when unset
    pub n_pcs: Option<usize>,
    pub perplexity: f64,
    pub max_iter: usize,
}

impl Default for TsneParams {
    fn default() -> Self {
        TsneParams {
            n_pcs: None,
            perplexity: 30.0,
            max_iter: 1000,
        }
    }
}

/// UMAP settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UmapParams {
    /// leading PCs used as input; all retained PCs when unset
    pub n_pcs: Option<usize>,
    pub n_neighbors: usize,
    pub min_dist: f64,
    pub spread: f64,
    pub n_epochs: Option<usize>,
}

impl Default for UmapParams {
    fn default() -> Self {
        UmapParams {
            n_pcs: None,
            n_neighbors: 15,
            min_dist: 0.01,
            spread: 1.0,
            n_epochs: None,
        }
    }
}

fn leading_scores(pca: &Pca, n_pcs: Option<usize>) -> Array2<f64> {
    let k = n_pcs.unwrap_or(pca.n_components()).clamp(1, pca.n_components().max(1));
    pca.scores.slice(s![.., ..k]).to_owned()
}

pub fn run_tsne(pca: &Pca, params: &TsneParams, seed: u64) -> Result<VisualEmbedding, Error> {
    let input = leading_scores(pca, params.n_pcs);
    info!("t-SNE on {} PCs", input.ncols());
    let mut tsne = Tsne::default();
    tsne.perplexity = params.perplexity;
    tsne.max_iter = params.max_iter;
    tsne.seed = seed;
    let coords = tsne.fit(&input)?;
    Ok(VisualEmbedding {
        kind: EmbeddingKind::Tsne,
        coords,
    })
}

pub fn run_umap(pca: &Pca, params: &UmapParams, seed: u64) -> Result<VisualEmbedding, Error> {
    let input = leading_scores(pca, params.n_pcs);
    info!("UMAP on {} PCs", input.ncols());
    let umap = Umap::new(2, params.min_dist, params.spread, params.n_neighbors, params.n_epochs);
    let coords = umap.fit(&input, seed)?;
    Ok(VisualEmbedding {
        kind: EmbeddingKind::Umap,
        coords,
    })
}

/// Convert to a nalgebra matrix, for callers that need its decompositions.
pub(crate) fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[(i, j)])
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};
    use rand_pcg::Pcg64Mcg;
    use sprs::TriMat;

    /// Rank 5 signal with singular values well apart, plus a little noise
    pub(crate) fn low_rank_matrix(n: usize, p: usize, seed: u64) -> Array2<f64> {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let noise = Normal::new(0.0, 0.01).unwrap();
        let scales = [50.0, 30.0, 20.0, 10.0, 5.0];
        let mut a = Array2::from_shape_simple_fn((n, p), || noise.sample(&mut rng));
        for s in scales {
            let u = Array1::from_shape_simple_fn(n, || normal.sample(&mut rng)) / (n as f64).sqrt();
            let v = Array1::from_shape_simple_fn(p, || normal.sample(&mut rng)) / (p as f64).sqrt();
            for i in 0..n {
                for j in 0..p {
                    a[(i, j)] += s * u[i] * v[j];
                }
            }
        }
        a
    }

    pub(crate) fn reconstruction_error(a: &Array2<f64>, u: &Array2<f64>, d: &Array1<f64>, v: &Array2<f64>) -> f64 {
        let approx = (u * d).dot(&v.t());
        (a - &approx).iter().map(|x| x * x).sum::<f64>().sqrt()
    }

    fn to_logcounts(cells_by_genes: &Array2<f64>) -> LogCounts {
        let (n, p) = cells_by_genes.dim();
        let mut tri = TriMat::new((p, n));
        for ((c, g), &v) in cells_by_genes.indexed_iter() {
            if v != 0.0 {
                tri.add_triplet(g, c, v);
            }
        }
        tri.to_csc()
    }

    #[test]
    fn test_full_svd_matches_nalgebra() -> Result<(), Error> {
        let a = low_rank_matrix(30, 12, 2);
        let (u, d, v) = full_svd(&a, 12)?;
        let expected = to_dmatrix(&a).singular_values();
        for i in 0..12 {
            assert!((d[i] - expected[i]).abs() < 1e-9);
        }
        assert!(reconstruction_error(&a, &u, &d, &v) < 1e-8);
        Ok(())
    }

    #[test]
    fn test_pca_variance() -> Result<(), Error> {
        let x = low_rank_matrix(120, 30, 5).mapv(|v| v + 3.0);
        let logcounts = to_logcounts(&x);
        let genes: Vec<usize> = (0..30).collect();
        let pca = pca_logcounts(&logcounts, &genes, 10, 1)?;
        assert_eq!(pca.scores.dim(), (120, 10));
        assert_eq!(pca.rotation.dim(), (30, 10));

        // scores are centred and their variances are the squared sdevs
        for c in 0..10 {
            let col = pca.scores.column(c);
            let mean = col.sum() / 120.0;
            assert!(mean.abs() < 1e-8);
            let var = col.iter().map(|v| v * v).sum::<f64>() / 119.0;
            assert!((var - pca.sdev[c] * pca.sdev[c]).abs() < 1e-6 * var.max(1.0));
        }
        for w in pca.sdev.as_slice().unwrap().windows(2) {
            assert!(w[0] >= w[1]);
        }
        // nearly all the variance is in the 5 signal components
        let top5: f64 = pca.percent_var[..5].iter().sum();
        assert!(top5 > 99.0 && top5 <= 100.0 + 1e-9, "{top5}");
        Ok(())
    }

    #[test]
    fn test_pca_solver_agreement() -> Result<(), Error> {
        let x = low_rank_matrix(100, 40, 9);
        let logcounts = to_logcounts(&x.mapv(|v| v + 5.0));
        let genes: Vec<usize> = (0..40).collect();
        let lanczos = pca_logcounts(&logcounts, &genes, 5, 3)?;
        let full = pca_logcounts(&logcounts, &genes, 39, 3)?;
        for c in 0..5 {
            assert!((lanczos.sdev[c] - full.sdev[c]).abs() < 1e-6 * full.sdev[0]);
            for g in 0..40 {
                assert!((lanczos.rotation[(g, c)] - full.rotation[(g, c)]).abs() < 1e-3);
            }
        }
        Ok(())
    }

    #[test]
    fn test_pca_preconditions() {
        let logcounts = to_logcounts(&low_rank_matrix(1, 5, 0));
        assert!(pca_logcounts(&logcounts, &[0, 1], 2, 0).is_err());
        let logcounts = to_logcounts(&low_rank_matrix(10, 5, 0));
        assert!(pca_logcounts(&logcounts, &[], 2, 0).is_err());
        assert!(pca_logcounts(&logcounts, &[0, 1], 0, 0).is_err());
        assert!(pca_logcounts(&logcounts, &[0, 9], 2, 0).is_err());
    }

    #[test]
    fn test_elbow() {
        assert_eq!(find_elbow_point(&[50.0, 20.0, 10.0, 8.0, 6.0, 5.0, 4.0, 3.0, 2.0, 1.0]), 3);
        assert_eq!(find_elbow_point(&[30.0, 29.0, 28.0, 5.0, 4.5, 4.0, 3.5, 3.0, 2.5, 2.0]), 4);
        // a curve that never bends below its chord keeps everything
        assert_eq!(find_elbow_point(&[10.0, 9.9, 9.7, 9.0, 7.0, 1.0]), 6);
        assert_eq!(find_elbow_point(&[4.0]), 1);
        assert_eq!(find_elbow_point(&[]), 1);
    }

    #[test]
    fn test_embeddings_shape() -> Result<(), Error> {
        let x = low_rank_matrix(40, 10, 4);
        let logcounts = to_logcounts(&x.mapv(|v| v + 2.0));
        let pca = pca_logcounts(&logcounts, &(0..10).collect::<Vec<_>>(), 5, 0)?;
        let tsne = run_tsne(&pca, &TsneParams { max_iter: 50, perplexity: 5.0, ..TsneParams::default() }, 1)?;
        assert_eq!(tsne.kind, EmbeddingKind::Tsne);
        assert_eq!(tsne.coords.dim(), (40, 2));
        let umap = run_umap(&pca, &UmapParams { n_neighbors: 5, n_epochs: Some(20), ..UmapParams::default() }, 1)?;
        assert_eq!(umap.kind, EmbeddingKind::Umap);
        assert_eq!(umap.coords.dim(), (40, 2));
        Ok(())
    }
}
