use crate::stats::{median, pearson};
use anyhow::{bail, Error};
use log::info;
use sc_types::{CountMatrix, Counts, LogCounts};
use serde::{Deserialize, Serialize};
use sprs::CsMat;
use std::str::FromStr;

/// Pooling-based size factors
pub mod deconvolution;

pub use deconvolution::{compute_sum_factors, quick_cluster, DeconvolutionParams};

/// Size factor estimator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationMethod {
    /// Library size scaled to unit mean
    LibrarySize,
    /// Pooled deconvolution within quick clusters
    Deconvolution,
}

impl FromStr for NormalizationMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "library_size" => Ok(NormalizationMethod::LibrarySize),
            "deconvolution" => Ok(NormalizationMethod::Deconvolution),
            _ => bail!("Normalization not recognized: {}", s),
        }
    }
}

/// Rescale `factors` in place to have unit mean
pub fn centre_size_factors(factors: &mut [f64]) -> Result<(), Error> {
    let mean = factors.iter().sum::<f64>() / factors.len().max(1) as f64;
    if !(mean > 0.0) {
        bail!("size factors have non-positive mean {}", mean);
    }
    factors.iter_mut().for_each(|f| *f /= mean);
    Ok(())
}

/// Library size factors: each cell's total count divided by the mean total.
pub fn library_size_factors(counts: &CountMatrix) -> Result<Vec<f64>, Error> {
    if counts.n_cells() == 0 {
        bail!("cannot compute size factors without cells");
    }
    let mut sf = counts.col_sums();
    centre_size_factors(&mut sf)?;
    Ok(sf)
}

/// Log-normalize a count matrix: `log2(count / sf + pseudo_count)`, shifted by
/// `log2(pseudo_count)` so that zero counts stay zero and the result keeps the
/// sparsity of the input.
pub fn log_normalize_counts(counts: &Counts, size_factors: &[f64], pseudo_count: f64) -> Result<LogCounts, Error> {
    if size_factors.len() != counts.cols() {
        bail!("{} size factors for {} cells", size_factors.len(), counts.cols());
    }
    if !(pseudo_count > 0.0) {
        bail!("pseudo-count must be positive, got {}", pseudo_count);
    }
    if let Some(i) = size_factors.iter().position(|&s| !(s > 0.0)) {
        bail!("cell {} has non-positive size factor {}", i, size_factors[i]);
    }
    let offset = pseudo_count.log2();
    let owned;
    let csc = if counts.is_csc() {
        counts.view()
    } else {
        owned = counts.to_csc();
        owned.view()
    };

    let mut indptr = Vec::with_capacity(csc.cols() + 1);
    let mut indices = Vec::with_capacity(csc.nnz());
    let mut data = Vec::with_capacity(csc.nnz());
    indptr.push(0);
    for (cell, col) in csc.outer_iterator().enumerate() {
        let sf = size_factors[cell];
        for (g, &v) in col.iter() {
            if v > 0 {
                indices.push(g);
                data.push((v as f64 / sf + pseudo_count).log2() - offset);
            }
        }
        indptr.push(indices.len());
    }
    Ok(CsMat::new_csc((csc.rows(), csc.cols()), indptr, indices, data))
}

/// A count matrix with its size factors and log-expression values.
/// Variance modelling and PCA only accept this type.
#[derive(Clone, Debug)]
pub struct Normalized {
    pub counts: CountMatrix,
    pub size_factors: Vec<f64>,
    pub logcounts: LogCounts,
}

impl Normalized {
    pub fn new(counts: CountMatrix, size_factors: Vec<f64>) -> Result<Normalized, Error> {
        let logcounts = log_normalize_counts(&counts.matrix, &size_factors, 1.0)?;
        Ok(Normalized {
            counts,
            size_factors,
            logcounts,
        })
    }

    pub fn n_cells(&self) -> usize {
        self.counts.n_cells()
    }

    pub fn n_genes(&self) -> usize {
        self.counts.n_genes()
    }
}

/// Agreement between two sets of size factors
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SizeFactorComparison {
    /// correlation of the log size factors
    pub log_pearson: f64,
    /// median of `other / library`
    pub median_ratio: f64,
}

/// Compare deconvolution factors against library size factors. Large
/// departures point at composition biases between cell types.
pub fn compare_size_factors(library: &[f64], other: &[f64]) -> Result<SizeFactorComparison, Error> {
    if library.len() != other.len() {
        bail!("{} and {} size factors cannot be compared", library.len(), other.len());
    }
    let pairs: Vec<(f64, f64)> = library
        .iter()
        .zip(other)
        .filter(|(&a, &b)| a > 0.0 && b > 0.0)
        .map(|(&a, &b)| (a, b))
        .collect();
    if pairs.is_empty() {
        bail!("no cells with positive size factors to compare");
    }
    let la: Vec<f64> = pairs.iter().map(|p| p.0.ln()).collect();
    let lb: Vec<f64> = pairs.iter().map(|p| p.1.ln()).collect();
    let ratios: Vec<f64> = pairs.iter().map(|p| p.1 / p.0).collect();
    let cmp = SizeFactorComparison {
        log_pearson: pearson(&la, &lb),
        median_ratio: median(&ratios).unwrap_or(f64::NAN),
    };
    info!(
        "size factors vs library size: log correlation {:.3}, median ratio {:.3}",
        cmp.log_pearson, cmp.median_ratio
    );
    Ok(cmp)
}

/// Size factors from the chosen estimator. Deconvolution clusters the cells
/// first with a seeded quick clustering.
pub fn compute_size_factors(
    counts: &CountMatrix,
    method: NormalizationMethod,
    params: &DeconvolutionParams,
    seed: u64,
) -> Result<Vec<f64>, Error> {
    match method {
        NormalizationMethod::LibrarySize => library_size_factors(counts),
        NormalizationMethod::Deconvolution => {
            let clusters = if params.cluster {
                quick_cluster(counts, params, seed)?
            } else {
                vec![0; counts.n_cells()]
            };
            compute_sum_factors(counts, &clusters, params)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use ndarray::array;
    use sc_types::GeneTable;

    fn counts() -> CountMatrix {
        let genes = GeneTable::new(
            vec!["G1".into(), "G2".into()],
            vec!["A".into(), "B".into()],
            "MT-",
        )
        .unwrap();
        let dense = array![[1, 4, 0], [1, 4, 6]];
        CountMatrix::from_dense(genes, vec!["a".into(), "b".into(), "c".into()], &dense).unwrap()
    }

    #[test]
    fn test_library_size_factors() {
        let sf = library_size_factors(&counts()).unwrap();
        // totals 2, 8, 6 with mean 16/3
        assert_approx_eq!(sf[0], 0.375);
        assert_approx_eq!(sf[1], 1.5);
        assert_approx_eq!(sf[2], 1.125);
        assert_approx_eq!(sf.iter().sum::<f64>() / 3.0, 1.0);
    }

    #[test]
    fn test_log_normalize() {
        let c = counts();
        let lc = log_normalize_counts(&c.matrix, &[0.5, 2.0, 1.0], 1.0).unwrap();
        assert_eq!(lc.nnz(), c.matrix.nnz());
        assert_approx_eq!(*lc.get(0, 0).unwrap(), 3f64.log2());
        assert_approx_eq!(*lc.get(1, 1).unwrap(), 3f64.log2());
        assert_approx_eq!(*lc.get(1, 2).unwrap(), 7f64.log2());
        assert_eq!(lc.get(0, 2), None);
        assert!(log_normalize_counts(&c.matrix, &[1.0, 0.0, 1.0], 1.0).is_err());
        assert!(log_normalize_counts(&c.matrix, &[1.0], 1.0).is_err());
    }

    #[test]
    fn test_compare_identical() {
        let sf = [0.5, 1.0, 1.5, 2.0];
        let cmp = compare_size_factors(&sf, &sf).unwrap();
        assert_approx_eq!(cmp.log_pearson, 1.0);
        assert_approx_eq!(cmp.median_ratio, 1.0);
    }
}
