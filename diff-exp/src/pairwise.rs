//! Pairwise comparisons of every cluster against every other cluster.

use crate::dist::{binom_upper, detection_log2_ratio, welch_t_upper, wilcox_upper, Moments};
use anyhow::{bail, Error};
use log::info;
use ndarray::{Array2, Array3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sprs::CsMat;
use std::fmt;
use std::str::FromStr;

/// Statistical test used for the pairwise comparisons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerTest {
    /// Welch t-test on log-expression; effect is the log-fold change
    T,
    /// Wilcoxon rank-sum test; effect is the AUC
    Wilcox,
    /// Binomial test on the proportion of expressing cells; effect is the log2 ratio of proportions
    Binom,
}

impl MarkerTest {
    pub const ALL: [MarkerTest; 3] = [MarkerTest::T, MarkerTest::Wilcox, MarkerTest::Binom];

    pub fn name(&self) -> &'static str {
        match self {
            MarkerTest::T => "t",
            MarkerTest::Wilcox => "wilcox",
            MarkerTest::Binom => "binom",
        }
    }
}

impl fmt::Display for MarkerTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MarkerTest {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "t" => MarkerTest::T,
            "wilcox" => MarkerTest::Wilcox,
            "binom" => MarkerTest::Binom,
            _ => bail!("unknown marker test {s}, expected one of t, wilcox, binom"),
        })
    }
}

/// Effect sizes and one-sided p-values for every ordered pair of clusters.
/// Entry `[host, target, gene]` tests whether `gene` is up in `host` relative to `target`.
#[derive(Clone, Debug)]
pub struct PairwiseResult {
    pub test: MarkerTest,
    pub group_sizes: Vec<usize>,
    pub effect: Array3<f64>,
    pub pvalue: Array3<f64>,
    /// genes x groups mean log-expression
    pub group_means: Array2<f64>,
    /// genes x groups fraction of cells with nonzero expression
    pub group_detected: Array2<f64>,
}

impl PairwiseResult {
    pub fn n_groups(&self) -> usize {
        self.group_sizes.len()
    }

    pub fn n_genes(&self) -> usize {
        self.group_means.nrows()
    }
}

/// Number of groups in a 0-based labelling, checking that none is empty.
pub fn count_groups(labels: &[usize]) -> Result<Vec<usize>, Error> {
    let n_groups = labels.iter().max().map_or(0, |&m| m + 1);
    let mut sizes = vec![0; n_groups];
    for &l in labels {
        sizes[l] += 1;
    }
    if let Some(empty) = sizes.iter().position(|&s| s == 0) {
        bail!("cluster {} has no cells", empty);
    }
    Ok(sizes)
}

struct GeneResult {
    effect: Vec<f64>,
    pvalue: Vec<f64>,
    means: Vec<f64>,
    detected: Vec<f64>,
}

fn test_gene(values: &[Vec<f64>], test: MarkerTest) -> GeneResult {
    let g = values.len();
    let moments: Vec<Moments> = values.iter().map(|v| Moments::from_values(v)).collect();
    let detected: Vec<usize> = values.iter().map(|v| v.iter().filter(|&&x| x != 0.0).count()).collect();
    let sorted: Vec<Vec<f64>> = if test == MarkerTest::Wilcox {
        values
            .iter()
            .map(|v| {
                let mut s = v.clone();
                s.sort_by(f64::total_cmp);
                s
            })
            .collect()
    } else {
        Vec::new()
    };

    let mut effect = vec![0.0; g * g];
    let mut pvalue = vec![1.0; g * g];
    for h in 0..g {
        for t in 0..g {
            if h == t {
                continue;
            }
            let (e, p) = match test {
                MarkerTest::T => (moments[h].mean - moments[t].mean, welch_t_upper(&moments[h], &moments[t])),
                MarkerTest::Wilcox => wilcox_upper(&sorted[h], &sorted[t]),
                MarkerTest::Binom => (
                    detection_log2_ratio(detected[h], moments[h].n, detected[t], moments[t].n),
                    binom_upper(detected[h], moments[h].n, detected[t], moments[t].n),
                ),
            };
            effect[h * g + t] = e;
            pvalue[h * g + t] = p;
        }
    }
    GeneResult {
        effect,
        pvalue,
        means: moments.iter().map(|m| m.mean).collect(),
        detected: detected.iter().zip(&moments).map(|(&d, m)| d as f64 / m.n as f64).collect(),
    }
}

/// Run `test` between every ordered pair of clusters for every gene.
///
/// `logcounts` is genes x cells (either storage order); `labels` holds a
/// 0-based cluster per cell. Genes are processed in parallel; results do not
/// depend on the thread count.
pub fn pairwise_tests(logcounts: &CsMat<f64>, labels: &[usize], test: MarkerTest) -> Result<PairwiseResult, Error> {
    if labels.len() != logcounts.cols() {
        bail!("{} cluster labels for {} cells", labels.len(), logcounts.cols());
    }
    let group_sizes = count_groups(labels)?;
    if group_sizes.len() < 2 {
        bail!("marker detection needs at least two clusters");
    }
    let g = group_sizes.len();
    let n_genes = logcounts.rows();
    info!(
        "running pairwise {} tests on {} genes across {} clusters",
        test,
        n_genes,
        g
    );

    let by_gene = logcounts.to_csr();
    let results: Vec<GeneResult> = (0..n_genes)
        .into_par_iter()
        .map(|gene| {
            let mut values: Vec<Vec<f64>> = group_sizes.iter().map(|&s| Vec::with_capacity(s)).collect();
            let mut dense = vec![0.0; labels.len()];
            if let Some(row) = by_gene.outer_view(gene) {
                for (cell, &v) in row.iter() {
                    dense[cell] = v;
                }
            }
            for (cell, &v) in dense.iter().enumerate() {
                values[labels[cell]].push(v);
            }
            test_gene(&values, test)
        })
        .collect();

    let mut effect = Array3::zeros((g, g, n_genes));
    let mut pvalue = Array3::ones((g, g, n_genes));
    let mut group_means = Array2::zeros((n_genes, g));
    let mut group_detected = Array2::zeros((n_genes, g));
    for (gene, r) in results.into_iter().enumerate() {
        for h in 0..g {
            for t in 0..g {
                effect[(h, t, gene)] = r.effect[h * g + t];
                pvalue[(h, t, gene)] = r.pvalue[h * g + t];
            }
            group_means[(gene, h)] = r.means[h];
            group_detected[(gene, h)] = r.detected[h];
        }
    }
    Ok(PairwiseResult {
        test,
        group_sizes,
        effect,
        pvalue,
        group_means,
        group_detected,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use sprs::TriMat;

    /// gene 0 is high in cluster 0, gene 1 in cluster 1, gene 2 is flat
    pub(crate) fn three_genes() -> (CsMat<f64>, Vec<usize>) {
        let labels = vec![0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2];
        let mut tri = TriMat::new((3, labels.len()));
        for (cell, &l) in labels.iter().enumerate() {
            let jitter = 0.1 * (cell % 4) as f64;
            tri.add_triplet(0, cell, if l == 0 { 3.0 + jitter } else { jitter });
            tri.add_triplet(1, cell, if l == 1 { 2.5 + jitter } else { 0.2 + jitter });
            tri.add_triplet(2, cell, 1.0 + jitter);
        }
        (tri.to_csc(), labels)
    }

    #[test]
    fn test_pairwise_directions() -> Result<(), Error> {
        let (m, labels) = three_genes();
        for test in MarkerTest::ALL {
            let r = pairwise_tests(&m, &labels, test)?;
            assert_eq!(r.n_groups(), 3);
            assert_eq!(r.n_genes(), 3);
            if test != MarkerTest::Binom {
                assert!(r.pvalue[(0, 1, 0)] < 0.05, "{test}");
                assert!(r.pvalue[(1, 0, 0)] > 0.5, "{test}");
                assert!(r.effect[(0, 1, 0)] > r.effect[(1, 0, 0)]);
            }
            assert!(r.pvalue[(0, 1, 2)] > 0.05, "{test}");
        }
        Ok(())
    }

    #[test]
    fn test_group_summaries() -> Result<(), Error> {
        let (m, labels) = three_genes();
        let r = pairwise_tests(&m, &labels, MarkerTest::T)?;
        assert!((r.group_means[(0, 0)] - 3.15).abs() < 1e-12);
        // cell 8 has a zero for gene 0
        assert!((r.group_detected[(0, 2)] - 0.75).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_bad_labels() {
        let (m, _) = three_genes();
        assert!(pairwise_tests(&m, &[0; 12], MarkerTest::T).is_err());
        assert!(pairwise_tests(&m, &[0, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2], MarkerTest::T).is_err());
        assert!(pairwise_tests(&m, &[0, 1], MarkerTest::T).is_err());
    }
}
