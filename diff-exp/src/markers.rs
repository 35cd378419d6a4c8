//! Per-cluster marker tables built from pairwise comparisons.
//!
//! A gene is ranked for a cluster by its largest p-value over all the
//! comparisons against the other clusters, so a low combined p-value means the
//! gene is up against every other cluster (an intersection-union test). The
//! summary effect is the smallest pairwise effect for the same reason.

use crate::dist::adjusted_pvalue_bh;
use crate::pairwise::{pairwise_tests, MarkerTest, PairwiseResult};
use anyhow::{bail, Error};
use log::info;
use sprs::CsMat;
use std::cmp::Ordering;

/// One gene's statistics within a cluster's marker table
#[derive(Clone, Debug, PartialEq)]
pub struct MarkerRow {
    pub gene: usize,
    /// combined p-value (maximum over compared clusters)
    pub p_value: f64,
    /// Benjamini-Hochberg adjustment of `p_value` across all genes
    pub fdr: f64,
    /// minimum effect over compared clusters
    pub summary_effect: f64,
    /// 1-based position of this row in the sorted table
    pub rank: usize,
}

/// Ranked genes for one cluster under one test
#[derive(Clone, Debug)]
pub struct MarkerTable {
    pub cluster: usize,
    pub test: MarkerTest,
    /// clusters this one was compared against
    pub targets: Vec<usize>,
    pub rows: Vec<MarkerRow>,
}

impl MarkerTable {
    /// Genes with FDR at or below `fdr_threshold`, best first
    pub fn markers(&self, fdr_threshold: f64) -> Vec<usize> {
        self.rows
            .iter()
            .filter(|r| r.fdr <= fdr_threshold)
            .map(|r| r.gene)
            .collect()
    }

    /// The first `n` genes of the ranking
    pub fn top(&self, n: usize) -> Vec<usize> {
        self.rows.iter().take(n).map(|r| r.gene).collect()
    }
}

/// p ascending, then effect descending, then gene index
fn cmp_rows(a: &MarkerRow, b: &MarkerRow) -> Ordering {
    a.p_value
        .total_cmp(&b.p_value)
        .then_with(|| b.summary_effect.total_cmp(&a.summary_effect))
        .then_with(|| a.gene.cmp(&b.gene))
}

/// Combine the comparisons of `host` against each of `targets`.
pub fn combine_all(pairwise: &PairwiseResult, host: usize, targets: &[usize]) -> Result<MarkerTable, Error> {
    let g = pairwise.n_groups();
    if host >= g {
        bail!("cluster {} out of range for {} clusters", host, g);
    }
    if targets.is_empty() {
        bail!("cluster {} has no other cluster to compare against", host);
    }
    if let Some(&t) = targets.iter().find(|&&t| t >= g || t == host) {
        bail!("invalid comparison cluster {} for cluster {}", t, host);
    }

    let n_genes = pairwise.n_genes();
    let mut pvals = Vec::with_capacity(n_genes);
    let mut effects = Vec::with_capacity(n_genes);
    for gene in 0..n_genes {
        let mut p = f64::NEG_INFINITY;
        let mut e = f64::INFINITY;
        for &t in targets {
            p = p.max(pairwise.pvalue[(host, t, gene)]);
            e = e.min(pairwise.effect[(host, t, gene)]);
        }
        pvals.push(p);
        effects.push(e);
    }
    let fdr = adjusted_pvalue_bh(&pvals);

    let mut rows: Vec<MarkerRow> = (0..n_genes)
        .map(|gene| MarkerRow {
            gene,
            p_value: pvals[gene],
            fdr: fdr[gene],
            summary_effect: effects[gene],
            rank: 0,
        })
        .collect();
    rows.sort_by(cmp_rows);
    for (i, r) in rows.iter_mut().enumerate() {
        r.rank = i + 1;
    }

    Ok(MarkerTable {
        cluster: host,
        test: pairwise.test,
        targets: targets.to_vec(),
        rows,
    })
}

/// Marker tables for every cluster, each compared against all other clusters.
pub fn marker_tables(pairwise: &PairwiseResult) -> Result<Vec<MarkerTable>, Error> {
    let g = pairwise.n_groups();
    (0..g)
        .map(|host| {
            let targets: Vec<usize> = (0..g).filter(|&t| t != host).collect();
            combine_all(pairwise, host, &targets)
        })
        .collect()
}

/// Run `test` and build one marker table per cluster. `fdr_threshold` only
/// sets which genes are counted as markers in the log; tables keep every gene.
pub fn find_markers(
    logcounts: &CsMat<f64>,
    labels: &[usize],
    test: MarkerTest,
    fdr_threshold: f64,
) -> Result<Vec<MarkerTable>, Error> {
    if !(0.0..=1.0).contains(&fdr_threshold) {
        bail!("FDR threshold must be within [0, 1], got {}", fdr_threshold);
    }
    let pairwise = pairwise_tests(logcounts, labels, test)?;
    let tables = marker_tables(&pairwise)?;
    for t in &tables {
        info!(
            "cluster {}: {} {} markers at FDR {}",
            t.cluster + 1,
            t.markers(fdr_threshold).len(),
            test,
            fdr_threshold
        );
    }
    Ok(tables)
}

/// Per-test statistics carried into a consensus row
#[derive(Clone, Debug, PartialEq)]
pub struct TestStats {
    pub test: MarkerTest,
    pub p_value: f64,
    pub fdr: f64,
    pub summary_effect: f64,
    pub rank: usize,
}

/// One gene's consensus over several tests
#[derive(Clone, Debug, PartialEq)]
pub struct ConsensusRow {
    pub gene: usize,
    /// worst (largest) rank across tests
    pub rank: usize,
    /// largest p-value across tests
    pub p_value: f64,
    pub fdr: f64,
    pub per_test: Vec<TestStats>,
}

#[derive(Clone, Debug)]
pub struct ConsensusTable {
    pub cluster: usize,
    pub rows: Vec<ConsensusRow>,
}

impl ConsensusTable {
    pub fn top(&self, n: usize) -> Vec<usize> {
        self.rows.iter().take(n).map(|r| r.gene).collect()
    }

    /// Genes with consensus FDR at or below `fdr_threshold`, in consensus order
    pub fn markers(&self, fdr_threshold: f64) -> Vec<usize> {
        self.rows
            .iter()
            .filter(|r| r.fdr <= fdr_threshold)
            .map(|r| r.gene)
            .collect()
    }
}

/// Merge marker tables from different tests into a consensus ranking per
/// cluster. A gene's consensus rank is its worst rank over the tests, so a
/// high placement requires every test to agree. Ties are broken by the
/// combined p-value and then the gene index.
pub fn multi_marker_stats(per_test: &[Vec<MarkerTable>]) -> Result<Vec<ConsensusTable>, Error> {
    let Some(first) = per_test.first() else { bail!("no marker tables to combine") };
    let n_clusters = first.len();
    if per_test.iter().any(|t| t.len() != n_clusters) {
        bail!("marker tables disagree on the number of clusters");
    }

    let mut out = Vec::with_capacity(n_clusters);
    for c in 0..n_clusters {
        let tables: Vec<&MarkerTable> = per_test.iter().map(|t| &t[c]).collect();
        let n_genes = tables[0].rows.len();
        if tables.iter().any(|t| t.rows.len() != n_genes || t.cluster != tables[0].cluster) {
            bail!("marker tables for cluster {} are not comparable", c);
        }

        let mut by_gene: Vec<Vec<TestStats>> = vec![Vec::with_capacity(tables.len()); n_genes];
        for t in &tables {
            for r in &t.rows {
                by_gene[r.gene].push(TestStats {
                    test: t.test,
                    p_value: r.p_value,
                    fdr: r.fdr,
                    summary_effect: r.summary_effect,
                    rank: r.rank,
                });
            }
        }

        let pvals: Vec<f64> = by_gene
            .iter()
            .map(|s| s.iter().map(|x| x.p_value).fold(f64::NEG_INFINITY, f64::max))
            .collect();
        let fdr = adjusted_pvalue_bh(&pvals);
        let mut rows: Vec<ConsensusRow> = by_gene
            .into_iter()
            .enumerate()
            .map(|(gene, stats)| ConsensusRow {
                gene,
                rank: stats.iter().map(|s| s.rank).max().unwrap_or(0),
                p_value: pvals[gene],
                fdr: fdr[gene],
                per_test: stats,
            })
            .collect();
        rows.sort_by(|a, b| {
            a.rank
                .cmp(&b.rank)
                .then_with(|| a.p_value.total_cmp(&b.p_value))
                .then_with(|| a.gene.cmp(&b.gene))
        });
        out.push(ConsensusTable {
            cluster: tables[0].cluster,
            rows,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Poisson};
    use sprs::TriMat;

    /// 4 clusters x 30 cells, 40 genes; gene k < 4 is up in cluster k only,
    /// gene 4 is up in clusters 0 and 1 together.
    fn simulated() -> (CsMat<f64>, Vec<usize>) {
        let mut rng = rand_pcg::Pcg64Mcg::seed_from_u64(7);
        let labels: Vec<usize> = (0..120).map(|i| i / 30).collect();
        let mut tri = TriMat::new((40, labels.len()));
        for (cell, &l) in labels.iter().enumerate() {
            for gene in 0..40 {
                let rate = if gene == l || (gene == 4 && l < 2) { 12.0 } else { 0.3 };
                let c: f64 = Poisson::new(rate).unwrap().sample(&mut rng);
                if c > 0.0 {
                    tri.add_triplet(gene, cell, (c + 1.0).log2());
                }
            }
        }
        (tri.to_csc(), labels)
    }

    #[test]
    fn test_markers_found() -> Result<(), Error> {
        let (m, labels) = simulated();
        for test in MarkerTest::ALL {
            let tables = find_markers(&m, &labels, test, 0.05)?;
            assert_eq!(tables.len(), 4);
            for t in &tables {
                assert_eq!(t.rows[0].gene, t.cluster, "{test}");
                assert_eq!(t.rows[0].rank, 1);
                let markers = t.markers(0.05);
                // gene 4 is not up against every other cluster
                assert!(!markers.contains(&4), "{test} cluster {}", t.cluster);
            }
        }
        Ok(())
    }

    #[test]
    fn test_threshold_sets_markers() -> Result<(), Error> {
        let (m, labels) = simulated();
        let tables = find_markers(&m, &labels, MarkerTest::Wilcox, 0.05)?;
        for t in &tables {
            let strict = t.markers(1e-6);
            let loose = t.markers(0.05);
            assert!(strict.len() <= loose.len());
            assert!(strict.iter().all(|g| loose.contains(g)));
            assert_eq!(t.markers(1.0).len(), 40);
        }
        assert!(find_markers(&m, &labels, MarkerTest::T, 1.5).is_err());
        assert!(find_markers(&m, &labels, MarkerTest::T, -0.1).is_err());
        Ok(())
    }

    #[test]
    fn test_sorted_by_pvalue() -> Result<(), Error> {
        let (m, labels) = simulated();
        let tables = find_markers(&m, &labels, MarkerTest::T, 0.05)?;
        for t in &tables {
            for w in t.rows.windows(2) {
                assert_ne!(cmp_rows(&w[0], &w[1]), Ordering::Greater);
            }
        }
        Ok(())
    }

    #[test]
    fn test_dropping_a_target_never_loses_markers() -> Result<(), Error> {
        let (m, labels) = simulated();
        for test in MarkerTest::ALL {
            let pw = pairwise_tests(&m, &labels, test)?;
            for host in 0..4 {
                let all: Vec<usize> = (0..4).filter(|&t| t != host).collect();
                let full = combine_all(&pw, host, &all)?.markers(0.05);
                for drop in &all {
                    let fewer: Vec<usize> = all.iter().copied().filter(|t| t != drop).collect();
                    let reduced = combine_all(&pw, host, &fewer)?.markers(0.05);
                    for g in &full {
                        assert!(reduced.contains(g), "{test}: gene {g} lost for cluster {host} without {drop}");
                    }
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_consensus() -> Result<(), Error> {
        let (m, labels) = simulated();
        let per_test = MarkerTest::ALL
            .iter()
            .map(|&t| find_markers(&m, &labels, t, 0.05))
            .collect::<Result<Vec<_>, _>>()?;
        let consensus = multi_marker_stats(&per_test)?;
        assert_eq!(consensus.len(), 4);
        for c in &consensus {
            assert_eq!(c.rows[0].gene, c.cluster);
            assert_eq!(c.rows[0].per_test.len(), 3);
            let r = &c.rows[0];
            assert_eq!(r.rank, r.per_test.iter().map(|s| s.rank).max().unwrap());
            assert!(c.rows.windows(2).all(|w| w[0].rank <= w[1].rank));
        }
        // deterministic
        let again = multi_marker_stats(&per_test)?;
        assert_eq!(consensus[2].rows, again[2].rows);
        Ok(())
    }

    #[test]
    fn test_combine_rejects_bad_targets() -> Result<(), Error> {
        let (m, labels) = simulated();
        let pw = pairwise_tests(&m, &labels, MarkerTest::T)?;
        assert!(combine_all(&pw, 0, &[]).is_err());
        assert!(combine_all(&pw, 0, &[0, 1]).is_err());
        assert!(combine_all(&pw, 0, &[7]).is_err());
        Ok(())
    }
}
