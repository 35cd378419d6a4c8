//! Reference-based cell type annotation by rank correlation.
//!
//! Each cell is compared with every sample of a labelled reference using the
//! Spearman correlation over marker genes, and a label scores the given
//! quantile of its samples' correlations. Labels whose scores are close to the
//! best are then compared again on the markers between them alone, until one
//! label is left or the candidates stop changing.

use crate::qc::{is_outlier, Direction};
use crate::stats::{average_ranks, median, pearson, quantile};
use anyhow::{bail, Error};
use log::{info, warn};
use ndarray::Array2;
use rayon::prelude::*;
use sc_types::matrix::dense_cells_by_rows;
use sc_types::{LogCounts, Partition, ReferenceAtlas};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

/// Annotation settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnnotationParams {
    /// genes x samples log-expression CSV of the reference
    pub reference_expression: Option<PathBuf>,
    /// sample to label CSV of the reference
    pub reference_labels: Option<PathBuf>,
    /// markers per label pair; by default scaled down with the number of labels
    pub de_n: Option<usize>,
    pub fine_tune: bool,
    /// labels within this much of the best score stay candidates
    pub tune_thresh: f64,
    /// quantile of a label's sample correlations used as its score
    pub quantile: f64,
    /// MADs below a label's median delta at which a call is pruned
    pub prune_nmads: f64,
}

impl Default for AnnotationParams {
    fn default() -> Self {
        AnnotationParams {
            reference_expression: None,
            reference_labels: None,
            de_n: None,
            fine_tune: true,
            tune_thresh: 0.05,
            quantile: 0.8,
            prune_nmads: 3.0,
        }
    }
}

/// Markers per label pair when none is given: 500 for 2 labels, shrinking as
/// the number of labels grows.
pub fn default_de_n(n_labels: usize) -> usize {
    (500.0 * (2.0f64 / 3.0).powf((n_labels.max(1) as f64).log2())).round() as usize
}

/// Reference restricted to the genes shared with the test data, with the
/// markers of each label pair
#[derive(Clone, Debug)]
pub struct TrainedReference {
    pub label_names: Vec<String>,
    /// row of each marker gene in the test matrix, ordered as in the reference
    test_rows: Vec<usize>,
    /// marker genes x samples
    expression: Array2<f64>,
    /// samples of each label
    by_label: Vec<Vec<usize>>,
    /// `markers[a][b]`: positions in `test_rows` of genes higher in `a` than in `b`
    markers: Vec<Vec<Vec<usize>>>,
}

impl TrainedReference {
    pub fn n_labels(&self) -> usize {
        self.label_names.len()
    }

    pub fn n_markers(&self) -> usize {
        self.test_rows.len()
    }

    /// Sorted union of the markers between all pairs of `labels`
    fn markers_between(&self, labels: &[usize]) -> Vec<usize> {
        let mut genes = BTreeSet::new();
        for &a in labels {
            for &b in labels {
                if a != b {
                    genes.extend(self.markers[a][b].iter().copied());
                }
            }
        }
        genes.into_iter().collect()
    }
}

/// Median profiles per label, and for each ordered label pair the `de_n`
/// genes with the largest positive difference of medians.
pub fn train_single_r(reference: &ReferenceAtlas, test_genes: &[String], de_n: Option<usize>) -> Result<TrainedReference, Error> {
    let lookup: HashMap<&str, usize> = test_genes.iter().enumerate().rev().map(|(i, g)| (g.as_str(), i)).collect();
    let mut seen = BTreeSet::new();
    let common: Vec<(usize, usize)> = reference
        .genes
        .iter()
        .enumerate()
        .filter_map(|(r, g)| lookup.get(g.as_str()).map(|&t| (r, t)))
        .filter(|&(_, t)| seen.insert(t))
        .collect();
    if common.is_empty() {
        bail!("no genes in common between the reference and the data");
    }
    info!("{} of {} reference genes found in the data", common.len(), reference.genes.len());

    let groups = reference.samples_by_label();
    if groups.len() < 2 {
        bail!("the reference needs at least 2 labels, found {}", groups.len());
    }
    let label_names: Vec<String> = groups.keys().cloned().collect();
    let by_label: Vec<Vec<usize>> = groups.into_values().collect();
    let de_n = de_n.unwrap_or_else(|| default_de_n(label_names.len()));

    // labels x common genes
    let medians = Array2::from_shape_fn((by_label.len(), common.len()), |(l, c)| {
        let values: Vec<f64> = by_label[l].iter().map(|&s| reference.logcounts[(common[c].0, s)]).collect();
        median(&values).unwrap_or(0.0)
    });

    let n_labels = label_names.len();
    let mut pair_markers = vec![vec![Vec::new(); n_labels]; n_labels];
    for a in 0..n_labels {
        for b in 0..n_labels {
            if a == b {
                continue;
            }
            let mut up: Vec<(usize, f64)> = (0..common.len())
                .map(|c| (c, medians[(a, c)] - medians[(b, c)]))
                .filter(|&(_, d)| d > 0.0)
                .collect();
            up.sort_by(|x, y| y.1.total_cmp(&x.1).then(x.0.cmp(&y.0)));
            up.truncate(de_n);
            pair_markers[a][b] = up.into_iter().map(|(c, _)| c).collect();
        }
    }

    // keep only genes that are markers for some pair, renumbered
    let used: BTreeSet<usize> = pair_markers.iter().flatten().flatten().copied().collect();
    if used.is_empty() {
        bail!("no marker genes separate the reference labels");
    }
    let position: HashMap<usize, usize> = used.iter().enumerate().map(|(p, &c)| (c, p)).collect();
    let markers: Vec<Vec<Vec<usize>>> = pair_markers
        .into_iter()
        .map(|row| row.into_iter().map(|m| m.into_iter().map(|c| position[&c]).collect()).collect())
        .collect();
    let used: Vec<usize> = used.into_iter().collect();
    let test_rows: Vec<usize> = used.iter().map(|&c| common[c].1).collect();
    let expression = Array2::from_shape_fn((used.len(), reference.samples.len()), |(p, s)| {
        reference.logcounts[(common[used[p]].0, s)]
    });
    info!("{} labels, {} marker genes with {} per label pair", n_labels, used.len(), de_n);

    Ok(TrainedReference {
        label_names,
        test_rows,
        expression,
        by_label,
        markers,
    })
}

/// Per-cell annotation
#[derive(Clone, Debug)]
pub struct AnnotationResult {
    pub label_names: Vec<String>,
    /// cells x labels scores from all marker genes
    pub scores: Array2<f64>,
    /// best label before fine-tuning
    pub first_labels: Vec<usize>,
    /// final label
    pub labels: Vec<usize>,
    /// score of the final label in the last round of fine-tuning
    pub tuning_scores: Vec<f64>,
    /// calls whose score lead is an outlier for their label
    pub pruned: Vec<bool>,
}

impl AnnotationResult {
    pub fn n_cells(&self) -> usize {
        self.labels.len()
    }

    pub fn label(&self, cell: usize) -> &str {
        &self.label_names[self.labels[cell]]
    }

    /// The final label, unless the call was pruned
    pub fn pruned_label(&self, cell: usize) -> Option<&str> {
        if self.pruned[cell] {
            None
        } else {
            Some(self.label(cell))
        }
    }

    /// Number of cells per final label, in label order
    pub fn label_counts(&self) -> Vec<(String, usize)> {
        let mut counts = vec![0; self.label_names.len()];
        for &l in &self.labels {
            counts[l] += 1;
        }
        self.label_names.iter().cloned().zip(counts).collect()
    }
}

/// Ranks of each sample over a subset of the marker genes
fn ranked_samples(trained: &TrainedReference, genes: &[usize], samples: impl Iterator<Item = usize>) -> HashMap<usize, Vec<f64>> {
    samples
        .map(|s| {
            let values: Vec<f64> = genes.iter().map(|&g| trained.expression[(g, s)]).collect();
            (s, average_ranks(&values))
        })
        .collect()
}

fn label_score(cell_ranks: &[f64], samples: &[usize], ranked: &HashMap<usize, Vec<f64>>, q: f64) -> f64 {
    let cors: Vec<f64> = samples.iter().map(|s| pearson(cell_ranks, &ranked[s])).collect();
    quantile(&cors, q).unwrap_or(f64::NEG_INFINITY)
}

fn argmax(xs: &[f64]) -> usize {
    let mut best = 0;
    for (i, &x) in xs.iter().enumerate() {
        if x > xs[best] {
            best = i;
        }
    }
    best
}

/// Narrow the candidates down to one label. Returns the label and its score
/// in the last round.
fn fine_tune(trained: &TrainedReference, cell: &[f64], scores: &[f64], params: &AnnotationParams) -> (usize, f64) {
    let best = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut candidates: Vec<usize> = (0..scores.len()).filter(|&l| scores[l] >= best - params.tune_thresh).collect();
    let mut current = (argmax(scores), best);

    while candidates.len() > 1 {
        let genes = trained.markers_between(&candidates);
        if genes.len() < 2 {
            break;
        }
        let values: Vec<f64> = genes.iter().map(|&g| cell[g]).collect();
        let cell_ranks = average_ranks(&values);
        let samples = candidates.iter().flat_map(|&l| trained.by_label[l].iter().copied());
        let ranked = ranked_samples(trained, &genes, samples);
        let round: Vec<f64> = candidates
            .iter()
            .map(|&l| label_score(&cell_ranks, &trained.by_label[l], &ranked, params.quantile))
            .collect();

        let top = argmax(&round);
        current = (candidates[top], round[top]);
        let keep: Vec<usize> = candidates
            .iter()
            .zip(&round)
            .filter(|&(_, &s)| s >= round[top] - params.tune_thresh)
            .map(|(&l, _)| l)
            .collect();
        if keep.len() == candidates.len() {
            break;
        }
        candidates = keep;
    }
    current
}

/// Label each cell (column) of a genes x cells log-expression matrix, whose
/// rows are the genes the reference was trained against.
pub fn classify_single_r(trained: &TrainedReference, logcounts: &LogCounts, params: &AnnotationParams) -> Result<AnnotationResult, Error> {
    if let Some(&r) = trained.test_rows.iter().max() {
        if r >= logcounts.rows() {
            bail!("reference was trained on {} or more genes, data has {}", r + 1, logcounts.rows());
        }
    }
    let n_cells = logcounts.cols();
    info!("annotating {} cells against {} labels", n_cells, trained.n_labels());

    // cells x marker genes
    let cells = dense_cells_by_rows(logcounts, &trained.test_rows);
    let all_genes: Vec<usize> = (0..trained.n_markers()).collect();
    let ranked = ranked_samples(trained, &all_genes, 0..trained.expression.ncols());

    let per_cell: Vec<(Vec<f64>, usize, usize, f64)> = (0..n_cells)
        .into_par_iter()
        .map(|c| {
            let cell = cells.row(c).to_vec();
            let cell_ranks = average_ranks(&cell);
            let scores: Vec<f64> = trained
                .by_label
                .iter()
                .map(|samples| label_score(&cell_ranks, samples, &ranked, params.quantile))
                .collect();
            let first = argmax(&scores);
            let (label, tuned) = if params.fine_tune {
                fine_tune(trained, &cell, &scores, params)
            } else {
                (first, scores[first])
            };
            (scores, first, label, tuned)
        })
        .collect();

    let n_labels = trained.n_labels();
    let mut scores = Array2::zeros((n_cells, n_labels));
    let mut first_labels = Vec::with_capacity(n_cells);
    let mut labels = Vec::with_capacity(n_cells);
    let mut tuning_scores = Vec::with_capacity(n_cells);
    for (c, (s, first, label, tuned)) in per_cell.into_iter().enumerate() {
        for (l, v) in s.into_iter().enumerate() {
            scores[(c, l)] = v;
        }
        first_labels.push(first);
        labels.push(label);
        tuning_scores.push(tuned);
    }

    let pruned = prune_scores(&scores, &labels, params.prune_nmads)?;
    let changed = first_labels.iter().zip(&labels).filter(|(a, b)| a != b).count();
    info!(
        "fine-tuning changed {} labels, {} calls pruned",
        changed,
        pruned.iter().filter(|&&p| p).count()
    );

    Ok(AnnotationResult {
        label_names: trained.label_names.clone(),
        scores,
        first_labels,
        labels,
        tuning_scores,
        pruned,
    })
}

/// Flag calls whose lead over the median label score is unusually small for
/// the assigned label.
pub fn prune_scores(scores: &Array2<f64>, labels: &[usize], nmads: f64) -> Result<Vec<bool>, Error> {
    if scores.nrows() != labels.len() {
        bail!("{} score rows for {} labels", scores.nrows(), labels.len());
    }
    let delta: Vec<f64> = scores
        .outer_iter()
        .zip(labels)
        .map(|(row, &l)| row[l] - median(&row.to_vec()).unwrap_or(0.0))
        .collect();

    let mut pruned = vec![false; labels.len()];
    for l in 0..scores.ncols() {
        let members: Vec<usize> = (0..labels.len()).filter(|&c| labels[c] == l).collect();
        if members.is_empty() {
            continue;
        }
        let values: Vec<f64> = members.iter().map(|&c| delta[c]).collect();
        let outliers = is_outlier(&values, nmads, Direction::Lower, false)?;
        for (&c, &flag) in members.iter().zip(&outliers.flags) {
            pruned[c] = flag;
        }
    }
    Ok(pruned)
}

/// Cells of each cluster (rows) carrying each label (columns)
pub fn cluster_label_table(partition: &Partition, result: &AnnotationResult) -> Result<Array2<usize>, Error> {
    if partition.labels.len() != result.n_cells() {
        bail!("{} clustered cells but {} annotated", partition.labels.len(), result.n_cells());
    }
    let mut table = Array2::zeros((partition.n_clusters(), result.label_names.len()));
    for (&cluster, &label) in partition.labels.iter().zip(&result.labels) {
        table[(cluster, label)] += 1;
    }
    for (cluster, row) in table.outer_iter().enumerate() {
        let total: usize = row.sum();
        let top = (0..row.len()).max_by_key(|&l| (row[l], std::cmp::Reverse(l)));
        if let Some(top) = top {
            if total > 0 && row[top] * 2 < total {
                warn!("cluster {} has no majority label", cluster + 1);
            }
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};
    use rand_pcg::Pcg64Mcg;
    use sprs::TriMat;

    const GENES: usize = 30;

    /// Labels A, B and C, each with a block of 10 highly expressed genes
    fn reference() -> ReferenceAtlas {
        let mut rng = Pcg64Mcg::seed_from_u64(1);
        let noise = Normal::new(0.0, 0.3).unwrap();
        let labels: Vec<String> = ["A", "B", "C"].iter().flat_map(|l| vec![l.to_string(); 4]).collect();
        let logcounts = Array2::from_shape_fn((GENES, 12), |(g, s)| {
            let high = g / 10 == s / 4;
            1.0 + if high { 4.0 } else { 0.0 } + noise.sample(&mut rng)
        });
        ReferenceAtlas::new(
            (0..GENES).map(|g| format!("G{g}")).collect(),
            (0..12).map(|s| format!("S{s}")).collect(),
            labels,
            logcounts,
        )
        .unwrap()
    }

    /// Test genes are the reference genes in reverse, plus one unknown gene
    fn test_genes() -> Vec<String> {
        let mut genes: Vec<String> = (0..GENES).rev().map(|g| format!("G{g}")).collect();
        genes.push("EXTRA".to_string());
        genes
    }

    /// Cells of type `truth[c]` in the test gene order; type 3 is an empty cell
    fn cells(truth: &[usize]) -> LogCounts {
        let mut rng = Pcg64Mcg::seed_from_u64(2);
        let noise = Normal::new(0.0, 0.5).unwrap();
        let mut tri = TriMat::new((GENES + 1, truth.len()));
        for (c, &t) in truth.iter().enumerate() {
            if t == 3 {
                continue;
            }
            for row in 0..=GENES {
                let g = GENES - 1 - row.min(GENES - 1);
                let mut v = 1.0 + if g / 10 == t { 4.0 } else { 0.0 } + noise.sample(&mut rng);
                if row == GENES {
                    v = 2.0;
                }
                if v > 0.0 {
                    tri.add_triplet(row, c, v);
                }
            }
        }
        tri.to_csc()
    }

    #[test]
    fn test_default_de_n() {
        assert_eq!(default_de_n(1), 500);
        assert_eq!(default_de_n(2), 333);
        assert_eq!(default_de_n(4), 222);
    }

    #[test]
    fn test_train() -> Result<(), Error> {
        let trained = train_single_r(&reference(), &test_genes(), Some(5))?;
        assert_eq!(trained.label_names, vec!["A", "B", "C"]);
        // A over B: the top 5 come from A's block, genes G0..G9 at test rows 29..20
        let a_over_b: Vec<usize> = trained.markers[0][1].iter().map(|&p| trained.test_rows[p]).collect();
        assert_eq!(a_over_b.len(), 5);
        assert!(a_over_b.iter().all(|&r| (20..30).contains(&r)));
        assert!(trained.test_rows.iter().all(|&r| r < GENES));

        let unrelated = vec!["X".to_string(), "Y".to_string()];
        assert!(train_single_r(&reference(), &unrelated, None).is_err());
        Ok(())
    }

    #[test]
    fn test_classify() -> Result<(), Error> {
        let truth: Vec<usize> = (0..30).map(|c| c % 3).collect();
        let trained = train_single_r(&reference(), &test_genes(), None)?;
        for fine_tune in [false, true] {
            let params = AnnotationParams {
                fine_tune,
                ..AnnotationParams::default()
            };
            let result = classify_single_r(&trained, &cells(&truth), &params)?;
            assert_eq!(result.scores.dim(), (30, 3));
            assert_eq!(result.labels, truth);
            assert_eq!(result.first_labels, truth);
            assert!(result.tuning_scores.iter().all(|s| s.is_finite()));
            assert_eq!(result.label(1), "B");
            assert_eq!(result.label_counts(), vec![("A".to_string(), 10), ("B".to_string(), 10), ("C".to_string(), 10)]);
        }
        Ok(())
    }

    #[test]
    fn test_empty_cell_pruned() -> Result<(), Error> {
        let mut truth: Vec<usize> = (0..30).map(|c| c % 3).collect();
        truth.push(3);
        let trained = train_single_r(&reference(), &test_genes(), None)?;
        let result = classify_single_r(&trained, &cells(&truth), &AnnotationParams::default())?;
        // no signal at all: every label scores the same
        assert!(result.scores.row(30).iter().all(|&s| s == 0.0));
        assert!(result.pruned[30]);
        assert_eq!(result.pruned_label(30), None);
        Ok(())
    }

    #[test]
    fn test_cluster_label_table() -> Result<(), Error> {
        let truth: Vec<usize> = (0..30).map(|c| c % 3).collect();
        let trained = train_single_r(&reference(), &test_genes(), None)?;
        let result = classify_single_r(&trained, &cells(&truth), &AnnotationParams::default())?;
        let partition = Partition::new((0..30).map(|c| usize::from(c % 3 == 0)).collect(), "walktrap", 0.0);
        let table = cluster_label_table(&partition, &result)?;
        // cluster 0 holds types B and C, cluster 1 type A
        assert_eq!(table, ndarray::arr2(&[[0, 10, 10], [10, 0, 0]]));
        Ok(())
    }

    #[test]
    fn test_prune_scores() -> Result<(), Error> {
        let scores = ndarray::arr2(&[[0.9, 0.1, 0.2], [0.8, 0.2, 0.1], [0.85, 0.15, 0.1], [0.3, 0.25, 0.2], [0.1, 0.9, 0.1]]);
        let pruned = prune_scores(&scores, &[0, 0, 0, 0, 1], 3.0)?;
        assert_eq!(pruned, vec![false, false, false, true, false]);
        Ok(())
    }
}
