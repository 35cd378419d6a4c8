//! Per-cell quality control by outlier detection.
//!
//! Each metric is compared against its own distribution across cells: a cell
//! is an outlier when it lies more than `nmads` median absolute deviations
//! from the median, on the side that indicates a damaged or empty droplet.

use crate::normalization::library_size_factors;
use crate::stats::median_mad;
use anyhow::{bail, Error};
use log::{info, warn};
use sc_types::CountMatrix;
use serde::{Deserialize, Serialize};

/// Per-cell QC metrics
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QcMetrics {
    /// total UMI count
    pub sum: Vec<f64>,
    /// number of genes with a nonzero count
    pub detected: Vec<f64>,
    /// percentage of counts from mitochondrial genes
    pub mito_percent: Vec<f64>,
}

impl QcMetrics {
    pub fn len(&self) -> usize {
        self.sum.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sum.is_empty()
    }
}

/// Compute library size, detected genes and mitochondrial percentage for each
/// cell, using the mitochondrial tags of the gene table.
pub fn per_cell_qc_metrics(counts: &CountMatrix) -> QcMetrics {
    let is_mito = &counts.genes.is_mito;
    let mut metrics = QcMetrics::default();
    for col in counts.matrix.outer_iterator() {
        let (mut sum, mut mito, mut detected) = (0.0, 0.0, 0.0);
        for (g, &v) in col.iter() {
            if v == 0 {
                continue;
            }
            sum += v as f64;
            detected += 1.0;
            if is_mito[g] {
                mito += v as f64;
            }
        }
        metrics.sum.push(sum);
        metrics.detected.push(detected);
        metrics.mito_percent.push(if sum > 0.0 { 100.0 * mito / sum } else { 0.0 });
    }
    metrics
}

/// Which side of the distribution counts as an outlier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Lower,
    Higher,
    Both,
}

/// Outlier calls for one metric. Thresholds are in the metric's original scale
/// and are infinite on a side that is not tested.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Outliers {
    #[serde(skip)]
    pub flags: Vec<bool>,
    pub lower: f64,
    pub upper: f64,
}

impl Outliers {
    pub fn count(&self) -> usize {
        self.flags.iter().filter(|&&f| f).count()
    }
}

/// Flag values more than `nmads` MADs from the median. With `log`, the test is
/// done on the natural log; zeros become -inf and are flagged on the lower side.
pub fn is_outlier(values: &[f64], nmads: f64, direction: Direction, log: bool) -> Result<Outliers, Error> {
    if values.is_empty() {
        bail!("no values to test for outliers");
    }
    let transformed: Vec<f64> = if log {
        values.iter().map(|&v| if v > 0.0 { v.ln() } else { f64::NEG_INFINITY }).collect()
    } else {
        values.to_vec()
    };
    let finite: Vec<f64> = transformed.iter().copied().filter(|v| v.is_finite()).collect();
    let Some((center, mad)) = median_mad(&finite) else {
        bail!("no finite values to test for outliers");
    };

    let (mut lower, mut upper) = (f64::NEG_INFINITY, f64::INFINITY);
    if direction != Direction::Higher {
        lower = center - nmads * mad;
    }
    if direction != Direction::Lower {
        upper = center + nmads * mad;
    }
    let flags = transformed.iter().map(|&v| v < lower || v > upper).collect();
    let back = |t: f64| if log { t.exp() } else { t };
    Ok(Outliers {
        flags,
        lower: back(lower),
        upper: back(upper),
    })
}

/// Thresholds applied by the QC filter, in the metrics' original scale
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct QcThresholds {
    pub lib_size_lower: f64,
    pub lib_size_upper: f64,
    pub n_features_lower: f64,
    pub mito_percent_upper: f64,
}

/// Outcome of the QC filter. The per-reason flags are kept for reporting;
/// `discard` is their union.
#[derive(Clone, Debug)]
pub struct QcFilter {
    pub low_lib_size: Vec<bool>,
    pub high_lib_size: Vec<bool>,
    pub low_n_features: Vec<bool>,
    pub high_mito_percent: Vec<bool>,
    pub discard: Vec<bool>,
    pub thresholds: QcThresholds,
}

/// Number of cells flagged for each reason
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QcCounts {
    pub low_lib_size: usize,
    pub high_lib_size: usize,
    pub low_n_features: usize,
    pub high_mito_percent: usize,
    pub discard: usize,
}

fn count(flags: &[bool]) -> usize {
    flags.iter().filter(|&&f| f).count()
}

impl QcFilter {
    pub fn counts(&self) -> QcCounts {
        QcCounts {
            low_lib_size: count(&self.low_lib_size),
            high_lib_size: count(&self.high_lib_size),
            low_n_features: count(&self.low_n_features),
            high_mito_percent: count(&self.high_mito_percent),
            discard: count(&self.discard),
        }
    }

    /// Flags of the cells to keep
    pub fn keep(&self) -> Vec<bool> {
        self.discard.iter().map(|&d| !d).collect()
    }
}

/// Apply the standard outlier rules: library size is tested on both sides of
/// the log scale, detected genes on the low side of the log scale and the
/// mitochondrial percentage on the high side of the linear scale.
pub fn quick_per_cell_qc(metrics: &QcMetrics, nmads: f64) -> Result<QcFilter, Error> {
    let lib = is_outlier(&metrics.sum, nmads, Direction::Both, true)?;
    let feat = is_outlier(&metrics.detected, nmads, Direction::Lower, true)?;
    let mito = is_outlier(&metrics.mito_percent, nmads, Direction::Higher, false)?;

    let low_lib_size: Vec<bool> = metrics.sum.iter().map(|&v| v < lib.lower).collect();
    let high_lib_size: Vec<bool> = metrics.sum.iter().map(|&v| v > lib.upper).collect();
    let discard: Vec<bool> = (0..metrics.len())
        .map(|i| lib.flags[i] || feat.flags[i] || mito.flags[i])
        .collect();

    let filter = QcFilter {
        low_lib_size,
        high_lib_size,
        low_n_features: feat.flags,
        high_mito_percent: mito.flags,
        discard,
        thresholds: QcThresholds {
            lib_size_lower: lib.lower,
            lib_size_upper: lib.upper,
            n_features_lower: feat.lower,
            mito_percent_upper: mito.upper,
        },
    };
    let c = filter.counts();
    info!(
        "QC flagged {} of {} cells: {} low and {} high library size, {} low detected, {} high mito",
        c.discard,
        metrics.len(),
        c.low_lib_size,
        c.high_lib_size,
        c.low_n_features,
        c.high_mito_percent
    );
    if c.discard == metrics.len() {
        warn!("every cell failed QC");
    }
    Ok(filter)
}

/// One gene's average expression in discarded and retained cells
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DiscardRow {
    pub gene: usize,
    pub symbol: String,
    pub lost: f64,
    pub retained: f64,
    pub log_fc: f64,
}

/// Genes enriched in the discarded cells, best first. An enrichment of
/// cell-type markers suggests a whole population is being filtered out.
pub fn compare_discarded(counts: &CountMatrix, discard: &[bool]) -> Result<Vec<DiscardRow>, Error> {
    if discard.len() != counts.n_cells() {
        bail!("{} discard flags for {} cells", discard.len(), counts.n_cells());
    }
    let n_lost = count(discard);
    if n_lost == 0 || n_lost == discard.len() {
        return Ok(Vec::new());
    }

    let sf = library_size_factors(counts)?;
    let n_genes = counts.n_genes();
    let mut lost = vec![0.0; n_genes];
    let mut retained = vec![0.0; n_genes];
    for (cell, col) in counts.matrix.outer_iterator().enumerate() {
        if sf[cell] <= 0.0 {
            continue;
        }
        let acc = if discard[cell] { &mut lost } else { &mut retained };
        for (g, &v) in col.iter() {
            acc[g] += v as f64 / sf[cell];
        }
    }

    let n_kept = (discard.len() - n_lost) as f64;
    let mut rows: Vec<DiscardRow> = (0..n_genes)
        .map(|gene| {
            let l = lost[gene] / n_lost as f64;
            let r = retained[gene] / n_kept;
            DiscardRow {
                gene,
                symbol: counts.genes.symbols[gene].clone(),
                lost: l,
                retained: r,
                log_fc: ((l + 1.0) / (r + 1.0)).log2(),
            }
        })
        .collect();
    rows.sort_by(|a, b| b.log_fc.total_cmp(&a.log_fc).then_with(|| a.gene.cmp(&b.gene)));
    Ok(rows)
}
