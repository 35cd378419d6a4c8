use anyhow::{bail, Error};
use ndarray::Array2;
use std::collections::BTreeMap;

/// A labelled bulk or pseudo-bulk expression reference. It is only ever read.
#[derive(Clone, Debug)]
pub struct ReferenceAtlas {
    /// gene symbols, one per row of `logcounts`
    pub genes: Vec<String>,
    /// sample names, one per column of `logcounts`
    pub samples: Vec<String>,
    /// cell type label of each sample
    pub labels: Vec<String>,
    /// genes x samples log-expression
    pub logcounts: Array2<f64>,
}

impl ReferenceAtlas {
    pub fn new(
        genes: Vec<String>,
        samples: Vec<String>,
        labels: Vec<String>,
        logcounts: Array2<f64>,
    ) -> Result<ReferenceAtlas, Error> {
        if logcounts.nrows() != genes.len() {
            bail!("reference has {} rows but {} genes", logcounts.nrows(), genes.len());
        }
        if logcounts.ncols() != samples.len() || samples.len() != labels.len() {
            bail!(
                "reference has {} columns, {} samples and {} labels",
                logcounts.ncols(),
                samples.len(),
                labels.len()
            );
        }
        if samples.is_empty() {
            bail!("reference has no samples");
        }
        Ok(ReferenceAtlas {
            genes,
            samples,
            labels,
            logcounts,
        })
    }

    /// Distinct labels in sorted order
    pub fn label_names(&self) -> Vec<String> {
        self.samples_by_label().into_keys().collect()
    }

    /// Sample column indices grouped by label, labels sorted
    pub fn samples_by_label(&self) -> BTreeMap<String, Vec<usize>> {
        let mut out: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, l) in self.labels.iter().enumerate() {
            out.entry(l.clone()).or_default().push(i);
        }
        out
    }
}
