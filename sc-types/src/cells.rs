use anyhow::{bail, Error};
use serde::Serialize;

/// Per-cell metadata. Optional columns are filled in by later stages and are
/// subset together with the mandatory ones.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CellTable {
    pub barcodes: Vec<String>,
    pub sum: Vec<f64>,
    pub detected: Vec<f64>,
    pub mito_percent: Vec<f64>,
    pub discard: Option<Vec<bool>>,
    pub size_factor: Option<Vec<f64>>,
    pub cluster: Option<Vec<usize>>,
    pub label: Option<Vec<String>>,
}

impl CellTable {
    /// A table holding only barcodes; QC columns are zero until computed.
    pub fn with_barcodes(barcodes: Vec<String>) -> CellTable {
        let n = barcodes.len();
        CellTable {
            barcodes,
            sum: vec![0.0; n],
            detected: vec![0.0; n],
            mito_percent: vec![0.0; n],
            ..CellTable::default()
        }
    }

    pub fn len(&self) -> usize {
        self.barcodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.barcodes.is_empty()
    }

    /// Check that every populated column has one entry per barcode
    pub fn validate(&self) -> Result<(), Error> {
        let n = self.len();
        let lens = [
            ("sum", Some(self.sum.len())),
            ("detected", Some(self.detected.len())),
            ("mito_percent", Some(self.mito_percent.len())),
            ("discard", self.discard.as_ref().map(Vec::len)),
            ("size_factor", self.size_factor.as_ref().map(Vec::len)),
            ("cluster", self.cluster.as_ref().map(Vec::len)),
            ("label", self.label.as_ref().map(Vec::len)),
        ];
        for (name, len) in lens {
            if let Some(len) = len {
                if len != n {
                    bail!("cell column {} has {} entries for {} cells", name, len, n);
                }
            }
        }
        Ok(())
    }

    /// Keep the cells at `idx`, in that order, in every column
    pub fn select(&self, idx: &[usize]) -> CellTable {
        fn pick<T: Clone>(v: &[T], idx: &[usize]) -> Vec<T> {
            idx.iter().map(|&i| v[i].clone()).collect()
        }
        CellTable {
            barcodes: pick(&self.barcodes, idx),
            sum: pick(&self.sum, idx),
            detected: pick(&self.detected, idx),
            mito_percent: pick(&self.mito_percent, idx),
            discard: self.discard.as_deref().map(|v| pick(v, idx)),
            size_factor: self.size_factor.as_deref().map(|v| pick(v, idx)),
            cluster: self.cluster.as_deref().map(|v| pick(v, idx)),
            label: self.label.as_deref().map(|v| pick(v, idx)),
        }
    }
}
