use crate::cells::CellTable;
use crate::matrix::{select_cols, CountMatrix, LogCounts};
use crate::reduced::{Pca, VisualEmbedding};
use anyhow::{bail, Error};

/// The analysis session record: counts plus everything attached to their rows
/// and columns. Every per-cell attachment is subset through `select_cells`, so
/// they can never fall out of step with the count matrix.
#[derive(Clone, Debug)]
pub struct Experiment {
    pub counts: CountMatrix,
    pub cells: CellTable,
    pub logcounts: Option<LogCounts>,
    pub pca: Option<Pca>,
    pub embeddings: Vec<VisualEmbedding>,
}

impl Experiment {
    pub fn new(counts: CountMatrix) -> Experiment {
        let cells = CellTable::with_barcodes(counts.barcodes.clone());
        Experiment {
            counts,
            cells,
            logcounts: None,
            pca: None,
            embeddings: Vec::new(),
        }
    }

    pub fn n_cells(&self) -> usize {
        self.counts.n_cells()
    }

    pub fn n_genes(&self) -> usize {
        self.counts.n_genes()
    }

    /// Verify that all attachments agree with the count matrix on cell and gene keys
    pub fn validate(&self) -> Result<(), Error> {
        let n = self.n_cells();
        self.cells.validate()?;
        if self.cells.barcodes != self.counts.barcodes {
            bail!("cell table barcodes are out of step with the count matrix");
        }
        if let Some(lc) = &self.logcounts {
            if lc.cols() != n || lc.rows() != self.n_genes() {
                bail!(
                    "logcounts shape {:?} does not match counts {:?}",
                    (lc.rows(), lc.cols()),
                    (self.n_genes(), n)
                );
            }
        }
        if let Some(pca) = &self.pca {
            if pca.n_cells() != n {
                bail!("PCA has {} cells, expected {}", pca.n_cells(), n);
            }
        }
        for e in &self.embeddings {
            if e.coords.nrows() != n {
                bail!("{} embedding has {} cells, expected {}", e.kind.name(), e.coords.nrows(), n);
            }
        }
        Ok(())
    }

    /// Keep the cells at `idx`, in that order, across every attachment
    pub fn select_cells(&self, idx: &[usize]) -> Experiment {
        Experiment {
            counts: self.counts.select_cells(idx),
            cells: self.cells.select(idx),
            logcounts: self.logcounts.as_ref().map(|m| select_cols(m, idx)),
            pca: self.pca.as_ref().map(|p| p.select_cells(idx)),
            embeddings: self.embeddings.iter().map(|e| e.select_cells(idx)).collect(),
        }
    }

    /// Keep cells whose `keep` flag is set
    pub fn retain_cells(&self, keep: &[bool]) -> Result<Experiment, Error> {
        if keep.len() != self.n_cells() {
            bail!("{} keep flags for {} cells", keep.len(), self.n_cells());
        }
        let idx: Vec<usize> = keep
            .iter()
            .enumerate()
            .filter_map(|(i, &k)| if k { Some(i) } else { None })
            .collect();
        Ok(self.select_cells(&idx))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::matrix::GeneTable;
    use crate::reduced::EmbeddingKind;
    use ndarray::{array, Array2};

    fn exp() -> Experiment {
        let genes = GeneTable::new(
            vec!["A".into(), "B".into()],
            vec!["A".into(), "MT-B".into()],
            "MT-",
        )
        .unwrap();
        let dense: Array2<u32> = array![[1, 2, 3], [4, 0, 6]];
        let counts = CountMatrix::from_dense(genes, vec!["c0".into(), "c1".into(), "c2".into()], &dense).unwrap();
        let mut e = Experiment::new(counts);
        e.cells.sum = e.counts.col_sums();
        e.cells.size_factor = Some(vec![0.5, 1.0, 1.5]);
        e.embeddings.push(VisualEmbedding {
            kind: EmbeddingKind::Umap,
            coords: array![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]],
        });
        e
    }

    #[test]
    fn test_retain_cells_consistent() {
        let e = exp();
        let r = e.retain_cells(&[true, false, true]).unwrap();
        r.validate().unwrap();
        assert_eq!(r.cells.barcodes, vec!["c0", "c2"]);
        assert_eq!(r.counts.barcodes, vec!["c0", "c2"]);
        assert_eq!(r.cells.sum, vec![5.0, 9.0]);
        assert_eq!(r.cells.size_factor, Some(vec![0.5, 1.5]));
        assert_eq!(r.embeddings[0].coords, array![[0.0, 0.0], [2.0, 2.0]]);
    }

    #[test]
    fn test_retain_bad_length() {
        assert!(exp().retain_cells(&[true]).is_err());
    }
}
