use anyhow::{bail, Error};
use sprs::{CsMat, TriMat};

/// Sparse genes x cells UMI counts, stored CSC so each outer vector is one cell.
pub type Counts = CsMat<u32>;

/// Sparse genes x cells log-expression values, same layout as `Counts`.
pub type LogCounts = CsMat<f64>;

/// Per-gene annotation attached to the rows of a `CountMatrix`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GeneTable {
    /// Technical identifiers with any version suffix removed
    pub ids: Vec<String>,
    /// Human-readable symbols, unique within the table
    pub symbols: Vec<String>,
    /// True for mitochondrially-encoded genes
    pub is_mito: Vec<bool>,
}

impl GeneTable {
    /// Build a gene table, tagging genes whose symbol starts with `mito_prefix`
    /// (case-insensitive) as mitochondrial.
    pub fn new(ids: Vec<String>, symbols: Vec<String>, mito_prefix: &str) -> Result<GeneTable, Error> {
        if ids.len() != symbols.len() {
            bail!("{} gene ids but {} gene symbols", ids.len(), symbols.len());
        }
        let prefix = mito_prefix.to_ascii_uppercase();
        let is_mito = symbols
            .iter()
            .map(|s| !prefix.is_empty() && s.to_ascii_uppercase().starts_with(&prefix))
            .collect();
        Ok(GeneTable { ids, symbols, is_mito })
    }

    /// Number of genes
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True if the table has no genes
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Index of the gene with the given symbol
    pub fn position(&self, symbol: &str) -> Option<usize> {
        self.symbols.iter().position(|s| s == symbol)
    }

    /// Indices of the mitochondrial genes
    pub fn mito_indices(&self) -> Vec<usize> {
        self.is_mito
            .iter()
            .enumerate()
            .filter_map(|(i, &m)| if m { Some(i) } else { None })
            .collect()
    }
}

/// A genes x cells UMI count matrix with its row and column keys.
#[derive(Clone, Debug)]
pub struct CountMatrix {
    pub genes: GeneTable,
    pub barcodes: Vec<String>,
    pub matrix: Counts,
}

impl CountMatrix {
    /// Bundle a matrix with its keys. The matrix is converted to CSC if needed.
    pub fn new(genes: GeneTable, barcodes: Vec<String>, matrix: Counts) -> Result<CountMatrix, Error> {
        if matrix.rows() != genes.len() {
            bail!("matrix has {} rows but {} genes were supplied", matrix.rows(), genes.len());
        }
        if matrix.cols() != barcodes.len() {
            bail!(
                "matrix has {} columns but {} barcodes were supplied",
                matrix.cols(),
                barcodes.len()
            );
        }
        let matrix = if matrix.is_csc() { matrix } else { matrix.to_csc() };
        Ok(CountMatrix {
            genes,
            barcodes,
            matrix,
        })
    }

    /// Build from a dense genes x cells array. Mostly useful for tests.
    pub fn from_dense(genes: GeneTable, barcodes: Vec<String>, dense: &ndarray::Array2<u32>) -> Result<CountMatrix, Error> {
        let mut tri = TriMat::new(dense.dim());
        for ((r, c), &v) in dense.indexed_iter() {
            if v > 0 {
                tri.add_triplet(r, c, v);
            }
        }
        CountMatrix::new(genes, barcodes, tri.to_csc())
    }

    pub fn n_genes(&self) -> usize {
        self.matrix.rows()
    }

    pub fn n_cells(&self) -> usize {
        self.matrix.cols()
    }

    /// Total UMI count of each cell
    pub fn col_sums(&self) -> Vec<f64> {
        self.matrix
            .outer_iterator()
            .map(|col| col.iter().map(|(_, &v)| v as f64).sum())
            .collect()
    }

    /// Number of genes with a nonzero count in each cell
    pub fn detected(&self) -> Vec<f64> {
        self.matrix
            .outer_iterator()
            .map(|col| col.iter().filter(|&(_, &v)| v > 0).count() as f64)
            .collect()
    }

    /// Total UMI count of each gene
    pub fn row_sums(&self) -> Vec<f64> {
        let mut sums = vec![0.0; self.n_genes()];
        for col in self.matrix.outer_iterator() {
            for (g, &v) in col.iter() {
                sums[g] += v as f64;
            }
        }
        sums
    }

    /// Keep the cells at `idx`, in that order
    pub fn select_cells(&self, idx: &[usize]) -> CountMatrix {
        CountMatrix {
            genes: self.genes.clone(),
            barcodes: idx.iter().map(|&i| self.barcodes[i].clone()).collect(),
            matrix: select_cols(&self.matrix, idx),
        }
    }
}

/// Select columns of a CSC matrix, in the order given by `idx`.
pub fn select_cols<N: Clone>(mat: &CsMat<N>, idx: &[usize]) -> CsMat<N> {
    assert!(mat.is_csc(), "select_cols requires a CSC matrix");
    let mut indptr = Vec::with_capacity(idx.len() + 1);
    let mut indices = Vec::new();
    let mut data = Vec::new();
    indptr.push(0);
    for &c in idx {
        if let Some(col) = mat.outer_view(c) {
            for (r, v) in col.iter() {
                indices.push(r);
                data.push(v.clone());
            }
        }
        indptr.push(indices.len());
    }
    CsMat::new_csc((mat.rows(), idx.len()), indptr, indices, data)
}

/// Select rows of a CSC matrix, in the order given by `idx`.
pub fn select_rows<N: Clone>(mat: &CsMat<N>, idx: &[usize]) -> CsMat<N> {
    assert!(mat.is_csc(), "select_rows requires a CSC matrix");
    let mut new_row = vec![None; mat.rows()];
    for (i, &r) in idx.iter().enumerate() {
        new_row[r] = Some(i);
    }

    let mut indptr = Vec::with_capacity(mat.cols() + 1);
    let mut indices = Vec::new();
    let mut data = Vec::new();
    let mut buf: Vec<(usize, N)> = Vec::new();
    indptr.push(0);
    for col in mat.outer_iterator() {
        buf.clear();
        buf.extend(col.iter().filter_map(|(r, v)| new_row[r].map(|nr| (nr, v.clone()))));
        buf.sort_by_key(|(r, _)| *r);
        for (r, v) in buf.drain(..) {
            indices.push(r);
            data.push(v);
        }
        indptr.push(indices.len());
    }
    CsMat::new_csc((idx.len(), mat.cols()), indptr, indices, data)
}

/// Densify selected rows of a CSC matrix into a cells x rows array.
pub fn dense_cells_by_rows(mat: &CsMat<f64>, rows: &[usize]) -> ndarray::Array2<f64> {
    let mut lookup = vec![None; mat.rows()];
    for (i, &r) in rows.iter().enumerate() {
        lookup[r] = Some(i);
    }
    let mut out = ndarray::Array2::zeros((mat.cols(), rows.len()));
    for (c, col) in mat.outer_iterator().enumerate() {
        for (r, &v) in col.iter() {
            if let Some(j) = lookup[r] {
                out[(c, j)] = v;
            }
        }
    }
    out
}
