use crate::mtx::{load_mtx, read_lines};
use anyhow::{bail, Error};
use log::info;
use serde::{Deserialize, Serialize};
use sprs::CsMat;
use std::path::{Path, PathBuf};

/// On-disk layout of a quantification output directory
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantLayout {
    /// `matrix.mtx`, `barcodes.tsv`, `features.tsv` (or `genes.tsv`); genes x cells
    TenX,
    /// `quants_mat.mtx`, `quants_mat_rows.txt`, `quants_mat_cols.txt`; cells x genes
    Alevin,
}

/// Raw import of a quantification directory, before symbol mapping
#[derive(Clone, Debug)]
pub struct RawQuant {
    pub gene_ids: Vec<String>,
    /// symbols supplied by the quantifier itself, if any
    pub gene_names: Option<Vec<String>>,
    pub barcodes: Vec<String>,
    /// genes x cells, CSC
    pub matrix: CsMat<u32>,
}

/// Return the first of `names` (optionally with a `.gz` suffix) that exists in `dir`.
fn find_file(dir: &Path, names: &[&str]) -> Option<PathBuf> {
    for name in names {
        for candidate in [dir.join(name), dir.join(format!("{name}.gz"))] {
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

fn require_file(dir: &Path, names: &[&str]) -> Result<PathBuf, Error> {
    match find_file(dir, names) {
        Some(p) => Ok(p),
        None => bail!("none of {:?} found in {}", names, dir.display()),
    }
}

/// Alevin writes into an `alevin/` subdirectory of the salmon output.
fn alevin_dir(dir: &Path) -> PathBuf {
    let sub = dir.join("alevin");
    if sub.is_dir() {
        sub
    } else {
        dir.to_path_buf()
    }
}

impl QuantLayout {
    /// Guess the layout from the files present in `dir`
    pub fn detect(dir: &Path) -> Result<QuantLayout, Error> {
        if find_file(&alevin_dir(dir), &["quants_mat.mtx"]).is_some() {
            Ok(QuantLayout::Alevin)
        } else if find_file(dir, &["matrix.mtx"]).is_some() {
            Ok(QuantLayout::TenX)
        } else {
            bail!("{} does not look like a quantification directory", dir.display())
        }
    }
}

/// Read a quantification directory into a genes x cells matrix with its keys.
pub fn read_quant_dir(dir: impl AsRef<Path>, layout: Option<QuantLayout>) -> Result<RawQuant, Error> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        bail!("quantification directory {} does not exist", dir.display());
    }
    let layout = match layout {
        Some(l) => l,
        None => QuantLayout::detect(dir)?,
    };
    info!("reading {:?} quantification from {}", layout, dir.display());

    let raw = match layout {
        QuantLayout::TenX => {
            let matrix = load_mtx(require_file(dir, &["matrix.mtx"])?)?.to_csc();
            let barcodes = read_lines(require_file(dir, &["barcodes.tsv"])?)?
                .into_iter()
                .map(|l| first_field(&l))
                .collect();
            let features = read_lines(require_file(dir, &["features.tsv", "genes.tsv"])?)?;
            let mut gene_ids = Vec::with_capacity(features.len());
            let mut gene_names = Vec::with_capacity(features.len());
            for line in features {
                let mut fields = line.split('\t');
                let id = fields.next().unwrap_or_default().to_string();
                let name = fields.next().map_or_else(|| id.clone(), str::to_string);
                gene_ids.push(id);
                gene_names.push(name);
            }
            RawQuant {
                gene_ids,
                gene_names: Some(gene_names),
                barcodes,
                matrix,
            }
        }
        QuantLayout::Alevin => {
            let adir = alevin_dir(dir);
            let cells_by_genes = load_mtx(require_file(&adir, &["quants_mat.mtx"])?)?;
            let barcodes = read_lines(require_file(&adir, &["quants_mat_rows.txt"])?)?;
            let gene_ids = read_lines(require_file(&adir, &["quants_mat_cols.txt"])?)?;
            RawQuant {
                gene_ids,
                gene_names: None,
                barcodes,
                // a CSR cells x genes matrix is a CSC genes x cells matrix
                matrix: cells_by_genes.transpose_into(),
            }
        }
    };

    if raw.matrix.rows() != raw.gene_ids.len() {
        bail!(
            "{}: matrix has {} genes but the gene index lists {}",
            dir.display(),
            raw.matrix.rows(),
            raw.gene_ids.len()
        );
    }
    if raw.matrix.cols() != raw.barcodes.len() {
        bail!(
            "{}: matrix has {} cells but the barcode index lists {}",
            dir.display(),
            raw.matrix.cols(),
            raw.barcodes.len()
        );
    }
    info!(
        "loaded {} genes x {} cells with {} nonzero entries",
        raw.matrix.rows(),
        raw.matrix.cols(),
        raw.matrix.nnz()
    );
    Ok(raw)
}

fn first_field(line: &str) -> String {
    line.split('\t').next().unwrap_or_default().to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tenx_layout() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("matrix.mtx"), "%%MatrixMarket\n2 3 3\n1 1 4\n2 2 1\n2 3 9\n")?;
        std::fs::write(dir.path().join("barcodes.tsv"), "AAA-1\nCCC-1\nGGG-1\n")?;
        std::fs::write(
            dir.path().join("features.tsv"),
            "ENSG01.1\tCD3E\tGene Expression\nENSG02.3\tMT-CO1\tGene Expression\n",
        )?;
        assert_eq!(QuantLayout::detect(dir.path())?, QuantLayout::TenX);
        let raw = read_quant_dir(dir.path(), None)?;
        assert_eq!(raw.barcodes, vec!["AAA-1", "CCC-1", "GGG-1"]);
        assert_eq!(raw.gene_ids, vec!["ENSG01.1", "ENSG02.3"]);
        assert_eq!(raw.gene_names.unwrap(), vec!["CD3E", "MT-CO1"]);
        assert!(raw.matrix.is_csc());
        assert_eq!(raw.matrix.get(1, 2), Some(&9));
        Ok(())
    }

    #[test]
    fn test_alevin_layout_is_transposed() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let adir = dir.path().join("alevin");
        std::fs::create_dir(&adir)?;
        // 3 cells x 2 genes
        std::fs::write(adir.join("quants_mat.mtx"), "%%MatrixMarket\n3 2 2\n1 2 3.0\n3 1 2.0\n")?;
        std::fs::write(adir.join("quants_mat_rows.txt"), "AAA\nCCC\nGGG\n")?;
        std::fs::write(adir.join("quants_mat_cols.txt"), "ENSG01.1\nENSG02.1\n")?;
        let raw = read_quant_dir(dir.path(), None)?;
        assert_eq!(raw.matrix.shape(), (2, 3));
        assert!(raw.matrix.is_csc());
        assert_eq!(raw.matrix.get(1, 0), Some(&3));
        assert_eq!(raw.matrix.get(0, 2), Some(&2));
        assert!(raw.gene_names.is_none());
        Ok(())
    }

    #[test]
    fn test_mismatched_index() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("matrix.mtx"), "%%MatrixMarket\n2 3 1\n1 1 4\n")?;
        std::fs::write(dir.path().join("barcodes.tsv"), "AAA-1\nCCC-1\n")?;
        std::fs::write(dir.path().join("genes.tsv"), "G1\tA\nG2\tB\n")?;
        assert!(read_quant_dir(dir.path(), Some(QuantLayout::TenX)).is_err());
        Ok(())
    }

    #[test]
    fn test_missing_dir() {
        assert!(read_quant_dir("/nonexistent/quant", None).is_err());
    }
}
