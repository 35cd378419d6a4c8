use anyhow::{bail, format_err, Context, Error};
use flate2::bufread::MultiGzDecoder;
use sprs::{CsMat, TriMat};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Open a text file for buffered reading, transparently decompressing `.gz` files.
pub fn open_text(path: impl AsRef<Path>) -> Result<Box<dyn BufRead>, Error> {
    let path = path.as_ref();
    let file = BufReader::new(File::open(path).with_context(|| path.display().to_string())?);
    if path.extension().is_some_and(|e| e == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(file))
    }
}

/// Read the non-empty lines of a plain or gzipped text file.
pub fn read_lines(path: impl AsRef<Path>) -> Result<Vec<String>, Error> {
    let path = path.as_ref();
    let mut out = Vec::new();
    for line in open_text(path)?.lines() {
        let line = line.with_context(|| path.display().to_string())?;
        let line = line.trim_end();
        if !line.is_empty() {
            out.push(line.to_string());
        }
    }
    Ok(out)
}

/// Load an integer MatrixMarket coordinate file (plain or gzipped) as a CSR matrix
/// with the row/column orientation of the file.
pub fn load_mtx(path: impl AsRef<Path>) -> Result<CsMat<u32>, Error> {
    let path = path.as_ref();
    let reader = open_text(path)?;
    let mut mat: Option<TriMat<u32>> = None;
    let mut expected_nnz = 0;
    let mut seen = 0;

    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| path.display().to_string())?;
        if line.starts_with('%') || line.trim().is_empty() {
            continue;
        }
        let ctx = || format!("{}:{}", path.display(), lineno + 1);
        let mut data = line.split_whitespace();
        match mat.as_mut() {
            None => {
                let nrow = data.next().ok_or_else(|| format_err!("no NROW"))?.parse::<usize>().with_context(ctx)?;
                let ncol = data.next().ok_or_else(|| format_err!("no NCOL"))?.parse::<usize>().with_context(ctx)?;
                let nnz = data.next().ok_or_else(|| format_err!("no NNZ"))?.parse::<usize>().with_context(ctx)?;
                expected_nnz = nnz;
                mat = Some(TriMat::with_capacity((nrow, ncol), nnz));
            }
            Some(m) => {
                let row = data
                    .next()
                    .ok_or_else(|| format_err!("missing ROW"))?
                    .parse::<usize>()
                    .with_context(ctx)?;
                let col = data
                    .next()
                    .ok_or_else(|| format_err!("missing COL"))?
                    .parse::<usize>()
                    .with_context(ctx)?;
                // salmon/alevin write counts as floats
                let val = data
                    .next()
                    .ok_or_else(|| format_err!("missing VAL"))?
                    .parse::<f64>()
                    .with_context(ctx)?;
                if row == 0 || col == 0 || row > m.rows() || col > m.cols() {
                    bail!("{}: entry ({}, {}) outside a {}x{} matrix", ctx(), row, col, m.rows(), m.cols());
                }
                if val < 0.0 {
                    bail!("{}: negative count {}", ctx(), val);
                }
                let val = val.round() as u32;
                if val > 0 {
                    m.add_triplet(row - 1, col - 1, val);
                }
                seen += 1;
            }
        }
    }

    let Some(matrix) = mat else { bail!("no matrix found in {}", path.display()) };
    if seen != expected_nnz {
        bail!(
            "{}: header declares {} entries but {} were read",
            path.display(),
            expected_nnz,
            seen
        );
    }
    Ok(matrix.to_csr())
}
