use anyhow::{bail, Context, Error};
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{Array2, Axis};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Open `path` for writing, gzip-compressed when it ends in `.gz`.
pub fn create_output(path: impl AsRef<Path>) -> Result<Box<dyn Write>, Error> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| path.display().to_string())?;
    if path.extension().is_some_and(|e| e == "gz") {
        Ok(Box::new(BufWriter::new(GzEncoder::new(file, Compression::default()))))
    } else {
        Ok(Box::new(BufWriter::new(file)))
    }
}

/// Write a dense array as CSV. `header` names the columns and `row_names`
/// is written as a leading column when given.
pub fn array_to_csv(
    array: &Array2<f64>,
    header: Option<&[String]>,
    row_names: Option<&[String]>,
    path: impl AsRef<Path>,
) -> Result<(), Error> {
    let path = path.as_ref();
    if let Some(h) = header {
        if h.len() != array.ncols() {
            bail!("{} header names for {} columns", h.len(), array.ncols());
        }
    }
    if let Some(r) = row_names {
        if r.len() != array.nrows() {
            bail!("{} row names for {} rows", r.len(), array.nrows());
        }
    }

    let mut writer = csv::Writer::from_writer(create_output(path)?);
    if let Some(h) = header {
        let mut rec = Vec::with_capacity(h.len() + 1);
        if row_names.is_some() {
            rec.push(String::new());
        }
        rec.extend(h.iter().cloned());
        writer.write_record(&rec)?;
    }
    for (i, row) in array.axis_iter(Axis(0)).enumerate() {
        let mut rec = Vec::with_capacity(row.len() + 1);
        if let Some(r) = row_names {
            rec.push(r[i].clone());
        }
        rec.extend(row.iter().map(|v| v.to_string()));
        writer.write_record(&rec)?;
    }
    writer.flush().with_context(|| path.display().to_string())?;
    Ok(())
}

/// Write serializable records as CSV with a header derived from the field names.
pub fn write_records<T: Serialize>(records: &[T], path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_writer(create_output(path)?);
    for r in records {
        writer.serialize(r).with_context(|| path.display().to_string())?;
    }
    writer.flush().with_context(|| path.display().to_string())?;
    Ok(())
}

/// Write a value as pretty-printed JSON.
pub fn write_json<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    let mut out = create_output(path)?;
    serde_json::to_writer_pretty(&mut out, value).with_context(|| path.display().to_string())?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use flate2::read::MultiGzDecoder;
    use ndarray::array;
    use std::io::Read;

    #[derive(Serialize)]
    struct Row {
        barcode: String,
        sum: f64,
    }

    #[test]
    fn test_array_to_csv_gz() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let p = dir.path().join("pca.csv.gz");
        let header = vec!["PC1".to_string(), "PC2".to_string()];
        let rows = vec!["c1".to_string(), "c2".to_string()];
        array_to_csv(&array![[1.0, 2.5], [-3.0, 4.0]], Some(&header), Some(&rows), &p)?;
        let mut s = String::new();
        MultiGzDecoder::new(File::open(&p)?).read_to_string(&mut s)?;
        assert_eq!(s, ",PC1,PC2\nc1,1,2.5\nc2,-3,4\n");
        Ok(())
    }

    #[test]
    fn test_records_and_json() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let rows = vec![Row { barcode: "a".into(), sum: 10.0 }];
        write_records(&rows, dir.path().join("cells.csv"))?;
        assert_eq!(std::fs::read_to_string(dir.path().join("cells.csv"))?, "barcode,sum\na,10.0\n");
        write_json(&serde_json::json!({"n_cells": 3}), dir.path().join("summary.json"))?;
        let v: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(dir.path().join("summary.json"))?)?;
        assert_eq!(v["n_cells"], 3);
        Ok(())
    }

    #[test]
    fn test_header_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let header = vec!["only".to_string()];
        assert!(array_to_csv(&array![[1.0, 2.0]], Some(&header), None, dir.path().join("x.csv")).is_err());
    }
}
