use crate::mtx::open_text;
use anyhow::{bail, format_err, Context, Error};
use log::info;
use ndarray::Array2;
use sc_types::ReferenceAtlas;
use std::collections::HashMap;
use std::path::Path;

/// Load a reference atlas from a genes x samples log-expression CSV (first
/// column gene symbol, header row sample names) and a `sample,label` CSV.
pub fn load_reference(expr_csv: impl AsRef<Path>, labels_csv: impl AsRef<Path>) -> Result<ReferenceAtlas, Error> {
    let expr_csv = expr_csv.as_ref();
    let labels_csv = labels_csv.as_ref();

    let mut rdr = csv::Reader::from_reader(open_text(expr_csv)?);
    let samples: Vec<String> = rdr
        .headers()
        .with_context(|| expr_csv.display().to_string())?
        .iter()
        .skip(1)
        .map(str::to_string)
        .collect();
    if samples.is_empty() {
        bail!("{}: no sample columns", expr_csv.display());
    }

    let mut genes = Vec::new();
    let mut values = Vec::new();
    for (i, rec) in rdr.records().enumerate() {
        let rec = rec.with_context(|| expr_csv.display().to_string())?;
        if rec.len() != samples.len() + 1 {
            bail!("{}: row {} has {} fields, expected {}", expr_csv.display(), i + 2, rec.len(), samples.len() + 1);
        }
        genes.push(rec[0].to_string());
        for field in rec.iter().skip(1) {
            let v: f64 = field
                .trim()
                .parse()
                .with_context(|| format!("{}: row {}", expr_csv.display(), i + 2))?;
            values.push(v);
        }
    }
    let logcounts = Array2::from_shape_vec((genes.len(), samples.len()), values)?;

    let mut label_of = HashMap::new();
    let mut rdr = csv::Reader::from_reader(open_text(labels_csv)?);
    for rec in rdr.records() {
        let rec = rec.with_context(|| labels_csv.display().to_string())?;
        if rec.len() < 2 {
            bail!("{}: expected sample,label columns", labels_csv.display());
        }
        label_of.insert(rec[0].to_string(), rec[1].to_string());
    }
    let labels = samples
        .iter()
        .map(|s| {
            label_of
                .get(s)
                .cloned()
                .ok_or_else(|| format_err!("sample {} has no label in {}", s, labels_csv.display()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let atlas = ReferenceAtlas::new(genes, samples, labels, logcounts)?;
    info!(
        "loaded reference with {} genes, {} samples and {} labels",
        atlas.genes.len(),
        atlas.samples.len(),
        atlas.label_names().len()
    );
    Ok(atlas)
}
