use crate::layout::RawQuant;
use crate::mtx::open_text;
use anyhow::{bail, Context, Error};
use log::{info, warn};
use sc_types::{CountMatrix, GeneTable};
use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use std::path::Path;

/// Remove a trailing `.N` version from a gene identifier (`ENSG00000123.4` -> `ENSG00000123`).
pub fn strip_version(id: &str) -> &str {
    match id.rsplit_once('.') {
        Some((stem, ver)) if !stem.is_empty() && !ver.is_empty() && ver.bytes().all(|b| b.is_ascii_digit()) => stem,
        _ => id,
    }
}

/// Map from version-stripped gene identifiers to gene symbols.
#[derive(Clone, Debug, Default)]
pub struct GeneSymbolMap {
    map: HashMap<String, String>,
}

/// Pull the value of `key "value";` out of a GTF attribute column.
fn gtf_attribute<'a>(attrs: &'a str, key: &str) -> Option<&'a str> {
    attrs.split(';').find_map(|field| {
        let field = field.trim();
        let (k, v) = field.split_once(char::is_whitespace)?;
        if k == key {
            Some(v.trim().trim_matches('"'))
        } else {
            None
        }
    })
}

impl GeneSymbolMap {
    pub fn from_pairs<I, S, T>(pairs: I) -> GeneSymbolMap
    where
        I: IntoIterator<Item = (S, T)>,
        S: AsRef<str>,
        T: Into<String>,
    {
        let map = pairs
            .into_iter()
            .map(|(id, sym)| (strip_version(id.as_ref()).to_string(), sym.into()))
            .collect();
        GeneSymbolMap { map }
    }

    /// Read `gene_id` / `gene_name` attribute pairs from a GTF (plain or gzipped).
    /// The first record seen for a gene wins.
    pub fn from_gtf(path: impl AsRef<Path>) -> Result<GeneSymbolMap, Error> {
        let path = path.as_ref();
        let mut map = HashMap::new();
        for line in open_text(path)?.lines() {
            let line = line.with_context(|| path.display().to_string())?;
            if line.starts_with('#') {
                continue;
            }
            let Some(attrs) = line.split('\t').nth(8) else { continue };
            if let (Some(id), Some(name)) = (gtf_attribute(attrs, "gene_id"), gtf_attribute(attrs, "gene_name")) {
                map.entry(strip_version(id).to_string())
                    .or_insert_with(|| name.to_string());
            }
        }
        if map.is_empty() {
            bail!("no gene_id/gene_name attributes found in {}", path.display());
        }
        info!("read {} gene symbols from {}", map.len(), path.display());
        Ok(GeneSymbolMap { map })
    }

    /// Read a two-column `id<TAB>symbol` table. A header line starting with `gene` is skipped.
    pub fn from_tsv(path: impl AsRef<Path>) -> Result<GeneSymbolMap, Error> {
        let path = path.as_ref();
        let mut map = HashMap::new();
        for (i, line) in open_text(path)?.lines().enumerate() {
            let line = line.with_context(|| path.display().to_string())?;
            if line.trim().is_empty() || (i == 0 && line.to_ascii_lowercase().starts_with("gene")) {
                continue;
            }
            let mut fields = line.split('\t');
            match (fields.next(), fields.next()) {
                (Some(id), Some(sym)) if !sym.is_empty() => {
                    map.insert(strip_version(id).to_string(), sym.trim().to_string());
                }
                _ => bail!("{}:{}: expected two tab-separated columns", path.display(), i + 1),
            }
        }
        Ok(GeneSymbolMap { map })
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.map.get(strip_version(id)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Make symbols unique by appending the gene id to every symbol that occurs more than once.
pub fn uniquify_symbols(ids: &[String], symbols: &[String]) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for s in symbols {
        *counts.entry(s.as_str()).or_default() += 1;
    }
    symbols
        .iter()
        .zip(ids)
        .map(|(s, id)| {
            if counts[s.as_str()] > 1 {
                format!("{s}_{id}")
            } else {
                s.clone()
            }
        })
        .collect()
}

/// Attach symbols to a raw import. Identifiers lose their version suffix. When
/// `map` is given it takes precedence over quantifier-supplied names; genes it
/// cannot resolve are dropped. Mitochondrial genes are tagged by `mito_prefix`.
pub fn annotate(raw: RawQuant, map: Option<&GeneSymbolMap>, mito_prefix: &str) -> Result<CountMatrix, Error> {
    let ids: Vec<String> = raw.gene_ids.iter().map(|id| strip_version(id).to_string()).collect();

    let mut keep = Vec::with_capacity(ids.len());
    let mut symbols = Vec::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        let sym = match map {
            Some(m) => m.get(id).map(str::to_string),
            None => raw.gene_names.as_ref().map(|names| names[i].clone()),
        };
        if let Some(sym) = sym.filter(|s| !s.is_empty()) {
            keep.push(i);
            symbols.push(sym);
        }
    }

    let dropped = ids.len() - keep.len();
    if dropped > 0 {
        warn!("dropping {} of {} genes with no symbol", dropped, ids.len());
    }
    if keep.is_empty() {
        bail!("no gene could be assigned a symbol");
    }

    let kept_ids: Vec<String> = keep.iter().map(|&i| ids[i].clone()).collect();
    let unique = uniquify_symbols(&kept_ids, &symbols);
    let n_dups = unique.iter().zip(&symbols).filter(|(u, s)| u != s).count();
    let symbols = unique;
    let distinct: HashSet<&String> = symbols.iter().collect();
    if distinct.len() != symbols.len() {
        bail!("gene symbols are not unique after appending identifiers");
    }
    if n_dups > 0 {
        info!("{} duplicated symbols were made unique with their gene id", n_dups);
    }

    let genes = GeneTable::new(kept_ids, symbols, mito_prefix)?;
    let n_mito = genes.mito_indices().len();
    if n_mito == 0 {
        warn!("no genes match the mitochondrial prefix {:?}", mito_prefix);
    } else {
        info!("tagged {} mitochondrial genes", n_mito);
    }

    let matrix = sc_types::matrix::select_rows(&raw.matrix, &keep);
    CountMatrix::new(genes, raw.barcodes, matrix)
}

#[cfg(test)]
mod test {
    use super::*;
    use sprs::TriMat;

    #[test]
    fn test_strip_version() {
        assert_eq!(strip_version("ENSG00000123.4"), "ENSG00000123");
        assert_eq!(strip_version("ENSG00000123"), "ENSG00000123");
        assert_eq!(strip_version("RP11-34P13.7a"), "RP11-34P13.7a");
        assert_eq!(strip_version(".5"), ".5");
    }

    #[test]
    fn test_gtf() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let p = dir.path().join("genes.gtf");
        std::fs::write(
            &p,
            "#!genome-build GRCh38\n\
             1\tHAVANA\tgene\t1\t100\t.\t+\t.\tgene_id \"ENSG01.2\"; gene_version \"2\"; gene_name \"DDX11L1\";\n\
             1\tHAVANA\texon\t1\t50\t.\t+\t.\tgene_id \"ENSG01.2\"; gene_name \"OTHER\";\n\
             MT\tINSDC\tgene\t1\t9\t.\t+\t.\tgene_id \"ENSG02\"; gene_name \"MT-ND1\";\n",
        )?;
        let m = GeneSymbolMap::from_gtf(&p)?;
        assert_eq!(m.len(), 2);
        assert_eq!(m.get("ENSG01.7"), Some("DDX11L1"));
        assert_eq!(m.get("ENSG02"), Some("MT-ND1"));
        assert_eq!(m.get("ENSG03"), None);
        Ok(())
    }

    #[test]
    fn test_uniquify() {
        let ids = vec!["E1".to_string(), "E2".to_string(), "E3".to_string()];
        let syms = vec!["A".to_string(), "B".to_string(), "A".to_string()];
        assert_eq!(uniquify_symbols(&ids, &syms), vec!["A_E1", "B", "A_E3"]);
    }

    #[test]
    fn test_annotate_drops_unmapped() -> Result<(), Error> {
        let mut tri = TriMat::new((3, 2));
        tri.add_triplet(0, 0, 1u32);
        tri.add_triplet(1, 1, 2);
        tri.add_triplet(2, 0, 3);
        let raw = RawQuant {
            gene_ids: vec!["E1.1".into(), "E2.1".into(), "E3.1".into()],
            gene_names: None,
            barcodes: vec!["a".into(), "b".into()],
            matrix: tri.to_csc(),
        };
        let map = GeneSymbolMap::from_pairs([("E1", "CD3E"), ("E3", "mt-Co1")]);
        let cm = annotate(raw, Some(&map), "MT-")?;
        assert_eq!(cm.genes.ids, vec!["E1", "E3"]);
        assert_eq!(cm.genes.symbols, vec!["CD3E", "mt-Co1"]);
        assert_eq!(cm.genes.is_mito, vec![false, true]);
        assert_eq!(cm.matrix.get(1, 0), Some(&3));
        assert_eq!(cm.n_cells(), 2);
        Ok(())
    }
}
