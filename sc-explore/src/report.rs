//! Output tables and the JSON run summary.
//!
//! Clusters are numbered from 1 in every written file, to match how they are
//! shown on plots. Genes are written with both their ID and symbol.

use crate::clustering::contingency_table;
use crate::config::PipelineConfig;
use crate::hvg::{HvgAgreement, HvgMethod, VarianceModel};
use crate::normalization::SizeFactorComparison;
use crate::pipeline::{AnalysisOutputs, MarkerOutputs};
use crate::qc::{QcCounts, QcThresholds};
use anyhow::{Context, Error};
use diff_exp::MarkerTable;
use log::info;
use ndarray::Array2;
use sc_io::write::{array_to_csv, create_output, write_json, write_records};
use sc_types::{Experiment, GeneTable};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;

#[derive(Serialize)]
struct CellRecord<'a> {
    barcode: &'a str,
    sum: f64,
    detected: f64,
    mito_percent: f64,
    size_factor: Option<f64>,
    cluster: Option<usize>,
    label: Option<&'a str>,
}

fn cell_records(exp: &Experiment) -> Vec<CellRecord<'_>> {
    let c = &exp.cells;
    (0..c.len())
        .map(|i| CellRecord {
            barcode: &c.barcodes[i],
            sum: c.sum[i],
            detected: c.detected[i],
            mito_percent: c.mito_percent[i],
            size_factor: c.size_factor.as_ref().map(|s| s[i]),
            cluster: c.cluster.as_ref().map(|l| l[i] + 1),
            label: c.label.as_ref().map(|l| l[i].as_str()),
        })
        .collect()
}

#[derive(Serialize)]
struct QcRecord<'a> {
    barcode: &'a str,
    sum: f64,
    detected: f64,
    mito_percent: f64,
    low_lib_size: bool,
    high_lib_size: bool,
    low_n_features: bool,
    high_mito_percent: bool,
    discard: bool,
}

#[derive(Serialize)]
struct GeneVarRecord<'a> {
    gene_id: &'a str,
    symbol: &'a str,
    mean: f64,
    total: f64,
    tech: f64,
    effect: f64,
    p_value: f64,
    fdr: f64,
    hvg: bool,
}

fn gene_var_records<'a>(genes: &'a GeneTable, model: &VarianceModel, hvgs: &[usize]) -> Vec<GeneVarRecord<'a>> {
    let mut is_hvg = vec![false; model.n_genes()];
    for &g in hvgs {
        is_hvg[g] = true;
    }
    (0..model.n_genes())
        .map(|g| GeneVarRecord {
            gene_id: &genes.ids[g],
            symbol: &genes.symbols[g],
            mean: model.mean[g],
            total: model.total[g],
            tech: model.tech[g],
            effect: model.effect[g],
            p_value: model.p_value[g],
            fdr: model.fdr[g],
            hvg: is_hvg[g],
        })
        .collect()
}

#[derive(Serialize)]
struct MarkerRecord<'a> {
    cluster: usize,
    gene_id: &'a str,
    symbol: &'a str,
    rank: usize,
    p_value: f64,
    fdr: f64,
    summary_effect: f64,
    is_marker: bool,
}

fn marker_records<'a>(tables: &'a [MarkerTable], genes: &'a GeneTable, fdr_threshold: f64) -> Vec<MarkerRecord<'a>> {
    tables
        .iter()
        .flat_map(|t| {
            t.rows.iter().map(move |r| MarkerRecord {
                cluster: t.cluster + 1,
                gene_id: &genes.ids[r.gene],
                symbol: &genes.symbols[r.gene],
                rank: r.rank,
                p_value: r.p_value,
                fdr: r.fdr,
                summary_effect: r.summary_effect,
                is_marker: r.fdr <= fdr_threshold,
            })
        })
        .collect()
}

#[derive(Serialize)]
struct ConsensusRecord<'a> {
    cluster: usize,
    gene_id: &'a str,
    symbol: &'a str,
    rank: usize,
    p_value: f64,
    fdr: f64,
    is_marker: bool,
}

#[derive(Serialize)]
struct AnnotationRecord<'a> {
    barcode: &'a str,
    first_label: &'a str,
    label: &'a str,
    pruned_label: Option<&'a str>,
    tuning_score: f64,
}

/// One clustering run in the summary
#[derive(Clone, Debug, Serialize)]
pub struct ClusteringSummary {
    pub algorithm: String,
    pub n_clusters: usize,
    pub modularity: f64,
    pub sizes: Vec<usize>,
}

/// Top consensus markers of one cluster, by symbol, and the number of genes
/// passing the marker FDR threshold
#[derive(Clone, Debug, Serialize)]
pub struct ClusterMarkers {
    pub cluster: usize,
    pub genes: Vec<String>,
    /// consensus markers
    pub n_markers: usize,
    /// markers of each test on its own
    pub n_markers_by_test: Vec<(String, usize)>,
}

/// Headline numbers of a run, written as `summary.json`
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub seed: u64,
    pub n_genes: usize,
    pub n_cells_imported: usize,
    pub n_cells_retained: usize,
    pub qc: QcCounts,
    pub qc_thresholds: QcThresholds,
    pub size_factors: Option<SizeFactorComparison>,
    pub hvg_method: HvgMethod,
    pub n_hvgs: usize,
    pub hvg_agreement: Option<HvgAgreement>,
    pub n_pcs: usize,
    pub clusterings: Vec<ClusteringSummary>,
    pub top_markers: Vec<ClusterMarkers>,
    pub label_counts: Vec<(String, usize)>,
    pub n_pruned: Option<usize>,
}

impl RunSummary {
    pub fn new(outputs: &AnalysisOutputs, config: &PipelineConfig) -> RunSummary {
        let exp = &outputs.experiment;
        let clusterings = outputs
            .clusters
            .all()
            .map(|p| ClusteringSummary {
                algorithm: p.algorithm.clone(),
                n_clusters: p.n_clusters(),
                modularity: p.modularity,
                sizes: p.sizes(),
            })
            .collect();
        let fdr = config.markers.fdr_threshold;
        let top_markers = outputs
            .markers
            .as_ref()
            .map(|m| {
                m.consensus
                    .iter()
                    .enumerate()
                    .map(|(i, t)| ClusterMarkers {
                        cluster: t.cluster + 1,
                        genes: t
                            .top(config.markers.top_n)
                            .into_iter()
                            .map(|g| exp.counts.genes.symbols[g].clone())
                            .collect(),
                        n_markers: t.markers(fdr).len(),
                        n_markers_by_test: m
                            .per_test
                            .iter()
                            .map(|(test, tables)| (test.name().to_string(), tables[i].markers(fdr).len()))
                            .collect(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        RunSummary {
            seed: config.seed,
            n_genes: exp.n_genes(),
            n_cells_imported: outputs.qc.barcodes.len(),
            n_cells_retained: exp.n_cells(),
            qc: outputs.qc.filter.counts(),
            qc_thresholds: outputs.qc.filter.thresholds,
            size_factors: outputs.size_factor_comparison,
            hvg_method: outputs.variance.method,
            n_hvgs: outputs.hvgs.len(),
            hvg_agreement: outputs.hvg_agreement,
            n_pcs: exp.pca.as_ref().map_or(0, |p| p.n_components()),
            clusterings,
            top_markers,
            label_counts: outputs.annotation.as_ref().map(|a| a.label_counts()).unwrap_or_default(),
            n_pruned: outputs
                .annotation
                .as_ref()
                .map(|a| a.pruned.iter().filter(|&&p| p).count()),
        }
    }
}

fn usize_to_csv(table: &Array2<usize>, header: &[String], row_names: &[String], path: &Path) -> Result<(), Error> {
    array_to_csv(&table.mapv(|v| v as f64), Some(header), Some(row_names), path)
}

fn cluster_names(n: usize) -> Vec<String> {
    (1..=n).map(|c| c.to_string()).collect()
}

fn write_markers(markers: &MarkerOutputs, genes: &GeneTable, fdr_threshold: f64, dir: &Path) -> Result<(), Error> {
    for (test, tables) in &markers.per_test {
        let records = marker_records(tables, genes, fdr_threshold);
        write_records(&records, dir.join(format!("markers_{}.csv", test.name())))?;
    }

    let records: Vec<ConsensusRecord> = markers
        .consensus
        .iter()
        .flat_map(|t| {
            t.rows.iter().map(move |r| ConsensusRecord {
                cluster: t.cluster + 1,
                gene_id: &genes.ids[r.gene],
                symbol: &genes.symbols[r.gene],
                rank: r.rank,
                p_value: r.p_value,
                fdr: r.fdr,
                is_marker: r.fdr <= fdr_threshold,
            })
        })
        .collect();
    write_records(&records, dir.join("markers_consensus.csv"))
}

/// Write every table of a run into `dir`, then the summary. Returns the summary.
pub fn write_outputs(outputs: &AnalysisOutputs, config: &PipelineConfig, dir: &Path) -> Result<RunSummary, Error> {
    fs::create_dir_all(dir).with_context(|| dir.display().to_string())?;
    let exp = &outputs.experiment;
    let genes = &exp.counts.genes;
    let barcodes: &[String] = &exp.counts.barcodes;

    let mut out = create_output(dir.join("config.toml"))?;
    out.write_all(config.to_toml()?.as_bytes())?;
    out.flush()?;

    write_records(&cell_records(exp), dir.join("cells.csv"))?;

    let qc = &outputs.qc;
    let f = &qc.filter;
    let qc_records: Vec<QcRecord> = (0..qc.barcodes.len())
        .map(|i| QcRecord {
            barcode: &qc.barcodes[i],
            sum: qc.metrics.sum[i],
            detected: qc.metrics.detected[i],
            mito_percent: qc.metrics.mito_percent[i],
            low_lib_size: f.low_lib_size[i],
            high_lib_size: f.high_lib_size[i],
            low_n_features: f.low_n_features[i],
            high_mito_percent: f.high_mito_percent[i],
            discard: f.discard[i],
        })
        .collect();
    write_records(&qc_records, dir.join("qc.csv"))?;
    write_records(&qc.discarded_genes, dir.join("discarded_genes.csv"))?;

    write_records(
        &gene_var_records(genes, &outputs.variance, &outputs.hvgs),
        dir.join("gene_var.csv"),
    )?;

    if let Some(pca) = &exp.pca {
        let header: Vec<String> = (1..=pca.n_components()).map(|i| format!("PC_{i}")).collect();
        array_to_csv(&pca.scores, Some(&header[..]), Some(barcodes), dir.join("pca.csv.gz"))?;
    }
    let variance = Array2::from_shape_fn((outputs.percent_var.len(), 1), |(i, _)| outputs.percent_var[i]);
    let pcs: Vec<String> = (1..=outputs.percent_var.len()).map(|i| format!("PC_{i}")).collect();
    array_to_csv(
        &variance,
        Some(&["percent_var".to_string()][..]),
        Some(&pcs[..]),
        dir.join("pca_variance.csv"),
    )?;

    for e in &exp.embeddings {
        let name = e.kind.name();
        let header = vec![format!("{name}_1"), format!("{name}_2")];
        let path = dir.join(format!("{}.csv", name.to_lowercase()));
        array_to_csv(&e.coords, Some(&header[..]), Some(barcodes), path)?;
    }

    let partitions: Vec<_> = outputs.clusters.all().collect();
    let labels = Array2::from_shape_fn((exp.n_cells(), partitions.len()), |(c, p)| (partitions[p].labels[c] + 1) as f64);
    let header: Vec<String> = partitions.iter().map(|p| p.algorithm.clone()).collect();
    array_to_csv(&labels, Some(&header[..]), Some(barcodes), dir.join("clusterings.csv"))?;
    let primary = &outputs.clusters.primary;
    for other in &outputs.clusters.comparisons {
        let table = contingency_table(primary, other)?;
        usize_to_csv(
            &table,
            &cluster_names(table.ncols()),
            &cluster_names(table.nrows()),
            &dir.join(format!("contingency_{}.csv", other.algorithm)),
        )?;
    }

    if let Some(markers) = &outputs.markers {
        write_markers(markers, genes, config.markers.fdr_threshold, dir)?;
    }

    if let Some(ann) = &outputs.annotation {
        array_to_csv(&ann.scores, Some(&ann.label_names[..]), Some(barcodes), dir.join("annotation_scores.csv"))?;
        let records: Vec<AnnotationRecord> = (0..ann.n_cells())
            .map(|c| AnnotationRecord {
                barcode: &barcodes[c],
                first_label: &ann.label_names[ann.first_labels[c]],
                label: ann.label(c),
                pruned_label: ann.pruned_label(c),
                tuning_score: ann.tuning_scores[c],
            })
            .collect();
        write_records(&records, dir.join("annotation.csv"))?;
        if let Some(table) = &outputs.cluster_labels {
            usize_to_csv(
                table,
                &ann.label_names,
                &cluster_names(table.nrows()),
                &dir.join("cluster_labels.csv"),
            )?;
        }
    }

    let summary = RunSummary::new(outputs, config);
    write_json(&summary, dir.join("summary.json"))?;
    info!("wrote results to {}", dir.display());
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hvg::HvgMethod;
    use diff_exp::{MarkerRow, MarkerTest};
    use sc_types::CountMatrix;

    fn experiment() -> Experiment {
        let ids: Vec<String> = vec!["G1".into(), "G2".into()];
        let genes = GeneTable::new(ids.clone(), ids, "MT-").unwrap();
        let dense = ndarray::array![[1u32, 0, 3], [0, 2, 0]];
        let counts = CountMatrix::from_dense(genes, vec!["a".into(), "b".into(), "c".into()], &dense).unwrap();
        Experiment::new(counts)
    }

    #[test]
    fn test_cell_records_number_clusters_from_one() {
        let mut exp = experiment();
        exp.cells.cluster = Some(vec![0, 1, 0]);
        let records = cell_records(&exp);
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].barcode, "b");
        assert_eq!(records[1].cluster, Some(2));
        assert_eq!(records[0].size_factor, None);
        assert_eq!(records[2].label, None);
    }

    #[test]
    fn test_gene_var_records_flag_hvgs() {
        let exp = experiment();
        let model = VarianceModel {
            method: HvgMethod::Variance,
            mean: vec![1.0, 2.0],
            total: vec![0.5, 0.7],
            tech: vec![0.4, 0.3],
            effect: vec![0.1, 0.4],
            p_value: vec![0.5, 0.01],
            fdr: vec![0.5, 0.02],
        };
        let records = gene_var_records(&exp.counts.genes, &model, &[1]);
        assert!(!records[0].hvg);
        assert!(records[1].hvg);
        assert_eq!(records[1].gene_id, "G2");
    }

    #[test]
    fn test_marker_records_follow_threshold() {
        let exp = experiment();
        let row = |gene: usize, fdr: f64, rank: usize| MarkerRow {
            gene,
            p_value: fdr / 2.0,
            fdr,
            summary_effect: 1.0,
            rank,
        };
        let tables = vec![MarkerTable {
            cluster: 0,
            test: MarkerTest::T,
            targets: vec![1],
            rows: vec![row(1, 0.001, 1), row(0, 0.03, 2)],
        }];
        let flagged = |fdr: f64| {
            marker_records(&tables, &exp.counts.genes, fdr)
                .iter()
                .filter(|r| r.is_marker)
                .count()
        };
        assert_eq!(flagged(0.05), 2);
        assert_eq!(flagged(0.01), 1);
        assert_eq!(flagged(0.0001), 0);
        let records = marker_records(&tables, &exp.counts.genes, 0.01);
        assert_eq!(records[0].cluster, 1);
        assert_eq!(records[0].symbol, "G2");
        assert!(records[0].is_marker && !records[1].is_marker);
    }

    #[test]
    fn test_usize_table_csv() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.csv");
        let table = Array2::from_shape_vec((2, 2), vec![3, 0, 1, 4])?;
        usize_to_csv(&table, &["x".into(), "y".into()], &cluster_names(2), &path)?;
        let text = fs::read_to_string(&path)?;
        assert_eq!(text, ",x,y\n1,3,0\n2,1,4\n");
        Ok(())
    }
}
