//! The analysis as one sequence of stages. Each stage takes the output of
//! the previous one by value and returns a new value, and every random step
//! is seeded from the configured seed, so a rerun reproduces the partitions
//! and marker rankings exactly.

use crate::annotation::{classify_single_r, cluster_label_table, train_single_r, AnnotationResult};
use crate::clustering::{cluster_cells, ClusteringResult};
use crate::config::PipelineConfig;
use crate::dim_red::{find_elbow_point, run_pca, run_tsne, run_umap};
use crate::hvg::{hvg_agreement, model_gene_cv2, model_gene_var, top_hvgs, HvgAgreement, HvgMethod, VarianceModel};
use crate::normalization::{
    compare_size_factors, compute_size_factors, library_size_factors, NormalizationMethod, Normalized,
    SizeFactorComparison,
};
use crate::qc::{compare_discarded, per_cell_qc_metrics, quick_per_cell_qc, DiscardRow, QcFilter, QcMetrics};
use crate::report::{write_outputs, RunSummary};
use anyhow::{bail, Error};
use diff_exp::{find_markers, multi_marker_stats, ConsensusTable, MarkerTable, MarkerTest};
use log::{info, warn};
use ndarray::Array2;
use sc_io::fetch::{fetch_archive, fetch_file, file_name_from_url};
use sc_io::reference::load_reference;
use sc_io::{annotate, read_quant_dir, GeneSymbolMap};
use sc_types::{Experiment, ReferenceAtlas};
use std::path::{Path, PathBuf};

const QUICK_CLUSTER_SEED: u64 = 1;
const PCA_SEED: u64 = 2;
const TSNE_SEED: u64 = 3;
const UMAP_SEED: u64 = 4;
const CLUSTER_SEED: u64 = 5;

/// Seed of one stage, derived from the run seed
fn stage_seed(seed: u64, stage: u64) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(stage)
}

/// QC results over all imported cells
#[derive(Clone, Debug)]
pub struct QcOutputs {
    pub barcodes: Vec<String>,
    pub metrics: QcMetrics,
    pub filter: QcFilter,
    /// genes enriched in the discarded cells
    pub discarded_genes: Vec<DiscardRow>,
}

/// Local paths of the downloaded inputs
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Acquired {
    /// unpacked quantification directory
    pub quant_dir: Option<PathBuf>,
    pub gtf: Option<PathBuf>,
    pub fasta: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct MarkerOutputs {
    pub per_test: Vec<(MarkerTest, Vec<MarkerTable>)>,
    pub consensus: Vec<ConsensusTable>,
}

/// Everything a run produces. `experiment` holds the retained cells with
/// their log-expression, PCA, embeddings, clusters and labels.
#[derive(Clone, Debug)]
pub struct AnalysisOutputs {
    pub experiment: Experiment,
    pub qc: QcOutputs,
    pub size_factor_comparison: Option<SizeFactorComparison>,
    pub variance: VarianceModel,
    pub hvgs: Vec<usize>,
    pub hvg_agreement: Option<HvgAgreement>,
    /// variance explained by every computed component, before the elbow cut
    pub percent_var: Vec<f64>,
    pub clusters: ClusteringResult,
    pub markers: Option<MarkerOutputs>,
    pub annotation: Option<AnnotationResult>,
    /// clusters x labels cell counts
    pub cluster_labels: Option<Array2<usize>>,
}

pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Pipeline {
        Pipeline { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn seed(&self, stage: u64) -> u64 {
        stage_seed(self.config.seed, stage)
    }

    /// Download the dataset, gene annotation and genome sequence for every
    /// URL that is configured. Files already present are not fetched again.
    pub fn acquire(&self) -> Result<Acquired, Error> {
        let acq = &self.config.acquisition;
        let quant_dir = match &acq.dataset_url {
            Some(url) => {
                let marker = acq.dataset_marker.clone().unwrap_or_else(|| PathBuf::from("quant"));
                Some(fetch_archive(url, &acq.download_dir, marker, acq.timeout())?)
            }
            None => None,
        };
        let single = |url: &Option<String>, default: &str| -> Result<Option<PathBuf>, Error> {
            match url {
                Some(url) => {
                    let dest = acq.download_dir.join(file_name_from_url(url, default));
                    Ok(Some(fetch_file(url, dest, acq.timeout())?))
                }
                None => Ok(None),
            }
        };
        Ok(Acquired {
            quant_dir,
            gtf: single(&acq.gtf_url, "genes.gtf")?,
            fasta: single(&acq.fasta_url, "genome.fa")?,
        })
    }

    /// Read a quantification directory and attach gene symbols.
    pub fn import(&self, quant_dir: &Path, gtf: Option<&Path>) -> Result<Experiment, Error> {
        let input = &self.config.input;
        let raw = read_quant_dir(quant_dir, input.layout)?;
        let map = if let Some(tsv) = &input.symbols_tsv {
            Some(GeneSymbolMap::from_tsv(tsv)?)
        } else if let Some(gtf) = input.symbols_gtf.as_deref().or(gtf) {
            Some(GeneSymbolMap::from_gtf(gtf)?)
        } else {
            None
        };
        let counts = annotate(raw, map.as_ref(), &input.mito_prefix)?;
        info!("imported {} genes x {} cells", counts.n_genes(), counts.n_cells());
        Ok(Experiment::new(counts))
    }

    /// Flag outlier cells and keep the rest.
    pub fn quality_control(&self, mut exp: Experiment) -> Result<(Experiment, QcOutputs), Error> {
        let metrics = per_cell_qc_metrics(&exp.counts);
        let filter = quick_per_cell_qc(&metrics, self.config.qc.nmads)?;
        if filter.discard.iter().all(|&d| d) {
            bail!("all {} cells failed QC", filter.discard.len());
        }
        let discarded_genes = compare_discarded(&exp.counts, &filter.discard)?;

        exp.cells.sum = metrics.sum.clone();
        exp.cells.detected = metrics.detected.clone();
        exp.cells.mito_percent = metrics.mito_percent.clone();
        exp.cells.discard = Some(filter.discard.clone());
        let retained = exp.retain_cells(&filter.keep())?;
        info!("{} of {} cells retained after QC", retained.n_cells(), exp.n_cells());

        let qc = QcOutputs {
            barcodes: exp.counts.barcodes.clone(),
            metrics,
            filter,
            discarded_genes,
        };
        Ok((retained, qc))
    }

    /// Size factors and log-expression of the retained cells.
    pub fn normalize(&self, mut exp: Experiment) -> Result<(Experiment, Normalized, Option<SizeFactorComparison>), Error> {
        let norm = &self.config.normalization;
        let sf = compute_size_factors(&exp.counts, norm.method, &norm.deconvolution, self.seed(QUICK_CLUSTER_SEED))?;
        let comparison = match norm.method {
            NormalizationMethod::LibrarySize => None,
            NormalizationMethod::Deconvolution => Some(compare_size_factors(&library_size_factors(&exp.counts)?, &sf)?),
        };
        let normalized = Normalized::new(exp.counts.clone(), sf)?;
        exp.cells.size_factor = Some(normalized.size_factors.clone());
        exp.logcounts = Some(normalized.logcounts.clone());
        Ok((exp, normalized, comparison))
    }

    fn model(&self, normalized: &Normalized, method: HvgMethod) -> Result<VarianceModel, Error> {
        let hvg = &self.config.hvg;
        match method {
            HvgMethod::Variance => model_gene_var(normalized, hvg.span, hvg.min_mean),
            HvgMethod::Cv2 => model_gene_cv2(normalized),
        }
    }

    /// Model per-gene variation and pick the most variable genes.
    pub fn select_features(&self, normalized: &Normalized) -> Result<(VarianceModel, Vec<usize>, Option<HvgAgreement>), Error> {
        let hvg = &self.config.hvg;
        let model = self.model(normalized, hvg.method)?;
        let hvgs = top_hvgs(&model, hvg.n_top, hvg.fdr_threshold);
        if hvgs.is_empty() {
            bail!("no gene is more variable than the {} trend", hvg.method.name());
        }
        let agreement = if hvg.compare {
            let other = match hvg.method {
                HvgMethod::Variance => HvgMethod::Cv2,
                HvgMethod::Cv2 => HvgMethod::Variance,
            };
            let other_model = self.model(normalized, other)?;
            Some(hvg_agreement(&hvgs, &top_hvgs(&other_model, hvg.n_top, hvg.fdr_threshold)))
        } else {
            None
        };
        Ok((model, hvgs, agreement))
    }

    /// PCA on the selected genes, cut at the elbow when configured, then
    /// the visual embeddings. Returns the variance of every computed component.
    pub fn reduce(&self, mut exp: Experiment, normalized: &Normalized, hvgs: &[usize]) -> Result<(Experiment, Vec<f64>), Error> {
        let cfg = &self.config;
        let pca = run_pca(normalized, hvgs, cfg.pca.n_components, self.seed(PCA_SEED))?;
        let percent_var = pca.percent_var.clone();
        let pca = if cfg.pca.elbow {
            let k = find_elbow_point(&percent_var);
            info!("keeping {} PCs up to the elbow", k);
            pca.truncate(k)
        } else {
            pca
        };

        let mut embeddings = Vec::new();
        if cfg.embedding.run_tsne {
            embeddings.push(run_tsne(&pca, &cfg.embedding.tsne, self.seed(TSNE_SEED))?);
        }
        if cfg.embedding.run_umap {
            embeddings.push(run_umap(&pca, &cfg.embedding.umap, self.seed(UMAP_SEED))?);
        }
        exp.pca = Some(pca);
        exp.embeddings = embeddings;
        Ok((exp, percent_var))
    }

    pub fn cluster(&self, mut exp: Experiment) -> Result<(Experiment, ClusteringResult), Error> {
        let Some(pca) = &exp.pca else {
            bail!("clustering needs a PCA");
        };
        let result = cluster_cells(pca, &self.config.clustering, self.seed(CLUSTER_SEED))?;
        exp.cells.cluster = Some(result.primary.labels.clone());
        Ok((exp, result))
    }

    /// Marker tables for every configured test and their consensus. Skipped
    /// when there is only one cluster.
    pub fn find_markers(&self, normalized: &Normalized, clusters: &ClusteringResult) -> Result<Option<MarkerOutputs>, Error> {
        let labels = &clusters.primary.labels;
        if clusters.primary.n_clusters() < 2 {
            warn!("only one cluster, skipping marker detection");
            return Ok(None);
        }
        let mut per_test = Vec::new();
        let fdr = self.config.markers.fdr_threshold;
        for &test in &self.config.markers.tests {
            per_test.push((test, find_markers(&normalized.logcounts, labels, test, fdr)?));
        }
        if per_test.is_empty() {
            return Ok(None);
        }
        let tables: Vec<Vec<MarkerTable>> = per_test.iter().map(|(_, t)| t.clone()).collect();
        let consensus = multi_marker_stats(&tables)?;
        Ok(Some(MarkerOutputs { per_test, consensus }))
    }

    /// Label cells against the reference.
    pub fn annotate(
        &self,
        mut exp: Experiment,
        normalized: &Normalized,
        reference: &ReferenceAtlas,
    ) -> Result<(Experiment, AnnotationResult), Error> {
        let params = &self.config.annotation;
        let trained = train_single_r(reference, &exp.counts.genes.symbols, params.de_n)?;
        let result = classify_single_r(&trained, &normalized.logcounts, params)?;
        exp.cells.label = Some((0..result.n_cells()).map(|c| result.label(c).to_string()).collect());
        Ok((exp, result))
    }

    /// Run every stage from QC to annotation on an imported experiment.
    pub fn run(&self, exp: Experiment, reference: Option<&ReferenceAtlas>) -> Result<AnalysisOutputs, Error> {
        exp.validate()?;
        info!("analysing {} genes x {} cells", exp.n_genes(), exp.n_cells());
        let (exp, qc) = self.quality_control(exp)?;
        let (exp, normalized, size_factor_comparison) = self.normalize(exp)?;
        let (variance, hvgs, hvg_agreement) = self.select_features(&normalized)?;
        let (exp, percent_var) = self.reduce(exp, &normalized, &hvgs)?;
        let (exp, clusters) = self.cluster(exp)?;
        let markers = self.find_markers(&normalized, &clusters)?;

        let (experiment, annotation, cluster_labels) = match reference {
            Some(reference) => {
                let (exp, annotation) = self.annotate(exp, &normalized, reference)?;
                let table = cluster_label_table(&clusters.primary, &annotation)?;
                (exp, Some(annotation), Some(table))
            }
            None => {
                info!("no reference given, skipping annotation");
                (exp, None, None)
            }
        };
        experiment.validate()?;

        Ok(AnalysisOutputs {
            experiment,
            qc,
            size_factor_comparison,
            variance,
            hvgs,
            hvg_agreement,
            percent_var,
            clusters,
            markers,
            annotation,
            cluster_labels,
        })
    }

    /// Acquire, import, analyse and write all outputs as configured.
    pub fn run_from_config(&self) -> Result<(AnalysisOutputs, RunSummary), Error> {
        let acquired = self.acquire()?;
        if let Some(fasta) = &acquired.fasta {
            info!("genome sequence at {}", fasta.display());
        }
        let Some(quant_dir) = self.config.input.quant_dir.clone().or(acquired.quant_dir) else {
            bail!("no quantification directory configured and no dataset to download");
        };
        let exp = self.import(&quant_dir, acquired.gtf.as_deref())?;

        let ann = &self.config.annotation;
        let reference = match (&ann.reference_expression, &ann.reference_labels) {
            (Some(expr), Some(labels)) => Some(load_reference(expr, labels)?),
            (None, None) => None,
            _ => bail!("the reference needs both an expression and a labels file"),
        };

        let outputs = self.run(exp, reference.as_ref())?;
        let summary = write_outputs(&outputs, &self.config, &self.config.output.dir)?;
        Ok((outputs, summary))
    }
}
