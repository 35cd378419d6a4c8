//! Run configuration, read from a TOML file. Every field has a default, so
//! a file only needs the settings that differ. The choices an analyst would
//! make by eye (normalization, feature selection, clustering algorithm) are
//! explicit settings here.

use crate::annotation::AnnotationParams;
use crate::clustering::ClusteringParams;
use crate::dim_red::{TsneParams, UmapParams};
use crate::hvg::HvgMethod;
use crate::normalization::{DeconvolutionParams, NormalizationMethod};
use anyhow::{Context, Error};
use diff_exp::MarkerTest;
use log::{info, warn};
use sc_io::QuantLayout;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AcquisitionConfig {
    /// `.tar.gz` of the quantification output
    pub dataset_url: Option<String>,
    /// path inside `download_dir` whose presence means the dataset is unpacked
    pub dataset_marker: Option<PathBuf>,
    /// gene annotation used for symbol mapping
    pub gtf_url: Option<String>,
    /// genome sequence the quantification was run against
    pub fasta_url: Option<String>,
    pub download_dir: PathBuf,
    pub timeout_secs: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        AcquisitionConfig {
            dataset_url: None,
            dataset_marker: None,
            gtf_url: None,
            fasta_url: None,
            download_dir: PathBuf::from("data"),
            timeout_secs: sc_io::fetch::DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

impl AcquisitionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputConfig {
    pub quant_dir: Option<PathBuf>,
    /// detected from the files present when unset
    pub layout: Option<QuantLayout>,
    pub symbols_gtf: Option<PathBuf>,
    pub symbols_tsv: Option<PathBuf>,
    pub mito_prefix: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        InputConfig {
            quant_dir: None,
            layout: None,
            symbols_gtf: None,
            symbols_tsv: None,
            mito_prefix: "MT-".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QcConfig {
    pub nmads: f64,
}

impl Default for QcConfig {
    fn default() -> Self {
        QcConfig { nmads: 3.0 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalizationConfig {
    pub method: NormalizationMethod,
    pub deconvolution: DeconvolutionParams,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        NormalizationConfig {
            method: NormalizationMethod::Deconvolution,
            deconvolution: DeconvolutionParams::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HvgConfig {
    pub method: HvgMethod,
    pub n_top: usize,
    pub fdr_threshold: Option<f64>,
    /// LOWESS span of the variance trend
    pub span: f64,
    /// minimum mean log-expression of genes the variance trend is fitted to
    pub min_mean: f64,
    /// also run the other method and report the overlap
    pub compare: bool,
}

impl Default for HvgConfig {
    fn default() -> Self {
        HvgConfig {
            method: HvgMethod::Variance,
            n_top: 2000,
            fdr_threshold: None,
            span: 0.3,
            min_mean: 0.1,
            compare: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PcaConfig {
    pub n_components: usize,
    /// keep only the components up to the elbow of the variance curve
    pub elbow: bool,
}

impl Default for PcaConfig {
    fn default() -> Self {
        PcaConfig {
            n_components: 50,
            elbow: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbeddingConfig {
    pub run_tsne: bool,
    pub run_umap: bool,
    pub tsne: TsneParams,
    pub umap: UmapParams,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        EmbeddingConfig {
            run_tsne: true,
            run_umap: true,
            tsne: TsneParams::default(),
            umap: UmapParams::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarkersConfig {
    pub tests: Vec<MarkerTest>,
    pub fdr_threshold: f64,
    /// genes per cluster listed in the summary
    pub top_n: usize,
}

impl Default for MarkersConfig {
    fn default() -> Self {
        MarkersConfig {
            tests: MarkerTest::ALL.to_vec(),
            fdr_threshold: 0.05,
            top_n: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            dir: PathBuf::from("sc-explore-out"),
        }
    }
}

/// Settings for a full run
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// every stochastic step derives its seed from this one
    pub seed: u64,
    pub acquisition: AcquisitionConfig,
    pub input: InputConfig,
    pub qc: QcConfig,
    pub normalization: NormalizationConfig,
    pub hvg: HvgConfig,
    pub pca: PcaConfig,
    pub embedding: EmbeddingConfig,
    pub clustering: ClusteringParams,
    pub markers: MarkersConfig,
    pub annotation: AnnotationParams,
    pub output: OutputConfig,
}

impl PipelineConfig {
    pub fn from_toml(s: &str) -> Result<PipelineConfig, Error> {
        Ok(toml::from_str(s)?)
    }

    /// Load the configuration at `path`. Defaults are used when no path is
    /// given, or with a warning when the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<PipelineConfig, Error> {
        let config = match path {
            None => PipelineConfig::default(),
            Some(p) if !p.exists() => {
                warn!("could not find config at {}, falling back to defaults", p.display());
                PipelineConfig::default()
            }
            Some(p) => {
                let s = std::fs::read_to_string(p).with_context(|| p.display().to_string())?;
                PipelineConfig::from_toml(&s).with_context(|| p.display().to_string())?
            }
        };
        for (key, value) in config.non_defaults()? {
            info!("config: {} = {}", key, value);
        }
        Ok(config)
    }

    /// Dotted keys and values of the settings that differ from the defaults
    pub fn non_defaults(&self) -> Result<Vec<(String, String)>, Error> {
        let ours = toml::Value::try_from(self)?;
        let defaults = toml::Value::try_from(PipelineConfig::default())?;
        let mut out = Vec::new();
        diff_values("", &ours, Some(&defaults), &mut out);
        Ok(out)
    }

    pub fn to_toml(&self) -> Result<String, Error> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn diff_values(prefix: &str, ours: &toml::Value, default: Option<&toml::Value>, out: &mut Vec<(String, String)>) {
    match (ours, default) {
        (toml::Value::Table(t), Some(toml::Value::Table(d))) => {
            for (k, v) in t {
                let key = if prefix.is_empty() { k.clone() } else { format!("{prefix}.{k}") };
                diff_values(&key, v, d.get(k), out);
            }
        }
        (v, Some(d)) if v == d => {}
        (v, _) => out.push((prefix.to_string(), v.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::ClusterAlgorithm;
    use std::io::Write;

    #[test]
    fn test_partial_file() -> Result<(), Error> {
        let config = PipelineConfig::from_toml(
            r#"
            seed = 7

            [normalization]
            method = "library_size"

            [clustering]
            algorithm = "louvain"
            compare = ["walktrap", "infomap"]

            [input]
            layout = "alevin"
            "#,
        )?;
        assert_eq!(config.seed, 7);
        assert_eq!(config.normalization.method, NormalizationMethod::LibrarySize);
        assert_eq!(config.normalization.deconvolution, DeconvolutionParams::default());
        assert_eq!(config.clustering.algorithm, ClusterAlgorithm::Louvain);
        assert_eq!(config.clustering.compare.len(), 2);
        assert_eq!(config.clustering.k, 10);
        assert_eq!(config.input.layout, Some(QuantLayout::Alevin));
        assert_eq!(config.hvg, HvgConfig::default());
        Ok(())
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(PipelineConfig::from_toml("[qc]\nnmad = 2.5\n").is_err());
        assert!(PipelineConfig::from_toml("[hvg]\nmethod = \"dispersion\"\n").is_err());
    }

    #[test]
    fn test_non_defaults() -> Result<(), Error> {
        let config = PipelineConfig::from_toml("[qc]\nnmads = 2.5\n[markers]\ntests = [\"t\"]\n")?;
        let diff = config.non_defaults()?;
        let keys: Vec<&str> = diff.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["markers.tests", "qc.nmads"]);
        assert_eq!(diff[1].1, "2.5");
        assert!(PipelineConfig::default().non_defaults()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_load() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let missing = PipelineConfig::load(Some(&dir.path().join("nope.toml")))?;
        assert_eq!(missing, PipelineConfig::default());

        let path = dir.path().join("run.toml");
        let mut f = std::fs::File::create(&path)?;
        writeln!(f, "[pca]\nn_components = 20\nelbow = false")?;
        drop(f);
        let config = PipelineConfig::load(Some(&path))?;
        assert_eq!(config.pca.n_components, 20);
        assert!(!config.pca.elbow);

        // round trip through the writer
        assert_eq!(PipelineConfig::from_toml(&config.to_toml()?)?, config);
        Ok(())
    }
}
