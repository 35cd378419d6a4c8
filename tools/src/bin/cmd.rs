// Command line utility for running the sc-explore pipeline

use anyhow::{Context, Error};
use clap::{value_parser, Arg, ArgAction, Command};
use log::info;
use sc_explore::clustering::ClusterAlgorithm;
use sc_explore::{Pipeline, PipelineConfig};
use std::path::PathBuf;

pub fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = Command::new("sc-explore-cmd")
        .about("Exploratory analysis of a droplet single-cell count matrix")
        .arg(
            Arg::new("INPUT")
                .help("Quantification directory (10x or alevin layout); overrides the config")
                .index(1)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("CONFIG")
                .help("TOML configuration file")
                .short('c')
                .long("config")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("OUT_DIR")
                .help("Output directory")
                .short('o')
                .long("out_dir")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("SEED")
                .help("Seed for every stochastic step")
                .short('s')
                .long("seed")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("CLUSTER")
                .help("Clustering algorithm")
                .long("cluster")
                .value_parser(["walktrap", "infomap", "louvain"]),
        )
        .arg(
            Arg::new("REFERENCE_EXPR")
                .help("Reference log-expression CSV, genes x samples")
                .long("reference_expr")
                .requires("REFERENCE_LABELS")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("REFERENCE_LABELS")
                .help("Reference sample,label CSV")
                .long("reference_labels")
                .requires("REFERENCE_EXPR")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("PRINT_CONFIG")
                .help("Print the effective configuration and exit")
                .long("print_config")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let mut config = PipelineConfig::load(matches.get_one::<PathBuf>("CONFIG").map(PathBuf::as_path))?;
    if let Some(input) = matches.get_one::<PathBuf>("INPUT") {
        config.input.quant_dir = Some(input.clone());
    }
    if let Some(out_dir) = matches.get_one::<PathBuf>("OUT_DIR") {
        config.output.dir = out_dir.clone();
    }
    if let Some(&seed) = matches.get_one::<u64>("SEED") {
        config.seed = seed;
    }
    if let Some(alg) = matches.get_one::<String>("CLUSTER") {
        config.clustering.algorithm = alg.parse::<ClusterAlgorithm>()?;
    }
    if let Some(expr) = matches.get_one::<PathBuf>("REFERENCE_EXPR") {
        config.annotation.reference_expression = Some(expr.clone());
    }
    if let Some(labels) = matches.get_one::<PathBuf>("REFERENCE_LABELS") {
        config.annotation.reference_labels = Some(labels.clone());
    }

    if matches.get_flag("PRINT_CONFIG") {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let pipeline = Pipeline::new(config);
    let (_, summary) = pipeline.run_from_config().context("pipeline failed")?;

    info!(
        "{} of {} cells retained, {} HVGs, {} PCs",
        summary.n_cells_retained, summary.n_cells_imported, summary.n_hvgs, summary.n_pcs
    );
    for c in &summary.clusterings {
        info!(
            "{}: {} clusters, modularity {:.3}, sizes {:?}",
            c.algorithm, c.n_clusters, c.modularity, c.sizes
        );
    }
    for m in &summary.top_markers {
        info!("cluster {} markers: {}", m.cluster, m.genes.join(", "));
    }
    for (label, n) in &summary.label_counts {
        info!("{}: {} cells", label, n);
    }
    Ok(())
}
