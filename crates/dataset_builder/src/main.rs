mod assemble;
mod config;
mod manifest;

use std::fs;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use acquire::{AcquisitionStatus, CommandProvider, Orchestrator};
use linegeo::{GeoAccess, GeoJsonAccess, SampleSetBuilder};

use crate::assemble::DatasetAssembler;
use crate::config::Config;

fn main() -> Result<()> {
    env_logger::init();

    let config = Config::parse();
    config.validate()?;

    fs::create_dir_all(&config.out_dir)
        .with_context(|| format!("failed to create {}", config.out_dir.display()))?;
    fs::create_dir_all(&config.staging_dir)
        .with_context(|| format!("failed to create {}", config.staging_dir.display()))?;

    let started = Instant::now();

    // Build the sample set.
    let access = GeoJsonAccess;
    let lines = access
        .read_layer(&config.lines)
        .with_context(|| format!("loading line layer {}", config.lines.display()))?;
    let regions = access
        .read_layer(&config.regions)
        .with_context(|| format!("loading region layer {}", config.regions.display()))?;
    info!(
        "loaded {} line features and {} region features",
        lines.features.len(),
        regions.features.len()
    );

    let filter = config.region_filter();
    let samples = SampleSetBuilder::new(&access, config.layer_fields())
        .build(lines, regions, &filter)
        .context("building sample set")?;
    info!("sample set: {} points", samples.len());
    if samples.is_empty() {
        warn!("no sample points inside the selected regions");
    }

    if let Some(path) = &config.samples_out {
        manifest::write_samples_jsonl(path, &samples)?;
        info!("wrote samples to {}", path.display());
    }

    // Acquire positives then negatives.
    let provider = CommandProvider::new(&config.provider_cmd).with_args(&config.provider_args);
    let orchestrator = Orchestrator::new(Arc::new(provider), config.acquire_options())
        .context("starting acquisition workers")?;

    let mut assembler =
        DatasetAssembler::new(config.assembly_config(), StdRng::seed_from_u64(config.seed));
    let report = assembler.assemble(&samples, &orchestrator);

    manifest::write_manifest(&config.manifest, &report.manifest)?;
    info!(
        "wrote {} manifest rows to {}",
        report.manifest.len(),
        config.manifest.display()
    );

    for outcome in report
        .outcomes
        .iter()
        .filter(|o| o.status == AcquisitionStatus::Failed)
    {
        debug!(
            "failed: {} ({})",
            outcome.identifier,
            outcome.error.as_deref().unwrap_or("no detail")
        );
    }

    let summary = report.summary();
    if summary.failed > 0 {
        warn!("done in {:.1?}: {summary}", started.elapsed());
    } else {
        info!("done in {:.1?}: {summary}", started.elapsed());
    }

    if let Some(max) = config.max_failed {
        anyhow::ensure!(
            summary.failed <= max,
            "{} items failed (allowed: {max})",
            summary.failed
        );
    }
    Ok(())
}
