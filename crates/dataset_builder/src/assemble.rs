use std::path::PathBuf;

use acquire::{AcquisitionOutcome, AcquisitionSummary, Orchestrator, WorkItem};
use linegeo::SampleRecord;
use log::info;
use rand::seq::index;
use rand::Rng;

use crate::manifest::ManifestEntry;

pub const POSITIVE_LABEL: u8 = 1;
pub const NEGATIVE_LABEL: u8 = 0;

/// Identifier suffix distinguishing negative samples.
pub const NEGATIVE_SUFFIX: &str = "_neg";

#[derive(Debug, Clone)]
pub struct AssemblyConfig {
    pub year: i32,
    /// Magnitude of the per-axis offset for negative samples (degrees).
    pub offset_deg: f64,
    /// Random subset size; `None` keeps every sample.
    pub sample_count: Option<usize>,
    pub destination: PathBuf,
}

/// Everything a run produced, in manifest order.
#[derive(Debug, Clone, Default)]
pub struct AssemblyReport {
    pub manifest: Vec<ManifestEntry>,
    pub positive: AcquisitionSummary,
    pub negative: AcquisitionSummary,
    pub outcomes: Vec<AcquisitionOutcome>,
}

impl AssemblyReport {
    pub fn summary(&self) -> AcquisitionSummary {
        self.positive + self.negative
    }
}

/// Drives the positive and negative passes over one sample set.
///
/// All randomness comes from the supplied generator: subset selection
/// first, then one `(lat sign, lon sign)` draw per selected sample.
pub struct DatasetAssembler<R: Rng> {
    config: AssemblyConfig,
    rng: R,
}

impl<R: Rng> DatasetAssembler<R> {
    pub fn new(config: AssemblyConfig, rng: R) -> Self {
        Self { config, rng }
    }

    /// Seeded random subset, kept in traversal order.
    pub fn select<'a>(&mut self, samples: &'a [SampleRecord]) -> Vec<&'a SampleRecord> {
        match self.config.sample_count {
            Some(n) if n < samples.len() => {
                let mut picked = index::sample(&mut self.rng, samples.len(), n).into_vec();
                picked.sort_unstable();
                picked.into_iter().map(|i| &samples[i]).collect()
            }
            _ => samples.iter().collect(),
        }
    }

    pub fn positive_items(&self, samples: &[&SampleRecord]) -> Vec<WorkItem> {
        samples
            .iter()
            .enumerate()
            .map(|(i, s)| WorkItem {
                lat: s.lat,
                lon: s.lon,
                year: self.config.year,
                identifier: format!("{}_{}", s.hash, self.config.year),
                destination_folder: self.config.destination.clone(),
                sequence_index: i,
            })
            .collect()
    }

    /// Offset every sample by `offset_deg` on both axes, signs drawn per sample.
    pub fn negative_items(&mut self, samples: &[&SampleRecord]) -> Vec<WorkItem> {
        let offset = self.config.offset_deg;
        samples
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let lat_sign = if self.rng.gen_bool(0.5) { 1.0 } else { -1.0 };
                let lon_sign = if self.rng.gen_bool(0.5) { 1.0 } else { -1.0 };
                WorkItem {
                    lat: s.lat + lat_sign * offset,
                    lon: s.lon + lon_sign * offset,
                    year: self.config.year,
                    identifier: format!("{}_{}{NEGATIVE_SUFFIX}", s.hash, self.config.year),
                    destination_folder: self.config.destination.clone(),
                    sequence_index: samples.len() + i,
                }
            })
            .collect()
    }

    pub fn assemble(
        &mut self,
        samples: &[SampleRecord],
        orchestrator: &Orchestrator,
    ) -> AssemblyReport {
        let selected = self.select(samples);
        info!("assembling dataset from {} of {} samples", selected.len(), samples.len());

        let positives = self.positive_items(&selected);
        let negatives = self.negative_items(&selected);

        info!("positive pass: {} items", positives.len());
        let mut outcomes = orchestrator.acquire(&positives);
        let positive = AcquisitionSummary::from_outcomes(&outcomes);
        info!("positive pass: {positive}");

        info!("negative pass: {} items", negatives.len());
        let negative_outcomes = orchestrator.acquire(&negatives);
        let negative = AcquisitionSummary::from_outcomes(&negative_outcomes);
        info!("negative pass: {negative}");
        outcomes.extend(negative_outcomes);

        // Every attempted item is recorded, whatever its outcome.
        let manifest = positives
            .iter()
            .map(|item| ManifestEntry::for_item(item, POSITIVE_LABEL))
            .chain(
                negatives
                    .iter()
                    .map(|item| ManifestEntry::for_item(item, NEGATIVE_LABEL)),
            )
            .collect();

        AssemblyReport {
            manifest,
            positive,
            negative,
            outcomes,
        }
    }
}
