use std::path::PathBuf;

use acquire::{AcquireOptions, ImageryOptions};
use clap::Parser;
use linegeo::{LayerFields, RegionFilter};

use crate::assemble::AssemblyConfig;

/// `dataset_builder` - labeled satellite imagery around transmission lines.
///
/// Explodes a line layer into vertices, joins them with region boundaries,
/// then acquires one image per vertex (label 1) and one per randomly offset
/// vertex (label 0). Already-downloaded images are skipped, so an
/// interrupted run can simply be started again.
#[derive(Parser, Debug, Clone)]
#[command(name = "dataset_builder", version, about, long_about = None)]
pub struct Config {
    /// Transmission-line layer (GeoJSON FeatureCollection).
    #[arg(long, env = "TLDS_LINES")]
    pub lines: PathBuf,

    /// Region boundary layer (GeoJSON FeatureCollection of polygons).
    #[arg(long, env = "TLDS_REGIONS")]
    pub regions: PathBuf,

    /// Keep only these regions (name or abbreviation). Repeatable or comma-separated.
    #[arg(long = "region", env = "TLDS_REGION", value_delimiter = ',')]
    pub region: Vec<String>,

    #[arg(long, env = "TLDS_REGION_CODE_FIELD", default_value = "STUSPS")]
    pub region_code_field: String,

    #[arg(long, env = "TLDS_REGION_NAME_FIELD", default_value = "NAME")]
    pub region_name_field: String,

    #[arg(long, env = "TLDS_FEATURE_ID_FIELD", default_value = "ID")]
    pub feature_id_field: String,

    /// Randomly keep this many sample points (all when omitted).
    #[arg(long, env = "TLDS_SAMPLE_COUNT")]
    pub sample_count: Option<usize>,

    /// Seed for sample selection and negative offsets.
    #[arg(long, env = "TLDS_SEED", default_value_t = 0)]
    pub seed: u64,

    /// Offset applied to each axis of a negative sample (degrees).
    #[arg(long, env = "TLDS_OFFSET_DEG", default_value_t = 0.01)]
    pub offset_deg: f64,

    /// Worker pool size.
    #[arg(long, env = "TLDS_WORKERS", default_value_t = 8)]
    pub workers: usize,

    /// Side length of each image footprint (metres).
    #[arg(long, env = "TLDS_SIDE_LENGTH_M", default_value_t = 2000.0)]
    pub side_length_m: f64,

    /// Calendar year the composite is built from.
    #[arg(long, env = "TLDS_YEAR", default_value_t = 2019)]
    pub year: i32,

    /// Bands to request; the first is the primary raster.
    #[arg(long, env = "TLDS_BANDS", value_delimiter = ',', default_value = "B8")]
    pub bands: Vec<String>,

    /// Drop scenes with a cloud cover percentage at or above this.
    #[arg(long, env = "TLDS_MAX_CLOUD_COVER", default_value_t = 33.0)]
    pub max_cloud_cover: f64,

    #[arg(long, env = "TLDS_COLLECTION", default_value = "LANDSAT/LE07/C01/T1")]
    pub collection: String,

    /// Export resolution (metres per pixel).
    #[arg(long, env = "TLDS_SCALE", default_value_t = 1.0)]
    pub scale: f64,

    /// Re-download images that already exist.
    #[arg(long, env = "TLDS_FORCE", default_value_t = false)]
    pub force: bool,

    /// Helper executable that exports composites as zip archives.
    #[arg(long, env = "TLDS_PROVIDER_CMD")]
    pub provider_cmd: PathBuf,

    /// Extra leading arguments for the helper. Repeatable.
    #[arg(long = "provider-arg", env = "TLDS_PROVIDER_ARG")]
    pub provider_args: Vec<String>,

    #[arg(long, env = "TLDS_STAGING_DIR", default_value = "staging")]
    pub staging_dir: PathBuf,

    /// Destination directory for rasters.
    #[arg(long, env = "TLDS_OUT_DIR", default_value = "images")]
    pub out_dir: PathBuf,

    #[arg(long, env = "TLDS_MANIFEST", default_value = "dataset.csv")]
    pub manifest: PathBuf,

    /// Exit with an error when more than this many items fail.
    #[arg(long, env = "TLDS_MAX_FAILED")]
    pub max_failed: Option<usize>,

    /// Also write the full sample set as JSON Lines.
    #[arg(long, env = "TLDS_SAMPLES_OUT")]
    pub samples_out: Option<PathBuf>,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.workers > 0, "--workers must be at least 1");
        anyhow::ensure!(
            self.side_length_m.is_finite() && self.side_length_m > 0.0,
            "--side-length-m must be positive"
        );
        anyhow::ensure!(
            self.offset_deg.is_finite() && self.offset_deg >= 0.0,
            "--offset-deg must be non-negative"
        );
        anyhow::ensure!(!self.bands.is_empty(), "--bands must name at least one band");
        anyhow::ensure!(
            (0.0..=100.0).contains(&self.max_cloud_cover),
            "--max-cloud-cover must be within 0..=100"
        );
        Ok(())
    }

    pub fn region_filter(&self) -> RegionFilter {
        RegionFilter::new(self.region.iter().map(|r| r.trim()).filter(|r| !r.is_empty()))
    }

    pub fn layer_fields(&self) -> LayerFields {
        LayerFields {
            region_code: self.region_code_field.clone(),
            region_name: self.region_name_field.clone(),
            feature_id: self.feature_id_field.clone(),
        }
    }

    pub fn acquire_options(&self) -> AcquireOptions {
        AcquireOptions {
            workers: self.workers,
            side_length_m: self.side_length_m,
            imagery: ImageryOptions {
                collection: self.collection.clone(),
                bands: self.bands.clone(),
                max_cloud_cover: self.max_cloud_cover,
                scale: self.scale,
            },
            staging_dir: self.staging_dir.clone(),
            force: self.force,
        }
    }

    pub fn assembly_config(&self) -> AssemblyConfig {
        AssemblyConfig {
            year: self.year,
            offset_deg: self.offset_deg,
            sample_count: self.sample_count,
            destination: self.out_dir.clone(),
        }
    }
}
