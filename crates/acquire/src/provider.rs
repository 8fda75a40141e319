use std::io;
use std::path::{Path, PathBuf};

use linegeo::BoundingBox;

/// Parameters shared by every composite request of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageryOptions {
    /// Image collection the mosaic is assembled from.
    pub collection: String,
    /// Bands to keep; the first one is the primary raster.
    pub bands: Vec<String>,
    /// Scenes with a cloud-cover percentage at or above this are dropped.
    pub max_cloud_cover: f64,
    /// Output resolution handed to the provider (metres per pixel).
    pub scale: f64,
}

impl Default for ImageryOptions {
    fn default() -> Self {
        Self {
            collection: "LANDSAT/LE07/C01/T1".into(),
            bands: vec!["B8".into()],
            max_cloud_cover: 33.0,
            scale: 1.0,
        }
    }
}

/// Cloud-filtered mosaic of one region over a date range.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeRequest {
    pub region: BoundingBox,
    /// Inclusive, `YYYY-MM-DD`.
    pub start_date: String,
    /// Exclusive, `YYYY-MM-DD`.
    pub end_date: String,
    pub bands: Vec<String>,
    pub max_cloud_cover: f64,
    pub collection: String,
}

impl CompositeRequest {
    /// Whole calendar year `year`.
    pub fn for_year(region: BoundingBox, year: i32, options: &ImageryOptions) -> Self {
        Self {
            region,
            start_date: format!("{year}-01-01"),
            end_date: format!("{}-01-01", year + 1),
            bands: options.bands.clone(),
            max_cloud_cover: options.max_cloud_cover,
            collection: options.collection.clone(),
        }
    }
}

/// A composite prepared by the provider but not yet written anywhere.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageHandle {
    pub request: CompositeRequest,
    /// Provider-specific reference, if the provider keeps server-side state.
    pub token: Option<String>,
}

/// Where and how a composite should be written locally.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializeTarget {
    /// Temporary base name; unique per work item.
    pub name: String,
    pub scale: f64,
    pub staging_dir: PathBuf,
}

/// Exact files a provider produced for one composite.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterializedImage {
    /// `(band, path)` for every raster written.
    pub rasters: Vec<(String, PathBuf)>,
    /// Intermediate archive, removed once rasters are moved.
    pub archive: Option<PathBuf>,
    /// Intermediate directory, removed once rasters are moved.
    pub work_dir: Option<PathBuf>,
}

impl MaterializedImage {
    pub fn raster_for(&self, band: &str) -> Option<&Path> {
        self.rasters
            .iter()
            .find(|(b, _)| b == band)
            .map(|(_, p)| p.as_path())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("invalid composite request: {0}")]
    InvalidRequest(String),

    #[error("failed to launch {command}: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("archive {}: {source}", .path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("i/o on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Imagery service client.
///
/// One instance is shared by every worker of a batch, so implementations
/// must tolerate concurrent calls for distinct targets.
pub trait ImageryProvider: Send + Sync {
    /// Prepare a single mosaicked, clipped composite for `request`.
    fn composite(&self, request: &CompositeRequest) -> Result<ImageHandle, ProviderError>;

    /// Write `image` under `target` and report every file produced.
    ///
    /// On error the provider removes whatever it wrote.
    fn materialize(
        &self,
        image: &ImageHandle,
        target: &MaterializeTarget,
    ) -> Result<MaterializedImage, ProviderError>;
}
