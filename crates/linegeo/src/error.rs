use std::io;
use std::path::PathBuf;

/// Unexpected geometry structure found while extracting points.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GeometryError {
    #[error("unsupported geometry kind: {0}")]
    Unsupported(&'static str),

    #[error("non-finite coordinate ({x}, {y})")]
    NonFinite { x: f64, y: f64 },
}

/// Failures of the geospatial-access layer (reading, reprojecting).
#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported CRS {0:?}")]
    UnsupportedCrs(String),

    #[error("feature {index}: {reason}")]
    BadFeature { index: usize, reason: String },
}

/// Errors that abort a sample-set build.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Layer(#[from] LayerError),

    #[error("feature {index} has no {field:?} property")]
    MissingField { index: usize, field: String },

    #[error("feature {feature_id} in region {region_code}: {source}")]
    Geometry {
        feature_id: String,
        region_code: String,
        #[source]
        source: GeometryError,
    },
}
