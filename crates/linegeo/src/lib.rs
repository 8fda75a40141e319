//! linegeo: turns transmission-line vector layers into content-addressed sample points.
//!
//! - `bbox`: square region of a given side length centred on a lat/lon point.
//! - `extract`: flattens (multi-part) geometries into ordered `(lat, lon)` points.
//! - `layer`: GeoJSON layer access, EPSG:3857 <-> EPSG:4326 reprojection, overlay.
//! - `sample`: region join + explode + SHA-256 identifiers per point.
//!
//! Coordinates inside `geo` geometries follow the usual `x = lon, y = lat`
//! storage order. Everything this crate hands out as a [`Point`] is already
//! flipped to `(lat, lon)`.

pub mod bbox;
pub mod error;
pub mod extract;
pub mod layer;
pub mod sample;

pub use bbox::{BoundingBox, EARTH_RADIUS_M};
pub use error::{BuildError, GeometryError, LayerError};
pub use extract::extract_points;
pub use layer::{Crs, GeoAccess, GeoJsonAccess, LayerFeature, VectorLayer};
pub use sample::{
    canonical_coordinate, sample_hash, FeatureRecord, LayerFields, RegionFilter, SampleRecord,
    SampleSetBuilder,
};

/// A geodetic point in degrees.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Point {
    pub lat: f64,
    pub lon: f64,
}

impl Point {
    #[inline]
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}
