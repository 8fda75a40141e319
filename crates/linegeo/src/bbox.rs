use crate::Point;

/// Mean Earth radius (metres) used for the angular half-extent.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Axis-aligned region in EPSG:4326 degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl BoundingBox {
    /// Square box with the given side length (metres) centred on `(lat, lon)`.
    ///
    /// The longitude half-extent is widened by `1 / cos(lat)` to account for
    /// meridian convergence, so the box is undefined at the poles.
    /// See <http://www.movable-type.co.uk/scripts/latlong.html#rhumblines>.
    #[inline]
    pub fn around(lat: f64, lon: f64, side_length_m: f64) -> Self {
        let angular_half_extent = (0.5 * side_length_m / EARTH_RADIUS_M).to_degrees();

        let delta_lat = angular_half_extent;
        let delta_lon = angular_half_extent / lat.to_radians().cos();

        Self {
            south: lat - delta_lat,
            west: lon - delta_lon,
            north: lat + delta_lat,
            east: lon + delta_lon,
        }
    }

    /// Midpoint of the latitude and longitude spans.
    #[inline]
    pub fn center(&self) -> Point {
        Point {
            lat: 0.5 * (self.south + self.north),
            lon: 0.5 * (self.west + self.east),
        }
    }

    /// Rectangle in `[west, south, east, north]` order, the form imagery services take.
    #[inline]
    pub fn to_rectangle(&self) -> [f64; 4] {
        [self.west, self.south, self.east, self.north]
    }
}
