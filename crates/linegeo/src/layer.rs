//! Geospatial access: reading vector layers, reprojection and overlay.
//!
//! The core only talks to [`GeoAccess`]. [`GeoJsonAccess`] is the bundled
//! implementation: GeoJSON FeatureCollections (with the legacy `crs` member),
//! spherical Web Mercator <-> WGS 84, and `geo` boolean ops for clipping.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use geo::{
    BooleanOps, Contains, Coord, EuclideanDistance, Geometry, GeometryCollection, Intersects,
    LineLocatePoint, LineString, MapCoords, MultiLineString, MultiPoint, MultiPolygon, Point,
    Polygon,
};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::LayerError;

/// Web Mercator sphere radius (metres).
const MERCATOR_RADIUS_M: f64 = 6_378_137.0;

/// Coordinate reference systems the bundled adapter can convert between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crs {
    /// EPSG:4326 geodetic degrees, `x = lon, y = lat`.
    Wgs84,
    /// EPSG:3857 spherical mercator metres.
    WebMercator,
}

impl Crs {
    /// Parse the names that show up in GeoJSON `crs` members and CLI flags.
    pub fn from_name(name: &str) -> Result<Self, LayerError> {
        let upper = name.trim().to_ascii_uppercase();
        let code = upper
            .rsplit(|c: char| c == ':' || c == '/')
            .next()
            .unwrap_or_default();

        match code {
            "4326" | "CRS84" => Ok(Crs::Wgs84),
            "3857" | "900913" | "3785" => Ok(Crs::WebMercator),
            _ => Err(LayerError::UnsupportedCrs(name.to_owned())),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Crs::Wgs84 => "EPSG:4326",
            Crs::WebMercator => "EPSG:3857",
        }
    }

    /// Projected coordinate back to WGS 84 degrees.
    fn inverse(self, c: Coord<f64>) -> Coord<f64> {
        match self {
            Crs::Wgs84 => c,
            Crs::WebMercator => Coord {
                x: (c.x / MERCATOR_RADIUS_M).to_degrees(),
                y: (2.0 * (c.y / MERCATOR_RADIUS_M).exp().atan() - std::f64::consts::FRAC_PI_2)
                    .to_degrees(),
            },
        }
    }

    /// WGS 84 degrees into this CRS.
    fn forward(self, c: Coord<f64>) -> Coord<f64> {
        match self {
            Crs::Wgs84 => c,
            Crs::WebMercator => Coord {
                x: MERCATOR_RADIUS_M * c.x.to_radians(),
                y: MERCATOR_RADIUS_M
                    * (std::f64::consts::FRAC_PI_4 + 0.5 * c.y.to_radians())
                        .tan()
                        .ln(),
            },
        }
    }
}

impl std::fmt::Display for Crs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A single feature: free-form attributes plus geometry.
#[derive(Debug, Clone)]
pub struct LayerFeature {
    pub properties: Map<String, Value>,
    pub geometry: Geometry<f64>,
}

impl LayerFeature {
    /// String or number attribute, rendered as text.
    pub fn property(&self, key: &str) -> Option<String> {
        match self.properties.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// A set of features sharing one CRS.
#[derive(Debug, Clone)]
pub struct VectorLayer {
    pub crs: Crs,
    pub features: Vec<LayerFeature>,
}

/// Everything the sample-set builder needs from a geospatial library.
pub trait GeoAccess {
    /// Load a vector layer from storage.
    fn read_layer(&self, path: &Path) -> Result<VectorLayer, LayerError>;

    /// Re-express every geometry of `layer` in `target`.
    fn reproject(&self, layer: VectorLayer, target: Crs) -> Result<VectorLayer, LayerError>;

    /// Part of `geometry` inside `region`, or `None` when they do not overlap.
    ///
    /// The result type may differ from the input type.
    fn intersect(
        &self,
        geometry: &Geometry<f64>,
        region: &MultiPolygon<f64>,
    ) -> Option<Geometry<f64>>;
}

/// GeoJSON-backed [`GeoAccess`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoJsonAccess;

impl GeoAccess for GeoJsonAccess {
    fn read_layer(&self, path: &Path) -> Result<VectorLayer, LayerError> {
        info!("loading {}...", path.display());

        let file = File::open(path).map_err(|source| LayerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let root: FeatureCollection =
            serde_json::from_reader(BufReader::new(file)).map_err(|source| LayerError::Json {
                path: path.to_path_buf(),
                source,
            })?;

        let layer = root.into_layer()?;
        info!(
            "{}: {} features in {}",
            path.display(),
            layer.features.len(),
            layer.crs
        );
        Ok(layer)
    }

    fn reproject(&self, layer: VectorLayer, target: Crs) -> Result<VectorLayer, LayerError> {
        if layer.crs == target {
            return Ok(layer);
        }

        debug!("reprojecting {} features {} -> {}", layer.features.len(), layer.crs, target);
        let source = layer.crs;
        let features = layer
            .features
            .into_iter()
            .map(|feature| LayerFeature {
                geometry: feature
                    .geometry
                    .map_coords(|c| target.forward(source.inverse(c))),
                properties: feature.properties,
            })
            .collect();

        Ok(VectorLayer {
            crs: target,
            features,
        })
    }

    fn intersect(
        &self,
        geometry: &Geometry<f64>,
        region: &MultiPolygon<f64>,
    ) -> Option<Geometry<f64>> {
        match geometry {
            Geometry::Point(p) => region.intersects(p).then(|| Geometry::Point(*p)),
            Geometry::MultiPoint(mp) => {
                let kept: Vec<Point<f64>> =
                    mp.iter().filter(|p| region.intersects(*p)).copied().collect();
                (!kept.is_empty()).then(|| Geometry::MultiPoint(MultiPoint::new(kept)))
            }
            Geometry::Line(line) => {
                let ls = LineString::new(vec![line.start, line.end]);
                clip_lines(region, MultiLineString::new(vec![ls]))
            }
            Geometry::LineString(ls) => {
                if region.contains(ls) {
                    return Some(geometry.clone());
                }
                clip_lines(region, MultiLineString::new(vec![ls.clone()]))
            }
            Geometry::MultiLineString(mls) => {
                if region.contains(mls) {
                    return Some(geometry.clone());
                }
                clip_lines(region, mls.clone())
            }
            Geometry::Polygon(poly) => clip_polygons(region, MultiPolygon::new(vec![poly.clone()])),
            Geometry::MultiPolygon(mp) => clip_polygons(region, mp.clone()),
            Geometry::Rect(rect) => clip_polygons(region, MultiPolygon::new(vec![rect.to_polygon()])),
            Geometry::Triangle(tri) => {
                clip_polygons(region, MultiPolygon::new(vec![tri.to_polygon()]))
            }
            Geometry::GeometryCollection(gc) => {
                let parts: Vec<Geometry<f64>> =
                    gc.iter().filter_map(|g| self.intersect(g, region)).collect();
                (!parts.is_empty()).then(|| Geometry::GeometryCollection(GeometryCollection(parts)))
            }
        }
    }
}

fn clip_lines(region: &MultiPolygon<f64>, lines: MultiLineString<f64>) -> Option<Geometry<f64>> {
    let clipped = region.clip(&lines, false);

    // Boolean ops do not preserve direction; pieces are put back in input order.
    let mut pieces: Vec<(usize, f64, LineString<f64>)> = clipped
        .0
        .into_iter()
        .filter(|ls| ls.0.len() >= 2)
        .map(|piece| orient_along(piece, &lines))
        .collect();
    pieces.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));

    let mut pieces: Vec<LineString<f64>> = pieces.into_iter().map(|(_, _, ls)| ls).collect();
    match pieces.len() {
        0 => None,
        1 => pieces.pop().map(Geometry::LineString),
        _ => Some(Geometry::MultiLineString(MultiLineString::new(pieces))),
    }
}

/// Part index and start fraction of `piece` along `lines`.
///
/// The piece is reversed if it runs against its source part.
fn orient_along(
    mut piece: LineString<f64>,
    lines: &MultiLineString<f64>,
) -> (usize, f64, LineString<f64>) {
    let first = Point(piece.0[0]);
    let part = lines
        .0
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            first
                .euclidean_distance(*a)
                .total_cmp(&first.euclidean_distance(*b))
        })
        .map(|(i, _)| i)
        .unwrap_or(0);
    let Some(source) = lines.0.get(part) else {
        return (part, 0.0, piece);
    };

    let locate = |c: Coord<f64>| source.line_locate_point(&Point(c)).unwrap_or(0.0);
    let start = locate(piece.0[0]);
    let mut end = locate(piece.0[piece.0.len() - 1]);
    if end == start {
        // Closed or degenerate piece: the second vertex gives the direction.
        end = locate(piece.0[1]);
    }

    if end < start {
        piece.0.reverse();
        let start = locate(piece.0[0]);
        (part, start, piece)
    } else {
        (part, start, piece)
    }
}

fn clip_polygons(region: &MultiPolygon<f64>, polys: MultiPolygon<f64>) -> Option<Geometry<f64>> {
    let mut clipped = region.intersection(&polys);

    match clipped.0.len() {
        0 => None,
        1 => clipped.0.pop().map(Geometry::Polygon),
        _ => Some(Geometry::MultiPolygon(clipped)),
    }
}

/// Polygonal area of a boundary feature, if it has one.
pub fn as_multi_polygon(geometry: &Geometry<f64>) -> Option<MultiPolygon<f64>> {
    match geometry {
        Geometry::Polygon(p) => Some(MultiPolygon::new(vec![p.clone()])),
        Geometry::MultiPolygon(mp) => Some(mp.clone()),
        Geometry::Rect(r) => Some(MultiPolygon::new(vec![r.to_polygon()])),
        Geometry::GeometryCollection(gc) => {
            let polys: Vec<Polygon<f64>> = gc
                .iter()
                .filter_map(as_multi_polygon)
                .flat_map(|mp| mp.0)
                .collect();
            (!polys.is_empty()).then(|| MultiPolygon::new(polys))
        }
        _ => None,
    }
}

// ==============================
// === GeoJSON wire structures ===
// ==============================

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    crs: Option<NamedCrs>,
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct NamedCrs {
    properties: NamedCrsProperties,
}

#[derive(Debug, Deserialize)]
struct NamedCrsProperties {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Feature {
    geometry: Option<GeoJsonGeometry>,
    #[serde(default)]
    properties: Option<Map<String, Value>>,
}

type Position = Vec<f64>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum GeoJsonGeometry {
    Point { coordinates: Position },
    MultiPoint { coordinates: Vec<Position> },
    LineString { coordinates: Vec<Position> },
    MultiLineString { coordinates: Vec<Vec<Position>> },
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
    GeometryCollection { geometries: Vec<GeoJsonGeometry> },
}

impl FeatureCollection {
    fn into_layer(self) -> Result<VectorLayer, LayerError> {
        let crs = match &self.crs {
            Some(named) => Crs::from_name(&named.properties.name)?,
            None => Crs::Wgs84,
        };

        let mut features = Vec::with_capacity(self.features.len());
        for (index, feature) in self.features.into_iter().enumerate() {
            let Some(geometry) = feature.geometry else {
                warn!("feature {index} has a null geometry, skipping");
                continue;
            };
            let geometry = geometry
                .into_geo()
                .map_err(|reason| LayerError::BadFeature { index, reason })?;

            features.push(LayerFeature {
                properties: feature.properties.unwrap_or_default(),
                geometry,
            });
        }

        Ok(VectorLayer { crs, features })
    }
}

impl GeoJsonGeometry {
    fn into_geo(self) -> Result<Geometry<f64>, String> {
        Ok(match self {
            GeoJsonGeometry::Point { coordinates } => Geometry::Point(Point(coord(&coordinates)?)),
            GeoJsonGeometry::MultiPoint { coordinates } => Geometry::MultiPoint(MultiPoint::new(
                coordinates
                    .iter()
                    .map(|p| coord(p).map(Point))
                    .collect::<Result<_, _>>()?,
            )),
            GeoJsonGeometry::LineString { coordinates } => {
                Geometry::LineString(line_string(&coordinates)?)
            }
            GeoJsonGeometry::MultiLineString { coordinates } => {
                Geometry::MultiLineString(MultiLineString::new(
                    coordinates
                        .iter()
                        .map(|part| line_string(part))
                        .collect::<Result<_, _>>()?,
                ))
            }
            GeoJsonGeometry::Polygon { coordinates } => Geometry::Polygon(polygon(&coordinates)?),
            GeoJsonGeometry::MultiPolygon { coordinates } => {
                Geometry::MultiPolygon(MultiPolygon::new(
                    coordinates
                        .iter()
                        .map(|rings| polygon(rings))
                        .collect::<Result<_, _>>()?,
                ))
            }
            GeoJsonGeometry::GeometryCollection { geometries } => {
                Geometry::GeometryCollection(GeometryCollection(
                    geometries
                        .into_iter()
                        .map(GeoJsonGeometry::into_geo)
                        .collect::<Result<_, _>>()?,
                ))
            }
        })
    }
}

#[inline]
fn coord(position: &[f64]) -> Result<Coord<f64>, String> {
    match position {
        [x, y, ..] => Ok(Coord { x: *x, y: *y }),
        _ => Err(format!("position needs at least 2 values, got {}", position.len())),
    }
}

fn line_string(positions: &[Position]) -> Result<LineString<f64>, String> {
    positions
        .iter()
        .map(|p| coord(p))
        .collect::<Result<Vec<_>, _>>()
        .map(LineString::new)
}

fn polygon(rings: &[Vec<Position>]) -> Result<Polygon<f64>, String> {
    let (exterior, interiors) = rings
        .split_first()
        .ok_or_else(|| "polygon without rings".to_owned())?;

    Ok(Polygon::new(
        line_string(exterior)?,
        interiors
            .iter()
            .map(|ring| line_string(ring))
            .collect::<Result<_, _>>()?,
    ))
}
