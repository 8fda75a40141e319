//! Region join, explode and content hashing.

use std::collections::{HashMap, HashSet};

use geo::{BoundingRect, Geometry, MultiPolygon};
use log::{debug, info, warn};
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::layer::as_multi_polygon;
use crate::{extract_points, BuildError, Crs, GeoAccess, LayerFeature, VectorLayer};

/// Fractional digits used when coordinates are rendered for hashing.
pub const HASH_COORD_DECIMALS: usize = 8;

/// Boundary names or abbreviations to keep. Empty keeps everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionFilter(Vec<String>);

impl RegionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new<I, S>(regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(regions.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Exact, case-sensitive match against either the code or the name.
    pub fn matches(&self, code: &str, name: &str) -> bool {
        self.0.is_empty() || self.0.iter().any(|r| r == code || r == name)
    }
}

impl From<&str> for RegionFilter {
    fn from(region: &str) -> Self {
        Self(vec![region.to_owned()])
    }
}

impl From<Vec<String>> for RegionFilter {
    fn from(regions: Vec<String>) -> Self {
        Self(regions)
    }
}

/// Attribute names used to read region and feature keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerFields {
    pub region_code: String,
    pub region_name: String,
    pub feature_id: String,
}

impl Default for LayerFields {
    fn default() -> Self {
        Self {
            region_code: "STUSPS".into(),
            region_name: "NAME".into(),
            feature_id: "ID".into(),
        }
    }
}

/// A vector feature clipped to one region, before explosion.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    pub region_code: String,
    pub region_name: String,
    pub feature_id: String,
    pub geometry: Geometry<f64>,
}

/// One exploded coordinate with its content-addressed identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub region_code: String,
    pub region_name: String,
    pub feature_id: String,
    pub lat: f64,
    pub lon: f64,
    pub hash: String,
}

/// Fixed-precision rendering of a coordinate; `-0.0` renders as `0.0`.
#[inline]
pub fn canonical_coordinate(value: f64) -> String {
    let value = if value == 0.0 { 0.0 } else { value };
    format!("{value:.prec$}", prec = HASH_COORD_DECIMALS)
}

/// Lowercase hex SHA-256 of `feature_id + lat + lon` in canonical form.
pub fn sample_hash(feature_id: &str, lat: f64, lon: f64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(feature_id.as_bytes());
    hasher.update(canonical_coordinate(lat).as_bytes());
    hasher.update(canonical_coordinate(lon).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Boundary polygon retained after filtering.
#[derive(Debug, Clone)]
struct Region {
    code: String,
    name: String,
    area: MultiPolygon<f64>,
}

/// R-tree entry pointing back into the region list.
struct RegionEnvelope {
    index: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for RegionEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Turns a line layer and a boundary layer into [`SampleRecord`]s.
pub struct SampleSetBuilder<'a, G: GeoAccess> {
    access: &'a G,
    fields: LayerFields,
}

impl<'a, G: GeoAccess> SampleSetBuilder<'a, G> {
    pub fn new(access: &'a G, fields: LayerFields) -> Self {
        Self { access, fields }
    }

    /// Join, explode and hash.
    ///
    /// Output follows the feature -> region -> point traversal order.
    /// Points whose hash was already emitted are dropped, first one wins.
    pub fn build(
        &self,
        vector: VectorLayer,
        boundaries: VectorLayer,
        filter: &RegionFilter,
    ) -> Result<Vec<SampleRecord>, BuildError> {
        // Emitted coordinates must be geodetic degrees.
        let vector = self.access.reproject(vector, Crs::Wgs84)?;
        let boundaries = self.access.reproject(boundaries, vector.crs)?;

        let regions = self.retain_regions(boundaries, filter)?;
        let features = self.overlay(&vector, &regions)?;
        let records = explode(&features)?;

        info!(
            "{} features across {} regions -> {} sample points",
            features.len(),
            regions.len(),
            records.len()
        );
        Ok(records)
    }

    fn retain_regions(
        &self,
        boundaries: VectorLayer,
        filter: &RegionFilter,
    ) -> Result<Vec<Region>, BuildError> {
        if !filter.is_empty() {
            info!("trimming boundaries to regions {}", filter.0.join(", "));
        }

        let mut regions = Vec::new();
        for (index, feature) in boundaries.features.iter().enumerate() {
            let code = self.field(feature, index, &self.fields.region_code)?;
            let name = self.field(feature, index, &self.fields.region_name)?;

            if !filter.matches(&code, &name) {
                continue;
            }

            let Some(area) = as_multi_polygon(&feature.geometry) else {
                warn!("boundary {code} ({name}) is not polygonal, skipping");
                continue;
            };
            regions.push(Region { code, name, area });
        }

        debug!("retained {} of {} boundaries", regions.len(), boundaries.features.len());
        Ok(regions)
    }

    /// Clip every feature against every region it touches.
    fn overlay(
        &self,
        vector: &VectorLayer,
        regions: &[Region],
    ) -> Result<Vec<FeatureRecord>, BuildError> {
        let tree = RTree::bulk_load(
            regions
                .iter()
                .enumerate()
                .filter_map(|(index, region)| {
                    let rect = region.area.bounding_rect()?;
                    Some(RegionEnvelope {
                        index,
                        envelope: AABB::from_corners(
                            [rect.min().x, rect.min().y],
                            [rect.max().x, rect.max().y],
                        ),
                    })
                })
                .collect(),
        );

        let mut records = Vec::new();
        for (index, feature) in vector.features.iter().enumerate() {
            let feature_id = self.field(feature, index, &self.fields.feature_id)?;
            let Some(rect) = feature.geometry.bounding_rect() else {
                continue;
            };

            let query =
                AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]);
            let mut candidates: Vec<usize> = tree
                .locate_in_envelope_intersecting(&query)
                .map(|entry| entry.index)
                .collect();
            candidates.sort_unstable();

            for region in candidates.into_iter().map(|i| &regions[i]) {
                if let Some(geometry) = self.access.intersect(&feature.geometry, &region.area) {
                    records.push(FeatureRecord {
                        region_code: region.code.clone(),
                        region_name: region.name.clone(),
                        feature_id: feature_id.clone(),
                        geometry,
                    });
                }
            }
        }

        Ok(records)
    }

    #[inline]
    fn field(&self, feature: &LayerFeature, index: usize, key: &str) -> Result<String, BuildError> {
        feature.property(key).ok_or_else(|| BuildError::MissingField {
            index,
            field: key.to_owned(),
        })
    }
}

/// Group by `(region_code, region_name, feature_id)` and emit one record per point.
pub fn explode(features: &[FeatureRecord]) -> Result<Vec<SampleRecord>, BuildError> {
    // Groups keep first-seen order.
    let mut order: Vec<(&str, &str, &str)> = Vec::new();
    let mut groups: HashMap<(&str, &str, &str), Vec<&Geometry<f64>>> = HashMap::new();
    for f in features {
        let key = (f.region_code.as_str(), f.region_name.as_str(), f.feature_id.as_str());
        groups
            .entry(key)
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(&f.geometry);
    }

    let mut seen = HashSet::new();
    let mut records = Vec::new();
    for key @ (region_code, region_name, feature_id) in order {
        for geometry in &groups[&key] {
            let points = extract_points(geometry).map_err(|source| BuildError::Geometry {
                feature_id: feature_id.to_owned(),
                region_code: region_code.to_owned(),
                source,
            })?;

            for p in points {
                let hash = sample_hash(feature_id, p.lat, p.lon);
                if !seen.insert(hash.clone()) {
                    continue;
                }
                records.push(SampleRecord {
                    region_code: region_code.to_owned(),
                    region_name: region_name.to_owned(),
                    feature_id: feature_id.to_owned(),
                    lat: p.lat,
                    lon: p.lon,
                    hash,
                });
            }
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GeoJsonAccess, GeometryError};
    use geo::{line_string, polygon, Rect};
    use serde_json::{json, Map, Value};

    fn props(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    fn state(code: &str, name: &str, x0: f64, x1: f64) -> LayerFeature {
        LayerFeature {
            properties: props(&[("STUSPS", json!(code)), ("NAME", json!(name))]),
            geometry: polygon![
                (x: x0, y: 0.0),
                (x: x1, y: 0.0),
                (x: x1, y: 10.0),
                (x: x0, y: 10.0),
                (x: x0, y: 0.0),
            ]
            .into(),
        }
    }

    fn line(id: Value, geometry: Geometry<f64>) -> LayerFeature {
        LayerFeature {
            properties: props(&[("ID", id)]),
            geometry,
        }
    }

    fn layers(lines: Vec<LayerFeature>) -> (VectorLayer, VectorLayer) {
        (
            VectorLayer {
                crs: Crs::Wgs84,
                features: lines,
            },
            VectorLayer {
                crs: Crs::Wgs84,
                features: vec![
                    state("MI", "Michigan", 0.0, 10.0),
                    state("ME", "Maine", 10.0, 20.0),
                    state("FL", "Florida", 30.0, 40.0),
                ],
            },
        )
    }

    #[test]
    fn hash_is_deterministic_and_sensitive_to_every_input() {
        let base = sample_hash("X1", 42.0, -84.0);
        assert_eq!(base, sample_hash("X1", 42.0, -84.0));
        assert_eq!(base.len(), 64);

        assert_ne!(base, sample_hash("X2", 42.0, -84.0));
        assert_ne!(base, sample_hash("X1", 42.000001, -84.0));
        assert_ne!(base, sample_hash("X1", 42.0, -84.000001));
        // Swapping lat and lon must not collide either.
        assert_ne!(base, sample_hash("X1", -84.0, 42.0));
    }

    #[test]
    fn hash_is_lowercase_hex_of_canonical_string() {
        // sha256("X1" + "42.00000000" + "-84.00000000")
        assert_eq!(
            sample_hash("X1", 42.0, -84.0),
            "8762aa8fc3807d76d7fad145d504abc51d286b88fb88e8d12d9b9e47c9930fc2"
        );
    }

    #[test]
    fn canonical_coordinate_is_fixed_precision() {
        assert_eq!(canonical_coordinate(42.0), "42.00000000");
        assert_eq!(canonical_coordinate(-84.123456789), "-84.12345679");
        assert_eq!(canonical_coordinate(-0.0), canonical_coordinate(0.0));
        assert_eq!(sample_hash("A", -0.0, 1.0), sample_hash("A", 0.0, 1.0));
    }

    #[test]
    fn three_vertex_line_yields_three_records_with_distinct_hashes() {
        let (lines, states) = layers(vec![line(
            json!("X1"),
            line_string![(x: 1.0, y: 1.0), (x: 2.0, y: 2.0), (x: 3.0, y: 1.5)].into(),
        )]);

        let records = SampleSetBuilder::new(&GeoJsonAccess, LayerFields::default())
            .build(lines, states, &RegionFilter::all())
            .unwrap();

        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.feature_id == "X1" && r.region_code == "MI"));
        let hashes: HashSet<&str> = records.iter().map(|r| r.hash.as_str()).collect();
        assert_eq!(hashes.len(), 3);

        // Traversal order, flipped to (lat, lon).
        assert_eq!((records[0].lat, records[0].lon), (1.0, 1.0));
        assert_eq!((records[1].lat, records[1].lon), (2.0, 2.0));
        assert_eq!((records[2].lat, records[2].lon), (1.5, 3.0));
    }

    #[test]
    fn region_filter_accepts_codes_and_names() {
        let filter = RegionFilter::new(["MI", "Maine"]);
        assert!(filter.matches("MI", "Michigan"));
        assert!(filter.matches("ME", "Maine"));
        assert!(!filter.matches("FL", "Florida"));
        // Exact and case-sensitive.
        assert!(!filter.matches("mi", "michigan"));
        assert!(RegionFilter::all().matches("FL", "Florida"));
    }

    #[test]
    fn filtered_out_regions_produce_no_records() {
        let (lines, states) = layers(vec![
            line(json!("A"), line_string![(x: 1.0, y: 1.0), (x: 2.0, y: 2.0)].into()),
            line(json!("B"), line_string![(x: 31.0, y: 1.0), (x: 32.0, y: 2.0)].into()),
        ]);

        let records = SampleSetBuilder::new(&GeoJsonAccess, LayerFields::default())
            .build(lines, states, &RegionFilter::from("FL"))
            .unwrap();

        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.feature_id == "B" && r.region_name == "Florida"));
    }

    #[test]
    fn feature_crossing_regions_is_split_per_region() {
        let (lines, states) = layers(vec![line(
            json!(7),
            line_string![(x: 5.0, y: 5.0), (x: 15.0, y: 5.0)].into(),
        )]);

        let records = SampleSetBuilder::new(&GeoJsonAccess, LayerFields::default())
            .build(lines, states, &RegionFilter::all())
            .unwrap();

        let codes: HashSet<&str> = records.iter().map(|r| r.region_code.as_str()).collect();
        assert_eq!(codes, HashSet::from(["MI", "ME"]));
        assert!(records.iter().all(|r| r.feature_id == "7"));
        for r in &records {
            match r.region_code.as_str() {
                "MI" => assert!((0.0..=10.0).contains(&r.lon), "{r:?}"),
                "ME" => assert!((10.0..=20.0).contains(&r.lon), "{r:?}"),
                other => panic!("unexpected region {other}"),
            }
        }

        let hashes: HashSet<&str> = records.iter().map(|r| r.hash.as_str()).collect();
        assert_eq!(hashes.len(), records.len());
    }

    #[test]
    fn split_feature_keeps_travel_direction_in_each_region() {
        let (lines, states) = layers(vec![line(
            json!("W"),
            line_string![
                (x: 15.0, y: 5.0),
                (x: 12.0, y: 5.0),
                (x: 7.0, y: 5.0),
                (x: 5.0, y: 5.0),
                (x: 3.0, y: 5.0),
            ]
            .into(),
        )]);

        let records = SampleSetBuilder::new(&GeoJsonAccess, LayerFields::default())
            .build(lines, states, &RegionFilter::all())
            .unwrap();

        let in_region = |code: &str| -> Vec<(f64, f64)> {
            records
                .iter()
                .filter(|r| r.region_code == code)
                .map(|r| (r.lat, r.lon))
                .collect()
        };
        let close =
            |a: (f64, f64), b: (f64, f64)| (a.0 - b.0).abs() < 1e-9 && (a.1 - b.1).abs() < 1e-9;

        // Regions come out in boundary-layer order, points in travel order.
        assert_eq!(records[0].region_code, "MI");
        let mi = in_region("MI");
        let expected = [(5.0, 10.0), (5.0, 7.0), (5.0, 5.0), (5.0, 3.0)];
        assert_eq!(mi.len(), expected.len(), "{mi:?}");
        assert!(mi.iter().zip(&expected).all(|(a, b)| close(*a, *b)), "{mi:?}");

        // The shared boundary vertex is dropped when its hash matches MI's.
        let me = in_region("ME");
        assert!(me.len() == 2 || me.len() == 3, "{me:?}");
        assert!(close(me[0], (5.0, 15.0)) && close(me[1], (5.0, 12.0)), "{me:?}");
        assert!(me.windows(2).all(|w| w[0].1 > w[1].1), "{me:?}");
    }

    #[test]
    fn repeated_vertices_are_deduplicated() {
        let (lines, states) = layers(vec![line(
            json!("LOOP"),
            line_string![(x: 1.0, y: 1.0), (x: 2.0, y: 1.0), (x: 2.0, y: 2.0), (x: 1.0, y: 1.0)]
                .into(),
        )]);

        let records = SampleSetBuilder::new(&GeoJsonAccess, LayerFields::default())
            .build(lines, states, &RegionFilter::all())
            .unwrap();

        assert_eq!(records.len(), 3);
    }

    #[test]
    fn mercator_lines_come_out_in_degrees() {
        let c = |lon: f64, lat: f64| {
            (
                6_378_137.0 * lon.to_radians(),
                6_378_137.0 * (std::f64::consts::FRAC_PI_4 + 0.5 * lat.to_radians()).tan().ln(),
            )
        };
        let (x0, y0) = c(1.0, 1.0);
        let (x1, y1) = c(2.0, 2.0);
        let (mut lines, states) = layers(vec![line(
            json!("M"),
            line_string![(x: x0, y: y0), (x: x1, y: y1)].into(),
        )]);
        lines.crs = Crs::WebMercator;

        let records = SampleSetBuilder::new(&GeoJsonAccess, LayerFields::default())
            .build(lines, states, &RegionFilter::all())
            .unwrap();

        assert_eq!(records.len(), 2);
        assert!((records[0].lat - 1.0).abs() < 1e-9);
        assert!((records[1].lon - 2.0).abs() < 1e-9);
    }

    #[test]
    fn missing_feature_id_aborts_build() {
        let (mut lines, states) = layers(vec![line(
            json!("A"),
            line_string![(x: 1.0, y: 1.0), (x: 2.0, y: 2.0)].into(),
        )]);
        lines.features[0].properties.clear();

        let err = SampleSetBuilder::new(&GeoJsonAccess, LayerFields::default())
            .build(lines, states, &RegionFilter::all())
            .unwrap_err();
        assert!(matches!(err, BuildError::MissingField { index: 0, .. }), "{err}");
    }

    #[test]
    fn geometry_error_carries_feature_context() {
        let features = vec![FeatureRecord {
            region_code: "MI".into(),
            region_name: "Michigan".into(),
            feature_id: "BAD".into(),
            geometry: Rect::new((0.0, 0.0), (1.0, 1.0)).into(),
        }];

        match explode(&features) {
            Err(BuildError::Geometry {
                feature_id,
                region_code,
                source,
            }) => {
                assert_eq!(feature_id, "BAD");
                assert_eq!(region_code, "MI");
                assert_eq!(source, GeometryError::Unsupported("Rect"));
            }
            other => panic!("expected geometry error, got {other:?}"),
        }
    }

    #[test]
    fn groups_merge_pieces_with_the_same_key() {
        let piece = |geometry: Geometry<f64>| FeatureRecord {
            region_code: "MI".into(),
            region_name: "Michigan".into(),
            feature_id: "G".into(),
            geometry,
        };
        let features = vec![
            piece(line_string![(x: 1.0, y: 1.0), (x: 2.0, y: 2.0)].into()),
            FeatureRecord {
                feature_id: "H".into(),
                ..piece(line_string![(x: 9.0, y: 9.0), (x: 8.0, y: 8.0)].into())
            },
            piece(line_string![(x: 3.0, y: 3.0), (x: 4.0, y: 4.0)].into()),
        ];

        let ids: Vec<String> = explode(&features)
            .unwrap()
            .into_iter()
            .map(|r| r.feature_id)
            .collect();
        assert_eq!(ids, vec!["G", "G", "G", "G", "H", "H"]);
    }
}
