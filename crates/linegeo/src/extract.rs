use geo::{Coord, Geometry, LineString, Polygon};

use crate::{GeometryError, Point};

/// Flatten a geometry into its vertices as `(lat, lon)` points.
///
/// Single lines and rings come back in vertex order. Multi-part geometries
/// are walked part by part and concatenated, so disconnected line strings
/// are handled the same way as connected ones. Polygons contribute their
/// exterior ring followed by their interior rings.
pub fn extract_points(geometry: &Geometry<f64>) -> Result<Vec<Point>, GeometryError> {
    let mut points = Vec::new();
    push_geometry(geometry, &mut points)?;
    Ok(points)
}

fn push_geometry(geometry: &Geometry<f64>, out: &mut Vec<Point>) -> Result<(), GeometryError> {
    match geometry {
        Geometry::Point(p) => push_coord(p.0, out),
        Geometry::Line(line) => {
            push_coord(line.start, out)?;
            push_coord(line.end, out)
        }
        Geometry::LineString(ls) => push_line(ls, out),
        Geometry::Polygon(poly) => push_polygon(poly, out),
        Geometry::MultiPoint(mp) => mp.iter().try_for_each(|p| push_coord(p.0, out)),
        Geometry::MultiLineString(mls) => mls.iter().try_for_each(|ls| push_line(ls, out)),
        Geometry::MultiPolygon(mp) => mp.iter().try_for_each(|poly| push_polygon(poly, out)),
        Geometry::GeometryCollection(gc) => gc.iter().try_for_each(|g| push_geometry(g, out)),
        Geometry::Rect(_) => Err(GeometryError::Unsupported("Rect")),
        Geometry::Triangle(_) => Err(GeometryError::Unsupported("Triangle")),
    }
}

#[inline]
fn push_line(ls: &LineString<f64>, out: &mut Vec<Point>) -> Result<(), GeometryError> {
    ls.coords().try_for_each(|c| push_coord(*c, out))
}

fn push_polygon(poly: &Polygon<f64>, out: &mut Vec<Point>) -> Result<(), GeometryError> {
    push_line(poly.exterior(), out)?;
    poly.interiors().iter().try_for_each(|ring| push_line(ring, out))
}

#[inline]
fn push_coord(c: Coord<f64>, out: &mut Vec<Point>) -> Result<(), GeometryError> {
    if !(c.x.is_finite() && c.y.is_finite()) {
        return Err(GeometryError::NonFinite { x: c.x, y: c.y });
    }
    // Storage order is (lon, lat); flip it.
    out.push(Point { lat: c.y, lon: c.x });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{line_string, point, polygon, GeometryCollection, MultiLineString, Rect};

    #[test]
    fn single_line_is_flipped_to_lat_lon_in_vertex_order() {
        let ls: Geometry<f64> = line_string![
            (x: -84.0, y: 42.0),
            (x: -84.1, y: 42.1),
            (x: -84.2, y: 42.3),
        ]
        .into();

        let points = extract_points(&ls).unwrap();
        assert_eq!(
            points,
            vec![
                Point::new(42.0, -84.0),
                Point::new(42.1, -84.1),
                Point::new(42.3, -84.2),
            ]
        );
    }

    #[test]
    fn multi_part_lines_are_concatenated_in_part_order() {
        let a = line_string![(x: 1.0, y: 10.0), (x: 2.0, y: 20.0)];
        let b = line_string![(x: 3.0, y: 30.0), (x: 4.0, y: 40.0), (x: 5.0, y: 50.0)];
        let mls: Geometry<f64> = MultiLineString::new(vec![a.clone(), b.clone()]).into();

        let points = extract_points(&mls).unwrap();
        assert_eq!(points.len(), a.0.len() + b.0.len());

        let lats: Vec<f64> = points.iter().map(|p| p.lat).collect();
        assert_eq!(lats, vec![10.0, 20.0, 30.0, 40.0, 50.0]);
        let lons: Vec<f64> = points.iter().map(|p| p.lon).collect();
        assert_eq!(lons, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn polygon_yields_exterior_then_interior_rings() {
        let poly: Geometry<f64> = polygon!(
            exterior: [(x: 0.0, y: 0.0), (x: 4.0, y: 0.0), (x: 4.0, y: 4.0), (x: 0.0, y: 0.0)],
            interiors: [[(x: 1.0, y: 1.0), (x: 2.0, y: 1.0), (x: 2.0, y: 2.0), (x: 1.0, y: 1.0)]],
        )
        .into();

        let points = extract_points(&poly).unwrap();
        assert_eq!(points.len(), 8);
        assert_eq!(points[4], Point::new(1.0, 1.0));
    }

    #[test]
    fn collections_are_walked_recursively() {
        let gc = Geometry::GeometryCollection(GeometryCollection(vec![
            point!(x: 7.0, y: 8.0).into(),
            line_string![(x: 1.0, y: 2.0), (x: 3.0, y: 4.0)].into(),
        ]));

        let points = extract_points(&gc).unwrap();
        assert_eq!(
            points,
            vec![Point::new(8.0, 7.0), Point::new(2.0, 1.0), Point::new(4.0, 3.0)]
        );
    }

    #[test]
    fn rect_is_rejected() {
        let rect: Geometry<f64> = Rect::new((0.0, 0.0), (1.0, 1.0)).into();
        assert_eq!(
            extract_points(&rect),
            Err(GeometryError::Unsupported("Rect"))
        );
    }

    #[test]
    fn non_finite_coordinate_is_rejected() {
        let ls: Geometry<f64> = line_string![(x: 0.0, y: 0.0), (x: f64::NAN, y: 1.0)].into();
        assert!(matches!(
            extract_points(&ls),
            Err(GeometryError::NonFinite { .. })
        ));
    }
}
