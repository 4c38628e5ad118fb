//! Geospatial functions over GeoJSON.
//!
//! Inputs may be GeoJSON geometry objects, `Feature`s (unwrapped to their
//! geometry), JSON text of either, or a bare `[lon, lat]` pair. Invalid
//! geometry makes the function return `null` rather than failing the row.
//! Distances use a spherical earth.

use serde_json::{Map, Value, json};

use super::{arg, require_args};
use crate::error::{QueryError, Result};
use crate::value::{as_f64, number_value};

/// Mean earth radius used for distances and lengths.
const EARTH_RADIUS_M: f64 = 6_371_008.8;
/// Equatorial radius used for areas.
const AREA_RADIUS_M: f64 = 6_378_137.0;

type Coord = [f64; 2];

#[derive(Debug, Clone, PartialEq)]
enum Geometry {
    Point(Coord),
    MultiPoint(Vec<Coord>),
    LineString(Vec<Coord>),
    MultiLineString(Vec<Vec<Coord>>),
    Polygon(Vec<Vec<Coord>>),
    MultiPolygon(Vec<Vec<Vec<Coord>>>),
}

// ============================================================================
// Parsing
// ============================================================================

/// A parsed input: geometry plus the properties of its feature, if any.
struct Shape {
    geometry: Geometry,
    properties: Option<Value>,
}

fn parse_shape(value: &Value) -> Option<Shape> {
    match value {
        Value::String(text) => parse_shape(&serde_json::from_str(text).ok()?),
        Value::Array(_) => Some(Shape {
            geometry: Geometry::Point(coord(value)?),
            properties: None,
        }),
        Value::Object(object) => match object.get("type")?.as_str()? {
            "Feature" => {
                let inner = parse_shape(object.get("geometry")?)?;
                Some(Shape {
                    geometry: inner.geometry,
                    properties: object.get("properties").cloned(),
                })
            }
            kind => Some(Shape {
                geometry: geometry_from(kind, object.get("coordinates")?)?,
                properties: None,
            }),
        },
        _ => None,
    }
}

fn geometry_from(kind: &str, coordinates: &Value) -> Option<Geometry> {
    match kind {
        "Point" => coord(coordinates).map(Geometry::Point),
        "MultiPoint" => coords(coordinates).map(Geometry::MultiPoint),
        "LineString" => line(coordinates).map(Geometry::LineString),
        "MultiLineString" => list(coordinates, line).map(Geometry::MultiLineString),
        "Polygon" => polygon(coordinates).map(Geometry::Polygon),
        "MultiPolygon" => list(coordinates, polygon).map(Geometry::MultiPolygon),
        _ => None,
    }
}

fn coord(value: &Value) -> Option<Coord> {
    match value.as_array()?.as_slice() {
        [lon, lat, ..] => Some([lon.as_f64()?, lat.as_f64()?]),
        _ => None,
    }
}

fn list<T>(value: &Value, parse: fn(&Value) -> Option<T>) -> Option<Vec<T>> {
    value.as_array()?.iter().map(parse).collect()
}

fn coords(value: &Value) -> Option<Vec<Coord>> {
    list(value, coord)
}

fn line(value: &Value) -> Option<Vec<Coord>> {
    coords(value).filter(|points| points.len() >= 2)
}

/// Rings must have four or more positions and be closed.
fn ring(value: &Value) -> Option<Vec<Coord>> {
    coords(value).filter(|points| points.len() >= 4 && points.first() == points.last())
}

fn polygon(value: &Value) -> Option<Vec<Vec<Coord>>> {
    list(value, ring).filter(|rings| !rings.is_empty())
}

impl Geometry {
    fn type_name(&self) -> &'static str {
        match self {
            Geometry::Point(_) => "Point",
            Geometry::MultiPoint(_) => "MultiPoint",
            Geometry::LineString(_) => "LineString",
            Geometry::MultiLineString(_) => "MultiLineString",
            Geometry::Polygon(_) => "Polygon",
            Geometry::MultiPolygon(_) => "MultiPolygon",
        }
    }

    fn to_json(&self) -> Value {
        let coordinates = match self {
            Geometry::Point(c) => json!(c),
            Geometry::MultiPoint(c) | Geometry::LineString(c) => json!(c),
            Geometry::MultiLineString(c) | Geometry::Polygon(c) => json!(c),
            Geometry::MultiPolygon(c) => json!(c),
        };
        json!({ "type": self.type_name(), "coordinates": coordinates })
    }

    /// Every vertex.
    fn points(&self) -> Vec<Coord> {
        match self {
            Geometry::Point(c) => vec![*c],
            Geometry::MultiPoint(c) | Geometry::LineString(c) => c.clone(),
            Geometry::MultiLineString(c) | Geometry::Polygon(c) => c.concat(),
            Geometry::MultiPolygon(c) => c.iter().flat_map(|p| p.concat()).collect(),
        }
    }

    /// Every segment of every line or ring.
    fn segments(&self) -> Vec<(Coord, Coord)> {
        let paths: Vec<&Vec<Coord>> = match self {
            Geometry::Point(_) | Geometry::MultiPoint(_) => Vec::new(),
            Geometry::LineString(c) => vec![c],
            Geometry::MultiLineString(c) | Geometry::Polygon(c) => c.iter().collect(),
            Geometry::MultiPolygon(c) => c.iter().flatten().collect(),
        };
        paths
            .into_iter()
            .flat_map(|path| path.windows(2).map(|w| (w[0], w[1])))
            .collect()
    }

    fn polygons(&self) -> Vec<&[Vec<Coord>]> {
        match self {
            Geometry::Polygon(rings) => vec![rings.as_slice()],
            Geometry::MultiPolygon(polys) => polys.iter().map(Vec::as_slice).collect(),
            _ => Vec::new(),
        }
    }
}

fn feature(geometry: &Geometry, properties: Option<Value>) -> Value {
    json!({
        "type": "Feature",
        "properties": properties.unwrap_or_else(|| Value::Object(Map::new())),
        "geometry": geometry.to_json(),
    })
}

// ============================================================================
// Units and spherical math
// ============================================================================

/// Converts radians of arc into the requested unit (kilometers by default).
fn from_radians(radians: f64, units: &Value) -> Result<f64> {
    let name = match units {
        Value::Null => "kilometers",
        Value::String(s) => s.as_str(),
        other => {
            return Err(QueryError::InvalidArgument(format!("invalid units {other}")));
        }
    };
    let meters = radians * EARTH_RADIUS_M;
    Ok(match name.to_ascii_lowercase().as_str() {
        "meters" | "metres" => meters,
        "kilometers" | "kilometres" => meters / 1_000.0,
        "miles" => meters / 1_609.344,
        "feet" => meters * 3.280_84,
        "degrees" => radians.to_degrees(),
        "radians" => radians,
        other => {
            return Err(QueryError::InvalidArgument(format!("invalid units '{other}'")));
        }
    })
}

/// Great-circle distance in radians of arc.
fn haversine(a: Coord, b: Coord) -> f64 {
    let (lat1, lat2) = (a[1].to_radians(), b[1].to_radians());
    let d_lat = lat2 - lat1;
    let d_lon = (b[0] - a[0]).to_radians();
    let h = (d_lat / 2.0).sin().powi(2) + (d_lon / 2.0).sin().powi(2) * lat1.cos() * lat2.cos();
    2.0 * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Signed spherical area of a ring in square meters.
fn ring_area(ring: &[Coord]) -> f64 {
    let n = ring.len();
    if n <= 2 {
        return 0.0;
    }
    let mut total = 0.0;
    for i in 0..n {
        let (lower, middle, upper) = if i == n - 2 {
            (n - 2, n - 1, 0)
        } else if i == n - 1 {
            (n - 1, 0, 1)
        } else {
            (i, i + 1, i + 2)
        };
        total += (ring[upper][0].to_radians() - ring[lower][0].to_radians())
            * ring[middle][1].to_radians().sin();
    }
    total * AREA_RADIUS_M * AREA_RADIUS_M / 2.0
}

fn polygon_area(rings: &[Vec<Coord>]) -> f64 {
    let mut rings = rings.iter();
    let outer = rings.next().map_or(0.0, |r| ring_area(r).abs());
    rings.fold(outer, |acc, hole| acc - ring_area(hole).abs())
}

fn on_segment(p: Coord, a: Coord, b: Coord) -> bool {
    let cross = (p[1] - a[1]) * (b[0] - a[0]) - (p[0] - a[0]) * (b[1] - a[1]);
    cross.abs() < 1e-12
        && p[0] >= a[0].min(b[0])
        && p[0] <= a[0].max(b[0])
        && p[1] >= a[1].min(b[1])
        && p[1] <= a[1].max(b[1])
}

/// Ray-casting point-in-ring test. Points on the boundary count as inside.
fn in_ring(p: Coord, ring: &[Coord]) -> bool {
    if ring.windows(2).any(|w| on_segment(p, w[0], w[1])) {
        return true;
    }
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (xi, yi) = (ring[i][0], ring[i][1]);
        let (xj, yj) = (ring[j][0], ring[j][1]);
        if (yi > p[1]) != (yj > p[1]) && p[0] < (xj - xi) * (p[1] - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn in_polygon(p: Coord, rings: &[Vec<Coord>]) -> bool {
    let Some((outer, holes)) = rings.split_first() else {
        return false;
    };
    in_ring(p, outer) && !holes.iter().any(|hole| in_ring(p, hole) && !on_ring(p, hole))
}

fn on_ring(p: Coord, ring: &[Coord]) -> bool {
    ring.windows(2).any(|w| on_segment(p, w[0], w[1]))
}

fn orientation(a: Coord, b: Coord, c: Coord) -> f64 {
    (b[1] - a[1]) * (c[0] - b[0]) - (b[0] - a[0]) * (c[1] - b[1])
}

/// True when the segments share any point.
fn segments_intersect((p1, p2): (Coord, Coord), (q1, q2): (Coord, Coord)) -> bool {
    let o1 = orientation(p1, p2, q1);
    let o2 = orientation(p1, p2, q2);
    let o3 = orientation(q1, q2, p1);
    let o4 = orientation(q1, q2, p2);
    if o1 * o2 < 0.0 && o3 * o4 < 0.0 {
        return true;
    }
    on_segment(q1, p1, p2) || on_segment(q2, p1, p2) || on_segment(p1, q1, q2) || on_segment(p2, q1, q2)
}

fn any_segments_intersect(a: &Geometry, b: &Geometry) -> bool {
    let b_segments = b.segments();
    a.segments()
        .into_iter()
        .any(|sa| b_segments.iter().any(|sb| segments_intersect(sa, *sb)))
}

fn contains_geometry(container: &Geometry, inner: &Geometry) -> bool {
    match container {
        Geometry::Point(c) => inner.points().iter().all(|p| p == c),
        Geometry::LineString(path) => inner
            .points()
            .iter()
            .all(|p| path.windows(2).any(|w| on_segment(*p, w[0], w[1]))),
        _ => {
            let polygons = container.polygons();
            !polygons.is_empty()
                && inner
                    .points()
                    .iter()
                    .all(|p| polygons.iter().any(|rings| in_polygon(*p, rings)))
        }
    }
}

// ============================================================================
// Functions
// ============================================================================

/// `geoArea(geometry)` in square meters.
pub(super) fn area(args: &[Value]) -> Result<Value> {
    require_args("geoArea", args, 1)?;
    let Some(shape) = parse_shape(arg(args, 0)) else {
        return Ok(Value::Null);
    };
    let total: f64 = shape.geometry.polygons().iter().map(|p| polygon_area(p)).sum();
    Ok(number_value(total))
}

/// `geoLength(geometry, units?)`.
pub(super) fn length(args: &[Value]) -> Result<Value> {
    require_args("geoLength", args, 1)?;
    let Some(shape) = parse_shape(arg(args, 0)) else {
        return Ok(Value::Null);
    };
    let radians: f64 = shape
        .geometry
        .segments()
        .into_iter()
        .map(|(a, b)| haversine(a, b))
        .sum();
    Ok(number_value(from_radians(radians, arg(args, 1))?))
}

fn point_of(value: &Value) -> Option<Coord> {
    match parse_shape(value)?.geometry {
        Geometry::Point(c) => Some(c),
        _ => None,
    }
}

/// `geoDistance(point_a, point_b, units?)`.
pub(super) fn distance(args: &[Value]) -> Result<Value> {
    require_args("geoDistance", args, 2)?;
    let (Some(a), Some(b)) = (point_of(arg(args, 0)), point_of(arg(args, 1))) else {
        return Ok(Value::Null);
    };
    Ok(number_value(from_radians(haversine(a, b), arg(args, 2))?))
}

/// `geoNear(point_a, point_b, distance, units?)`.
pub(super) fn near(args: &[Value]) -> Result<Value> {
    require_args("geoNear", args, 3)?;
    let (Some(a), Some(b), Some(limit)) = (
        point_of(arg(args, 0)),
        point_of(arg(args, 1)),
        as_f64(arg(args, 2)),
    ) else {
        return Ok(Value::Null);
    };
    Ok(Value::Bool(from_radians(haversine(a, b), arg(args, 3))? <= limit))
}

/// `geoContains(container, contained)`.
pub(super) fn contains(args: &[Value]) -> Result<Value> {
    require_args("geoContains", args, 2)?;
    let (Some(a), Some(b)) = (parse_shape(arg(args, 0)), parse_shape(arg(args, 1))) else {
        return Ok(Value::Null);
    };
    Ok(Value::Bool(contains_geometry(&a.geometry, &b.geometry)))
}

/// `geoEqual(a, b)`: same geometry type and coordinates.
pub(super) fn equal(args: &[Value]) -> Result<Value> {
    require_args("geoEqual", args, 2)?;
    let (Some(a), Some(b)) = (parse_shape(arg(args, 0)), parse_shape(arg(args, 1))) else {
        return Ok(Value::Null);
    };
    Ok(Value::Bool(a.geometry == b.geometry))
}

/// `geoCrosses(a, b)`: the lines or boundaries of `a` and `b` intersect.
pub(super) fn crosses(args: &[Value]) -> Result<Value> {
    require_args("geoCrosses", args, 2)?;
    let (Some(a), Some(b)) = (parse_shape(arg(args, 0)), parse_shape(arg(args, 1))) else {
        return Ok(Value::Null);
    };
    Ok(Value::Bool(any_segments_intersect(&a.geometry, &b.geometry)))
}

/// `geoDifference(polygon_a, polygon_b)`.
///
/// When `b` lies inside `a` the result is `a` with `b` punched out as a
/// hole; when they are disjoint it is `a` unchanged. Partial overlaps are
/// not supported and yield `null`.
pub(super) fn difference(args: &[Value]) -> Result<Value> {
    require_args("geoDifference", args, 2)?;
    let (Some(a), Some(b)) = (parse_shape(arg(args, 0)), parse_shape(arg(args, 1))) else {
        return Ok(Value::Null);
    };
    let (Geometry::Polygon(a_rings), Geometry::Polygon(b_rings)) = (&a.geometry, &b.geometry) else {
        return Ok(Value::Null);
    };
    let b_outer = Geometry::Polygon(vec![b_rings[0].clone()]);
    if any_segments_intersect(&a.geometry, &b_outer) {
        return Ok(Value::Null);
    }
    let b_inside_a = b_rings[0].iter().all(|p| in_polygon(*p, a_rings));
    let b_outside_a = b_rings[0].iter().all(|p| !in_ring(*p, &a_rings[0]));
    let a_outside_b = a_rings[0].iter().all(|p| !in_ring(*p, &b_rings[0]));

    if b_inside_a {
        let mut rings = a_rings.clone();
        rings.push(b_rings[0].clone());
        return Ok(feature(&Geometry::Polygon(rings), a.properties));
    }
    if b_outside_a && a_outside_b {
        return Ok(feature(&a.geometry, a.properties));
    }
    Ok(Value::Null)
}

/// `geoConvert(coordinates, type, properties?)` builds a GeoJSON feature.
pub(super) fn convert(args: &[Value]) -> Result<Value> {
    require_args("geoConvert", args, 2)?;
    let Value::String(kind) = arg(args, 1) else {
        return Err(QueryError::InvalidArgument(
            "geoConvert geo_type must be a string".to_string(),
        ));
    };
    let kind = match kind.to_ascii_lowercase().as_str() {
        "point" => "Point",
        "multipoint" => "MultiPoint",
        "linestring" => "LineString",
        "multilinestring" => "MultiLineString",
        "polygon" => "Polygon",
        "multipolygon" => "MultiPolygon",
        _ => {
            return Err(QueryError::InvalidArgument(format!(
                "geoConvert geo_type '{kind}' must be one of point, multiPoint, lineString, multiLineString, polygon, multiPolygon"
            )));
        }
    };
    let coordinates = match arg(args, 0) {
        Value::String(text) => match serde_json::from_str(text) {
            Ok(value) => value,
            Err(_) => return Ok(Value::Null),
        },
        other => other.clone(),
    };
    let Some(geometry) = geometry_from(kind, &coordinates) else {
        return Ok(Value::Null);
    };
    let properties = match arg(args, 2) {
        Value::Null => None,
        other => Some(other.clone()),
    };
    Ok(feature(&geometry, properties))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(min: f64, max: f64) -> Value {
        json!({
            "type": "Polygon",
            "coordinates": [[[min, min], [max, min], [max, max], [min, max], [min, min]]]
        })
    }

    fn close(actual: &Value, expected: f64, tolerance: f64) -> bool {
        actual.as_f64().is_some_and(|a| (a - expected).abs() <= tolerance)
    }

    #[test]
    fn distance_between_cities() {
        // Denver to Boulder, roughly 39 km.
        let denver = json!({"type": "Point", "coordinates": [-104.990_251, 39.739_236]});
        let boulder = json!([-105.270_546, 40.014_986]);
        let km = distance(&[denver.clone(), boulder.clone()]).unwrap();
        assert!(close(&km, 38.9, 1.0), "got {km}");
        let miles = distance(&[denver.clone(), boulder.clone(), json!("miles")]).unwrap();
        assert!(close(&miles, 24.2, 1.0), "got {miles}");
        assert_eq!(near(&[denver.clone(), boulder.clone(), json!(50)]).unwrap(), json!(true));
        assert_eq!(near(&[denver, boulder, json!(10)]).unwrap(), json!(false));
    }

    #[test]
    fn invalid_geometry_is_null() {
        assert_eq!(area(&[json!({"type": "Polygon", "coordinates": [[[0, 0], [1, 1]]]})]).unwrap(), Value::Null);
        assert_eq!(distance(&[json!("not geo"), json!([0, 0])]).unwrap(), Value::Null);
        assert_eq!(length(&[json!(42)]).unwrap(), Value::Null);
    }

    #[test]
    fn area_of_one_degree_square_at_equator() {
        let m2 = area(&[square(0.0, 1.0)]).unwrap();
        // About 12,391 km² with the equatorial radius.
        assert!(close(&m2, 12_391_000_000.0, 50_000_000.0), "got {m2}");
    }

    #[test]
    fn length_of_line_and_feature() {
        let feature = json!({
            "type": "Feature",
            "properties": {},
            "geometry": {"type": "LineString", "coordinates": [[0, 0], [0, 1]]}
        });
        let km = length(&[feature]).unwrap();
        assert!(close(&km, 111.19, 0.1), "got {km}");
    }

    #[test]
    fn containment_and_crossing() {
        let outer = square(0.0, 10.0);
        assert_eq!(contains(&[outer.clone(), json!([5, 5])]).unwrap(), json!(true));
        assert_eq!(contains(&[outer.clone(), json!([15, 5])]).unwrap(), json!(false));
        assert_eq!(contains(&[outer.clone(), square(2.0, 3.0)]).unwrap(), json!(true));
        let line = json!({"type": "LineString", "coordinates": [[-5, 5], [5, 5]]});
        assert_eq!(crosses(&[outer.clone(), line]).unwrap(), json!(true));
        assert_eq!(equal(&[outer.clone(), outer]).unwrap(), json!(true));
    }

    #[test]
    fn difference_punches_holes_or_keeps_disjoint() {
        let outer = square(0.0, 10.0);
        let hole = square(2.0, 3.0);
        let punched = difference(&[outer.clone(), hole]).unwrap();
        assert_eq!(punched["type"], "Feature");
        assert_eq!(punched["geometry"]["coordinates"].as_array().unwrap().len(), 2);

        let far = square(20.0, 30.0);
        let unchanged = difference(&[outer.clone(), far]).unwrap();
        assert_eq!(unchanged["geometry"], outer);

        let overlapping = square(5.0, 15.0);
        assert_eq!(difference(&[outer, overlapping]).unwrap(), Value::Null);
    }

    #[test]
    fn convert_builds_features() {
        let point = convert(&[json!([-104.97, 39.76]), json!("point"), json!({"name": "HQ"})]).unwrap();
        assert_eq!(point["geometry"]["type"], "Point");
        assert_eq!(point["properties"]["name"], "HQ");
        assert!(convert(&[json!([0, 0]), json!("circle")]).is_err());
        assert_eq!(convert(&[json!([0]), json!("point")]).unwrap(), Value::Null);
    }
}
