//! Geometry types and coordinate traversal.
//!
//! Geometries are explicit tagged variants, so traversal always knows how deep the coordinate
//! nesting goes for a given kind. Nothing here depends on the map widget.

use thiserror::Error;

use crate::projection::GeoPos;

/// A closed or open sequence of positions. Shapefile rings repeat their first point at the end.
pub type Ring = Vec<GeoPos>;

/// A geometry of an uploaded feature or a search result.
#[derive(Clone, Debug, PartialEq)]
pub enum Geometry {
    /// A single position.
    Point(GeoPos),

    /// A set of positions.
    MultiPoint(Vec<GeoPos>),

    /// A line through the positions.
    LineString(Vec<GeoPos>),

    /// Several lines.
    MultiLineString(Vec<Vec<GeoPos>>),

    /// An outer ring followed by zero or more hole rings.
    Polygon(Vec<Ring>),

    /// Several polygons, each an outer ring followed by its holes.
    MultiPolygon(Vec<Vec<Ring>>),
}

impl Geometry {
    /// A short name of the geometry kind, as used by GeoJSON.
    pub fn kind(&self) -> &'static str {
        match self {
            Geometry::Point(_) => "Point",
            Geometry::MultiPoint(_) => "MultiPoint",
            Geometry::LineString(_) => "LineString",
            Geometry::MultiLineString(_) => "MultiLineString",
            Geometry::Polygon(_) => "Polygon",
            Geometry::MultiPolygon(_) => "MultiPolygon",
        }
    }

    /// Calls `f` for every position in the geometry, in storage order.
    pub fn for_each_position(&self, mut f: impl FnMut(GeoPos)) {
        match self {
            Geometry::Point(pos) => f(*pos),
            Geometry::MultiPoint(points) | Geometry::LineString(points) => {
                points.iter().copied().for_each(f)
            }
            Geometry::MultiLineString(lines) => lines.iter().flatten().copied().for_each(f),
            Geometry::Polygon(rings) => rings.iter().flatten().copied().for_each(f),
            Geometry::MultiPolygon(polygons) => polygons
                .iter()
                .flatten()
                .flatten()
                .copied()
                .for_each(f),
        }
    }

    /// The ring used for labelling: the outer ring of a polygon, the first polygon's outer ring of
    /// a multipolygon, the first line of a multiline, or all points of a point set.
    pub fn outer_ring(&self) -> Option<&[GeoPos]> {
        match self {
            Geometry::Point(pos) => Some(std::slice::from_ref(pos)),
            Geometry::MultiPoint(points) | Geometry::LineString(points) => Some(points),
            Geometry::MultiLineString(lines) => lines.first().map(Vec::as_slice),
            Geometry::Polygon(rings) => rings.first().map(Vec::as_slice),
            Geometry::MultiPolygon(polygons) => polygons
                .first()
                .and_then(|rings| rings.first())
                .map(Vec::as_slice),
        }
    }

    /// The polygons of the geometry, each as its list of rings. Empty for non-areal geometries.
    pub fn polygons(&self) -> Vec<&[Ring]> {
        match self {
            Geometry::Polygon(rings) => vec![rings.as_slice()],
            Geometry::MultiPolygon(polygons) => polygons.iter().map(Vec::as_slice).collect(),
            _ => Vec::new(),
        }
    }

    /// The line work of the geometry: polygon rings and line strings. Empty for points.
    pub fn lines(&self) -> Vec<&[GeoPos]> {
        match self {
            Geometry::Point(_) | Geometry::MultiPoint(_) => Vec::new(),
            Geometry::LineString(points) => vec![points.as_slice()],
            Geometry::MultiLineString(lines) => lines.iter().map(Vec::as_slice).collect(),
            Geometry::Polygon(rings) => rings.iter().map(Vec::as_slice).collect(),
            Geometry::MultiPolygon(polygons) => {
                polygons.iter().flatten().map(Vec::as_slice).collect()
            }
        }
    }

    /// Whether `pos` lies inside one of the polygons. Holes use the even-odd rule.
    pub fn contains(&self, pos: GeoPos) -> bool {
        self.polygons().into_iter().any(|rings| {
            rings
                .iter()
                .filter(|ring| ring_contains(ring, pos))
                .count()
                % 2
                == 1
        })
    }
}

/// Ray casting point-in-ring test. Works for open and closed rings.
fn ring_contains(ring: &[GeoPos], pos: GeoPos) -> bool {
    if ring.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (a, b) = (ring[i], ring[j]);
        if (a.lat > pos.lat) != (b.lat > pos.lat)
            && pos.lon < (b.lon - a.lon) * (pos.lat - a.lat) / (b.lat - a.lat) + a.lon
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// An axis-aligned longitude/latitude rectangle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    /// Western edge.
    pub min_lon: f64,

    /// Southern edge.
    pub min_lat: f64,

    /// Eastern edge.
    pub max_lon: f64,

    /// Northern edge.
    pub max_lat: f64,
}

impl Bounds {
    /// A zero-sized rectangle at `pos`.
    pub fn from_point(pos: GeoPos) -> Self {
        Self {
            min_lon: pos.lon,
            min_lat: pos.lat,
            max_lon: pos.lon,
            max_lat: pos.lat,
        }
    }

    /// Grows the rectangle to contain `pos`.
    pub fn extend(&mut self, pos: GeoPos) {
        self.min_lon = self.min_lon.min(pos.lon);
        self.min_lat = self.min_lat.min(pos.lat);
        self.max_lon = self.max_lon.max(pos.lon);
        self.max_lat = self.max_lat.max(pos.lat);
    }

    /// The smallest rectangle containing both.
    pub fn union(mut self, other: Bounds) -> Self {
        self.extend(GeoPos {
            lon: other.min_lon,
            lat: other.min_lat,
        });
        self.extend(GeoPos {
            lon: other.max_lon,
            lat: other.max_lat,
        });
        self
    }

    /// Whether `pos` lies inside or on the edge.
    pub fn contains(&self, pos: GeoPos) -> bool {
        (self.min_lon..=self.max_lon).contains(&pos.lon)
            && (self.min_lat..=self.max_lat).contains(&pos.lat)
    }

    /// South-west corner.
    pub fn south_west(&self) -> GeoPos {
        GeoPos {
            lon: self.min_lon,
            lat: self.min_lat,
        }
    }

    /// North-east corner.
    pub fn north_east(&self) -> GeoPos {
        GeoPos {
            lon: self.max_lon,
            lat: self.max_lat,
        }
    }
}

/// Accumulates every coordinate of `geometry` into a rectangle.
///
/// Returns `None` when the geometry holds no finite coordinate, so callers can skip camera fits
/// and markers for it instead of framing a degenerate rectangle at the origin.
pub fn compute_bounds(geometry: &Geometry) -> Option<Bounds> {
    let mut bounds: Option<Bounds> = None;
    geometry.for_each_position(|pos| {
        if !pos.is_finite() {
            return;
        }
        match bounds.as_mut() {
            Some(bounds) => bounds.extend(pos),
            None => bounds = Some(Bounds::from_point(pos)),
        }
    });
    bounds
}

/// The union of the bounds of all `geometries`, skipping empty ones.
pub fn bounds_of<'a>(geometries: impl IntoIterator<Item = &'a Geometry>) -> Option<Bounds> {
    geometries
        .into_iter()
        .filter_map(compute_bounds)
        .reduce(Bounds::union)
}

/// The arithmetic mean of the positions of the geometry's outer ring.
///
/// This is a vertex average, not an area-weighted centroid. Holes and every polygon after the
/// first are ignored, and a closing vertex that repeats the first one is counted like any other.
/// Good enough to place a label marker on convex-ish areas.
pub fn compute_centroid(geometry: &Geometry) -> Option<GeoPos> {
    let ring = geometry.outer_ring()?;
    let finite: Vec<&GeoPos> = ring.iter().filter(|pos| pos.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }

    let count = finite.len() as f64;
    let (lon, lat) = finite
        .iter()
        .fold((0.0, 0.0), |(lon, lat), pos| (lon + pos.lon, lat + pos.lat));
    Some(GeoPos {
        lon: lon / count,
        lat: lat / count,
    })
}

/// A GeoJSON geometry that has no counterpart in [`Geometry`].
#[derive(Error, Debug, PartialEq)]
pub enum UnsupportedGeometry {
    /// Geometry collections are not rendered.
    #[error("GeoJSON geometry collections are not supported")]
    GeometryCollection,

    /// A position had fewer than two ordinates.
    #[error("GeoJSON position has fewer than two ordinates")]
    ShortPosition,
}

fn vec_to_geo_pos(pos: &[f64]) -> Result<GeoPos, UnsupportedGeometry> {
    match pos {
        [lon, lat, ..] => Ok(GeoPos {
            lon: *lon,
            lat: *lat,
        }),
        _ => Err(UnsupportedGeometry::ShortPosition),
    }
}

fn vecs_to_geo_pos(positions: &[Vec<f64>]) -> Result<Vec<GeoPos>, UnsupportedGeometry> {
    positions.iter().map(|pos| vec_to_geo_pos(pos)).collect()
}

fn geo_pos_to_vec(pos: &GeoPos) -> Vec<f64> {
    vec![pos.lon, pos.lat]
}

impl TryFrom<&geojson::Value> for Geometry {
    type Error = UnsupportedGeometry;

    fn try_from(value: &geojson::Value) -> Result<Self, Self::Error> {
        use geojson::Value;

        Ok(match value {
            Value::Point(pos) => Geometry::Point(vec_to_geo_pos(pos)?),
            Value::MultiPoint(points) => Geometry::MultiPoint(vecs_to_geo_pos(points)?),
            Value::LineString(line) => Geometry::LineString(vecs_to_geo_pos(line)?),
            Value::MultiLineString(lines) => Geometry::MultiLineString(
                lines
                    .iter()
                    .map(|line| vecs_to_geo_pos(line))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Polygon(rings) => Geometry::Polygon(
                rings
                    .iter()
                    .map(|ring| vecs_to_geo_pos(ring))
                    .collect::<Result<_, _>>()?,
            ),
            Value::MultiPolygon(polygons) => Geometry::MultiPolygon(
                polygons
                    .iter()
                    .map(|rings| {
                        rings
                            .iter()
                            .map(|ring| vecs_to_geo_pos(ring))
                            .collect::<Result<Vec<_>, _>>()
                    })
                    .collect::<Result<_, _>>()?,
            ),
            Value::GeometryCollection(_) => return Err(UnsupportedGeometry::GeometryCollection),
        })
    }
}

impl From<&Geometry> for geojson::Value {
    fn from(geometry: &Geometry) -> Self {
        use geojson::Value;

        let line = |points: &Vec<GeoPos>| points.iter().map(geo_pos_to_vec).collect::<Vec<_>>();
        match geometry {
            Geometry::Point(pos) => Value::Point(geo_pos_to_vec(pos)),
            Geometry::MultiPoint(points) => Value::MultiPoint(line(points)),
            Geometry::LineString(points) => Value::LineString(line(points)),
            Geometry::MultiLineString(lines) => {
                Value::MultiLineString(lines.iter().map(line).collect())
            }
            Geometry::Polygon(rings) => Value::Polygon(rings.iter().map(line).collect()),
            Geometry::MultiPolygon(polygons) => Value::MultiPolygon(
                polygons
                    .iter()
                    .map(|rings| rings.iter().map(line).collect())
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    fn ring(points: &[(f64, f64)]) -> Ring {
        points.iter().copied().map(GeoPos::from).collect()
    }

    fn square() -> Ring {
        ring(&[(0.0, 0.0), (0.0, 2.0), (2.0, 2.0), (2.0, 0.0)])
    }

    #[test]
    fn bounds_of_polygon_contains_every_vertex() {
        let polygon = Geometry::Polygon(vec![
            ring(&[(10.0, 50.0), (12.5, 49.0), (11.0, 53.0), (10.0, 50.0)]),
            ring(&[(10.5, 50.5), (10.8, 50.6), (10.6, 50.9), (10.5, 50.5)]),
        ]);
        let bounds = compute_bounds(&polygon).unwrap();
        assert_eq!(
            bounds,
            Bounds {
                min_lon: 10.0,
                min_lat: 49.0,
                max_lon: 12.5,
                max_lat: 53.0
            }
        );
        polygon.for_each_position(|pos| assert!(bounds.contains(pos)));
    }

    #[test]
    fn bounds_ignore_winding_order() {
        let clockwise = Geometry::Polygon(vec![square()]);
        let mut reversed = square();
        reversed.reverse();
        let counter_clockwise = Geometry::Polygon(vec![reversed]);
        assert_eq!(compute_bounds(&clockwise), compute_bounds(&counter_clockwise));
    }

    #[test]
    fn bounds_of_multipolygon_span_all_polygons() {
        let multi = Geometry::MultiPolygon(vec![
            vec![square()],
            vec![ring(&[(-5.0, -5.0), (-5.0, -4.0), (-4.0, -4.0), (-5.0, -5.0)])],
        ]);
        let bounds = compute_bounds(&multi).unwrap();
        assert_eq!(bounds.south_west(), GeoPos::from((-5.0, -5.0)));
        assert_eq!(bounds.north_east(), GeoPos::from((2.0, 2.0)));
    }

    #[test]
    fn empty_geometry_has_no_bounds() {
        assert!(compute_bounds(&Geometry::Polygon(vec![])).is_none());
        assert!(compute_bounds(&Geometry::MultiPolygon(vec![vec![vec![]]])).is_none());
        assert!(compute_bounds(&Geometry::Point(GeoPos::from((f64::NAN, 1.0)))).is_none());
        assert!(bounds_of(Vec::<&Geometry>::new()).is_none());
    }

    #[test]
    fn bounds_of_skips_empty_geometries() {
        let geometries = [
            Geometry::Polygon(vec![]),
            Geometry::Point(GeoPos::from((3.0, 4.0))),
            Geometry::Polygon(vec![square()]),
        ];
        let bounds = bounds_of(&geometries).unwrap();
        assert_eq!(bounds.south_west(), GeoPos::from((0.0, 0.0)));
        assert_eq!(bounds.north_east(), GeoPos::from((3.0, 4.0)));
    }

    #[test]
    fn centroid_of_square_is_its_middle() {
        let centroid = compute_centroid(&Geometry::Polygon(vec![square()])).unwrap();
        assert!((centroid.lon - 1.0).abs() < EPSILON);
        assert!((centroid.lat - 1.0).abs() < EPSILON);
    }

    #[test]
    fn centroid_ignores_holes_and_extra_polygons() {
        let multi = Geometry::MultiPolygon(vec![
            vec![square(), ring(&[(0.1, 0.1), (0.1, 0.2), (0.2, 0.2)])],
            vec![ring(&[(50.0, 50.0), (50.0, 51.0), (51.0, 51.0)])],
        ]);
        let centroid = compute_centroid(&multi).unwrap();
        assert!((centroid.lon - 1.0).abs() < EPSILON);
        assert!((centroid.lat - 1.0).abs() < EPSILON);
    }

    #[test]
    fn centroid_counts_every_stored_vertex() {
        let points = ring(&[(0.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 4.0), (0.0, 0.0)]);
        let centroid = compute_centroid(&Geometry::Polygon(vec![points])).unwrap();
        assert!((centroid.lon - 1.6).abs() < EPSILON);
        assert!((centroid.lat - 1.6).abs() < EPSILON);
    }

    #[test]
    fn centroid_of_empty_geometry_is_none() {
        assert!(compute_centroid(&Geometry::Polygon(vec![])).is_none());
        assert!(compute_centroid(&Geometry::MultiPolygon(vec![])).is_none());
        assert!(compute_centroid(&Geometry::LineString(vec![])).is_none());
    }

    #[test]
    fn contains_respects_holes() {
        let donut = Geometry::Polygon(vec![
            ring(&[(0.0, 0.0), (0.0, 10.0), (10.0, 10.0), (10.0, 0.0), (0.0, 0.0)]),
            ring(&[(4.0, 4.0), (6.0, 4.0), (6.0, 6.0), (4.0, 6.0), (4.0, 4.0)]),
        ]);
        assert!(donut.contains(GeoPos::from((2.0, 2.0))));
        assert!(!donut.contains(GeoPos::from((5.0, 5.0))));
        assert!(!donut.contains(GeoPos::from((12.0, 5.0))));
        assert!(!Geometry::LineString(square()).contains(GeoPos::from((1.0, 1.0))));
    }

    #[test]
    fn geojson_polygon_converts_both_ways() {
        let value = geojson::Value::Polygon(vec![vec![
            vec![0.0, 0.0],
            vec![0.0, 2.0, 7.0],
            vec![2.0, 2.0],
            vec![0.0, 0.0],
        ]]);
        let geometry = Geometry::try_from(&value).unwrap();
        assert_eq!(geometry.kind(), "Polygon");
        assert_eq!(geometry.outer_ring().map(<[GeoPos]>::len), Some(4));

        let back = geojson::Value::from(&geometry);
        assert_eq!(
            back,
            geojson::Value::Polygon(vec![vec![
                vec![0.0, 0.0],
                vec![0.0, 2.0],
                vec![2.0, 2.0],
                vec![0.0, 0.0],
            ]])
        );
    }

    #[test]
    fn geojson_short_positions_are_rejected() {
        let value = geojson::Value::Point(vec![1.0]);
        assert_eq!(
            Geometry::try_from(&value),
            Err(UnsupportedGeometry::ShortPosition)
        );
        let collection = geojson::Value::GeometryCollection(vec![]);
        assert_eq!(
            Geometry::try_from(&collection),
            Err(UnsupportedGeometry::GeometryCollection)
        );
    }
}
