//! Layers draw the features of a GeoJSON source on top of the map tiles.
use egui::{Painter, Pos2};
use log::warn;

use crate::geometry::Geometry;
use crate::projection::MapProjection;

/// Filled polygons.
pub mod fill;

/// Polygon outlines and lines.
pub mod line;

/// GeoJSON data registered on the map under an id, shared by the layers that draw it.
pub struct GeoJsonSource {
    data: geojson::FeatureCollection,
    geometries: Vec<Option<Geometry>>,
}

impl GeoJsonSource {
    /// Converts the collection's geometries once so layers can draw them every frame.
    pub fn new(data: geojson::FeatureCollection) -> Self {
        let geometries = data
            .features
            .iter()
            .map(|feature| {
                let value = &feature.geometry.as_ref()?.value;
                Geometry::try_from(value)
                    .inspect_err(|e| warn!("Skipping feature geometry: {}", e))
                    .ok()
            })
            .collect();
        Self { data, geometries }
    }

    /// Converted geometries, indexed like the source's features.
    pub fn geometries(&self) -> &[Option<Geometry>] {
        &self.geometries
    }

    /// The feature at `index`.
    pub fn feature(&self, index: usize) -> Option<&geojson::Feature> {
        self.data.features.get(index)
    }
}

/// A trait for map layers.
pub trait Layer {
    /// The id of the source this layer draws.
    fn source(&self) -> &str;

    /// Draws the layer.
    fn draw(&self, painter: &Painter, projection: &MapProjection, source: &GeoJsonSource);

    /// Indices of the source features drawn under `screen_pos`, topmost first.
    fn hit_test(
        &self,
        screen_pos: Pos2,
        projection: &MapProjection,
        source: &GeoJsonSource,
    ) -> Vec<usize>;
}

/// Calculates the squared distance from a point to a line segment.
pub(crate) fn dist_sq_to_segment(p: Pos2, a: Pos2, b: Pos2) -> f32 {
    let ab = b - a;
    let ap = p - a;
    let l2 = ab.length_sq();

    if l2 == 0.0 {
        // The segment is a point.
        return ap.length_sq();
    }

    // `t` is the normalized distance from a to the projection of p.
    let t = (ap.dot(ab) / l2).clamp(0.0, 1.0);
    let closest_point = a + t * ab;

    p.distance_sq(closest_point)
}

/// Drops a closing point that repeats the first one.
pub(crate) fn open_ring<T: PartialEq>(points: &[T]) -> &[T] {
    match points {
        [first, .., last] if first == last => &points[..points.len() - 1],
        _ => points,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::GeoPos;
    use egui::pos2;

    const EPSILON: f32 = 1e-6;

    #[test]
    fn test_dist_sq_to_segment() {
        let a = pos2(0.0, 0.0);
        let b = pos2(10.0, 0.0);

        // Point on the segment
        assert!((dist_sq_to_segment(pos2(5.0, 0.0), a, b) - 0.0).abs() < EPSILON);

        // Projection falls on the segment
        assert!((dist_sq_to_segment(pos2(5.0, 5.0), a, b) - 25.0).abs() < EPSILON);

        // Projection falls before 'a' or after 'b'
        assert!((dist_sq_to_segment(pos2(-5.0, 5.0), a, b) - 50.0).abs() < EPSILON);
        assert!((dist_sq_to_segment(pos2(15.0, 5.0), a, b) - 50.0).abs() < EPSILON);

        // Zero-length segment
        let c = pos2(5.0, 5.0);
        assert!((dist_sq_to_segment(pos2(10.0, 10.0), c, c) - 50.0).abs() < EPSILON);
    }

    #[test]
    fn open_ring_drops_closing_point() {
        assert_eq!(open_ring(&[1, 2, 3, 1]), &[1, 2, 3]);
        assert_eq!(open_ring(&[1, 2, 3]), &[1, 2, 3]);
        assert_eq!(open_ring::<i32>(&[]), &[] as &[i32]);
    }

    #[test]
    fn source_converts_geometries_by_index() {
        let data: geojson::FeatureCollection = serde_json::from_value(serde_json::json!({
            "type": "FeatureCollection",
            "features": [
                {
                    "type": "Feature",
                    "geometry": { "type": "Point", "coordinates": [100.5, 13.7] },
                    "properties": {}
                },
                { "type": "Feature", "geometry": null, "properties": {} },
                {
                    "type": "Feature",
                    "geometry": { "type": "GeometryCollection", "geometries": [] },
                    "properties": {}
                }
            ]
        }))
        .unwrap();

        let source = GeoJsonSource::new(data);
        assert_eq!(source.geometries().len(), 3);
        assert_eq!(
            source.geometries()[0],
            Some(Geometry::Point(GeoPos::from((100.5, 13.7))))
        );
        assert!(source.geometries()[1].is_none());
        assert!(source.geometries()[2].is_none());
        assert!(source.feature(0).is_some());
    }
}
