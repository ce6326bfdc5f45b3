//! A layer that fills the polygons of a source.

use egui::{Color32, Mesh, Painter, Pos2, Shape};
use log::warn;

use crate::geometry::Ring;
use crate::layers::{GeoJsonSource, Layer, open_ring};
use crate::projection::MapProjection;

/// Fills every polygon and multipolygon of its source. Other geometries are ignored.
#[derive(Clone, Debug)]
pub struct FillLayer {
    source: String,

    /// The fill color.
    pub color: Color32,
}

impl FillLayer {
    /// Creates a fill layer over the source `source`.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            color: Color32::from_rgba_unmultiplied(0x08, 0x88, 0xff, 115),
        }
    }
}

/// Triangulates one polygon in screen space. `None` when part of it is behind the globe or
/// triangulation fails.
fn polygon_mesh(rings: &[Ring], projection: &MapProjection, color: Color32) -> Option<Mesh> {
    let mut vertices: Vec<Pos2> = Vec::new();
    let mut holes: Vec<usize> = Vec::new();

    for (i, ring) in rings.iter().enumerate() {
        let ring = open_ring(ring);
        if ring.len() < 3 {
            continue;
        }
        if ring.iter().any(|p| !projection.is_visible(*p)) {
            return None;
        }
        if i > 0 {
            holes.push(vertices.len());
        }
        vertices.extend(ring.iter().map(|p| projection.project(*p)));
    }

    if vertices.len() < 3 {
        return None;
    }

    let flat_points: Vec<f64> = vertices
        .iter()
        .flat_map(|p| [p.x as f64, p.y as f64])
        .collect();
    let indices = match earcutr::earcut(&flat_points, &holes, 2) {
        Ok(indices) => indices,
        Err(e) => {
            warn!("Unable to triangulate polygon: {:?}", e);
            return None;
        }
    };

    let mut mesh = Mesh::default();
    mesh.vertices = vertices
        .into_iter()
        .map(|pos| egui::epaint::Vertex {
            pos,
            uv: Default::default(),
            color,
        })
        .collect();
    mesh.indices = indices.into_iter().map(|i| i as u32).collect();
    Some(mesh)
}

impl Layer for FillLayer {
    fn source(&self) -> &str {
        &self.source
    }

    fn draw(&self, painter: &Painter, projection: &MapProjection, source: &GeoJsonSource) {
        for geometry in source.geometries().iter().flatten() {
            for rings in geometry.polygons() {
                if let Some(mesh) = polygon_mesh(rings, projection, self.color) {
                    painter.add(Shape::Mesh(mesh.into()));
                }
            }
        }
    }

    fn hit_test(
        &self,
        screen_pos: Pos2,
        projection: &MapProjection,
        source: &GeoJsonSource,
    ) -> Vec<usize> {
        let Some(geo_pos) = projection.unproject(screen_pos) else {
            return Vec::new();
        };

        source
            .geometries()
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, geometry)| matches!(geometry, Some(g) if g.contains(geo_pos)))
            .map(|(index, _)| index)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::{GeoPos, ProjectionMode};
    use egui::{Rect, pos2, vec2};

    fn source() -> GeoJsonSource {
        let data: geojson::FeatureCollection = serde_json::from_value(serde_json::json!({
            "type": "FeatureCollection",
            "features": [
                {
                    "type": "Feature",
                    "geometry": {
                        "type": "Polygon",
                        "coordinates": [[[0, 0], [0, 4], [4, 4], [4, 0], [0, 0]]]
                    },
                    "properties": { "name": "big" }
                },
                {
                    "type": "Feature",
                    "geometry": {
                        "type": "Polygon",
                        "coordinates": [[[1, 1], [1, 2], [2, 2], [2, 1], [1, 1]]]
                    },
                    "properties": { "name": "small" }
                }
            ]
        }))
        .unwrap();
        GeoJsonSource::new(data)
    }

    fn projection() -> MapProjection {
        let rect = Rect::from_min_size(pos2(0.0, 0.0), vec2(800.0, 600.0));
        MapProjection::new(ProjectionMode::Mercator, 6.0, GeoPos::from((2.0, 2.0)), rect)
    }

    #[test]
    fn hit_test_returns_topmost_first() {
        let projection = projection();
        let layer = FillLayer::new("uploads");
        let inside_both = projection.project(GeoPos::from((1.5, 1.5)));
        assert_eq!(layer.hit_test(inside_both, &projection, &source()), vec![1, 0]);

        let inside_big = projection.project(GeoPos::from((3.5, 0.5)));
        assert_eq!(layer.hit_test(inside_big, &projection, &source()), vec![0]);

        let outside = projection.project(GeoPos::from((6.0, 6.0)));
        assert!(layer.hit_test(outside, &projection, &source()).is_empty());
    }

    #[test]
    fn polygon_with_hole_triangulates() {
        let ring = |points: &[(f64, f64)]| -> Ring {
            points.iter().copied().map(GeoPos::from).collect()
        };
        let rings = vec![
            ring(&[(0.0, 0.0), (0.0, 4.0), (4.0, 4.0), (4.0, 0.0), (0.0, 0.0)]),
            ring(&[(1.0, 1.0), (2.0, 1.0), (2.0, 2.0), (1.0, 2.0), (1.0, 1.0)]),
        ];
        let mesh = polygon_mesh(&rings, &projection(), Color32::RED).unwrap();
        assert_eq!(mesh.vertices.len(), 8);
        // A square with a square hole needs eight triangles.
        assert_eq!(mesh.indices.len(), 8 * 3);
    }

    #[test]
    fn far_side_polygons_are_culled() {
        let rect = Rect::from_min_size(pos2(0.0, 0.0), vec2(800.0, 600.0));
        let globe = MapProjection::new(ProjectionMode::Globe, 1.0, GeoPos::from((180.0, 0.0)), rect);
        let rings = vec![vec![
            GeoPos::from((0.0, 0.0)),
            GeoPos::from((0.0, 4.0)),
            GeoPos::from((4.0, 4.0)),
        ]];
        assert!(polygon_mesh(&rings, &globe, Color32::RED).is_none());
    }
}
