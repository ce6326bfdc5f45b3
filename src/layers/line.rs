//! A layer that strokes the line work of a source.

use egui::{Color32, Painter, Pos2, Shape, Stroke};

use crate::layers::{GeoJsonSource, Layer, dist_sq_to_segment};
use crate::projection::{GeoPos, MapProjection};

/// Strokes polygon rings and line strings. Points are ignored.
#[derive(Clone, Debug)]
pub struct LineLayer {
    source: String,

    /// The stroke of every line.
    pub stroke: Stroke,
}

impl LineLayer {
    /// Creates a line layer over the source `source`.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            stroke: Stroke::new(2.0, Color32::from_rgb(0x00, 0x33, 0x66)),
        }
    }

    fn hit_tolerance_sq(&self) -> f32 {
        (self.stroke.width / 2.0 + 3.0).powi(2)
    }
}

/// Screen space runs of a line, split where it passes behind the globe.
fn visible_runs(points: &[GeoPos], projection: &MapProjection) -> Vec<Vec<Pos2>> {
    let mut runs = Vec::new();
    let mut current = Vec::new();
    for point in points {
        if projection.is_visible(*point) {
            current.push(projection.project(*point));
        } else if !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

impl Layer for LineLayer {
    fn source(&self) -> &str {
        &self.source
    }

    fn draw(&self, painter: &Painter, projection: &MapProjection, source: &GeoJsonSource) {
        for geometry in source.geometries().iter().flatten() {
            for line in geometry.lines() {
                for run in visible_runs(line, projection) {
                    if run.len() >= 2 {
                        painter.add(Shape::line(run, self.stroke));
                    }
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
        let tolerance_sq = self.hit_tolerance_sq();
        source
            .geometries()
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, geometry)| {
                let Some(geometry) = geometry else {
                    return false;
                };
                geometry.lines().into_iter().any(|line| {
                    visible_runs(line, projection).iter().any(|run| {
                        run.windows(2)
                            .any(|w| dist_sq_to_segment(screen_pos, w[0], w[1]) < tolerance_sq)
                    })
                })
            })
            .map(|(index, _)| index)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::ProjectionMode;
    use egui::{Rect, pos2, vec2};

    #[test]
    fn hit_test_follows_the_outline() {
        let data: geojson::FeatureCollection = serde_json::from_value(serde_json::json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[0, 0], [0, 4], [4, 4], [4, 0], [0, 0]]]
                },
                "properties": {}
            }]
        }))
        .unwrap();
        let source = GeoJsonSource::new(data);

        let rect = Rect::from_min_size(pos2(0.0, 0.0), vec2(800.0, 600.0));
        let projection =
            MapProjection::new(ProjectionMode::Mercator, 6.0, GeoPos::from((2.0, 2.0)), rect);
        let layer = LineLayer::new("uploads");

        let on_edge = projection.project(GeoPos::from((0.0, 2.0)));
        assert_eq!(layer.hit_test(on_edge, &projection, &source), vec![0]);

        let in_middle = projection.project(GeoPos::from((2.0, 2.0)));
        assert!(layer.hit_test(in_middle, &projection, &source).is_empty());
    }

    #[test]
    fn runs_split_behind_the_globe() {
        let rect = Rect::from_min_size(pos2(0.0, 0.0), vec2(800.0, 600.0));
        let projection =
            MapProjection::new(ProjectionMode::Globe, 1.0, GeoPos::from((0.0, 0.0)), rect);
        let line = [
            GeoPos::from((-10.0, 0.0)),
            GeoPos::from((10.0, 0.0)),
            GeoPos::from((180.0, 0.0)),
            GeoPos::from((20.0, 5.0)),
            GeoPos::from((30.0, 5.0)),
        ];
        let runs = visible_runs(&line, &projection);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].len(), 2);
        assert_eq!(runs[1].len(), 2);
    }
}
