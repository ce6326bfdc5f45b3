//! Map projection.

use egui::{Pos2, Rect, vec2};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

use crate::{TILE_SIZE, lat_to_y, lon_to_x, x_to_lon, y_to_lat};

/// Below this zoom level the globe projection renders the earth as an orthographic sphere. At and
/// above it the visible part of the sphere is nearly flat, so the map falls back to Mercator.
pub const GLOBE_TRANSITION_ZOOM: f64 = 5.0;

/// The largest latitude the Mercator tiles cover.
pub const MAX_LATITUDE: f64 = 85.0511287798;

/// A geographical position in degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoPos {
    /// Longitude.
    pub lon: f64,

    /// Latitude.
    pub lat: f64,
}

impl GeoPos {
    /// Returns `true` when both ordinates are finite numbers.
    pub fn is_finite(&self) -> bool {
        self.lon.is_finite() && self.lat.is_finite()
    }
}

impl From<(f64, f64)> for GeoPos {
    fn from((lon, lat): (f64, f64)) -> Self {
        Self { lon, lat }
    }
}

impl From<GeoPos> for (f64, f64) {
    fn from(pos: GeoPos) -> Self {
        (pos.lon, pos.lat)
    }
}

/// How the map is drawn on the screen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectionMode {
    /// Flat web Mercator.
    #[default]
    Mercator,

    /// A 3D sphere at low zoom levels, Mercator when zoomed in.
    Globe,
}

/// A helper for converting between geographical and screen coordinates.
pub struct MapProjection {
    zoom: f64,
    center_lon: f64,
    center_lat: f64,
    widget_rect: Rect,
    globe: bool,
}

impl MapProjection {
    /// Creates a new `MapProjection`.
    pub(crate) fn new(mode: ProjectionMode, zoom: f64, center: GeoPos, widget_rect: Rect) -> Self {
        Self {
            zoom,
            center_lon: center.lon,
            center_lat: center.lat,
            widget_rect,
            globe: mode == ProjectionMode::Globe && zoom < GLOBE_TRANSITION_ZOOM,
        }
    }

    /// Whether points are currently projected onto a sphere.
    pub fn is_globe(&self) -> bool {
        self.globe
    }

    /// The zoom level the projection was created with.
    pub fn zoom(&self) -> f64 {
        self.zoom
    }

    /// The geographical center of the view.
    pub fn center(&self) -> GeoPos {
        GeoPos {
            lon: self.center_lon,
            lat: self.center_lat,
        }
    }

    /// The screen rectangle of the map widget.
    pub fn widget_rect(&self) -> Rect {
        self.widget_rect
    }

    /// Radius of the globe in screen points. The equator is as long as the Mercator world at the
    /// same zoom level.
    pub fn globe_radius(&self) -> f64 {
        TILE_SIZE as f64 * 2.0_f64.powf(self.zoom) / TAU
    }

    /// Returns `false` for positions on the far side of the globe.
    pub fn is_visible(&self, geo_pos: GeoPos) -> bool {
        if !self.globe {
            return true;
        }
        let (lat0, lon0) = (self.center_lat.to_radians(), self.center_lon.to_radians());
        let (lat, lon) = (geo_pos.lat.to_radians(), geo_pos.lon.to_radians());
        let cos_c = lat0.sin() * lat.sin() + lat0.cos() * lat.cos() * (lon - lon0).cos();
        cos_c >= 0.0
    }

    /// Projects a geographical coordinate to a screen coordinate.
    pub fn project(&self, geo_pos: GeoPos) -> Pos2 {
        let widget_center = self.widget_rect.center();

        if self.globe {
            let radius = self.globe_radius();
            let (lat0, lon0) = (self.center_lat.to_radians(), self.center_lon.to_radians());
            let (lat, lon) = (geo_pos.lat.to_radians(), geo_pos.lon.to_radians());
            let dlon = lon - lon0;

            let x = radius * lat.cos() * dlon.sin();
            let y = radius * (lat0.cos() * lat.sin() - lat0.sin() * lat.cos() * dlon.cos());
            return widget_center + vec2(x as f32, -y as f32);
        }

        let center_x = lon_to_x(self.center_lon, self.zoom);
        let center_y = lat_to_y(self.center_lat, self.zoom);

        let tile_x = lon_to_x(geo_pos.lon, self.zoom);
        let tile_y = lat_to_y(geo_pos.lat, self.zoom);

        let dx = (tile_x - center_x) * TILE_SIZE as f64;
        let dy = (tile_y - center_y) * TILE_SIZE as f64;

        widget_center + vec2(dx as f32, dy as f32)
    }

    /// Un-projects a screen coordinate to a geographical coordinate. Returns `None` when the
    /// point is off the globe.
    pub fn unproject(&self, screen_pos: Pos2) -> Option<GeoPos> {
        if self.globe {
            let radius = self.globe_radius();
            let delta = screen_pos - self.widget_rect.center();
            let (x, y) = (delta.x as f64, -delta.y as f64);
            let rho = x.hypot(y);

            if rho > radius {
                return None;
            }
            if rho < 1e-9 {
                return Some(self.center());
            }

            let lat0 = self.center_lat.to_radians();
            let (sin_c, cos_c) = (rho / radius).asin().sin_cos();
            let lat = (cos_c * lat0.sin() + y * sin_c * lat0.cos() / rho).asin();
            let lon = self.center_lon.to_radians()
                + (x * sin_c).atan2(rho * lat0.cos() * cos_c - y * lat0.sin() * sin_c);

            return Some(GeoPos {
                lon: wrap_lon(lon.to_degrees()),
                lat: lat.to_degrees(),
            });
        }

        let rel_pos = screen_pos - self.widget_rect.min;
        let widget_center_x = self.widget_rect.width() as f64 / 2.0;
        let widget_center_y = self.widget_rect.height() as f64 / 2.0;

        let center_x = lon_to_x(self.center_lon, self.zoom);
        let center_y = lat_to_y(self.center_lat, self.zoom);

        let target_x = center_x + (rel_pos.x as f64 - widget_center_x) / TILE_SIZE as f64;
        let target_y = center_y + (rel_pos.y as f64 - widget_center_y) / TILE_SIZE as f64;

        Some(GeoPos {
            lon: x_to_lon(target_x, self.zoom),
            lat: y_to_lat(target_y, self.zoom),
        })
    }
}

/// Wraps a longitude into `[-180, 180]`.
pub(crate) fn wrap_lon(lon: f64) -> f64 {
    if (-180.0..=180.0).contains(&lon) {
        lon
    } else {
        (lon + 180.0).rem_euclid(360.0) - 180.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use egui::pos2;

    const EPSILON: f64 = 1e-6;

    fn rect() -> Rect {
        Rect::from_min_size(pos2(0.0, 0.0), vec2(800.0, 600.0))
    }

    #[test]
    fn mercator_center_projects_to_widget_center() {
        let center = GeoPos::from((100.5, 13.7));
        let projection = MapProjection::new(ProjectionMode::Mercator, 6.0, center, rect());
        let screen = projection.project(center);
        assert!((screen.x - 400.0).abs() < 1e-3);
        assert!((screen.y - 300.0).abs() < 1e-3);
    }

    #[test]
    fn mercator_unproject_inverts_project() {
        let projection =
            MapProjection::new(ProjectionMode::Mercator, 7.5, GeoPos::from((24.9, 60.1)), rect());
        let original = GeoPos::from((25.3, 59.8));
        let back = projection.unproject(projection.project(original)).unwrap();
        // Screen coordinates are f32, so the round trip is only accurate to a fraction of a pixel.
        assert!((back.lon - original.lon).abs() < 1e-4);
        assert!((back.lat - original.lat).abs() < 1e-4);
    }

    #[test]
    fn globe_is_used_only_below_transition_zoom() {
        let center = GeoPos::default();
        assert!(MapProjection::new(ProjectionMode::Globe, 1.5, center, rect()).is_globe());
        assert!(!MapProjection::new(ProjectionMode::Globe, GLOBE_TRANSITION_ZOOM, center, rect()).is_globe());
        assert!(!MapProjection::new(ProjectionMode::Mercator, 1.5, center, rect()).is_globe());
    }

    #[test]
    fn globe_unproject_inverts_project() {
        let projection =
            MapProjection::new(ProjectionMode::Globe, 2.0, GeoPos::from((100.5, 13.7)), rect());
        let original = GeoPos::from((110.0, 20.0));
        assert!(projection.is_visible(original));
        let back = projection.unproject(projection.project(original)).unwrap();
        assert!((back.lon - original.lon).abs() < 1e-3);
        assert!((back.lat - original.lat).abs() < 1e-3);
    }

    #[test]
    fn globe_hides_far_side() {
        let projection =
            MapProjection::new(ProjectionMode::Globe, 1.0, GeoPos::from((0.0, 0.0)), rect());
        assert!(projection.is_visible(GeoPos::from((45.0, 10.0))));
        assert!(!projection.is_visible(GeoPos::from((180.0, 0.0))));
    }

    #[test]
    fn globe_unproject_outside_sphere_is_none() {
        let projection =
            MapProjection::new(ProjectionMode::Globe, 0.5, GeoPos::from((0.0, 0.0)), rect());
        assert!(projection.globe_radius() < 300.0);
        assert!(projection.unproject(pos2(1.0, 1.0)).is_none());
        let center = projection.unproject(pos2(400.0, 300.0)).unwrap();
        assert!(center.lon.abs() < EPSILON && center.lat.abs() < EPSILON);
    }

    #[test]
    fn wrap_lon_keeps_range() {
        assert!((wrap_lon(190.0) - -170.0).abs() < EPSILON);
        assert!((wrap_lon(-190.0) - 170.0).abs() < EPSILON);
        assert!((wrap_lon(45.0) - 45.0).abs() < EPSILON);
    }
}
