//! The capabilities the viewer needs from a map surface.
//!
//! [`crate::Map`] is the surface used by the application. The controller only talks to the
//! [`MapSurface`] trait, so its rules can be exercised against any implementation.

use egui::{CursorIcon, Pos2, Vec2};
use std::time::Duration;
use thiserror::Error;

use crate::geometry::Bounds;
use crate::layers::Layer;
use crate::overlay::{Marker, MarkerId, Popup};
use crate::projection::{GeoPos, MAX_LATITUDE, ProjectionMode};
use crate::{MIN_ZOOM, TILE_SIZE, lat_to_y, lon_to_x, x_to_lon, y_to_lat};

/// Where the map looks.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    /// Geographical center of the view.
    pub center: GeoPos,

    /// Fractional zoom level.
    pub zoom: f64,
}

/// How [`MapSurface::fit_bounds`] frames a rectangle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FitOptions {
    /// Screen points kept free on every side of the rectangle.
    pub padding: f32,

    /// The fit never zooms in further than this.
    pub max_zoom: f64,
}

/// Something that happened on the surface since the last [`MapSurface::drain_events`].
#[derive(Clone, Debug, PartialEq)]
pub enum MapEvent {
    /// The surface was shown for the first time.
    Load,

    /// The zoom level changed, by the user or by a camera call.
    ZoomChanged {
        /// The new zoom level.
        zoom: f64,
    },

    /// The map was clicked on empty space or a feature. Clicks on markers are not reported.
    Click {
        /// Screen position of the click.
        screen: Pos2,
        /// Geographical position of the click, `None` when off the globe.
        geo: Option<GeoPos>,
    },

    /// The pointer moved over the map.
    PointerMoved {
        /// Screen position of the pointer.
        screen: Pos2,
    },

    /// The pointer left the map.
    PointerLeft,
}

/// Misuse of the source and layer registry.
#[derive(Error, Debug, PartialEq)]
pub enum SurfaceError {
    /// A source with the id already exists.
    #[error("Source `{0}` already exists")]
    DuplicateSource(String),

    /// No source with the id exists.
    #[error("Source `{0}` does not exist")]
    UnknownSource(String),

    /// A layer with the id already exists.
    #[error("Layer `{0}` already exists")]
    DuplicateLayer(String),

    /// No layer with the id exists.
    #[error("Layer `{0}` does not exist")]
    UnknownLayer(String),

    /// A source cannot be removed while layers draw it.
    #[error("Source `{0}` is still used by a layer")]
    SourceInUse(String),
}

/// A map that draws GeoJSON sources through layers and carries markers and popups.
pub trait MapSurface {
    /// The current camera.
    fn camera(&self) -> Camera;

    /// Moves the camera without animation.
    fn jump_to(&mut self, camera: Camera);

    /// Animates the camera to `camera` over `duration`.
    fn ease_to(&mut self, camera: Camera, duration: Duration);

    /// Moves the camera so `bounds` fills the view, see [`FitOptions`].
    fn fit_bounds(&mut self, bounds: Bounds, options: FitOptions);

    /// Sets the highest zoom level the user can reach.
    fn set_max_zoom(&mut self, zoom: f64);

    /// The highest zoom level the user can reach.
    fn max_zoom(&self) -> f64;

    /// Switches between flat and globe rendering.
    fn set_projection(&mut self, mode: ProjectionMode);

    /// Shows zoom buttons on the map.
    fn add_navigation_control(&mut self);

    /// The cursor shown while the pointer is over the map.
    fn set_cursor(&mut self, cursor: CursorIcon);

    /// Whether a source with the id exists.
    fn has_source(&self, id: &str) -> bool;

    /// Adds a GeoJSON source.
    fn add_source(&mut self, id: &str, data: geojson::FeatureCollection)
    -> Result<(), SurfaceError>;

    /// Replaces the data of an existing source. Layers drawing it are kept.
    fn set_source_data(
        &mut self,
        id: &str,
        data: geojson::FeatureCollection,
    ) -> Result<(), SurfaceError>;

    /// Removes a source. All layers drawing it must be removed first.
    fn remove_source(&mut self, id: &str) -> Result<(), SurfaceError>;

    /// Whether a layer with the id exists.
    fn has_layer(&self, id: &str) -> bool;

    /// Adds a layer on top of the others. Its source must exist.
    fn add_layer(&mut self, id: &str, layer: Box<dyn Layer>) -> Result<(), SurfaceError>;

    /// Removes a layer.
    fn remove_layer(&mut self, id: &str) -> Result<(), SurfaceError>;

    /// The features of a layer under a screen position, topmost first.
    fn features_at(&self, screen: Pos2, layer_id: &str) -> Vec<geojson::Feature>;

    /// Adds a marker.
    fn add_marker(&mut self, marker: Marker) -> MarkerId;

    /// Removes a marker. Unknown ids are ignored.
    fn remove_marker(&mut self, id: MarkerId);

    /// Number of markers on the map.
    fn marker_count(&self) -> usize;

    /// Opens a popup. It stays until the user closes it.
    fn add_popup(&mut self, popup: Popup);

    /// Takes every event queued since the last call.
    fn drain_events(&mut self) -> Vec<MapEvent>;
}

/// The camera that shows `bounds` inside a `viewport` with `options.padding` kept free, in web
/// Mercator. The zoom is capped by both `options.max_zoom` and `max_zoom`.
pub fn camera_for_bounds(
    bounds: Bounds,
    viewport: Vec2,
    options: FitOptions,
    max_zoom: f64,
) -> Camera {
    let ceiling = options.max_zoom.min(max_zoom).max(MIN_ZOOM);

    let min_lat = bounds.min_lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let max_lat = bounds.max_lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);

    // World coordinates at zoom 0, one unit per tile.
    let x0 = lon_to_x(bounds.min_lon, 0.0);
    let x1 = lon_to_x(bounds.max_lon, 0.0);
    let y0 = lat_to_y(max_lat, 0.0);
    let y1 = lat_to_y(min_lat, 0.0);

    let width = (x1 - x0) * TILE_SIZE as f64;
    let height = (y1 - y0) * TILE_SIZE as f64;
    let available_x = (viewport.x as f64 - 2.0 * options.padding as f64).max(1.0);
    let available_y = (viewport.y as f64 - 2.0 * options.padding as f64).max(1.0);

    let zoom_x = if width > 0.0 {
        (available_x / width).log2()
    } else {
        f64::INFINITY
    };
    let zoom_y = if height > 0.0 {
        (available_y / height).log2()
    } else {
        f64::INFINITY
    };
    let zoom = zoom_x.min(zoom_y).min(ceiling).max(MIN_ZOOM);

    Camera {
        center: GeoPos {
            lon: x_to_lon((x0 + x1) / 2.0, 0.0),
            lat: y_to_lat((y0 + y1) / 2.0, 0.0),
        },
        zoom,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::MapProjection;
    use egui::{Rect, pos2, vec2};

    const EPSILON: f64 = 1e-6;

    fn fit(bounds: Bounds, max_zoom: f64) -> (Camera, Rect) {
        let viewport = vec2(1024.0, 768.0);
        let camera = camera_for_bounds(
            bounds,
            viewport,
            FitOptions {
                padding: 50.0,
                max_zoom: 17.0,
            },
            max_zoom,
        );
        (camera, Rect::from_min_size(pos2(0.0, 0.0), viewport))
    }

    #[test]
    fn fitted_bounds_lie_inside_padded_viewport() {
        let bounds = Bounds {
            min_lon: 99.0,
            min_lat: 12.5,
            max_lon: 101.5,
            max_lat: 15.0,
        };
        let (camera, rect) = fit(bounds, 17.0);
        let projection =
            MapProjection::new(ProjectionMode::Mercator, camera.zoom, camera.center, rect);

        let inner = rect.shrink(50.0 - 0.5);
        for corner in [bounds.south_west(), bounds.north_east()] {
            let screen = projection.project(corner);
            assert!(inner.contains(screen), "{corner:?} at {screen:?} outside {inner:?}");
        }

        // One side is tight against the padding.
        let sw = projection.project(bounds.south_west());
        let ne = projection.project(bounds.north_east());
        let tight_x = ((ne.x - sw.x) - (rect.width() - 100.0)).abs() < 1.0;
        let tight_y = ((sw.y - ne.y) - (rect.height() - 100.0)).abs() < 1.0;
        assert!(tight_x || tight_y);
    }

    #[test]
    fn tiny_bounds_stop_at_the_ceiling() {
        let point = Bounds::from_point(GeoPos::from((100.5, 13.7)));
        let (camera, _) = fit(point, 17.0);
        assert!((camera.zoom - 17.0).abs() < EPSILON);
        assert!((camera.center.lon - 100.5).abs() < EPSILON);
        assert!((camera.center.lat - 13.7).abs() < EPSILON);

        let (camera, _) = fit(point, 12.0);
        assert!((camera.zoom - 12.0).abs() < EPSILON);
    }

    #[test]
    fn whole_world_does_not_go_below_min_zoom() {
        let world = Bounds {
            min_lon: -180.0,
            min_lat: -90.0,
            max_lon: 180.0,
            max_lat: 90.0,
        };
        let (camera, _) = fit(world, 17.0);
        assert!(camera.zoom >= MIN_ZOOM);
        assert!(camera.center.lat.abs() < EPSILON);
    }
}
