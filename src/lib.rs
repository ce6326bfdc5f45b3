#![warn(missing_docs)]

//! A globe map viewer for `egui` with shapefile upload and place search.
//!
//! The crate provides a `Map` widget that shows raster tiles as a flat web Mercator map or as a
//! globe, draws GeoJSON sources through layers, and carries markers and popups. The
//! [`controller::MapController`] drives any [`surface::MapSurface`], such as the `Map`, to show
//! uploaded shapefiles.
//!
//! # Example
//!
//! ```no_run
//! use eframe::egui;
//! use egui_globe_view::{Map, config::EsriWorldImageryConfig};
//!
//! struct MyApp {
//!     map: Map,
//! }
//!
//! impl Default for MyApp {
//!     fn default() -> Self {
//!         Self {
//!             map: Map::new(EsriWorldImageryConfig::default()),
//!         }
//!     }
//! }
//!
//! impl eframe::App for MyApp {
//!     fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
//!         egui::CentralPanel::default()
//!             .frame(egui::Frame::NONE)
//!             .show(ctx, |ui| {
//!                 ui.add(&mut self.map);
//!             });
//!     }
//! }
//! ```

/// The eframe application.
pub mod app;

/// Reading zipped shapefiles.
pub mod archive;

/// Named features built from decoded shapefiles.
pub mod catalogue;

/// Configuration traits and types for the map widget and the viewer.
pub mod config;

/// The rules that tie uploads, markers and the camera together.
pub mod controller;

/// Geometry types, bounds and centroids.
pub mod geometry;

/// Layers drawing GeoJSON sources.
pub mod layers;

/// Markers and popups.
pub mod overlay;

/// Map projections.
pub mod projection;

/// Feature attribute values.
pub mod properties;

/// Place search.
pub mod search;

/// The map surface abstraction.
pub mod surface;

#[cfg(test)]
mod test_support;

use eframe::egui;
use egui::{
    Color32, CursorIcon, Mesh, Pos2, Rect, Response, Sense, Shape, Ui, Vec2, Widget, pos2,
};
use eyre::{Context, Result};
use log::{debug, error};
use once_cell::sync::Lazy;
use poll_promise::Promise;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::MapConfig;
use crate::geometry::Bounds;
use crate::layers::{GeoJsonSource, Layer};
use crate::overlay::{Marker, MarkerId, Popup, draw_marker, marker_hit_rect};
use crate::projection::{GeoPos, MAX_LATITUDE, MapProjection, ProjectionMode, wrap_lon};
use crate::surface::{Camera, FitOptions, MapEvent, MapSurface, SurfaceError, camera_for_bounds};

// The size of a map tile in pixels.
const TILE_SIZE: u32 = 256;
/// The minimum zoom level.
pub const MIN_ZOOM: f64 = 0.0;
/// The maximum zoom level.
pub const MAX_ZOOM: f64 = 19.0;

// Zoom levels per point of scroll.
const SCROLL_ZOOM_SPEED: f64 = 1.0 / 200.0;
// Globe tiles are drawn as a grid of this many quads per side.
const GLOBE_TILE_STEPS: usize = 8;
const FIT_DURATION: Duration = Duration::from_millis(800);
const NAVIGATION_DURATION: Duration = Duration::from_millis(250);

// Reuse the reqwest client for all web requests by making it a static variable.
pub(crate) static CLIENT: Lazy<reqwest::blocking::Client> = Lazy::new(|| {
    reqwest::blocking::Client::builder()
        .user_agent(format!(
            "{}/{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ))
        .build()
        .expect("Failed to build reqwest client")
});

/// Errors that can occur while using the map widget.
#[derive(Error, Debug)]
pub enum MapError {
    /// An error occurred while making a web request.
    #[error("Connection error")]
    ConnectionError(#[from] reqwest::Error),

    /// A map tile failed to download.
    #[error("A map tile failed to download. HTTP Status: `{0}`")]
    TileDownloadError(String),

    /// The downloaded tile bytes could not be converted to an image.
    #[error("Unable to convert downloaded map tile bytes as image")]
    TileBytesConversionError(#[from] image::ImageError),
}

/// A unique identifier for a map tile.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct TileId {
    /// The zoom level.
    pub z: u8,

    /// The x-coordinate of the tile.
    pub x: u32,

    /// The y-coordinate of the tile.
    pub y: u32,
}

impl TileId {
    fn to_url(&self, config: &dyn MapConfig) -> String {
        config.tile_url(self)
    }
}

/// The state of a tile in the cache.
enum Tile {
    /// The tile is being downloaded.
    Loading(Promise<Result<egui::ColorImage, Arc<eyre::Report>>>),

    /// The tile is in memory.
    Loaded(egui::TextureHandle),

    /// The tile failed to download.
    Failed(Arc<eyre::Report>),
}

/// A running camera animation.
struct CameraAnimation {
    from: Camera,
    to: Camera,
    duration: f64,
    /// Set on the first frame after the animation was requested.
    start: Option<f64>,
}

impl CameraAnimation {
    /// The camera at time `now`, and whether the animation has finished.
    fn sample(&mut self, now: f64) -> (Camera, bool) {
        let start = *self.start.get_or_insert(now);
        let t = if self.duration <= 0.0 {
            1.0
        } else {
            ((now - start) / self.duration).clamp(0.0, 1.0)
        };
        let k = ease_in_out(t);

        let dlon = wrap_lon(self.to.center.lon - self.from.center.lon);
        let camera = Camera {
            center: GeoPos {
                lon: wrap_lon(self.from.center.lon + dlon * k),
                lat: self.from.center.lat + (self.to.center.lat - self.from.center.lat) * k,
            },
            zoom: self.from.zoom + (self.to.zoom - self.from.zoom) * k,
        };
        (camera, t >= 1.0)
    }
}

fn ease_in_out(t: f64) -> f64 {
    if t < 0.5 {
        4.0 * t * t * t
    } else {
        1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
    }
}

/// The map widget.
pub struct Map {
    center: GeoPos,
    zoom: f64,
    max_zoom: f64,
    projection_mode: ProjectionMode,

    tiles: HashMap<TileId, Tile>,

    /// The geographical position under the mouse pointer, if any.
    pub mouse_pos: Option<GeoPos>,

    /// Configuration for the map, such as the tile server URL.
    config: Box<dyn MapConfig>,

    sources: HashMap<String, GeoJsonSource>,
    layers: Vec<(String, Box<dyn Layer>)>,
    markers: BTreeMap<MarkerId, Marker>,
    next_marker_id: u64,
    popups: Vec<(u64, Popup)>,
    next_popup_id: u64,

    events: VecDeque<MapEvent>,
    animation: Option<CameraAnimation>,
    pending_fit: Option<(Bounds, FitOptions)>,
    loaded: bool,
    reported_zoom: f64,
    pointer_inside: bool,
    navigation_control: bool,
    cursor: CursorIcon,
    viewport: Option<Rect>,
}

impl Map {
    /// Creates a new `Map` widget.
    ///
    /// # Arguments
    ///
    /// * `config` - A type that implements `MapConfig`, which provides configuration for the map.
    pub fn new<C: MapConfig + 'static>(config: C) -> Self {
        Self::from_boxed(Box::new(config))
    }

    /// Creates a new `Map` widget from a boxed configuration.
    pub fn from_boxed(config: Box<dyn MapConfig>) -> Self {
        let center = config.default_center();
        let zoom = config.default_zoom().clamp(MIN_ZOOM, MAX_ZOOM);
        Self {
            center,
            zoom,
            max_zoom: MAX_ZOOM,
            projection_mode: ProjectionMode::default(),
            tiles: HashMap::new(),
            mouse_pos: None,
            config,
            sources: HashMap::new(),
            layers: Vec::new(),
            markers: BTreeMap::new(),
            next_marker_id: 0,
            popups: Vec::new(),
            next_popup_id: 0,
            events: VecDeque::new(),
            animation: None,
            pending_fit: None,
            loaded: false,
            reported_zoom: zoom,
            pointer_inside: false,
            navigation_control: false,
            cursor: CursorIcon::Default,
            viewport: None,
        }
    }

    /// The geographical center of the map.
    pub fn center(&self) -> GeoPos {
        self.center
    }

    /// The zoom level of the map.
    pub fn zoom(&self) -> f64 {
        self.zoom
    }

    /// The current projection mode.
    pub fn projection_mode(&self) -> ProjectionMode {
        self.projection_mode
    }

    fn projection(&self, rect: Rect) -> MapProjection {
        MapProjection::new(self.projection_mode, self.zoom, self.center, rect)
    }

    fn clamp_zoom(&self, zoom: f64) -> f64 {
        zoom.clamp(MIN_ZOOM, self.max_zoom)
    }

    fn set_camera(&mut self, camera: Camera) {
        self.center = GeoPos {
            lon: wrap_lon(camera.center.lon),
            lat: camera.center.lat.clamp(-MAX_LATITUDE, MAX_LATITUDE),
        };
        self.zoom = self.clamp_zoom(camera.zoom);
    }

    /// Queues a `ZoomChanged` event if the zoom moved since the last report.
    fn report_zoom(&mut self) {
        if (self.zoom - self.reported_zoom).abs() > f64::EPSILON {
            self.reported_zoom = self.zoom;
            self.events
                .push_back(MapEvent::ZoomChanged { zoom: self.zoom });
        }
    }

    /// Advances the camera animation. Returns `true` while it is running.
    fn step_animation(&mut self, now: f64) -> bool {
        let Some(animation) = self.animation.as_mut() else {
            return false;
        };
        let (camera, finished) = animation.sample(now);
        self.set_camera(camera);
        if finished {
            self.animation = None;
        }
        !finished
    }

    /// Zooms to `new_zoom` keeping the geographical position under `anchor` in place.
    fn zoom_around(&mut self, rect: &Rect, anchor: Pos2, new_zoom: f64) {
        let new_zoom = self.clamp_zoom(new_zoom);
        if (new_zoom - self.zoom).abs() < f64::EPSILON {
            return;
        }

        let projection = self.projection(*rect);
        if projection.is_globe() {
            self.zoom = new_zoom;
            return;
        }
        let Some(target) = projection.unproject(anchor) else {
            self.zoom = new_zoom;
            return;
        };

        let mouse_rel = anchor - rect.center();
        let new_target_x = lon_to_x(target.lon, new_zoom);
        let new_target_y = lat_to_y(target.lat, new_zoom);
        let new_center_x = new_target_x - mouse_rel.x as f64 / TILE_SIZE as f64;
        let new_center_y = new_target_y - mouse_rel.y as f64 / TILE_SIZE as f64;

        self.zoom = new_zoom;
        self.center = GeoPos {
            lon: x_to_lon(new_center_x, new_zoom),
            lat: y_to_lat(new_center_y, new_zoom),
        };
    }

    /// A double click zooms in on the pointer. A single click toggles the label of the marker
    /// under it, or is reported as [`MapEvent::Click`].
    fn handle_click(&mut self, projection: &MapProjection, pointer_pos: Pos2, double: bool) {
        if double {
            if let Some(target) = projection.unproject(pointer_pos) {
                self.animation = None;
                let zoom = self.zoom + 1.0;
                self.set_camera(Camera {
                    center: target,
                    zoom,
                });
            }
            return;
        }

        let hit_marker = self.markers.values_mut().rev().find(|marker| {
            marker_hit_rect(marker, projection).is_some_and(|r| r.contains(pointer_pos))
        });
        match hit_marker {
            Some(marker) => marker.label_open = !marker.label_open,
            None => self.events.push_back(MapEvent::Click {
                screen: pointer_pos,
                geo: projection.unproject(pointer_pos),
            }),
        }
    }

    /// Handles user input for panning, zooming, clicks and pointer tracking.
    fn handle_input(&mut self, ui: &Ui, rect: &Rect, response: &Response) {
        let projection = self.projection(*rect);

        // Handle panning
        if response.dragged() {
            self.animation = None;
            let delta = response.drag_delta();

            if projection.is_globe() {
                let radius = projection.globe_radius();
                self.center = GeoPos {
                    lon: wrap_lon(self.center.lon - (delta.x as f64 / radius).to_degrees()),
                    lat: (self.center.lat + (delta.y as f64 / radius).to_degrees())
                        .clamp(-MAX_LATITUDE, MAX_LATITUDE),
                };
            } else {
                let center_in_tiles_x = lon_to_x(self.center.lon, self.zoom);
                let center_in_tiles_y = lat_to_y(self.center.lat, self.zoom);

                let mut new_center_x = center_in_tiles_x - (delta.x as f64 / TILE_SIZE as f64);
                let mut new_center_y = center_in_tiles_y - (delta.y as f64 / TILE_SIZE as f64);

                // Clamp the new center to the map boundaries.
                let world_size_in_tiles = 2.0_f64.powf(self.zoom);
                let view_size_in_tiles_x = rect.width() as f64 / TILE_SIZE as f64;
                let view_size_in_tiles_y = rect.height() as f64 / TILE_SIZE as f64;

                let min_center_x = view_size_in_tiles_x / 2.0;
                let max_center_x = world_size_in_tiles - view_size_in_tiles_x / 2.0;
                let min_center_y = view_size_in_tiles_y / 2.0;
                let max_center_y = world_size_in_tiles - view_size_in_tiles_y / 2.0;

                // If the map is smaller than the viewport, center it. Otherwise, clamp the center.
                new_center_x = if min_center_x > max_center_x {
                    world_size_in_tiles / 2.0
                } else {
                    new_center_x.clamp(min_center_x, max_center_x)
                };
                new_center_y = if min_center_y > max_center_y {
                    world_size_in_tiles / 2.0
                } else {
                    new_center_y.clamp(min_center_y, max_center_y)
                };

                self.center = GeoPos {
                    lon: x_to_lon(new_center_x, self.zoom),
                    lat: y_to_lat(new_center_y, self.zoom),
                };
            }
        }

        if let Some(pointer_pos) = response.interact_pointer_pos() {
            // The second click of a double-click also counts as clicked.
            if response.double_clicked() {
                self.handle_click(&projection, pointer_pos, true);
            } else if response.clicked() {
                self.handle_click(&projection, pointer_pos, false);
            }
        }

        // Handle zooming and mouse position
        let hover_pos = response.hover_pos().filter(|_| response.hovered());
        match hover_pos {
            Some(mouse_pos) => {
                self.mouse_pos = projection.unproject(mouse_pos);
                self.pointer_inside = true;
                self.events
                    .push_back(MapEvent::PointerMoved { screen: mouse_pos });

                let (scroll, pinch) = ui.input(|i| (i.smooth_scroll_delta.y, i.zoom_delta()));
                let zoom_step = scroll as f64 * SCROLL_ZOOM_SPEED + (pinch as f64).log2();
                if zoom_step != 0.0 {
                    self.animation = None;
                    let mut new_zoom = self.zoom + zoom_step;

                    // A flat map may not become smaller than the widget.
                    if zoom_step < 0.0 && self.projection_mode == ProjectionMode::Mercator {
                        let fit_zoom = (rect.width().max(rect.height()) as f64
                            / TILE_SIZE as f64)
                            .log2();
                        new_zoom = new_zoom.max(fit_zoom.min(self.zoom));
                    }
                    self.zoom_around(rect, mouse_pos, new_zoom);
                }

                if response.dragged() {
                    ui.ctx().set_cursor_icon(CursorIcon::Grabbing);
                } else {
                    ui.ctx().set_cursor_icon(self.cursor);
                }
            }
            None => {
                self.mouse_pos = None;
                if self.pointer_inside {
                    self.pointer_inside = false;
                    self.events.push_back(MapEvent::PointerLeft);
                }
            }
        }
    }

    /// Draws the map tiles.
    fn draw_map(&mut self, ui: &mut Ui, rect: &Rect) {
        let painter = ui.painter_at(*rect);
        let projection = self.projection(*rect);

        if projection.is_globe() {
            painter.rect_filled(*rect, 0.0, Color32::from_rgb(8, 10, 24)); // Space
            painter.circle_filled(
                rect.center(),
                projection.globe_radius() as f32,
                Color32::from_rgb(20, 40, 80),
            );

            let tile_zoom = projection.zoom().ceil().clamp(MIN_ZOOM, MAX_ZOOM) as u8;
            let tiles = visible_globe_tiles(&projection, tile_zoom);
            for tile_id in tiles {
                if let Tile::Loaded(texture) = self.poll_tile(ui, tile_id) {
                    draw_globe_tile(&painter, texture.id(), tile_id, &projection);
                }
            }
        } else {
            painter.rect_filled(*rect, 0.0, Color32::from_rgb(220, 220, 220)); // Background

            let tiles = visible_tiles(self.center, self.zoom, rect);
            for (tile_id, tile_rect) in tiles {
                self.draw_tile(ui, &painter, tile_id, tile_rect);
            }
        }
    }

    /// Returns the tile's state, starting a download for tiles not seen before.
    fn poll_tile(&mut self, ui: &Ui, tile_id: TileId) -> &Tile {
        let tile_state = self.tiles.entry(tile_id).or_insert_with(|| {
            let url = tile_id.to_url(self.config.as_ref());
            let promise =
                Promise::spawn_thread("download_tile", move || -> Result<_, Arc<eyre::Report>> {
                    let result: Result<_, eyre::Report> = (|| {
                        debug!("Downloading tile from {}", &url);
                        let response = CLIENT.get(&url).send().map_err(MapError::from)?;

                        if !response.status().is_success() {
                            return Err(MapError::TileDownloadError(response.status().to_string()));
                        }

                        let bytes = response.bytes().map_err(MapError::from)?.to_vec();
                        let image = image::load_from_memory(&bytes)
                            .map_err(MapError::from)?
                            .to_rgba8();

                        let size = [image.width() as _, image.height() as _];
                        let pixels = image.into_raw();
                        Ok(egui::ColorImage::from_rgba_unmultiplied(size, &pixels))
                    })()
                    .with_context(|| format!("Failed to download tile from {}", &url));

                    result.map_err(Arc::new)
                });
            Tile::Loading(promise)
        });

        // A finished download is turned into a texture right away, so the tile can be drawn in
        // the same frame.
        if let Tile::Loading(promise) = tile_state {
            match promise.ready() {
                Some(Ok(color_image)) => {
                    let texture = ui.ctx().load_texture(
                        format!("tile_{}_{}_{}", tile_id.z, tile_id.x, tile_id.y),
                        color_image.clone(),
                        Default::default(),
                    );
                    *tile_state = Tile::Loaded(texture);
                }
                Some(Err(e)) => {
                    error!("{:?}", e);
                    *tile_state = Tile::Failed(e.clone());
                }
                None => ui.ctx().request_repaint(),
            }
        }

        tile_state
    }

    /// Draws a single flat map tile.
    fn draw_tile(&mut self, ui: &mut Ui, painter: &egui::Painter, tile_id: TileId, tile_rect: Rect) {
        let placeholder = |painter: &egui::Painter, mark: &str, color: Color32| {
            // Draw a gray background and a border for the placeholder.
            painter.rect_filled(tile_rect, 0.0, Color32::from_gray(220));
            painter.rect_stroke(
                tile_rect,
                0.0,
                egui::Stroke::new(1.0, Color32::GRAY),
                egui::StrokeKind::Inside,
            );
            painter.text(
                tile_rect.center(),
                egui::Align2::CENTER_CENTER,
                mark,
                egui::FontId::proportional(40.0),
                color,
            );
        };

        match self.poll_tile(ui, tile_id) {
            Tile::Loading(_) => placeholder(painter, "?", Color32::ORANGE),
            Tile::Loaded(texture) => {
                painter.image(
                    texture.id(),
                    tile_rect,
                    Rect::from_min_max(pos2(0.0, 0.0), pos2(1.0, 1.0)),
                    Color32::WHITE,
                );
            }
            Tile::Failed(e) => {
                let message = e.to_string();
                placeholder(painter, "!", Color32::RED);
                let response = ui.interact(tile_rect, ui.id().with(tile_id), Sense::hover());
                response.on_hover_text(message);
            }
        }
    }

    /// Draws the layers and markers.
    fn draw_overlays(&self, ui: &Ui, rect: &Rect) {
        let painter = ui.painter_at(*rect);
        let projection = self.projection(*rect);

        for (_, layer) in &self.layers {
            if let Some(source) = self.sources.get(layer.source()) {
                layer.draw(&painter, &projection, source);
            }
        }
        for marker in self.markers.values() {
            draw_marker(&painter, marker, &projection);
        }
    }

    /// Draws the zoom buttons.
    fn draw_navigation_control(&mut self, ui: &mut Ui, rect: &Rect) {
        if !self.navigation_control {
            return;
        }

        let mut zoom_step = 0.0;
        egui::Area::new(ui.id().with("navigation_control"))
            .fixed_pos(rect.right_top())
            .anchor(egui::Align2::RIGHT_TOP, egui::vec2(-10.0, 10.0))
            .show(ui.ctx(), |ui| {
                egui::Frame::popup(ui.style()).show(ui, |ui| {
                    ui.vertical(|ui| {
                        if ui.button("+").on_hover_text("Zoom in").clicked() {
                            zoom_step = 1.0;
                        }
                        if ui.button("−").on_hover_text("Zoom out").clicked() {
                            zoom_step = -1.0;
                        }
                    });
                });
            });

        if zoom_step != 0.0 {
            let target = Camera {
                center: self.center,
                zoom: self.zoom + zoom_step,
            };
            self.ease_to(target, NAVIGATION_DURATION);
        }
    }

    /// Draws the open popups and drops the ones the user closed.
    fn draw_popups(&mut self, ui: &mut Ui, rect: &Rect) {
        let projection = self.projection(*rect);
        let mut closed = Vec::new();

        for (id, popup) in &self.popups {
            if !projection.is_visible(popup.anchor) {
                continue;
            }
            let anchor = projection.project(popup.anchor);
            if !rect.contains(anchor) {
                continue;
            }

            egui::Area::new(ui.id().with(("popup", *id)))
                .fixed_pos(anchor)
                .pivot(egui::Align2::CENTER_BOTTOM)
                .constrain_to(*rect)
                .show(ui.ctx(), |ui| {
                    egui::Frame::popup(ui.style()).show(ui, |ui| {
                        ui.set_max_width(320.0);
                        ui.horizontal(|ui| {
                            if let Some(title) = &popup.title {
                                ui.strong(title);
                            }
                            ui.with_layout(egui::Layout::right_to_left(egui::Align::Min), |ui| {
                                if ui.small_button("×").clicked() {
                                    closed.push(*id);
                                }
                            });
                        });
                        egui::ScrollArea::vertical().max_height(240.0).show(ui, |ui| {
                            egui::Grid::new(("popup_rows", *id))
                                .num_columns(2)
                                .striped(true)
                                .show(ui, |ui| {
                                    for (key, value) in &popup.rows {
                                        ui.strong(key);
                                        ui.label(value);
                                        ui.end_row();
                                    }
                                });
                        });
                    });
                });
        }

        self.popups.retain(|(id, _)| !closed.contains(id));
    }

    /// Draws the attribution text.
    fn draw_attribution(&self, ui: &mut Ui, rect: &Rect) {
        if let Some(attribution) = self.config.attribution() {
            let bg_color = if ui.visuals().dark_mode {
                Color32::from_black_alpha(150)
            } else {
                Color32::from_white_alpha(150)
            };

            let frame = egui::Frame::NONE
                .inner_margin(egui::Margin::same(5)) // A bit of padding
                .fill(bg_color)
                .corner_radius(3.0);

            egui::Area::new(ui.id().with("attribution"))
                .fixed_pos(rect.left_bottom())
                .anchor(egui::Align2::LEFT_BOTTOM, egui::vec2(5.0, -5.0))
                .show(ui.ctx(), |ui| {
                    frame.show(ui, |ui| {
                        ui.style_mut().override_text_style = Some(egui::TextStyle::Small);
                        ui.style_mut().wrap_mode = Some(egui::TextWrapMode::Extend); // Don't wrap attribution text.

                        if let Some(url) = self.config.attribution_url() {
                            ui.hyperlink_to(attribution, url);
                        } else {
                            ui.label(attribution);
                        }
                    });
                });
        }
    }
}

/// The flat tiles covering `rect` and their screen rectangles. Tiles are taken from the integer
/// zoom level nearest to `zoom` and scaled.
fn visible_tiles(center: GeoPos, zoom: f64, rect: &Rect) -> Vec<(TileId, Rect)> {
    let tile_zoom = zoom.round().clamp(MIN_ZOOM, MAX_ZOOM);
    let tile_size = TILE_SIZE as f64 * 2.0_f64.powf(zoom - tile_zoom);
    let tiles_per_side = 2_i64.pow(tile_zoom as u32);

    let center_x = lon_to_x(center.lon, tile_zoom);
    let center_y = lat_to_y(center.lat, tile_zoom);

    let half_width = rect.width() as f64 / 2.0 / tile_size;
    let half_height = rect.height() as f64 / 2.0 / tile_size;

    let x_min = ((center_x - half_width).floor() as i64).max(0);
    let y_min = ((center_y - half_height).floor() as i64).max(0);
    let x_max = ((center_x + half_width).ceil() as i64).min(tiles_per_side - 1);
    let y_max = ((center_y + half_height).ceil() as i64).min(tiles_per_side - 1);

    let widget_center = rect.center();
    let mut tiles = Vec::new();
    for x in x_min..=x_max {
        for y in y_min..=y_max {
            let tile_id = TileId {
                z: tile_zoom as u8,
                x: x as u32,
                y: y as u32,
            };
            let min = widget_center
                + Vec2::new(
                    ((x as f64 - center_x) * tile_size) as f32,
                    ((y as f64 - center_y) * tile_size) as f32,
                );
            let tile_rect = Rect::from_min_size(min, Vec2::splat(tile_size as f32));
            tiles.push((tile_id, tile_rect));
        }
    }
    tiles
}

/// The tiles of level `tile_zoom` that show on the near side of the globe inside the widget.
fn visible_globe_tiles(projection: &MapProjection, tile_zoom: u8) -> Vec<TileId> {
    let n = 2_u32.pow(tile_zoom as u32);
    let z = tile_zoom as f64;
    let widget_rect = projection.widget_rect();
    let samples = [0.0, 0.5, 1.0];

    let mut tiles = Vec::new();
    for x in 0..n {
        for y in 0..n {
            let mut screen_bounds: Option<Rect> = None;
            for sx in samples {
                for sy in samples {
                    let geo = GeoPos {
                        lon: x_to_lon(x as f64 + sx, z),
                        lat: y_to_lat(y as f64 + sy, z),
                    };
                    if !projection.is_visible(geo) {
                        continue;
                    }
                    let screen = projection.project(geo);
                    screen_bounds = Some(match screen_bounds {
                        Some(bounds) => bounds.union(Rect::from_min_max(screen, screen)),
                        None => Rect::from_min_max(screen, screen),
                    });
                }
            }
            if screen_bounds.is_some_and(|bounds| bounds.intersects(widget_rect)) {
                tiles.push(TileId { z: tile_zoom, x, y });
            }
        }
    }
    tiles
}

/// Draws a tile onto the globe as a textured grid. Quads with a corner behind the globe are left
/// out.
fn draw_globe_tile(
    painter: &egui::Painter,
    texture_id: egui::TextureId,
    tile_id: TileId,
    projection: &MapProjection,
) {
    let z = tile_id.z as f64;
    let mut mesh = Mesh::with_texture(texture_id);
    let mut visible = Vec::with_capacity((GLOBE_TILE_STEPS + 1).pow(2));

    for j in 0..=GLOBE_TILE_STEPS {
        for i in 0..=GLOBE_TILE_STEPS {
            let u = i as f64 / GLOBE_TILE_STEPS as f64;
            let v = j as f64 / GLOBE_TILE_STEPS as f64;
            let geo = GeoPos {
                lon: x_to_lon(tile_id.x as f64 + u, z),
                lat: y_to_lat(tile_id.y as f64 + v, z),
            };
            visible.push(projection.is_visible(geo));
            mesh.vertices.push(egui::epaint::Vertex {
                pos: projection.project(geo),
                uv: pos2(u as f32, v as f32),
                color: Color32::WHITE,
            });
        }
    }

    let row = GLOBE_TILE_STEPS + 1;
    for j in 0..GLOBE_TILE_STEPS {
        for i in 0..GLOBE_TILE_STEPS {
            let a = j * row + i;
            let (b, c, d) = (a + 1, a + row, a + row + 1);
            if [a, b, c, d].iter().all(|&k| visible[k]) {
                mesh.add_triangle(a as u32, b as u32, c as u32);
                mesh.add_triangle(b as u32, d as u32, c as u32);
            }
        }
    }

    if !mesh.indices.is_empty() {
        painter.add(Shape::Mesh(mesh.into()));
    }
}

/// Converts longitude to the x-coordinate of a tile at a given zoom level.
fn lon_to_x(lon: f64, zoom: f64) -> f64 {
    (lon + 180.0) / 360.0 * (2.0_f64.powf(zoom))
}

/// Converts latitude to the y-coordinate of a tile at a given zoom level.
fn lat_to_y(lat: f64, zoom: f64) -> f64 {
    (1.0 - lat.to_radians().tan().asinh() / std::f64::consts::PI) / 2.0 * (2.0_f64.powf(zoom))
}

/// Converts the x-coordinate of a tile to longitude at a given zoom level.
fn x_to_lon(x: f64, zoom: f64) -> f64 {
    x / (2.0_f64.powf(zoom)) * 360.0 - 180.0
}

/// Converts the y-coordinate of a tile to latitude at a given zoom level.
fn y_to_lat(y: f64, zoom: f64) -> f64 {
    let n = std::f64::consts::PI - 2.0 * std::f64::consts::PI * y / (2.0_f64.powf(zoom));
    n.sinh().atan().to_degrees()
}

impl MapSurface for Map {
    fn camera(&self) -> Camera {
        Camera {
            center: self.center,
            zoom: self.zoom,
        }
    }

    fn jump_to(&mut self, camera: Camera) {
        self.animation = None;
        self.set_camera(camera);
    }

    fn ease_to(&mut self, camera: Camera, duration: Duration) {
        self.animation = Some(CameraAnimation {
            from: self.camera(),
            to: camera,
            duration: duration.as_secs_f64(),
            start: None,
        });
    }

    fn fit_bounds(&mut self, bounds: Bounds, options: FitOptions) {
        match self.viewport {
            Some(rect) => {
                let camera = camera_for_bounds(bounds, rect.size(), options, self.max_zoom);
                self.ease_to(camera, FIT_DURATION);
            }
            // The widget has not been laid out yet.
            None => self.pending_fit = Some((bounds, options)),
        }
    }

    fn set_max_zoom(&mut self, zoom: f64) {
        self.max_zoom = zoom.clamp(MIN_ZOOM, MAX_ZOOM);
        self.zoom = self.clamp_zoom(self.zoom);
    }

    fn max_zoom(&self) -> f64 {
        self.max_zoom
    }

    fn set_projection(&mut self, mode: ProjectionMode) {
        self.projection_mode = mode;
    }

    fn add_navigation_control(&mut self) {
        self.navigation_control = true;
    }

    fn set_cursor(&mut self, cursor: CursorIcon) {
        self.cursor = cursor;
    }

    fn has_source(&self, id: &str) -> bool {
        self.sources.contains_key(id)
    }

    fn add_source(
        &mut self,
        id: &str,
        data: geojson::FeatureCollection,
    ) -> Result<(), SurfaceError> {
        if self.sources.contains_key(id) {
            return Err(SurfaceError::DuplicateSource(id.to_string()));
        }
        debug!("Adding source `{}` with {} features", id, data.features.len());
        self.sources.insert(id.to_string(), GeoJsonSource::new(data));
        Ok(())
    }

    fn set_source_data(
        &mut self,
        id: &str,
        data: geojson::FeatureCollection,
    ) -> Result<(), SurfaceError> {
        let source = self
            .sources
            .get_mut(id)
            .ok_or_else(|| SurfaceError::UnknownSource(id.to_string()))?;
        debug!("Replacing source `{}` with {} features", id, data.features.len());
        *source = GeoJsonSource::new(data);
        Ok(())
    }

    fn remove_source(&mut self, id: &str) -> Result<(), SurfaceError> {
        if self.layers.iter().any(|(_, layer)| layer.source() == id) {
            return Err(SurfaceError::SourceInUse(id.to_string()));
        }
        self.sources
            .remove(id)
            .map(|_| debug!("Removed source `{}`", id))
            .ok_or_else(|| SurfaceError::UnknownSource(id.to_string()))
    }

    fn has_layer(&self, id: &str) -> bool {
        self.layers.iter().any(|(layer_id, _)| layer_id == id)
    }

    fn add_layer(&mut self, id: &str, layer: Box<dyn Layer>) -> Result<(), SurfaceError> {
        if self.has_layer(id) {
            return Err(SurfaceError::DuplicateLayer(id.to_string()));
        }
        if !self.sources.contains_key(layer.source()) {
            return Err(SurfaceError::UnknownSource(layer.source().to_string()));
        }
        self.layers.push((id.to_string(), layer));
        Ok(())
    }

    fn remove_layer(&mut self, id: &str) -> Result<(), SurfaceError> {
        let index = self
            .layers
            .iter()
            .position(|(layer_id, _)| layer_id == id)
            .ok_or_else(|| SurfaceError::UnknownLayer(id.to_string()))?;
        self.layers.remove(index);
        Ok(())
    }

    fn features_at(&self, screen: Pos2, layer_id: &str) -> Vec<geojson::Feature> {
        let Some(rect) = self.viewport else {
            return Vec::new();
        };
        let Some((_, layer)) = self.layers.iter().find(|(id, _)| id == layer_id) else {
            return Vec::new();
        };
        let Some(source) = self.sources.get(layer.source()) else {
            return Vec::new();
        };

        layer
            .hit_test(screen, &self.projection(rect), source)
            .into_iter()
            .filter_map(|index| source.feature(index).cloned())
            .collect()
    }

    fn add_marker(&mut self, marker: Marker) -> MarkerId {
        let id = MarkerId(self.next_marker_id);
        self.next_marker_id += 1;
        self.markers.insert(id, marker);
        id
    }

    fn remove_marker(&mut self, id: MarkerId) {
        self.markers.remove(&id);
    }

    fn marker_count(&self) -> usize {
        self.markers.len()
    }

    fn add_popup(&mut self, popup: Popup) {
        self.popups.push((self.next_popup_id, popup));
        self.next_popup_id += 1;
    }

    fn drain_events(&mut self) -> Vec<MapEvent> {
        self.events.drain(..).collect()
    }
}

impl Widget for &mut Map {
    fn ui(self, ui: &mut Ui) -> Response {
        let (rect, response) =
            ui.allocate_exact_size(ui.available_size(), Sense::drag().union(Sense::click()));

        self.viewport = Some(rect);
        if !self.loaded {
            self.loaded = true;
            self.events.push_back(MapEvent::Load);
        }
        if let Some((bounds, options)) = self.pending_fit.take() {
            self.fit_bounds(bounds, options);
        }
        if self.step_animation(ui.input(|i| i.time)) {
            ui.ctx().request_repaint();
        }

        self.handle_input(ui, &rect, &response);
        self.draw_map(ui, &rect);
        self.draw_overlays(ui, &rect);
        self.draw_navigation_control(ui, &rect);
        self.draw_attribution(ui, &rect);
        self.draw_popups(ui, &rect);
        self.report_zoom();

        response
    }
}
