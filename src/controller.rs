//! The rules tying uploads, markers and the camera to a [`MapSurface`].

use egui::{Color32, CursorIcon, Pos2};
use log::{debug, error, info, warn};
use std::panic::UnwindSafe;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::archive::{ArchiveError, ShapefileZipDecoder, decode_archive};
use crate::catalogue::{Catalogue, build_catalogue};
use crate::config::ViewerConfig;
use crate::geometry::Bounds;
use crate::layers::fill::FillLayer;
use crate::layers::line::LineLayer;
use crate::overlay::{Marker, MarkerId, Popup};
use crate::projection::{GeoPos, ProjectionMode};
use crate::properties::{attribute_rows, properties_from_json};
use crate::search::SearchResult;
use crate::surface::{Camera, FitOptions, MapEvent, MapSurface, SurfaceError};

/// Id of the source holding the uploaded features.
pub const UPLOAD_SOURCE_ID: &str = "uploaded-shp";

/// Id of the layer filling the uploaded polygons.
pub const FILL_LAYER_ID: &str = "shp-layer-fill";

/// Id of the layer outlining the uploaded features.
pub const LINE_LAYER_ID: &str = "shp-layer-line";

const SEARCH_FLIGHT: Duration = Duration::from_millis(1200);
const SEARCH_MARKER_COLOR: Color32 = Color32::from_rgb(0xe5, 0x3e, 0x3e);

/// Why an upload was not applied.
#[derive(Error, Debug)]
pub enum UploadError {
    /// Another upload is still being decoded.
    #[error("Another upload is still being processed")]
    Busy,

    /// The ticket does not belong to the pending upload.
    #[error("The upload is no longer pending")]
    StaleTicket,

    /// The archive could not be read.
    #[error("Invalid shapefile archive: {0}")]
    Archive(#[from] ArchiveError),

    /// The surface rejected a source or layer change.
    #[error(transparent)]
    Surface(#[from] SurfaceError),
}

/// Proof of a pending upload, handed out by [`MapController::begin_upload`].
#[derive(Debug, PartialEq, Eq)]
pub struct UploadTicket(u64);

/// Decodes an uploaded zip archive and builds its catalogue.
pub fn read_upload(bytes: &[u8]) -> Result<Catalogue, ArchiveError> {
    decode_archive(&ShapefileZipDecoder, bytes).map(build_catalogue)
}

/// Reads an archive from disk and decodes it. Blocks, so run it off the UI thread.
///
/// A panic inside the decoder is reported as [`ArchiveError::Decode`] instead of unwinding into
/// the caller.
pub fn read_upload_file(path: &Path) -> Result<Catalogue, ArchiveError> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    catch_decode_panic(&name, || {
        let bytes = std::fs::read(path)?;
        debug!("Read {} bytes from {}", bytes.len(), path.display());
        read_upload(&bytes)
    })
}

fn catch_decode_panic(
    name: &str,
    decode: impl FnOnce() -> Result<Catalogue, ArchiveError> + UnwindSafe,
) -> Result<Catalogue, ArchiveError> {
    std::panic::catch_unwind(decode).unwrap_or_else(|_| {
        error!("Decoder panicked on `{}`", name);
        Err(ArchiveError::Decode {
            name: name.to_string(),
            message: "the decoder stopped unexpectedly".to_string(),
        })
    })
}

/// Owns a map surface and everything placed on it.
pub struct MapController<S: MapSurface> {
    surface: S,
    config: ViewerConfig,
    catalogue: Catalogue,
    area_markers: Vec<MarkerId>,
    search_marker: Option<MarkerId>,
    hovering: bool,
    pending_upload: Option<u64>,
    next_ticket: u64,
}

impl<S: MapSurface> MapController<S> {
    /// Takes ownership of `surface`. Call [`Self::initialize`] before the first frame.
    pub fn new(surface: S, config: ViewerConfig) -> Self {
        Self {
            surface,
            config,
            catalogue: Catalogue::default(),
            area_markers: Vec::new(),
            search_marker: None,
            hovering: false,
            pending_upload: None,
            next_ticket: 0,
        }
    }

    /// Moves the camera home and sets the zoom ceiling. The globe and the navigation control
    /// follow once the surface reports [`MapEvent::Load`].
    pub fn initialize(&mut self) {
        self.surface.set_max_zoom(self.config.max_zoom);
        self.surface.jump_to(self.config.home_camera());
    }

    /// Removes everything the controller placed and hands the surface back.
    pub fn dispose(mut self) -> S {
        if let Err(e) = self.clear_uploads() {
            error!("Teardown failed: {}", e);
        }
        self.remove_search_marker();
        self.surface
    }

    /// The surface.
    pub fn surface(&self) -> &S {
        &self.surface
    }

    /// The surface, for drawing it.
    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    /// The viewer configuration.
    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    /// Features of the most recent successful upload.
    pub fn catalogue(&self) -> &Catalogue {
        &self.catalogue
    }

    /// Returns `true` between [`Self::begin_upload`] and [`Self::finish_upload`].
    pub fn is_uploading(&self) -> bool {
        self.pending_upload.is_some()
    }

    /// The current search marker, if any.
    pub fn search_marker(&self) -> Option<MarkerId> {
        self.search_marker
    }

    fn zoom_ceiling(&self) -> f64 {
        self.config.max_zoom.min(self.surface.max_zoom())
    }

    /// Handles everything the surface reported since the last call.
    pub fn handle_events(&mut self) {
        for event in self.surface.drain_events() {
            match event {
                MapEvent::Load => {
                    debug!("Map loaded, switching to globe");
                    self.surface.set_projection(ProjectionMode::Globe);
                    self.surface.add_navigation_control();
                }
                MapEvent::ZoomChanged { zoom } => {
                    let ceiling = self.zoom_ceiling();
                    if zoom > ceiling {
                        debug!("Zoom {} above ceiling {}", zoom, ceiling);
                        let center = self.surface.camera().center;
                        self.surface.jump_to(Camera {
                            center,
                            zoom: ceiling,
                        });
                    }
                }
                MapEvent::Click { screen, geo } => self.inspect(screen, geo),
                MapEvent::PointerMoved { screen } => {
                    let over = self.surface.has_layer(FILL_LAYER_ID)
                        && !self.surface.features_at(screen, FILL_LAYER_ID).is_empty();
                    self.set_hovering(over);
                }
                MapEvent::PointerLeft => self.set_hovering(false),
            }
        }
    }

    fn set_hovering(&mut self, hovering: bool) {
        if hovering != self.hovering {
            self.hovering = hovering;
            self.surface.set_cursor(if hovering {
                CursorIcon::PointingHand
            } else {
                CursorIcon::Default
            });
        }
    }

    /// Opens an attribute popup for the topmost uploaded feature under `screen`.
    fn inspect(&mut self, screen: Pos2, geo: Option<GeoPos>) {
        let Some(anchor) = geo else {
            return;
        };
        if !self.surface.has_layer(FILL_LAYER_ID) {
            return;
        }
        let Some(feature) = self.surface.features_at(screen, FILL_LAYER_ID).into_iter().next()
        else {
            return;
        };

        let title = match &feature.id {
            Some(geojson::feature::Id::String(id)) => {
                self.catalogue.find(id).map(|f| f.name.clone())
            }
            _ => None,
        };
        let properties = feature
            .properties
            .as_ref()
            .map(properties_from_json)
            .unwrap_or_default();

        self.surface.add_popup(Popup {
            anchor,
            title,
            rows: attribute_rows(&properties),
        });
    }

    /// Starts an upload. Fails with [`UploadError::Busy`] while another one is pending.
    pub fn begin_upload(&mut self) -> Result<UploadTicket, UploadError> {
        if self.pending_upload.is_some() {
            warn!("Upload rejected, another one is pending");
            return Err(UploadError::Busy);
        }
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.pending_upload = Some(ticket);
        Ok(UploadTicket(ticket))
    }

    /// Finishes the upload of `ticket`. A decoded catalogue replaces the previous upload and the
    /// camera fits its bounds. A failed decode leaves the map untouched.
    pub fn finish_upload(
        &mut self,
        ticket: UploadTicket,
        decoded: Result<Catalogue, ArchiveError>,
    ) -> Result<(), UploadError> {
        if self.pending_upload != Some(ticket.0) {
            return Err(UploadError::StaleTicket);
        }
        self.pending_upload = None;

        let catalogue = decoded.inspect_err(|e| error!("Upload failed: {}", e))?;

        self.apply_catalogue(&catalogue)?;
        self.clear_area_markers();
        for marker in &catalogue.markers {
            let id = self
                .surface
                .add_marker(Marker::new(marker.position).with_label(marker.label.clone()));
            self.area_markers.push(id);
        }
        info!(
            "Uploaded {} features in {} collections",
            catalogue.feature_count(),
            catalogue.collections.len()
        );

        let bounds = catalogue.bounds();
        self.catalogue = catalogue;
        match bounds {
            Some(bounds) => self.fit_to(bounds, self.config.fit_options()),
            None => warn!("Upload has no location, camera not moved"),
        }
        Ok(())
    }

    /// Puts the catalogue's features into the upload source. An existing source gets its data
    /// replaced, otherwise the source and both layers are created.
    pub fn apply_catalogue(&mut self, catalogue: &Catalogue) -> Result<(), SurfaceError> {
        let data = catalogue.to_geojson();

        if self.surface.has_source(UPLOAD_SOURCE_ID) {
            self.surface.set_source_data(UPLOAD_SOURCE_ID, data)?;
        } else {
            self.surface.add_source(UPLOAD_SOURCE_ID, data)?;
        }

        if !self.surface.has_layer(FILL_LAYER_ID) {
            self.surface
                .add_layer(FILL_LAYER_ID, Box::new(FillLayer::new(UPLOAD_SOURCE_ID)))?;
        }
        if !self.surface.has_layer(LINE_LAYER_ID) {
            self.surface
                .add_layer(LINE_LAYER_ID, Box::new(LineLayer::new(UPLOAD_SOURCE_ID)))?;
        }
        Ok(())
    }

    /// Removes the uploaded layers, source, area markers and catalogue. Safe to call when
    /// nothing was uploaded.
    pub fn clear_uploads(&mut self) -> Result<(), SurfaceError> {
        for layer in [LINE_LAYER_ID, FILL_LAYER_ID] {
            if self.surface.has_layer(layer) {
                self.surface.remove_layer(layer)?;
            }
        }
        if self.surface.has_source(UPLOAD_SOURCE_ID) {
            self.surface.remove_source(UPLOAD_SOURCE_ID)?;
        }
        self.clear_area_markers();
        self.catalogue = Catalogue::default();
        self.set_hovering(false);
        Ok(())
    }

    /// Removes every area marker. The search marker stays.
    pub fn clear_area_markers(&mut self) {
        for id in self.area_markers.drain(..) {
            self.surface.remove_marker(id);
        }
    }

    /// Frames `bounds`. The zoom ceiling of `options` is capped by the surface's max zoom.
    pub fn fit_to(&mut self, bounds: Bounds, options: FitOptions) {
        let options = FitOptions {
            max_zoom: options.max_zoom.min(self.zoom_ceiling()),
            ..options
        };
        self.surface.fit_bounds(bounds, options);
    }

    /// Frames one catalogue feature. Returns `false` for unknown ids and features without a
    /// location.
    pub fn zoom_to_feature(&mut self, id: &str) -> bool {
        let Some(bounds) = self.catalogue.find(id).and_then(|feature| feature.bounds()) else {
            warn!("Feature `{}` has no location", id);
            return false;
        };
        self.fit_to(bounds, self.config.fit_options());
        true
    }

    /// Animates the camera back to the home view.
    pub fn reset_to_home(&mut self) {
        self.surface
            .ease_to(self.config.home_camera(), self.config.reset_duration());
    }

    /// Marks a search result, replacing the previous search marker, and flies to it.
    pub fn place_search_marker(&mut self, result: &SearchResult) -> MarkerId {
        self.remove_search_marker();

        let mut marker = Marker::new(result.center).with_color(SEARCH_MARKER_COLOR);
        if !result.place_name.is_empty() {
            marker = marker.with_label(result.place_name.clone());
        }
        let id = self.surface.add_marker(marker);
        self.search_marker = Some(id);

        let camera = Camera {
            center: result.center,
            zoom: self.config.search_zoom.min(self.zoom_ceiling()),
        };
        self.surface.ease_to(camera, SEARCH_FLIGHT);
        id
    }

    /// Removes the search marker, if any.
    pub fn remove_search_marker(&mut self) {
        if let Some(id) = self.search_marker.take() {
            self.surface.remove_marker(id);
        }
    }
}
