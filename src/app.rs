//! The viewer application: a globe with a search box, shapefile upload and a catalogue list.

use eframe::egui;
use log::{error, info};
use poll_promise::Promise;
use std::path::Path;
use thiserror::Error;

use crate::Map;
use crate::archive::ArchiveError;
use crate::catalogue::Catalogue;
use crate::config::ViewerConfig;
use crate::controller::{MapController, UploadTicket, read_upload_file};
use crate::search::{Geocoder, NominatimGeocoder, SearchResult};

/// The viewer application.
pub struct GlobeViewerApp {
    controller: MapController<Map>,
    geocoder: NominatimGeocoder,
    query: String,
    search: Option<Promise<Vec<SearchResult>>>,
    results: Vec<SearchResult>,
    upload: Option<(UploadTicket, Promise<Result<Catalogue, ArchiveError>>)>,
    alert: Option<String>,
}

impl GlobeViewerApp {
    /// Creates the application and places the camera at the configured home view.
    pub fn new(config: ViewerConfig) -> Self {
        let map = Map::from_boxed(config.tile_provider.tile_config());
        let geocoder = NominatimGeocoder::new(config.geocoder_endpoint.clone(), config.geocoder_limit);

        let mut controller = MapController::new(map, config);
        controller.initialize();

        Self {
            controller,
            geocoder,
            query: String::new(),
            search: None,
            results: Vec::new(),
            upload: None,
            alert: None,
        }
    }

    /// Asks for a zip archive and decodes it in the background.
    fn pick_upload(&mut self) {
        let Some(path) = rfd::FileDialog::new()
            .add_filter("Zipped shapefile", &["zip"])
            .pick_file()
        else {
            return;
        };

        match self.controller.begin_upload() {
            Ok(ticket) => {
                info!("Decoding {}", path.display());
                let promise =
                    Promise::spawn_thread("decode_upload", move || read_upload_file(&path));
                self.upload = Some((ticket, promise));
            }
            Err(err) => self.alert = Some(err.to_string()),
        }
    }

    fn poll_upload(&mut self, ctx: &egui::Context) {
        let Some((ticket, promise)) = self.upload.take() else {
            return;
        };

        match promise.try_take() {
            Ok(decoded) => {
                if let Err(err) = self.controller.finish_upload(ticket, decoded) {
                    self.alert = Some(err.to_string());
                }
            }
            Err(promise) => {
                self.upload = Some((ticket, promise));
                ctx.request_repaint();
            }
        }
    }

    fn start_search(&mut self) {
        let query = self.query.trim().to_string();
        if query.is_empty() {
            self.results.clear();
            return;
        }
        let geocoder = self.geocoder.clone();
        self.search = Some(Promise::spawn_thread("search", move || {
            geocoder.forward_geocode(&query)
        }));
    }

    fn poll_search(&mut self, ctx: &egui::Context) {
        let Some(promise) = self.search.take() else {
            return;
        };

        match promise.try_take() {
            Ok(results) => self.results = results,
            Err(promise) => {
                self.search = Some(promise);
                ctx.request_repaint();
            }
        }
    }

    fn export_geojson(&mut self) {
        let Some(path) = rfd::FileDialog::new()
            .add_filter("GeoJSON", &["geojson", "json"])
            .set_file_name("upload.geojson")
            .save_file()
        else {
            return;
        };

        if let Err(err) = write_geojson(self.controller.catalogue(), &path) {
            error!("{}: {}", path.display(), err);
            self.alert = Some(err.to_string());
        }
    }

    fn search_window(&mut self, ctx: &egui::Context) {
        let mut selected = None;

        egui::Window::new("Search")
            .anchor(egui::Align2::LEFT_TOP, [10.0, 10.0])
            .resizable(false)
            .collapsible(false)
            .show(ctx, |ui| {
                ui.horizontal(|ui| {
                    let response = ui.add(
                        egui::TextEdit::singleline(&mut self.query).hint_text("Search places"),
                    );
                    let submitted =
                        response.lost_focus() && ui.input(|i| i.key_pressed(egui::Key::Enter));
                    if submitted || ui.button("🔍").clicked() {
                        self.start_search();
                    }
                    if self.search.is_some() {
                        ui.spinner();
                    }
                });

                for (index, result) in self.results.iter().enumerate() {
                    if ui.selectable_label(false, &result.place_name).clicked() {
                        selected = Some(index);
                    }
                }
            });

        if let Some(index) = selected {
            let result = self.results[index].clone();
            self.controller.place_search_marker(&result);
            self.results.clear();
        }
    }

    fn upload_panel(&mut self, ctx: &egui::Context) {
        let mut zoom_to = None;

        egui::SidePanel::right("upload_panel")
            .resizable(true)
            .default_width(260.0)
            .show(ctx, |ui| {
                ui.heading("Shapefile");

                let uploading = self.controller.is_uploading();
                if ui
                    .add_enabled(!uploading, egui::Button::new("Upload Shapefile (.zip)"))
                    .clicked()
                {
                    self.pick_upload();
                }
                if uploading {
                    ui.horizontal(|ui| {
                        ui.spinner();
                        ui.label("Reading archive…");
                    });
                }
                ui.small("The .zip must contain the .shp, .dbf and .shx files.");

                ui.separator();

                ui.horizontal_wrapped(|ui| {
                    if ui.button("Reset view").clicked() {
                        self.controller.reset_to_home();
                    }
                    if ui.button("Clear markers").clicked() {
                        self.controller.clear_area_markers();
                        self.controller.remove_search_marker();
                    }
                    if ui.button("Clear upload").clicked() {
                        if let Err(err) = self.controller.clear_uploads() {
                            self.alert = Some(err.to_string());
                        }
                    }
                    let has_upload = !self.controller.catalogue().is_empty();
                    if ui
                        .add_enabled(has_upload, egui::Button::new("Export GeoJSON"))
                        .clicked()
                    {
                        self.export_geojson();
                    }
                });

                ui.separator();

                egui::ScrollArea::vertical().show(ui, |ui| {
                    let catalogue = self.controller.catalogue();
                    if catalogue.is_empty() {
                        ui.weak("No shapefile uploaded");
                    }
                    for (index, collection) in catalogue.collections.iter().enumerate() {
                        egui::CollapsingHeader::new(format!(
                            "{} ({})",
                            collection.folder_name,
                            collection.features.len()
                        ))
                        .id_salt(("collection", index))
                        .default_open(true)
                        .show(ui, |ui| {
                            for feature in &collection.features {
                                let response = ui.selectable_label(false, &feature.name);
                                let response = match &feature.geometry {
                                    Some(geometry) => response.on_hover_text(geometry.kind()),
                                    None => response.on_hover_text("No geometry"),
                                };
                                if response.clicked() {
                                    zoom_to = Some(feature.id.clone());
                                }
                            }
                        });
                    }
                });

                if let Some(pos) = self.controller.surface().mouse_pos {
                    ui.separator();
                    ui.small(format!("{:.5}, {:.5}", pos.lat, pos.lon));
                }
            });

        if let Some(id) = zoom_to {
            self.controller.zoom_to_feature(&id);
        }
    }

    fn alert_modal(&mut self, ctx: &egui::Context) {
        let Some(message) = &self.alert else {
            return;
        };

        let mut close = false;
        let modal = egui::Modal::new(egui::Id::new("alert")).show(ctx, |ui| {
            ui.set_max_width(360.0);
            ui.heading("Something went wrong");
            ui.add_space(5.0);
            ui.label(message);
            ui.add_space(10.0);
            if ui.button("OK").clicked() {
                close = true;
            }
        });
        if close || modal.should_close() {
            self.alert = None;
        }
    }
}

/// Why a GeoJSON export failed.
#[derive(Error, Debug)]
pub enum ExportError {
    /// The file could not be written.
    #[error("Failed to write file: {0}")]
    Io(#[from] std::io::Error),

    /// The features could not be serialized.
    #[error("Failed to serialize: {0}")]
    Json(#[from] serde_json::Error),
}

/// Writes the catalogue's features as a GeoJSON feature collection.
fn write_geojson(catalogue: &Catalogue, path: &Path) -> Result<(), ExportError> {
    let json = serde_json::to_string_pretty(&catalogue.to_geojson())?;
    std::fs::write(path, json)?;
    info!("Exported {} features to {}", catalogue.feature_count(), path.display());
    Ok(())
}

impl eframe::App for GlobeViewerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.poll_upload(ctx);
        self.poll_search(ctx);

        self.upload_panel(ctx);

        egui::CentralPanel::default()
            .frame(egui::Frame::NONE)
            .show(ctx, |ui| {
                ui.add(self.controller.surface_mut());
            });
        self.controller.handle_events();

        self.search_window(ctx);
        self.alert_modal(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::read_upload;
    use crate::test_support::{ShapefileFixture, square, zip_entries};

    #[test]
    fn export_writes_a_feature_collection() {
        let bytes = zip_entries(
            &ShapefileFixture::polygons("name", &[(vec![square(1.0, 2.0, 1.0)], "Lumphini")])
                .entries("parks"),
        );
        let catalogue = read_upload(&bytes).unwrap();

        let path = std::env::temp_dir().join(format!("globe-view-export-{}.geojson", std::process::id()));
        write_geojson(&catalogue, &path).unwrap();

        let written: geojson::FeatureCollection =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(written.features.len(), 1);
        assert_eq!(
            written.features[0].property("name"),
            Some(&serde_json::Value::from("Lumphini"))
        );
    }

    #[test]
    fn export_to_missing_directory_is_an_error() {
        let path = Path::new("/definitely/not/here/out.geojson");
        let error = write_geojson(&Catalogue::default(), path).unwrap_err();
        assert!(matches!(error, ExportError::Io(_)));
        assert!(error.to_string().starts_with("Failed to write file"));
    }
}
