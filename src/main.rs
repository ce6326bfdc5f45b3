#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")] // hide console window on Windows in release

use eframe::egui;
use egui_globe_view::{app::GlobeViewerApp, config::ViewerConfig};
use log::{error, info};

/// Environment variable naming an optional JSON configuration file.
const CONFIG_ENV: &str = "EGUI_GLOBE_VIEW_CONFIG";

fn main() -> eframe::Result {
    // Log to stdout (if you run with `RUST_LOG=debug`).
    env_logger::init();

    let config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => match ViewerConfig::load(&path) {
            Ok(config) => {
                info!("Loaded configuration from {}", path.to_string_lossy());
                config
            }
            Err(err) => {
                error!("{}: {}, using defaults", path.to_string_lossy(), err);
                ViewerConfig::default()
            }
        },
        None => ViewerConfig::default(),
    };

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default().with_inner_size([1280.0, 800.0]),
        ..Default::default()
    };

    eframe::run_native(
        "Globe View",
        options,
        Box::new(|_cc| Ok(Box::new(GlobeViewerApp::new(config)))),
    )
}
