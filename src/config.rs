//! Configuration for tile providers and for the viewer.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::TileId;
use crate::projection::GeoPos;
use crate::surface::{Camera, FitOptions};

/// Configuration for a map provider.
pub trait MapConfig {
    /// Returns the URL for a given tile.
    fn tile_url(&self, tile: &TileId) -> String;

    /// Returns the attribution text to be displayed on the map. If returns `None`, no attribution is shown.
    fn attribution(&self) -> Option<&String>;

    /// Returns the attribution URL to be linked from the attribution text.
    fn attribution_url(&self) -> Option<&String>;

    /// The default geographical center of the map.
    fn default_center(&self) -> GeoPos;

    /// The default zoom level of the map.
    fn default_zoom(&self) -> f64;
}

/// Configuration for the Esri World Imagery tile server.
///
/// # Example
///
/// ```
/// use egui_globe_view::config::EsriWorldImageryConfig;
/// let config = EsriWorldImageryConfig::default();
/// ```
pub struct EsriWorldImageryConfig {
    base_url: String,
    attribution: String,
    attribution_url: String,
    default_center: GeoPos,
    default_zoom: f64,
}

impl Default for EsriWorldImageryConfig {
    fn default() -> Self {
        Self {
            base_url: "https://server.arcgisonline.com/ArcGIS/rest/services/World_Imagery/MapServer/tile"
                .to_string(),
            attribution: "Tiles © Esri".to_string(),
            attribution_url: "https://www.esri.com".to_string(),
            default_center: GeoPos {
                lon: 100.5,
                lat: 13.7,
            }, // Bangkok, Thailand
            default_zoom: 1.5,
        }
    }
}

impl MapConfig for EsriWorldImageryConfig {
    fn tile_url(&self, tile: &TileId) -> String {
        format!("{}/{}/{}/{}", self.base_url, tile.z, tile.y, tile.x)
    }

    fn attribution(&self) -> Option<&String> {
        Some(&self.attribution)
    }

    fn attribution_url(&self) -> Option<&String> {
        Some(&self.attribution_url)
    }

    fn default_center(&self) -> GeoPos {
        self.default_center
    }

    fn default_zoom(&self) -> f64 {
        self.default_zoom
    }
}

/// Configuration for the OpenStreetMap tile server.
///
/// # Example
///
/// ```
/// use egui_globe_view::config::OpenStreetMapConfig;
/// let config = OpenStreetMapConfig::default();
/// ```
pub struct OpenStreetMapConfig {
    base_url: String,
    attribution: String,
    attribution_url: String,
    default_center: GeoPos,
    default_zoom: f64,
}

impl Default for OpenStreetMapConfig {
    fn default() -> Self {
        Self {
            base_url: "https://tile.openstreetmap.org".to_string(),
            attribution: "© OpenStreetMap contributors".to_string(),
            attribution_url: "https://www.openstreetmap.org".to_string(),
            default_center: GeoPos {
                lon: 100.5,
                lat: 13.7,
            },
            default_zoom: 5.0,
        }
    }
}

impl MapConfig for OpenStreetMapConfig {
    fn tile_url(&self, tile: &TileId) -> String {
        format!("{}/{}/{}/{}.png", self.base_url, tile.z, tile.x, tile.y)
    }

    fn attribution(&self) -> Option<&String> {
        Some(&self.attribution)
    }

    fn attribution_url(&self) -> Option<&String> {
        Some(&self.attribution_url)
    }

    fn default_center(&self) -> GeoPos {
        self.default_center
    }

    fn default_zoom(&self) -> f64 {
        self.default_zoom
    }
}

/// A map configuration with a tile URL function chosen at runtime.
///
/// # Example
///
/// ```
/// use egui_globe_view::config::DynMapConfig;
/// let config = DynMapConfig::new(|tile| format!("https://my-tile-server/{}/{}/{}.png", tile.z, tile.x, tile.y));
/// ```
pub struct DynMapConfig {
    tile_url: Box<dyn Fn(&TileId) -> String>,
    attribution: Option<String>,
}

impl DynMapConfig {
    /// Creates a new `DynMapConfig` with a custom tile URL function.
    pub fn new(tile_url: impl Fn(&TileId) -> String + 'static) -> Self {
        Self {
            tile_url: Box::new(tile_url),
            attribution: None,
        }
    }

    /// Tiles from an XYZ URL template with `{z}`, `{x}` and `{y}` placeholders.
    pub fn from_template(template: impl Into<String>) -> Self {
        let template = template.into();
        Self::new(move |tile| {
            template
                .replace("{z}", &tile.z.to_string())
                .replace("{x}", &tile.x.to_string())
                .replace("{y}", &tile.y.to_string())
        })
    }

    /// Sets the attribution text shown on the map.
    pub fn with_attribution(mut self, attribution: Option<String>) -> Self {
        self.attribution = attribution;
        self
    }
}

impl MapConfig for DynMapConfig {
    fn tile_url(&self, tile: &TileId) -> String {
        (self.tile_url)(tile)
    }

    fn attribution(&self) -> Option<&String> {
        self.attribution.as_ref()
    }

    fn attribution_url(&self) -> Option<&String> {
        None
    }

    fn default_center(&self) -> GeoPos {
        GeoPos {
            lon: 100.5,
            lat: 13.7,
        }
    }

    fn default_zoom(&self) -> f64 {
        2.0
    }
}

/// The tile providers selectable from the viewer configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileProvider {
    /// Satellite imagery from Esri.
    #[default]
    EsriWorldImagery,

    /// The OpenStreetMap street map.
    OpenStreetMap,

    /// Any XYZ tile server, e.g. `{ "custom": { "url_template": "https://host/{z}/{x}/{y}.png" } }`.
    Custom {
        /// Tile URL with `{z}`, `{x}` and `{y}` placeholders.
        url_template: String,

        /// Attribution text shown on the map.
        #[serde(default)]
        attribution: Option<String>,
    },
}

impl TileProvider {
    /// The provider's tile configuration.
    pub fn tile_config(&self) -> Box<dyn MapConfig> {
        match self {
            TileProvider::EsriWorldImagery => Box::new(EsriWorldImageryConfig::default()),
            TileProvider::OpenStreetMap => Box::new(OpenStreetMapConfig::default()),
            TileProvider::Custom {
                url_template,
                attribution,
            } => Box::new(
                DynMapConfig::from_template(url_template.clone())
                    .with_attribution(attribution.clone()),
            ),
        }
    }
}

/// Errors while loading a [`ViewerConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Unable to read configuration file")]
    Io(#[from] std::io::Error),

    /// The file is not valid configuration JSON.
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Camera limits, framing rules and search settings of the viewer. Every field has a default,
/// so a configuration file only needs the values it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Base imagery.
    pub tile_provider: TileProvider,

    /// Center of the initial and the reset view.
    pub home_center: GeoPos,

    /// Zoom of the initial and the reset view.
    pub home_zoom: f64,

    /// The user can not zoom in further than this.
    pub max_zoom: f64,

    /// Screen points kept free around fitted bounds.
    pub fit_padding: f32,

    /// Fitting never zooms in further than this.
    pub fit_max_zoom: f64,

    /// Zoom used when jumping to a search result.
    pub search_zoom: f64,

    /// Length of the reset animation in milliseconds.
    pub reset_duration_ms: u64,

    /// Nominatim compatible search endpoint.
    pub geocoder_endpoint: String,

    /// Number of search results requested.
    pub geocoder_limit: u32,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            tile_provider: TileProvider::default(),
            home_center: GeoPos {
                lon: 100.5,
                lat: 13.7,
            },
            home_zoom: 1.5,
            max_zoom: 17.0,
            fit_padding: 50.0,
            fit_max_zoom: 17.0,
            search_zoom: 16.0,
            reset_duration_ms: 1500,
            geocoder_endpoint: crate::search::NOMINATIM_SEARCH_URL.to_string(),
            geocoder_limit: 5,
        }
    }
}

impl ViewerConfig {
    /// Parses a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// The camera of the initial and the reset view.
    pub fn home_camera(&self) -> Camera {
        Camera {
            center: self.home_center,
            zoom: self.home_zoom,
        }
    }

    /// How uploads and catalogue entries are framed.
    pub fn fit_options(&self) -> FitOptions {
        FitOptions {
            padding: self.fit_padding,
            max_zoom: self.fit_max_zoom,
        }
    }

    /// Length of the reset animation.
    pub fn reset_duration(&self) -> Duration {
        Duration::from_millis(self.reset_duration_ms)
    }
}
