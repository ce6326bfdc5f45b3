//! Grouping decoded shapefile records into named, addressable features.

use log::warn;
use std::collections::HashSet;

use crate::archive::RawCollection;
use crate::geometry::{Bounds, Geometry, bounds_of, compute_bounds, compute_centroid};
use crate::projection::GeoPos;
use crate::properties::{Properties, properties_to_json};

/// Attribute keys tried in order when naming a feature.
pub const NAME_KEYS: [&str; 7] = [
    "name", "name_th", "name_en", "NAME_TH", "NAME_EN", "Name", "NAME",
];

/// Folder name for collections decoded without a source name.
pub const DEFAULT_FOLDER_NAME: &str = "Uploaded";

/// A single uploaded feature.
#[derive(Clone, Debug, PartialEq)]
pub struct Feature {
    /// `"{folder}-{index}"`, unique within a catalogue.
    pub id: String,

    /// Display name.
    pub name: String,

    /// `None` for records with a null shape. Such features are listed but not drawn.
    pub geometry: Option<Geometry>,

    /// The feature's attributes.
    pub properties: Properties,
}

impl Feature {
    /// Bounds of the feature's own geometry.
    pub fn bounds(&self) -> Option<Bounds> {
        self.geometry.as_ref().and_then(compute_bounds)
    }

    /// Where the feature's label marker goes.
    pub fn centroid(&self) -> Option<GeoPos> {
        self.geometry.as_ref().and_then(compute_centroid)
    }
}

/// The features of one shapefile set.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureCollection {
    /// Name shown as a folder in the catalogue list.
    pub folder_name: String,

    /// Features in record order.
    pub features: Vec<Feature>,
}

/// A labelled marker placed at a feature's centroid.
#[derive(Clone, Debug, PartialEq)]
pub struct AreaMarker {
    /// The feature the marker belongs to.
    pub feature_id: String,

    /// Text of the marker's label popup.
    pub label: String,

    /// Marker position.
    pub position: GeoPos,
}

/// Everything from the most recent successful upload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Catalogue {
    /// Collections in archive order.
    pub collections: Vec<FeatureCollection>,

    /// One marker per feature with a usable location.
    pub markers: Vec<AreaMarker>,
}

impl Catalogue {
    /// All features of all collections.
    pub fn features(&self) -> impl Iterator<Item = &Feature> {
        self.collections
            .iter()
            .flat_map(|collection| collection.features.iter())
    }

    /// Number of features across all collections.
    pub fn feature_count(&self) -> usize {
        self.collections.iter().map(|c| c.features.len()).sum()
    }

    /// Looks up a feature by id.
    pub fn find(&self, id: &str) -> Option<&Feature> {
        self.features().find(|feature| feature.id == id)
    }

    /// Bounds over every feature. `None` when nothing has a finite coordinate.
    pub fn bounds(&self) -> Option<Bounds> {
        bounds_of(self.features().filter_map(|f| f.geometry.as_ref()))
    }

    /// Returns `true` when the catalogue holds no features.
    pub fn is_empty(&self) -> bool {
        self.feature_count() == 0
    }

    /// The drawable features as one GeoJSON collection. Features without geometry are left out.
    /// Each feature carries its catalogue id.
    pub fn to_geojson(&self) -> geojson::FeatureCollection {
        let features = self
            .features()
            .filter_map(|feature| {
                let geometry = feature.geometry.as_ref()?;
                Some(geojson::Feature {
                    bbox: None,
                    geometry: Some(geojson::Geometry::new(geojson::Value::from(geometry))),
                    id: Some(geojson::feature::Id::String(feature.id.clone())),
                    properties: Some(properties_to_json(&feature.properties)),
                    foreign_members: None,
                })
            })
            .collect();

        geojson::FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        }
    }
}

/// The display name of a record: the first [`NAME_KEYS`] attribute that is non-blank text or a
/// number, else `"Area {index + 1}"`.
pub fn resolve_name(properties: &Properties, index: usize) -> String {
    NAME_KEYS
        .iter()
        .find_map(|key| properties.get(*key).and_then(|value| value.as_label()))
        .unwrap_or_else(|| format!("Area {}", index + 1))
}

/// Returns `name`, or `"{name} (n)"` for the n-th repeat, and records it as taken.
fn unique_folder_name(name: String, taken: &mut HashSet<String>) -> String {
    let mut candidate = name.clone();
    let mut n = 2;
    while !taken.insert(candidate.clone()) {
        candidate = format!("{name} ({n})");
        n += 1;
    }
    candidate
}

/// Builds the catalogue from decoded collections. Collections sharing a source name, such as
/// `north/areas.shp` and `south/areas.shp`, get distinct folder names so feature ids stay unique.
pub fn build_catalogue(raw: Vec<RawCollection>) -> Catalogue {
    let mut catalogue = Catalogue::default();
    let mut taken = HashSet::new();

    for collection in raw {
        let folder_name = unique_folder_name(
            collection
                .source_name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FOLDER_NAME.to_string()),
            &mut taken,
        );

        let mut features = Vec::with_capacity(collection.features.len());
        for (index, raw_feature) in collection.features.into_iter().enumerate() {
            let feature = Feature {
                id: format!("{folder_name}-{index}"),
                name: resolve_name(&raw_feature.properties, index),
                geometry: raw_feature.geometry,
                properties: raw_feature.properties,
            };

            match feature.centroid() {
                Some(position) => catalogue.markers.push(AreaMarker {
                    feature_id: feature.id.clone(),
                    label: feature.name.clone(),
                    position,
                }),
                None => warn!("Feature `{}` has no location, no marker placed", feature.id),
            }
            features.push(feature);
        }

        catalogue.collections.push(FeatureCollection {
            folder_name,
            features,
        });
    }

    catalogue
}
