//! Place search against a Nominatim geocoder.

use log::{debug, error, info};
use thiserror::Error;

use crate::CLIENT;
use crate::projection::GeoPos;

/// The public OpenStreetMap Nominatim search endpoint.
pub const NOMINATIM_SEARCH_URL: &str = "https://nominatim.openstreetmap.org/search";

/// Errors of a single lookup. They never reach the user, a failed lookup has no results.
#[derive(Error, Debug)]
pub enum SearchError {
    /// An error occurred while making a web request.
    #[error("Connection error")]
    ConnectionError(#[from] reqwest::Error),

    /// The geocoder answered with an error status.
    #[error("Geocoder returned HTTP status `{0}`")]
    Status(String),

    /// The response body is not GeoJSON.
    #[error("Unable to parse geocoder response")]
    Parse(#[from] geojson::Error),

    /// The response is GeoJSON but not a feature collection.
    #[error("Geocoder response is not a feature collection")]
    NotACollection,
}

/// A place found by the geocoder.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchResult {
    /// Position of the place.
    pub center: GeoPos,

    /// Human readable name, Nominatim's `display_name`.
    pub place_name: String,

    /// All properties the geocoder returned.
    pub properties: serde_json::Map<String, serde_json::Value>,
}

/// Turns a free text query into places.
pub trait Geocoder {
    /// Looks up `query`. Failures are logged and yield no results.
    fn forward_geocode(&self, query: &str) -> Vec<SearchResult>;
}

/// A geocoder speaking the Nominatim search API.
#[derive(Clone, Debug)]
pub struct NominatimGeocoder {
    endpoint: String,
    limit: u32,
}

impl Default for NominatimGeocoder {
    fn default() -> Self {
        Self::new(NOMINATIM_SEARCH_URL, 5)
    }
}

impl NominatimGeocoder {
    /// Creates a geocoder for `endpoint` requesting up to `limit` results.
    pub fn new(endpoint: impl Into<String>, limit: u32) -> Self {
        Self {
            endpoint: endpoint.into(),
            limit,
        }
    }

    fn search(&self, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        let limit = self.limit.to_string();
        debug!("Searching `{}` from {}", query, self.endpoint);
        let response = CLIENT
            .get(&self.endpoint)
            .query(&[
                ("q", query),
                ("format", "geojson"),
                ("addressdetails", "1"),
                ("limit", limit.as_str()),
            ])
            .send()?;

        if !response.status().is_success() {
            return Err(SearchError::Status(response.status().to_string()));
        }

        parse_results(&response.text()?)
    }
}

impl Geocoder for NominatimGeocoder {
    fn forward_geocode(&self, query: &str) -> Vec<SearchResult> {
        let query = query.trim();
        if query.is_empty() {
            return Vec::new();
        }

        match self.search(query) {
            Ok(results) => {
                info!("Search `{}` found {} places", query, results.len());
                results
            }
            Err(e) => {
                error!("Search `{}` failed: {}", query, e);
                Vec::new()
            }
        }
    }
}

/// Reads the places of a Nominatim GeoJSON response. Features without a point geometry are
/// skipped.
pub fn parse_results(body: &str) -> Result<Vec<SearchResult>, SearchError> {
    let geojson::GeoJson::FeatureCollection(collection) = body.parse::<geojson::GeoJson>()? else {
        return Err(SearchError::NotACollection);
    };

    Ok(collection
        .features
        .into_iter()
        .filter_map(|feature| {
            let geojson::Value::Point(coordinates) = &feature.geometry.as_ref()?.value else {
                return None;
            };
            let [lon, lat, ..] = coordinates.as_slice() else {
                return None;
            };
            let center = GeoPos {
                lon: *lon,
                lat: *lat,
            };

            let properties = feature.properties.unwrap_or_default();
            let place_name = properties
                .get("display_name")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();

            Some(SearchResult {
                center,
                place_name,
                properties,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = r#"{
        "type": "FeatureCollection",
        "licence": "Data © OpenStreetMap contributors, ODbL 1.0.",
        "features": [
            {
                "type": "Feature",
                "properties": {
                    "place_id": 1,
                    "display_name": "Bangkok, Thailand",
                    "address": { "country": "Thailand" }
                },
                "bbox": [100.3, 13.5, 100.9, 13.9],
                "geometry": { "type": "Point", "coordinates": [100.4935, 13.7524] }
            },
            {
                "type": "Feature",
                "properties": { "display_name": "Somewhere without a point" },
                "geometry": { "type": "LineString", "coordinates": [[0, 0], [1, 1]] }
            },
            {
                "type": "Feature",
                "properties": {},
                "geometry": { "type": "Point", "coordinates": [1.5, 2.5] }
            }
        ]
    }"#;

    #[test]
    fn parses_point_results() {
        let results = parse_results(RESPONSE).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].place_name, "Bangkok, Thailand");
        assert_eq!(results[0].center, GeoPos::from((100.4935, 13.7524)));
        assert_eq!(results[0].properties["address"]["country"], "Thailand");
        assert_eq!(results[1].place_name, "");
    }

    #[test]
    fn non_collections_are_rejected() {
        assert!(matches!(
            parse_results(r#"{ "type": "Point", "coordinates": [1, 2] }"#),
            Err(SearchError::NotACollection)
        ));
        assert!(matches!(
            parse_results("<html>Too many requests</html>"),
            Err(SearchError::Parse(_))
        ));
    }

    #[test]
    fn blank_query_returns_nothing() {
        let geocoder = NominatimGeocoder::new("http://127.0.0.1:9/search", 5);
        assert!(geocoder.forward_geocode("   ").is_empty());
    }

    #[test]
    fn network_error_yields_empty_results() {
        // Nothing listens on the discard port.
        let geocoder = NominatimGeocoder::new("http://127.0.0.1:9/search", 5);
        assert!(geocoder.forward_geocode("Bangkok").is_empty());
    }
}
