//! Reading zipped shapefiles.
//!
//! An uploaded archive may hold one or several shapefile sets. Each set is a `.shp` geometry file
//! with its `.shx` index and `.dbf` attribute table; all three must be present. `.prj` and `.cpg`
//! files are ignored.

use log::{debug, warn};
use shapefile::dbase::FieldValue as DbaseFieldValue;
use shapefile::{Point, PointM, PointZ, PolygonRing, Shape, ShapeReader};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use thiserror::Error;
use zip::ZipArchive;

use crate::geometry::{Geometry, Ring};
use crate::projection::GeoPos;
use crate::properties::{Properties, PropertyValue};

/// Errors that make an uploaded archive unusable. Any of them rejects the whole upload.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The bytes are not a readable zip archive.
    #[error("Invalid archive: not a readable zip file")]
    Zip(#[from] zip::result::ZipError),

    /// An archive entry could not be read.
    #[error("Invalid archive: unable to read archive contents")]
    Io(#[from] std::io::Error),

    /// The archive holds no `.shp` file.
    #[error("Invalid archive: no shapefile (.shp) found")]
    NoShapefile,

    /// A shapefile set lacks a mandatory component.
    #[error("Invalid archive: `{name}` is missing required component files: {missing}")]
    MissingComponents {
        /// The shapefile set.
        name: String,
        /// Comma separated list of missing extensions.
        missing: String,
    },

    /// An entry is larger than the decoder accepts.
    #[error("Invalid archive: `{name}` is larger than {limit} bytes")]
    EntryTooLarge {
        /// The archive entry.
        name: String,
        /// The accepted size in bytes.
        limit: u64,
    },

    /// The geometry or attribute files could not be decoded.
    #[error("Invalid archive: unable to decode `{name}`: {message}")]
    Decode {
        /// The shapefile set.
        name: String,
        /// The reader's error message.
        message: String,
    },
}

/// A feature as decoded from a shapefile record.
#[derive(Clone, Debug, PartialEq)]
pub struct RawFeature {
    /// `None` for null shapes.
    pub geometry: Option<Geometry>,

    /// The record's attribute table row.
    pub properties: Properties,
}

/// All features of one shapefile set, in record order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawCollection {
    /// The file name of the `.shp` without extension.
    pub source_name: Option<String>,

    /// The decoded features.
    pub features: Vec<RawFeature>,
}

/// The result of a decode: a lone collection or one per shapefile set.
#[derive(Clone, Debug, PartialEq)]
pub enum Decoded {
    /// The archive held exactly one shapefile set.
    Single(RawCollection),

    /// The archive held several shapefile sets.
    Many(Vec<RawCollection>),
}

impl From<Decoded> for Vec<RawCollection> {
    fn from(decoded: Decoded) -> Self {
        match decoded {
            Decoded::Single(collection) => vec![collection],
            Decoded::Many(collections) => collections,
        }
    }
}

/// Something that turns archive bytes into shapefile collections.
pub trait ArchiveDecoder {
    /// Decodes the archive.
    fn decode(&self, bytes: &[u8]) -> Result<Decoded, ArchiveError>;
}

/// Upper bound on the decompressed size of a single shapefile component.
pub const MAX_ENTRY_BYTES: u64 = 512 * 1024 * 1024;

/// Decodes `bytes` and always returns a list of collections.
pub fn decode_archive(
    decoder: &dyn ArchiveDecoder,
    bytes: &[u8],
) -> Result<Vec<RawCollection>, ArchiveError> {
    decoder.decode(bytes).map(Vec::from)
}

/// Decodes zip archives with the `zip` and `shapefile` crates.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShapefileZipDecoder;

#[derive(Default)]
struct ShapefileSet {
    shp: Option<Vec<u8>>,
    shx: Option<Vec<u8>>,
    dbf: Option<Vec<u8>>,
}

impl ShapefileSet {
    fn missing(&self) -> Vec<&'static str> {
        [(".shp", &self.shp), (".shx", &self.shx), (".dbf", &self.dbf)]
            .into_iter()
            .filter(|(_, component)| component.is_none())
            .map(|(ext, _)| ext)
            .collect()
    }
}

impl ArchiveDecoder for ShapefileZipDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Decoded, ArchiveError> {
        let sets = read_components(bytes)?;

        let mut collections = Vec::new();
        for (base, set) in sets {
            if set.shp.is_none() {
                warn!("Ignoring `{}` without a .shp file", base);
                continue;
            }
            let missing = set.missing();
            if !missing.is_empty() {
                return Err(ArchiveError::MissingComponents {
                    name: source_name(&base),
                    missing: missing.join(", "),
                });
            }
            collections.push(read_set(&base, set)?);
        }

        match collections.len() {
            0 => Err(ArchiveError::NoShapefile),
            1 => Ok(Decoded::Single(collections.remove(0))),
            _ => Ok(Decoded::Many(collections)),
        }
    }
}

/// Groups the archive's shapefile components by their path without extension.
fn read_components(bytes: &[u8]) -> Result<BTreeMap<String, ShapefileSet>, ArchiveError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut sets: BTreeMap<String, ShapefileSet> = BTreeMap::new();

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }

        let name = file.name().to_string();
        if name.starts_with("__MACOSX/") {
            continue;
        }
        let Some((base, ext)) = name.rsplit_once('.') else {
            continue;
        };

        let ext = ext.to_ascii_lowercase();
        if !matches!(ext.as_str(), "shp" | "shx" | "dbf") {
            continue;
        }

        let contents = read_entry(&mut file, &name, MAX_ENTRY_BYTES)?;
        debug!("Read `{}` ({} bytes) from archive", name, contents.len());

        let set = sets.entry(base.to_string()).or_default();
        match ext.as_str() {
            "shp" => set.shp = Some(contents),
            "shx" => set.shx = Some(contents),
            _ => set.dbf = Some(contents),
        }
    }

    Ok(sets)
}

/// Reads an entry without trusting the size declared in the archive headers.
fn read_entry(reader: &mut impl Read, name: &str, limit: u64) -> Result<Vec<u8>, ArchiveError> {
    let mut contents = Vec::new();
    reader.take(limit + 1).read_to_end(&mut contents)?;
    if contents.len() as u64 > limit {
        return Err(ArchiveError::EntryTooLarge {
            name: name.to_string(),
            limit,
        });
    }
    Ok(contents)
}

/// The file name part of an archive path.
fn source_name(base: &str) -> String {
    base.rsplit('/').next().unwrap_or(base).to_string()
}

fn read_set(base: &str, set: ShapefileSet) -> Result<RawCollection, ArchiveError> {
    let name = source_name(base);
    let decode_error = |message: String| ArchiveError::Decode {
        name: name.clone(),
        message,
    };

    let (Some(shp), Some(shx), Some(dbf)) = (set.shp, set.shx, set.dbf) else {
        return Err(ArchiveError::MissingComponents {
            name: name.clone(),
            missing: ".shp, .shx, .dbf".to_string(),
        });
    };

    let shape_reader = ShapeReader::with_shx(Cursor::new(shp), Cursor::new(shx))
        .map_err(|e| decode_error(e.to_string()))?;
    let dbase_reader =
        shapefile::dbase::Reader::new(Cursor::new(dbf)).map_err(|e| decode_error(e.to_string()))?;
    let mut reader = shapefile::Reader::new(shape_reader, dbase_reader);

    let mut features = Vec::new();
    for result in reader.iter_shapes_and_records() {
        let (shape, record) = result.map_err(|e| decode_error(e.to_string()))?;
        let geometry = convert_shape(shape).map_err(decode_error)?;

        let properties = record
            .into_iter()
            .map(|(field, value)| (field, convert_dbase_value(value)))
            .collect();

        features.push(RawFeature {
            geometry,
            properties,
        });
    }

    debug!("Decoded {} features from `{}`", features.len(), name);
    Ok(RawCollection {
        source_name: Some(name),
        features,
    })
}

trait ToGeoPos {
    fn geo_pos(&self) -> GeoPos;
}

impl ToGeoPos for Point {
    fn geo_pos(&self) -> GeoPos {
        GeoPos {
            lon: self.x,
            lat: self.y,
        }
    }
}

impl ToGeoPos for PointM {
    fn geo_pos(&self) -> GeoPos {
        GeoPos {
            lon: self.x,
            lat: self.y,
        }
    }
}

impl ToGeoPos for PointZ {
    fn geo_pos(&self) -> GeoPos {
        GeoPos {
            lon: self.x,
            lat: self.y,
        }
    }
}

fn to_positions<P: ToGeoPos>(points: &[P]) -> Vec<GeoPos> {
    points.iter().map(ToGeoPos::geo_pos).collect()
}

/// Regroups shapefile rings into polygons. Every outer ring starts a polygon and the inner rings
/// that follow it are its holes.
fn polygon_geometry<P: ToGeoPos>(rings: &[PolygonRing<P>]) -> Option<Geometry> {
    let mut polygons: Vec<Vec<Ring>> = Vec::new();
    for ring in rings {
        match ring {
            PolygonRing::Outer(points) => polygons.push(vec![to_positions(points)]),
            PolygonRing::Inner(points) => match polygons.last_mut() {
                Some(polygon) => polygon.push(to_positions(points)),
                None => polygons.push(vec![to_positions(points)]),
            },
        }
    }

    match polygons.len() {
        0 => None,
        1 => polygons.pop().map(Geometry::Polygon),
        _ => Some(Geometry::MultiPolygon(polygons)),
    }
}

fn line_geometry<P: ToGeoPos>(parts: &[Vec<P>]) -> Option<Geometry> {
    let mut lines: Vec<Vec<GeoPos>> = parts.iter().map(|part| to_positions(part)).collect();
    match lines.len() {
        0 => None,
        1 => lines.pop().map(Geometry::LineString),
        _ => Some(Geometry::MultiLineString(lines)),
    }
}

/// Converts a shapefile shape. Z and M ordinates are dropped.
fn convert_shape(shape: Shape) -> Result<Option<Geometry>, String> {
    Ok(match shape {
        Shape::NullShape => None,
        Shape::Point(point) => Some(Geometry::Point(point.geo_pos())),
        Shape::PointM(point) => Some(Geometry::Point(point.geo_pos())),
        Shape::PointZ(point) => Some(Geometry::Point(point.geo_pos())),
        Shape::Multipoint(multipoint) => {
            Some(Geometry::MultiPoint(to_positions(multipoint.points())))
        }
        Shape::MultipointM(multipoint) => {
            Some(Geometry::MultiPoint(to_positions(multipoint.points())))
        }
        Shape::MultipointZ(multipoint) => {
            Some(Geometry::MultiPoint(to_positions(multipoint.points())))
        }
        Shape::Polyline(polyline) => line_geometry(polyline.parts()),
        Shape::PolylineM(polyline) => line_geometry(polyline.parts()),
        Shape::PolylineZ(polyline) => line_geometry(polyline.parts()),
        Shape::Polygon(polygon) => polygon_geometry(polygon.rings()),
        Shape::PolygonM(polygon) => polygon_geometry(polygon.rings()),
        Shape::PolygonZ(polygon) => polygon_geometry(polygon.rings()),
        Shape::Multipatch(_) => {
            return Err("multipatch geometry is not supported".to_string());
        }
    })
}

/// Converts a dBase field value to an attribute value.
fn convert_dbase_value(value: DbaseFieldValue) -> PropertyValue {
    match value {
        DbaseFieldValue::Character(Some(s)) => PropertyValue::Text(s),
        DbaseFieldValue::Numeric(Some(n)) => PropertyValue::Number(n),
        DbaseFieldValue::Logical(Some(b)) => PropertyValue::Bool(b),
        DbaseFieldValue::Date(Some(date)) => PropertyValue::Text(format!(
            "{:04}-{:02}-{:02}",
            date.year(),
            date.month(),
            date.day()
        )),
        DbaseFieldValue::Float(Some(f)) => PropertyValue::Number(f as f64),
        DbaseFieldValue::Integer(i) => PropertyValue::Number(i as f64),
        DbaseFieldValue::Currency(c) => PropertyValue::Number(c),
        DbaseFieldValue::DateTime(dt) => PropertyValue::Text(format!(
            "{:04}-{:02}-{:02}",
            dt.date().year(),
            dt.date().month(),
            dt.date().day()
        )),
        DbaseFieldValue::Double(d) => PropertyValue::Number(d),
        DbaseFieldValue::Memo(s) => PropertyValue::Text(s),
        _ => PropertyValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ShapefileFixture, square, zip_entries, zip_entries_stored};

    #[test]
    fn single_set_decodes_to_single_collection() {
        let fixture = ShapefileFixture::polygons(
            "NAME",
            &[(vec![square(0.0, 0.0, 2.0)], "Alpha"), (vec![square(5.0, 5.0, 1.0)], "Beta")],
        );
        let bytes = zip_entries(&fixture.entries("data/provinces"));

        let decoded = ShapefileZipDecoder.decode(&bytes).unwrap();
        let Decoded::Single(collection) = decoded else {
            panic!("expected a single collection");
        };
        assert_eq!(collection.source_name.as_deref(), Some("provinces"));
        assert_eq!(collection.features.len(), 2);

        let first = &collection.features[0];
        assert_eq!(
            first.properties.get("NAME"),
            Some(&PropertyValue::Text("Alpha".to_string()))
        );
        let Some(Geometry::Polygon(rings)) = &first.geometry else {
            panic!("expected a polygon, got {:?}", first.geometry);
        };
        assert_eq!(rings.len(), 1);
        assert_eq!(rings[0].first(), Some(&GeoPos::from((0.0, 0.0))));
    }

    #[test]
    fn several_sets_decode_to_many_collections() {
        let a = ShapefileFixture::polygons("NAME", &[(vec![square(0.0, 0.0, 1.0)], "A")]);
        let b = ShapefileFixture::polygons("NAME", &[(vec![square(3.0, 3.0, 1.0)], "B")]);
        let mut entries = a.entries("a");
        entries.extend(b.entries("b"));
        entries.push(("b.prj".to_string(), b"GEOGCS[\"WGS 84\"]".to_vec()));

        let collections = decode_archive(&ShapefileZipDecoder, &zip_entries(&entries)).unwrap();
        assert_eq!(collections.len(), 2);
        assert_eq!(collections[0].source_name.as_deref(), Some("a"));
        assert_eq!(collections[1].source_name.as_deref(), Some("b"));
    }

    #[test]
    fn separate_outer_rings_become_multipolygon() {
        let fixture = ShapefileFixture::polygons(
            "NAME",
            &[(vec![square(0.0, 0.0, 1.0), square(10.0, 10.0, 1.0)], "Islands")],
        );
        let collections =
            decode_archive(&ShapefileZipDecoder, &zip_entries(&fixture.entries("islands")))
                .unwrap();
        let geometry = collections[0].features[0].geometry.as_ref().unwrap();
        assert_eq!(geometry.kind(), "MultiPolygon");
        assert_eq!(geometry.polygons().len(), 2);
    }

    #[test]
    fn missing_dbf_is_rejected() {
        let fixture = ShapefileFixture::polygons("NAME", &[(vec![square(0.0, 0.0, 1.0)], "A")]);
        let entries: Vec<_> = fixture
            .entries("roads")
            .into_iter()
            .filter(|(name, _)| !name.ends_with(".dbf"))
            .collect();

        let error = decode_archive(&ShapefileZipDecoder, &zip_entries(&entries)).unwrap_err();
        match error {
            ArchiveError::MissingComponents { name, missing } => {
                assert_eq!(name, "roads");
                assert_eq!(missing, ".dbf");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn archive_without_shapefile_is_rejected() {
        let bytes = zip_entries(&[("readme.txt".to_string(), b"hello".to_vec())]);
        assert!(matches!(
            decode_archive(&ShapefileZipDecoder, &bytes),
            Err(ArchiveError::NoShapefile)
        ));
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(matches!(
            decode_archive(&ShapefileZipDecoder, b"definitely not a zip"),
            Err(ArchiveError::Zip(_))
        ));
    }

    #[test]
    fn corrupt_shp_is_a_decode_error() {
        let fixture = ShapefileFixture::polygons("NAME", &[(vec![square(0.0, 0.0, 1.0)], "A")]);
        let entries: Vec<_> = fixture
            .entries("broken")
            .into_iter()
            .map(|(name, bytes)| {
                if name.ends_with(".shp") {
                    (name, bytes[..20].to_vec())
                } else {
                    (name, bytes)
                }
            })
            .collect();
        assert!(matches!(
            decode_archive(&ShapefileZipDecoder, &zip_entries(&entries)),
            Err(ArchiveError::Decode { .. })
        ));
    }

    #[test]
    fn macos_resource_forks_are_ignored() {
        let fixture = ShapefileFixture::polygons("NAME", &[(vec![square(0.0, 0.0, 1.0)], "A")]);
        let mut entries = fixture.entries("parks");
        entries.push(("__MACOSX/._parks.shp".to_string(), vec![0, 1, 2, 3]));
        let collections =
            decode_archive(&ShapefileZipDecoder, &zip_entries(&entries)).unwrap();
        assert_eq!(collections.len(), 1);
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let mut reader = Cursor::new(vec![7_u8; 64]);
        match read_entry(&mut reader, "big.shp", 16) {
            Err(ArchiveError::EntryTooLarge { name, limit }) => {
                assert_eq!(name, "big.shp");
                assert_eq!(limit, 16);
            }
            other => panic!("unexpected result {other:?}"),
        }

        let mut reader = Cursor::new(vec![7_u8; 16]);
        assert_eq!(read_entry(&mut reader, "ok.shp", 16).unwrap().len(), 16);
    }

    #[test]
    fn inflated_size_header_does_not_preallocate() {
        let fixture = ShapefileFixture::polygons("NAME", &[(vec![square(0.0, 0.0, 1.0)], "A")]);
        let mut bytes = zip_entries_stored(&fixture.entries("huge"));

        // Claim an uncompressed size just under 4 GiB in every central directory record.
        let mut patched = 0;
        let mut i = 0;
        while i + 28 <= bytes.len() {
            if bytes[i..i + 4] == [0x50, 0x4b, 0x01, 0x02] {
                bytes[i + 24..i + 28].copy_from_slice(&0xFFFF_FFF0_u32.to_le_bytes());
                patched += 1;
                i += 46;
            } else {
                i += 1;
            }
        }
        assert_eq!(patched, 3);

        // Either outcome is fine as long as the declared size is never allocated up front.
        if let Ok(collections) = decode_archive(&ShapefileZipDecoder, &bytes) {
            assert_eq!(collections[0].features.len(), 1);
        }
    }
}
