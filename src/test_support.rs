//! Builders for shapefile archives used by the tests.

use shapefile::dbase::{FieldName, FieldValue, Record, TableWriterBuilder};
use shapefile::{Point, Polygon, PolygonRing};
use std::io::{Cursor, Write};
use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

use crate::geometry::Ring;
use crate::projection::GeoPos;

const FIELD_LENGTH: u8 = 32;

/// A clockwise closed square with its south-west corner at `(x, y)`. Clockwise rings are outer
/// rings in shapefiles.
pub fn square(x: f64, y: f64, size: f64) -> Ring {
    [
        (x, y),
        (x, y + size),
        (x + size, y + size),
        (x + size, y),
        (x, y),
    ]
    .into_iter()
    .map(GeoPos::from)
    .collect()
}

/// The `.shp`, `.shx` and `.dbf` bytes of a polygon shapefile with a single text attribute.
pub struct ShapefileFixture {
    shp: Vec<u8>,
    shx: Vec<u8>,
    dbf: Vec<u8>,
}

impl ShapefileFixture {
    /// One record per entry: the outer rings of the polygon and the value of `field`.
    pub fn polygons(field: &str, records: &[(Vec<Ring>, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.shp");
        let field_name = FieldName::try_from(field).unwrap();

        {
            let table = TableWriterBuilder::new().add_character_field(field_name, FIELD_LENGTH);
            let mut writer = shapefile::Writer::from_path(&path, table).unwrap();
            for (rings, value) in records {
                let polygon = Polygon::with_rings(
                    rings
                        .iter()
                        .map(|ring| {
                            PolygonRing::Outer(
                                ring.iter().map(|pos| Point::new(pos.lon, pos.lat)).collect(),
                            )
                        })
                        .collect(),
                );
                let mut record = Record::default();
                record.insert(field.to_string(), FieldValue::Character(Some(value.to_string())));
                writer.write_shape_and_record(&polygon, &record).unwrap();
            }
        }

        Self {
            shp: std::fs::read(&path).unwrap(),
            shx: std::fs::read(path.with_extension("shx")).unwrap(),
            dbf: std::fs::read(path.with_extension("dbf")).unwrap(),
        }
    }

    /// Archive entries named `{base}.shp`, `{base}.shx` and `{base}.dbf`.
    pub fn entries(&self, base: &str) -> Vec<(String, Vec<u8>)> {
        vec![
            (format!("{base}.shp"), self.shp.clone()),
            (format!("{base}.shx"), self.shx.clone()),
            (format!("{base}.dbf"), self.dbf.clone()),
        ]
    }
}

fn zip_with(entries: &[(String, Vec<u8>)], options: SimpleFileOptions) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, bytes) in entries {
        writer.start_file(name.as_str(), options).unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Zips the named entries into an in-memory archive.
pub fn zip_entries(entries: &[(String, Vec<u8>)]) -> Vec<u8> {
    zip_with(entries, SimpleFileOptions::default())
}

/// Like [`zip_entries`] but without compression, so header fields sit at fixed offsets.
pub fn zip_entries_stored(entries: &[(String, Vec<u8>)]) -> Vec<u8> {
    zip_with(
        entries,
        SimpleFileOptions::default().compression_method(CompressionMethod::Stored),
    )
}
