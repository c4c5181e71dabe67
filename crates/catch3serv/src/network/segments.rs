//! Columnar segment storage: the in-memory struct-of-arrays form of the
//! street network edge table and its parquet serialisation.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Float32Array, Float64Array, Float64Builder, Int32Array, Int64Array,
    ListArray, ListBuilder, StringArray,
};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use crate::error::Error;

/// Street segment class tag.
///
/// Tokens are normalised on ingest (case and separator insensitive), so the
/// camel-case spellings used upstream and snake_case variants compare equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SegmentClass {
    Motorway,
    Trunk,
    Primary,
    Secondary,
    Tertiary,
    Residential,
    LivingStreet,
    Unclassified,
    ParkingAisle,
    Driveway,
    Pedestrian,
    Footway,
    Steps,
    Track,
    Bridleway,
    Cycleway,
    Unknown,
}

impl SegmentClass {
    pub fn from_token(token: &str) -> Self {
        let normalised: String = token
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalised.as_str() {
            "motorway" => Self::Motorway,
            "trunk" => Self::Trunk,
            "primary" => Self::Primary,
            "secondary" => Self::Secondary,
            "tertiary" => Self::Tertiary,
            "residential" => Self::Residential,
            "livingstreet" => Self::LivingStreet,
            "unclassified" => Self::Unclassified,
            "parkingaisle" => Self::ParkingAisle,
            "driveway" => Self::Driveway,
            "pedestrian" => Self::Pedestrian,
            "footway" => Self::Footway,
            "steps" => Self::Steps,
            "track" => Self::Track,
            "bridleway" => Self::Bridleway,
            "cycleway" => Self::Cycleway,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Motorway => "motorway",
            Self::Trunk => "trunk",
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Tertiary => "tertiary",
            Self::Residential => "residential",
            Self::LivingStreet => "livingStreet",
            Self::Unclassified => "unclassified",
            Self::ParkingAisle => "parkingAisle",
            Self::Driveway => "driveway",
            Self::Pedestrian => "pedestrian",
            Self::Footway => "footway",
            Self::Steps => "steps",
            Self::Track => "track",
            Self::Bridleway => "bridleway",
            Self::Cycleway => "cycleway",
            Self::Unknown => "unknown",
        }
    }
}

/// One segment row. Impedance columns use NaN where the upstream table
/// holds NULL; they are zero-filled during sub-network assembly.
#[derive(Clone, Debug)]
pub struct Segment {
    pub id: i64,
    pub source: i64,
    pub target: i64,
    pub length_m: f64,
    pub length_3857: f64,
    pub class: SegmentClass,
    pub impedance_slope: f64,
    pub impedance_slope_reverse: f64,
    pub impedance_surface: f32,
    pub tags: Option<String>,
    pub h3_3: i32,
    pub h3_6: i32,
    /// polyline in EPSG:3857
    pub geometry: Vec<[f64; 2]>,
}

/// Immutable-after-build columnar table of segments, one per network shard.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentTable {
    pub id: Vec<i64>,
    pub source: Vec<i64>,
    pub target: Vec<i64>,
    pub length_m: Vec<f64>,
    pub length_3857: Vec<f64>,
    pub class: Vec<SegmentClass>,
    pub impedance_slope: Vec<f64>,
    pub impedance_slope_reverse: Vec<f64>,
    pub impedance_surface: Vec<f32>,
    pub tags: Vec<Option<String>>,
    pub h3_3: Vec<i32>,
    pub h3_6: Vec<i32>,
    geom_offsets: Vec<u32>,
    geom_points: Vec<[f64; 2]>,
}

impl Default for SegmentTable {
    fn default() -> Self {
        Self {
            id: Vec::new(),
            source: Vec::new(),
            target: Vec::new(),
            length_m: Vec::new(),
            length_3857: Vec::new(),
            class: Vec::new(),
            impedance_slope: Vec::new(),
            impedance_slope_reverse: Vec::new(),
            impedance_surface: Vec::new(),
            tags: Vec::new(),
            h3_3: Vec::new(),
            h3_6: Vec::new(),
            geom_offsets: vec![0],
            geom_points: Vec::new(),
        }
    }
}

impl SegmentTable {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }

    pub fn push(&mut self, segment: Segment) {
        self.id.push(segment.id);
        self.source.push(segment.source);
        self.target.push(segment.target);
        self.length_m.push(segment.length_m);
        self.length_3857.push(segment.length_3857);
        self.class.push(segment.class);
        self.impedance_slope.push(segment.impedance_slope);
        self.impedance_slope_reverse
            .push(segment.impedance_slope_reverse);
        self.impedance_surface.push(segment.impedance_surface);
        self.tags.push(segment.tags);
        self.h3_3.push(segment.h3_3);
        self.h3_6.push(segment.h3_6);
        self.geom_points.extend_from_slice(&segment.geometry);
        self.geom_offsets.push(self.geom_points.len() as u32);
    }

    pub fn geometry(&self, row: usize) -> &[[f64; 2]] {
        let start = self.geom_offsets[row] as usize;
        let end = self.geom_offsets[row + 1] as usize;
        &self.geom_points[start..end]
    }

    pub fn to_record_batch(&self) -> Result<RecordBatch, Error> {
        let mut coordinates = ListBuilder::new(ListBuilder::new(Float64Builder::new()));
        for row in 0..self.len() {
            for point in self.geometry(row) {
                coordinates.values().values().append_value(point[0]);
                coordinates.values().values().append_value(point[1]);
                coordinates.values().append(true);
            }
            coordinates.append(true);
        }

        let class: StringArray = self.class.iter().map(|c| Some(c.as_str())).collect();
        let tags: StringArray = self.tags.iter().map(|t| t.as_deref()).collect();

        let batch = RecordBatch::try_from_iter(vec![
            ("id", Arc::new(Int64Array::from(self.id.clone())) as ArrayRef),
            (
                "length_m",
                Arc::new(Float64Array::from(self.length_m.clone())) as ArrayRef,
            ),
            (
                "length_3857",
                Arc::new(Float64Array::from(self.length_3857.clone())) as ArrayRef,
            ),
            ("class_", Arc::new(class) as ArrayRef),
            (
                "impedance_slope",
                Arc::new(Float64Array::from(self.impedance_slope.clone())) as ArrayRef,
            ),
            (
                "impedance_slope_reverse",
                Arc::new(Float64Array::from(self.impedance_slope_reverse.clone())) as ArrayRef,
            ),
            (
                "impedance_surface",
                Arc::new(Float32Array::from(self.impedance_surface.clone())) as ArrayRef,
            ),
            (
                "coordinates_3857",
                Arc::new(coordinates.finish()) as ArrayRef,
            ),
            (
                "source",
                Arc::new(Int64Array::from(self.source.clone())) as ArrayRef,
            ),
            (
                "target",
                Arc::new(Int64Array::from(self.target.clone())) as ArrayRef,
            ),
            ("tags", Arc::new(tags) as ArrayRef),
            (
                "h3_3",
                Arc::new(Int32Array::from(self.h3_3.clone())) as ArrayRef,
            ),
            (
                "h3_6",
                Arc::new(Int32Array::from(self.h3_6.clone())) as ArrayRef,
            ),
        ])?;
        Ok(batch)
    }

    pub fn append_record_batch(&mut self, batch: &RecordBatch) -> Result<(), Error> {
        let id = typed_column::<Int64Array>(batch, "id")?;
        let length_m = typed_column::<Float64Array>(batch, "length_m")?;
        let length_3857 = typed_column::<Float64Array>(batch, "length_3857")?;
        let class = typed_column::<StringArray>(batch, "class_")?;
        let impedance_slope = typed_column::<Float64Array>(batch, "impedance_slope")?;
        let impedance_slope_reverse =
            typed_column::<Float64Array>(batch, "impedance_slope_reverse")?;
        let impedance_surface = typed_column::<Float32Array>(batch, "impedance_surface")?;
        let coordinates = typed_column::<ListArray>(batch, "coordinates_3857")?;
        let source = typed_column::<Int64Array>(batch, "source")?;
        let target = typed_column::<Int64Array>(batch, "target")?;
        let tags = typed_column::<StringArray>(batch, "tags")?;
        let h3_3 = typed_column::<Int32Array>(batch, "h3_3")?;
        let h3_6 = typed_column::<Int32Array>(batch, "h3_6")?;

        for row in 0..batch.num_rows() {
            let points_ref = coordinates.value(row);
            let points = points_ref
                .as_any()
                .downcast_ref::<ListArray>()
                .ok_or(Error::MissingColumn("coordinates_3857"))?;
            let mut geometry = Vec::with_capacity(points.len());
            for point_idx in 0..points.len() {
                let pair_ref = points.value(point_idx);
                let pair = pair_ref
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .ok_or(Error::MissingColumn("coordinates_3857"))?;
                if pair.len() < 2 {
                    return Err(Error::InvalidGeometry(
                        "coordinate pair with fewer than two values".to_string(),
                    ));
                }
                geometry.push([pair.value(0), pair.value(1)]);
            }

            self.push(Segment {
                id: id.value(row),
                source: source.value(row),
                target: target.value(row),
                length_m: length_m.value(row),
                length_3857: length_3857.value(row),
                class: SegmentClass::from_token(class.value(row)),
                impedance_slope: null_as_nan(impedance_slope, row),
                impedance_slope_reverse: null_as_nan(impedance_slope_reverse, row),
                impedance_surface: if impedance_surface.is_null(row) {
                    f32::NAN
                } else {
                    impedance_surface.value(row)
                },
                tags: if tags.is_null(row) {
                    None
                } else {
                    Some(tags.value(row).to_string())
                },
                h3_3: h3_3.value(row),
                h3_6: h3_6.value(row),
                geometry,
            });
        }
        Ok(())
    }

    pub fn write_parquet_file(&self, path: &Path) -> Result<(), Error> {
        let batch = self.to_record_batch()?;
        let file = File::create(path)?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
        writer.write(&batch)?;
        writer.close()?;
        Ok(())
    }

    pub fn read_parquet_file(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        let mut table = Self::new();
        for batch in reader {
            table.append_record_batch(&batch?)?;
        }
        Ok(table)
    }
}

fn typed_column<'a, T: 'static>(batch: &'a RecordBatch, name: &'static str) -> Result<&'a T, Error> {
    batch
        .column_by_name(name)
        .ok_or(Error::MissingColumn(name))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or(Error::MissingColumn(name))
}

fn null_as_nan(array: &Float64Array, row: usize) -> f64 {
    if array.is_null(row) {
        f64::NAN
    } else {
        array.value(row)
    }
}

/// Parses the JSON text form of the `coordinates_3857` column, e.g.
/// `[[1492232.6,6894701.4],[1492250.1,6894732.9]]`.
pub fn parse_linestring_json(text: &str) -> Result<Vec<[f64; 2]>, Error> {
    serde_json::from_str(text).map_err(|e| Error::InvalidGeometry(e.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn segment(id: i64, source: i64, target: i64, class: SegmentClass) -> Segment {
        Segment {
            id,
            source,
            target,
            length_m: 100.0,
            length_3857: 160.0,
            class,
            impedance_slope: 0.1,
            impedance_slope_reverse: 0.2,
            impedance_surface: 0.05,
            tags: None,
            h3_3: 8077,
            h3_6: 4010,
            geometry: vec![[0.0, 0.0], [160.0, 0.0]],
        }
    }

    pub(crate) fn small_table() -> SegmentTable {
        let mut table = SegmentTable::new();
        table.push(segment(1, 10, 20, SegmentClass::Residential));
        table.push(Segment {
            tags: Some("{\"surface\":\"asphalt\"}".to_string()),
            impedance_slope: f64::NAN,
            geometry: vec![[160.0, 0.0], [200.0, 30.0], [260.0, 30.0]],
            ..segment(2, 20, 30, SegmentClass::Footway)
        });
        table
    }

    #[test]
    fn class_tokens_are_normalised() {
        assert_eq!(
            SegmentClass::from_token("livingStreet"),
            SegmentClass::LivingStreet
        );
        assert_eq!(
            SegmentClass::from_token("living_street"),
            SegmentClass::LivingStreet
        );
        assert_eq!(
            SegmentClass::from_token("PARKING_AISLE"),
            SegmentClass::ParkingAisle
        );
        assert_eq!(SegmentClass::from_token("highway?"), SegmentClass::Unknown);
    }

    #[test]
    fn geometry_offsets_address_the_flat_point_array() {
        let table = small_table();
        assert_eq!(table.geometry(0), &[[0.0, 0.0], [160.0, 0.0]]);
        assert_eq!(table.geometry(1).len(), 3);
    }

    #[test]
    fn record_batch_roundtrip_preserves_rows() {
        let table = small_table();
        let batch = table.to_record_batch().unwrap();
        assert_eq!(batch.num_rows(), 2);

        let mut restored = SegmentTable::new();
        restored.append_record_batch(&batch).unwrap();
        assert_eq!(restored.id, table.id);
        assert_eq!(restored.class, table.class);
        assert_eq!(restored.tags, table.tags);
        assert_eq!(restored.geometry(1), table.geometry(1));
        // NaN impedance survives the roundtrip as NaN
        assert!(restored.impedance_slope[1].is_nan());
    }

    #[test]
    fn parquet_roundtrip_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("8077.parquet");

        let table = small_table();
        table.write_parquet_file(&path).unwrap();
        let restored = SegmentTable::read_parquet_file(&path).unwrap();

        assert_eq!(restored.len(), table.len());
        assert_eq!(restored.id, table.id);
        assert_eq!(restored.h3_6, table.h3_6);
        assert_eq!(restored.geometry(0), table.geometry(0));
    }

    #[test]
    fn linestring_json_parses() {
        let points =
            parse_linestring_json("[[1492232.6,6894701.4],[1492250.1,6894732.9]]").unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0], [1492232.6, 6894701.4]);
        assert!(parse_linestring_json("not json").is_err());
    }
}
