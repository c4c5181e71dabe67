//! Origin splicing: artificial segments connecting the origin points to
//! the nearest eligible real segments.
//!
//! Nearest-edge selection, projection and id generation happen inside the
//! stored `temporal.get_artificial_segments` function; this module consumes
//! its output. Each split produces two fragments carrying the superseded
//! segment id (`old_id`), plus zero-length attachment segments binding the
//! connector node to the graph.

use std::collections::HashSet;

use tokio_postgres::GenericClient;
use tracing::debug;

use crate::error::Error;
use crate::network::segments::{parse_linestring_json, Segment, SegmentClass, SegmentTable};

/// Splice point of one origin: the connector node id to start routing
/// from, and the origin's short cell indices at the matrix resolution and
/// at H3_3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OriginConnector {
    /// 1-based row id of the origin in the temporary point table
    pub point_id: i32,
    pub node_id: i64,
    pub cell: i64,
    pub h3_3: i32,
}

pub struct SpliceResult {
    pub segments: SegmentTable,
    pub connectors: Vec<OriginConnector>,
    /// real segment ids superseded by artificial splits
    pub discard_ids: HashSet<i64>,
}

/// Fetches the artificial segments for all origins in the temporary point
/// table. Raises [`Error::DisconnectedOrigin`] when no origin could be
/// connected to an eligible segment.
pub async fn artificial_segments(
    client: &impl GenericClient,
    origin_table: &str,
    num_points: i64,
    allowed_classes: &[SegmentClass],
) -> Result<SpliceResult, Error> {
    let classes_csv = allowed_classes
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(",");

    let sql = format!(
        "SELECT
            point_id,
            old_id,
            id, length_m, length_3857, class_, impedance_slope,
            impedance_slope_reverse, impedance_surface,
            CAST(coordinates_3857 AS TEXT) AS coordinates_3857,
            source, target, tags, h3_3, h3_6, point_h3_10, point_h3_3
        FROM temporal.get_artificial_segments(
            '{origin_table}',
            $1,
            $2
        )"
    );
    let rows = client.query(&sql, &[&num_points, &classes_csv]).await?;

    let mut result = SpliceResult {
        segments: SegmentTable::new(),
        connectors: Vec::new(),
        discard_ids: HashSet::new(),
    };

    for row in rows {
        let point_id: Option<i32> = row.get("point_id");
        let source: i64 = row.get("source");

        if let Some(point_id) = point_id {
            let cell: Option<i64> = row.get("point_h3_10");
            let h3_3: Option<i32> = row.get("point_h3_3");
            if let (Some(cell), Some(h3_3)) = (cell, h3_3) {
                result.connectors.push(OriginConnector {
                    point_id,
                    node_id: source,
                    cell,
                    h3_3,
                });
            }
            if let Some(old_id) = row.get::<_, Option<i64>>("old_id") {
                result.discard_ids.insert(old_id);
            }
        }

        let class: String = row.get("class_");
        let coordinates: String = row.get("coordinates_3857");
        result.segments.push(Segment {
            id: row.get("id"),
            source,
            target: row.get("target"),
            length_m: row.get("length_m"),
            length_3857: row.get("length_3857"),
            class: SegmentClass::from_token(&class),
            impedance_slope: row
                .get::<_, Option<f64>>("impedance_slope")
                .unwrap_or(f64::NAN),
            impedance_slope_reverse: row
                .get::<_, Option<f64>>("impedance_slope_reverse")
                .unwrap_or(f64::NAN),
            impedance_surface: row
                .get::<_, Option<f32>>("impedance_surface")
                .unwrap_or(f32::NAN),
            tags: row.get("tags"),
            h3_3: row.get("h3_3"),
            h3_6: row.get("h3_6"),
            geometry: parse_linestring_json(&coordinates)?,
        });
    }

    if result.connectors.is_empty() {
        return Err(Error::DisconnectedOrigin);
    }
    debug!(
        "spliced {} origins into {} artificial segments ({} superseded)",
        result.connectors.len(),
        result.segments.len(),
        result.discard_ids.len()
    );
    Ok(result)
}
