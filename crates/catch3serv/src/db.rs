//! The consumed SQL surface: geofence cell enumeration, the segment table,
//! envelope cells and the temporary origin point tables.
//!
//! All coordinate literals are passed as `(longitude, latitude)` —
//! `ST_MakePoint` takes x first.

use std::collections::HashSet;

use h3o::CellIndex;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, GenericClient, NoTls};
use tracing::error;
use uuid::Uuid;

use crate::config::PostgresConfig;
use crate::error::Error;
use crate::network::segments::{parse_linestring_json, Segment, SegmentClass, SegmentTable};
use crate::request::OriginPoints;

pub async fn connect(config: &PostgresConfig) -> Result<Client, Error> {
    let (client, connection) =
        tokio_postgres::connect(&config.connection_string(), NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("database connection failed: {}", e);
        }
    });
    Ok(client)
}

/// unquoted Postgres identifiers: a letter or underscore followed by
/// letters, digits and underscores
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// optionally schema-qualified references like `basic.segment`
pub fn is_valid_table_reference(name: &str) -> bool {
    let mut parts = 0;
    for part in name.split('.') {
        parts += 1;
        if parts > 2 || !is_valid_identifier(part) {
            return false;
        }
    }
    parts > 0
}

/// H3_3 short keys covering the configured geofence polygon.
pub async fn geofence_h3_3_cells(
    client: &impl GenericClient,
    region_table: &str,
) -> Result<Vec<i32>, Error> {
    let sql = format!(
        "WITH region AS (
            SELECT ST_Union(geom) AS geom FROM {region_table}
        )
        SELECT g.h3_short FROM region r,
        LATERAL temporal.fill_polygon_h3_3(r.geom) g"
    );
    let rows = client.query(&sql, &[]).await?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

/// H3_6 cells covering the configured geofence polygon.
pub async fn geofence_h3_6_cells(
    client: &impl GenericClient,
    region_table: &str,
) -> Result<Vec<CellIndex>, Error> {
    let sql = format!(
        "WITH region AS (
            SELECT ST_Union(geom) AS geom FROM {region_table}
        )
        SELECT g.h3_index::text FROM region r,
        LATERAL basic.fill_polygon_h3(r.geom, 6) g(h3_index)"
    );
    let rows = client.query(&sql, &[]).await?;
    rows.iter()
        .map(|row| {
            let text: String = row.get(0);
            text.parse::<CellIndex>()
                .map_err(|_| Error::InvalidH3Index(text))
        })
        .collect()
}

/// Bounded SELECT over the segment table, filtered to one H3_3 shard.
pub async fn load_segments(
    client: &impl GenericClient,
    h3_3: i32,
) -> Result<SegmentTable, Error> {
    let sql = "SELECT
            id, length_m, length_3857,
            class_, impedance_slope, impedance_slope_reverse,
            impedance_surface, CAST(coordinates_3857 AS TEXT) AS coordinates_3857,
            source, target, CAST(tags AS TEXT) AS tags, h3_3, h3_6
        FROM basic.segment
        WHERE h3_3 = $1";
    let rows = client.query(sql, &[&h3_3]).await?;

    let mut table = SegmentTable::new();
    for row in rows {
        let class: String = row.get("class_");
        let coordinates: String = row.get("coordinates_3857");
        table.push(Segment {
            id: row.get("id"),
            source: row.get("source"),
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
    Ok(table)
}

/// Envelope of a request: H3_6 cells filling the buffered origins, grouped
/// by their H3_3 parents.
pub struct EnvelopeCells {
    pub h3_3: Vec<i32>,
    pub h3_6: HashSet<i32>,
}

pub async fn envelope_cells(
    client: &impl GenericClient,
    origin_table: &str,
    num_points: i64,
    buffer_m: f64,
) -> Result<EnvelopeCells, Error> {
    let sql = format!(
        "WITH origin AS (
            SELECT geom FROM temporal.\"{origin_table}\" LIMIT $2
        ),
        buffer AS (
            SELECT ST_Buffer(origin.geom::geography, $1)::geometry AS geom FROM origin
        ),
        cells AS (
            SELECT h3_index
            FROM buffer,
            LATERAL basic.fill_polygon_h3(buffer.geom, 6) AS h3_index
        )
        SELECT to_short_h3_3(h3_cell_to_parent(h3_index, 3)::bigint) AS h3_3,
               ARRAY_AGG(DISTINCT to_short_h3_6(h3_index::bigint)) AS h3_6
        FROM cells
        GROUP BY h3_3"
    );
    let rows = client.query(&sql, &[&buffer_m, &num_points]).await?;

    let mut envelope = EnvelopeCells {
        h3_3: Vec::with_capacity(rows.len()),
        h3_6: HashSet::new(),
    };
    for row in rows {
        envelope.h3_3.push(row.get(0));
        envelope.h3_6.extend(row.get::<_, Vec<i32>>(1));
    }
    Ok(envelope)
}

/// Materialises the origin points into a temporary table and returns its
/// generated name.
pub async fn create_origin_table(
    client: &impl GenericClient,
    origins: &OriginPoints,
) -> Result<String, Error> {
    let table_name = Uuid::new_v4().to_string().replace('-', "_");
    client
        .execute(
            &format!(
                "CREATE TABLE temporal.\"{table_name}\" (
                    id serial PRIMARY KEY,
                    geom geometry(Point, 4326)
                )"
            ),
            &[],
        )
        .await?;

    let mut values = String::new();
    let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(origins.len() * 2);
    for i in 0..origins.len() {
        if i > 0 {
            values.push(',');
        }
        values.push_str(&format!(
            "(ST_SetSRID(ST_MakePoint(${}, ${}), 4326))",
            i * 2 + 1,
            i * 2 + 2
        ));
    }
    for (lon, lat) in origins.longitude.iter().zip(origins.latitude.iter()) {
        params.push(lon);
        params.push(lat);
    }

    client
        .execute(
            &format!("INSERT INTO temporal.\"{table_name}\" (geom) VALUES {values}"),
            &params,
        )
        .await?;
    Ok(table_name)
}

pub async fn drop_origin_table(
    client: &impl GenericClient,
    table_name: &str,
) -> Result<(), Error> {
    client
        .execute(
            &format!("DROP TABLE IF EXISTS temporal.\"{table_name}\""),
            &[],
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_validation() {
        assert!(is_valid_identifier("traveltime_matrix_walking_20250210"));
        assert!(is_valid_identifier("_tmp"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("1_drop"));
        assert!(!is_valid_identifier("name with spaces"));
        assert!(!is_valid_identifier("semi;colon"));
    }

    #[test]
    fn table_reference_validation() {
        assert!(is_valid_table_reference("basic.segment"));
        assert!(is_valid_table_reference("segment"));
        assert!(!is_valid_table_reference("a.b.c"));
        assert!(!is_valid_table_reference("basic.seg ment"));
        assert!(!is_valid_table_reference(""));
    }
}
