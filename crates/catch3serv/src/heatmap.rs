//! Heatmap travel-time matrix preparation: for every origin cell in the
//! geofence, the set of destination cells reachable per integer minute,
//! written into a sharded matrix table.
//!
//! The geofence is split into H3_6 chunks processed by a pool of workers.
//! Every worker owns its database connection, its own routing network
//! shard cache and its own insert buffer; there is no shared mutable state
//! between workers.

use std::collections::BTreeMap;
use std::sync::Arc;

use h3o::{CellIndex, LatLng, Resolution};
use reachgraph::dijkstra::dijkstra_many;
use reachgraph::grid::network_to_grid;
use reachgraph::webmercator::wgs84_to_webmercator;
use reachgraph::{CancellationFlag, CompactNetwork, PixelExtent};
use tokio::task::{block_in_place, JoinSet};
use tokio_postgres::Client;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::db;
use crate::error::Error;
use crate::network::store::{PgSegmentSource, RoutingNetwork};
use crate::request::{OriginPoints, TransportMode, TravelCost};
use crate::splice;
use crate::subnetwork;

/// zoom level of the matrix interpolation grid
const MATRIX_GRID_ZOOM: u8 = 10;

/// fixed routing cost per mode used for matrix preparation
pub fn cost_preset(mode: TransportMode) -> TravelCost {
    let speed = match mode {
        TransportMode::Walking => 5.0,
        TransportMode::Bicycle => 15.0,
        TransportMode::Pedelec => 23.0,
        TransportMode::Car => 60.0,
    };
    TravelCost::Time {
        max_traveltime: 30,
        steps: 1,
        speed,
    }
}

pub fn matrix_table_name(mode: TransportMode, date_suffix: &str) -> String {
    format!("basic.traveltime_matrix_{}_{}", mode, date_suffix)
}

/// One insert row: all destinations reached from `orig` in `traveltime`
/// minutes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MatrixRow {
    pub orig: CellIndex,
    pub dests: Vec<CellIndex>,
    pub traveltime: i16,
    pub h3_3: i32,
}

pub struct HeatmapMatrixDriver {
    config: Arc<ServerConfig>,
    mode: TransportMode,
}

impl HeatmapMatrixDriver {
    pub fn new(config: Arc<ServerConfig>, mode: TransportMode) -> Self {
        Self { config, mode }
    }

    pub async fn run(&self) -> Result<(), Error> {
        let client = db::connect(&self.config.postgres).await?;
        let cells =
            db::geofence_h3_6_cells(&client, &self.config.network_region_table).await?;
        info!(
            "heatmap {}: {} h3_6 cells to process with {} workers",
            self.mode,
            cells.len(),
            self.config.heatmap.num_workers
        );

        self.create_matrix_table(&client).await?;

        let chunks = split_into_chunks(cells, self.config.heatmap.num_workers);
        let mut workers = JoinSet::new();
        for (worker_id, chunk) in chunks.into_iter().enumerate() {
            if chunk.is_empty() {
                continue;
            }
            let worker = HeatmapWorker {
                worker_id,
                chunk,
                config: self.config.clone(),
                mode: self.mode,
            };
            workers.spawn(async move { worker.run().await });
        }

        let mut aborted = 0usize;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    aborted += 1;
                    error!("heatmap worker failed: {}", e);
                }
                Err(e) => {
                    aborted += 1;
                    error!("heatmap worker panicked: {}", e);
                }
            }
        }
        if aborted > 0 {
            warn!("{} heatmap workers aborted before finishing their chunk", aborted);
        }
        Ok(())
    }

    /// (Re)creates the matrix table and distributes it by `h3_3`. A
    /// missing Citus extension downgrades the distribution to a warning.
    async fn create_matrix_table(&self, client: &Client) -> Result<(), Error> {
        let table = matrix_table_name(self.mode, &self.config.matrix_date_suffix);
        client
            .batch_execute(&format!(
                "DROP TABLE IF EXISTS {table};
                 CREATE TABLE {table} (
                    orig_id h3index NOT NULL,
                    dest_id h3index[] NOT NULL,
                    traveltime smallint NOT NULL,
                    h3_3 int NOT NULL,
                    PRIMARY KEY (orig_id, traveltime, h3_3)
                 )"
            ))
            .await?;
        if let Err(e) = client
            .execute(
                &format!("SELECT create_distributed_table('{table}', 'h3_3')"),
                &[],
            )
            .await
        {
            warn!("matrix table {} was not distributed: {}", table, e);
        }
        Ok(())
    }
}

struct HeatmapWorker {
    worker_id: usize,
    chunk: Vec<CellIndex>,
    config: Arc<ServerConfig>,
    mode: TransportMode,
}

impl HeatmapWorker {
    async fn run(self) -> Result<(), Error> {
        let client = db::connect(&self.config.postgres).await?;
        let network = RoutingNetwork::open(
            &client,
            &self.config.network_region_table,
            &self.config.cache_dir,
        )
        .await?;
        let travel_cost = cost_preset(self.mode);
        let table = matrix_table_name(self.mode, &self.config.matrix_date_suffix);
        let batch_size = self.config.insert_batch_size;

        let mut buffer: Vec<MatrixRow> = Vec::new();
        for (index, cell) in self.chunk.iter().enumerate() {
            match self
                .process_cell(&client, &network, *cell, &travel_cost)
                .await
            {
                Ok(rows) => buffer.extend(rows),
                Err(e) if e.is_skippable_cell() => {
                    warn!(
                        "worker {}: skipping cell {} ({})",
                        self.worker_id, cell, e
                    );
                    continue;
                }
                Err(e) => {
                    error!(
                        "worker {}: aborting chunk at cell {} ({} of {}): {}",
                        self.worker_id,
                        cell,
                        index + 1,
                        self.chunk.len(),
                        e
                    );
                    return Err(e);
                }
            }

            while buffer.len() >= batch_size {
                let batch: Vec<MatrixRow> = buffer.drain(..batch_size).collect();
                insert_matrix_rows(&client, &table, &batch).await?;
            }
        }
        if !buffer.is_empty() {
            insert_matrix_rows(&client, &table, &buffer).await?;
        }

        info!("worker {} finished {} cells", self.worker_id, self.chunk.len());
        Ok(())
    }

    async fn process_cell(
        &self,
        client: &Client,
        network: &RoutingNetwork,
        cell: CellIndex,
        travel_cost: &TravelCost,
    ) -> Result<Vec<MatrixRow>, Error> {
        let resolution = self.mode.matrix_resolution();
        let origin_cells: Vec<CellIndex> = cell.children(resolution).collect();
        let origins = origin_points(&origin_cells);

        let origin_table = db::create_origin_table(client, &origins).await?;
        let result = self
            .process_cell_inner(
                client,
                network,
                cell,
                &origin_cells,
                &origin_table,
                origins.len() as i64,
                travel_cost,
            )
            .await;
        if let Err(e) = db::drop_origin_table(client, &origin_table).await {
            warn!(
                "worker {}: could not drop origin table {}: {}",
                self.worker_id, origin_table, e
            );
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_cell_inner(
        &self,
        client: &Client,
        network: &RoutingNetwork,
        cell: CellIndex,
        origin_cells: &[CellIndex],
        origin_table: &str,
        num_points: i64,
        travel_cost: &TravelCost,
    ) -> Result<Vec<MatrixRow>, Error> {
        let classes = subnetwork::allowed_classes(self.mode);
        let splice =
            splice::artificial_segments(client, origin_table, num_points, classes).await?;

        let buffer_m =
            travel_cost.buffer_distance(self.mode, self.config.car_buffer_default_speed);
        let envelope = db::envelope_cells(client, origin_table, num_points, buffer_m).await?;

        let source = PgSegmentSource(client);
        let mut shards = Vec::with_capacity(envelope.h3_3.len());
        for h3_3 in &envelope.h3_3 {
            shards.push(network.shard(&source, *h3_3).await?);
        }

        let resolution = self.mode.matrix_resolution();
        let destinations = destination_cells(cell, resolution, buffer_m);
        let dest_centroids: Vec<[f64; 2]> = destinations
            .iter()
            .map(|dest| {
                let ll = LatLng::from(*dest);
                wgs84_to_webmercator([ll.lng(), ll.lat()])
            })
            .collect();
        let max_traveltime = travel_cost.grid_budget() as u16;

        let cancel = CancellationFlag::new();
        block_in_place(|| {
            let edges = subnetwork::assemble(
                &shards,
                &envelope.h3_6,
                &splice,
                self.mode,
                travel_cost,
            )?;
            let net = CompactNetwork::build(edges)?;

            let connector_sources: Vec<(usize, u32)> = splice
                .connectors
                .iter()
                .enumerate()
                .filter_map(|(i, connector)| {
                    net.compact_id(connector.node_id).map(|node| (i, node))
                })
                .collect();
            if connector_sources.is_empty() {
                return Err(Error::DisconnectedOrigin);
            }

            let start_nodes: Vec<u32> =
                connector_sources.iter().map(|(_, node)| *node).collect();
            let distances =
                dijkstra_many(&net, &start_nodes, travel_cost.budget(), &cancel)?;
            let extent =
                PixelExtent::covering(net.node_coords().iter().copied(), MATRIX_GRID_ZOOM)?;

            let mut rows = Vec::new();
            for ((connector_idx, _), dist) in connector_sources.iter().zip(distances.iter()) {
                let connector = &splice.connectors[*connector_idx];
                let origin_index = connector.point_id as usize;
                if origin_index == 0 || origin_index > origin_cells.len() {
                    continue;
                }
                let origin_cell = origin_cells[origin_index - 1];

                let grid = network_to_grid(
                    &net,
                    extent,
                    dist,
                    travel_cost.speed_mps(),
                    travel_cost.grid_budget(),
                    &cancel,
                )?;
                let costs: Vec<f32> = dest_centroids
                    .iter()
                    .map(|[x, y]| grid.sample_mercator(*x, *y))
                    .collect();

                rows.extend(group_by_traveltime(
                    origin_cell,
                    connector.h3_3,
                    &destinations,
                    &costs,
                    max_traveltime,
                ));
            }
            Ok(rows)
        })
    }
}

/// Destination cells: a grid disk around the center child of the H3_6
/// parent, sized to cover the parent plus the travel budget buffer.
fn destination_cells(parent: CellIndex, resolution: Resolution, buffer_m: f64) -> Vec<CellIndex> {
    let center = parent.center_child(resolution).unwrap_or(parent);
    let reach_m = Resolution::Six.edge_length_m() + buffer_m;
    let radius = (reach_m / (resolution.edge_length_m() * 2.0)) as u32;
    center.grid_disk::<Vec<_>>(radius)
}

fn origin_points(cells: &[CellIndex]) -> OriginPoints {
    let mut points = OriginPoints::default();
    for cell in cells {
        let ll = LatLng::from(*cell);
        points.latitude.push(ll.lat());
        points.longitude.push(ll.lng());
    }
    points
}

/// Groups destination costs by integer minute. NaN destinations are
/// dropped, minutes outside `[1, max_traveltime]` are dropped, and the
/// origin cell itself is guaranteed to appear at minute 1.
pub(crate) fn group_by_traveltime(
    orig: CellIndex,
    h3_3: i32,
    destinations: &[CellIndex],
    costs: &[f32],
    max_traveltime: u16,
) -> Vec<MatrixRow> {
    let mut buckets: BTreeMap<i16, Vec<CellIndex>> = BTreeMap::new();
    let mut origin_present = false;

    for (dest, cost) in destinations.iter().zip(costs.iter()) {
        if cost.is_nan() {
            continue;
        }
        let minutes = cost.round() as i32;
        if minutes < 1 || minutes > max_traveltime as i32 {
            continue;
        }
        if *dest == orig {
            origin_present = true;
        }
        buckets.entry(minutes as i16).or_default().push(*dest);
    }

    if !origin_present {
        buckets.entry(1).or_default().push(orig);
    }

    buckets
        .into_iter()
        .map(|(traveltime, dests)| MatrixRow {
            orig,
            dests,
            traveltime,
            h3_3,
        })
        .collect()
}

/// Splits the cells into `num_chunks` chunks of roughly equal size, the
/// remainder spread over the leading chunks.
pub(crate) fn split_into_chunks<T>(mut items: Vec<T>, num_chunks: usize) -> Vec<Vec<T>> {
    let chunk_size = items.len() / num_chunks;
    let remainder = items.len() % num_chunks;

    let mut chunks = Vec::with_capacity(num_chunks);
    for i in 0..num_chunks {
        let take = (chunk_size + usize::from(i < remainder)).min(items.len());
        let rest = items.split_off(take);
        chunks.push(std::mem::replace(&mut items, rest));
    }
    chunks
}

/// h3index literals are not encodable as statement parameters, so matrix
/// rows are written as formatted values. All values are generated
/// internally.
async fn insert_matrix_rows(
    client: &Client,
    table: &str,
    rows: &[MatrixRow],
) -> Result<(), Error> {
    let mut values = String::new();
    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            values.push(',');
        }
        let dests = row
            .dests
            .iter()
            .map(|dest| format!("'{dest}'"))
            .collect::<Vec<_>>()
            .join(",");
        values.push_str(&format!(
            "('{}', ARRAY[{}]::h3index[], {}, {})",
            row.orig, dests, row.traveltime, row.h3_3
        ));
    }
    client
        .execute(
            &format!("INSERT INTO {table} (orig_id, dest_id, traveltime, h3_3) VALUES {values}"),
            &[],
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(lat: f64, lng: f64, resolution: Resolution) -> CellIndex {
        LatLng::new(lat, lng).unwrap().to_cell(resolution)
    }

    #[test]
    fn chunks_are_balanced_with_round_robin_remainder() {
        let chunks = split_into_chunks((0..7).collect(), 3);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], vec![0, 1, 2]);
        assert_eq!(chunks[1], vec![3, 4]);
        assert_eq!(chunks[2], vec![5, 6]);
    }

    #[test]
    fn more_chunks_than_items_leaves_empty_chunks() {
        let chunks = split_into_chunks(vec![1, 2], 4);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks.iter().filter(|c| c.is_empty()).count(), 2);
        assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), 2);
    }

    #[test]
    fn traveltime_grouping_buckets_by_minute() {
        let orig = cell(52.52, 13.405, Resolution::Ten);
        let mut dests = vec![orig];
        dests.extend(
            orig.grid_disk::<Vec<_>>(1)
                .into_iter()
                .filter(|c| *c != orig),
        );
        let costs: Vec<f32> = (0..dests.len())
            .map(|i| match i {
                0 => 0.2,  // the origin itself, rounds below 1
                1 => 1.4,
                2 => 1.2,
                3 => 2.6,
                4 => f32::NAN,
                5 => 31.0, // beyond the budget
                _ => 5.0,
            })
            .collect();

        let rows = group_by_traveltime(orig, 8077, &dests, &costs, 30);
        // origin must be re-added at minute 1
        let minute_one = rows.iter().find(|r| r.traveltime == 1).unwrap();
        assert!(minute_one.dests.contains(&orig));
        assert_eq!(minute_one.dests.len(), 3);

        for row in &rows {
            assert!(row.traveltime >= 1 && row.traveltime <= 30);
            assert_eq!(row.orig, orig);
            assert_eq!(row.h3_3, 8077);
        }
        assert!(rows.iter().any(|r| r.traveltime == 3));
        assert!(!rows.iter().any(|r| r.traveltime > 30));
    }

    #[test]
    fn traveltime_rows_are_deterministic() {
        let orig = cell(52.52, 13.405, Resolution::Ten);
        let dests: Vec<CellIndex> = orig.grid_disk::<Vec<_>>(2);
        let costs: Vec<f32> = (0..dests.len()).map(|i| (i % 7) as f32).collect();

        let first = group_by_traveltime(orig, 8077, &dests, &costs, 30);
        let second = group_by_traveltime(orig, 8077, &dests, &costs, 30);
        assert_eq!(first, second);
    }

    #[test]
    fn destination_disk_covers_the_parent_cell() {
        let parent = cell(52.52, 13.405, Resolution::Six);
        // walking preset: 30 min at 5 km/h
        let destinations = destination_cells(parent, Resolution::Ten, 2500.0);
        assert!(destinations.len() > 1000);

        // every child of the parent must be reachable as a destination
        let children: Vec<CellIndex> = parent.children(Resolution::Ten).collect();
        assert!(destinations.len() > children.len());
        assert!(destinations.contains(&children[0]));
    }

    #[test]
    fn cost_presets_match_modes() {
        for (mode, expected_speed) in [
            (TransportMode::Walking, 5.0),
            (TransportMode::Bicycle, 15.0),
            (TransportMode::Pedelec, 23.0),
            (TransportMode::Car, 60.0),
        ] {
            match cost_preset(mode) {
                TravelCost::Time {
                    max_traveltime,
                    speed,
                    ..
                } => {
                    assert_eq!(max_traveltime, 30);
                    assert_eq!(speed, expected_speed);
                }
                TravelCost::Distance { .. } => unreachable!(),
            }
        }
    }

    #[test]
    fn matrix_table_names_carry_mode_and_date() {
        assert_eq!(
            matrix_table_name(TransportMode::Walking, "20250210"),
            "basic.traveltime_matrix_walking_20250210"
        );
    }
}
