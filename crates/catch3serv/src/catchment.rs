//! End-to-end catchment area computation: origin splicing, sub-network
//! assembly, routing, interpolation and result persistence, all inside a
//! single transaction.

use std::sync::Arc;

use geo_types::Coord;
use reachgraph::dijkstra::{combine_min, dijkstra_many};
use reachgraph::grid::network_to_grid;
use reachgraph::webmercator::webmercator_to_wgs84;
use reachgraph::{CancellationFlag, CompactNetwork, PixelExtent};
use tokio::task::block_in_place;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Transaction};
use tracing::{debug, info};
use uuid::Uuid;
use wkt::ToWkt;

use geo::BooleanOps;

use crate::config::ServerConfig;
use crate::contour::{ContourGrid, CostStepShape, PixelContourer};
use crate::db;
use crate::error::Error;
use crate::network::store::{PgSegmentSource, RoutingNetwork};
use crate::request::{CatchmentAreaRequest, OutputKind};
use crate::splice;
use crate::subnetwork;

/// network features are inserted in groups of this size
const NETWORK_INSERT_BATCH_SIZE: usize = 1000;

pub struct CatchmentAreaComputer {
    config: Arc<ServerConfig>,
    network: Arc<RoutingNetwork>,
    contourer: Box<dyn ContourGrid + Send + Sync>,
}

impl CatchmentAreaComputer {
    pub fn new(config: Arc<ServerConfig>, network: Arc<RoutingNetwork>) -> Self {
        let contourer = Box::new(PixelContourer {
            hole_threshold_sqm: config.hole_threshold_sqm,
        });
        Self {
            config,
            network,
            contourer,
        }
    }

    /// Runs one request. All SQL happens inside a transaction which is
    /// rolled back on any failure, so the result table never receives
    /// partial rows; the temporary origin point table disappears on both
    /// paths.
    pub async fn run(
        &self,
        client: &mut Client,
        request: &CatchmentAreaRequest,
        cancel: &CancellationFlag,
    ) -> Result<(), Error> {
        let tx = client.transaction().await?;
        match self.run_in_transaction(&tx, request, cancel).await {
            Ok(()) => {
                tx.commit().await?;
                info!("catchment area request committed");
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_error) = tx.rollback().await {
                    debug!("rollback failed: {}", rollback_error);
                }
                Err(e)
            }
        }
    }

    async fn run_in_transaction(
        &self,
        tx: &Transaction<'_>,
        request: &CatchmentAreaRequest,
        cancel: &CancellationFlag,
    ) -> Result<(), Error> {
        let origin_table = db::create_origin_table(tx, &request.starting_points).await?;
        match self
            .compute_and_persist(tx, &origin_table, request, cancel)
            .await
        {
            Ok(()) => db::drop_origin_table(tx, &origin_table).await,
            // the rollback removes the origin table together with the
            // transaction, so no cleanup statement runs on the error path
            Err(e) => Err(e),
        }
    }

    async fn compute_and_persist(
        &self,
        tx: &Transaction<'_>,
        origin_table: &str,
        request: &CatchmentAreaRequest,
        cancel: &CancellationFlag,
    ) -> Result<(), Error> {
        let num_points = request.starting_points.len() as i64;
        let classes = subnetwork::allowed_classes(request.routing_type);

        let splice =
            splice::artificial_segments(tx, origin_table, num_points, classes).await?;

        let buffer_m = request
            .travel_cost
            .buffer_distance(request.routing_type, self.config.car_buffer_default_speed);
        let envelope = db::envelope_cells(tx, origin_table, num_points, buffer_m).await?;

        let source = PgSegmentSource(tx);
        let mut shards = Vec::with_capacity(envelope.h3_3.len());
        for h3_3 in &envelope.h3_3 {
            shards.push(self.network.shard(&source, *h3_3).await?);
        }

        let (network, reach) = block_in_place(|| {
            let edges = subnetwork::assemble(
                &shards,
                &envelope.h3_6,
                &splice,
                request.routing_type,
                &request.travel_cost,
            )?;
            let network = CompactNetwork::build(edges)?;

            let sources: Vec<u32> = splice
                .connectors
                .iter()
                .filter_map(|connector| network.compact_id(connector.node_id))
                .collect();
            if sources.is_empty() {
                return Err(Error::DisconnectedOrigin);
            }

            let distances =
                dijkstra_many(&network, &sources, request.travel_cost.budget(), cancel)?;
            Ok((network, combine_min(&distances)))
        })?;

        match request.catchment_area_type {
            OutputKind::Polygon => {
                let shapes = block_in_place(|| self.contour_shapes(&network, &reach, request, cancel))?;
                self.insert_polygon_shapes(tx, request, &shapes).await
            }
            OutputKind::Network => {
                let features = block_in_place(|| reached_network_features(&network, &reach, request));
                insert_network_features(tx, request, &features).await
            }
            OutputKind::RectangularGrid => {
                // grid persistence depends on the consumer and is not wired up
                block_in_place(|| {
                    let zoom = request.routing_type.zoom();
                    let extent =
                        PixelExtent::covering(network.node_coords().iter().copied(), zoom)?;
                    network_to_grid(
                        &network,
                        extent,
                        &reach,
                        request.travel_cost.speed_mps(),
                        request.travel_cost.grid_budget(),
                        cancel,
                    )
                })?;
                debug!("rectangular_grid output requested; persistence is a stub");
                Ok(())
            }
        }
    }

    fn contour_shapes(
        &self,
        network: &CompactNetwork,
        reach: &[f64],
        request: &CatchmentAreaRequest,
        cancel: &CancellationFlag,
    ) -> Result<Vec<CostStepShape>, Error> {
        let zoom = request.routing_type.zoom();
        let extent = PixelExtent::covering(network.node_coords().iter().copied(), zoom)?;
        let grid = network_to_grid(
            network,
            extent,
            reach,
            request.travel_cost.speed_mps(),
            request.travel_cost.grid_budget(),
            cancel,
        )?;

        let steps = request.travel_cost.step_values();
        let mut shapes = self.contourer.shapes(&grid, &steps);

        if request.polygon_difference.unwrap_or(false) {
            // incremental shapes: each step minus the next smaller one
            for i in (1..shapes.len()).rev() {
                shapes[i].geometry = shapes[i].geometry.difference(&shapes[i - 1].geometry);
            }
        }
        Ok(shapes)
    }

    async fn insert_polygon_shapes(
        &self,
        tx: &Transaction<'_>,
        request: &CatchmentAreaRequest,
        shapes: &[CostStepShape],
    ) -> Result<(), Error> {
        let layer_id = request.layer_id.unwrap_or_else(Uuid::nil);
        let mut rows: Vec<(String, i32)> = Vec::new();
        for shape in shapes {
            for polygon in &shape.geometry {
                rows.push((polygon.wkt_string(), shape.step.round() as i32));
            }
        }
        if rows.is_empty() {
            return Ok(());
        }

        let mut values = String::new();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(rows.len() * 2 + 1);
        params.push(&layer_id);
        for (i, (wkt, step)) in rows.iter().enumerate() {
            if i > 0 {
                values.push(',');
            }
            values.push_str(&format!(
                "($1, ST_SetSRID(ST_GeomFromText(${}), 4326), ${})",
                i * 2 + 2,
                i * 2 + 3
            ));
            params.push(wkt);
            params.push(step);
        }

        let sql = format!(
            "INSERT INTO user_data.{} (layer_id, geom, integer_attr1) VALUES {}",
            request.result_table, values
        );
        tx.execute(&sql, &params).await?;
        info!("inserted {} polygon shapes", rows.len());
        Ok(())
    }
}

/// A reached network feature: the segment polyline in EPSG:4326 and the
/// cost of reaching its nearer endpoint (minutes or metres).
pub(crate) struct NetworkFeature {
    pub wkt: String,
    pub cost: f64,
}

pub(crate) fn reached_network_features(
    network: &CompactNetwork,
    reach: &[f64],
    request: &CatchmentAreaRequest,
) -> Vec<NetworkFeature> {
    let to_output_units = if request.travel_cost.is_distance_based() {
        1.0
    } else {
        1.0 / 60.0
    };

    let edges = network.edges();
    let mut features = Vec::new();
    for edge in 0..edges.len() {
        let (u, v) = network.edge_endpoints(edge);
        let cost_u = reach[u as usize];
        let cost_v = reach[v as usize];
        if !(cost_u.is_finite() && cost_v.is_finite()) {
            continue;
        }

        let line: Vec<Coord<f64>> = edges
            .geometry(edge)
            .iter()
            .map(|point| {
                let [x, y] = webmercator_to_wgs84(*point);
                Coord { x, y }
            })
            .collect();
        if line.len() < 2 {
            continue;
        }
        features.push(NetworkFeature {
            wkt: geo_types::LineString::from(line).wkt_string(),
            cost: cost_u.min(cost_v) * to_output_units,
        });
    }
    features
}

async fn insert_network_features(
    tx: &Transaction<'_>,
    request: &CatchmentAreaRequest,
    features: &[NetworkFeature],
) -> Result<(), Error> {
    let layer_id = request.layer_id.unwrap_or_else(Uuid::nil);
    let mut inserted = 0usize;
    for batch in features.chunks(NETWORK_INSERT_BATCH_SIZE) {
        let mut values = String::new();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(batch.len() * 2 + 1);
        params.push(&layer_id);
        for (i, feature) in batch.iter().enumerate() {
            if i > 0 {
                values.push(',');
            }
            values.push_str(&format!(
                "($1, ST_SetSRID(ST_GeomFromText(${}), 4326), ${})",
                i * 2 + 2,
                i * 2 + 3
            ));
            params.push(&feature.wkt);
            params.push(&feature.cost);
        }
        let sql = format!(
            "INSERT INTO user_data.{} (layer_id, geom, float_attr1) VALUES {}",
            request.result_table, values
        );
        tx.execute(&sql, &params).await?;
        inserted += batch.len();
    }
    info!("inserted {} network features", inserted);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{OriginPoints, TransportMode, TravelCost};
    use reachgraph::EdgeList;

    fn network_request() -> CatchmentAreaRequest {
        CatchmentAreaRequest {
            starting_points: OriginPoints {
                latitude: vec![52.52],
                longitude: vec![13.405],
            },
            routing_type: TransportMode::Walking,
            travel_cost: TravelCost::Time {
                max_traveltime: 30,
                steps: 5,
                speed: 5.0,
            },
            catchment_area_type: OutputKind::Network,
            polygon_difference: None,
            result_table: "network_result".to_string(),
            layer_id: None,
        }
    }

    #[test]
    fn network_features_skip_partially_reached_edges() {
        let mut edges = EdgeList::new();
        edges.push(1, 1, 2, 60.0, 60.0, 100.0, 100.0, &[[0.0, 0.0], [100.0, 0.0]]);
        edges.push(2, 2, 3, 60.0, 60.0, 100.0, 100.0, &[[100.0, 0.0], [200.0, 0.0]]);
        let network = CompactNetwork::build(edges).unwrap();

        let mut reach = vec![f64::INFINITY; network.num_nodes()];
        reach[network.compact_id(1).unwrap() as usize] = 0.0;
        reach[network.compact_id(2).unwrap() as usize] = 60.0;

        let features = reached_network_features(&network, &reach, &network_request());
        assert_eq!(features.len(), 1);
        // ingress cost is the nearer endpoint, in minutes
        assert_eq!(features[0].cost, 0.0);
        assert!(features[0].wkt.starts_with("LINESTRING"));
    }
}
