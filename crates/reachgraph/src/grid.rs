//! Interpolation of per-node reach costs into a dense pixel grid in
//! web-mercator pixel space, and sampling of the grid at cell centroids.

use tracing::debug;

use crate::error::Error;
use crate::graph::CompactNetwork;
use crate::webmercator::{mercator_x_to_pixel, mercator_y_to_pixel, z_scale};
use crate::CancellationFlag;

/// margin in pixels added around the covered coordinates
const EXTENT_MARGIN: i64 = 2;

/// number of edges painted between two cancellation checks
const CANCEL_CHECK_INTERVAL: usize = 4096;

/// A rectangular window in mercator pixel coordinates at a fixed zoom level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelExtent {
    pub zoom: u8,
    pub west: i64,
    pub north: i64,
    pub width: usize,
    pub height: usize,
}

impl PixelExtent {
    /// Smallest extent covering all finite input coordinates (EPSG:3857),
    /// clipped to the world size at `zoom`.
    pub fn covering<I>(points: I, zoom: u8) -> Result<Self, Error>
    where
        I: IntoIterator<Item = [f64; 2]>,
    {
        let mut min_x = f64::INFINITY;
        let mut min_y = f64::INFINITY;
        let mut max_x = f64::NEG_INFINITY;
        let mut max_y = f64::NEG_INFINITY;

        for [x, y] in points {
            if !(x.is_finite() && y.is_finite()) {
                continue;
            }
            let px = mercator_x_to_pixel(x, zoom);
            let py = mercator_y_to_pixel(y, zoom);
            min_x = min_x.min(px);
            min_y = min_y.min(py);
            max_x = max_x.max(px);
            max_y = max_y.max(py);
        }
        if !(min_x.is_finite() && min_y.is_finite()) {
            return Err(Error::EmptyExtent);
        }

        let world = z_scale(zoom) as i64;
        let west = ((min_x.floor() as i64) - EXTENT_MARGIN).clamp(0, world);
        let north = ((min_y.floor() as i64) - EXTENT_MARGIN).clamp(0, world);
        let east = ((max_x.ceil() as i64) + EXTENT_MARGIN).clamp(0, world);
        let south = ((max_y.ceil() as i64) + EXTENT_MARGIN).clamp(0, world);

        Ok(Self {
            zoom,
            west,
            north,
            width: (east - west) as usize,
            height: (south - north) as usize,
        })
    }

    /// flat index of a world pixel coordinate, when inside the extent
    pub fn index_of(&self, px: i64, py: i64) -> Option<usize> {
        let x = px - self.west;
        let y = py - self.north;
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            None
        } else {
            Some(y as usize * self.width + x as usize)
        }
    }

    pub fn num_pixels(&self) -> usize {
        self.width * self.height
    }
}

/// Per-pixel reach costs. Unreached pixels hold `f32::INFINITY`.
///
/// Units are minutes for travel-time interpolation and metres for
/// distance-based interpolation.
pub struct CostGrid {
    pub extent: PixelExtent,
    values: Vec<f32>,
}

impl CostGrid {
    fn new(extent: PixelExtent) -> Self {
        let values = vec![f32::INFINITY; extent.num_pixels()];
        Self { extent, values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn value(&self, x: usize, y: usize) -> f32 {
        self.values[y * self.extent.width + x]
    }

    fn update_min(&mut self, index: usize, cost: f32) {
        if cost < self.values[index] {
            self.values[index] = cost;
        }
    }

    /// Cost at the pixel containing a mercator coordinate. Falls back to the
    /// minimum of the surrounding 3x3 pixel neighbourhood; NaN when the
    /// coordinate is outside the extent or nothing nearby was reached.
    pub fn sample_mercator(&self, x: f64, y: f64) -> f32 {
        let px = mercator_x_to_pixel(x, self.extent.zoom).floor() as i64;
        let py = mercator_y_to_pixel(y, self.extent.zoom).floor() as i64;

        if self.extent.index_of(px, py).is_none() {
            return f32::NAN;
        }
        let mut best = f32::INFINITY;
        for dy in -1..=1 {
            for dx in -1..=1 {
                if let Some(index) = self.extent.index_of(px + dx, py + dy) {
                    let value = self.values[index];
                    if value < best {
                        best = value;
                    }
                }
            }
        }
        if best.is_finite() {
            best
        } else {
            f32::NAN
        }
    }
}

/// Paints per-node reach costs onto a pixel grid by walking each reachable
/// edge polyline (both endpoint distances finite) in integer pixel space.
///
/// With `speed_mps` set, `dist` is interpreted as seconds and the grid is
/// written in minutes; without it the interpolation degrades to
/// distance-based costs: `dist` is metres and so is the grid. Projected
/// lengths are converted to metres through the `length_m / length_3857`
/// ratio of each edge. Pixels keep the minimum of all painted costs; costs
/// above `budget` (minutes resp. metres) are not painted.
pub fn network_to_grid(
    network: &CompactNetwork,
    extent: PixelExtent,
    dist: &[f64],
    speed_mps: Option<f64>,
    budget: f64,
    cancel: &CancellationFlag,
) -> Result<CostGrid, Error> {
    let mut grid = CostGrid::new(extent);
    let edges = network.edges();
    let mut painted_edges = 0usize;

    for edge in 0..edges.len() {
        if edge % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (u, v) = network.edge_endpoints(edge);
        let cost_u = node_cost(dist[u as usize], speed_mps);
        let cost_v = node_cost(dist[v as usize], speed_mps);
        if !(cost_u.is_finite() && cost_v.is_finite()) {
            continue;
        }

        let geometry = edges.geometry(edge);
        if geometry.is_empty() {
            continue;
        }

        // metres of real-world length per unit of projected length
        let ratio = {
            let r = edges.length_m[edge] / edges.length_3857[edge];
            if r.is_finite() && r > 0.0 {
                r
            } else {
                1.0
            }
        };
        let cost_per_mercator_meter = match speed_mps {
            Some(speed) => ratio / speed / 60.0,
            None => ratio,
        };

        let total_len: f64 = geometry
            .windows(2)
            .map(|w| (w[1][0] - w[0][0]).hypot(w[1][1] - w[0][1]))
            .sum();

        paint_polyline(
            &mut grid,
            geometry,
            total_len,
            cost_u,
            cost_v,
            cost_per_mercator_meter,
            budget,
        );
        painted_edges += 1;
    }

    debug!(
        "painted {} of {} edges onto a {}x{} pixel grid",
        painted_edges,
        edges.len(),
        extent.width,
        extent.height
    );
    Ok(grid)
}

fn node_cost(dist: f64, speed_mps: Option<f64>) -> f64 {
    if speed_mps.is_some() {
        dist / 60.0
    } else {
        dist
    }
}

#[allow(clippy::too_many_arguments)]
fn paint_polyline(
    grid: &mut CostGrid,
    geometry: &[[f64; 2]],
    total_len: f64,
    cost_u: f64,
    cost_v: f64,
    cost_per_mercator_meter: f64,
    budget: f64,
) {
    let zoom = grid.extent.zoom;

    if total_len <= 0.0 {
        // degenerate edge, paint the single location
        let px = mercator_x_to_pixel(geometry[0][0], zoom).floor() as i64;
        let py = mercator_y_to_pixel(geometry[0][1], zoom).floor() as i64;
        let cost = cost_u.min(cost_v);
        if cost <= budget {
            if let Some(index) = grid.extent.index_of(px, py) {
                grid.update_min(index, cost as f32);
            }
        }
        return;
    }

    let mut walked = 0.0f64;
    for window in geometry.windows(2) {
        let [x0, y0] = window[0];
        let [x1, y1] = window[1];
        let seg_len = (x1 - x0).hypot(y1 - y0);

        let px0 = mercator_x_to_pixel(x0, zoom);
        let py0 = mercator_y_to_pixel(y0, zoom);
        let px1 = mercator_x_to_pixel(x1, zoom);
        let py1 = mercator_y_to_pixel(y1, zoom);

        let steps = (px1 - px0).abs().max((py1 - py0).abs()).ceil().max(1.0) as usize;
        for step in 0..=steps {
            let t = step as f64 / steps as f64;
            let px = (px0 + t * (px1 - px0)).floor() as i64;
            let py = (py0 + t * (py1 - py0)).floor() as i64;

            let along = walked + seg_len * t;
            let from_source = cost_u + along * cost_per_mercator_meter;
            let from_target = cost_v + (total_len - along) * cost_per_mercator_meter;
            let cost = from_source.min(from_target);
            if cost > budget {
                continue;
            }
            if let Some(index) = grid.extent.index_of(px, py) {
                grid.update_min(index, cost as f32);
            }
        }
        walked += seg_len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeList;
    use crate::webmercator::pixel_size;
    use crate::CancellationFlag;

    /// single horizontal edge of `len_m` metres starting at the mercator origin
    fn single_edge_network(len_m: f64) -> CompactNetwork {
        let mut edges = EdgeList::new();
        edges.push(
            1,
            1,
            2,
            len_m,
            len_m,
            len_m,
            len_m,
            &[[0.0, 0.0], [len_m, 0.0]],
        );
        CompactNetwork::build(edges).unwrap()
    }

    #[test]
    fn extent_covers_all_points_with_margin() {
        let zoom = 10;
        let extent =
            PixelExtent::covering([[0.0, 0.0], [pixel_size(zoom) * 10.0, 0.0]], zoom).unwrap();
        assert_eq!(extent.width as i64, 10 + 2 * EXTENT_MARGIN);
        assert!(extent.index_of(extent.west, extent.north).is_some());
        assert!(extent
            .index_of(extent.west + extent.width as i64, extent.north)
            .is_none());
    }

    #[test]
    fn extent_without_finite_points_is_an_error() {
        assert!(matches!(
            PixelExtent::covering([[f64::NAN, f64::NAN]], 10),
            Err(Error::EmptyExtent)
        ));
    }

    #[test]
    fn painted_costs_stay_within_edge_bounds() {
        // 1000m edge, walked at 1 m/s: 0s at one end, 1000s at the other
        let network = single_edge_network(1000.0);
        let extent = PixelExtent::covering(network.node_coords().iter().copied(), 14).unwrap();
        let dist = vec![0.0, 1000.0];

        let grid = network_to_grid(
            &network,
            extent,
            &dist,
            Some(1.0),
            1e9,
            &CancellationFlag::new(),
        )
        .unwrap();

        let painted: Vec<f32> = grid
            .values()
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .collect();
        assert!(!painted.is_empty());
        for value in painted {
            // interpolated minutes must lie between the endpoint costs
            assert!(value >= 0.0 - f32::EPSILON);
            assert!(value <= 1000.0 / 60.0 + f32::EPSILON);
        }
    }

    #[test]
    fn unreached_edges_are_not_painted() {
        let network = single_edge_network(1000.0);
        let extent = PixelExtent::covering(network.node_coords().iter().copied(), 14).unwrap();
        let dist = vec![0.0, f64::INFINITY];

        let grid = network_to_grid(
            &network,
            extent,
            &dist,
            Some(1.0),
            1e9,
            &CancellationFlag::new(),
        )
        .unwrap();
        assert!(grid.values().iter().all(|v| !v.is_finite()));
    }

    #[test]
    fn distance_based_interpolation_uses_metres() {
        let network = single_edge_network(1000.0);
        let extent = PixelExtent::covering(network.node_coords().iter().copied(), 14).unwrap();
        let dist = vec![0.0, 1000.0];

        let grid =
            network_to_grid(&network, extent, &dist, None, 1e9, &CancellationFlag::new()).unwrap();

        let near_start = grid.sample_mercator(1.0, 0.0);
        let near_end = grid.sample_mercator(999.0, 0.0);
        assert!(near_start < 50.0);
        assert!(near_end <= 1000.0 + 1.0);
        assert!(near_end > near_start);
    }

    #[test]
    fn budget_limits_painted_pixels() {
        let network = single_edge_network(1000.0);
        let extent = PixelExtent::covering(network.node_coords().iter().copied(), 14).unwrap();
        let dist = vec![0.0, 1000.0];

        let grid =
            network_to_grid(&network, extent, &dist, None, 400.0, &CancellationFlag::new())
                .unwrap();
        for value in grid.values().iter().filter(|v| v.is_finite()) {
            assert!(*value <= 400.0);
        }
        // the far half of the edge exceeds the budget from both endpoints
        assert!(grid.sample_mercator(500.0, 0.0).is_nan());
    }

    #[test]
    fn sampling_outside_the_extent_is_nan() {
        let network = single_edge_network(100.0);
        let extent = PixelExtent::covering(network.node_coords().iter().copied(), 14).unwrap();
        let dist = vec![0.0, 100.0];
        let grid =
            network_to_grid(&network, extent, &dist, None, 1e9, &CancellationFlag::new()).unwrap();
        assert!(grid.sample_mercator(1.0e6, 1.0e6).is_nan());
    }

    #[test]
    fn cancellation_stops_painting() {
        let network = single_edge_network(100.0);
        let extent = PixelExtent::covering(network.node_coords().iter().copied(), 14).unwrap();
        let cancel = CancellationFlag::new();
        cancel.cancel();
        assert!(matches!(
            network_to_grid(&network, extent, &[0.0, 100.0], None, 1e9, &cancel),
            Err(Error::Cancelled)
        ));
    }
}
