//! Grid contouring: turns a painted cost grid into polygon shapes, one per
//! cost step.
//!
//! The contouring algorithm itself is a collaborator with a small contract
//! ([`ContourGrid`]); [`PixelContourer`] is the built-in implementation. It
//! traces the boundaries of the reached pixel set, nests holes by
//! containment and drops holes below the configured area threshold.

use std::collections::BTreeMap;

use geo_types::{Coord, LineString, MultiPolygon, Polygon};
use reachgraph::grid::{CostGrid, PixelExtent};
use reachgraph::webmercator::{
    pixel_size, pixel_to_mercator_x, pixel_to_mercator_y, webmercator_to_wgs84,
};

/// One contoured shape: the region reachable within `step` cost units
/// (minutes or metres), in EPSG:4326.
#[derive(Clone, Debug)]
pub struct CostStepShape {
    pub step: f64,
    pub geometry: MultiPolygon<f64>,
}

pub trait ContourGrid {
    /// one shape per cost step, in the order of `steps`
    fn shapes(&self, grid: &CostGrid, steps: &[f64]) -> Vec<CostStepShape>;
}

pub struct PixelContourer {
    /// holes with a smaller area (m²) are dropped
    pub hole_threshold_sqm: f64,
}

impl ContourGrid for PixelContourer {
    fn shapes(&self, grid: &CostGrid, steps: &[f64]) -> Vec<CostStepShape> {
        steps
            .iter()
            .map(|&step| {
                let mask: Vec<bool> = grid
                    .values()
                    .iter()
                    .map(|v| v.is_finite() && (*v as f64) <= step)
                    .collect();
                let rings = boundary_rings(&mask, grid.extent.width, grid.extent.height);
                CostStepShape {
                    step,
                    geometry: assemble_polygons(rings, &grid.extent, self.hole_threshold_sqm),
                }
            })
            .collect()
    }
}

/// A closed ring of pixel-corner vertices plus the center of one pixel
/// adjacent to its first edge, used for containment classification.
struct Ring {
    vertices: Vec<(i64, i64)>,
    probe: (f64, f64),
}

/// Directions on the pixel lattice: E, S, W, N.
const DIRECTIONS: [(i64, i64); 4] = [(1, 0), (0, 1), (-1, 0), (0, -1)];

/// Collects the unit edges separating reached from unreached pixels and
/// stitches them into closed rings. Edges are directed so the reached side
/// is consistent; at pinch vertices the continuation turning towards the
/// reached side is preferred.
fn boundary_rings(mask: &[bool], width: usize, height: usize) -> Vec<Ring> {
    let reached = |x: i64, y: i64| -> bool {
        x >= 0
            && y >= 0
            && (x as usize) < width
            && (y as usize) < height
            && mask[y as usize * width + x as usize]
    };

    // outgoing directed edges per start vertex: direction index + the
    // reached pixel the edge borders
    let mut edges: BTreeMap<(i64, i64), Vec<(usize, (i64, i64), bool)>> = BTreeMap::new();
    let mut num_edges = 0usize;
    for y in 0..height as i64 {
        for x in 0..width as i64 {
            if !reached(x, y) {
                continue;
            }
            let mut emit = |start: (i64, i64), dir: usize| {
                edges.entry(start).or_default().push((dir, (x, y), false));
                num_edges += 1;
            };
            if !reached(x, y - 1) {
                emit((x, y), 0);
            }
            if !reached(x + 1, y) {
                emit((x + 1, y), 1);
            }
            if !reached(x, y + 1) {
                emit((x + 1, y + 1), 2);
            }
            if !reached(x - 1, y) {
                emit((x, y + 1), 3);
            }
        }
    }

    let mut rings = Vec::new();
    let starts: Vec<(i64, i64)> = edges.keys().copied().collect();
    for start_vertex in starts {
        loop {
            // pick the next unused edge at this vertex
            let first = match edges.get_mut(&start_vertex).and_then(|outgoing| {
                outgoing
                    .iter_mut()
                    .find(|(_, _, used)| !used)
                    .map(|entry| {
                        entry.2 = true;
                        (entry.0, entry.1)
                    })
            }) {
                Some(first) => first,
                None => break,
            };

            let probe_pixel = first.1;
            let mut vertices = vec![start_vertex];
            let mut direction = first.0;
            let mut vertex = step(start_vertex, direction);

            while vertex != start_vertex {
                vertices.push(vertex);
                // edges carry the reached region on their right; the
                // sharpest right turn keeps separate components separate
                let preferences = [(direction + 1) % 4, direction, (direction + 3) % 4];
                let next = preferences.iter().copied().find_map(|candidate| {
                    edges.get_mut(&vertex).and_then(|outgoing| {
                        outgoing
                            .iter_mut()
                            .find(|(dir, _, used)| *dir == candidate && !used)
                            .map(|entry| {
                                entry.2 = true;
                                entry.0
                            })
                    })
                });
                match next {
                    Some(next_direction) => {
                        direction = next_direction;
                        vertex = step(vertex, direction);
                    }
                    None => break, // open chain, drop it
                }
            }

            if vertex == start_vertex && vertices.len() >= 4 {
                rings.push(Ring {
                    vertices,
                    probe: (probe_pixel.0 as f64 + 0.5, probe_pixel.1 as f64 + 0.5),
                });
            }
        }
    }
    debug_assert!(rings.iter().map(|r| r.vertices.len()).sum::<usize>() <= num_edges);
    rings
}

fn step(vertex: (i64, i64), direction: usize) -> (i64, i64) {
    let (dx, dy) = DIRECTIONS[direction];
    (vertex.0 + dx, vertex.1 + dy)
}

/// even-odd ray casting on pixel coordinates
fn point_in_ring(point: (f64, f64), ring: &[(i64, i64)]) -> bool {
    let mut inside = false;
    let n = ring.len();
    for i in 0..n {
        let (x0, y0) = ring[i];
        let (x1, y1) = ring[(i + 1) % n];
        let (x0, y0) = (x0 as f64, y0 as f64);
        let (x1, y1) = (x1 as f64, y1 as f64);
        if (y0 > point.1) != (y1 > point.1) {
            let cross_x = x0 + (point.1 - y0) / (y1 - y0) * (x1 - x0);
            if point.0 < cross_x {
                inside = !inside;
            }
        }
    }
    inside
}

fn shoelace_area(ring: &[(i64, i64)]) -> f64 {
    let n = ring.len();
    let mut doubled = 0i64;
    for i in 0..n {
        let (x0, y0) = ring[i];
        let (x1, y1) = ring[(i + 1) % n];
        doubled += x0 * y1 - x1 * y0;
    }
    (doubled as f64 / 2.0).abs()
}

fn assemble_polygons(
    rings: Vec<Ring>,
    extent: &PixelExtent,
    hole_threshold_sqm: f64,
) -> MultiPolygon<f64> {
    // classify by containment depth: even depth = outer ring, odd = hole
    let mut outers: Vec<(usize, f64)> = Vec::new();
    let mut holes: Vec<usize> = Vec::new();
    for (i, ring) in rings.iter().enumerate() {
        let depth = rings
            .iter()
            .enumerate()
            .filter(|(j, other)| *j != i && point_in_ring(ring.probe, &other.vertices))
            .count();
        if depth % 2 == 0 {
            outers.push((i, shoelace_area(&ring.vertices)));
        } else {
            holes.push(i);
        }
    }

    let pixel_area_sqm = pixel_size(extent.zoom) * pixel_size(extent.zoom);
    let mut polygons: Vec<(usize, Polygon<f64>)> = outers
        .iter()
        .map(|(i, _)| {
            (
                *i,
                Polygon::new(ring_to_wgs84(&rings[*i].vertices, extent), Vec::new()),
            )
        })
        .collect();

    for hole_idx in holes {
        if shoelace_area(&rings[hole_idx].vertices) * pixel_area_sqm < hole_threshold_sqm {
            continue;
        }
        // attach to the smallest outer ring containing the hole
        let owner = outers
            .iter()
            .filter(|(i, _)| point_in_ring(rings[hole_idx].probe, &rings[*i].vertices))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| *i);
        if let Some(owner) = owner {
            if let Some((_, polygon)) = polygons.iter_mut().find(|(i, _)| *i == owner) {
                polygon
                    .interiors_push(ring_to_wgs84(&rings[hole_idx].vertices, extent));
            }
        }
    }

    MultiPolygon(polygons.into_iter().map(|(_, polygon)| polygon).collect())
}

fn ring_to_wgs84(vertices: &[(i64, i64)], extent: &PixelExtent) -> LineString<f64> {
    let mut coords: Vec<Coord<f64>> = vertices
        .iter()
        .map(|(vx, vy)| {
            let world_x = (extent.west + vx) as f64;
            let world_y = (extent.north + vy) as f64;
            let [x, y] = webmercator_to_wgs84([
                pixel_to_mercator_x(world_x, extent.zoom),
                pixel_to_mercator_y(world_y, extent.zoom),
            ]);
            Coord { x, y }
        })
        .collect();
    if let Some(first) = coords.first().copied() {
        coords.push(first);
    }
    LineString::from(coords)
}
