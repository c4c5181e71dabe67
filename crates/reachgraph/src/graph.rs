use hashbrown::HashMap;

use crate::error::Error;

/// Column-oriented edge input for building a routable network.
///
/// Costs are expected to be finite and non-negative; rows violating this are
/// kept in the list but excluded from the adjacency during [`CompactNetwork::build`].
/// Geometries are polylines in EPSG:3857, stored in a flat point array
/// addressed through offsets.
#[derive(Clone)]
pub struct EdgeList {
    pub id: Vec<i64>,
    pub source: Vec<i64>,
    pub target: Vec<i64>,
    pub cost: Vec<f64>,
    pub reverse_cost: Vec<f64>,
    pub length_m: Vec<f64>,
    pub length_3857: Vec<f64>,
    geom_offsets: Vec<u32>,
    geom_points: Vec<[f64; 2]>,
}

impl Default for EdgeList {
    fn default() -> Self {
        Self {
            id: Vec::new(),
            source: Vec::new(),
            target: Vec::new(),
            cost: Vec::new(),
            reverse_cost: Vec::new(),
            length_m: Vec::new(),
            length_3857: Vec::new(),
            geom_offsets: vec![0],
            geom_points: Vec::new(),
        }
    }
}

impl EdgeList {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            id: Vec::with_capacity(capacity),
            source: Vec::with_capacity(capacity),
            target: Vec::with_capacity(capacity),
            cost: Vec::with_capacity(capacity),
            reverse_cost: Vec::with_capacity(capacity),
            length_m: Vec::with_capacity(capacity),
            length_3857: Vec::with_capacity(capacity),
            geom_offsets: {
                let mut offsets = Vec::with_capacity(capacity + 1);
                offsets.push(0);
                offsets
            },
            geom_points: Vec::with_capacity(capacity * 2),
        }
    }

    pub fn len(&self) -> usize {
        self.id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn push(
        &mut self,
        id: i64,
        source: i64,
        target: i64,
        cost: f64,
        reverse_cost: f64,
        length_m: f64,
        length_3857: f64,
        geometry: &[[f64; 2]],
    ) {
        self.id.push(id);
        self.source.push(source);
        self.target.push(target);
        self.cost.push(cost);
        self.reverse_cost.push(reverse_cost);
        self.length_m.push(length_m);
        self.length_3857.push(length_3857);
        self.geom_points.extend_from_slice(geometry);
        self.geom_offsets.push(self.geom_points.len() as u32);
    }

    pub fn geometry(&self, edge: usize) -> &[[f64; 2]] {
        let start = self.geom_offsets[edge] as usize;
        let end = self.geom_offsets[edge + 1] as usize;
        &self.geom_points[start..end]
    }

    fn check_column_lengths(&self) -> Result<(), Error> {
        let n = self.id.len();
        for len in [
            self.source.len(),
            self.target.len(),
            self.cost.len(),
            self.reverse_cost.len(),
            self.length_m.len(),
            self.length_3857.len(),
            self.geom_offsets.len().saturating_sub(1),
        ] {
            if len != n {
                return Err(Error::MismatchedColumnLengths(n, len));
            }
        }
        Ok(())
    }
}

/// A directed neighbour entry in the adjacency of a [`CompactNetwork`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbor {
    pub node: u32,
    pub cost: f64,
    pub edge: u32,
}

/// The routable form of an [`EdgeList`]: raw 64 bit node ids are remapped to
/// a dense `[0, num_nodes)` range, node coordinates are lifted from the
/// polyline endpoints and a forward/reverse adjacency is built.
///
/// Adjacency invariant: every stored cost is finite and `>= 0`; offending
/// input costs are dropped (the edge stays addressable for interpolation).
pub struct CompactNetwork {
    edges: EdgeList,
    node_index: HashMap<i64, u32>,
    node_coords: Vec<[f64; 2]>,
    adjacency: Vec<Vec<Neighbor>>,
    compact_source: Vec<u32>,
    compact_target: Vec<u32>,
}

impl CompactNetwork {
    pub fn build(edges: EdgeList) -> Result<Self, Error> {
        if edges.is_empty() {
            return Err(Error::EmptyEdgeList);
        }
        edges.check_column_lengths()?;

        let mut node_index: HashMap<i64, u32> = HashMap::with_capacity(edges.len());
        let mut node_coords: Vec<[f64; 2]> = Vec::with_capacity(edges.len());
        let mut compact_source = Vec::with_capacity(edges.len());
        let mut compact_target = Vec::with_capacity(edges.len());

        for i in 0..edges.len() {
            let geometry = edges.geometry(i);
            let first = geometry.first().copied().unwrap_or([f64::NAN, f64::NAN]);
            let last = geometry.last().copied().unwrap_or([f64::NAN, f64::NAN]);

            let source = *node_index.entry(edges.source[i]).or_insert_with(|| {
                node_coords.push(first);
                (node_coords.len() - 1) as u32
            });
            let target = *node_index.entry(edges.target[i]).or_insert_with(|| {
                node_coords.push(last);
                (node_coords.len() - 1) as u32
            });
            compact_source.push(source);
            compact_target.push(target);
        }

        let mut adjacency: Vec<Vec<Neighbor>> = vec![Vec::new(); node_coords.len()];
        for i in 0..edges.len() {
            let (u, v) = (compact_source[i], compact_target[i]);
            let cost = edges.cost[i];
            if cost.is_finite() && cost >= 0.0 {
                adjacency[u as usize].push(Neighbor {
                    node: v,
                    cost,
                    edge: i as u32,
                });
            }
            let reverse_cost = edges.reverse_cost[i];
            if reverse_cost.is_finite() && reverse_cost >= 0.0 {
                adjacency[v as usize].push(Neighbor {
                    node: u,
                    cost: reverse_cost,
                    edge: i as u32,
                });
            }
        }

        Ok(Self {
            edges,
            node_index,
            node_coords,
            adjacency,
            compact_source,
            compact_target,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.node_coords.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// dense id for a raw node id, if the node is referenced by any edge
    pub fn compact_id(&self, raw_node_id: i64) -> Option<u32> {
        self.node_index.get(&raw_node_id).copied()
    }

    pub fn node_coord(&self, node: u32) -> [f64; 2] {
        self.node_coords[node as usize]
    }

    pub fn node_coords(&self) -> &[[f64; 2]] {
        &self.node_coords
    }

    pub fn neighbors(&self, node: u32) -> &[Neighbor] {
        &self.adjacency[node as usize]
    }

    pub fn edge_endpoints(&self, edge: usize) -> (u32, u32) {
        (self.compact_source[edge], self.compact_target[edge])
    }

    pub fn edges(&self) -> &EdgeList {
        &self.edges
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// a three-node path `10 -> 20 -> 30` with unit-square mercator geometry
    pub(crate) fn path_edge_list() -> EdgeList {
        let mut edges = EdgeList::new();
        edges.push(
            1,
            10,
            20,
            60.0,
            60.0,
            100.0,
            100.0,
            &[[0.0, 0.0], [100.0, 0.0]],
        );
        edges.push(
            2,
            20,
            30,
            120.0,
            120.0,
            200.0,
            200.0,
            &[[100.0, 0.0], [300.0, 0.0]],
        );
        edges
    }

    #[test]
    fn build_compacts_node_ids() {
        let network = CompactNetwork::build(path_edge_list()).unwrap();
        assert_eq!(network.num_nodes(), 3);
        assert_eq!(network.num_edges(), 2);

        let a = network.compact_id(10).unwrap();
        let b = network.compact_id(20).unwrap();
        let c = network.compact_id(30).unwrap();
        assert_eq!(network.edge_endpoints(0), (a, b));
        assert_eq!(network.edge_endpoints(1), (b, c));
        assert!(network.compact_id(99).is_none());
    }

    #[test]
    fn node_coords_lifted_from_polyline_endpoints() {
        let network = CompactNetwork::build(path_edge_list()).unwrap();
        let a = network.compact_id(10).unwrap();
        let c = network.compact_id(30).unwrap();
        assert_eq!(network.node_coord(a), [0.0, 0.0]);
        assert_eq!(network.node_coord(c), [300.0, 0.0]);
    }

    #[test]
    fn adjacency_contains_forward_and_reverse() {
        let network = CompactNetwork::build(path_edge_list()).unwrap();
        let b = network.compact_id(20).unwrap();
        // middle node reaches both ends
        assert_eq!(network.neighbors(b).len(), 2);
        for neighbor in network.neighbors(b) {
            assert!(neighbor.cost >= 0.0);
        }
    }

    #[test]
    fn invalid_costs_are_dropped_from_adjacency() {
        let mut edges = EdgeList::new();
        edges.push(1, 1, 2, f64::NAN, -5.0, 10.0, 10.0, &[[0.0, 0.0], [1.0, 0.0]]);
        edges.push(2, 2, 3, 1.0, f64::INFINITY, 10.0, 10.0, &[[1.0, 0.0], [2.0, 0.0]]);
        let network = CompactNetwork::build(edges).unwrap();

        let one = network.compact_id(1).unwrap();
        let two = network.compact_id(2).unwrap();
        let three = network.compact_id(3).unwrap();
        assert!(network.neighbors(one).is_empty());
        assert_eq!(network.neighbors(two).len(), 1);
        assert!(network.neighbors(three).is_empty());
    }

    #[test]
    fn empty_edge_list_is_rejected() {
        assert!(matches!(
            CompactNetwork::build(EdgeList::new()),
            Err(Error::EmptyEdgeList)
        ));
    }
}
