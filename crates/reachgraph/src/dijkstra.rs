//! Multi-source Dijkstra over a [`CompactNetwork`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rayon::prelude::*;

use crate::error::Error;
use crate::graph::CompactNetwork;
use crate::CancellationFlag;

struct HeapEntry {
    cost: f64,
    node: u32,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost && self.node == other.node
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // inverted for a min-heap on cost, node id as tie-breaker
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Runs one Dijkstra per start node, each into a freshly allocated distance
/// array of `num_nodes` length. `f64::INFINITY` marks unreached nodes.
/// Exploration stops at neighbours whose tentative cost exceeds `budget`.
///
/// The runs are fanned out over rayon; the cancellation flag is checked
/// before each start node.
pub fn dijkstra_many(
    network: &CompactNetwork,
    start_nodes: &[u32],
    budget: f64,
    cancel: &CancellationFlag,
) -> Result<Vec<Vec<f64>>, Error> {
    for start in start_nodes {
        if (*start as usize) >= network.num_nodes() {
            return Err(Error::UnknownStartNode(*start));
        }
    }

    start_nodes
        .par_iter()
        .map(|start| {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            Ok(single_source(network, *start, budget))
        })
        .collect()
}

fn single_source(network: &CompactNetwork, start: u32, budget: f64) -> Vec<f64> {
    let mut dist = vec![f64::INFINITY; network.num_nodes()];
    let mut heap = BinaryHeap::new();

    dist[start as usize] = 0.0;
    heap.push(HeapEntry {
        cost: 0.0,
        node: start,
    });

    while let Some(HeapEntry { cost, node }) = heap.pop() {
        if cost > dist[node as usize] {
            continue;
        }
        for neighbor in network.neighbors(node) {
            let next = cost + neighbor.cost;
            if next > budget {
                continue;
            }
            if next < dist[neighbor.node as usize] {
                dist[neighbor.node as usize] = next;
                heap.push(HeapEntry {
                    cost: next,
                    node: neighbor.node,
                });
            }
        }
    }
    dist
}

/// element-wise minimum over per-source distance arrays
pub fn combine_min(distances: &[Vec<f64>]) -> Vec<f64> {
    let mut combined = match distances.first() {
        Some(first) => first.clone(),
        None => return Vec::new(),
    };
    for dist in &distances[1..] {
        for (c, d) in combined.iter_mut().zip(dist.iter()) {
            if *d < *c {
                *c = *d;
            }
        }
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::path_edge_list;
    use crate::graph::{CompactNetwork, EdgeList};

    fn line_network(num_edges: usize, cost: f64) -> CompactNetwork {
        let mut edges = EdgeList::new();
        for i in 0..num_edges {
            let x0 = i as f64 * 100.0;
            edges.push(
                i as i64,
                i as i64,
                (i + 1) as i64,
                cost,
                cost,
                100.0,
                100.0,
                &[[x0, 0.0], [x0 + 100.0, 0.0]],
            );
        }
        CompactNetwork::build(edges).unwrap()
    }

    #[test]
    fn distances_along_a_line() {
        let network = line_network(5, 10.0);
        let start = network.compact_id(0).unwrap();
        let dist = dijkstra_many(&network, &[start], 30.0, &CancellationFlag::new())
            .unwrap()
            .remove(0);

        let reached: Vec<f64> = dist.iter().copied().filter(|d| d.is_finite()).collect();
        assert_eq!(reached.len(), 4);
        for expected in [0.0, 10.0, 20.0, 30.0] {
            assert!(dist.contains(&expected));
        }
    }

    #[test]
    fn budget_cuts_off_exploration() {
        let network = line_network(5, 10.0);
        let start = network.compact_id(0).unwrap();
        let dist = dijkstra_many(&network, &[start], 15.0, &CancellationFlag::new())
            .unwrap()
            .remove(0);
        assert_eq!(dist.iter().filter(|d| d.is_finite()).count(), 2);
    }

    #[test]
    fn relaxation_closure_holds() {
        let network = CompactNetwork::build(path_edge_list()).unwrap();
        let start = network.compact_id(10).unwrap();
        let dist = dijkstra_many(&network, &[start], 1e9, &CancellationFlag::new())
            .unwrap()
            .remove(0);

        for node in 0..network.num_nodes() as u32 {
            for neighbor in network.neighbors(node) {
                if dist[node as usize].is_finite() && dist[neighbor.node as usize].is_finite() {
                    assert!(
                        dist[neighbor.node as usize] <= dist[node as usize] + neighbor.cost + 1e-9
                    );
                }
            }
        }
    }

    #[test]
    fn one_distance_array_per_start() {
        let network = line_network(4, 10.0);
        let starts = [
            network.compact_id(0).unwrap(),
            network.compact_id(4).unwrap(),
        ];
        let distances =
            dijkstra_many(&network, &starts, 100.0, &CancellationFlag::new()).unwrap();
        assert_eq!(distances.len(), 2);
        assert_eq!(distances[0][starts[0] as usize], 0.0);
        assert_eq!(distances[1][starts[1] as usize], 0.0);

        let combined = combine_min(&distances);
        for (i, value) in combined.iter().enumerate() {
            assert_eq!(*value, distances[0][i].min(distances[1][i]));
        }
    }

    #[test]
    fn cancellation_aborts_the_run() {
        let network = line_network(4, 10.0);
        let start = network.compact_id(0).unwrap();
        let cancel = CancellationFlag::new();
        cancel.cancel();
        assert!(matches!(
            dijkstra_many(&network, &[start], 100.0, &cancel),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn unknown_start_node_is_rejected() {
        let network = line_network(2, 1.0);
        assert!(matches!(
            dijkstra_many(&network, &[999], 10.0, &CancellationFlag::new()),
            Err(Error::UnknownStartNode(999))
        ));
    }
}
