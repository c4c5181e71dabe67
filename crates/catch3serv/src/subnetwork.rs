//! Sub-network assembly: filters the relevant shards down to the envelope
//! and the mode's segment classes, fuses in the artificial segments and
//! derives per-segment traversal costs.

use std::collections::HashSet;
use std::sync::Arc;

use reachgraph::EdgeList;
use tracing::debug;

use crate::error::Error;
use crate::network::segments::{SegmentClass, SegmentTable};
use crate::request::{TransportMode, TravelCost};
use crate::splice::SpliceResult;

pub const WALKING_CLASSES: &[SegmentClass] = &[
    SegmentClass::Secondary,
    SegmentClass::Tertiary,
    SegmentClass::Residential,
    SegmentClass::LivingStreet,
    SegmentClass::Trunk,
    SegmentClass::Unclassified,
    SegmentClass::ParkingAisle,
    SegmentClass::Driveway,
    SegmentClass::Pedestrian,
    SegmentClass::Footway,
    SegmentClass::Steps,
    SegmentClass::Track,
    SegmentClass::Bridleway,
    SegmentClass::Unknown,
];

pub const BICYCLE_CLASSES: &[SegmentClass] = &[
    SegmentClass::Secondary,
    SegmentClass::Tertiary,
    SegmentClass::Residential,
    SegmentClass::LivingStreet,
    SegmentClass::Trunk,
    SegmentClass::Unclassified,
    SegmentClass::ParkingAisle,
    SegmentClass::Driveway,
    SegmentClass::Pedestrian,
    SegmentClass::Track,
    SegmentClass::Cycleway,
    SegmentClass::Bridleway,
    SegmentClass::Unknown,
];

pub const CAR_CLASSES: &[SegmentClass] = &[
    SegmentClass::Motorway,
    SegmentClass::Trunk,
    SegmentClass::Primary,
    SegmentClass::Secondary,
    SegmentClass::Tertiary,
    SegmentClass::Residential,
    SegmentClass::LivingStreet,
    SegmentClass::Unclassified,
    SegmentClass::ParkingAisle,
    SegmentClass::Driveway,
    SegmentClass::Track,
    SegmentClass::Unknown,
];

pub fn allowed_classes(mode: TransportMode) -> &'static [SegmentClass] {
    match mode {
        TransportMode::Walking => WALKING_CLASSES,
        TransportMode::Bicycle | TransportMode::Pedelec => BICYCLE_CLASSES,
        TransportMode::Car => CAR_CLASSES,
    }
}

/// Builds the spliced, cost-annotated edge list for one request.
pub fn assemble(
    shards: &[Arc<SegmentTable>],
    envelope_h3_6: &HashSet<i32>,
    splice: &SpliceResult,
    mode: TransportMode,
    travel_cost: &TravelCost,
) -> Result<EdgeList, Error> {
    let classes = allowed_classes(mode);
    let mut edges = EdgeList::new();

    for shard in shards {
        for row in 0..shard.len() {
            if !envelope_h3_6.contains(&shard.h3_6[row])
                || !classes.contains(&shard.class[row])
                || splice.discard_ids.contains(&shard.id[row])
            {
                continue;
            }
            push_segment(&mut edges, shard, row, mode, travel_cost);
        }
    }
    let real_edges = edges.len();

    for row in 0..splice.segments.len() {
        push_segment(&mut edges, &splice.segments, row, mode, travel_cost);
    }

    debug!(
        "assembled sub-network: {} segments ({} artificial)",
        edges.len(),
        edges.len() - real_edges
    );
    Ok(edges)
}

fn push_segment(
    edges: &mut EdgeList,
    table: &SegmentTable,
    row: usize,
    mode: TransportMode,
    travel_cost: &TravelCost,
) {
    // NULL impedances count as zero
    let slope = nan_as_zero(table.impedance_slope[row]);
    let slope_reverse = nan_as_zero(table.impedance_slope_reverse[row]);
    let surface = nan_as_zero(table.impedance_surface[row] as f64);

    let (cost, reverse_cost) = segment_cost(
        mode,
        travel_cost,
        table.class[row],
        table.length_m[row],
        slope,
        slope_reverse,
        surface,
    );

    edges.push(
        table.id[row],
        table.source[row],
        table.target[row],
        cost,
        reverse_cost,
        table.length_m[row],
        table.length_3857[row],
        table.geometry(row),
    );
}

/// Per-segment traversal cost: seconds for time budgets, metres for
/// distance budgets.
///
/// Cyclists push their vehicle on pedestrian segments, so no impedance
/// applies there; pedelecs ignore slope impedance altogether.
fn segment_cost(
    mode: TransportMode,
    travel_cost: &TravelCost,
    class: SegmentClass,
    length_m: f64,
    slope: f64,
    slope_reverse: f64,
    surface: f64,
) -> (f64, f64) {
    let speed_mps = match travel_cost.speed_mps() {
        Some(speed) => speed,
        None => return (length_m, length_m),
    };

    match mode {
        TransportMode::Walking | TransportMode::Car => {
            let cost = length_m / speed_mps;
            (cost, cost)
        }
        TransportMode::Bicycle => {
            if class == SegmentClass::Pedestrian {
                let cost = length_m / speed_mps;
                (cost, cost)
            } else {
                (
                    length_m * (1.0 + slope + surface) / speed_mps,
                    length_m * (1.0 + slope_reverse + surface) / speed_mps,
                )
            }
        }
        TransportMode::Pedelec => {
            if class == SegmentClass::Pedestrian {
                let cost = length_m / speed_mps;
                (cost, cost)
            } else {
                let cost = length_m * (1.0 + surface) / speed_mps;
                (cost, cost)
            }
        }
    }
}

fn nan_as_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}
