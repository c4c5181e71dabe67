use std::fmt;

use h3o::Resolution;
use serde::Deserialize;
use uuid::Uuid;

use crate::db;
use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Walking,
    Bicycle,
    Pedelec,
    Car,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Walking => "walking",
            Self::Bicycle => "bicycle",
            Self::Pedelec => "pedelec",
            Self::Car => "car",
        }
    }

    /// zoom level of the interpolation grid
    pub fn zoom(&self) -> u8 {
        match self {
            Self::Car => 10,
            _ => 12,
        }
    }

    /// cell resolution of heatmap matrix origins and destinations
    pub fn matrix_resolution(&self) -> Resolution {
        match self {
            Self::Walking => Resolution::Ten,
            Self::Bicycle | Self::Pedelec => Resolution::Nine,
            Self::Car => Resolution::Eight,
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Travel budget of a request, either time or distance based.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum TravelCost {
    Time {
        /// minutes
        max_traveltime: u16,
        steps: u16,
        /// km/h
        speed: f64,
    },
    Distance {
        /// metres
        max_distance: u32,
        steps: u32,
    },
}

impl TravelCost {
    pub fn is_distance_based(&self) -> bool {
        matches!(self, Self::Distance { .. })
    }

    /// envelope buffer around the origins in metres; car requests are
    /// buffered with the configured default speed
    pub fn buffer_distance(&self, mode: TransportMode, car_default_speed_kmh: f64) -> f64 {
        match self {
            Self::Time {
                max_traveltime,
                speed,
                ..
            } => {
                let speed_kmh = if mode == TransportMode::Car {
                    car_default_speed_kmh
                } else {
                    *speed
                };
                *max_traveltime as f64 * (speed_kmh * 1000.0 / 60.0)
            }
            Self::Distance { max_distance, .. } => *max_distance as f64,
        }
    }

    /// Dijkstra budget: seconds for time costs, metres for distance costs
    pub fn budget(&self) -> f64 {
        match self {
            Self::Time { max_traveltime, .. } => *max_traveltime as f64 * 60.0,
            Self::Distance { max_distance, .. } => *max_distance as f64,
        }
    }

    /// grid interpolation budget: minutes for time costs, metres for
    /// distance costs
    pub fn grid_budget(&self) -> f64 {
        match self {
            Self::Time { max_traveltime, .. } => *max_traveltime as f64,
            Self::Distance { max_distance, .. } => *max_distance as f64,
        }
    }

    /// speed in m/s; `None` switches the interpolation to distance costs
    pub fn speed_mps(&self) -> Option<f64> {
        match self {
            Self::Time { speed, .. } => Some(*speed / 3.6),
            Self::Distance { .. } => None,
        }
    }

    /// evenly spread cost step values up to the budget (minutes or metres)
    pub fn step_values(&self) -> Vec<f64> {
        let (max, steps) = match self {
            Self::Time {
                max_traveltime,
                steps,
                ..
            } => (*max_traveltime as f64, *steps as u32),
            Self::Distance {
                max_distance,
                steps,
            } => (*max_distance as f64, *steps),
        };
        let steps = steps.max(1);
        (1..=steps).map(|i| max * i as f64 / steps as f64).collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Polygon,
    Network,
    RectangularGrid,
}

/// Origin coordinates in WGS84, kept as parallel latitude/longitude lists.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct OriginPoints {
    pub latitude: Vec<f64>,
    pub longitude: Vec<f64>,
}

impl OriginPoints {
    pub fn len(&self) -> usize {
        self.latitude.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latitude.is_empty()
    }

    /// (longitude, latitude) pairs
    pub fn lon_lat_pairs(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.longitude
            .iter()
            .copied()
            .zip(self.latitude.iter().copied())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CatchmentAreaRequest {
    pub starting_points: OriginPoints,
    pub routing_type: TransportMode,
    pub travel_cost: TravelCost,
    pub catchment_area_type: OutputKind,

    #[serde(default)]
    pub polygon_difference: Option<bool>,

    pub result_table: String,

    #[serde(default)]
    pub layer_id: Option<Uuid>,
}

impl CatchmentAreaRequest {
    pub fn validate(&self) -> Result<(), Error> {
        let points = &self.starting_points;
        if points.is_empty() {
            return Err(invalid("at least one starting point is required"));
        }
        if points.latitude.len() != points.longitude.len() {
            return Err(invalid("latitude and longitude lists differ in length"));
        }
        for (lon, lat) in points.lon_lat_pairs() {
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                return Err(invalid("starting point outside WGS84 bounds"));
            }
        }

        match &self.travel_cost {
            TravelCost::Time {
                max_traveltime,
                steps,
                speed,
            } => {
                let (max_minutes, max_speed): (u16, f64) = match self.routing_type {
                    TransportMode::Car => (60, 130.0),
                    _ => (45, 25.0),
                };
                if !(1..=max_minutes).contains(max_traveltime) {
                    return Err(invalid("max_traveltime out of range"));
                }
                if !(*speed >= 1.0 && *speed <= max_speed) {
                    return Err(invalid("speed out of range"));
                }
                if *steps < 1 || *steps > *max_traveltime {
                    return Err(invalid("steps must not exceed the maximum traveltime"));
                }
            }
            TravelCost::Distance {
                max_distance,
                steps,
            } => {
                if !(50..=20_000).contains(max_distance) {
                    return Err(invalid("max_distance out of range"));
                }
                if *steps < 1 || *steps > *max_distance {
                    return Err(invalid("steps must not exceed the maximum distance"));
                }
            }
        }

        match self.catchment_area_type {
            OutputKind::Polygon => {
                if self.polygon_difference.is_none() {
                    return Err(invalid(
                        "polygon_difference must be set for polygon catchment areas",
                    ));
                }
            }
            _ => {
                if self.polygon_difference.is_some() {
                    return Err(invalid(
                        "polygon_difference is only valid for polygon catchment areas",
                    ));
                }
            }
        }

        if !db::is_valid_identifier(&self.result_table) {
            return Err(invalid("result_table is not a valid identifier"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> Error {
    Error::InvalidRequest(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_point_walking_time() -> CatchmentAreaRequest {
        serde_json::from_str(
            r#"{
                "starting_points": {"latitude": [52.5200], "longitude": [13.4050]},
                "routing_type": "walking",
                "travel_cost": {"max_traveltime": 30, "steps": 5, "speed": 5},
                "catchment_area_type": "polygon",
                "polygon_difference": true,
                "result_table": "polygon_744e4fd1685c495c8b02efebce875359",
                "layer_id": "744e4fd1-685c-495c-8b02-efebce875359"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn time_cost_request_parses_and_validates() {
        let request = single_point_walking_time();
        request.validate().unwrap();
        assert_eq!(request.routing_type, TransportMode::Walking);
        assert!(!request.travel_cost.is_distance_based());
        assert_eq!(request.travel_cost.budget(), 1800.0);
        assert_eq!(request.travel_cost.grid_budget(), 30.0);
    }

    #[test]
    fn distance_cost_is_detected_by_field_names() {
        let cost: TravelCost =
            serde_json::from_str(r#"{"max_distance": 2500, "steps": 5}"#).unwrap();
        assert!(cost.is_distance_based());
        assert_eq!(cost.budget(), 2500.0);
        assert!(cost.speed_mps().is_none());
    }

    #[test]
    fn buffer_distance_matches_time_and_speed() {
        let request = single_point_walking_time();
        // 30 min at 5 km/h
        assert_eq!(
            request
                .travel_cost
                .buffer_distance(TransportMode::Walking, 80.0),
            2500.0
        );
        // car envelopes are sized with the configured default speed
        assert_eq!(
            request.travel_cost.buffer_distance(TransportMode::Car, 80.0),
            40_000.0
        );
    }

    #[test]
    fn step_values_are_evenly_spread() {
        let request = single_point_walking_time();
        assert_eq!(
            request.travel_cost.step_values(),
            vec![6.0, 12.0, 18.0, 24.0, 30.0]
        );
    }

    #[test]
    fn polygon_difference_is_mandatory_for_polygons() {
        let mut request = single_point_walking_time();
        request.polygon_difference = None;
        assert!(request.validate().is_err());

        request.catchment_area_type = OutputKind::Network;
        request.polygon_difference = Some(true);
        assert!(request.validate().is_err());

        request.polygon_difference = None;
        request.validate().unwrap();
    }

    #[test]
    fn out_of_range_requests_are_rejected() {
        let mut request = single_point_walking_time();
        request.travel_cost = TravelCost::Time {
            max_traveltime: 90,
            steps: 5,
            speed: 5.0,
        };
        assert!(request.validate().is_err());

        let mut request = single_point_walking_time();
        request.starting_points.latitude[0] = 123.0;
        assert!(request.validate().is_err());

        let mut request = single_point_walking_time();
        request.result_table = "polygon\"; drop table".to_string();
        assert!(request.validate().is_err());
    }

    #[test]
    fn car_requests_allow_higher_speeds() {
        let mut request = single_point_walking_time();
        request.routing_type = TransportMode::Car;
        request.travel_cost = TravelCost::Time {
            max_traveltime: 60,
            steps: 6,
            speed: 120.0,
        };
        request.validate().unwrap();
        assert_eq!(request.routing_type.zoom(), 10);
        assert_eq!(request.routing_type.matrix_resolution(), Resolution::Eight);
    }
}
