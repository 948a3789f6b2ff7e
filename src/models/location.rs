// src/models/location.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A WGS84 point. Accepts the `lat`/`lng` spelling the dispatch server uses in some payloads.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lng")]
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,    // m/s
    pub bearing: f64,  // degrees (0-360)
    pub accuracy: f64, // meters
    pub timestamp: DateTime<Utc>,
}

impl LocationSample {
    pub fn at(coordinate: Coordinate, timestamp: DateTime<Utc>) -> Self {
        Self {
            latitude: coordinate.latitude,
            longitude: coordinate.longitude,
            speed: 0.0,
            bearing: 0.0,
            accuracy: 0.0,
            timestamp,
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

/// Ordered origin-to-destination polyline. Never reordered once built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteCoords(Vec<Coordinate>);

impl RouteCoords {
    pub fn new(points: Vec<Coordinate>) -> Self {
        Self(points)
    }

    pub fn straight_line(origin: Coordinate, destination: Coordinate) -> Self {
        Self(vec![origin, destination])
    }

    pub fn points(&self) -> &[Coordinate] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn destination(&self) -> Option<Coordinate> {
        self.0.last().copied()
    }

    /// Remaining polyline from `index` onward, prefixed with the current position.
    pub fn remaining_from(&self, index: usize, current: Coordinate) -> Vec<Coordinate> {
        let start = index.min(self.0.len());
        let mut remaining = Vec::with_capacity(self.0.len() - start + 1);
        remaining.push(current);
        remaining.extend_from_slice(&self.0[start..]);
        remaining
    }
}

impl From<Vec<Coordinate>> for RouteCoords {
    fn from(points: Vec<Coordinate>) -> Self {
        Self(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinate_accepts_lat_lng_alias() {
        let c: Coordinate = serde_json::from_str(r#"{"lat": 12.5, "lng": 77.1}"#).unwrap();
        assert_eq!(c, Coordinate::new(12.5, 77.1));
    }

    #[test]
    fn remaining_route_keeps_order() {
        let route = RouteCoords::new(vec![
            Coordinate::new(0.0, 0.0),
            Coordinate::new(0.0, 1.0),
            Coordinate::new(0.0, 2.0),
        ]);
        let here = Coordinate::new(0.1, 1.0);
        let remaining = route.remaining_from(1, here);
        assert_eq!(remaining, vec![here, Coordinate::new(0.0, 1.0), Coordinate::new(0.0, 2.0)]);
        assert_eq!(route.remaining_from(10, here), vec![here]);
    }

    #[test]
    fn invalid_coordinates_are_flagged() {
        assert!(!Coordinate::new(91.0, 0.0).is_valid());
        assert!(!Coordinate::new(f64::NAN, 0.0).is_valid());
        assert!(Coordinate::new(17.38, 78.48).is_valid());
    }
}
