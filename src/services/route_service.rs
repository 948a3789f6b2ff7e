// src/services/route_service.rs
use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::{AgentError, AgentResult};
use crate::models::location::{Coordinate, RouteCoords};

#[async_trait]
pub trait RoutePlanner: Send + Sync {
    /// Ordered polyline from `origin` to `destination`.
    async fn route(&self, origin: Coordinate, destination: Coordinate) -> AgentResult<RouteCoords>;
}

/// Routes from an OSRM-compatible server. Falls back to a straight line when
/// the server fails, so the map always has something to draw.
pub struct OsrmRoutePlanner {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct OsrmResponse {
    code: String,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    geometry: OsrmGeometry,
}

#[derive(Debug, Deserialize)]
struct OsrmGeometry {
    coordinates: Vec<[f64; 2]>, // [lon, lat]
}

impl OsrmRoutePlanner {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch(&self, origin: Coordinate, destination: Coordinate) -> AgentResult<RouteCoords> {
        let url = format!(
            "{}/route/v1/driving/{},{};{},{}?overview=full&geometries=geojson",
            self.base_url, origin.longitude, origin.latitude, destination.longitude, destination.latitude
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(AgentError::HttpClient(format!("route server returned {}", response.status())));
        }

        let body: OsrmResponse = response.json().await?;
        if body.code != "Ok" {
            return Err(AgentError::HttpClient(format!("route server code {}", body.code)));
        }
        let route = body
            .routes
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::HttpClient("route server returned no routes".to_string()))?;

        Ok(parse_geometry(&route.geometry.coordinates))
    }
}

fn parse_geometry(coordinates: &[[f64; 2]]) -> RouteCoords {
    coordinates
        .iter()
        .map(|[lon, lat]| Coordinate::new(*lat, *lon))
        .filter(Coordinate::is_valid)
        .collect::<Vec<_>>()
        .into()
}

#[async_trait]
impl RoutePlanner for OsrmRoutePlanner {
    async fn route(&self, origin: Coordinate, destination: Coordinate) -> AgentResult<RouteCoords> {
        match self.fetch(origin, destination).await {
            Ok(route) if route.len() >= 2 => Ok(route),
            Ok(_) => {
                tracing::warn!("Route server returned a degenerate route, using straight line");
                Ok(RouteCoords::straight_line(origin, destination))
            }
            Err(e) => {
                tracing::warn!("Route fetch failed ({}), using straight line", e);
                Ok(RouteCoords::straight_line(origin, destination))
            }
        }
    }
}

/// Offline planner: origin to destination in one segment.
#[derive(Debug, Default)]
pub struct StraightLinePlanner;

#[async_trait]
impl RoutePlanner for StraightLinePlanner {
    async fn route(&self, origin: Coordinate, destination: Coordinate) -> AgentResult<RouteCoords> {
        Ok(RouteCoords::straight_line(origin, destination))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geojson_pairs_are_lon_lat() {
        let route = parse_geometry(&[[78.38, 17.44], [78.40, 17.43], [500.0, 17.0]]);
        assert_eq!(route.len(), 2);
        assert_eq!(route.points()[0], Coordinate::new(17.44, 78.38));
    }

    #[test]
    fn osrm_body_deserializes() {
        let body: OsrmResponse = serde_json::from_str(
            r#"{"code":"Ok","routes":[{"geometry":{"type":"LineString","coordinates":[[78.38,17.44],[78.47,17.40]]},"distance":9000.0}]}"#,
        )
        .unwrap();
        assert_eq!(body.routes[0].geometry.coordinates.len(), 2);
    }

    #[tokio::test]
    async fn unreachable_server_falls_back_to_straight_line() {
        let planner = OsrmRoutePlanner::new("http://127.0.0.1:9");
        let origin = Coordinate::new(17.44, 78.38);
        let destination = Coordinate::new(17.40, 78.47);
        let route = planner.route(origin, destination).await.unwrap();
        assert_eq!(route, RouteCoords::straight_line(origin, destination));
    }
}
