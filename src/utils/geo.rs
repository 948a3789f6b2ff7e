// src/utils/geo.rs
use crate::models::location::Coordinate;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres.
pub fn haversine_km(a: Coordinate, b: Coordinate) -> f64 {
    let lat1_rad = a.latitude.to_radians();
    let lat2_rad = b.latitude.to_radians();
    let delta_lat = (b.latitude - a.latitude).to_radians();
    let delta_lon = (b.longitude - a.longitude).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_KM * c
}

pub fn haversine_m(a: Coordinate, b: Coordinate) -> f64 {
    haversine_km(a, b) * 1000.0
}

/// Index of the route point closest to `position`, with its distance in metres.
pub fn nearest_index(position: Coordinate, route: &[Coordinate]) -> Option<(usize, f64)> {
    route
        .iter()
        .enumerate()
        .map(|(i, point)| (i, haversine_m(position, *point)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

/// Distance in metres from `position` to the segment `a`-`b`.
///
/// Uses a local equirectangular projection around `position`, which is
/// accurate at route-deviation scales.
pub fn distance_to_segment_m(position: Coordinate, a: Coordinate, b: Coordinate) -> f64 {
    let scale = position.latitude.to_radians().cos();
    let project = |c: Coordinate| {
        (
            (c.longitude - position.longitude) * scale,
            c.latitude - position.latitude,
        )
    };
    let (ax, ay) = project(a);
    let (bx, by) = project(b);
    let (dx, dy) = (bx - ax, by - ay);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq == 0.0 {
        0.0
    } else {
        (-(ax * dx + ay * dy) / len_sq).clamp(0.0, 1.0)
    };
    let foot = Coordinate::new(a.latitude + t * (b.latitude - a.latitude), a.longitude + t * (b.longitude - a.longitude));
    haversine_m(position, foot)
}

/// Distance in metres from `position` to the nearest point of the polyline.
pub fn distance_to_polyline_m(position: Coordinate, route: &[Coordinate]) -> Option<f64> {
    match route {
        [] => None,
        [only] => Some(haversine_m(position, *only)),
        _ => route
            .windows(2)
            .map(|pair| distance_to_segment_m(position, pair[0], pair[1]))
            .min_by(|a, b| a.total_cmp(b)),
    }
}
