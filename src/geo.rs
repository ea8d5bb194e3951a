//! Great-circle helpers shared by the query engines.

use crate::error::{MapError, MapResult};
use serde::{Deserialize, Serialize};

/// Mean Earth radius used for all distance calculations.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Length of one degree of latitude on the sphere `haversine_meters` measures.
pub const METERS_PER_DEGREE: f64 = EARTH_RADIUS_METERS * std::f64::consts::PI / 180.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        haversine_meters(self, other)
    }

    /// The point `meters` due north along the same meridian.
    pub fn north_by(&self, meters: f64) -> GeoPoint {
        let degrees = (meters / EARTH_RADIUS_METERS).to_degrees();
        GeoPoint::new(self.latitude + degrees, self.longitude)
    }
}

/// Haversine great-circle distance in meters.
pub fn haversine_meters(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
}

/// Rejects non-finite or out-of-range coordinates.
pub fn validate_coordinates(latitude: f64, longitude: f64) -> MapResult<()> {
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err(MapError::invalid(format!(
            "latitude {latitude} outside [-90, 90]"
        )));
    }
    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err(MapError::invalid(format!(
            "longitude {longitude} outside [-180, 180]"
        )));
    }
    Ok(())
}

/// Rejects radii that are not strictly positive finite meters.
pub fn validate_radius(radius_meters: f64) -> MapResult<()> {
    if !radius_meters.is_finite() || radius_meters <= 0.0 {
        return Err(MapError::invalid(format!(
            "radius {radius_meters} must be a positive number of meters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        let sf = GeoPoint::new(37.7749, -122.4194);
        let oakland = GeoPoint::new(37.8044, -122.2712);
        assert_eq!(haversine_meters(&sf, &oakland), haversine_meters(&oakland, &sf));
        assert_eq!(haversine_meters(&sf, &sf), 0.0);
    }

    #[test]
    fn known_distance_is_close() {
        // San Francisco to Oakland is about 13.4 km.
        let sf = GeoPoint::new(37.7749, -122.4194);
        let oakland = GeoPoint::new(37.8044, -122.2712);
        let d = sf.distance_to(&oakland);
        assert!((13_000.0..14_000.0).contains(&d), "distance was {d}");
    }

    #[test]
    fn rejects_bad_coordinates() {
        assert!(validate_coordinates(91.0, 0.0).is_err());
        assert!(validate_coordinates(0.0, -180.5).is_err());
        assert!(validate_coordinates(f64::NAN, 0.0).is_err());
        assert!(validate_coordinates(-90.0, 180.0).is_ok());
        assert!(validate_radius(0.0).is_err());
        assert!(validate_radius(f64::INFINITY).is_err());
    }

    #[test]
    fn degree_length_matches_haversine() {
        let origin = GeoPoint::new(0.0, 0.0);
        let one_north = GeoPoint::new(1.0, 0.0);
        assert!((origin.distance_to(&one_north) - METERS_PER_DEGREE).abs() < 1e-6);
    }
}
