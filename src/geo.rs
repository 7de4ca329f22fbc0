// src/geo.rs
//
// Great-circle distance on a spherical Earth

use serde::{Deserialize, Serialize};

/// Mean Earth radius used by the haversine formula, in meters
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Length of one degree of arc on the haversine sphere (~111,194.93 m)
pub const METERS_PER_DEGREE: f64 = 2.0 * std::f64::consts::PI * EARTH_RADIUS_METERS / 360.0;

/// A bare latitude/longitude pair in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub latitude: f64,
    pub longitude: f64,
}

impl LatLon {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Anything that can be placed on the globe
pub trait HasLatLon {
    fn lat_lon(&self) -> LatLon;
}

impl HasLatLon for LatLon {
    fn lat_lon(&self) -> LatLon {
        *self
    }
}

/// Calculate the Haversine distance between two points in meters
///
/// Inputs are not validated. Coordinates outside the degree ranges still
/// run through the trigonometry and yield a number with no geographic
/// meaning; NaN inputs yield NaN.
pub fn calculate_haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    // Convert degrees to radians
    let lat1_rad = lat1.to_radians();
    let lon1_rad = lon1.to_radians();
    let lat2_rad = lat2.to_radians();
    let lon2_rad = lon2.to_radians();

    let dlat = lat2_rad - lat1_rad;
    let dlon = lon2_rad - lon1_rad;

    let a =
        (dlat / 2.0).sin().powi(2) + lat1_rad.cos() * lat2_rad.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_METERS * c
}

/// Distance in meters between any two located values
pub fn distance<A: HasLatLon + ?Sized, B: HasLatLon + ?Sized>(a: &A, b: &B) -> f64 {
    let a = a.lat_lon();
    let b = b.lat_lon();
    calculate_haversine_distance(a.latitude, a.longitude, b.latitude, b.longitude)
}

pub fn degrees_to_meters(degrees: f64) -> f64 {
    degrees * METERS_PER_DEGREE
}

pub fn meters_to_degrees(meters: f64) -> f64 {
    meters / METERS_PER_DEGREE
}
