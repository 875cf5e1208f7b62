//! Great-circle distance and fixed-point coordinate helpers
//!
//! Coordinates cross the ledger boundary as signed integers at scale 10^7
//! degrees; the HTTP surface speaks decimal degrees. All distance checks in
//! the pipeline (GNSS position cross-check, event proximity, aerial drop
//! tolerance) use the haversine formula with a spherical Earth.

/// Mean Earth radius in metres
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Fixed-point coordinate scale (degrees x 10^7)
pub const COORD_SCALE: f64 = 10_000_000.0;

/// Convert decimal degrees to the on-ledger fixed-point representation
pub fn to_e7(degrees: f64) -> i64 {
    (degrees * COORD_SCALE).round() as i64
}

/// Convert the on-ledger fixed-point representation to decimal degrees
pub fn from_e7(value: i64) -> f64 {
    value as f64 / COORD_SCALE
}

/// Haversine great-circle distance in metres between two points in degrees
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lng2 - lng1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Haversine distance in metres between two fixed-point coordinate pairs
pub fn haversine_e7_m(lat1_e7: i64, lng1_e7: i64, lat2_e7: i64, lng2_e7: i64) -> f64 {
    haversine_m(
        from_e7(lat1_e7),
        from_e7(lng1_e7),
        from_e7(lat2_e7),
        from_e7(lng2_e7),
    )
}

/// Haversine distance in kilometres between two points in degrees
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    haversine_m(lat1, lng1, lat2, lng2) / 1000.0
}

/// Basic range check for decimal-degree coordinates
pub fn is_valid_coordinate(lat: f64, lng: f64) -> bool {
    lat.is_finite() && lng.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng)
}
