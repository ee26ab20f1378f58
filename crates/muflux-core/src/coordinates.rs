//! Geographic, horizontal and ECEF coordinates over the WGS-84 ellipsoid.
//!
//! Angles are in degrees at this boundary; trigonometry is done in radians
//! internally. Directions follow the observation convention documented on
//! [`Direction`]: the fluxmeter negates them into propagation directions
//! before driving the transport engine.

use serde::{Deserialize, Serialize};

/// WGS-84 semi-major axis, in m.
pub const WGS84_A: f64 = 6378137.0;

/// WGS-84 flattening.
pub const WGS84_F: f64 = 1.0 / 298.257223563;

/// WGS-84 first eccentricity squared.
pub const WGS84_E2: f64 = WGS84_F * (2.0 - WGS84_F);

/// Geographic position (GPS-like).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude, in deg.
    pub latitude: f64,
    /// Longitude, in deg.
    pub longitude: f64,
    /// Height above the ellipsoid, in m.
    pub height: f64,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64, height: f64) -> Self {
        Self {
            latitude,
            longitude,
            height,
        }
    }
}

/// Observation direction, in horizontal coordinates.
///
/// This is the direction the observer looks at, i.e. the *negation* of the
/// muon propagation direction at the observation point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Direction {
    /// Azimuth w.r.t. geographic North, clockwise towards East, in deg.
    pub azimuth: f64,
    /// Elevation w.r.t. the local horizontal, in deg.
    pub elevation: f64,
}

impl Direction {
    pub fn new(azimuth: f64, elevation: f64) -> Self {
        Self { azimuth, elevation }
    }
}

/// East, North, Upward components of a local vector.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Enu {
    pub east: f64,
    pub north: f64,
    pub upward: f64,
}

/// Geodetic to ECEF conversion.
pub fn ecef_from_geodetic(position: &Position) -> [f64; 3] {
    let lat = position.latitude.to_radians();
    let lon = position.longitude.to_radians();
    let (sin_lat, cos_lat) = lat.sin_cos();
    let (sin_lon, cos_lon) = lon.sin_cos();
    let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();
    [
        (n + position.height) * cos_lat * cos_lon,
        (n + position.height) * cos_lat * sin_lon,
        (n * (1.0 - WGS84_E2) + position.height) * sin_lat,
    ]
}

/// ECEF to geodetic conversion (Bowring's start, fixed-point polish).
pub fn ecef_to_geodetic(ecef: &[f64; 3]) -> Position {
    let [x, y, z] = *ecef;
    let longitude = y.atan2(x).to_degrees();
    let p = (x * x + y * y).sqrt();

    let b = WGS84_A * (1.0 - WGS84_F);
    let ep2 = WGS84_E2 / (1.0 - WGS84_E2);
    let theta = (z * WGS84_A).atan2(p * b);
    let (sin_t, cos_t) = theta.sin_cos();
    let mut lat = (z + ep2 * b * sin_t.powi(3)).atan2(p - WGS84_E2 * WGS84_A * cos_t.powi(3));

    for _ in 0..3 {
        let sin_lat = lat.sin();
        let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();
        lat = (z + WGS84_E2 * n * sin_lat).atan2(p);
    }

    let (sin_lat, cos_lat) = lat.sin_cos();
    let w = (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();
    let height = p * cos_lat + z * sin_lat - WGS84_A * w;

    Position {
        latitude: lat.to_degrees(),
        longitude,
        height,
    }
}

/// Local East, North, Up unit vectors in ECEF coordinates.
pub fn enu_basis(latitude: f64, longitude: f64) -> ([f64; 3], [f64; 3], [f64; 3]) {
    let lat = latitude.to_radians();
    let lon = longitude.to_radians();
    let (sin_lat, cos_lat) = lat.sin_cos();
    let (sin_lon, cos_lon) = lon.sin_cos();
    let east = [-sin_lon, cos_lon, 0.0];
    let north = [-sin_lat * cos_lon, -sin_lat * sin_lon, cos_lat];
    let up = [cos_lat * cos_lon, cos_lat * sin_lon, sin_lat];
    (east, north, up)
}

/// Unit ECEF vector of a horizontal direction at a location.
pub fn ecef_from_horizontal(
    latitude: f64,
    longitude: f64,
    azimuth: f64,
    elevation: f64,
) -> [f64; 3] {
    let (east, north, up) = enu_basis(latitude, longitude);
    let az = azimuth.to_radians();
    let el = elevation.to_radians();
    let (sin_az, cos_az) = az.sin_cos();
    let (sin_el, cos_el) = el.sin_cos();
    let mut out = [0.0; 3];
    for i in 0..3 {
        out[i] = cos_el * (sin_az * east[i] + cos_az * north[i]) + sin_el * up[i];
    }
    out
}

/// Horizontal coordinates of an ECEF direction at a location.
pub fn ecef_to_horizontal(latitude: f64, longitude: f64, direction: &[f64; 3]) -> Direction {
    let (east, north, up) = enu_basis(latitude, longitude);
    let dot = |a: &[f64; 3]| a[0] * direction[0] + a[1] * direction[1] + a[2] * direction[2];
    let e = dot(&east);
    let n = dot(&north);
    let u = dot(&up).clamp(-1.0, 1.0);
    Direction {
        azimuth: e.atan2(n).to_degrees(),
        elevation: u.asin().to_degrees(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    #[test]
    fn geodetic_round_trip() {
        let samples = [
            Position::new(0.0, 0.0, 0.0),
            Position::new(45.762, 2.9616, 1086.0),
            Position::new(-33.45, -70.66, 520.0),
            Position::new(78.92, 11.93, -250.0),
            Position::new(-0.001, 179.999, 100e3),
        ];
        for position in samples {
            let ecef = ecef_from_geodetic(&position);
            let back = ecef_to_geodetic(&ecef);
            assert_abs_diff_eq!(back.latitude, position.latitude, epsilon = 1e-9);
            assert_abs_diff_eq!(back.longitude, position.longitude, epsilon = 1e-9);
            assert_abs_diff_eq!(back.height, position.height, epsilon = 1e-6);
        }
    }

    #[test]
    fn poles_keep_their_height() {
        let pole = Position::new(90.0, 0.0, 1000.0);
        let ecef = ecef_from_geodetic(&pole);
        let back = ecef_to_geodetic(&ecef);
        assert_abs_diff_eq!(back.latitude, 90.0, epsilon = 1e-9);
        assert_abs_diff_eq!(back.height, 1000.0, epsilon = 1e-6);
    }

    #[test]
    fn horizontal_round_trip() {
        let (lat, lon) = (45.0, 3.0);
        for &(az, el) in &[
            (0.0, 90.0),
            (0.0, 45.0),
            (90.0, 10.0),
            (-120.0, -35.0),
            (179.0, 0.5),
        ] {
            let dir = ecef_from_horizontal(lat, lon, az, el);
            let norm: f64 = dir.iter().map(|x| x * x).sum();
            assert_relative_eq!(norm, 1.0, max_relative = 1e-12);
            let back = ecef_to_horizontal(lat, lon, &dir);
            assert_abs_diff_eq!(back.elevation, el, epsilon = 1e-9);
            if el < 90.0 {
                assert_abs_diff_eq!(back.azimuth, az, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn zenith_is_the_local_up() {
        let (_, _, up) = enu_basis(12.0, 34.0);
        let dir = ecef_from_horizontal(12.0, 34.0, 123.0, 90.0);
        for i in 0..3 {
            assert_abs_diff_eq!(dir[i], up[i], epsilon = 1e-12);
        }
    }
}
