//! Map projections for elevation grids.
//!
//! Two projections cover the supported rasters: the identity geographic
//! mapping (x = longitude, y = latitude) and UTM, implemented as a
//! Krüger-series transverse Mercator over WGS-84 (third order in the third
//! flattening, round-trip accurate to well below 10⁻⁸ deg).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::coordinates::{WGS84_A, WGS84_E2, WGS84_F};
use crate::errors::MufluxError;

/// UTM scale factor on the central meridian.
const UTM_K0: f64 = 0.9996;

/// UTM false easting, in m.
const UTM_FALSE_EASTING: f64 = 500_000.0;

/// UTM false northing of the southern hemisphere, in m.
const UTM_FALSE_NORTHING: f64 = 10_000_000.0;

/// Projection of an elevation grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Projection {
    /// Identity mapping: x is the longitude and y the latitude, in deg.
    Geographic,
    /// Universal Transverse Mercator, zone 1..=60.
    Utm { zone: u8, north: bool },
}

impl Projection {
    /// Map coordinates of a geographic position.
    pub fn project(&self, latitude: f64, longitude: f64) -> (f64, f64) {
        match *self {
            Projection::Geographic => (longitude, latitude),
            Projection::Utm { zone, north } => utm_forward(latitude, longitude, zone, north),
        }
    }

    /// Geographic position of map coordinates, as (latitude, longitude).
    pub fn unproject(&self, x: f64, y: f64) -> (f64, f64) {
        match *self {
            Projection::Geographic => (y, x),
            Projection::Utm { zone, north } => utm_inverse(x, y, zone, north),
        }
    }
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Projection::Geographic => write!(f, "geographic"),
            Projection::Utm { zone, north } => {
                write!(f, "UTM {}{}", zone, if north { 'N' } else { 'S' })
            }
        }
    }
}

impl FromStr for Projection {
    type Err = MufluxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("geographic") {
            return Ok(Projection::Geographic);
        }
        if let Some(rest) = s.strip_prefix("UTM ").or_else(|| s.strip_prefix("utm ")) {
            let rest = rest.trim();
            let (digits, hemisphere) = rest.split_at(rest.len().saturating_sub(1));
            let zone: u8 = digits
                .parse()
                .map_err(|_| MufluxError::Format(format!("bad UTM zone ({rest})")))?;
            if !(1..=60).contains(&zone) {
                return Err(MufluxError::Format(format!("bad UTM zone ({zone})")));
            }
            let north = match hemisphere {
                "N" | "n" => true,
                "S" | "s" => false,
                _ => {
                    return Err(MufluxError::Format(format!(
                        "bad UTM hemisphere ({hemisphere})"
                    )))
                }
            };
            return Ok(Projection::Utm { zone, north });
        }
        Err(MufluxError::Format(format!("unknown projection ({s})")))
    }
}

/// Third flattening of the ellipsoid.
fn third_flattening() -> f64 {
    WGS84_F / (2.0 - WGS84_F)
}

/// Rectifying radius of the Krüger series.
fn rectifying_radius(n: f64) -> f64 {
    WGS84_A / (1.0 + n) * (1.0 + n * n / 4.0 + n.powi(4) / 64.0)
}

fn alpha_coefficients(n: f64) -> [f64; 3] {
    [
        n / 2.0 - 2.0 * n * n / 3.0 + 5.0 * n.powi(3) / 16.0,
        13.0 * n * n / 48.0 - 3.0 * n.powi(3) / 5.0,
        61.0 * n.powi(3) / 240.0,
    ]
}

fn beta_coefficients(n: f64) -> [f64; 3] {
    [
        n / 2.0 - 2.0 * n * n / 3.0 + 37.0 * n.powi(3) / 96.0,
        n * n / 48.0 + n.powi(3) / 15.0,
        17.0 * n.powi(3) / 480.0,
    ]
}

fn central_meridian(zone: u8) -> f64 {
    f64::from(zone) * 6.0 - 183.0
}

fn utm_forward(latitude: f64, longitude: f64, zone: u8, north: bool) -> (f64, f64) {
    let n = third_flattening();
    let a_rect = rectifying_radius(n);
    let alpha = alpha_coefficients(n);
    let e = WGS84_E2.sqrt();

    let phi = latitude.to_radians();
    let dlon = (longitude - central_meridian(zone)).to_radians();

    let sin_phi = phi.sin();
    let t = (sin_phi.atanh() - e * (e * sin_phi).atanh()).sinh();
    let (sin_dlon, cos_dlon) = dlon.sin_cos();
    let xi_p = t.atan2(cos_dlon);
    let eta_p = (sin_dlon / (t * t + cos_dlon * cos_dlon).sqrt()).asinh();

    let mut xi = xi_p;
    let mut eta = eta_p;
    for (j, a) in alpha.iter().enumerate() {
        let k = 2.0 * (j + 1) as f64;
        xi += a * (k * xi_p).sin() * (k * eta_p).cosh();
        eta += a * (k * xi_p).cos() * (k * eta_p).sinh();
    }

    let x = UTM_FALSE_EASTING + UTM_K0 * a_rect * eta;
    let false_northing = if north { 0.0 } else { UTM_FALSE_NORTHING };
    let y = false_northing + UTM_K0 * a_rect * xi;
    (x, y)
}

fn utm_inverse(x: f64, y: f64, zone: u8, north: bool) -> (f64, f64) {
    let n = third_flattening();
    let a_rect = rectifying_radius(n);
    let beta = beta_coefficients(n);
    let e = WGS84_E2.sqrt();

    let false_northing = if north { 0.0 } else { UTM_FALSE_NORTHING };
    let xi = (y - false_northing) / (UTM_K0 * a_rect);
    let eta = (x - UTM_FALSE_EASTING) / (UTM_K0 * a_rect);

    let mut xi_p = xi;
    let mut eta_p = eta;
    for (j, b) in beta.iter().enumerate() {
        let k = 2.0 * (j + 1) as f64;
        xi_p -= b * (k * xi).sin() * (k * eta).cosh();
        eta_p -= b * (k * xi).cos() * (k * eta).sinh();
    }

    let sinh_eta = eta_p.sinh();
    let (sin_xi, cos_xi) = xi_p.sin_cos();
    let tau_p = sin_xi / (sinh_eta * sinh_eta + cos_xi * cos_xi).sqrt();
    let dlon = sinh_eta.atan2(cos_xi);

    // Invert the conformal latitude by Newton iterations on
    // τ'(φ) = sinh(atanh(sin φ) − e·atanh(e·sin φ)).
    let mut phi = tau_p.atan();
    for _ in 0..5 {
        let sin_phi = phi.sin();
        let cos_phi = phi.cos();
        let u = sin_phi.atanh() - e * (e * sin_phi).atanh();
        let f = u.sinh() - tau_p;
        let du = 1.0 / cos_phi - WGS84_E2 * cos_phi / (1.0 - WGS84_E2 * sin_phi * sin_phi);
        let df = u.cosh() * du;
        if df == 0.0 {
            break;
        }
        phi -= f / df;
    }

    let latitude = phi.to_degrees();
    let longitude = central_meridian(zone) + dlon.to_degrees();
    (latitude, longitude)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    #[test]
    fn geographic_is_the_identity() {
        let p = Projection::Geographic;
        assert_eq!(p.project(45.5, 3.25), (3.25, 45.5));
        assert_eq!(p.unproject(3.25, 45.5), (45.5, 3.25));
    }

    #[test]
    fn utm_round_trip_below_1e8_degrees() {
        let p = Projection::Utm {
            zone: 31,
            north: true,
        };
        for &(lat, lon) in &[
            (45.762, 2.9616),
            (43.5, 0.5),
            (50.1, 5.9),
            (36.0, 3.0),
            (60.0, 1.0),
        ] {
            let (x, y) = p.project(lat, lon);
            let (lat2, lon2) = p.unproject(x, y);
            assert_abs_diff_eq!(lat2, lat, epsilon = 1e-8);
            assert_abs_diff_eq!(lon2, lon, epsilon = 1e-8);
        }
    }

    #[test]
    fn utm_southern_hemisphere_offsets_northing() {
        let p = Projection::Utm {
            zone: 19,
            north: false,
        };
        let (x, y) = p.project(-33.45, -70.66);
        assert!(y > 0.0 && y < UTM_FALSE_NORTHING);
        assert!(x > 0.0);
        let (lat, lon) = p.unproject(x, y);
        assert_abs_diff_eq!(lat, -33.45, epsilon = 1e-8);
        assert_abs_diff_eq!(lon, -70.66, epsilon = 1e-8);
    }

    #[test]
    fn utm_scale_on_central_meridian() {
        // On the central meridian the easting is the false easting and the
        // northing approximates k0 times the meridian arc.
        let p = Projection::Utm {
            zone: 31,
            north: true,
        };
        let (x, y) = p.project(45.0, 3.0);
        assert_relative_eq!(x, UTM_FALSE_EASTING, max_relative = 1e-12);
        assert_relative_eq!(y, 4_982_950.4, max_relative = 1e-4);
    }

    #[test]
    fn parses_display_form() {
        let p: Projection = "UTM 31N".parse().unwrap();
        assert_eq!(
            p,
            Projection::Utm {
                zone: 31,
                north: true
            }
        );
        assert_eq!(p.to_string(), "UTM 31N");
        assert!("UTM 0N".parse::<Projection>().is_err());
        assert!("lambert".parse::<Projection>().is_err());
        let g: Projection = "geographic".parse().unwrap();
        assert_eq!(g, Projection::Geographic);
    }
}
