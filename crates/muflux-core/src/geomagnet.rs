//! Geomagnetic field interface and built-in snapshot.
//!
//! Spherical-harmonic coefficient handling is delegated: the library only
//! commits to the [`GeomagneticModel`] seam and ships a centred-dipole
//! snapshot built from the degree-1 IGRF-13 coefficients, which is what the
//! transport needs to bend trajectories credibly. The per-fluxmeter
//! [`FieldCache`] keeps the last evaluation and only re-evaluates once the
//! particle has moved more than [`GEOMAGNET_CACHE_RADIUS`].

use crate::constants::GEOMAGNET_CACHE_RADIUS;
use crate::coordinates::{ecef_to_geodetic, enu_basis, Enu, Position};

/// Geomagnetic reference radius, in m.
const REFERENCE_RADIUS: f64 = 6371.2e3;

/// A geomagnetic field snapshot.
pub trait GeomagneticModel: Send + Sync {
    /// Field at a geographic position, in T, East-North-Up components.
    fn field(&self, position: &Position) -> Enu;

    /// Lower validity bound in altitude, in m.
    fn height_min(&self) -> f64;

    /// Upper validity bound in altitude, in m.
    fn height_max(&self) -> f64;
}

/// Centred-dipole snapshot.
#[derive(Debug, Clone)]
pub struct Dipole {
    /// Gauss coefficients (g₁⁰, g₁¹, h₁¹), in T.
    g10: f64,
    g11: f64,
    h11: f64,
}

impl Dipole {
    /// A dipole from explicit degree-1 Gauss coefficients, in T.
    pub fn new(g10: f64, g11: f64, h11: f64) -> Self {
        Self { g10, g11, h11 }
    }

    /// The IGRF-13 epoch-2020 dipole.
    pub fn igrf_2020() -> Self {
        Self::new(-29404.8e-9, -1450.9e-9, 4652.5e-9)
    }
}

impl GeomagneticModel for Dipole {
    fn field(&self, position: &Position) -> Enu {
        // Geocentric spherical coordinates of the evaluation point.
        let ecef = crate::coordinates::ecef_from_geodetic(position);
        let r = (ecef[0] * ecef[0] + ecef[1] * ecef[1] + ecef[2] * ecef[2]).sqrt();
        if r <= 0.0 {
            return Enu::default();
        }
        let theta = (ecef[2] / r).acos();
        let phi = ecef[1].atan2(ecef[0]);

        let (sin_t, cos_t) = theta.sin_cos();
        let (sin_p, cos_p) = phi.sin_cos();
        let scale = (REFERENCE_RADIUS / r).powi(3);
        let m = self.g11 * cos_p + self.h11 * sin_p;

        let b_r = 2.0 * scale * (self.g10 * cos_t + m * sin_t);
        let b_theta = scale * (self.g10 * sin_t - m * cos_t);
        let b_phi = scale * (self.g11 * sin_p - self.h11 * cos_p);

        // North = -B_theta, East = B_phi, Up = B_r.
        Enu {
            east: b_phi,
            north: -b_theta,
            upward: b_r,
        }
    }

    fn height_min(&self) -> f64 {
        -1e3
    }

    fn height_max(&self) -> f64 {
        600e3
    }
}

/// Last geomagnetic evaluation of a fluxmeter.
#[derive(Debug, Clone, Default)]
pub struct FieldCache {
    position: [f64; 3],
    field: [f64; 3],
    valid: bool,
}

impl FieldCache {
    /// Drop the cached sample (e.g. after swapping models).
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Field at an ECEF position, in T, re-evaluated only once the sample
    /// point has drifted out of the cache radius.
    pub fn field_at(&mut self, model: &dyn GeomagneticModel, ecef: &[f64; 3]) -> [f64; 3] {
        let d2: f64 = (0..3)
            .map(|i| {
                let d = ecef[i] - self.position[i];
                d * d
            })
            .sum();
        if !self.valid || d2 > GEOMAGNET_CACHE_RADIUS * GEOMAGNET_CACHE_RADIUS {
            let position = ecef_to_geodetic(ecef);
            let enu = model.field(&position);
            let (east, north, up) = enu_basis(position.latitude, position.longitude);
            for i in 0..3 {
                self.field[i] = enu.east * east[i] + enu.north * north[i] + enu.upward * up[i];
            }
            self.position = *ecef;
            self.valid = true;
        }
        self.field
    }
}
