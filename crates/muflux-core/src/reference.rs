//! Opensky reference fluxes.
//!
//! The reference flux is what backward transport samples once a muon has
//! been carried up to the reference altitude: the differential flux of
//! atmospheric muons in the absence of topography, in
//! GeV⁻¹·m⁻²·s⁻¹·sr⁻¹, together with its charge asymmetry
//! (φ(μ⁺) − φ(μ⁻)) / (φ(μ⁺) + φ(μ⁻)).
//!
//! Two models are provided: the Gaisser/Guan sea-level parameterisation
//! ([`GcclyReference`]) and packed tables interpolated tri-linearly
//! ([`ReferenceTable`]).

use std::io::Read;
use std::path::Path;

use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::constants::{CHARGE_RATIO, MUON_MASS};
use crate::errors::{MufluxError, MufluxResult};

/// A flux value and its charge asymmetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Flux {
    /// Differential flux, in GeV⁻¹·m⁻²·s⁻¹·sr⁻¹.
    pub value: f64,
    /// Charge asymmetry, dimensionless.
    pub asymmetry: f64,
}

/// An opensky reference flux model.
pub trait ReferenceFlux: Send + Sync {
    /// Lower edge of the kinetic-energy support, in GeV.
    fn energy_min(&self) -> f64;
    /// Upper edge of the kinetic-energy support, in GeV.
    fn energy_max(&self) -> f64;
    /// Lower edge of the altitude support, in m.
    fn height_min(&self) -> f64;
    /// Upper edge of the altitude support, in m.
    fn height_max(&self) -> f64;
    /// Flux at an altitude (m), observation elevation (deg) and kinetic
    /// energy (GeV). Out of support, the flux is zero.
    fn flux(&self, height: f64, elevation: f64, kinetic_energy: f64) -> Flux;
}

/// Gaisser's sea-level flux, in GeV⁻¹·m⁻²·s⁻¹·sr⁻¹ (PDG ch. 30).
fn flux_gaisser(cos_theta: f64, kinetic_energy: f64) -> f64 {
    if cos_theta < 0.0 {
        return 0.0;
    }
    let e_mu = kinetic_energy + MUON_MASS;
    let ec = 1.1 * e_mu * cos_theta;
    let r_pi = 1.0 + ec / 115.0;
    let r_k = 1.0 + ec / 850.0;
    1.4e3 * e_mu.powf(-2.7) * (1.0 / r_pi + 0.054 / r_k)
}

/// Volkova's cos(θ*) parameterisation of the Earth curvature, relevant for
/// close to horizontal trajectories.
fn cos_theta_star(cos_theta: f64) -> f64 {
    const P: [f64; 5] = [0.102573, -0.068287, 0.958633, 0.0407253, 0.817285];
    let cs2 = (cos_theta * cos_theta
        + P[0] * P[0]
        + P[1] * cos_theta.powf(P[2])
        + P[3] * cos_theta.powf(P[4]))
        / (1.0 + P[0] * P[0] + P[1] + P[3]);
    if cs2 > 0.0 {
        cs2.sqrt()
    } else {
        0.0
    }
}

/// Guan et al. parameterisation of the sea-level muon flux
/// (arXiv:1509.06176).
fn flux_gccly(cos_theta: f64, kinetic_energy: f64) -> f64 {
    let e_mu = kinetic_energy + MUON_MASS;
    let cs = cos_theta_star(cos_theta);
    (1.0 + 3.64 / (e_mu * cs.powf(1.29))).powf(-2.7) * flux_gaisser(cs, kinetic_energy)
}

/// Fraction of the flux carried by anti-muons, from the CMS charge ratio.
fn antimuon_fraction() -> f64 {
    CHARGE_RATIO / (1.0 + CHARGE_RATIO)
}

/// The default reference: Gaisser core with Volkova curvature and Guan
/// low-energy corrections, constant charge asymmetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcclyReference {
    energy: [f64; 2],
    height: [f64; 2],
}

impl Default for GcclyReference {
    fn default() -> Self {
        Self {
            energy: [1e-4, 1e21],
            height: [0.0, 0.0],
        }
    }
}

impl GcclyReference {
    pub fn new() -> Self {
        Self::default()
    }

    /// The same parameterisation declared valid over an altitude band.
    pub fn with_height_range(height_min: f64, height_max: f64) -> Self {
        Self {
            height: [height_min, height_max],
            ..Self::default()
        }
    }

    pub fn set_height_range(&mut self, height_min: f64, height_max: f64) {
        self.height = [height_min, height_max];
    }

    pub fn set_energy_range(&mut self, energy_min: f64, energy_max: f64) {
        self.energy = [energy_min, energy_max];
    }
}

impl ReferenceFlux for GcclyReference {
    fn energy_min(&self) -> f64 {
        self.energy[0]
    }

    fn energy_max(&self) -> f64 {
        self.energy[1]
    }

    fn height_min(&self) -> f64 {
        self.height[0]
    }

    fn height_max(&self) -> f64 {
        self.height[1]
    }

    fn flux(&self, height: f64, elevation: f64, kinetic_energy: f64) -> Flux {
        if height < self.height[0] || height > self.height[1] {
            return Flux::default();
        }
        let cos_theta = ((90.0 - elevation).to_radians()).cos();
        Flux {
            value: flux_gccly(cos_theta, kinetic_energy),
            asymmetry: 2.0 * antimuon_fraction() - 1.0,
        }
    }
}

/// A tabulated reference flux.
///
/// The packed layout stores two single-precision values (muon, anti-muon)
/// per node of a (energy × cos θ × altitude) grid, energy fastest. Energy is
/// log-spaced; cos θ and altitude are linear. A single altitude slab
/// (`n_h = 1`) makes the table altitude independent.
#[derive(Debug, Clone)]
pub struct ReferenceTable {
    n_k: usize,
    n_c: usize,
    n_h: usize,
    k: [f64; 2],
    c: [f64; 2],
    h: [f64; 2],
    /// Indexed as `[ih, ic, ik, component]`.
    data: Array4<f32>,
}

impl ReferenceTable {
    /// Build a table from its grids and packed data.
    pub fn from_parts(
        shape: (usize, usize, usize),
        energy: [f64; 2],
        cos_theta: [f64; 2],
        height: [f64; 2],
        data: Vec<f32>,
    ) -> MufluxResult<Self> {
        let (n_k, n_c, n_h) = shape;
        if n_k < 2 || n_c < 2 || n_h < 1 {
            return Err(MufluxError::Format(format!(
                "bad table shape ({n_k} x {n_c} x {n_h})"
            )));
        }
        if !(energy[0] > 0.0) || !(energy[1] > energy[0]) {
            return Err(MufluxError::Format("bad energy grid".to_string()));
        }
        if !(cos_theta[1] > cos_theta[0]) {
            return Err(MufluxError::Format("bad cos(theta) grid".to_string()));
        }
        if n_h > 1 && !(height[1] > height[0]) {
            return Err(MufluxError::Format("bad altitude grid".to_string()));
        }
        let expected = 2 * n_k * n_c * n_h;
        if data.len() != expected {
            return Err(MufluxError::Format(format!(
                "bad table size (expected {expected} values, found {})",
                data.len()
            )));
        }
        let data = Array4::from_shape_vec((n_h, n_c, n_k, 2), data)
            .map_err(|err| MufluxError::Format(err.to_string()))?;
        Ok(Self {
            n_k,
            n_c,
            n_h,
            k: energy,
            c: cos_theta,
            h: height,
            data,
        })
    }

    /// Load a packed table.
    ///
    /// Wire format, little-endian: three signed 64-bit integers (n_k, n_c,
    /// n_h), six doubles (k_min, k_max, c_min, c_max, h_min, h_max), then
    /// 2·n_k·n_c·n_h single-precision floats with energy as the fastest
    /// axis and the muon component first in each pair.
    pub fn from_file<P: AsRef<Path>>(path: P) -> MufluxResult<Self> {
        let path = path.as_ref();
        let mut file = std::fs::File::open(path).map_err(|source| MufluxError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let bad_format = |why: &str| {
            MufluxError::Format(format!("{} ({})", why, path.display()))
        };

        let mut header = [0u8; 3 * 8 + 6 * 8];
        file.read_exact(&mut header)
            .map_err(|_| bad_format("truncated header"))?;

        let mut shape = [0i64; 3];
        for (i, chunk) in header[..24].chunks_exact(8).enumerate() {
            shape[i] = i64::from_le_bytes(chunk.try_into().expect("8-byte chunk"));
        }
        let mut range = [0f64; 6];
        for (i, chunk) in header[24..].chunks_exact(8).enumerate() {
            range[i] = f64::from_le_bytes(chunk.try_into().expect("8-byte chunk"));
        }

        if shape.iter().any(|&n| n <= 0 || n > 100_000_000) {
            return Err(bad_format("bad shape"));
        }
        let (n_k, n_c, n_h) = (shape[0] as usize, shape[1] as usize, shape[2] as usize);

        let size = 2 * n_k * n_c * n_h;
        let mut body = vec![0u8; size * 4];
        file.read_exact(&mut body)
            .map_err(|_| bad_format("truncated body"))?;
        let data: Vec<f32> = body
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes(chunk.try_into().expect("4-byte chunk")))
            .collect();

        let table = Self::from_parts(
            (n_k, n_c, n_h),
            [range[0], range[1]],
            [range[2], range[3]],
            [range[4], range[5]],
            data,
        )
        .map_err(|err| match err {
            MufluxError::Format(why) => MufluxError::Format(format!("{why} ({})", path.display())),
            other => other,
        })?;
        tracing::debug!(
            target: "muflux",
            path = %path.display(),
            n_k, n_c, n_h,
            "loaded reference table"
        );
        Ok(table)
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.n_k, self.n_c, self.n_h)
    }
}

/// Interpolate one axis, log-linearly when both endpoints are positive.
fn log_or_linear(g0: f64, g1: f64, t: f64) -> f64 {
    if g0 <= 0.0 || g1 <= 0.0 {
        g0 * (1.0 - t) + g1 * t
    } else {
        (g0.ln() * (1.0 - t) + g1.ln() * t).exp()
    }
}

impl ReferenceFlux for ReferenceTable {
    fn energy_min(&self) -> f64 {
        self.k[0]
    }

    fn energy_max(&self) -> f64 {
        self.k[1]
    }

    fn height_min(&self) -> f64 {
        self.h[0]
    }

    fn height_max(&self) -> f64 {
        self.h[1]
    }

    fn flux(&self, height: f64, elevation: f64, kinetic_energy: f64) -> Flux {
        let zero = Flux::default();

        let dlk = (self.k[1] / self.k[0]).ln() / (self.n_k - 1) as f64;
        let mut hk = (kinetic_energy / self.k[0]).ln() / dlk;
        if !(0.0..=(self.n_k - 1) as f64).contains(&hk) {
            return zero;
        }
        let ik = (hk as usize).min(self.n_k - 1);
        hk -= ik as f64;

        let cos_theta = ((90.0 - elevation).to_radians()).cos();
        let dc = (self.c[1] - self.c[0]) / (self.n_c - 1) as f64;
        let mut hc = (cos_theta - self.c[0]) / dc;
        if !(0.0..=(self.n_c - 1) as f64).contains(&hc) {
            return zero;
        }
        let ic = (hc as usize).min(self.n_c - 1);
        hc -= ic as f64;

        let (ih, hh) = if self.n_h > 1 {
            let dh = (self.h[1] - self.h[0]) / (self.n_h - 1) as f64;
            let mut hh = (height - self.h[0]) / dh;
            if !(0.0..=(self.n_h - 1) as f64).contains(&hh) {
                return zero;
            }
            let ih = (hh as usize).min(self.n_h - 1);
            hh -= ih as f64;
            (ih, hh)
        } else {
            (0, 0.0)
        };

        let ik1 = (ik + 1).min(self.n_k - 1);
        let ic1 = (ic + 1).min(self.n_c - 1);
        let ih1 = (ih + 1).min(self.n_h - 1);

        let mut flux = [0.0; 2];
        for (i, out) in flux.iter_mut().enumerate() {
            let f = |ih: usize, ic: usize, ik: usize| f64::from(self.data[[ih, ic, ik, i]]);

            // Linear along cos(theta).
            let g00 = f(ih, ic, ik) * (1.0 - hc) + f(ih, ic1, ik) * hc;
            let g10 = f(ih, ic, ik1) * (1.0 - hc) + f(ih, ic1, ik1) * hc;
            let g01 = f(ih1, ic, ik) * (1.0 - hc) + f(ih1, ic1, ik) * hc;
            let g11 = f(ih1, ic, ik1) * (1.0 - hc) + f(ih1, ic1, ik1) * hc;

            // Log-linear along energy, then altitude.
            let g0 = log_or_linear(g00, g10, hk);
            let g1 = log_or_linear(g01, g11, hk);
            *out = log_or_linear(g0, g1, hh);
        }

        let total = flux[0] + flux[1];
        if total > 0.0 {
            Flux {
                value: total,
                asymmetry: (flux[0] - flux[1]) / total,
            }
        } else {
            Flux::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    #[test]
    fn default_reference_matches_the_parameterisation() {
        let reference = GcclyReference::default();
        let k = 10.0;
        let elevation = 60.0;
        let flux = reference.flux(0.0, elevation, k);

        let cos_theta = ((90.0 - elevation) as f64).to_radians().cos();
        let e_mu = k + MUON_MASS;
        let cs = cos_theta_star(cos_theta);
        let ec = 1.1 * e_mu * cs;
        let gaisser = 1.4e3
            * e_mu.powf(-2.7)
            * (1.0 / (1.0 + ec / 115.0) + 0.054 / (1.0 + ec / 850.0));
        let expected = (1.0 + 3.64 / (e_mu * cs.powf(1.29))).powf(-2.7) * gaisser;
        assert_relative_eq!(flux.value, expected, max_relative = 1e-15);
    }

    #[test]
    fn default_asymmetry_is_the_cms_charge_ratio() {
        let reference = GcclyReference::default();
        let expected = 2.0 * CHARGE_RATIO / (1.0 + CHARGE_RATIO) - 1.0;
        for &(elevation, k) in &[(90.0, 1.0), (45.0, 10.0), (5.0, 100.0)] {
            let flux = reference.flux(0.0, elevation, k);
            assert!(flux.value > 0.0);
            assert_relative_eq!(flux.asymmetry, expected, max_relative = 1e-15);
        }
        assert_abs_diff_eq!(expected, 0.121541, epsilon = 1e-6);
    }

    #[test]
    fn out_of_support_is_zero() {
        let reference = GcclyReference::default();
        assert_eq!(reference.flux(100.0, 45.0, 1.0), Flux::default());
        // Below the horizon the Gaisser core vanishes.
        let below = reference.flux(0.0, -30.0, 1.0);
        assert_eq!(below.value, 0.0);
    }

    #[test]
    fn curvature_correction_stays_in_range() {
        assert_relative_eq!(cos_theta_star(1.0), 1.0, max_relative = 1e-2);
        let at_horizon = cos_theta_star(0.0);
        assert!(at_horizon > 0.0 && at_horizon < 0.2);
    }

    fn single_slab_table() -> ReferenceTable {
        // 2 energies x 2 angles x 1 altitude, distinct positive values.
        let data = vec![
            1.0, 0.5, // (k0, c0)
            2.0, 1.0, // (k1, c0)
            3.0, 1.5, // (k0, c1)
            4.0, 2.0, // (k1, c1)
        ];
        ReferenceTable::from_parts((2, 2, 1), [1.0, 100.0], [0.0, 1.0], [0.0, 0.0], data)
            .unwrap()
    }

    #[test]
    fn table_vertices_are_reproduced_exactly() {
        let table = single_slab_table();
        // (k_min, c_max) is the third pair: elevation 90 deg has cos = 1.
        let flux = table.flux(0.0, 90.0, 1.0);
        assert_relative_eq!(flux.value, 4.5, max_relative = 1e-12);
        assert_relative_eq!(flux.asymmetry, 1.5 / 4.5, max_relative = 1e-12);

        let flux = table.flux(0.0, 90.0, 100.0);
        assert_relative_eq!(flux.value, 6.0, max_relative = 1e-12);
    }

    #[test]
    fn energy_interpolation_is_log_linear_for_positive_nodes() {
        let table = single_slab_table();
        // Halfway in log energy between 1 and 100 GeV.
        let flux = table.flux(0.0, 90.0, 10.0);
        let mu = (3.0f64.ln() * 0.5 + 4.0f64.ln() * 0.5).exp();
        let anti = (1.5f64.ln() * 0.5 + 2.0f64.ln() * 0.5).exp();
        assert_relative_eq!(flux.value, mu + anti, max_relative = 1e-6);
    }

    #[test]
    fn out_of_grid_requests_are_zero() {
        let table = single_slab_table();
        assert_eq!(table.flux(0.0, 90.0, 0.5), Flux::default());
        assert_eq!(table.flux(0.0, 90.0, 200.0), Flux::default());
        assert_eq!(table.flux(0.0, -10.0, 10.0), Flux::default());
    }

    #[test]
    fn from_parts_validates_the_shape() {
        assert!(matches!(
            ReferenceTable::from_parts((1, 2, 1), [1.0, 10.0], [0.0, 1.0], [0.0, 0.0], vec![]),
            Err(MufluxError::Format(_))
        ));
        assert!(matches!(
            ReferenceTable::from_parts(
                (2, 2, 1),
                [1.0, 10.0],
                [0.0, 1.0],
                [0.0, 0.0],
                vec![1.0; 7]
            ),
            Err(MufluxError::Format(_))
        ));
    }
}
