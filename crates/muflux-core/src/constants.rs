//! Physical constants and load-bearing tolerances.

/// Muon rest mass, in GeV/c².
pub const MUON_MASS: f64 = 0.10566;

/// Muon decay length c·τ, in m.
pub const MUON_C_TAU: f64 = 658.654;

/// Floor of the bottommost stratum and out-of-domain height sentinel, in m.
pub const ZMIN: f64 = -11e3;

/// Ceiling of the geometry, in m.
pub const ZMAX: f64 = 120e3;

/// Minimum step length, regime-switch hysteresis and external-layer
/// latching tolerance, in m (single-precision epsilon, kept bit-for-bit).
pub const EPSILON_FLT: f64 = f32::EPSILON as f64;

/// Tolerance of the boundary-landing checks after transport legs, in m.
pub const HEIGHT_TOLERANCE: f64 = 1e-4;

/// Atmospheric muon charge ratio (CMS measurement).
pub const CHARGE_RATIO: f64 = 1.2766;

/// Shell ceilings of the US-standard atmosphere parameterisation, in m.
pub const ATMOSPHERE_SHELL_HEIGHT: [f64; 4] = [4e3, 1e4, 4e4, 1e5];

/// CORSIKA `b` parameters of the US-standard atmosphere.
pub const ATMOSPHERE_SHELL_B: [f64; 4] = [1222.6562, 1144.9069, 1305.5948, 540.1778];

/// CORSIKA `c` parameters of the US-standard atmosphere.
pub const ATMOSPHERE_SHELL_C: [f64; 4] = [994186.38, 878153.55, 636143.04, 772170.16];

/// Revalidation radius of the geomagnetic field cache, in m.
pub const GEOMAGNET_CACHE_RADIUS: f64 = 1e3;
