//! Transport state, configuration and the geometry seam.

use serde::{Deserialize, Serialize};

use crate::materials::MaterialIndex;
use crate::MUON_MASS;

/// Propagation direction of the Monte Carlo.
///
/// Backward transport retraces the trajectory upstream: the position moves
/// against the momentum direction and the kinetic energy increases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropagationDirection {
    Forward,
    Backward,
}

/// Energy-loss mode of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnergyLossMode {
    /// No energy loss (ray tracing).
    Disabled,
    /// Deterministic continuous slowing-down approximation.
    Csda,
    /// Catastrophic losses randomised, soft losses continuous.
    Mixed,
    /// Fully straggled energy losses.
    Straggled,
}

/// Multiple-scattering mode of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScatteringMode {
    Disabled,
    Mixed,
}

/// Stop causes the caller wants reported as events.
///
/// Exiting the geometry always terminates the transport with a
/// [`Event::Medium`], whatever the mask says.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMask {
    /// Stop when the kinetic energy reaches the context limit.
    pub energy_limit: bool,
    /// Stop on any medium change, not only on geometry exit.
    pub medium: bool,
}

/// First stop cause of a transport call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// The kinetic energy reached the context limit.
    EnergyLimit,
    /// A medium boundary was crossed, or the geometry was exited.
    Medium,
}

/// Mutable transport configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransportContext {
    pub direction: PropagationDirection,
    pub energy_loss: EnergyLossMode,
    pub scattering: ScatteringMode,
    pub event: EventMask,
    /// Kinetic energy limit, in GeV. Upper bound for backward transport,
    /// lower bound for forward transport.
    pub energy_limit: Option<f64>,
    /// Relative accuracy knob forwarded to the medium adapters.
    pub accuracy: f64,
}

impl Default for TransportContext {
    fn default() -> Self {
        Self {
            direction: PropagationDirection::Forward,
            energy_loss: EnergyLossMode::Csda,
            scattering: ScatteringMode::Disabled,
            event: EventMask::default(),
            energy_limit: None,
            accuracy: 1e-2,
        }
    }
}

/// Monte Carlo state of a muon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleState {
    /// Electric charge, in units of e (-1 for a muon, +1 for an anti-muon).
    pub charge: f64,
    /// Kinetic energy, in GeV.
    pub energy: f64,
    /// ECEF position, in m.
    pub position: [f64; 3],
    /// Momentum (propagation) direction, unit ECEF vector.
    pub direction: [f64; 3],
    /// Transport weight.
    pub weight: f64,
    /// Proper time, as c·τ in m.
    pub time: f64,
    /// Accumulated column depth, in kg/m².
    pub grammage: f64,
    /// Accumulated path length, in m.
    pub distance: f64,
}

impl Default for ParticleState {
    fn default() -> Self {
        Self {
            charge: -1.0,
            energy: 1.0,
            position: [0.0; 3],
            direction: [0.0, 0.0, 1.0],
            weight: 1.0,
            time: 0.0,
            grammage: 0.0,
            distance: 0.0,
        }
    }
}

impl ParticleState {
    /// Momentum, in GeV/c.
    pub fn momentum(&self) -> f64 {
        let total = self.energy + MUON_MASS;
        (total * total - MUON_MASS * MUON_MASS).max(0.0).sqrt()
    }
}

/// Identifier of a medium as reported by a locator.
///
/// Two regions sharing the same `index` are the same medium: crossing
/// between them is not a medium change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediumId {
    /// Caller-defined medium index (e.g. a layer number).
    pub index: usize,
    /// Material filling the medium.
    pub material: MaterialIndex,
}

/// Local properties of a medium at the current state.
#[derive(Debug, Clone, Copy)]
pub struct Locals {
    /// Bulk density, in kg/m³.
    pub density: f64,
    /// Local magnetic field in ECEF coordinates, in T.
    pub magnet: Option<[f64; 3]>,
    /// Length over which the local properties vary appreciably, in m. The
    /// engine caps its step at `accuracy ×` this value.
    pub step_limit: Option<f64>,
}

/// Geometry seam consumed by the transport loop.
///
/// Implementations must be cheap to query: `locate` runs at every step and
/// during boundary refinement. The returned step is a lower bound on the
/// distance to the next boundary, floored at [`crate::STEP_MIN`].
pub trait MediumLocator {
    /// Medium containing the state, and a safe step length. `None` means
    /// outside the geometry.
    fn locate(&self, state: &ParticleState) -> (Option<MediumId>, f64);

    /// Local properties of a medium at the state's position.
    fn locals(&self, medium: MediumId, state: &ParticleState) -> Locals;
}
