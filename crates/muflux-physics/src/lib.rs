//! Muon transport engine for the muflux fluxmeter.
//!
//! This crate is the Monte Carlo collaborator consumed by `muflux-core`. It
//! knows nothing about layered topographies or reference fluxes; it sees the
//! world through the [`MediumLocator`] trait and exposes:
//!
//! - [`Physics`]: a material registry with Groom-style continuous energy-loss
//!   coefficients, loaded from a JSON table or from built-in defaults.
//! - [`TransportContext`]: the mutable transport configuration (direction,
//!   energy-loss and scattering modes, event mask, energy limit, accuracy).
//! - [`Physics::transport`]: the stepping loop, which advances a
//!   [`ParticleState`] until an energy-limit or medium event.
//! - [`Prng`]: a seed-stable pseudo-random stream shared by all stochastic
//!   sub-models.
//!
//! Energies are kinetic and in GeV, lengths in m, column depths in kg/m²,
//! magnetic fields in T. Proper time is tracked as c·τ in metres.

pub mod materials;
pub mod prng;
pub mod state;
pub mod transport;

pub use materials::{MaterialDefinition, MaterialIndex, Physics, PhysicsError};
pub use prng::Prng;
pub use state::{
    EnergyLossMode, Event, EventMask, Locals, MediumId, MediumLocator, ParticleState,
    PropagationDirection, ScatteringMode, TransportContext,
};

/// Muon rest mass, in GeV/c².
pub const MUON_MASS: f64 = 0.10566;

/// Minimum transport step, in m. Also the smallest boundary distance a
/// locator is expected to return.
pub const STEP_MIN: f64 = f32::EPSILON as f64;
