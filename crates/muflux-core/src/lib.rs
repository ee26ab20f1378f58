//! Muflux: a portable atmospheric-muon fluxmeter.
//!
//! The library reports the local differential flux of atmospheric muons
//! (and anti-muons) at an observer location inside or above a layered
//! topographic model of the Earth. Given an observer state — position,
//! viewing direction, kinetic energy and optionally a particle identity —
//! it returns a flux value in GeV⁻¹·m⁻²·s⁻¹·sr⁻¹ and a charge asymmetry,
//! computed by backward Monte Carlo transport up to a reference altitude
//! where an opensky reference flux is sampled.
//!
//! # Quick tour
//!
//! ```no_run
//! use muflux_core::{Direction, Fluxmeter, Geometry, Layer, Pid, Position, State};
//! use muflux_physics::Physics;
//!
//! # fn main() -> muflux_core::MufluxResult<()> {
//! let geometry = Geometry::new(vec![Layer::new("Rock", 0.0)]);
//! let mut fluxmeter = Fluxmeter::with_physics(Physics::default(), geometry)?;
//!
//! let observation = State {
//!     pid: Pid::Any,
//!     position: Position::new(45.0, 3.0, -30.0),
//!     direction: Direction::new(0.0, 90.0),
//!     energy: 10.0,
//!     weight: 0.0,
//! };
//! let flux = fluxmeter.flux(&observation);
//! println!("{} GeV^-1 m^-2 s^-1 sr^-1", flux.value);
//! # Ok(())
//! # }
//! ```
//!
//! The transport engine itself lives in the sibling `muflux-physics` crate;
//! this crate supplies the layered geometry, the atmosphere and reference
//! models, and the orchestration.

pub mod atmosphere;
pub mod constants;
pub mod coordinates;
pub mod errors;
pub mod fluxmeter;
pub mod geomagnet;
pub mod geometry;
pub mod reference;

pub use coordinates::{Direction, Enu, Position};
pub use errors::{set_error_handler, ErrorHandler, MufluxError, MufluxResult};
pub use fluxmeter::{Fluxmeter, Intersection, Pid, State, TransportMode};
pub use geomagnet::{Dipole, GeomagneticModel};
pub use geometry::{ElevationMap, Geometry, Layer, Projection};
pub use reference::{Flux, GcclyReference, ReferenceFlux, ReferenceTable};
