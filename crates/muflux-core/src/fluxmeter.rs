//! The fluxmeter orchestrator.
//!
//! A [`Fluxmeter`] computes the local differential muon flux by backward
//! Monte Carlo: the observed muon is transported upstream through the
//! layered geometry up to `ztop`, pulled down to the reference altitude
//! `zref` by a deterministic CSDA leg when needed (with the corresponding
//! stopping-power Jacobian), and the opensky reference flux is sampled at
//! the resulting state, weighted by the in-flight decay probability.
//!
//! # Vertical anchors
//!
//! With `zmax` the highest layer top and `[h₀, h₁]` the reference altitude
//! support (sorted):
//!
//! - `zmax ≤ h₀`: the column is entirely below the support, `ztop = zref = h₀`;
//! - `zmax ≤ h₁`: the reference can be sampled on the column top,
//!   `ztop = zref = zmax`;
//! - otherwise the column pokes above the support, `ztop = zmax`,
//!   `zref = h₁`.
//!
//! Steppers are rebuilt lazily whenever the bound reference's altitude
//! support changed since the last call.

use std::cell::RefCell;
use std::path::Path;

use serde::{Deserialize, Serialize};

use muflux_physics::{
    EnergyLossMode, Event, EventMask, Locals, MaterialIndex, MediumId, MediumLocator,
    ParticleState, Physics, Prng, PropagationDirection, ScatteringMode, TransportContext,
};

use crate::atmosphere;
use crate::constants::{EPSILON_FLT, GEOMAGNET_CACHE_RADIUS, HEIGHT_TOLERANCE, MUON_C_TAU};
use crate::coordinates::{
    ecef_from_geodetic, ecef_from_horizontal, ecef_to_geodetic, ecef_to_horizontal, Direction,
    Position,
};
use crate::errors::{self, ErrorHandler, MufluxError, MufluxResult};
use crate::geomagnet::{FieldCache, GeomagneticModel};
use crate::geometry::stepper::Stepper;
use crate::geometry::Geometry;
use crate::reference::{Flux, GcclyReference, ReferenceFlux};

/// Particle identity (PDG numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Pid {
    /// Untagged: both charges, combined according to the charge ratio.
    #[default]
    Any,
    /// μ⁻ (PDG 13).
    Muon,
    /// μ⁺ (PDG -13).
    AntiMuon,
}

impl Pid {
    /// Electric charge in units of e, `None` for untagged.
    pub fn charge(self) -> Option<f64> {
        match self {
            Pid::Any => None,
            Pid::Muon => Some(-1.0),
            Pid::AntiMuon => Some(1.0),
        }
    }

    /// PDG identifier (0 for untagged).
    pub fn pdg(self) -> i32 {
        match self {
            Pid::Any => 0,
            Pid::Muon => 13,
            Pid::AntiMuon => -13,
        }
    }
}

/// Energy-loss fidelity of the backward transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransportMode {
    /// Deterministic continuous slowing-down (the default).
    #[default]
    Csda,
    /// Randomised catastrophic losses, no scattering.
    Mixed,
    /// Stochastic losses and multiple scattering, with regime boundaries at
    /// 10 and 100 GeV.
    Detailed,
}

/// An observation, or the matching state at the reference altitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub pid: Pid,
    pub position: Position,
    /// Observation direction (opposite of the propagation direction).
    pub direction: Direction,
    /// Kinetic energy, in GeV.
    pub energy: f64,
    /// Transport weight; irrelevant on input, meaningful on output.
    pub weight: f64,
}

impl State {
    /// A zero-weight sentinel state.
    fn zero() -> Self {
        Self {
            pid: Pid::Any,
            position: Position::new(0.0, 0.0, 0.0),
            direction: Direction::new(0.0, 0.0),
            energy: 0.0,
            weight: 0.0,
        }
    }

    /// Sample a reference flux at this state.
    ///
    /// Tagged states take the matching half of the flux,
    /// ½ (1 + q · asymmetry), and report their own charge as asymmetry. The
    /// state weight multiplies the returned value.
    pub fn sample(&self, reference: &dyn ReferenceFlux) -> Flux {
        let mut result = reference.flux(
            self.position.height,
            self.direction.elevation,
            self.energy,
        );
        if let Some(charge) = self.pid.charge() {
            result.value *= 0.5 * (1.0 + charge * result.asymmetry);
            result.asymmetry = charge;
        }
        result.value *= self.weight;
        result
    }
}

/// First crossing of a line of sight with the geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intersection {
    /// Entered medium: `Some(i)` for layer i, `Some(len)` for the
    /// atmosphere, `None` when the ray left the geometry.
    pub layer: Option<usize>,
    /// Geographic position of the crossing.
    pub position: Position,
}

struct LayerMedium {
    material: MaterialIndex,
    default_density: f64,
}

/// Atmosphere medium adapter, shared by both locator views.
struct AtmosphereView<'a> {
    material: MaterialIndex,
    index: usize,
    geomagnet: Option<&'a dyn GeomagneticModel>,
    cache: &'a RefCell<FieldCache>,
    accuracy: f64,
}

impl AtmosphereView<'_> {
    fn id(&self) -> MediumId {
        MediumId {
            index: self.index,
            material: self.material,
        }
    }

    fn locals(&self, state: &ParticleState) -> Locals {
        let position = ecef_to_geodetic(&state.position);
        let (density, lambda) = atmosphere::density(position.height);
        let horizontal =
            ecef_to_horizontal(position.latitude, position.longitude, &state.direction);
        let mut step = atmosphere::slant_step(lambda, horizontal.elevation.to_radians().sin());
        let magnet = self.geomagnet.map(|model| {
            // Keep the effective step inside the field-cache radius.
            step = step.min(GEOMAGNET_CACHE_RADIUS / self.accuracy);
            self.cache.borrow_mut().field_at(model, &state.position)
        });
        Locals {
            density,
            magnet,
            step_limit: Some(step),
        }
    }
}

/// Locator over the full stratified column.
struct LayeredView<'a> {
    geometry: &'a Geometry,
    stepper: &'a Stepper,
    layers: &'a [LayerMedium],
    atmosphere: AtmosphereView<'a>,
    use_external_layer: bool,
}

impl MediumLocator for LayeredView<'_> {
    fn locate(&self, state: &ParticleState) -> (Option<MediumId>, f64) {
        let (region, step) = self.stepper.locate(self.geometry, &state.position);
        let n = self.layers.len();
        let medium = if (1..=n).contains(&region) {
            Some(MediumId {
                index: region - 1,
                material: self.layers[region - 1].material,
            })
        } else if region == n + 1 || (self.use_external_layer && region == n + 2) {
            Some(self.atmosphere.id())
        } else {
            None
        };
        (medium, step)
    }

    fn locals(&self, medium: MediumId, state: &ParticleState) -> Locals {
        if let Some(layer) = (medium.index < self.layers.len())
            .then(|| self.geometry.layer(medium.index))
            .flatten()
        {
            Locals {
                density: layer
                    .density()
                    .unwrap_or(self.layers[medium.index].default_density),
                magnet: None,
                step_limit: None,
            }
        } else {
            self.atmosphere.locals(state)
        }
    }
}

/// Locator over the opensky column above `zref`.
struct OpenskyView<'a> {
    geometry: &'a Geometry,
    stepper: &'a Stepper,
    atmosphere: AtmosphereView<'a>,
}

impl MediumLocator for OpenskyView<'_> {
    fn locate(&self, state: &ParticleState) -> (Option<MediumId>, f64) {
        let (region, step) = self.stepper.locate(self.geometry, &state.position);
        let medium = (region == 1).then(|| self.atmosphere.id());
        (medium, step)
    }

    fn locals(&self, _medium: MediumId, state: &ParticleState) -> Locals {
        self.atmosphere.locals(state)
    }
}

/// A muon flux calculator bound to a physics set and a layered geometry.
pub struct Fluxmeter {
    physics: Physics,
    geometry: Geometry,
    layer_media: Vec<LayerMedium>,
    air: MaterialIndex,
    mode: TransportMode,
    reference: Box<dyn ReferenceFlux>,
    prng: Prng,
    geomagnet: Option<Box<dyn GeomagneticModel>>,
    field_cache: RefCell<FieldCache>,
    handler: Option<ErrorHandler>,
    accuracy: f64,
    layered: Stepper,
    opensky: Stepper,
    zmax: f64,
    ztop: f64,
    zref: f64,
    zref_min: f64,
    zref_max: f64,
    use_external_layer: bool,
    use_geomagnet: bool,
    rebuilds: u64,
}

impl Fluxmeter {
    /// Create a fluxmeter from a physics-table file.
    pub fn new<P: AsRef<Path>>(physics: P, geometry: Geometry) -> MufluxResult<Self> {
        let physics = Physics::from_file(physics)?;
        Self::with_physics(physics, geometry)
    }

    /// Create a fluxmeter from loaded physics tables.
    ///
    /// Fails with *PhysicsSetup* — reported through the process error
    /// handler as well — when a layer material, or "Air", is missing from
    /// the tables.
    pub fn with_physics(physics: Physics, geometry: Geometry) -> MufluxResult<Self> {
        let resolve = |name: &str| -> MufluxResult<MaterialIndex> {
            physics.material_index(name).map_err(|err| {
                let err: MufluxError = err.into();
                errors::report(None, &err);
                err
            })
        };

        let mut layer_media = Vec::with_capacity(geometry.len());
        for layer in geometry.layers() {
            let material = resolve(layer.material())?;
            layer_media.push(LayerMedium {
                material,
                default_density: physics.default_density(material),
            });
        }
        let air = resolve("Air")?;

        let zmax = geometry.zmax();
        let mut fluxmeter = Self {
            physics,
            geometry,
            layer_media,
            air,
            mode: TransportMode::default(),
            reference: Box::new(GcclyReference::default()),
            prng: Prng::from_entropy(),
            geomagnet: None,
            field_cache: RefCell::new(FieldCache::default()),
            handler: None,
            accuracy: 1e-2,
            layered: Stepper::default(),
            opensky: Stepper::default(),
            zmax,
            ztop: 0.0,
            zref: 0.0,
            zref_min: f64::MAX,
            zref_max: -f64::MAX,
            use_external_layer: false,
            use_geomagnet: false,
            rebuilds: 0,
        };
        fluxmeter.update_steppers();
        Ok(fluxmeter)
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: TransportMode) {
        self.mode = mode;
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Mutable geometry access, for density edits between calls.
    pub fn geometry_mut(&mut self) -> &mut Geometry {
        &mut self.geometry
    }

    pub fn reference(&self) -> &dyn ReferenceFlux {
        self.reference.as_ref()
    }

    /// Swap the opensky reference. Steppers are rebuilt on the next call if
    /// the altitude support changed.
    pub fn set_reference(&mut self, reference: Box<dyn ReferenceFlux>) {
        self.reference = reference;
    }

    pub fn prng(&self) -> &Prng {
        &self.prng
    }

    pub fn prng_mut(&mut self) -> &mut Prng {
        &mut self.prng
    }

    pub fn geomagnet(&self) -> Option<&dyn GeomagneticModel> {
        self.geomagnet.as_deref()
    }

    /// Attach or detach a geomagnetic model; the field cache is dropped.
    pub fn set_geomagnet(&mut self, geomagnet: Option<Box<dyn GeomagneticModel>>) {
        self.geomagnet = geomagnet;
        self.field_cache.borrow_mut().reset();
    }

    /// Install a per-instance error handler (wins over the process default).
    pub fn set_error_handler(&mut self, handler: Option<ErrorHandler>) {
        self.handler = handler;
    }

    pub fn accuracy(&self) -> f64 {
        self.accuracy
    }

    pub fn set_accuracy(&mut self, accuracy: f64) {
        self.accuracy = accuracy.clamp(1e-4, 1.0);
    }

    /// Altitude where backward transport hands over to the opensky leg.
    pub fn ztop(&self) -> f64 {
        self.ztop
    }

    /// Altitude where the reference flux is sampled.
    pub fn zref(&self) -> f64 {
        self.zref
    }

    /// Number of stepper (re)builds so far.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    /// Differential muon flux seen by an observer state.
    ///
    /// Zero-weight outcomes (dead-ended backward transport, out-of-support
    /// samples) return a zero flux silently; a non-positive kinetic energy
    /// is a *BadInput* signalled through the error handler.
    pub fn flux(&mut self, observation: &State) -> Flux {
        let Some(initial) = self.init_event(
            Pid::Muon,
            &observation.position,
            &observation.direction,
            observation.energy,
        ) else {
            return Flux::default();
        };

        match observation.pid {
            Pid::Any if self.geomagnet.is_none() => {
                let mut state = self.transport_event(observation.position, initial);
                if state.weight <= 0.0 {
                    return Flux::default();
                }
                state.pid = Pid::Any;
                state.sample(self.reference.as_ref())
            }
            Pid::Any => {
                // With a magnetic field the two charges follow different
                // trajectories: transport both and combine.
                let mut negative = initial.clone();
                negative.charge = -1.0;
                let r0 = self
                    .transport_event(observation.position, negative)
                    .sample(self.reference.as_ref());

                let mut positive = initial;
                positive.charge = 1.0;
                let r1 = self
                    .transport_event(observation.position, positive)
                    .sample(self.reference.as_ref());

                let total = r0.value + r1.value;
                if total > 0.0 {
                    Flux {
                        value: total,
                        asymmetry: (r1.value - r0.value) / total,
                    }
                } else {
                    Flux::default()
                }
            }
            tagged => {
                let mut state = initial;
                state.charge = tagged.charge().expect("tagged pid");
                let state = self.transport_event(observation.position, state);
                if state.weight <= 0.0 {
                    return Flux::default();
                }
                state.sample(self.reference.as_ref())
            }
        }
    }

    /// Transport one observation state to the reference altitude.
    ///
    /// The returned state carries the combined transport and decay weight.
    /// Untagged states are transported as muons in CSDA mode (and restored
    /// to untagged); in stochastic modes the charge is sampled 50/50 with a
    /// doubled weight. Untagged CSDA transport under a geomagnetic field is
    /// a *BadInput*.
    pub fn transport(&mut self, state: &State) -> State {
        let mut pid = state.pid;
        if pid == Pid::Any && self.mode == TransportMode::Csda {
            if self.geomagnet.is_some() {
                self.report(MufluxError::BadInput(format!(
                    "bad pid ({})",
                    state.pid.pdg()
                )));
                return State::zero();
            }
            pid = Pid::Muon;
        }

        let Some(initial) = self.init_event(pid, &state.position, &state.direction, state.energy)
        else {
            return State::zero();
        };

        let mut result = self.transport_event(state.position, initial);
        if state.pid == Pid::Any && self.mode == TransportMode::Csda {
            result.pid = Pid::Any;
        }
        result
    }

    /// First crossing of a line of sight with the geometry.
    ///
    /// The geomagnetic field is suppressed; the ray is traced without
    /// energy loss. `None` when the transport failed outright.
    pub fn intersect(&mut self, position: &Position, direction: &Direction) -> Option<Intersection> {
        self.update_steppers();
        self.use_geomagnet = false;
        self.use_external_layer = position.height >= self.ztop + EPSILON_FLT;

        let mut state = self.ray_state(position, direction);
        let ctx = self.tracing_context();
        let (event, media) = match self.run_layered(&ctx, &mut state) {
            Ok(result) => result,
            Err(err) => {
                self.report(err);
                return None;
            }
        };
        if event != Event::Medium {
            return None;
        }
        Some(Intersection {
            layer: media[1].map(|m| m.index),
            position: ecef_to_geodetic(&state.position),
        })
    }

    /// Column depth along a line of sight, in kg/m².
    ///
    /// With `bins` (length: layers + 1, atmosphere last) the per-medium
    /// contributions are accumulated; their sum is the returned total.
    pub fn grammage(
        &mut self,
        position: &Position,
        direction: &Direction,
        mut bins: Option<&mut [f64]>,
    ) -> f64 {
        self.update_steppers();
        if let Some(bins) = bins.as_deref_mut() {
            let expected = self.geometry.len() + 1;
            if bins.len() != expected {
                self.report(MufluxError::BadInput(format!(
                    "bad grammage binning (expected {expected} bins, found {})",
                    bins.len()
                )));
                return 0.0;
            }
            bins.fill(0.0);
        }
        self.use_geomagnet = false;
        self.use_external_layer = position.height >= self.ztop + EPSILON_FLT;

        let mut state = self.ray_state(position, direction);
        let ctx = self.tracing_context();
        let mut attributed = 0.0;
        loop {
            let (event, media) = match self.run_layered(&ctx, &mut state) {
                Ok(result) => result,
                Err(err) => {
                    self.report(err);
                    return 0.0;
                }
            };
            if let Some(bins) = bins.as_deref_mut() {
                match media[0] {
                    None => break,
                    Some(medium) => {
                        bins[medium.index] += state.grammage - attributed;
                        attributed = state.grammage;
                    }
                }
            }
            if event != Event::Medium || media[1].is_none() {
                break;
            }
        }
        state.grammage
    }

    /// Region of the layered geometry containing a position.
    ///
    /// `Some(i)` for layer i, `Some(len)` for the atmosphere below `ztop`,
    /// `Some(len + 1)` for the atmosphere above it, `None` outside.
    pub fn whereami(&mut self, position: &Position) -> Option<usize> {
        self.update_steppers();
        let ecef = ecef_from_geodetic(position);
        let (region, _) = self.layered.locate(&self.geometry, &ecef);
        if (1..=self.geometry.len() + 2).contains(&region) {
            Some(region - 1)
        } else {
            None
        }
    }

    fn report(&self, error: MufluxError) {
        errors::report(self.handler.as_ref(), &error);
    }

    /// Rebuild both steppers if the reference altitude support changed.
    fn update_steppers(&mut self) {
        let height_min = self.reference.height_min();
        let height_max = self.reference.height_max();
        if self.zref_min == height_min && self.zref_max == height_max {
            return;
        }
        self.zref_min = height_min;
        self.zref_max = height_max;

        let (lo, hi) = if height_min > height_max {
            (height_max, height_min)
        } else {
            (height_min, height_max)
        };
        if self.zmax <= lo {
            self.ztop = lo;
            self.zref = lo;
        } else if self.zmax <= hi {
            self.ztop = self.zmax;
            self.zref = self.zmax;
        } else {
            self.ztop = self.zmax;
            self.zref = hi;
        }

        self.layered = Stepper::layered(&self.geometry, self.ztop);
        self.opensky = Stepper::opensky(self.zref);
        self.rebuilds += 1;
        tracing::debug!(
            target: "muflux",
            ztop = self.ztop,
            zref = self.zref,
            "rebuilt steppers"
        );
    }

    /// Common entry checks and state setup of flux and transport calls.
    fn init_event(
        &mut self,
        pid: Pid,
        position: &Position,
        direction: &Direction,
        energy: f64,
    ) -> Option<ParticleState> {
        if energy <= 0.0 {
            self.report(MufluxError::BadInput(format!(
                "bad kinetic energy ({energy})"
            )));
            return None;
        }

        self.update_steppers();
        self.use_geomagnet = self.geomagnet.is_some();
        self.use_external_layer = position.height >= self.ztop + EPSILON_FLT;

        let (charge, weight) = match pid.charge() {
            Some(charge) => (charge, 1.0),
            None => {
                // Untagged stochastic transport: sample the charge.
                let charge = if self.prng.uniform01() <= 0.5 { -1.0 } else { 1.0 };
                (charge, 2.0)
            }
        };

        let look = ecef_from_horizontal(
            position.latitude,
            position.longitude,
            direction.azimuth,
            direction.elevation,
        );
        Some(ParticleState {
            charge,
            energy,
            position: ecef_from_geodetic(position),
            // Observer convention: the muon propagates towards the observer.
            direction: [-look[0], -look[1], -look[2]],
            weight,
            time: 0.0,
            grammage: 0.0,
            distance: 0.0,
        })
    }

    /// A unit ray-tracing state (intersect and grammage).
    fn ray_state(&self, position: &Position, direction: &Direction) -> ParticleState {
        ParticleState {
            charge: 1.0,
            energy: 1.0,
            weight: 1.0,
            position: ecef_from_geodetic(position),
            direction: ecef_from_horizontal(
                position.latitude,
                position.longitude,
                direction.azimuth,
                direction.elevation,
            ),
            time: 0.0,
            grammage: 0.0,
            distance: 0.0,
        }
    }

    fn tracing_context(&self) -> TransportContext {
        TransportContext {
            direction: PropagationDirection::Forward,
            energy_loss: EnergyLossMode::Disabled,
            scattering: ScatteringMode::Disabled,
            event: EventMask {
                energy_limit: false,
                medium: true,
            },
            energy_limit: None,
            accuracy: self.accuracy,
        }
    }

    /// Transport configuration of the backward ascent, by mode and energy.
    fn ascent_context(&self, energy: f64) -> TransportContext {
        let mut ctx = TransportContext {
            direction: PropagationDirection::Backward,
            energy_loss: EnergyLossMode::Csda,
            scattering: ScatteringMode::Disabled,
            event: EventMask {
                energy_limit: true,
                medium: false,
            },
            energy_limit: Some(self.reference.energy_max()),
            accuracy: self.accuracy,
        };
        match self.mode {
            TransportMode::Csda => {}
            TransportMode::Mixed => ctx.energy_loss = EnergyLossMode::Mixed,
            TransportMode::Detailed => {
                if energy <= 10.0 - EPSILON_FLT {
                    ctx.energy_loss = EnergyLossMode::Straggled;
                    ctx.scattering = ScatteringMode::Mixed;
                    ctx.energy_limit = Some(10.0);
                } else if energy <= 100.0 - EPSILON_FLT {
                    ctx.energy_loss = EnergyLossMode::Mixed;
                    ctx.scattering = ScatteringMode::Mixed;
                    ctx.energy_limit = Some(100.0);
                } else {
                    ctx.energy_loss = EnergyLossMode::Mixed;
                }
            }
        }
        ctx
    }

    fn run_layered(
        &mut self,
        ctx: &TransportContext,
        state: &mut ParticleState,
    ) -> Result<(Event, [Option<MediumId>; 2]), MufluxError> {
        let view = LayeredView {
            geometry: &self.geometry,
            stepper: &self.layered,
            layers: &self.layer_media,
            atmosphere: AtmosphereView {
                material: self.air,
                index: self.layer_media.len(),
                geomagnet: if self.use_geomagnet {
                    self.geomagnet.as_deref()
                } else {
                    None
                },
                cache: &self.field_cache,
                accuracy: self.accuracy,
            },
            use_external_layer: self.use_external_layer,
        };
        self.physics
            .transport(ctx, &view, state, &mut self.prng)
            .map_err(Into::into)
    }

    fn run_opensky(
        &mut self,
        ctx: &TransportContext,
        state: &mut ParticleState,
    ) -> Result<(Event, [Option<MediumId>; 2]), MufluxError> {
        let view = OpenskyView {
            geometry: &self.geometry,
            stepper: &self.opensky,
            atmosphere: AtmosphereView {
                material: self.air,
                index: self.layer_media.len(),
                geomagnet: if self.use_geomagnet {
                    self.geomagnet.as_deref()
                } else {
                    None
                },
                cache: &self.field_cache,
                accuracy: self.accuracy,
            },
        };
        self.physics
            .transport(ctx, &view, state, &mut self.prng)
            .map_err(Into::into)
    }

    /// Backward ascent, opensky Jacobian leg and reference-state assembly.
    fn transport_event(&mut self, mut position: Position, mut state: ParticleState) -> State {
        if position.height < self.ztop - EPSILON_FLT {
            let mut ctx = self.ascent_context(state.energy);
            loop {
                let (event, _media) = match self.run_layered(&ctx, &mut state) {
                    Ok(result) => result,
                    Err(err) => {
                        self.report(err);
                        return State::zero();
                    }
                };
                if self.mode == TransportMode::Detailed && event == Event::EnergyLimit {
                    // Regime hand-over: resume with the next energy band.
                    let energy_max = self.reference.energy_max();
                    if state.energy >= energy_max - EPSILON_FLT {
                        return State::zero();
                    }
                    if state.energy >= 100.0 - EPSILON_FLT {
                        ctx.energy_loss = EnergyLossMode::Mixed;
                        ctx.scattering = ScatteringMode::Disabled;
                        ctx.energy_limit = Some(energy_max);
                    } else {
                        ctx.energy_loss = EnergyLossMode::Mixed;
                        ctx.scattering = ScatteringMode::Mixed;
                        ctx.energy_limit = Some(100.0);
                    }
                    continue;
                }
                if event != Event::Medium {
                    return State::zero();
                }
                break;
            }

            position = ecef_to_geodetic(&state.position);
            if (position.height - self.ztop).abs() > HEIGHT_TOLERANCE {
                return State::zero();
            }
        }

        if position.height > self.reference.height_max() + EPSILON_FLT {
            // Deterministic descent to the reference altitude; the energy
            // change is reweighted by the CSDA Jacobian.
            let t0 = state.time;
            let e0 = state.energy;
            state.time = 0.0;

            let ctx = TransportContext {
                direction: PropagationDirection::Forward,
                energy_loss: EnergyLossMode::Csda,
                scattering: ScatteringMode::Disabled,
                event: EventMask {
                    energy_limit: true,
                    medium: false,
                },
                energy_limit: Some(self.reference.energy_min()),
                accuracy: self.accuracy,
            };
            let (event, _media) = match self.run_opensky(&ctx, &mut state) {
                Ok(result) => result,
                Err(err) => {
                    self.report(err);
                    return State::zero();
                }
            };
            if event != Event::Medium {
                return State::zero();
            }

            position = ecef_to_geodetic(&state.position);
            if (position.height - self.zref).abs() > HEIGHT_TOLERANCE {
                return State::zero();
            }
            position.height = self.zref; // kill the landing jitter

            state.time = t0 - state.time;

            let s0 = self
                .physics
                .stopping_power(EnergyLossMode::Csda, self.air, e0);
            let s1 = self
                .physics
                .stopping_power(EnergyLossMode::Csda, self.air, state.energy);
            if s0 <= 0.0 || s1 <= 0.0 {
                return State::zero();
            }
            state.weight *= s1 / s0;
        }

        // Back to the observation convention for the reported direction.
        let reverted = [
            -state.direction[0],
            -state.direction[1],
            -state.direction[2],
        ];
        let direction = ecef_to_horizontal(position.latitude, position.longitude, &reverted);

        let decay = (-state.time / MUON_C_TAU).exp();
        State {
            pid: if state.charge < 0.0 {
                Pid::Muon
            } else {
                Pid::AntiMuon
            },
            position,
            direction,
            energy: state.energy,
            weight: decay * state.weight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Layer;
    use std::sync::{Arc, Mutex};

    fn capture() -> (ErrorHandler, Arc<Mutex<Vec<String>>>) {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: ErrorHandler = Arc::new(move |err: &MufluxError| {
            sink.lock().unwrap().push(err.to_string());
        });
        (handler, seen)
    }

    fn observer(height: f64, elevation: f64, energy: f64) -> State {
        State {
            pid: Pid::Any,
            position: Position::new(45.0, 3.0, height),
            direction: Direction::new(0.0, elevation),
            energy,
            weight: 0.0,
        }
    }

    #[test]
    fn construction_resolves_materials() {
        let geometry = Geometry::new(vec![Layer::new("Rock", 100.0)]);
        let fluxmeter = Fluxmeter::with_physics(Physics::default(), geometry).unwrap();
        assert_eq!(fluxmeter.rebuild_count(), 1);
        assert_eq!(fluxmeter.ztop(), 100.0);
        assert_eq!(fluxmeter.zref(), 0.0);
    }

    #[test]
    fn unknown_material_is_a_setup_error() {
        let geometry = Geometry::new(vec![Layer::new("Adamantium", 0.0)]);
        let result = Fluxmeter::with_physics(Physics::default(), geometry);
        assert!(matches!(result, Err(MufluxError::PhysicsSetup(_))));
    }

    #[test]
    fn steppers_rebuild_once_per_support_change() {
        let geometry = Geometry::new(vec![Layer::new("Rock", 100.0)]);
        let mut fluxmeter = Fluxmeter::with_physics(Physics::default(), geometry).unwrap();
        assert_eq!(fluxmeter.rebuild_count(), 1);

        // Unchanged support: no rebuild, however many calls.
        fluxmeter.whereami(&Position::new(45.0, 3.0, 50.0));
        fluxmeter.whereami(&Position::new(45.0, 3.0, 500.0));
        assert_eq!(fluxmeter.rebuild_count(), 1);

        // Changed support: exactly one rebuild on the next call.
        fluxmeter.set_reference(Box::new(GcclyReference::with_height_range(0.0, 500.0)));
        fluxmeter.whereami(&Position::new(45.0, 3.0, 50.0));
        assert_eq!(fluxmeter.rebuild_count(), 2);
        fluxmeter.whereami(&Position::new(45.0, 3.0, 50.0));
        assert_eq!(fluxmeter.rebuild_count(), 2);
    }

    #[test]
    fn anchors_follow_the_reference_support() {
        let geometry = Geometry::new(vec![Layer::new("Rock", 100.0)]);
        let mut fluxmeter = Fluxmeter::with_physics(Physics::default(), geometry).unwrap();

        // zmax above the whole support: ztop = zmax, zref = hi.
        assert_eq!((fluxmeter.ztop(), fluxmeter.zref()), (100.0, 0.0));

        // Support containing zmax: both collapse onto zmax.
        fluxmeter.set_reference(Box::new(GcclyReference::with_height_range(0.0, 500.0)));
        fluxmeter.whereami(&Position::new(45.0, 3.0, 0.0));
        assert_eq!((fluxmeter.ztop(), fluxmeter.zref()), (100.0, 100.0));

        // Support entirely above zmax: both at its lower edge.
        fluxmeter.set_reference(Box::new(GcclyReference::with_height_range(200.0, 500.0)));
        fluxmeter.whereami(&Position::new(45.0, 3.0, 0.0));
        assert_eq!((fluxmeter.ztop(), fluxmeter.zref()), (200.0, 200.0));
    }

    #[test]
    fn zero_energy_is_a_bad_input() {
        let geometry = Geometry::new(vec![]);
        let mut fluxmeter = Fluxmeter::with_physics(Physics::default(), geometry).unwrap();
        let (handler, seen) = capture();
        fluxmeter.set_error_handler(Some(handler));

        let flux = fluxmeter.flux(&observer(0.0, 90.0, 0.0));
        assert_eq!(flux, Flux::default());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], "bad kinetic energy (0)");
    }

    #[test]
    fn untagged_csda_under_a_geomagnet_cannot_be_transported() {
        let geometry = Geometry::new(vec![]);
        let mut fluxmeter = Fluxmeter::with_physics(Physics::default(), geometry).unwrap();
        fluxmeter.set_geomagnet(Some(Box::new(crate::geomagnet::Dipole::igrf_2020())));
        let (handler, seen) = capture();
        fluxmeter.set_error_handler(Some(handler));

        let state = fluxmeter.transport(&observer(0.0, 90.0, 1.0));
        assert_eq!(state.weight, 0.0);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], "bad pid (0)");
    }

    #[test]
    fn whereami_maps_the_column() {
        let geometry = Geometry::new(vec![Layer::new("Rock", 100.0)]);
        let mut fluxmeter = Fluxmeter::with_physics(Physics::default(), geometry).unwrap();

        assert_eq!(fluxmeter.whereami(&Position::new(45.0, 3.0, 0.0)), Some(0));
        assert_eq!(
            fluxmeter.whereami(&Position::new(45.0, 3.0, 100.0 + 1.0)),
            Some(2) // above ztop = zmax: the external atmosphere region
        );
        assert_eq!(
            fluxmeter.whereami(&Position::new(45.0, 3.0, crate::constants::ZMIN - 1.0)),
            None
        );
        assert_eq!(
            fluxmeter.whereami(&Position::new(45.0, 3.0, crate::constants::ZMAX + 1.0)),
            None
        );
    }
}
