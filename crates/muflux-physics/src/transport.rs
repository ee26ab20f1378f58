//! The transport loop.
//!
//! The engine advances a [`ParticleState`] through the geometry seen via a
//! [`MediumLocator`], one bounded step at a time:
//!
//! 1. query the locator for the current medium and a safe geometric step;
//! 2. bound the step by `accuracy ×` the medium's recommended step and by
//!    the column depth remaining to the energy limit (closed form);
//! 3. move, update energy / weight / proper time / grammage;
//! 4. if the locator reports a different medium, refine the crossing by
//!    bisection so the state lands within [`BOUNDARY_RESOLUTION`] of the
//!    surface, on the far side;
//! 5. stop when a masked event fires or the geometry is exited.
//!
//! Backward transport accumulates the reverse CSDA Jacobian,
//! `weight ×= s(E_after)/s(E_before)` per step, which telescopes to the
//! stopping-power ratio across each traversed medium.

use crate::materials::{MaterialIndex, Physics, PhysicsError};
use crate::prng::Prng;
use crate::state::{
    EnergyLossMode, Event, Locals, MediumId, MediumLocator, ParticleState,
    PropagationDirection, ScatteringMode, TransportContext,
};
use crate::{MUON_MASS, STEP_MIN};

/// Path-length accuracy of the boundary refinement, in m.
pub const BOUNDARY_RESOLUTION: f64 = 1e-7;

/// Hard cap on the number of steps of a single transport call.
const MAX_STEPS: usize = 4_000_000;

/// Cause of an energy-limit clamp within a step.
#[derive(Clone, Copy, PartialEq)]
enum Clamp {
    None,
    /// The context energy limit.
    Limit(f64),
    /// The implicit zero floor of forward transport.
    Stopped,
}

impl Physics {
    /// Transport a state until the first stop cause.
    ///
    /// Returns the event and the (entry, exit) media of the final step. The
    /// exit medium is `None` when the geometry was exited; both are `None`
    /// when the initial position is already outside.
    pub fn transport<L: MediumLocator>(
        &self,
        ctx: &TransportContext,
        locator: &L,
        state: &mut ParticleState,
        prng: &mut Prng,
    ) -> Result<(Event, [Option<MediumId>; 2]), PhysicsError> {
        let (medium, mut geometric_step) = locator.locate(state);
        let Some(mut current) = medium else {
            return Ok((Event::Medium, [None, None]));
        };

        let mut loss_active = ctx.energy_loss != EnergyLossMode::Disabled;
        for _ in 0..MAX_STEPS {
            let locals = locator.locals(current, state);

            let mut h = geometric_step.max(STEP_MIN);
            if let Some(recommended) = locals.step_limit {
                h = h.min((ctx.accuracy * recommended).max(STEP_MIN));
            }

            // Clamp the step at the energy limit (closed form, so the limit
            // is landed on exactly rather than overshot).
            let mut clamp = Clamp::None;
            if loss_active && locals.density > 0.0 {
                let mut nearest = f64::INFINITY;
                if let Some(limit) = ctx.energy_limit {
                    if let Some(x) = self.grammage_to_limit(
                        current.material,
                        ctx.direction,
                        state.energy,
                        limit,
                    ) {
                        nearest = x / locals.density;
                        clamp = Clamp::Limit(limit);
                    }
                }
                if ctx.direction == PropagationDirection::Forward {
                    let x = self
                        .grammage_to_limit(
                            current.material,
                            PropagationDirection::Forward,
                            state.energy,
                            0.0,
                        )
                        .unwrap_or(f64::INFINITY);
                    let d = x / locals.density;
                    if d < nearest {
                        nearest = d;
                        clamp = Clamp::Stopped;
                    }
                }
                if nearest <= h {
                    h = nearest;
                } else {
                    clamp = Clamp::None;
                }
            }

            let start = state.clone();
            self.advance(state, ctx, current.material, &locals, loss_active, h);

            let (after, next_step) = locator.locate(state);
            if after != Some(current) {
                // Medium changed somewhere within [0, h]: land just past the
                // first crossing.
                let exit = self.refine_crossing(
                    ctx, locator, &start, current, &locals, loss_active, h, state,
                );
                if exit.is_none() {
                    return Ok((Event::Medium, [Some(current), None]));
                }
                if ctx.event.medium {
                    return Ok((Event::Medium, [Some(current), exit]));
                }
                current = exit.unwrap();
                geometric_step = locator.locate(state).1;
                continue;
            }

            // Step accepted within one medium: apply the stochastic and
            // field deflections, then resolve a pending energy clamp.
            self.deflect(ctx, current.material, &start, &locals, state, prng, h);

            match clamp {
                Clamp::Limit(limit) => {
                    state.energy = limit;
                    if ctx.event.energy_limit {
                        return Ok((Event::EnergyLimit, [Some(current), Some(current)]));
                    }
                    // Unmasked limit: pin the energy and keep going.
                    loss_active = false;
                }
                Clamp::Stopped => {
                    state.energy = 0.0;
                    return Ok((Event::EnergyLimit, [Some(current), Some(current)]));
                }
                _ => {}
            }

            geometric_step = next_step;
        }
        Err(PhysicsError::StepLimit)
    }

    /// Deterministic advance over a step of length `h` in a uniform medium.
    fn advance(
        &self,
        state: &mut ParticleState,
        ctx: &TransportContext,
        material: MaterialIndex,
        locals: &Locals,
        loss_active: bool,
        h: f64,
    ) {
        let sign = match ctx.direction {
            PropagationDirection::Forward => 1.0,
            PropagationDirection::Backward => -1.0,
        };
        for i in 0..3 {
            state.position[i] += sign * state.direction[i] * h;
        }
        state.distance += h;

        let p = state.momentum();
        if p > 0.0 {
            state.time += h * MUON_MASS / p;
        }

        let grammage = locals.density * h;
        state.grammage += grammage;

        if loss_active && grammage > 0.0 {
            let before = state.energy;
            let after = self.energy_after(material, ctx.direction, before, grammage);
            if ctx.direction == PropagationDirection::Backward {
                let s0 = self.stopping_power(ctx.energy_loss, material, before);
                let s1 = self.stopping_power(ctx.energy_loss, material, after);
                if s0 > 0.0 {
                    state.weight *= s1 / s0;
                }
            }
            state.energy = after;
        }
    }

    /// Locate the first medium change within a step and place the state just
    /// past it. Returns the medium on the far side.
    #[allow(clippy::too_many_arguments)]
    fn refine_crossing<L: MediumLocator>(
        &self,
        ctx: &TransportContext,
        locator: &L,
        start: &ParticleState,
        current: MediumId,
        locals: &Locals,
        loss_active: bool,
        h: f64,
        state: &mut ParticleState,
    ) -> Option<MediumId> {
        let mut lo = 0.0_f64;
        let mut hi = 1.0_f64;
        if h > BOUNDARY_RESOLUTION {
            let mut probe = start.clone();
            while (hi - lo) * h > BOUNDARY_RESOLUTION {
                let mid = 0.5 * (lo + hi);
                probe.position = displaced(start, ctx, mid * h);
                if locator.locate(&probe).0 == Some(current) {
                    lo = mid;
                } else {
                    hi = mid;
                }
            }
        }

        *state = start.clone();
        self.advance(state, ctx, current.material, locals, loss_active, hi * h);

        // Numerical safety: make sure the state really sits on the far side.
        let mut exit = locator.locate(state).0;
        let mut nudges = 0;
        while exit == Some(current) && nudges < 32 {
            self.advance(state, ctx, current.material, locals, loss_active, STEP_MIN);
            exit = locator.locate(state).0;
            nudges += 1;
        }
        exit
    }

    /// Multiple scattering and magnetic bending over an accepted step.
    #[allow(clippy::too_many_arguments)]
    fn deflect(
        &self,
        ctx: &TransportContext,
        material: MaterialIndex,
        start: &ParticleState,
        locals: &Locals,
        state: &mut ParticleState,
        prng: &mut Prng,
        h: f64,
    ) {
        if ctx.scattering == ScatteringMode::Mixed && locals.density > 0.0 {
            let grammage = locals.density * h;
            let x0 = self.material(material).x0;
            let t = grammage / x0;
            let p = start.momentum();
            let e_total = start.energy + MUON_MASS;
            if t > 1e-12 && p > 0.0 {
                let beta_p = p * p / e_total;
                let theta0 =
                    13.6e-3 / beta_p * t.sqrt() * (1.0 + 0.038 * t.ln()).max(0.0);
                if theta0 > 0.0 {
                    let (e1, e2) = transverse_basis(&state.direction);
                    let tx = theta0 * prng.normal();
                    let ty = theta0 * prng.normal();
                    for i in 0..3 {
                        state.direction[i] += tx * e1[i] + ty * e2[i];
                    }
                    normalise(&mut state.direction);
                }
            }
        }

        if let Some(field) = locals.magnet {
            let p = state.momentum();
            if p > 0.0 {
                let sign = match ctx.direction {
                    PropagationDirection::Forward => 1.0,
                    PropagationDirection::Backward => -1.0,
                };
                let kappa = 0.299792458 * state.charge / p;
                let d = state.direction;
                let cross = [
                    d[1] * field[2] - d[2] * field[1],
                    d[2] * field[0] - d[0] * field[2],
                    d[0] * field[1] - d[1] * field[0],
                ];
                for i in 0..3 {
                    state.direction[i] += sign * kappa * h * cross[i];
                }
                normalise(&mut state.direction);
            }
        }
    }
}

fn displaced(start: &ParticleState, ctx: &TransportContext, h: f64) -> [f64; 3] {
    let sign = match ctx.direction {
        PropagationDirection::Forward => 1.0,
        PropagationDirection::Backward => -1.0,
    };
    [
        start.position[0] + sign * start.direction[0] * h,
        start.position[1] + sign * start.direction[1] * h,
        start.position[2] + sign * start.direction[2] * h,
    ]
}

fn normalise(v: &mut [f64; 3]) {
    let norm = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

fn transverse_basis(direction: &[f64; 3]) -> ([f64; 3], [f64; 3]) {
    let axis = if direction[0].abs() < 0.5 {
        [1.0, 0.0, 0.0]
    } else {
        [0.0, 1.0, 0.0]
    };
    let mut e1 = [
        axis[1] * direction[2] - axis[2] * direction[1],
        axis[2] * direction[0] - axis[0] * direction[2],
        axis[0] * direction[1] - axis[1] * direction[0],
    ];
    normalise(&mut e1);
    let e2 = [
        direction[1] * e1[2] - direction[2] * e1[1],
        direction[2] * e1[0] - direction[0] * e1[2],
        direction[0] * e1[1] - direction[1] * e1[0],
    ];
    (e1, e2)
}
