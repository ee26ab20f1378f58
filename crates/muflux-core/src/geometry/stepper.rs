//! Step locators over the stratified geometry.
//!
//! A stepper is an ordered stack of boundary surfaces. Locating an ECEF
//! point returns the index of the region it sits in — the number of surfaces
//! at or below its geodetic height — together with a safe step length: the
//! smallest vertical gap to any surface, scaled down over terrain (where the
//! surface height changes with the horizontal coordinates) and floored at
//! [`EPSILON_FLT`]. The transport engine detects crossings after the fact
//! and refines them, so the step only has to be a sound lower bound near
//! flat surfaces and a conservative probe length near terrain.

use crate::constants::{EPSILON_FLT, ZMAX, ZMIN};
use crate::coordinates::ecef_to_geodetic;
use crate::geometry::Geometry;

/// Down-scaling of terrain gaps, so sloped surfaces are probed more often.
const SLOPE_FACTOR: f64 = 0.4;

/// One boundary surface of a stepper.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Surface {
    /// A surface of constant geodetic height.
    Flat(f64),
    /// The top surface of a user layer (elevation map plus offset).
    Terrain(usize),
}

/// An ordered stack of boundary surfaces, bottom first.
#[derive(Debug, Clone, Default)]
pub(crate) struct Stepper {
    surfaces: Vec<Surface>,
}

impl Stepper {
    /// The full-column stepper: ZMIN floor, one surface per user layer,
    /// ztop, ZMAX ceiling.
    pub fn layered(geometry: &Geometry, ztop: f64) -> Self {
        let mut surfaces = Vec::with_capacity(geometry.len() + 3);
        surfaces.push(Surface::Flat(ZMIN));
        for (i, layer) in geometry.layers().enumerate() {
            surfaces.push(match layer.map() {
                Some(_) => Surface::Terrain(i),
                None => Surface::Flat(layer.offset()),
            });
        }
        surfaces.push(Surface::Flat(ztop));
        surfaces.push(Surface::Flat(ZMAX));
        Self { surfaces }
    }

    /// The atmosphere-only stepper: zref floor, ZMAX ceiling.
    pub fn opensky(zref: f64) -> Self {
        Self {
            surfaces: vec![Surface::Flat(zref), Surface::Flat(ZMAX)],
        }
    }

    /// Number of surfaces in the stack.
    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    /// Region index and safe step length at an ECEF position.
    ///
    /// Region `k` means the point sits at or above `k` surfaces; 0 is below
    /// the stack and `len()` above it.
    pub fn locate(&self, geometry: &Geometry, ecef: &[f64; 3]) -> (usize, f64) {
        let position = ecef_to_geodetic(ecef);
        let height = position.height;

        let mut region = 0;
        let mut step = f64::INFINITY;
        for surface in &self.surfaces {
            let (z, slope) = match *surface {
                Surface::Flat(z) => (z, 1.0),
                Surface::Terrain(index) => {
                    let layer = geometry.layer(index).expect("surface without layer");
                    let (x, y) = layer.project(&position);
                    (layer.height(x, y), SLOPE_FACTOR)
                }
            };
            if height >= z {
                region += 1;
            }
            step = step.min((height - z).abs() * slope);
        }
        (region, step.max(EPSILON_FLT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinates::{ecef_from_geodetic, Position};
    use crate::geometry::Layer;
    use approx::assert_relative_eq;

    fn at(height: f64) -> [f64; 3] {
        ecef_from_geodetic(&Position::new(45.0, 3.0, height))
    }

    #[test]
    fn regions_count_surfaces_below() {
        let geometry = Geometry::new(vec![Layer::new("Rock", 100.0)]);
        let stepper = Stepper::layered(&geometry, 500.0);
        assert_eq!(stepper.len(), 4);

        assert_eq!(stepper.locate(&geometry, &at(ZMIN - 10.0)).0, 0);
        assert_eq!(stepper.locate(&geometry, &at(0.0)).0, 1); // rock
        assert_eq!(stepper.locate(&geometry, &at(300.0)).0, 2); // atmosphere
        assert_eq!(stepper.locate(&geometry, &at(1000.0)).0, 3); // external
        assert_eq!(stepper.locate(&geometry, &at(ZMAX + 1.0)).0, 4); // outside
    }

    #[test]
    fn step_is_the_nearest_vertical_gap() {
        let geometry = Geometry::new(vec![Layer::new("Rock", 100.0)]);
        let stepper = Stepper::layered(&geometry, 500.0);
        let (_, step) = stepper.locate(&geometry, &at(130.0));
        assert_relative_eq!(step, 30.0, max_relative = 1e-6);
        let (_, step) = stepper.locate(&geometry, &at(480.0));
        assert_relative_eq!(step, 20.0, max_relative = 1e-6);
    }

    #[test]
    fn step_never_degenerates() {
        let geometry = Geometry::new(vec![Layer::new("Rock", 100.0)]);
        let stepper = Stepper::layered(&geometry, 500.0);
        let (_, step) = stepper.locate(&geometry, &at(100.0));
        assert!(step >= EPSILON_FLT);
    }

    #[test]
    fn opensky_has_two_surfaces() {
        let geometry = Geometry::new(vec![]);
        let stepper = Stepper::opensky(0.0);
        assert_eq!(stepper.locate(&geometry, &at(-5.0)).0, 0);
        assert_eq!(stepper.locate(&geometry, &at(5000.0)).0, 1);
        assert_eq!(stepper.locate(&geometry, &at(ZMAX + 5.0)).0, 2);
    }
}
