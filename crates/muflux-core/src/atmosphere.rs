//! US-standard atmosphere (CORSIKA parameterisation).

use crate::constants::{ATMOSPHERE_SHELL_B, ATMOSPHERE_SHELL_C, ATMOSPHERE_SHELL_HEIGHT};

fn shell_density(height: f64, lambda: f64, b: f64) -> f64 {
    10.0 * b / lambda * (-height / lambda).exp()
}

/// Local density and scale length at an altitude.
///
/// Four exponential shells; above the topmost shell ceiling the density is
/// pinned at its boundary value. Returns (density in kg/m³, scale length
/// λ in m).
pub fn density(height: f64) -> (f64, f64) {
    for i in 0..4 {
        if height < ATMOSPHERE_SHELL_HEIGHT[i] {
            let lambda = ATMOSPHERE_SHELL_C[i] * 1e-2;
            return (shell_density(height, lambda, ATMOSPHERE_SHELL_B[i]), lambda);
        }
    }
    let lambda = ATMOSPHERE_SHELL_C[3] * 1e-2;
    (
        shell_density(ATMOSPHERE_SHELL_HEIGHT[3], lambda, ATMOSPHERE_SHELL_B[3]),
        lambda,
    )
}

/// Recommended step over which the density stays representative, in m.
///
/// The scale length is stretched by the slant of the trajectory, floored at
/// a tenth so that near-horizontal rays keep a bounded step.
pub fn slant_step(lambda: f64, sin_elevation: f64) -> f64 {
    let mut c = sin_elevation.abs();
    if c < 0.1 {
        c = 0.1;
    }
    lambda / c
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use is_close::is_close;

    #[test]
    fn sea_level_density_is_realistic() {
        let (rho, lambda) = density(0.0);
        assert!(is_close!(rho, 1.23, rel_tol = 0.02));
        assert_relative_eq!(lambda, 9941.8638, max_relative = 1e-10);
    }

    #[test]
    fn density_decreases_with_altitude() {
        let mut previous = f64::INFINITY;
        for height in [0.0, 2e3, 5e3, 15e3, 50e3, 90e3] {
            let (rho, _) = density(height);
            assert!(rho < previous);
            previous = rho;
        }
    }

    #[test]
    fn density_is_pinned_above_the_top_shell() {
        let (top, _) = density(1e5);
        let (above, _) = density(3e5);
        assert_eq!(top, above);
    }

    #[test]
    fn shells_join_without_large_jumps() {
        for boundary in [4e3, 1e4, 4e4] {
            let (below, _) = density(boundary - 1e-6);
            let (above, _) = density(boundary + 1e-6);
            assert!(is_close!(below, above, rel_tol = 0.05));
        }
    }

    #[test]
    fn slant_step_floors_the_sine() {
        assert_relative_eq!(slant_step(1e4, 1.0), 1e4);
        assert_relative_eq!(slant_step(1e4, 0.5), 2e4);
        assert_relative_eq!(slant_step(1e4, 0.01), 1e5);
        assert_relative_eq!(slant_step(1e4, -1.0), 1e4);
    }
}
