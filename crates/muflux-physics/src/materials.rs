//! Material registry and continuous energy-loss tables.
//!
//! Each material carries a two-parameter Groom fit of the average muon
//! stopping power, `dE/dX = a + b·E` (E kinetic, MKS units: `a` in
//! GeV·m²/kg, `b` in 1/(kg/m²)), a radiation length for multiple-scattering
//! estimates and a default bulk density. The fit admits closed forms for the
//! CSDA energy evolution over a column depth, which the transport loop uses
//! to avoid integration error.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::{EnergyLossMode, PropagationDirection};

/// Error type for physics-table operations.
#[derive(Error, Debug)]
pub enum PhysicsError {
    #[error("could not open {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("bad material table ({0})")]
    Format(String),
    #[error("unknown material ({0})")]
    UnknownMaterial(String),
    #[error("transport step budget exhausted")]
    StepLimit,
}

/// Opaque index of a material inside a [`Physics`] registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaterialIndex(pub(crate) usize);

/// One entry of a material table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialDefinition {
    /// Material name, matched case-sensitively by [`Physics::material_index`].
    pub name: String,
    /// Default bulk density, in kg/m³.
    pub density: f64,
    /// Ionisation term of the stopping power, in GeV·m²/kg.
    pub a: f64,
    /// Radiative term of the stopping power, in 1/(kg/m²).
    pub b: f64,
    /// Radiation length, in kg/m².
    pub x0: f64,
}

#[derive(Debug, Deserialize)]
struct MaterialFile {
    materials: Vec<MaterialDefinition>,
}

/// A loaded set of physics tables.
#[derive(Debug, Clone)]
pub struct Physics {
    materials: Vec<MaterialDefinition>,
}

impl Default for Physics {
    /// Built-in tables with Standard Rock, Water and Air.
    fn default() -> Self {
        Self {
            materials: vec![
                MaterialDefinition {
                    name: "Rock".to_string(),
                    density: 2650.0,
                    a: 2.17e-4,
                    b: 3.4e-7,
                    x0: 265.0,
                },
                MaterialDefinition {
                    name: "Water".to_string(),
                    density: 1000.0,
                    a: 2.27e-4,
                    b: 3.0e-7,
                    x0: 360.8,
                },
                MaterialDefinition {
                    name: "Air".to_string(),
                    density: 1.205,
                    a: 2.18e-4,
                    b: 2.9e-7,
                    x0: 366.2,
                },
            ],
        }
    }
}

impl Physics {
    /// Load a material table from a JSON file.
    ///
    /// The expected layout is
    /// `{"materials": [{"name", "density", "a", "b", "x0"}, ...]}` with MKS
    /// units as documented on [`MaterialDefinition`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PhysicsError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| PhysicsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: MaterialFile = serde_json::from_str(&content)
            .map_err(|err| PhysicsError::Format(format!("{}: {}", path.display(), err)))?;
        Self::from_definitions(file.materials)
    }

    /// Build a registry from explicit definitions.
    pub fn from_definitions(
        materials: Vec<MaterialDefinition>,
    ) -> Result<Self, PhysicsError> {
        if materials.is_empty() {
            return Err(PhysicsError::Format("empty material table".to_string()));
        }
        for (i, m) in materials.iter().enumerate() {
            if !(m.a > 0.0) || m.b < 0.0 || !(m.x0 > 0.0) || !(m.density > 0.0) {
                return Err(PhysicsError::Format(format!(
                    "bad coefficients for material {}",
                    m.name
                )));
            }
            if materials[..i].iter().any(|other| other.name == m.name) {
                return Err(PhysicsError::Format(format!(
                    "duplicated material {}",
                    m.name
                )));
            }
        }
        Ok(Self { materials })
    }

    /// Resolve a material by name.
    pub fn material_index(&self, name: &str) -> Result<MaterialIndex, PhysicsError> {
        self.materials
            .iter()
            .position(|m| m.name == name)
            .map(MaterialIndex)
            .ok_or_else(|| PhysicsError::UnknownMaterial(name.to_string()))
    }

    /// Number of registered materials.
    pub fn len(&self) -> usize {
        self.materials.len()
    }

    /// Whether the registry is empty. It never is for a constructed instance.
    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    /// Definition of a registered material.
    pub fn material(&self, index: MaterialIndex) -> &MaterialDefinition {
        &self.materials[index.0]
    }

    /// Default bulk density of a material, in kg/m³.
    pub fn default_density(&self, index: MaterialIndex) -> f64 {
        self.materials[index.0].density
    }

    /// Average stopping power `dE/dX`, in GeV·m²/kg.
    ///
    /// The mode parameter mirrors the transport contract; the built-in
    /// tables carry a single continuous-loss fit, so all enabled modes
    /// evaluate the same `a + b·E`.
    pub fn stopping_power(
        &self,
        mode: EnergyLossMode,
        index: MaterialIndex,
        energy: f64,
    ) -> f64 {
        if mode == EnergyLossMode::Disabled || energy < 0.0 {
            return 0.0;
        }
        let m = &self.materials[index.0];
        m.a + m.b * energy
    }

    /// Kinetic energy after traversing a column depth `grammage` (kg/m²).
    ///
    /// Forward transport loses energy, backward transport gains it. The
    /// result is floored at zero.
    pub(crate) fn energy_after(
        &self,
        index: MaterialIndex,
        direction: PropagationDirection,
        energy: f64,
        grammage: f64,
    ) -> f64 {
        let m = &self.materials[index.0];
        let out = if m.b > 0.0 {
            let pivot = m.a / m.b;
            match direction {
                PropagationDirection::Forward => {
                    (energy + pivot) * (-m.b * grammage).exp() - pivot
                }
                PropagationDirection::Backward => {
                    (energy + pivot) * (m.b * grammage).exp() - pivot
                }
            }
        } else {
            match direction {
                PropagationDirection::Forward => energy - m.a * grammage,
                PropagationDirection::Backward => energy + m.a * grammage,
            }
        };
        out.max(0.0)
    }

    /// Column depth needed to evolve `energy` to `limit`, in kg/m².
    ///
    /// Returns `Some(0.0)` when the limit is already met or exceeded in the
    /// transport direction, `None` when the limit lies on the wrong side of
    /// an infinite column (cannot happen for `a > 0`).
    pub(crate) fn grammage_to_limit(
        &self,
        index: MaterialIndex,
        direction: PropagationDirection,
        energy: f64,
        limit: f64,
    ) -> Option<f64> {
        let m = &self.materials[index.0];
        match direction {
            PropagationDirection::Forward => {
                if energy <= limit {
                    return Some(0.0);
                }
                if m.b > 0.0 {
                    Some(((m.a + m.b * energy) / (m.a + m.b * limit)).ln() / m.b)
                } else {
                    Some((energy - limit) / m.a)
                }
            }
            PropagationDirection::Backward => {
                if energy >= limit {
                    return Some(0.0);
                }
                if m.b > 0.0 {
                    Some(((m.a + m.b * limit) / (m.a + m.b * energy)).ln() / m.b)
                } else {
                    Some((limit - energy) / m.a)
                }
            }
        }
    }
}
