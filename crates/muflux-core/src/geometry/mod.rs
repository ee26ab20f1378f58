//! Layered topographic geometry.

pub mod layer;
pub mod map;
pub mod projection;
pub(crate) mod stepper;

pub use layer::Layer;
pub use map::ElevationMap;
pub use projection::Projection;

/// An ordered stack of layers, index 0 bottommost.
///
/// The stack is structurally immutable once built: layers can neither be
/// added nor removed, and only their bulk density stays editable (through
/// [`Geometry::layer_mut`]).
#[derive(Debug, Clone, Default)]
pub struct Geometry {
    layers: Vec<Layer>,
}

impl Geometry {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self { layers }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    /// Mutable access to a layer, for density edits between fluxmeter calls.
    pub fn layer_mut(&mut self, index: usize) -> Option<&mut Layer> {
        self.layers.get_mut(index)
    }

    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }

    /// Highest top-surface height over all layers, in m.
    ///
    /// Negative infinity lower bound when there are no layers, so that any
    /// reference support sits above it.
    pub(crate) fn zmax(&self) -> f64 {
        self.layers
            .iter()
            .map(|layer| layer.z()[1])
            .fold(-f64::MAX, f64::max)
    }
}
