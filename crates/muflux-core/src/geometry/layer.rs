//! Topographic layers.

use std::path::Path;

use crate::constants::ZMIN;
use crate::coordinates::Position;
use crate::errors::MufluxResult;
use crate::geometry::map::ElevationMap;
use crate::geometry::projection::Projection;

/// One stratum of the layered geometry.
///
/// A layer is a material filling everything below its top surface — the
/// elevation map shifted by the offset, or a flat plane at the offset when
/// no map is attached. The bulk density is the only property that stays
/// mutable after construction; `None` defers to the material's default
/// density from the physics tables.
#[derive(Debug, Clone)]
pub struct Layer {
    material: String,
    model: Option<String>,
    offset: f64,
    density: Option<f64>,
    map: Option<ElevationMap>,
}

impl Layer {
    /// A flat layer topped at `offset`.
    pub fn new(material: impl Into<String>, offset: f64) -> Self {
        Self {
            material: material.into(),
            model: None,
            offset,
            density: None,
            map: None,
        }
    }

    /// A layer topped by an elevation model loaded from `path`.
    pub fn from_model<P: AsRef<Path>>(
        material: impl Into<String>,
        path: P,
        offset: f64,
    ) -> MufluxResult<Self> {
        let path = path.as_ref();
        let map = ElevationMap::from_ascii_file(path)?;
        Ok(Self {
            material: material.into(),
            model: Some(path.display().to_string()),
            offset,
            density: None,
            map: Some(map),
        })
    }

    /// A layer topped by an in-memory elevation map.
    pub fn with_map(material: impl Into<String>, map: ElevationMap, offset: f64) -> Self {
        Self {
            material: material.into(),
            model: None,
            offset,
            density: None,
            map: Some(map),
        }
    }

    pub fn material(&self) -> &str {
        &self.material
    }

    /// Path of the elevation model, when loaded from a file.
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Bulk density override, in kg/m³.
    pub fn density(&self) -> Option<f64> {
        self.density
    }

    /// Set the bulk density; `None` restores the material default.
    pub fn set_density(&mut self, density: Option<f64>) {
        self.density = density;
    }

    pub fn map(&self) -> Option<&ElevationMap> {
        self.map.as_ref()
    }

    pub fn encoding(&self) -> Option<&str> {
        self.map.as_ref().map(|m| m.encoding())
    }

    pub fn projection(&self) -> Option<Projection> {
        self.map.as_ref().map(|m| m.projection())
    }

    pub fn nx(&self) -> usize {
        self.map.as_ref().map_or(0, |m| m.nx())
    }

    pub fn ny(&self) -> usize {
        self.map.as_ref().map_or(0, |m| m.ny())
    }

    /// Map-coordinate domain. Map-less layers span the whole globe.
    pub fn x(&self) -> [f64; 2] {
        self.map.as_ref().map_or([-180.0, 180.0], |m| m.x())
    }

    pub fn y(&self) -> [f64; 2] {
        self.map.as_ref().map_or([-90.0, 90.0], |m| m.y())
    }

    /// Height range of the top surface, including the offset.
    pub fn z(&self) -> [f64; 2] {
        match &self.map {
            None => [self.offset, self.offset],
            Some(map) => {
                let z = map.z();
                [z[0] + self.offset, z[1] + self.offset]
            }
        }
    }

    /// Top-surface height at map coordinates, in m.
    ///
    /// Returns the [`ZMIN`] sentinel outside the map domain.
    pub fn height(&self, x: f64, y: f64) -> f64 {
        match &self.map {
            None => self.offset,
            Some(map) => match map.elevation(x, y) {
                Some(z) => z + self.offset,
                None => ZMIN,
            },
        }
    }

    /// Top-surface gradient at map coordinates; zero outside the domain.
    pub fn gradient(&self, x: f64, y: f64) -> (f64, f64) {
        match &self.map {
            None => (0.0, 0.0),
            Some(map) => map.gradient(x, y).unwrap_or((0.0, 0.0)),
        }
    }

    /// Geographic position of map coordinates, with the surface height.
    pub fn coordinates(&self, x: f64, y: f64) -> Position {
        let (latitude, longitude) = match &self.map {
            None => (y, x),
            Some(map) => map.projection().unproject(x, y),
        };
        Position {
            latitude,
            longitude,
            height: self.height(x, y),
        }
    }

    /// Map coordinates of a geographic position.
    pub fn project(&self, position: &Position) -> (f64, f64) {
        match &self.map {
            None => (position.longitude, position.latitude),
            Some(map) => map
                .projection()
                .project(position.latitude, position.longitude),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::Array2;

    fn bump_map() -> ElevationMap {
        let nx = 21;
        let ny = 21;
        let data = Array2::from_shape_fn((ny, nx), |(iy, ix)| {
            let x = ix as f64 / (nx - 1) as f64;
            let y = iy as f64 / (ny - 1) as f64;
            100.0 * x * y
        });
        ElevationMap::from_array(data, [2.9, 3.1], [44.9, 45.1], Projection::Geographic).unwrap()
    }

    #[test]
    fn flat_layer_is_its_offset_everywhere() {
        let layer = Layer::new("Rock", 250.0);
        assert_relative_eq!(layer.height(0.0, 0.0), 250.0);
        assert_relative_eq!(layer.height(120.0, -45.0), 250.0);
        assert_eq!(layer.gradient(1.0, 2.0), (0.0, 0.0));
        assert_eq!(layer.z(), [250.0, 250.0]);
        assert_eq!(layer.x(), [-180.0, 180.0]);
        assert_eq!(layer.nx(), 0);
    }

    #[test]
    fn offset_shifts_heights_and_leaves_the_sentinel() {
        let base = Layer::with_map("Rock", bump_map(), 0.0);
        let lifted = Layer::with_map("Rock", bump_map(), 75.0);
        for &(x, y) in &[(3.0, 45.0), (2.95, 44.95), (3.08, 45.05)] {
            assert_relative_eq!(
                lifted.height(x, y) - base.height(x, y),
                75.0,
                max_relative = 1e-12
            );
        }
        // Outside the domain both stay at the sentinel floor.
        assert_eq!(base.height(10.0, 45.0), ZMIN);
        assert_eq!(lifted.height(10.0, 45.0), ZMIN);
        assert_eq!(lifted.z(), [75.0, 175.0]);
    }

    #[test]
    fn identity_projection_round_trip_is_exact() {
        let layer = Layer::new("Rock", 0.0);
        let position = Position::new(45.5, 3.25, 0.0);
        let (x, y) = layer.project(&position);
        let back = layer.coordinates(x, y);
        assert_eq!(back.latitude, position.latitude);
        assert_eq!(back.longitude, position.longitude);
    }

    #[test]
    fn mapped_projection_round_trip() {
        let map = bump_map().with_projection(Projection::Utm {
            zone: 31,
            north: true,
        });
        let layer = Layer::with_map("Rock", map, 0.0);
        let position = Position::new(45.02, 3.01, 0.0);
        let (x, y) = layer.project(&position);
        let back = layer.coordinates(x, y);
        assert_abs_diff_eq!(back.latitude, position.latitude, epsilon = 1e-8);
        assert_abs_diff_eq!(back.longitude, position.longitude, epsilon = 1e-8);
    }

    #[test]
    fn density_is_editable() {
        let mut layer = Layer::new("Rock", 0.0);
        assert_eq!(layer.density(), None);
        layer.set_density(Some(2000.0));
        assert_eq!(layer.density(), Some(2000.0));
    }
}
