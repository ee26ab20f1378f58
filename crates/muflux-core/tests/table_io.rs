//! File-backed inputs: packed reference tables, ASCII elevation grids and
//! physics material tables.

use std::io::Write;

use approx::{assert_abs_diff_eq, assert_relative_eq};
use tempfile::TempDir;

use muflux_core::{Fluxmeter, Geometry, Layer, MufluxError, ReferenceFlux, ReferenceTable};
use muflux_physics::Physics;

/// Serialise a table in the packed little-endian wire format.
fn write_table(
    path: &std::path::Path,
    shape: (i64, i64, i64),
    range: [f64; 6],
    data: &[f32],
) {
    let mut file = std::fs::File::create(path).unwrap();
    for n in [shape.0, shape.1, shape.2] {
        file.write_all(&n.to_le_bytes()).unwrap();
    }
    for r in range {
        file.write_all(&r.to_le_bytes()).unwrap();
    }
    for v in data {
        file.write_all(&v.to_le_bytes()).unwrap();
    }
}

#[test]
fn packed_table_round_trips_through_a_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("reference.table");

    // 2 energies x 2 angles x 1 altitude; muon component first.
    let data = [1.0f32, 0.5, 2.0, 1.0, 3.0, 1.5, 4.0, 2.0];
    write_table(
        &path,
        (2, 2, 1),
        [1.0, 100.0, 0.0, 1.0, 0.0, 0.0],
        &data,
    );

    let table = ReferenceTable::from_file(&path).unwrap();
    assert_eq!(table.shape(), (2, 2, 1));
    assert_eq!(table.energy_min(), 1.0);
    assert_eq!(table.energy_max(), 100.0);
    assert_eq!(table.height_min(), 0.0);
    assert_eq!(table.height_max(), 0.0);

    // Vertex (k_min, c_max, h_min): value and asymmetry straight off the
    // stored pair.
    let flux = table.flux(0.0, 90.0, 1.0);
    assert_relative_eq!(flux.value, 3.0 + 1.5, max_relative = 1e-12);
    assert_relative_eq!(
        flux.asymmetry,
        (3.0 - 1.5) / (3.0 + 1.5),
        max_relative = 1e-12
    );
}

#[test]
fn a_fluxmeter_samples_a_bound_table() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("reference.table");
    let data = [1.0f32, 0.5, 2.0, 1.0, 3.0, 1.5, 4.0, 2.0];
    write_table(
        &path,
        (2, 2, 1),
        [1.0, 100.0, 0.0, 1.0, 0.0, 0.0],
        &data,
    );
    let table = ReferenceTable::from_file(&path).unwrap();

    let mut fluxmeter = Fluxmeter::with_physics(Physics::default(), Geometry::default()).unwrap();
    fluxmeter.set_reference(Box::new(table));

    let state = muflux_core::State {
        pid: muflux_core::Pid::Any,
        position: muflux_core::Position::new(45.0, 3.0, 0.0),
        direction: muflux_core::Direction::new(0.0, 90.0),
        energy: 1.0,
        weight: 0.0,
    };
    let flux = fluxmeter.flux(&state);
    assert_relative_eq!(flux.value, 4.5, max_relative = 1e-9);
}

#[test]
fn missing_table_is_an_io_error() {
    let result = ReferenceTable::from_file("/nonexistent/reference.table");
    assert!(matches!(result, Err(MufluxError::Io { .. })));
}

#[test]
fn truncated_table_is_a_format_error() {
    let dir = TempDir::new().unwrap();

    let path = dir.path().join("short-header.table");
    std::fs::write(&path, [0u8; 16]).unwrap();
    assert!(matches!(
        ReferenceTable::from_file(&path),
        Err(MufluxError::Format(_))
    ));

    let path = dir.path().join("short-body.table");
    write_table(&path, (2, 2, 1), [1.0, 100.0, 0.0, 1.0, 0.0, 0.0], &[1.0; 3]);
    assert!(matches!(
        ReferenceTable::from_file(&path),
        Err(MufluxError::Format(_))
    ));

    let path = dir.path().join("bad-shape.table");
    write_table(&path, (0, 2, 1), [1.0, 100.0, 0.0, 1.0, 0.0, 0.0], &[]);
    assert!(matches!(
        ReferenceTable::from_file(&path),
        Err(MufluxError::Format(_))
    ));
}

#[test]
fn layers_load_ascii_elevation_models() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("terrain.asc");
    std::fs::write(
        &path,
        "\
ncols 3
nrows 3
xllcorner 2.0
yllcorner 44.0
cellsize 0.5
100 100 100
50 50 50
0 0 0
",
    )
    .unwrap();

    let layer = Layer::from_model("Rock", &path, 25.0).unwrap();
    assert_eq!(layer.model(), Some(path.display().to_string().as_str()));
    assert_eq!(layer.encoding(), Some("asc"));
    assert_eq!(layer.nx(), 3);
    assert_eq!(layer.ny(), 3);
    // Offset folds into the advertised height range.
    assert_eq!(layer.z(), [25.0, 125.0]);
    // Node rows run south to north.
    assert_abs_diff_eq!(layer.height(2.75, 44.25), 25.0);
    assert_abs_diff_eq!(layer.height(2.75, 45.25), 125.0);
}

#[test]
fn missing_elevation_model_is_an_io_error() {
    assert!(matches!(
        Layer::from_model("Rock", "/nonexistent/terrain.asc", 0.0),
        Err(MufluxError::Io { .. })
    ));
}

#[test]
fn physics_tables_load_from_json() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("materials.json");
    std::fs::write(
        &path,
        r#"{
  "materials": [
    {"name": "Rock", "density": 2650.0, "a": 2.17e-4, "b": 3.4e-7, "x0": 265.0},
    {"name": "Air", "density": 1.205, "a": 2.18e-4, "b": 2.9e-7, "x0": 366.2}
  ]
}"#,
    )
    .unwrap();

    let geometry = Geometry::new(vec![Layer::new("Rock", 10.0)]);
    let fluxmeter = Fluxmeter::new(&path, geometry).unwrap();
    assert_eq!(fluxmeter.ztop(), 10.0);

    // A geometry asking for a material absent from the file fails setup.
    let geometry = Geometry::new(vec![Layer::new("Water", 10.0)]);
    assert!(matches!(
        Fluxmeter::new(&path, geometry),
        Err(MufluxError::PhysicsSetup(_))
    ));
}
