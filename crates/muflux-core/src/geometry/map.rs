//! In-memory elevation grids.
//!
//! An [`ElevationMap`] is a node-registered rectilinear grid of heights with
//! bilinear interpolation. Grids come either from an ESRI ASCII raster
//! (`.asc`, the one DEM format the library commits to) or from an array
//! built by the caller; anything richer is expected to be decoded upstream.

use std::path::Path;

use ndarray::Array2;

use crate::errors::{MufluxError, MufluxResult};
use crate::geometry::projection::Projection;

/// A rectilinear elevation grid.
#[derive(Debug, Clone)]
pub struct ElevationMap {
    /// Heights, indexed as `[iy, ix]` with `iy = 0` at `ymin`.
    data: Array2<f64>,
    x: [f64; 2],
    y: [f64; 2],
    z: [f64; 2],
    projection: Projection,
    encoding: &'static str,
}

impl ElevationMap {
    /// Build a grid from an array of heights.
    ///
    /// Row 0 of `data` sits at `y[0]`; nodes span the bounds inclusively.
    pub fn from_array(
        data: Array2<f64>,
        x: [f64; 2],
        y: [f64; 2],
        projection: Projection,
    ) -> MufluxResult<Self> {
        let (ny, nx) = data.dim();
        if nx < 2 || ny < 2 {
            return Err(MufluxError::Format(format!(
                "grid too small ({nx} x {ny})"
            )));
        }
        if !(x[1] > x[0]) || !(y[1] > y[0]) {
            return Err(MufluxError::Format("empty grid domain".to_string()));
        }
        let mut z = [f64::INFINITY, f64::NEG_INFINITY];
        for &value in data.iter() {
            if !value.is_finite() {
                return Err(MufluxError::Format("non-finite grid node".to_string()));
            }
            z[0] = z[0].min(value);
            z[1] = z[1].max(value);
        }
        Ok(Self {
            data,
            x,
            y,
            z,
            projection,
            encoding: "memory",
        })
    }

    /// Load an ESRI ASCII grid.
    ///
    /// Nodes are placed at cell centres; data rows run north to south.
    pub fn from_ascii_file<P: AsRef<Path>>(path: P) -> MufluxResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| MufluxError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut map = Self::parse_ascii(&content)
            .map_err(|why| MufluxError::Format(format!("{}: {}", path.display(), why)))?;
        map.encoding = "asc";
        tracing::debug!(
            target: "muflux",
            path = %path.display(),
            nx = map.nx(),
            ny = map.ny(),
            "loaded elevation map"
        );
        Ok(map)
    }

    fn parse_ascii(content: &str) -> Result<Self, String> {
        let mut tokens = content.split_whitespace();
        let mut ncols: Option<usize> = None;
        let mut nrows: Option<usize> = None;
        let mut xll: Option<f64> = None;
        let mut yll: Option<f64> = None;
        let mut cellsize: Option<f64> = None;

        // Header: key/value pairs until the first bare number.
        let first_value = loop {
            let token = tokens.next().ok_or("truncated header")?;
            if let Ok(value) = token.parse::<f64>() {
                break value;
            }
            let value: f64 = tokens
                .next()
                .ok_or_else(|| format!("missing value for {token}"))?
                .parse()
                .map_err(|_| format!("bad value for {token}"))?;
            match token.to_ascii_lowercase().as_str() {
                "ncols" => ncols = Some(value as usize),
                "nrows" => nrows = Some(value as usize),
                "xllcorner" => xll = Some(value),
                "yllcorner" => yll = Some(value),
                "cellsize" => cellsize = Some(value),
                "nodata_value" => {}
                other => return Err(format!("unknown header field {other}")),
            }
        };

        let nx = ncols.ok_or("missing ncols")?;
        let ny = nrows.ok_or("missing nrows")?;
        let xll = xll.ok_or("missing xllcorner")?;
        let yll = yll.ok_or("missing yllcorner")?;
        let cell = cellsize.ok_or("missing cellsize")?;
        if nx < 2 || ny < 2 || !(cell > 0.0) {
            return Err("degenerate grid".to_string());
        }

        let mut values = Vec::with_capacity(nx * ny);
        values.push(first_value);
        for token in tokens {
            let value: f64 = token
                .parse()
                .map_err(|_| format!("bad grid value {token}"))?;
            values.push(value);
        }
        if values.len() != nx * ny {
            return Err(format!(
                "expected {} values, found {}",
                nx * ny,
                values.len()
            ));
        }

        // Rows arrive north first; store south first.
        let mut data = Array2::zeros((ny, nx));
        for (r, row) in values.chunks(nx).enumerate() {
            for (c, &value) in row.iter().enumerate() {
                data[[ny - 1 - r, c]] = value;
            }
        }

        let x0 = xll + 0.5 * cell;
        let y0 = yll + 0.5 * cell;
        Self::from_array(
            data,
            [x0, x0 + (nx - 1) as f64 * cell],
            [y0, y0 + (ny - 1) as f64 * cell],
            Projection::Geographic,
        )
        .map_err(|err| err.to_string())
    }

    /// Replace the projection (e.g. for `.asc` files with UTM coordinates).
    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn nx(&self) -> usize {
        self.data.dim().1
    }

    pub fn ny(&self) -> usize {
        self.data.dim().0
    }

    /// Map-coordinate bounds along x.
    pub fn x(&self) -> [f64; 2] {
        self.x
    }

    /// Map-coordinate bounds along y.
    pub fn y(&self) -> [f64; 2] {
        self.y
    }

    /// Height range of the grid nodes.
    pub fn z(&self) -> [f64; 2] {
        self.z
    }

    pub fn projection(&self) -> Projection {
        self.projection
    }

    pub fn encoding(&self) -> &str {
        self.encoding
    }

    /// Node spacing, as (dx, dy).
    pub fn resolution(&self) -> (f64, f64) {
        (
            (self.x[1] - self.x[0]) / (self.nx() - 1) as f64,
            (self.y[1] - self.y[0]) / (self.ny() - 1) as f64,
        )
    }

    fn cell(&self, x: f64, y: f64) -> Option<(usize, usize, f64, f64)> {
        if !(self.x[0]..=self.x[1]).contains(&x) || !(self.y[0]..=self.y[1]).contains(&y) {
            return None;
        }
        let (dx, dy) = self.resolution();
        let hx = (x - self.x[0]) / dx;
        let hy = (y - self.y[0]) / dy;
        let ix = (hx as usize).min(self.nx() - 2);
        let iy = (hy as usize).min(self.ny() - 2);
        Some((ix, iy, hx - ix as f64, hy - iy as f64))
    }

    /// Bilinear height at map coordinates, `None` outside the domain.
    pub fn elevation(&self, x: f64, y: f64) -> Option<f64> {
        let (ix, iy, hx, hy) = self.cell(x, y)?;
        let z00 = self.data[[iy, ix]];
        let z10 = self.data[[iy, ix + 1]];
        let z01 = self.data[[iy + 1, ix]];
        let z11 = self.data[[iy + 1, ix + 1]];
        Some(
            z00 * (1.0 - hx) * (1.0 - hy)
                + z10 * hx * (1.0 - hy)
                + z01 * (1.0 - hx) * hy
                + z11 * hx * hy,
        )
    }

    /// Gradient of the bilinear patch, `None` outside the domain.
    pub fn gradient(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let (ix, iy, hx, hy) = self.cell(x, y)?;
        let (dx, dy) = self.resolution();
        let z00 = self.data[[iy, ix]];
        let z10 = self.data[[iy, ix + 1]];
        let z01 = self.data[[iy + 1, ix]];
        let z11 = self.data[[iy + 1, ix + 1]];
        let gx = ((z10 - z00) * (1.0 - hy) + (z11 - z01) * hy) / dx;
        let gy = ((z01 - z00) * (1.0 - hx) + (z11 - z10) * hx) / dy;
        Some((gx, gy))
    }
}
