use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::StressKernel;
use crate::error::{Result, SimulationError};
use crate::format;

pub const DEFAULT_TABLE_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableQuantity {
    Xy,
    XyDiffX,
}

impl TableQuantity {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableQuantity::Xy => "xy",
            TableQuantity::XyDiffX => "xy_diff_x",
        }
    }
}

impl fmt::Display for TableQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableQuantity {
    type Err = SimulationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "xy" => Ok(TableQuantity::Xy),
            "xy_diff_x" => Ok(TableQuantity::XyDiffX),
            other => Err(SimulationError::UnknownTableQuantity(other.to_string())),
        }
    }
}

/// File name of a precomputed periodic stress table.
pub fn table_file_name(quantity: TableQuantity, size: usize, r0: f64) -> String {
    if r0 == 0.0 {
        format!("periodic_stress_{quantity}_{size}x{size}_bin.dat")
    } else {
        format!(
            "periodic_stress_{quantity}_{size}x{size}_r0_{}_bin.dat",
            format::scientific(r0, 0)
        )
    }
}

/// Bilinear cell lookup for a wrapped displacement.
struct Cell {
    xi: usize,
    yi: usize,
    xn: usize,
    yn: usize,
    fx: f64,
    fy: f64,
}

/// Stress kernel interpolated from a precomputed `n × n` grid.
///
/// Close to the origin the grid cannot resolve the `1/r` singularity, so
/// the isolated-dislocation field is used below `r_in` and blended
/// linearly in `r²` into the table up to `r_out`.
#[derive(Debug, Clone, Default)]
pub struct TableKernel {
    size: usize,
    r0: f64,
    inner_sq: f64,
    outer_sq: f64,
    xy: Option<Vec<f64>>,
    xy_diff_x: Option<Vec<f64>>,
}

impl TableKernel {
    /// Loads the `xy` table from `directory` and derives its x-derivative.
    pub fn load(directory: &Path, size: usize, r0: f64) -> Result<Self> {
        let mut kernel = Self::default();
        kernel.load_quantity(directory, TableQuantity::Xy, size, r0)?;
        kernel.load_quantity(directory, TableQuantity::XyDiffX, size, r0)?;
        Ok(kernel)
    }

    /// Builds a kernel from an in-memory `xy` grid, first index along x.
    pub fn from_xy_table(size: usize, r0: f64, values: Vec<f64>) -> Result<Self> {
        if values.len() != size * size {
            return Err(SimulationError::MalformedTable {
                path: PathBuf::from("<memory>"),
                reason: format!("expected {} values, found {}", size * size, values.len()),
            });
        }
        let mut kernel = Self::default();
        kernel.configure(size, r0)?;
        kernel.xy = Some(values);
        kernel.derive_diff_x()?;
        Ok(kernel)
    }

    pub fn load_quantity(
        &mut self,
        directory: &Path,
        quantity: TableQuantity,
        size: usize,
        r0: f64,
    ) -> Result<()> {
        self.configure(size, r0)?;
        match quantity {
            TableQuantity::XyDiffX => self.derive_diff_x(),
            TableQuantity::Xy => {
                let path = directory.join(table_file_name(quantity, size, r0));
                self.xy = Some(read_table(&path, size)?);
                Ok(())
            }
        }
    }

    fn configure(&mut self, size: usize, r0: f64) -> Result<()> {
        if size < 2 {
            return Err(SimulationError::InvalidSettings(format!(
                "stress table size must be at least 2, got {size}"
            )));
        }
        if self.r0 != 0.0 && r0 != self.r0 {
            return Err(SimulationError::TableRadiusMismatch {
                loaded: self.r0,
                requested: r0,
            });
        }
        if self.xy.is_some() && size != self.size {
            return Err(SimulationError::InvalidSettings(format!(
                "stress table size {size} differs from the loaded size {}",
                self.size
            )));
        }
        self.r0 = r0;
        self.size = size;
        let n = size as f64;
        self.inner_sq = 225.0 / (n * n);
        self.outer_sq = 1.3 * self.inner_sq;
        Ok(())
    }

    fn derive_diff_x(&mut self) -> Result<()> {
        let xy = self.xy.as_ref().ok_or(SimulationError::MissingBaseTable)?;
        let n = self.size;
        let mut diff = vec![0.0; n * n];
        for i in 0..n {
            let next = (i + 1) % n;
            let prev = (i + n - 1) % n;
            for j in 0..n {
                diff[i * n + j] = (xy[next * n + j] - xy[prev * n + j]) / 2.0 * n as f64;
            }
        }
        self.xy_diff_x = Some(diff);
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn r0(&self) -> f64 {
        self.r0
    }

    /// Centered-difference derivative grid derived at load time.
    ///
    /// This is the in-memory `xy_diff_x` table of the file layout. Kernel
    /// evaluation differentiates the `xy` interpolant directly, so the
    /// Jacobian matches the derivative of the interpolated stress.
    pub fn derivative_table(&self) -> Option<&[f64]> {
        self.xy_diff_x.as_deref()
    }

    fn table(&self) -> Result<&[f64]> {
        self.xy.as_deref().ok_or(SimulationError::MissingBaseTable)
    }

    fn cell(&self, mut x: f64, mut y: f64) -> Cell {
        let n = self.size;
        if x < 0.0 {
            x += 1.0;
        }
        if y < 0.0 {
            y += 1.0;
        }
        let xconv = x * n as f64;
        let yconv = y * n as f64;
        let xfloor = xconv.floor();
        let yfloor = yconv.floor();
        let xi = (xfloor as usize).min(n - 1);
        let yi = (yfloor as usize).min(n - 1);
        Cell {
            xi,
            yi,
            xn: (xi + 1) % n,
            yn: (yi + 1) % n,
            fx: xconv - xfloor,
            fy: yconv - yfloor,
        }
    }

    fn bilinear(&self, table: &[f64], x: f64, y: f64) -> f64 {
        let n = self.size;
        let c = self.cell(x, y);
        (1.0 - c.fx) * (1.0 - c.fy) * table[c.xi * n + c.yi]
            + (1.0 - c.fx) * c.fy * table[c.xi * n + c.yn]
            + c.fx * (1.0 - c.fy) * table[c.xn * n + c.yi]
            + c.fx * c.fy * table[c.xn * n + c.yn]
    }

    fn bilinear_dx(&self, table: &[f64], x: f64, y: f64) -> f64 {
        let n = self.size;
        let c = self.cell(x, y);
        let scale = n as f64;
        scale
            * ((1.0 - c.fy) * (table[c.xn * n + c.yi] - table[c.xi * n + c.yi])
                + c.fy * (table[c.xn * n + c.yn] - table[c.xi * n + c.yn]))
    }

    fn blend_weight(&self, r2: f64) -> f64 {
        (r2 - self.inner_sq) / (self.outer_sq - self.inner_sq)
    }
}

fn isolated_xy(x: f64, y: f64, r2: f64) -> f64 {
    x * (x * x - y * y) / (r2 * r2)
}

fn isolated_xy_diff_x(x: f64, y: f64, r2: f64) -> f64 {
    let (x2, y2) = (x * x, y * y);
    -(x2 * x2 + y2 * y2 - 6.0 * x2 * y2) / (r2 * r2 * r2)
}

impl StressKernel for TableKernel {
    fn xy(&self, dx: f64, dy: f64) -> Result<f64> {
        let table = self.table()?;
        let r2 = dx * dx + dy * dy;
        if r2 == 0.0 {
            return Err(SimulationError::CoincidentPositions);
        }
        if r2 > self.outer_sq {
            return Ok(self.bilinear(table, dx, dy));
        }
        let inner = isolated_xy(dx, dy, r2);
        if r2 < self.inner_sq {
            return Ok(inner);
        }
        let mul = self.blend_weight(r2);
        Ok((1.0 - mul) * inner + mul * self.bilinear(table, dx, dy))
    }

    fn xy_diff_x(&self, dx: f64, dy: f64) -> Result<f64> {
        let table = self.table()?;
        let r2 = dx * dx + dy * dy;
        if r2 == 0.0 {
            return Err(SimulationError::CoincidentPositions);
        }
        if r2 > self.outer_sq {
            return Ok(self.bilinear_dx(table, dx, dy));
        }
        let inner_dx = isolated_xy_diff_x(dx, dy, r2);
        if r2 < self.inner_sq {
            return Ok(inner_dx);
        }
        let mul = self.blend_weight(r2);
        let mul_dx = 2.0 * dx / (self.outer_sq - self.inner_sq);
        let inner = isolated_xy(dx, dy, r2);
        let tabulated = self.bilinear(table, dx, dy);
        Ok((1.0 - mul) * inner_dx
            + mul * self.bilinear_dx(table, dx, dy)
            + mul_dx * (tabulated - inner))
    }
}

fn read_table(path: &Path, size: usize) -> Result<Vec<f64>> {
    let bytes = fs::read(path).map_err(|source| SimulationError::io(path, source))?;
    let expected = size * size * std::mem::size_of::<f64>();
    if bytes.len() < expected {
        return Err(SimulationError::MalformedTable {
            path: path.to_path_buf(),
            reason: format!("expected {expected} bytes, found {}", bytes.len()),
        });
    }
    Ok(bytes[..expected]
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            f64::from_le_bytes(raw)
        })
        .collect())
}
