use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Occupancy cell value for unknown/unobserved space.
pub const UNKNOWN_CELL: i32 = -1;
/// Occupancy maps report probabilities scaled to 0-100.
pub const OCCUPANCY_MAX: i32 = 100;

pub type Cells = Vec<Vec<i32>>;

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("array of {len} cells does not match {width}x{height}")]
    ShapeMismatch {
        len: usize,
        width: usize,
        height: usize,
    },
    #[error("grid rows have unequal lengths")]
    RaggedGrid,
    #[error("grid has no cells")]
    EmptyGrid,
    #[error("max value must be positive, got {0}")]
    InvalidMaxValue(i32),
    #[error("png encoding failed: {0}")]
    Encode(#[from] png::EncodingError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };
}

/// How yaw is presented to display consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YawConvention {
    /// Raw `atan2` result in degrees, `(-180, 180]`, counter-clockwise positive.
    Signed,
    /// Clockwise-positive compass style, normalized to `[0, 360)`.
    #[default]
    InvertedNormalized,
}

pub fn quaternion_to_yaw_degrees(q: Quaternion, convention: YawConvention) -> f64 {
    let siny_cosp = 2.0 * (q.w * q.z + q.x * q.y);
    let cosy_cosp = 1.0 - 2.0 * (q.y * q.y + q.z * q.z);
    let yaw = siny_cosp.atan2(cosy_cosp).to_degrees();

    match convention {
        YawConvention::Signed => yaw,
        YawConvention::InvertedNormalized => {
            let heading = (-yaw).rem_euclid(360.0);
            // rem_euclid can round up to the modulus for tiny negatives, and
            // keeps the sign of a negated zero
            if heading >= 360.0 || heading == 0.0 {
                0.0
            } else {
                heading
            }
        }
    }
}

/// Slice a row-major flat array into `height` rows of `width` cells.
pub fn convert_1d_to_2d(flat: &[i32], width: usize, height: usize) -> Result<Cells, GeometryError> {
    if width.checked_mul(height) != Some(flat.len()) {
        return Err(GeometryError::ShapeMismatch {
            len: flat.len(),
            width,
            height,
        });
    }
    if width == 0 {
        return Ok(vec![Vec::new(); height]);
    }
    Ok(flat.chunks(width).map(<[i32]>::to_vec).collect())
}

/// Rotate 90° for display, optionally mirroring.
///
/// Source cell `(x, y)` lands at row `cols - x - 1`, column `rows - y - 1` when
/// mirrored or `y` otherwise.
pub fn rotate_and_mirror(grid: &[Vec<i32>], mirror: bool) -> Result<Cells, GeometryError> {
    let rows = grid.len();
    let cols = grid.first().map_or(0, Vec::len);
    if grid.iter().any(|row| row.len() != cols) {
        return Err(GeometryError::RaggedGrid);
    }

    let mut rotated = vec![vec![0; rows]; cols];
    for (y, row) in grid.iter().enumerate() {
        for (x, &cell) in row.iter().enumerate() {
            let column = if mirror { rows - y - 1 } else { y };
            rotated[cols - x - 1][column] = cell;
        }
    }
    Ok(rotated)
}

/// Luminance for one cell; `None` for unknown space.
fn luminance(cell: i32, max_value: i32, invert: bool) -> Option<u8> {
    if cell == UNKNOWN_CELL {
        return None;
    }
    let scaled = (f64::from(cell) / f64::from(max_value) * 255.0).clamp(0.0, 255.0);
    let value = if invert { 255.0 - scaled } else { scaled };
    Some(value as u8)
}

/// RGBA8 pixels for a rectangular grid. Unknown cells are black and fully
/// transparent, everything else is opaque grey.
pub fn rasterize(grid: &[Vec<i32>], max_value: i32, invert: bool) -> Result<Vec<u8>, GeometryError> {
    if max_value <= 0 {
        return Err(GeometryError::InvalidMaxValue(max_value));
    }
    let cols = grid.first().map_or(0, Vec::len);
    if grid.iter().any(|row| row.len() != cols) {
        return Err(GeometryError::RaggedGrid);
    }

    let mut pixels = Vec::with_capacity(grid.len() * cols * 4);
    for &cell in grid.iter().flatten() {
        match luminance(cell, max_value, invert) {
            Some(v) => pixels.extend_from_slice(&[v, v, v, 0xFF]),
            None => pixels.extend_from_slice(&[0, 0, 0, 0]),
        }
    }
    Ok(pixels)
}

pub fn grid_to_png(grid: &[Vec<i32>], max_value: i32, invert: bool) -> Result<Vec<u8>, GeometryError> {
    let height = grid.len();
    let width = grid.first().map_or(0, Vec::len);
    if width == 0 || height == 0 {
        return Err(GeometryError::EmptyGrid);
    }
    let pixels = rasterize(grid, max_value, invert)?;

    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, width as u32, height as u32);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&pixels)?;
        writer.finish()?;
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MapKind {
    Static,
    GlobalCostmap,
    LocalCostmap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapGrid {
    pub kind: MapKind,
    pub width: usize,
    pub height: usize,
    pub resolution: f64,
    pub origin: [f64; 3],
    pub cells: Cells,
}

impl MapGrid {
    pub fn from_flat(
        kind: MapKind,
        flat: &[i32],
        width: usize,
        height: usize,
        resolution: f64,
        origin: [f64; 3],
    ) -> Result<Self, GeometryError> {
        Ok(Self {
            kind,
            width,
            height,
            resolution,
            origin,
            cells: convert_1d_to_2d(flat, width, height)?,
        })
    }

    /// Display-oriented copy; width and height swap.
    pub fn rotated(&self, mirror: bool) -> Result<Self, GeometryError> {
        Ok(Self {
            kind: self.kind,
            width: self.height,
            height: self.width,
            resolution: self.resolution,
            origin: self.origin,
            cells: rotate_and_mirror(&self.cells, mirror)?,
        })
    }

    pub fn to_image(&self, max_value: i32, invert: bool) -> Result<MapImage, GeometryError> {
        Ok(MapImage {
            kind: self.kind,
            width: self.width,
            height: self.height,
            resolution: self.resolution,
            origin: self.origin,
            png: grid_to_png(&self.cells, max_value, invert)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapImage {
    pub kind: MapKind,
    pub width: usize,
    pub height: usize,
    pub resolution: f64,
    pub origin: [f64; 3],
    #[serde(with = "serde_bytes")]
    pub png: Vec<u8>,
}

impl MapImage {
    pub fn png_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.png)
    }
}
