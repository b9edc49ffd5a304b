//! Binary-diff patching of serialized map payloads.
//!
//! Kept apart from the live decode path: a corrupt diff is an error for the
//! caller, it never stalls a link.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! "FLDIFF01" | control_len u64 | diff_len u64 | new_len u64
//! control: (copy u64, extra u64, seek i64) * n
//! diff block (copy bytes, added to the old bytes) | extra block (inserted verbatim)
//! ```

use thiserror::Error;

use crate::geometry::MapGrid;

pub const DIFF_MAGIC: &[u8; 8] = b"FLDIFF01";
const HEADER_LEN: usize = 32;
const TUPLE_LEN: usize = 24;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("missing or incorrect diff header")]
    BadHeader,
    #[error("diff is truncated")]
    Truncated,
    #[error("control tuple {0} reads or writes out of bounds")]
    OutOfBounds(usize),
    #[error("patched output has {actual} bytes, header declares {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("patched payload is not a map grid: {0}")]
    InvalidGrid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Control {
    copy: usize,
    extra: usize,
    seek: i64,
}

pub fn is_diff(bytes: &[u8]) -> bool {
    bytes.starts_with(DIFF_MAGIC)
}

/// Produce a diff turning `old` into `new`.
///
/// Emits one copy tuple per run of matching length, adding byte deltas over
/// the common prefix and carrying the remainder as extra bytes.
pub fn diff(old: &[u8], new: &[u8]) -> Vec<u8> {
    let common = old.len().min(new.len());
    let control = Control {
        copy: common,
        extra: new.len() - common,
        seek: 0,
    };

    let delta: Vec<u8> = old[..common]
        .iter()
        .zip(&new[..common])
        .map(|(&o, &n)| n.wrapping_sub(o))
        .collect();
    let extra = &new[common..];

    let mut out = Vec::with_capacity(HEADER_LEN + TUPLE_LEN + delta.len() + extra.len());
    out.extend_from_slice(DIFF_MAGIC);
    out.extend_from_slice(&(TUPLE_LEN as u64).to_le_bytes());
    out.extend_from_slice(&(delta.len() as u64).to_le_bytes());
    out.extend_from_slice(&(new.len() as u64).to_le_bytes());
    out.extend_from_slice(&(control.copy as u64).to_le_bytes());
    out.extend_from_slice(&(control.extra as u64).to_le_bytes());
    out.extend_from_slice(&control.seek.to_le_bytes());
    out.extend_from_slice(&delta);
    out.extend_from_slice(extra);
    out
}

pub fn apply(old: &[u8], patch: &[u8]) -> Result<Vec<u8>, PatchError> {
    if patch.len() < HEADER_LEN || !is_diff(patch) {
        return Err(PatchError::BadHeader);
    }
    let control_len = read_len(&patch[8..16])?;
    let diff_len = read_len(&patch[16..24])?;
    let new_len = read_len(&patch[24..32])?;
    if control_len % TUPLE_LEN != 0 {
        return Err(PatchError::BadHeader);
    }

    let control_end = HEADER_LEN
        .checked_add(control_len)
        .ok_or(PatchError::Truncated)?;
    let diff_end = control_end.checked_add(diff_len).ok_or(PatchError::Truncated)?;
    if patch.len() < diff_end {
        return Err(PatchError::Truncated);
    }
    let controls = parse_controls(&patch[HEADER_LEN..control_end])?;
    let diff_block = &patch[control_end..diff_end];
    let extra_block = &patch[diff_end..];
    // Every output byte comes from the diff or extra block
    if new_len > diff_block.len() + extra_block.len() {
        return Err(PatchError::BadHeader);
    }

    let mut out = Vec::with_capacity(new_len);
    let mut old_pos: usize = 0;
    let mut diff_pos: usize = 0;
    let mut extra_pos: usize = 0;

    for (i, ctl) in controls.iter().enumerate() {
        let old_end = old_pos.checked_add(ctl.copy).ok_or(PatchError::OutOfBounds(i))?;
        let delta_end = diff_pos.checked_add(ctl.copy).ok_or(PatchError::OutOfBounds(i))?;
        let extra_end = extra_pos.checked_add(ctl.extra).ok_or(PatchError::OutOfBounds(i))?;
        if old_end > old.len()
            || delta_end > diff_block.len()
            || extra_end > extra_block.len()
            || out.len() + ctl.copy + ctl.extra > new_len
        {
            return Err(PatchError::OutOfBounds(i));
        }

        out.extend(
            old[old_pos..old_end]
                .iter()
                .zip(&diff_block[diff_pos..delta_end])
                .map(|(&o, &d)| o.wrapping_add(d)),
        );
        out.extend_from_slice(&extra_block[extra_pos..extra_end]);

        diff_pos = delta_end;
        extra_pos = extra_end;
        let seeked = i64::try_from(old_end)
            .ok()
            .and_then(|pos| pos.checked_add(ctl.seek))
            .ok_or(PatchError::OutOfBounds(i))?;
        old_pos = usize::try_from(seeked).map_err(|_| PatchError::OutOfBounds(i))?;
    }

    if out.len() != new_len {
        return Err(PatchError::LengthMismatch {
            expected: new_len,
            actual: out.len(),
        });
    }
    Ok(out)
}

/// Apply a diff produced against the JSON form of `base`.
pub fn apply_to_grid(base: &MapGrid, patch: &[u8]) -> Result<MapGrid, PatchError> {
    let old = serde_json::to_vec(base).map_err(|e| PatchError::InvalidGrid(e.to_string()))?;
    let new = apply(&old, patch)?;
    serde_json::from_slice(&new).map_err(|e| PatchError::InvalidGrid(e.to_string()))
}

pub fn diff_grids(base: &MapGrid, target: &MapGrid) -> Result<Vec<u8>, PatchError> {
    let old = serde_json::to_vec(base).map_err(|e| PatchError::InvalidGrid(e.to_string()))?;
    let new = serde_json::to_vec(target).map_err(|e| PatchError::InvalidGrid(e.to_string()))?;
    Ok(diff(&old, &new))
}

fn read_len(bytes: &[u8]) -> Result<usize, PatchError> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| PatchError::Truncated)?;
    usize::try_from(u64::from_le_bytes(raw)).map_err(|_| PatchError::BadHeader)
}

fn parse_controls(bytes: &[u8]) -> Result<Vec<Control>, PatchError> {
    bytes
        .chunks_exact(TUPLE_LEN)
        .map(|tuple| {
            let seek: [u8; 8] = tuple[16..24].try_into().map_err(|_| PatchError::Truncated)?;
            Ok(Control {
                copy: read_len(&tuple[0..8])?,
                extra: read_len(&tuple[8..16])?,
                seek: i64::from_le_bytes(seek),
            })
        })
        .collect()
}
