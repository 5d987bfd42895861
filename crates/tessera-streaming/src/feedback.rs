//! Feedback Decoding
//!
//! Converts resolved sampler feedback into tile requirements and derives the
//! min-mip values shaders use to clamp sampling to resident data.

use glam::UVec2;

use crate::tiling::TextureTiling;
use crate::{StreamingError, StreamingResult};

/// Resolved value of a region no shader sampled
pub const NOT_SAMPLED: u8 = 0xFF;

/// Minimum sampled mip per feedback region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinMipMap {
    grid: UVec2,
    values: Vec<u8>,
}

impl MinMipMap {
    /// Map with every region unsampled
    pub fn not_sampled(grid: UVec2) -> Self {
        Self {
            grid,
            values: vec![NOT_SAMPLED; (grid.x * grid.y) as usize],
        }
    }

    /// Decode a resolve buffer of one byte per region, row-major
    ///
    /// Trailing bytes past the region count are row padding and ignored.
    pub fn decode(grid: UVec2, data: &[u8]) -> StreamingResult<Self> {
        let expected = (grid.x * grid.y) as usize;
        if data.len() < expected {
            return Err(StreamingError::FeedbackSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            grid,
            values: data[..expected].to_vec(),
        })
    }

    pub fn grid(&self) -> UVec2 {
        self.grid
    }

    pub fn values(&self) -> &[u8] {
        &self.values
    }

    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.values[(y * self.grid.x + x) as usize]
    }

    /// Check whether any region was sampled
    pub fn any_sampled(&self) -> bool {
        self.values.iter().any(|&v| v != NOT_SAMPLED)
    }

    /// Resample onto a follower texture's region grid
    ///
    /// Each follower region takes the finest mip of the primary regions it
    /// overlaps, shifted by `mip_offset` levels and clamped at mip 0.
    pub fn resample(&self, grid: UVec2, mip_offset: u32) -> Self {
        let mut values = Vec::with_capacity((grid.x * grid.y) as usize);
        let span = |f: u32, follower: u32, primary: u32| {
            let start = (f * primary / follower).min(primary - 1);
            let end = ((f + 1) * primary).div_ceil(follower).clamp(start + 1, primary);
            start..end
        };

        for fy in 0..grid.y {
            let rows = span(fy, grid.y, self.grid.y);
            for fx in 0..grid.x {
                let cols = span(fx, grid.x, self.grid.x);
                let finest = rows
                    .clone()
                    .flat_map(|py| cols.clone().map(move |px| (px, py)))
                    .map(|(px, py)| self.get(px, py))
                    .min()
                    .unwrap_or(NOT_SAMPLED);
                values.push(match finest {
                    NOT_SAMPLED => NOT_SAMPLED,
                    mip => mip.saturating_sub(mip_offset.min(u8::MAX as u32) as u8),
                });
            }
        }

        Self { grid, values }
    }
}

/// Mark the tiles a feedback map requires
///
/// A region sampled at mip `v` needs every covering tile from `v` through the
/// last standard mip. The packed tail is always required. Bits are only set,
/// never cleared, so several maps can be merged into one mask.
pub fn mark_required_tiles(tiling: &TextureTiling, map: &MinMipMap, required: &mut [bool]) {
    for tile in tiling.packed_tiles() {
        required[tile as usize] = true;
    }

    let num_standard = tiling.num_standard_mips();
    if num_standard == 0 {
        return;
    }

    let grid = tiling.feedback_grid();
    for ry in 0..grid.y.min(map.grid().y) {
        for rx in 0..grid.x.min(map.grid().x) {
            let value = map.get(rx, ry);
            if value == NOT_SAMPLED {
                continue;
            }
            for mip in (value as u32).min(num_standard)..num_standard {
                required[tiling.tile_covering_region(mip, rx, ry) as usize] = true;
            }
        }
    }
}

/// Compute the finest fully resident mip per feedback region
///
/// A region's value is the finest `m` such that every covering tile from `m`
/// through the last standard mip is resident. It is the number of standard
/// mips when only the packed tail is resident and `mip_levels` when nothing is.
pub fn compute_min_mip(tiling: &TextureTiling, resident: impl Fn(u32) -> bool, out: &mut Vec<f32>) {
    let grid = tiling.feedback_grid();
    let num_standard = tiling.num_standard_mips();
    let packed_resident = tiling.packed_tiles().all(&resident);

    out.clear();
    for ry in 0..grid.y {
        for rx in 0..grid.x {
            if !packed_resident {
                out.push(tiling.desc.mip_levels as f32);
                continue;
            }

            let mut finest = num_standard;
            for mip in (0..num_standard).rev() {
                if !resident(tiling.tile_covering_region(mip, rx, ry)) {
                    break;
                }
                finest = mip;
            }
            out.push(finest as f32);
        }
    }
}
