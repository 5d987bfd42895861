//! Tile Upload Stage
//!
//! Copies source texels for newly mapped tiles into reserved textures.
//! Regular tiles go through a ring of staging buffers, one per frame in
//! flight, each holding `capacity` tiles at fixed 64 KiB offsets. Packed
//! tails go through whole-subresource writes.

use smallvec::SmallVec;

use crate::backend::{BufferId, CopyRegion, StreamingBackend};
use crate::texture::TiledTexture;
use crate::tiling::{TileInfo, TILE_SIZE_IN_BYTES};
use crate::{StreamingError, StreamingResult};

/// Borrowed texel data of one source mip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubresourceData<'a> {
    pub data: &'a [u8],
    /// Bytes per row of compression blocks
    pub row_pitch: u32,
}

/// Staging ring for per-frame tile uploads
#[derive(Debug)]
pub struct TileUploadStage {
    buffers: SmallVec<[BufferId; 3]>,
    capacity_tiles: u32,
    current: usize,
    used: u32,
    total_uploaded: u64,
}

impl TileUploadStage {
    /// Create one staging buffer of `capacity_tiles` tiles per frame in flight
    pub fn new(
        backend: &mut dyn StreamingBackend,
        frames_in_flight: u32,
        capacity_tiles: u32,
    ) -> StreamingResult<Self> {
        let size = capacity_tiles as u64 * TILE_SIZE_IN_BYTES as u64;
        let buffers = (0..frames_in_flight.max(1))
            .map(|_| backend.create_staging_buffer(size))
            .collect::<StreamingResult<SmallVec<_>>>()?;

        log::debug!(
            "Tile upload stage: {} staging buffers of {} tiles",
            buffers.len(),
            capacity_tiles
        );
        Ok(Self {
            buffers,
            capacity_tiles,
            current: 0,
            used: 0,
            total_uploaded: 0,
        })
    }

    /// Select this frame's staging buffer and reset its tile counter
    pub fn begin_frame(&mut self, frame_index: u64) {
        self.current = (frame_index % self.buffers.len() as u64) as usize;
        self.used = 0;
    }

    /// Tiles one staging buffer holds
    pub fn capacity(&self) -> u32 {
        self.capacity_tiles
    }

    pub fn remaining(&self) -> u32 {
        self.capacity_tiles - self.used
    }

    /// Regular tiles staged this frame
    pub fn uploaded(&self) -> u32 {
        self.used
    }

    /// Regular tiles staged since creation
    pub fn total_uploaded(&self) -> u64 {
        self.total_uploaded
    }

    /// Stage one regular tile and copy it into the reserved texture
    ///
    /// Returns `Ok(false)` without copying once this frame's staging buffer
    /// is full. Edge tiles copy only their true texel rectangle.
    pub fn upload_tile(
        &mut self,
        backend: &mut dyn StreamingBackend,
        texture: &TiledTexture,
        tile: &TileInfo,
        source: SubresourceData<'_>,
    ) -> StreamingResult<bool> {
        if self.used >= self.capacity_tiles {
            return Ok(false);
        }
        let Some(&buffer) = self.buffers.get(self.current) else {
            return Ok(false);
        };

        let format = texture.desc().format;
        let (block_width, block_height) = format.block_dimensions();
        let bytes_per_block = format
            .block_copy_size(None)
            .ok_or_else(|| StreamingError::Backend(format!("{:?} has no block size", format)))?;

        let blocks_x = tile.width.div_ceil(block_width);
        let rows = tile.height.div_ceil(block_height);
        let row_pitch = blocks_x * bytes_per_block;
        if row_pitch as u64 * rows as u64 > TILE_SIZE_IN_BYTES as u64 {
            return Err(StreamingError::Backend(format!(
                "tile of '{}' mip {} exceeds {} bytes",
                texture.name(),
                tile.mip,
                TILE_SIZE_IN_BYTES
            )));
        }

        let first_row = tile.y / block_height;
        let first_column_offset = (tile.x / block_width * bytes_per_block) as usize;
        let mut staged = Vec::with_capacity((row_pitch * rows) as usize);
        for row in 0..rows {
            let start = (first_row + row) as usize * source.row_pitch as usize + first_column_offset;
            let bytes = source
                .data
                .get(start..start + row_pitch as usize)
                .ok_or_else(|| StreamingError::SourceDataTooSmall {
                    name: texture.name().to_string(),
                    mip: tile.mip,
                })?;
            staged.extend_from_slice(bytes);
        }

        let offset = self.used as u64 * TILE_SIZE_IN_BYTES as u64;
        backend.write_staging(buffer, offset, &staged)?;
        backend.copy_staging_to_tile(
            buffer,
            texture.reserved_texture(),
            CopyRegion {
                buffer_offset: offset,
                row_pitch,
                dest: *tile,
            },
        );

        self.used += 1;
        self.total_uploaded += 1;
        log::trace!(
            "Staged '{}' mip {} tile at ({}, {})",
            texture.name(),
            tile.mip,
            tile.x,
            tile.y
        );
        Ok(true)
    }

    /// Write every packed mip of a texture
    ///
    /// Not limited by the staging capacity.
    pub fn upload_packed_mips<'a>(
        &self,
        backend: &mut dyn StreamingBackend,
        texture: &TiledTexture,
        source: impl Fn(u32) -> Option<SubresourceData<'a>>,
    ) -> StreamingResult<()> {
        let tiling = texture.tiling();
        for mip in tiling.num_standard_mips()..tiling.desc.mip_levels {
            let data = source(mip).ok_or_else(|| StreamingError::SourceDataTooSmall {
                name: texture.name().to_string(),
                mip,
            })?;
            backend.write_subresource(texture.reserved_texture(), mip, data.data, data.row_pitch)?;
        }
        Ok(())
    }

    /// Destroy the staging buffers
    pub fn destroy(self, backend: &mut dyn StreamingBackend) {
        for buffer in self.buffers {
            backend.destroy_buffer(buffer);
        }
    }
}
