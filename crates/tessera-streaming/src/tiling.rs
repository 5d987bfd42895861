//! Tiling Layout
//!
//! Geometry of reserved textures split into fixed-size memory tiles:
//! - Standard 64 KiB tile shapes per block-compressed format
//! - Standard mips tiled mip-major, row-major
//! - Packed mip tail for mips smaller than one tile
//! - One feedback region per mip 0 tile

use std::ops::Range;

use glam::UVec2;
use smallvec::SmallVec;
use thiserror::Error;
use wgpu::{TextureDimension, TextureFormat};

/// Size of one hardware tile in bytes
pub const TILE_SIZE_IN_BYTES: u32 = 65536;

/// Reasons a texture cannot be backed by tiles
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UntileableReason {
    #[error("texture has a zero-sized dimension or no mips")]
    Empty,

    #[error("volume textures are not tiled")]
    VolumeTexture,

    #[error("array textures are not tiled")]
    ArrayTexture,

    #[error("format is not block compressed")]
    NotBlockCompressed,

    #[error("{mip_levels} mips requested but the full chain has {max}")]
    MipChainTooLong { mip_levels: u32, max: u32 },
}

/// Description of a source texture
#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    /// Logical name, usually the asset path
    pub name: String,
    /// Texel format
    pub format: TextureFormat,
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Depth in texels (1 for 2D textures)
    pub depth: u32,
    /// Number of array slices
    pub array_layers: u32,
    /// Texture dimensionality
    pub dimension: TextureDimension,
    /// Number of mip levels
    pub mip_levels: u32,
}

impl TextureDesc {
    /// Describe a single-slice 2D texture
    pub fn new_2d(
        name: impl Into<String>,
        format: TextureFormat,
        width: u32,
        height: u32,
        mip_levels: u32,
    ) -> Self {
        Self {
            name: name.into(),
            format,
            width,
            height,
            depth: 1,
            array_layers: 1,
            dimension: TextureDimension::D2,
            mip_levels,
        }
    }

    /// Number of mips in a full chain for the given extent
    pub fn full_mip_chain(width: u32, height: u32) -> u32 {
        32 - width.max(height).max(1).leading_zeros()
    }

    /// Texel extent of a mip level
    pub fn mip_extent(&self, mip: u32) -> UVec2 {
        UVec2::new((self.width >> mip).max(1), (self.height >> mip).max(1))
    }

    /// Texel extent of a mip level rounded up to whole compression blocks
    pub fn block_rounded_extent(&self, mip: u32) -> UVec2 {
        let (bw, bh) = self.format.block_dimensions();
        let extent = self.mip_extent(mip);
        UVec2::new(extent.x.next_multiple_of(bw), extent.y.next_multiple_of(bh))
    }

    /// Size in bytes of a mip level
    pub fn mip_size_in_bytes(&self, mip: u32) -> u64 {
        let (bw, bh) = self.format.block_dimensions();
        let bytes_per_block = self.format.block_copy_size(None).unwrap_or(0) as u64;
        let extent = self.block_rounded_extent(mip);
        (extent.x / bw) as u64 * (extent.y / bh) as u64 * bytes_per_block
    }

    /// Check whether this texture can be streamed through reserved tiles
    pub fn check_tileable(&self) -> Result<(), UntileableReason> {
        if self.width == 0 || self.height == 0 || self.mip_levels == 0 {
            return Err(UntileableReason::Empty);
        }
        if self.dimension == TextureDimension::D3 || self.depth > 1 {
            return Err(UntileableReason::VolumeTexture);
        }
        if self.array_layers > 1 {
            return Err(UntileableReason::ArrayTexture);
        }
        if !self.format.is_compressed() || self.format.block_copy_size(None).is_none() {
            return Err(UntileableReason::NotBlockCompressed);
        }
        let max = Self::full_mip_chain(self.width, self.height);
        if self.mip_levels > max {
            return Err(UntileableReason::MipChainTooLong {
                mip_levels: self.mip_levels,
                max,
            });
        }
        Ok(())
    }
}

/// Tile extent in texels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileShape {
    pub width_in_texels: u32,
    pub height_in_texels: u32,
    pub depth_in_texels: u32,
}

impl TileShape {
    /// Create a 2D tile shape
    pub fn new(width_in_texels: u32, height_in_texels: u32) -> Self {
        Self {
            width_in_texels,
            height_in_texels,
            depth_in_texels: 1,
        }
    }

    /// Standard 64 KiB tile shape for a block-compressed format
    ///
    /// The tile is square in blocks, or twice as wide as tall when the block
    /// count is an odd power of two (BC1 512×256, BC7 256×256).
    pub fn standard_for(format: TextureFormat) -> Option<Self> {
        let bytes_per_block = format.block_copy_size(None)?;
        let (bw, bh) = format.block_dimensions();
        let blocks = TILE_SIZE_IN_BYTES / bytes_per_block;
        if blocks == 0 {
            return None;
        }

        let log2 = blocks.ilog2();
        let width_in_blocks = 1 << log2.div_ceil(2);
        let height_in_blocks = 1 << (log2 / 2);
        Some(Self::new(width_in_blocks * bw, height_in_blocks * bh))
    }
}

/// Packed mip tail layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackedMipDesc {
    /// Mips tiled individually
    pub num_standard_mips: u32,
    /// Mips in the packed tail
    pub num_packed_mips: u32,
    /// Tiles occupied by the packed tail
    pub num_tiles_for_packed_mips: u32,
    /// First tile index of the packed tail
    pub start_tile_index_in_overall_resource: u32,
}

/// Tile grid of one standard mip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubresourceTiling {
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
    pub start_tile_index_in_overall_resource: u32,
}

/// Position of a regular tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoord {
    /// Mip level
    pub mip: u32,
    /// Column in the mip's tile grid
    pub x: u32,
    /// Row in the mip's tile grid
    pub y: u32,
}

/// Texel rectangle covered by a tile within one mip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileInfo {
    pub mip: u32,
    /// Left edge in texels
    pub x: u32,
    /// Top edge in texels
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Complete tiling layout of a reserved texture
#[derive(Debug, Clone, PartialEq)]
pub struct TextureTiling {
    /// Source description
    pub desc: TextureDesc,
    /// Tile shape shared by all standard mips
    pub tile_shape: TileShape,
    /// Packed tail layout
    pub packed: PackedMipDesc,
    /// Tile grids of the standard mips
    pub subresources: Vec<SubresourceTiling>,
    /// Total tiles including the packed tail
    pub num_tiles: u32,
}

impl TextureTiling {
    /// Compute the layout for a texture with the given tile shape
    pub fn standard(desc: &TextureDesc, tile_shape: TileShape) -> Result<Self, UntileableReason> {
        desc.check_tileable()?;
        if tile_shape.width_in_texels == 0 || tile_shape.height_in_texels == 0 {
            return Err(UntileableReason::Empty);
        }

        let mut subresources = Vec::new();
        let mut next_tile = 0;
        for mip in 0..desc.mip_levels {
            let extent = desc.block_rounded_extent(mip);
            if extent.x < tile_shape.width_in_texels || extent.y < tile_shape.height_in_texels {
                break;
            }

            let width_in_tiles = extent.x.div_ceil(tile_shape.width_in_texels);
            let height_in_tiles = extent.y.div_ceil(tile_shape.height_in_texels);
            subresources.push(SubresourceTiling {
                width_in_tiles,
                height_in_tiles,
                start_tile_index_in_overall_resource: next_tile,
            });
            next_tile += width_in_tiles * height_in_tiles;
        }

        let num_standard_mips = subresources.len() as u32;
        let num_packed_mips = desc.mip_levels - num_standard_mips;
        let packed_bytes: u64 = (num_standard_mips..desc.mip_levels)
            .map(|mip| desc.mip_size_in_bytes(mip))
            .sum();
        let num_tiles_for_packed_mips = if num_packed_mips == 0 {
            0
        } else {
            packed_bytes.div_ceil(TILE_SIZE_IN_BYTES as u64).max(1) as u32
        };

        Ok(Self {
            desc: desc.clone(),
            tile_shape,
            packed: PackedMipDesc {
                num_standard_mips,
                num_packed_mips,
                num_tiles_for_packed_mips,
                start_tile_index_in_overall_resource: next_tile,
            },
            subresources,
            num_tiles: next_tile + num_tiles_for_packed_mips,
        })
    }

    pub fn num_standard_mips(&self) -> u32 {
        self.packed.num_standard_mips
    }

    /// Number of individually tiled (non-packed) tiles
    pub fn num_regular_tiles(&self) -> u32 {
        self.packed.start_tile_index_in_overall_resource
    }

    /// Tile index range of the packed tail
    pub fn packed_tiles(&self) -> Range<u32> {
        self.packed.start_tile_index_in_overall_resource..self.num_tiles
    }

    /// Check whether a tile index belongs to the packed tail
    pub fn is_packed(&self, tile_index: u32) -> bool {
        self.packed_tiles().contains(&tile_index)
    }

    /// Tile grid of a standard mip
    pub fn mip_grid(&self, mip: u32) -> Option<UVec2> {
        self.subresources
            .get(mip as usize)
            .map(|s| UVec2::new(s.width_in_tiles, s.height_in_tiles))
    }

    /// Feedback region grid, one region per mip 0 tile
    pub fn feedback_grid(&self) -> UVec2 {
        self.mip_grid(0).unwrap_or(UVec2::ONE)
    }

    /// Number of feedback regions
    pub fn num_regions(&self) -> usize {
        let grid = self.feedback_grid();
        (grid.x * grid.y) as usize
    }

    /// Index of the regular tile at a coordinate
    pub fn tile_index(&self, coord: TileCoord) -> Option<u32> {
        let sub = self.subresources.get(coord.mip as usize)?;
        if coord.x >= sub.width_in_tiles || coord.y >= sub.height_in_tiles {
            return None;
        }
        Some(sub.start_tile_index_in_overall_resource + coord.y * sub.width_in_tiles + coord.x)
    }

    /// Coordinate of a regular tile
    pub fn tile_coord(&self, tile_index: u32) -> Option<TileCoord> {
        if tile_index >= self.num_regular_tiles() {
            return None;
        }
        let mip = self
            .subresources
            .partition_point(|s| s.start_tile_index_in_overall_resource <= tile_index)
            - 1;
        let sub = &self.subresources[mip];
        let local = tile_index - sub.start_tile_index_in_overall_resource;
        Some(TileCoord {
            mip: mip as u32,
            x: local % sub.width_in_tiles,
            y: local / sub.width_in_tiles,
        })
    }

    /// Regular tile at a standard mip covering a feedback region
    pub fn tile_covering_region(&self, mip: u32, region_x: u32, region_y: u32) -> u32 {
        let sub = &self.subresources[mip as usize];
        let x = (region_x >> mip).min(sub.width_in_tiles - 1);
        let y = (region_y >> mip).min(sub.height_in_tiles - 1);
        sub.start_tile_index_in_overall_resource + y * sub.width_in_tiles + x
    }

    /// Texel rectangles a tile covers
    ///
    /// Regular tiles report one rectangle clamped to the mip's block-rounded
    /// extent. A packed tile reports every packed mip in full.
    pub fn tile_info(&self, tile_index: u32) -> Option<SmallVec<[TileInfo; 4]>> {
        if self.is_packed(tile_index) {
            let mips = self.num_standard_mips()..self.desc.mip_levels;
            return Some(
                mips.map(|mip| {
                    let extent = self.desc.block_rounded_extent(mip);
                    TileInfo {
                        mip,
                        x: 0,
                        y: 0,
                        width: extent.x,
                        height: extent.y,
                    }
                })
                .collect(),
            );
        }

        let coord = self.tile_coord(tile_index)?;
        let extent = self.desc.block_rounded_extent(coord.mip);
        let x = coord.x * self.tile_shape.width_in_texels;
        let y = coord.y * self.tile_shape.height_in_texels;
        let mut infos = SmallVec::new();
        infos.push(TileInfo {
            mip: coord.mip,
            x,
            y,
            width: self.tile_shape.width_in_texels.min(extent.x - x),
            height: self.tile_shape.height_in_texels.min(extent.y - y),
        });
        Some(infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bc1(width: u32, height: u32, mips: u32) -> TextureDesc {
        TextureDesc::new_2d("test", TextureFormat::Bc1RgbaUnorm, width, height, mips)
    }

    #[test]
    fn test_standard_tile_shapes() {
        assert_eq!(
            TileShape::standard_for(TextureFormat::Bc1RgbaUnorm),
            Some(TileShape::new(512, 256))
        );
        assert_eq!(
            TileShape::standard_for(TextureFormat::Bc7RgbaUnorm),
            Some(TileShape::new(256, 256))
        );
    }

    #[test]
    fn test_untileable_reasons() {
        let mut desc = bc1(256, 256, 1);
        desc.array_layers = 6;
        assert_eq!(desc.check_tileable(), Err(UntileableReason::ArrayTexture));

        let mut desc = bc1(256, 256, 1);
        desc.dimension = TextureDimension::D3;
        desc.depth = 4;
        assert_eq!(desc.check_tileable(), Err(UntileableReason::VolumeTexture));

        let desc = TextureDesc::new_2d("rgba", TextureFormat::Rgba8Unorm, 256, 256, 1);
        assert_eq!(desc.check_tileable(), Err(UntileableReason::NotBlockCompressed));

        assert_eq!(bc1(0, 256, 1).check_tileable(), Err(UntileableReason::Empty));
        assert!(matches!(
            bc1(256, 256, 12).check_tileable(),
            Err(UntileableReason::MipChainTooLong { max: 9, .. })
        ));
    }

    #[test]
    fn test_layout_2048_with_64_tiles() {
        let tiling = TextureTiling::standard(&bc1(2048, 2048, 10), TileShape::new(64, 64)).unwrap();

        assert_eq!(tiling.mip_grid(0), Some(UVec2::new(32, 32)));
        assert_eq!(tiling.num_standard_mips(), 6);
        assert_eq!(tiling.num_regular_tiles(), 1024 + 256 + 64 + 16 + 4 + 1);
        assert_eq!(tiling.packed.num_packed_mips, 4);
        assert_eq!(tiling.packed.num_tiles_for_packed_mips, 1);
        assert_eq!(tiling.num_tiles, 1366);

        assert!(!tiling.is_packed(0));
        assert!(!tiling.is_packed(1364));
        assert!(tiling.is_packed(1365));
        assert!(!tiling.is_packed(1366));
    }

    #[test]
    fn test_tile_index_order() {
        let tiling = TextureTiling::standard(&bc1(2048, 2048, 10), TileShape::new(64, 64)).unwrap();

        let coord = tiling.tile_coord(33).unwrap();
        assert_eq!(coord, TileCoord { mip: 0, x: 1, y: 1 });

        let coord = tiling.tile_coord(1024).unwrap();
        assert_eq!(coord, TileCoord { mip: 1, x: 0, y: 0 });

        for index in [0, 31, 1023, 1024, 1300, 1364] {
            let coord = tiling.tile_coord(index).unwrap();
            assert_eq!(tiling.tile_index(coord), Some(index));
        }
        assert!(tiling.tile_coord(1365).is_none());
    }

    #[test]
    fn test_edge_tiles_are_clamped() {
        let desc = TextureDesc::new_2d("edge", TextureFormat::Bc7RgbaUnorm, 1000, 600, 1);
        let tiling = TextureTiling::standard(&desc, TileShape::standard_for(desc.format).unwrap()).unwrap();

        assert_eq!(tiling.mip_grid(0), Some(UVec2::new(4, 3)));
        let last = tiling.tile_index(TileCoord { mip: 0, x: 3, y: 2 }).unwrap();
        let info = tiling.tile_info(last).unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].x, 768);
        assert_eq!(info[0].y, 512);
        assert_eq!(info[0].width, 232);
        assert_eq!(info[0].height, 88);
    }

    #[test]
    fn test_packed_tile_info() {
        let tiling = TextureTiling::standard(&bc1(2048, 2048, 10), TileShape::new(64, 64)).unwrap();
        let info = tiling.tile_info(1365).unwrap();

        assert_eq!(info.len(), 4);
        assert_eq!((info[0].mip, info[0].width, info[0].height), (6, 32, 32));
        assert_eq!((info[3].mip, info[3].width, info[3].height), (9, 4, 4));
    }

    #[test]
    fn test_fully_packed_texture() {
        let desc = TextureDesc::new_2d("small", TextureFormat::Bc7RgbaUnorm, 128, 128, 8);
        let tiling = TextureTiling::standard(&desc, TileShape::standard_for(desc.format).unwrap()).unwrap();

        assert_eq!(tiling.num_standard_mips(), 0);
        assert_eq!(tiling.num_tiles, 1);
        assert!(tiling.is_packed(0));
        assert_eq!(tiling.feedback_grid(), UVec2::ONE);
    }

    #[test]
    fn test_region_coverage() {
        let tiling = TextureTiling::standard(&bc1(2048, 2048, 10), TileShape::new(64, 64)).unwrap();

        assert_eq!(tiling.tile_covering_region(0, 5, 7), 7 * 32 + 5);
        // Mip 1 tile (2, 3) covers regions 4..6 × 6..8
        let expected = tiling.tile_index(TileCoord { mip: 1, x: 2, y: 3 }).unwrap();
        assert_eq!(tiling.tile_covering_region(1, 5, 7), expected);
        // Mip 5 has a single tile
        assert_eq!(tiling.tile_covering_region(5, 31, 31), 1364);
    }
}
