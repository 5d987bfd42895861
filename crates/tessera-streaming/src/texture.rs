//! Tiled Texture
//!
//! A reserved texture together with its feedback companions and residency.

use smallvec::SmallVec;
use tessera_core::Handle;

use crate::allocator::AllocatorTextureId;
use crate::backend::{FeedbackSurfaceId, TextureId, TiledResources};
use crate::feedback::compute_min_mip;
use crate::residency::TextureResidency;
use crate::texture_set::TextureSetHandle;
use crate::tiling::{TextureDesc, TextureTiling, TileInfo, TileShape};
use crate::{StreamingError, StreamingResult};

/// Handle to a texture owned by the feedback manager
pub type TextureHandle = Handle<TiledTexture>;

/// Texture whose texel data lives in a sparse set of tiles
///
/// Tile count and shape are fixed at creation; only which tiles are mapped
/// changes afterwards.
#[derive(Debug)]
pub struct TiledTexture {
    tiling: TextureTiling,
    resources: TiledResources,
    pub(crate) allocator_id: AllocatorTextureId,
    pub(crate) residency: TextureResidency,
    pub(crate) min_mip: Vec<f32>,
    pub(crate) min_mip_dirty: bool,
    /// Sets in which this texture drives residency
    pub(crate) primary_of: SmallVec<[TextureSetHandle; 2]>,
    /// Sets containing this texture in any role
    pub(crate) member_of: SmallVec<[TextureSetHandle; 2]>,
}

impl TiledTexture {
    pub(crate) fn new(
        tiling: TextureTiling,
        resources: TiledResources,
        allocator_id: AllocatorTextureId,
    ) -> Self {
        let residency = TextureResidency::new(tiling.num_tiles);
        let nothing_resident = tiling.desc.mip_levels as f32;
        let min_mip = vec![nothing_resident; tiling.num_regions()];
        Self {
            tiling,
            resources,
            allocator_id,
            residency,
            min_mip,
            min_mip_dirty: true,
            primary_of: SmallVec::new(),
            member_of: SmallVec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.tiling.desc.name
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.tiling.desc
    }

    pub fn tiling(&self) -> &TextureTiling {
        &self.tiling
    }

    pub fn tile_shape(&self) -> TileShape {
        self.tiling.tile_shape
    }

    pub fn num_tiles(&self) -> u32 {
        self.tiling.num_tiles
    }

    pub fn resources(&self) -> &TiledResources {
        &self.resources
    }

    pub fn reserved_texture(&self) -> TextureId {
        self.resources.reserved
    }

    pub fn feedback_surface(&self) -> FeedbackSurfaceId {
        self.resources.feedback
    }

    pub fn min_mip_texture(&self) -> TextureId {
        self.resources.min_mip
    }

    pub fn residency(&self) -> &TextureResidency {
        &self.residency
    }

    /// Finest resident mip per feedback region, as last computed
    pub fn min_mip_values(&self) -> &[f32] {
        &self.min_mip
    }

    /// Check whether a tile index belongs to the packed mip tail
    pub fn is_tile_packed(&self, tile_index: u32) -> bool {
        self.tiling.is_packed(tile_index)
    }

    /// Texel rectangles covered by a tile
    pub fn tile_info(&self, tile_index: u32) -> StreamingResult<SmallVec<[TileInfo; 4]>> {
        self.tiling
            .tile_info(tile_index)
            .ok_or(StreamingError::MalformedTileIndex {
                tile: tile_index,
                total: self.tiling.num_tiles,
            })
    }

    /// Check whether this texture's feedback is read back
    ///
    /// True unless every set containing it has another texture as primary.
    pub fn needs_readback(&self) -> bool {
        self.member_of.is_empty() || !self.primary_of.is_empty()
    }

    /// Sets this texture belongs to
    pub fn texture_sets(&self) -> &[TextureSetHandle] {
        &self.member_of
    }

    pub fn is_primary(&self) -> bool {
        !self.primary_of.is_empty()
    }

    /// Recompute the min-mip values if the mapping changed
    pub(crate) fn refresh_min_mip(&mut self) -> bool {
        if !self.min_mip_dirty {
            return false;
        }
        let residency = &self.residency;
        compute_min_mip(&self.tiling, |tile| residency.is_resident(tile), &mut self.min_mip);
        self.min_mip_dirty = false;
        true
    }

    /// Min-mip values as `R32Float` texel bytes
    pub(crate) fn min_mip_bytes(&self) -> Vec<u8> {
        self.min_mip.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}
