//! Graphics Backend
//!
//! Capability trait covering every API-specific operation the streaming
//! pipeline needs. Residency logic only sees opaque ids; the backend adapter
//! owns command lists, barriers and memory.

use glam::UVec2;
use smallvec::SmallVec;

use crate::tiling::{TextureDesc, TextureTiling, TileInfo};
use crate::StreamingResult;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            /// Raw id value
            pub fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

define_id!(
    /// GPU texture (reserved, fully resident, or min-mip)
    TextureId
);
define_id!(
    /// Sampler feedback surface paired with a reserved texture
    FeedbackSurfaceId
);
define_id!(
    /// GPU buffer (resolve readback or staging)
    BufferId
);
define_id!(
    /// Tile heap
    HeapId
);
define_id!(
    /// Sampler
    SamplerId
);

/// GPU objects backing one tiled texture
#[derive(Debug, Clone, PartialEq)]
pub struct TiledResources {
    /// Reserved texture whose tiles are bound on demand
    pub reserved: TextureId,
    /// Feedback surface written by shaders
    pub feedback: FeedbackSurfaceId,
    /// One `f32` texel per feedback region
    pub min_mip: TextureId,
    /// Resolve readback buffers, one per frame in flight
    pub resolve_buffers: SmallVec<[BufferId; 3]>,
    /// Feedback region grid
    pub region_grid: UVec2,
}

/// Fixed resources bound when no tiled companions exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackResources {
    /// 8×8 `R32Float` texture standing in for textures and min-mip maps
    pub texture: TextureId,
    /// Feedback surface paired with the fallback texture
    pub feedback: FeedbackSurfaceId,
    /// Sampler used for min-mip lookups
    pub min_mip_sampler: SamplerId,
}

/// Resource usage states a texture must be in before an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    CopyDest,
    CopySource,
    ShaderResource,
    UnorderedAccess,
}

/// Heap slot bound to a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapSlot {
    pub heap: HeapId,
    /// Offset in tiles within the heap
    pub offset_in_tiles: u32,
}

/// Tile mapping update; `None` unbinds the tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileBinding {
    pub tile_index: u32,
    pub slot: Option<HeapSlot>,
}

/// Copy of one tile from a staging buffer into a reserved texture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    /// Byte offset in the staging buffer
    pub buffer_offset: u64,
    /// Staging row pitch in bytes
    pub row_pitch: u32,
    /// Destination texel rectangle and mip
    pub dest: TileInfo,
}

/// Capabilities the streaming pipeline requires from a graphics API
pub trait StreamingBackend {
    /// Query the tiling layout the device uses for a texture
    fn query_tiling(&self, desc: &TextureDesc) -> StreamingResult<TextureTiling>;

    /// Create the reserved texture and its feedback, min-mip and resolve companions
    fn create_tiled_resources(
        &mut self,
        tiling: &TextureTiling,
        frames_in_flight: u32,
    ) -> StreamingResult<TiledResources>;

    /// Destroy resources created by [`create_tiled_resources`](Self::create_tiled_resources)
    fn destroy_tiled_resources(&mut self, resources: &TiledResources);

    /// Create a fully resident texture
    fn create_texture(&mut self, desc: &TextureDesc) -> StreamingResult<TextureId>;

    fn destroy_texture(&mut self, texture: TextureId);

    /// Write a whole subresource through the flexible upload path
    fn write_subresource(
        &mut self,
        texture: TextureId,
        mip: u32,
        data: &[u8],
        row_pitch: u32,
    ) -> StreamingResult<()>;

    /// Create the shared fallback texture, feedback surface and min-mip sampler
    fn create_fallback_resources(&mut self) -> StreamingResult<FallbackResources>;

    /// Reset a feedback surface to "not sampled"
    fn clear_feedback(&mut self, feedback: FeedbackSurfaceId);

    /// Resolve a feedback surface into per-region min-mip bytes
    fn resolve_feedback(&mut self, feedback: FeedbackSurfaceId, dest: BufferId);

    /// Read back a resolve buffer whose GPU work has completed
    fn read_resolve_buffer(&mut self, buffer: BufferId, out: &mut Vec<u8>) -> StreamingResult<()>;

    fn create_heap(&mut self, size_in_tiles: u32) -> StreamingResult<HeapId>;

    /// Release a heap once the frames that may reference it have retired
    fn release_heap(&mut self, heap: HeapId);

    /// Bind or unbind tiles of a reserved texture
    fn update_tile_mappings(&mut self, texture: TextureId, bindings: &[TileBinding]);

    /// Record that a texture must be in `state` before the next operation
    fn require_texture_state(&mut self, texture: TextureId, state: ResourceState);

    /// Flush the recorded state transitions
    fn commit_barriers(&mut self);

    fn create_staging_buffer(&mut self, size_in_bytes: u64) -> StreamingResult<BufferId>;

    fn destroy_buffer(&mut self, buffer: BufferId);

    /// Write CPU data into a staging buffer
    fn write_staging(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> StreamingResult<()>;

    /// Copy a staged tile into its texel footprint of a reserved texture
    fn copy_staging_to_tile(&mut self, buffer: BufferId, dest: TextureId, region: CopyRegion);
}
