//! Headless Backend
//!
//! In-memory implementation of [`StreamingBackend`]. Feedback surfaces are
//! plain byte grids that callers fill with [`HeadlessBackend::record_sample`],
//! tile bindings and copies are recorded for inspection.

use ahash::{AHashMap, AHashSet};
use glam::UVec2;
use smallvec::SmallVec;
use wgpu::TextureFormat;

use crate::backend::{
    BufferId, CopyRegion, FallbackResources, FeedbackSurfaceId, HeapId, HeapSlot, ResourceState,
    SamplerId, StreamingBackend, TextureId, TileBinding, TiledResources,
};
use crate::feedback::NOT_SAMPLED;
use crate::tiling::{TextureDesc, TextureTiling, TileShape};
use crate::{StreamingError, StreamingResult};

/// Side length of the fallback texture
const FALLBACK_SIZE: u32 = 8;

#[derive(Debug)]
struct HeadlessTexture {
    desc: TextureDesc,
    state: ResourceState,
    bound: AHashMap<u32, HeapSlot>,
    subresources: AHashMap<u32, Vec<u8>>,
}

impl HeadlessTexture {
    fn new(desc: TextureDesc) -> Self {
        Self {
            desc,
            state: ResourceState::Common,
            bound: AHashMap::new(),
            subresources: AHashMap::new(),
        }
    }
}

#[derive(Debug)]
struct HeadlessFeedback {
    grid: UVec2,
    values: Vec<u8>,
}

/// Recorded staging-to-tile copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileCopy {
    pub buffer: BufferId,
    pub texture: TextureId,
    pub region: CopyRegion,
}

/// In-memory graphics backend
#[derive(Debug, Default)]
pub struct HeadlessBackend {
    tile_shape: Option<TileShape>,
    next_id: u64,
    textures: AHashMap<TextureId, HeadlessTexture>,
    feedback: AHashMap<FeedbackSurfaceId, HeadlessFeedback>,
    buffers: AHashMap<BufferId, Vec<u8>>,
    heaps: AHashMap<HeapId, u32>,
    pending_states: Vec<(TextureId, ResourceState)>,
    tile_copies: Vec<TileCopy>,
    subresource_writes: usize,
    feedback_clears: usize,
    feedback_resolves: usize,
    failing_heap_creations: u32,
    failing_reads: AHashSet<BufferId>,
}

impl HeadlessBackend {
    /// Backend using the standard tile shape of each format
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend reporting the same tile shape for every texture
    pub fn with_tile_shape(tile_shape: TileShape) -> Self {
        Self {
            tile_shape: Some(tile_shape),
            ..Self::default()
        }
    }

    /// Make the next `count` heap creations fail
    pub fn fail_heap_creations(&mut self, count: u32) {
        self.failing_heap_creations = count;
    }

    /// Make reads of a resolve buffer fail until [`Self::restore_reads`]
    pub fn fail_reads_from(&mut self, buffer: BufferId) {
        self.failing_reads.insert(buffer);
    }

    pub fn restore_reads(&mut self) {
        self.failing_reads.clear();
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Record a shader sample at `mip` in one feedback region
    ///
    /// Keeps the finest mip when a region is sampled more than once.
    pub fn record_sample(&mut self, feedback: FeedbackSurfaceId, region_x: u32, region_y: u32, mip: u8) {
        if let Some(surface) = self.feedback.get_mut(&feedback) {
            if region_x < surface.grid.x && region_y < surface.grid.y {
                let value = &mut surface.values[(region_y * surface.grid.x + region_x) as usize];
                *value = (*value).min(mip);
            }
        }
    }

    /// Record a sample at `mip` in every region
    pub fn sample_all(&mut self, feedback: FeedbackSurfaceId, mip: u8) {
        if let Some(surface) = self.feedback.get_mut(&feedback) {
            for value in &mut surface.values {
                *value = (*value).min(mip);
            }
        }
    }

    /// Tiles currently bound to heap memory, sorted
    pub fn bound_tiles(&self, texture: TextureId) -> Vec<u32> {
        let mut tiles: Vec<u32> = self
            .textures
            .get(&texture)
            .map(|t| t.bound.keys().copied().collect())
            .unwrap_or_default();
        tiles.sort_unstable();
        tiles
    }

    pub fn is_tile_bound(&self, texture: TextureId, tile_index: u32) -> bool {
        self.textures
            .get(&texture)
            .is_some_and(|t| t.bound.contains_key(&tile_index))
    }

    /// Heap slot a tile is bound to
    pub fn tile_binding(&self, texture: TextureId, tile_index: u32) -> Option<HeapSlot> {
        self.textures.get(&texture)?.bound.get(&tile_index).copied()
    }

    pub fn tile_copies(&self) -> &[TileCopy] {
        &self.tile_copies
    }

    pub fn subresource_writes(&self) -> usize {
        self.subresource_writes
    }

    /// Last data written to a subresource
    pub fn subresource_data(&self, texture: TextureId, mip: u32) -> Option<&[u8]> {
        self.textures.get(&texture)?.subresources.get(&mip).map(Vec::as_slice)
    }

    /// Contents of a min-mip texture
    pub fn min_mip_values(&self, texture: TextureId) -> Option<Vec<f32>> {
        let data = self.subresource_data(texture, 0)?;
        Some(
            data.chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        )
    }

    pub fn texture_state(&self, texture: TextureId) -> Option<ResourceState> {
        self.textures.get(&texture).map(|t| t.state)
    }

    pub fn texture_desc(&self, texture: TextureId) -> Option<&TextureDesc> {
        self.textures.get(&texture).map(|t| &t.desc)
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_heaps(&self) -> usize {
        self.heaps.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn feedback_clears(&self) -> usize {
        self.feedback_clears
    }

    pub fn feedback_resolves(&self) -> usize {
        self.feedback_resolves
    }
}

impl StreamingBackend for HeadlessBackend {
    fn query_tiling(&self, desc: &TextureDesc) -> StreamingResult<TextureTiling> {
        let untileable = |reason| StreamingError::Untileable {
            name: desc.name.clone(),
            reason,
        };
        desc.check_tileable().map_err(untileable)?;

        let shape = match self.tile_shape {
            Some(shape) => shape,
            None => TileShape::standard_for(desc.format)
                .ok_or_else(|| StreamingError::Backend(format!("no tile shape for {:?}", desc.format)))?,
        };
        TextureTiling::standard(desc, shape).map_err(untileable)
    }

    fn create_tiled_resources(
        &mut self,
        tiling: &TextureTiling,
        frames_in_flight: u32,
    ) -> StreamingResult<TiledResources> {
        let grid = tiling.feedback_grid();

        let reserved = TextureId(self.next_id());
        self.textures.insert(reserved, HeadlessTexture::new(tiling.desc.clone()));

        let min_mip_desc = TextureDesc::new_2d(
            format!("{} min-mip", tiling.desc.name),
            TextureFormat::R32Float,
            grid.x,
            grid.y,
            1,
        );
        let min_mip = self.create_texture(&min_mip_desc)?;

        let feedback = FeedbackSurfaceId(self.next_id());
        self.feedback.insert(
            feedback,
            HeadlessFeedback {
                grid,
                values: vec![NOT_SAMPLED; (grid.x * grid.y) as usize],
            },
        );

        let mut resolve_buffers = SmallVec::new();
        for _ in 0..frames_in_flight {
            let buffer = BufferId(self.next_id());
            self.buffers.insert(buffer, vec![NOT_SAMPLED; (grid.x * grid.y) as usize]);
            resolve_buffers.push(buffer);
        }

        Ok(TiledResources {
            reserved,
            feedback,
            min_mip,
            resolve_buffers,
            region_grid: grid,
        })
    }

    fn destroy_tiled_resources(&mut self, resources: &TiledResources) {
        self.textures.remove(&resources.reserved);
        self.textures.remove(&resources.min_mip);
        self.feedback.remove(&resources.feedback);
        for buffer in &resources.resolve_buffers {
            self.buffers.remove(buffer);
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> StreamingResult<TextureId> {
        let id = TextureId(self.next_id());
        self.textures.insert(id, HeadlessTexture::new(desc.clone()));
        Ok(id)
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn write_subresource(
        &mut self,
        texture: TextureId,
        mip: u32,
        data: &[u8],
        _row_pitch: u32,
    ) -> StreamingResult<()> {
        let target = self
            .textures
            .get_mut(&texture)
            .ok_or_else(|| StreamingError::Backend(format!("unknown texture {}", texture.raw())))?;
        if mip >= target.desc.mip_levels {
            return Err(StreamingError::Backend(format!(
                "mip {} out of range for '{}'",
                mip, target.desc.name
            )));
        }
        target.subresources.insert(mip, data.to_vec());
        self.subresource_writes += 1;
        Ok(())
    }

    fn create_fallback_resources(&mut self) -> StreamingResult<FallbackResources> {
        let desc = TextureDesc::new_2d(
            "fallback",
            TextureFormat::R32Float,
            FALLBACK_SIZE,
            FALLBACK_SIZE,
            1,
        );
        let texture = self.create_texture(&desc)?;

        let feedback = FeedbackSurfaceId(self.next_id());
        self.feedback.insert(
            feedback,
            HeadlessFeedback {
                grid: UVec2::ONE,
                values: vec![NOT_SAMPLED],
            },
        );

        Ok(FallbackResources {
            texture,
            feedback,
            min_mip_sampler: SamplerId(self.next_id()),
        })
    }

    fn clear_feedback(&mut self, feedback: FeedbackSurfaceId) {
        if let Some(surface) = self.feedback.get_mut(&feedback) {
            surface.values.fill(NOT_SAMPLED);
            self.feedback_clears += 1;
        }
    }

    fn resolve_feedback(&mut self, feedback: FeedbackSurfaceId, dest: BufferId) {
        let (Some(surface), Some(buffer)) = (self.feedback.get(&feedback), self.buffers.get_mut(&dest)) else {
            return;
        };
        buffer.clear();
        buffer.extend_from_slice(&surface.values);
        self.feedback_resolves += 1;
    }

    fn read_resolve_buffer(&mut self, buffer: BufferId, out: &mut Vec<u8>) -> StreamingResult<()> {
        if self.failing_reads.contains(&buffer) {
            return Err(StreamingError::Backend(format!("read of buffer {} failed", buffer.raw())));
        }
        let data = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| StreamingError::Backend(format!("unknown buffer {}", buffer.raw())))?;
        out.clear();
        out.extend_from_slice(data);
        Ok(())
    }

    fn create_heap(&mut self, size_in_tiles: u32) -> StreamingResult<HeapId> {
        if self.failing_heap_creations > 0 {
            self.failing_heap_creations -= 1;
            return Err(StreamingError::Backend(format!("out of memory for a {size_in_tiles}-tile heap")));
        }
        let heap = HeapId(self.next_id());
        self.heaps.insert(heap, size_in_tiles);
        Ok(heap)
    }

    fn release_heap(&mut self, heap: HeapId) {
        self.heaps.remove(&heap);
    }

    fn update_tile_mappings(&mut self, texture: TextureId, bindings: &[TileBinding]) {
        let Some(target) = self.textures.get_mut(&texture) else {
            return;
        };
        for binding in bindings {
            match binding.slot {
                Some(slot) => {
                    target.bound.insert(binding.tile_index, slot);
                }
                None => {
                    target.bound.remove(&binding.tile_index);
                }
            }
        }
    }

    fn require_texture_state(&mut self, texture: TextureId, state: ResourceState) {
        self.pending_states.push((texture, state));
    }

    fn commit_barriers(&mut self) {
        for (texture, state) in self.pending_states.drain(..) {
            if let Some(target) = self.textures.get_mut(&texture) {
                target.state = state;
            }
        }
    }

    fn create_staging_buffer(&mut self, size_in_bytes: u64) -> StreamingResult<BufferId> {
        let buffer = BufferId(self.next_id());
        self.buffers.insert(buffer, vec![0; size_in_bytes as usize]);
        Ok(buffer)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer);
    }

    fn write_staging(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> StreamingResult<()> {
        let target = self
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| StreamingError::Backend(format!("unknown buffer {}", buffer.raw())))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > target.len() {
            return Err(StreamingError::Backend(format!(
                "staging write {}..{} exceeds buffer of {} bytes",
                start,
                end,
                target.len()
            )));
        }
        target[start..end].copy_from_slice(data);
        Ok(())
    }

    fn copy_staging_to_tile(&mut self, buffer: BufferId, dest: TextureId, region: CopyRegion) {
        self.tile_copies.push(TileCopy {
            buffer,
            texture: dest,
            region,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feedback_resolve_roundtrip() {
        let mut backend = HeadlessBackend::with_tile_shape(TileShape::new(64, 64));
        let desc = TextureDesc::new_2d("rock", TextureFormat::Bc7RgbaUnorm, 256, 128, 9);
        let tiling = backend.query_tiling(&desc).unwrap();
        let resources = backend.create_tiled_resources(&tiling, 2).unwrap();
        assert_eq!(resources.region_grid, UVec2::new(4, 2));
        assert_eq!(resources.resolve_buffers.len(), 2);

        backend.record_sample(resources.feedback, 1, 1, 3);
        backend.record_sample(resources.feedback, 1, 1, 5);
        backend.resolve_feedback(resources.feedback, resources.resolve_buffers[0]);

        let mut out = Vec::new();
        backend.read_resolve_buffer(resources.resolve_buffers[0], &mut out).unwrap();
        assert_eq!(out.len(), 8);
        assert_eq!(out[5], 3);
        assert_eq!(out.iter().filter(|&&v| v == NOT_SAMPLED).count(), 7);

        backend.clear_feedback(resources.feedback);
        backend.resolve_feedback(resources.feedback, resources.resolve_buffers[1]);
        backend.read_resolve_buffer(resources.resolve_buffers[1], &mut out).unwrap();
        assert!(out.iter().all(|&v| v == NOT_SAMPLED));
    }

    #[test]
    fn test_untileable_formats_are_rejected() {
        let backend = HeadlessBackend::new();
        let desc = TextureDesc::new_2d("lut", TextureFormat::Rgba8Unorm, 256, 256, 1);
        assert!(matches!(
            backend.query_tiling(&desc),
            Err(StreamingError::Untileable { .. })
        ));
    }

    #[test]
    fn test_barriers_apply_on_commit() {
        let mut backend = HeadlessBackend::new();
        let desc = TextureDesc::new_2d("mask", TextureFormat::R32Float, 8, 8, 1);
        let texture = backend.create_texture(&desc).unwrap();

        backend.require_texture_state(texture, ResourceState::CopyDest);
        assert_eq!(backend.texture_state(texture), Some(ResourceState::Common));
        backend.commit_barriers();
        assert_eq!(backend.texture_state(texture), Some(ResourceState::CopyDest));
    }

    #[test]
    fn test_staging_write_bounds() {
        let mut backend = HeadlessBackend::new();
        let buffer = backend.create_staging_buffer(16).unwrap();

        assert!(backend.write_staging(buffer, 8, &[1; 8]).is_ok());
        assert!(backend.write_staging(buffer, 12, &[1; 8]).is_err());
    }

    #[test]
    fn test_injected_failures() {
        let mut backend = HeadlessBackend::new();
        backend.fail_heap_creations(1);
        assert!(backend.create_heap(8).is_err());
        assert!(backend.create_heap(8).is_ok());
        assert_eq!(backend.live_heaps(), 1);

        let buffer = backend.create_staging_buffer(4).unwrap();
        let mut out = Vec::new();
        backend.fail_reads_from(buffer);
        assert!(matches!(
            backend.read_resolve_buffer(buffer, &mut out),
            Err(StreamingError::Backend(_))
        ));
        backend.restore_reads();
        assert!(backend.read_resolve_buffer(buffer, &mut out).is_ok());
    }
}
