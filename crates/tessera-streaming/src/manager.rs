//! Feedback Manager
//!
//! Orchestrates the per-frame residency cycle:
//!
//! 1. `begin_frame` reads back feedback resolved `frames_in_flight` frames
//!    ago, advances tile states and reports newly requested tiles
//! 2. `update_tile_mappings` maps the tiles the caller selected, trims the
//!    standby list, runs allocator maintenance and refreshes min-mip maps
//! 3. render passes sample textures and write new feedback
//! 4. `resolve_feedback` and `end_frame` close the cycle
//!
//! Textures live in a generation-checked arena; releasing one unregisters it
//! from the allocator immediately.

use std::sync::Arc;

use ahash::AHashMap;
use indexmap::IndexMap;
use smallvec::SmallVec;
use tessera_core::{Arena, Clock, PhaseTimer};

use crate::allocator::{AllocatorTextureId, HeapEvent, Relocation, TileAllocation, TileAllocator, TileLayout};
use crate::backend::{HeapId, HeapSlot, ResourceState, StreamingBackend, TileBinding};
use crate::config::{FeedbackUpdateConfig, StreamingConfig};
use crate::feedback::{mark_required_tiles, MinMipMap};
use crate::residency::{FeedbackTransitions, StandbyQueue, TileCounts, TileState};
use crate::scheduler::RequestedTile;
use crate::stats::FeedbackStats;
use crate::texture::{TextureHandle, TiledTexture};
use crate::texture_set::{check_admission, mip_offset, TextureSet, TextureSetHandle};
use crate::tiling::TextureDesc;
use crate::{StreamingError, StreamingResult};

/// Newly requested tiles of one texture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackTextureUpdate {
    pub texture: TextureHandle,
    pub tile_indices: Vec<u32>,
}

/// Tiles requested by one `begin_frame`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedbackTextureCollection {
    pub textures: Vec<FeedbackTextureUpdate>,
}

impl FeedbackTextureCollection {
    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    /// Total tiles across all textures
    pub fn num_tiles(&self) -> usize {
        self.textures.iter().map(|u| u.tile_indices.len()).sum()
    }

    fn push(&mut self, texture: TextureHandle, tile_index: u32) {
        match self.textures.iter_mut().find(|u| u.texture == texture) {
            Some(update) => update.tile_indices.push(tile_index),
            None => self.textures.push(FeedbackTextureUpdate {
                texture,
                tile_indices: vec![tile_index],
            }),
        }
    }
}

/// Result of `update_tile_mappings`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileMappingOutcome {
    /// Tiles bound to heap memory and ready for upload
    pub mapped: Vec<RequestedTile>,
    /// Tiles that found no memory and should stay queued
    pub deferred: Vec<RequestedTile>,
}

/// Tile residency manager
pub struct FeedbackManager {
    frames_in_flight: u32,
    allocator: Box<dyn TileAllocator>,
    clock: Arc<dyn Clock>,
    textures: Arena<TiledTexture>,
    sets: Arena<TextureSet>,
    allocator_ids: AHashMap<AllocatorTextureId, TextureHandle>,
    /// Allocator heap index to backend heap
    heaps: AHashMap<u32, HeapId>,
    /// Allocator heaps the backend failed to create, with their size
    missing_heaps: Vec<(u32, u32)>,
    standby: StandbyQueue<TextureHandle>,
    /// Textures taking part in feedback readback, in rotation order
    readback_ring: Vec<TextureHandle>,
    /// Textures whose feedback is resolved into each frame slot
    readback_slots: Vec<Vec<TextureHandle>>,
    frame_slot: usize,
    frame_config: FeedbackUpdateConfig,
    /// Tiles returned to `Requested` that must be reported again
    reissued: Vec<RequestedTile>,
    readback_scratch: Vec<u8>,
    timer_begin_frame: PhaseTimer,
    timer_update_tile_mappings: PhaseTimer,
    timer_resolve: PhaseTimer,
}

impl FeedbackManager {
    /// Create a manager
    pub fn new(config: &StreamingConfig, allocator: Box<dyn TileAllocator>, clock: Arc<dyn Clock>) -> Self {
        let frames_in_flight = config.frames_in_flight.max(1);
        Self {
            frames_in_flight,
            allocator,
            clock,
            textures: Arena::new(),
            sets: Arena::new(),
            allocator_ids: AHashMap::new(),
            heaps: AHashMap::new(),
            missing_heaps: Vec::new(),
            standby: StandbyQueue::new(),
            readback_ring: Vec::new(),
            readback_slots: vec![Vec::new(); frames_in_flight as usize],
            frame_slot: 0,
            frame_config: config.update_config(0, false),
            reissued: Vec::new(),
            readback_scratch: Vec::new(),
            timer_begin_frame: PhaseTimer::new(),
            timer_update_tile_mappings: PhaseTimer::new(),
            timer_resolve: PhaseTimer::new(),
        }
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<&TiledTexture> {
        self.textures.get(handle)
    }

    /// Iterate over all live textures
    pub fn textures(&self) -> impl Iterator<Item = (TextureHandle, &TiledTexture)> {
        self.textures.iter()
    }

    pub fn num_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn texture_set(&self, handle: TextureSetHandle) -> Option<&TextureSet> {
        self.sets.get(handle)
    }

    /// Iterate over all live texture sets
    pub fn texture_sets(&self) -> impl Iterator<Item = (TextureSetHandle, &TextureSet)> {
        self.sets.iter()
    }

    /// Textures taking part in feedback readback
    pub fn readback_ring(&self) -> &[TextureHandle] {
        &self.readback_ring
    }

    /// Check whether a tile belongs to a texture's packed tail
    pub fn is_tile_packed(&self, texture: TextureHandle, tile_index: u32) -> bool {
        self.textures
            .get(texture)
            .is_some_and(|t| t.is_tile_packed(tile_index))
    }

    pub fn tile_state(&self, texture: TextureHandle, tile_index: u32) -> Option<TileState> {
        self.textures
            .get(texture)
            .map(|t| t.residency().state(tile_index))
    }

    /// Create a tiled texture and its GPU companions
    pub fn create_texture(
        &mut self,
        backend: &mut dyn StreamingBackend,
        desc: &TextureDesc,
    ) -> StreamingResult<TextureHandle> {
        desc.check_tileable()
            .map_err(|reason| StreamingError::Untileable {
                name: desc.name.clone(),
                reason,
            })?;

        let tiling = backend.query_tiling(desc)?;
        let resources = backend.create_tiled_resources(&tiling, self.frames_in_flight)?;
        let allocator_id = self.allocator.register_texture(TileLayout {
            num_tiles: tiling.num_tiles,
            num_regular_tiles: tiling.num_regular_tiles(),
        });

        log::debug!(
            "Tiled texture '{}' created: {} tiles ({} packed), {} standard mips, tile {}x{}",
            desc.name,
            tiling.num_tiles,
            tiling.packed.num_tiles_for_packed_mips,
            tiling.num_standard_mips(),
            tiling.tile_shape.width_in_texels,
            tiling.tile_shape.height_in_texels,
        );

        let handle = self.textures.insert(TiledTexture::new(tiling, resources, allocator_id));
        self.allocator_ids.insert(allocator_id, handle);
        self.readback_ring.push(handle);
        Ok(handle)
    }

    /// Release a texture, unregistering it from the allocator at once
    pub fn release_texture(
        &mut self,
        backend: &mut dyn StreamingBackend,
        handle: TextureHandle,
    ) -> StreamingResult<()> {
        let texture = self.textures.remove(handle).ok_or(StreamingError::StaleTexture)?;
        self.allocator.unregister_texture(texture.allocator_id);
        self.allocator_ids.remove(&texture.allocator_id);

        for &set_handle in &texture.member_of {
            let Some(primary) = self.sets.get(set_handle).map(TextureSet::primary) else {
                continue;
            };
            if primary == handle {
                self.release_texture_set(set_handle)?;
            } else if let Some(set) = self.sets.get_mut(set_handle) {
                set.remove_follower(handle);
            }
        }

        self.readback_ring.retain(|&t| t != handle);
        for slot in &mut self.readback_slots {
            slot.retain(|&t| t != handle);
        }
        self.reissued.retain(|t| t.texture != handle);

        backend.destroy_tiled_resources(texture.resources());
        log::debug!("Tiled texture '{}' released", texture.name());
        Ok(())
    }

    /// Group textures so the primary's feedback drives the followers
    ///
    /// The set is rejected as a whole if any follower exceeds the primary.
    pub fn create_texture_set(
        &mut self,
        primary: TextureHandle,
        followers: &[TextureHandle],
    ) -> StreamingResult<TextureSetHandle> {
        let primary_desc = self
            .textures
            .get(primary)
            .ok_or(StreamingError::StaleTexture)?
            .desc();
        let follower_descs = followers
            .iter()
            .map(|&f| self.textures.get(f).map(|t| t.desc()).ok_or(StreamingError::StaleTexture))
            .collect::<StreamingResult<Vec<_>>>()?;

        check_admission(primary_desc, &follower_descs)?;
        let offsets = follower_descs
            .iter()
            .map(|f| mip_offset(primary_desc, f))
            .collect();

        let set_handle = self
            .sets
            .insert(TextureSet::new(primary, followers.iter().copied().collect(), offsets));

        if let Some(texture) = self.textures.get_mut(primary) {
            texture.primary_of.push(set_handle);
            texture.member_of.push(set_handle);
        }
        for &follower in followers {
            if let Some(texture) = self.textures.get_mut(follower) {
                texture.member_of.push(set_handle);
            }
        }
        for texture in std::iter::once(primary).chain(followers.iter().copied()) {
            self.refresh_ring_membership(texture);
        }
        Ok(set_handle)
    }

    /// Dissolve a texture set; its textures read back their own feedback again
    pub fn release_texture_set(&mut self, handle: TextureSetHandle) -> StreamingResult<()> {
        let set = self.sets.remove(handle).ok_or(StreamingError::StaleTextureSet)?;
        for texture_handle in set.textures() {
            if let Some(texture) = self.textures.get_mut(texture_handle) {
                texture.member_of.retain(|s| *s != handle);
                texture.primary_of.retain(|s| *s != handle);
            }
            self.refresh_ring_membership(texture_handle);
        }
        Ok(())
    }

    fn refresh_ring_membership(&mut self, handle: TextureHandle) {
        let Some(texture) = self.textures.get(handle) else {
            return;
        };
        let in_ring = self.readback_ring.contains(&handle);
        if texture.needs_readback() && !in_ring {
            self.readback_ring.push(handle);
        } else if !texture.needs_readback() && in_ring {
            self.readback_ring.retain(|&t| t != handle);
            for slot in &mut self.readback_slots {
                slot.retain(|&t| t != handle);
            }
        }
    }

    /// Read back feedback and report newly requested tiles
    ///
    /// A texture whose readback fails is skipped for this frame and the
    /// first error is returned once the frame slot has been rebuilt. Tiles
    /// requested by the other textures are then reported by the next call.
    pub fn begin_frame(
        &mut self,
        backend: &mut dyn StreamingBackend,
        config: &FeedbackUpdateConfig,
    ) -> StreamingResult<FeedbackTextureCollection> {
        let _span = tracing::debug_span!("begin_frame", frame = config.frame_index).entered();
        self.timer_begin_frame.begin();
        let result = self.begin_frame_inner(backend, config);
        self.timer_begin_frame.end();
        result
    }

    fn begin_frame_inner(
        &mut self,
        backend: &mut dyn StreamingBackend,
        config: &FeedbackUpdateConfig,
    ) -> StreamingResult<FeedbackTextureCollection> {
        self.frame_config = *config;
        self.frame_slot = (config.frame_index % self.frames_in_flight as u64) as usize;
        let slot = self.frame_slot;
        let now = self.clock.now_secs();
        let timeout = config.tile_timeout_seconds as f64;

        // Feedback resolved into this slot `frames_in_flight` frames ago
        let readback = std::mem::take(&mut self.readback_slots[slot]);
        let mut required: IndexMap<TextureHandle, Vec<bool>> = IndexMap::new();
        let mut first_error = None;
        for handle in readback {
            let Some(texture) = self.textures.get(handle) else {
                continue;
            };
            let Some(&buffer) = texture.resources().resolve_buffers.get(slot) else {
                continue;
            };
            let decoded = backend
                .read_resolve_buffer(buffer, &mut self.readback_scratch)
                .and_then(|()| MinMipMap::decode(texture.tiling().feedback_grid(), &self.readback_scratch));
            let map = match decoded {
                Ok(map) => map,
                Err(err) => {
                    log::warn!("Skipping feedback of '{}': {}", texture.name(), err);
                    first_error.get_or_insert(err);
                    continue;
                }
            };

            let mask = required
                .entry(handle)
                .or_insert_with(|| vec![false; texture.num_tiles() as usize]);
            mark_required_tiles(texture.tiling(), &map, mask);

            for &set_handle in &texture.primary_of {
                let Some(set) = self.sets.get(set_handle) else {
                    continue;
                };
                for (follower, offset) in set.followers_with_offsets() {
                    let Some(follower_texture) = self.textures.get(follower) else {
                        continue;
                    };
                    let resampled = map.resample(follower_texture.tiling().feedback_grid(), offset);
                    let mask = required
                        .entry(follower)
                        .or_insert_with(|| vec![false; follower_texture.num_tiles() as usize]);
                    mark_required_tiles(follower_texture.tiling(), &resampled, mask);
                }
            }
        }

        let mut results = FeedbackTextureCollection::default();
        let mut transitions = FeedbackTransitions::default();
        for (handle, mask) in &required {
            let Some(texture) = self.textures.get_mut(*handle) else {
                continue;
            };
            transitions.clear();
            texture
                .residency
                .apply_feedback(*handle, mask, now, timeout, &mut self.standby, &mut transitions);

            let mut unbind: SmallVec<[TileBinding; 8]> = SmallVec::new();
            for &tile in &transitions.aged_out {
                if self.allocator.allocation(texture.allocator_id, tile).is_some() {
                    self.allocator.unmap_tiles(texture.allocator_id, &[tile]);
                    unbind.push(TileBinding {
                        tile_index: tile,
                        slot: None,
                    });
                }
            }
            if !unbind.is_empty() {
                backend.update_tile_mappings(texture.reserved_texture(), &unbind);
                texture.min_mip_dirty = true;
            }

            if !transitions.newly_requested.is_empty() {
                results.textures.push(FeedbackTextureUpdate {
                    texture: *handle,
                    tile_indices: transitions.newly_requested.clone(),
                });
            }
        }

        for tile in std::mem::take(&mut self.reissued) {
            if self.tile_state(tile.texture, tile.tile_index) == Some(TileState::Requested) {
                results.push(tile.texture, tile.tile_index);
            }
        }

        // Pick the textures whose feedback is collected this frame
        let ring_len = self.readback_ring.len();
        let limit = config.max_textures_to_update as usize;
        let count = if limit == 0 { ring_len } else { limit.min(ring_len) };
        let selected: Vec<TextureHandle> = self.readback_ring[..count].to_vec();
        self.readback_ring.rotate_left(count % ring_len.max(1));
        for &handle in &selected {
            if let Some(texture) = self.textures.get(handle) {
                backend.clear_feedback(texture.feedback_surface());
            }
        }
        self.readback_slots[slot] = selected;

        self.compact_standby();

        log::trace!(
            "Frame {}: {} textures read back, {} tiles requested",
            config.frame_index,
            required.len(),
            results.num_tiles()
        );
        if let Some(err) = first_error {
            // Requests of the textures that did read back are reported next frame
            for update in &results.textures {
                self.reissued
                    .extend(update.tile_indices.iter().map(|&t| RequestedTile::new(update.texture, t)));
            }
            return Err(err);
        }
        Ok(results)
    }

    /// Map the selected tiles, then run heap maintenance and min-mip updates
    ///
    /// Must be called every frame, even with no tiles, so maintenance runs.
    pub fn update_tile_mappings(
        &mut self,
        backend: &mut dyn StreamingBackend,
        tiles: &[RequestedTile],
    ) -> StreamingResult<TileMappingOutcome> {
        let _span = tracing::debug_span!("update_tile_mappings", tiles = tiles.len()).entered();
        self.timer_update_tile_mappings.begin();
        let result = self.update_tile_mappings_inner(backend, tiles);
        self.timer_update_tile_mappings.end();
        result
    }

    fn update_tile_mappings_inner(
        &mut self,
        backend: &mut dyn StreamingBackend,
        tiles: &[RequestedTile],
    ) -> StreamingResult<TileMappingOutcome> {
        let mut outcome = TileMappingOutcome::default();
        let mut mapped: IndexMap<TextureHandle, Vec<(u32, TileAllocation)>> = IndexMap::new();
        let mut packed_groups: IndexMap<TextureHandle, Vec<u32>> = IndexMap::new();
        let mut regular = Vec::with_capacity(tiles.len());

        for &tile in tiles {
            let Some(texture) = self.textures.get(tile.texture) else {
                continue;
            };
            if tile.tile_index >= texture.num_tiles() {
                return Err(StreamingError::MalformedTileIndex {
                    tile: tile.tile_index,
                    total: texture.num_tiles(),
                });
            }
            if texture.residency.state(tile.tile_index) != TileState::Requested {
                continue;
            }
            if texture.is_tile_packed(tile.tile_index) {
                packed_groups.entry(tile.texture).or_default().push(tile.tile_index);
            } else {
                regular.push(tile);
            }
        }

        // Packed tails go first and map all-or-nothing
        for (handle, group) in packed_groups {
            let Some(allocator_id) = self.textures.get(handle).map(|t| t.allocator_id) else {
                continue;
            };
            let mut allocations = Vec::with_capacity(group.len());
            let mut fresh = Vec::new();
            for &tile_index in &group {
                let held = self.allocator.allocation(allocator_id, tile_index).is_some();
                let Some(allocation) = self.map_with_reclaim(backend, handle, tile_index) else {
                    break;
                };
                if !held {
                    fresh.push(tile_index);
                }
                allocations.push((tile_index, allocation));
            }

            let group_tiles = group.iter().map(|&t| RequestedTile::new(handle, t));
            if allocations.len() == group.len() {
                mapped.entry(handle).or_default().extend(allocations);
                outcome.mapped.extend(group_tiles);
            } else {
                self.allocator.unmap_tiles(allocator_id, &fresh);
                outcome.deferred.extend(group_tiles);
            }
        }

        for tile in regular {
            match self.map_with_reclaim(backend, tile.texture, tile.tile_index) {
                Some(allocation) => {
                    mapped.entry(tile.texture).or_default().push((tile.tile_index, allocation));
                    outcome.mapped.push(tile);
                }
                None => outcome.deferred.push(tile),
            }
        }

        self.process_heap_events(backend);

        // Tiles placed in a heap the backend could not create stay requested
        let mut unbacked = Vec::new();
        for (handle, allocations) in mapped {
            let Some(texture) = self.textures.get_mut(handle) else {
                continue;
            };
            let packed_unbacked = allocations
                .iter()
                .any(|&(tile, a)| texture.is_tile_packed(tile) && !self.heaps.contains_key(&a.heap));
            let mut bindings = Vec::with_capacity(allocations.len());
            let mut released = Vec::new();
            for (tile_index, allocation) in allocations {
                let slot = heap_slot(&self.heaps, allocation)
                    .filter(|_| !(packed_unbacked && texture.is_tile_packed(tile_index)));
                match slot {
                    Some(_) => texture.residency.set_state(tile_index, TileState::Active),
                    None => {
                        released.push(tile_index);
                        unbacked.push(RequestedTile::new(handle, tile_index));
                    }
                }
                bindings.push(TileBinding { tile_index, slot });
            }
            if !released.is_empty() {
                self.allocator.unmap_tiles(texture.allocator_id, &released);
            }
            backend.update_tile_mappings(texture.reserved_texture(), &bindings);
            texture.min_mip_dirty = true;
        }
        if !unbacked.is_empty() {
            outcome.mapped.retain(|tile| !unbacked.contains(tile));
            outcome.deferred.extend(unbacked);
        }

        if !outcome.deferred.is_empty() {
            log::warn!(
                "{} tiles deferred ({} mapped)",
                outcome.deferred.len(),
                outcome.mapped.len()
            );
        }

        if self.frame_config.trim_standby_tiles {
            self.trim_standby(backend, self.frame_config.num_extra_standby_tiles);
        }

        let report = self
            .allocator
            .run_maintenance(self.frame_config.defragment_heaps, self.frame_config.release_empty_heaps);
        if !report.relocations.is_empty() {
            self.apply_relocations(backend, &report.relocations);
        }
        self.process_heap_events(backend);

        self.write_min_mip_textures(backend);
        Ok(outcome)
    }

    /// Return tiles to `Requested` so they are reported and uploaded again
    ///
    /// Allocations are kept; used when a mapped tile could not be uploaded.
    /// Min-mip maps are rewritten so shaders stop sampling the tiles.
    pub fn reissue_tiles(&mut self, backend: &mut dyn StreamingBackend, tiles: &[RequestedTile]) {
        for &tile in tiles {
            let Some(texture) = self.textures.get_mut(tile.texture) else {
                continue;
            };
            if texture.residency.state(tile.tile_index) != TileState::Unmapped {
                texture.residency.set_state(tile.tile_index, TileState::Requested);
                texture.min_mip_dirty = true;
                self.reissued.push(tile);
            }
        }
        self.write_min_mip_textures(backend);
    }

    fn map_with_reclaim(
        &mut self,
        backend: &mut dyn StreamingBackend,
        handle: TextureHandle,
        tile_index: u32,
    ) -> Option<TileAllocation> {
        loop {
            let allocator_id = self.textures.get(handle)?.allocator_id;
            if let Some(allocation) = self.allocator.map_tile(allocator_id, tile_index) {
                return Some(allocation);
            }
            if !self.reclaim_oldest_standby(backend) {
                return None;
            }
        }
    }

    /// Unmap the least recently used standby tile
    fn reclaim_oldest_standby(&mut self, backend: &mut dyn StreamingBackend) -> bool {
        let textures = &self.textures;
        let entry = self.standby.pop_oldest(|entry| {
            textures
                .get(entry.texture)
                .and_then(|t| t.residency.standby_stamp(entry.tile_index))
                == Some(entry.stamp)
        });
        let Some(entry) = entry else {
            return false;
        };

        self.evict_tile(backend, entry.texture, entry.tile_index);
        true
    }

    fn evict_tile(&mut self, backend: &mut dyn StreamingBackend, handle: TextureHandle, tile_index: u32) {
        let Some(texture) = self.textures.get_mut(handle) else {
            return;
        };
        texture.residency.set_state(tile_index, TileState::Unmapped);
        texture.min_mip_dirty = true;
        self.allocator.unmap_tiles(texture.allocator_id, &[tile_index]);
        backend.update_tile_mappings(
            texture.reserved_texture(),
            &[TileBinding {
                tile_index,
                slot: None,
            }],
        );
        log::trace!("Evicted tile {} of '{}'", tile_index, texture.name());
    }

    fn trim_standby(&mut self, backend: &mut dyn StreamingBackend, keep: u32) {
        let mut standby = self.tile_counts().standby;
        let mut trimmed = 0;
        while standby > keep && self.reclaim_oldest_standby(backend) {
            standby -= 1;
            trimmed += 1;
        }
        if trimmed > 0 {
            log::debug!("Trimmed {} standby tiles", trimmed);
        }
    }

    fn compact_standby(&mut self) {
        let live = self.tile_counts().standby as usize;
        if self.standby.len() > live * 2 + 64 {
            let textures = &self.textures;
            self.standby.retain_live(|entry| {
                textures
                    .get(entry.texture)
                    .and_then(|t| t.residency.standby_stamp(entry.tile_index))
                    == Some(entry.stamp)
            });
        }
    }

    fn apply_relocations(&mut self, backend: &mut dyn StreamingBackend, relocations: &[Relocation]) {
        let mut grouped: IndexMap<TextureHandle, Vec<TileBinding>> = IndexMap::new();
        for relocation in relocations {
            let Some(&handle) = self.allocator_ids.get(&relocation.texture) else {
                continue;
            };
            let Some(texture) = self.textures.get_mut(handle) else {
                continue;
            };

            if texture.residency.state(relocation.tile_index).is_resident() {
                texture.residency.set_state(relocation.tile_index, TileState::Requested);
                self.reissued.push(RequestedTile::new(handle, relocation.tile_index));
            }
            texture.min_mip_dirty = true;
            grouped.entry(handle).or_default().push(TileBinding {
                tile_index: relocation.tile_index,
                slot: heap_slot(&self.heaps, relocation.to),
            });
        }

        for (handle, bindings) in grouped {
            if let Some(texture) = self.textures.get(handle) {
                backend.update_tile_mappings(texture.reserved_texture(), &bindings);
            }
        }
        log::debug!("Defragmentation moved {} tiles", relocations.len());
    }

    /// Create and release backend heaps to follow the allocator
    ///
    /// Heaps the backend fails to create are retried on the next call.
    fn process_heap_events(&mut self, backend: &mut dyn StreamingBackend) {
        let retries = std::mem::take(&mut self.missing_heaps)
            .into_iter()
            .map(|(heap, size_in_tiles)| HeapEvent::Created { heap, size_in_tiles });
        let events: Vec<HeapEvent> = retries.chain(self.allocator.drain_heap_events()).collect();
        for event in events {
            match event {
                HeapEvent::Created { heap, size_in_tiles } => match backend.create_heap(size_in_tiles) {
                    Ok(id) => {
                        self.heaps.insert(heap, id);
                    }
                    Err(err) => {
                        log::warn!("Failed to create a {}-tile heap: {}", size_in_tiles, err);
                        self.missing_heaps.push((heap, size_in_tiles));
                    }
                },
                HeapEvent::Released { heap } => {
                    if let Some(id) = self.heaps.remove(&heap) {
                        backend.release_heap(id);
                    }
                    self.missing_heaps.retain(|&(missing, _)| missing != heap);
                }
            }
        }
    }

    fn write_min_mip_textures(&mut self, backend: &mut dyn StreamingBackend) {
        let mut updated = Vec::new();
        for (handle, texture) in self.textures.iter_mut() {
            if texture.refresh_min_mip() {
                updated.push((
                    handle,
                    texture.min_mip_texture(),
                    texture.tiling().feedback_grid().x * 4,
                    texture.min_mip_bytes(),
                ));
            }
        }
        if updated.is_empty() {
            return;
        }

        for (_, min_mip, _, _) in &updated {
            backend.require_texture_state(*min_mip, ResourceState::CopyDest);
        }
        backend.commit_barriers();
        for (handle, min_mip, row_pitch, data) in &updated {
            if let Err(err) = backend.write_subresource(*min_mip, 0, data, *row_pitch) {
                log::warn!("Failed to write min-mip map: {}", err);
                if let Some(texture) = self.textures.get_mut(*handle) {
                    texture.min_mip_dirty = true;
                }
            }
        }
        for (_, min_mip, _, _) in &updated {
            backend.require_texture_state(*min_mip, ResourceState::ShaderResource);
        }
        backend.commit_barriers();
    }

    /// Resolve this frame's feedback for the textures selected in `begin_frame`
    pub fn resolve_feedback(&mut self, backend: &mut dyn StreamingBackend) {
        let _span = tracing::debug_span!("resolve_feedback").entered();
        self.timer_resolve.begin();

        let slot = self.frame_slot;
        for &handle in &self.readback_slots[slot] {
            let Some(texture) = self.textures.get(handle) else {
                continue;
            };
            if let Some(&buffer) = texture.resources().resolve_buffers.get(slot) {
                backend.resolve_feedback(texture.feedback_surface(), buffer);
            }
        }

        self.timer_resolve.end();
    }

    /// Close the frame
    pub fn end_frame(&mut self) {
        log::debug!("Frame {}: {}", self.frame_config.frame_index, self.stats());
    }

    fn tile_counts(&self) -> TileCounts {
        let mut counts = TileCounts::default();
        for (_, texture) in self.textures.iter() {
            counts.add(&texture.residency.counts());
        }
        counts
    }

    /// Current heap usage, tile states and phase timings
    pub fn stats(&self) -> FeedbackStats {
        let allocator = self.allocator.stats();
        let counts = self.tile_counts();
        FeedbackStats {
            heap_allocation_bytes: allocator.allocation_bytes(),
            heap_tiles_capacity: allocator.capacity_tiles(),
            heap_tiles_free: allocator.free_tiles(),
            tiles_total: self.textures.iter().map(|(_, t)| t.num_tiles()).sum(),
            tiles_requested: counts.requested,
            tiles_allocated: counts.active,
            tiles_idle: counts.idle,
            tiles_standby: counts.standby,
            cpu_time_begin_frame: self.timer_begin_frame.seconds(),
            cpu_time_update_tile_mappings: self.timer_update_tile_mappings.seconds(),
            cpu_time_resolve: self.timer_resolve.seconds(),
        }
    }
}

fn heap_slot(heaps: &AHashMap<u32, HeapId>, allocation: TileAllocation) -> Option<HeapSlot> {
    heaps.get(&allocation.heap).map(|&heap| HeapSlot {
        heap,
        offset_in_tiles: allocation.slot,
    })
}
