//! Tile Request Scheduling
//!
//! Queue of tiles waiting for memory and data, split into the packed tails
//! that always go out together and regular tiles drained FIFO under the
//! per-frame budget.

use std::collections::VecDeque;

use ahash::AHashSet;

use crate::manager::FeedbackTextureCollection;
use crate::texture::TextureHandle;

/// One tile of one texture waiting to be mapped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestedTile {
    pub texture: TextureHandle,
    pub tile_index: u32,
}

impl RequestedTile {
    pub fn new(texture: TextureHandle, tile_index: u32) -> Self {
        Self { texture, tile_index }
    }
}

/// Tiles selected for this frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduledTiles {
    /// Every queued packed tile
    pub packed: Vec<RequestedTile>,
    /// Budgeted regular tiles in queue order
    pub regular: Vec<RequestedTile>,
}

impl ScheduledTiles {
    /// Packed tiles first, then regular tiles
    pub fn all(&self) -> Vec<RequestedTile> {
        self.packed.iter().chain(&self.regular).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.packed.len() + self.regular.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packed.is_empty() && self.regular.is_empty()
    }
}

/// Pending tile requests
#[derive(Debug, Default)]
pub struct TileRequestQueue {
    packed: Vec<RequestedTile>,
    regular: VecDeque<RequestedTile>,
    pending: AHashSet<RequestedTile>,
}

impl TileRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tile unless it is already queued
    pub fn push(&mut self, tile: RequestedTile, packed: bool) -> bool {
        if !self.pending.insert(tile) {
            return false;
        }
        if packed {
            self.packed.push(tile);
        } else {
            self.regular.push_back(tile);
        }
        true
    }

    /// Queue every tile reported by a feedback cycle
    pub fn ingest(
        &mut self,
        collection: &FeedbackTextureCollection,
        is_packed: impl Fn(TextureHandle, u32) -> bool,
    ) -> usize {
        let mut added = 0;
        for update in &collection.textures {
            for &tile_index in &update.tile_indices {
                let tile = RequestedTile::new(update.texture, tile_index);
                if self.push(tile, is_packed(update.texture, tile_index)) {
                    added += 1;
                }
            }
        }
        added
    }

    /// Take this frame's tiles
    ///
    /// All live packed tiles are taken. Regular tiles are taken from the
    /// front until `min(staging_capacity, tiles_per_frame)` live ones are
    /// found. Tiles failing `is_live` are dropped and use no budget.
    pub fn schedule(
        &mut self,
        tiles_per_frame: u32,
        staging_capacity: u32,
        is_live: impl Fn(RequestedTile) -> bool,
    ) -> ScheduledTiles {
        let budget = tiles_per_frame.min(staging_capacity) as usize;
        let mut stale = 0;

        let mut packed = std::mem::take(&mut self.packed);
        for tile in &packed {
            self.pending.remove(tile);
        }
        let queued = packed.len();
        packed.retain(|&tile| is_live(tile));
        stale += queued - packed.len();

        let mut regular = Vec::with_capacity(budget.min(self.regular.len()));
        while regular.len() < budget {
            let Some(tile) = self.regular.pop_front() else {
                break;
            };
            self.pending.remove(&tile);
            if is_live(tile) {
                regular.push(tile);
            } else {
                stale += 1;
            }
        }

        if stale > 0 {
            log::trace!("Dropped {} stale tile requests", stale);
        }
        ScheduledTiles { packed, regular }
    }

    /// Put deferred tiles back at the front, keeping their order
    pub fn requeue_front(
        &mut self,
        deferred: &[RequestedTile],
        is_packed: impl Fn(TextureHandle, u32) -> bool,
    ) {
        let mut packed = Vec::new();
        for &tile in deferred.iter().rev() {
            if !self.pending.insert(tile) {
                continue;
            }
            if is_packed(tile.texture, tile.tile_index) {
                packed.push(tile);
            } else {
                self.regular.push_front(tile);
            }
        }
        packed.reverse();
        packed.append(&mut self.packed);
        self.packed = packed;
    }

    /// Drop every request of a texture
    pub fn remove_texture(&mut self, texture: TextureHandle) {
        self.packed.retain(|t| t.texture != texture);
        self.regular.retain(|t| t.texture != texture);
        self.pending.retain(|t| t.texture != texture);
    }

    pub fn clear(&mut self) {
        self.packed.clear();
        self.regular.clear();
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.packed.len() + self.regular.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn packed_len(&self) -> usize {
        self.packed.len()
    }

    pub fn regular_len(&self) -> usize {
        self.regular.len()
    }

    /// Queued regular tiles in order
    pub fn regular(&self) -> impl Iterator<Item = &RequestedTile> {
        self.regular.iter()
    }
}
