//! Tile Allocator
//!
//! Maps texture tiles to slots in a pool of equally sized heaps.
//!
//! ## Features
//! - First-fit into the fullest heap with free space
//! - Heap growth on demand up to a configured ceiling
//! - Incremental defragmentation out of the emptiest heap
//! - Release of empty heaps

use ahash::AHashMap;

/// Number of tiles moved per defragmentation pass
pub const DEFRAG_TILES_PER_PASS: usize = 16;

/// Allocator-side texture identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocatorTextureId(u32);

/// Tile counts of a registered texture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileLayout {
    /// Total tiles including the packed tail
    pub num_tiles: u32,
    /// Individually tiled tiles
    pub num_regular_tiles: u32,
}

/// Heap slot holding a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileAllocation {
    /// Allocator heap index
    pub heap: u32,
    /// Slot within the heap
    pub slot: u32,
}

/// Tile moved by defragmentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub texture: AllocatorTextureId,
    pub tile_index: u32,
    pub from: TileAllocation,
    pub to: TileAllocation,
}

/// Outcome of a maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub relocations: Vec<Relocation>,
    pub heaps_released: u32,
}

/// Heap lifecycle events for the graphics backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapEvent {
    Created { heap: u32, size_in_tiles: u32 },
    Released { heap: u32 },
}

/// Allocator occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub heaps: u32,
    pub heap_size_in_tiles: u32,
    pub allocated_tiles: u32,
}

impl AllocatorStats {
    /// Tile slots across all live heaps
    pub fn capacity_tiles(&self) -> u32 {
        self.heaps * self.heap_size_in_tiles
    }

    pub fn free_tiles(&self) -> u32 {
        self.capacity_tiles() - self.allocated_tiles
    }

    /// Bytes committed to heaps
    pub fn allocation_bytes(&self) -> u64 {
        self.capacity_tiles() as u64 * crate::tiling::TILE_SIZE_IN_BYTES as u64
    }
}

/// Tile-to-heap mapping capability used by the residency manager
pub trait TileAllocator {
    /// Register a texture's tile layout
    fn register_texture(&mut self, layout: TileLayout) -> AllocatorTextureId;

    /// Free every tile of a texture and forget it
    fn unregister_texture(&mut self, texture: AllocatorTextureId);

    /// Map one tile, returning its slot; an already mapped tile keeps its slot
    fn map_tile(&mut self, texture: AllocatorTextureId, tile_index: u32) -> Option<TileAllocation>;

    /// Map several tiles, reporting success per tile
    fn map_tiles(&mut self, texture: AllocatorTextureId, tiles: &[u32]) -> Vec<bool> {
        tiles
            .iter()
            .map(|&tile| self.map_tile(texture, tile).is_some())
            .collect()
    }

    fn unmap_tiles(&mut self, texture: AllocatorTextureId, tiles: &[u32]);

    /// Current slot of a tile
    fn allocation(&self, texture: AllocatorTextureId, tile_index: u32) -> Option<TileAllocation>;

    /// Defragment and release empty heaps
    fn run_maintenance(&mut self, defragment: bool, release_empty_heaps: bool) -> MaintenanceReport;

    /// Take heap events recorded since the last call
    fn drain_heap_events(&mut self) -> Vec<HeapEvent>;

    fn stats(&self) -> AllocatorStats;
}

#[derive(Debug)]
struct Heap {
    owners: Vec<Option<(AllocatorTextureId, u32)>>,
    free: Vec<u32>,
    used: u32,
}

impl Heap {
    fn new(size_in_tiles: u32) -> Self {
        Self {
            owners: vec![None; size_in_tiles as usize],
            free: (0..size_in_tiles).rev().collect(),
            used: 0,
        }
    }

    fn has_space(&self) -> bool {
        !self.free.is_empty()
    }
}

/// Heap pool allocator
#[derive(Debug)]
pub struct HeapTileAllocator {
    heap_size_in_tiles: u32,
    /// 0 = unlimited
    max_heaps: u32,
    heaps: Vec<Option<Heap>>,
    textures: AHashMap<AllocatorTextureId, Vec<Option<TileAllocation>>>,
    next_texture_id: u32,
    events: Vec<HeapEvent>,
}

impl HeapTileAllocator {
    /// Create an allocator; `max_heaps == 0` allows unlimited growth
    pub fn new(heap_size_in_tiles: u32, max_heaps: u32) -> Self {
        Self {
            heap_size_in_tiles: heap_size_in_tiles.max(1),
            max_heaps,
            heaps: Vec::new(),
            textures: AHashMap::new(),
            next_texture_id: 0,
            events: Vec::new(),
        }
    }

    fn live_heaps(&self) -> u32 {
        self.heaps.iter().flatten().count() as u32
    }

    /// Fullest heap with free space, excluding `exclude`
    fn fullest_with_space(&self, exclude: Option<u32>) -> Option<u32> {
        self.heaps
            .iter()
            .enumerate()
            .filter(|(index, _)| Some(*index as u32) != exclude)
            .filter_map(|(index, heap)| heap.as_ref().map(|h| (index as u32, h)))
            .filter(|(_, heap)| heap.has_space())
            .max_by(|(ia, a), (ib, b)| a.used.cmp(&b.used).then(ib.cmp(ia)))
            .map(|(index, _)| index)
    }

    fn grow(&mut self) -> Option<u32> {
        if self.max_heaps != 0 && self.live_heaps() >= self.max_heaps {
            return None;
        }

        let heap = Heap::new(self.heap_size_in_tiles);
        let index = match self.heaps.iter().position(Option::is_none) {
            Some(index) => {
                self.heaps[index] = Some(heap);
                index as u32
            }
            None => {
                self.heaps.push(Some(heap));
                self.heaps.len() as u32 - 1
            }
        };

        log::debug!("Tile heap {} created ({} tiles)", index, self.heap_size_in_tiles);
        self.events.push(HeapEvent::Created {
            heap: index,
            size_in_tiles: self.heap_size_in_tiles,
        });
        Some(index)
    }

    fn take_slot(&mut self, heap: u32, owner: (AllocatorTextureId, u32)) -> Option<TileAllocation> {
        let h = self.heaps.get_mut(heap as usize)?.as_mut()?;
        let slot = h.free.pop()?;
        h.owners[slot as usize] = Some(owner);
        h.used += 1;
        Some(TileAllocation { heap, slot })
    }

    fn free_slot(&mut self, allocation: TileAllocation) {
        if let Some(Some(h)) = self.heaps.get_mut(allocation.heap as usize) {
            if h.owners[allocation.slot as usize].take().is_some() {
                h.free.push(allocation.slot);
                h.used -= 1;
            }
        }
    }

    fn defragment(&mut self, report: &mut MaintenanceReport) {
        if self.live_heaps() < 2 {
            return;
        }

        let Some(source) = self
            .heaps
            .iter()
            .enumerate()
            .filter_map(|(index, heap)| heap.as_ref().map(|h| (index as u32, h.used)))
            .filter(|(_, used)| *used > 0)
            .min_by(|(ia, a), (ib, b)| a.cmp(b).then(ib.cmp(ia)))
            .map(|(index, _)| index)
        else {
            return;
        };

        let owned: Vec<(u32, (AllocatorTextureId, u32))> = match &self.heaps[source as usize] {
            Some(heap) => heap
                .owners
                .iter()
                .enumerate()
                .filter_map(|(slot, owner)| owner.map(|o| (slot as u32, o)))
                .take(DEFRAG_TILES_PER_PASS)
                .collect(),
            None => return,
        };

        for (slot, owner) in owned {
            let source_used = self.heaps[source as usize].as_ref().map_or(0, |h| h.used);
            let Some(dest) = self.fullest_with_space(Some(source)) else {
                break;
            };
            let dest_used = self.heaps[dest as usize].as_ref().map_or(0, |h| h.used);
            if dest_used < source_used {
                break;
            }

            let from = TileAllocation { heap: source, slot };
            let Some(to) = self.take_slot(dest, owner) else {
                break;
            };
            self.free_slot(from);

            let (texture, tile_index) = owner;
            if let Some(tiles) = self.textures.get_mut(&texture) {
                tiles[tile_index as usize] = Some(to);
            }
            report.relocations.push(Relocation {
                texture,
                tile_index,
                from,
                to,
            });
        }
    }

    fn release_empty(&mut self, report: &mut MaintenanceReport) {
        for (index, heap) in self.heaps.iter_mut().enumerate() {
            if heap.as_ref().is_some_and(|h| h.used == 0) {
                *heap = None;
                log::debug!("Tile heap {} released", index);
                self.events.push(HeapEvent::Released { heap: index as u32 });
                report.heaps_released += 1;
            }
        }
    }
}

impl TileAllocator for HeapTileAllocator {
    fn register_texture(&mut self, layout: TileLayout) -> AllocatorTextureId {
        let id = AllocatorTextureId(self.next_texture_id);
        self.next_texture_id += 1;
        self.textures.insert(id, vec![None; layout.num_tiles as usize]);
        id
    }

    fn unregister_texture(&mut self, texture: AllocatorTextureId) {
        if let Some(tiles) = self.textures.remove(&texture) {
            for allocation in tiles.into_iter().flatten() {
                self.free_slot(allocation);
            }
        }
    }

    fn map_tile(&mut self, texture: AllocatorTextureId, tile_index: u32) -> Option<TileAllocation> {
        if let Some(existing) = *self.textures.get(&texture)?.get(tile_index as usize)? {
            return Some(existing);
        }

        let heap = match self.fullest_with_space(None) {
            Some(heap) => heap,
            None => self.grow()?,
        };
        let allocation = self.take_slot(heap, (texture, tile_index))?;
        if let Some(tiles) = self.textures.get_mut(&texture) {
            tiles[tile_index as usize] = Some(allocation);
        }
        Some(allocation)
    }

    fn unmap_tiles(&mut self, texture: AllocatorTextureId, tiles: &[u32]) {
        for &tile in tiles {
            let allocation = self
                .textures
                .get_mut(&texture)
                .and_then(|t| t.get_mut(tile as usize))
                .and_then(Option::take);
            if let Some(allocation) = allocation {
                self.free_slot(allocation);
            }
        }
    }

    fn allocation(&self, texture: AllocatorTextureId, tile_index: u32) -> Option<TileAllocation> {
        self.textures.get(&texture)?.get(tile_index as usize).copied().flatten()
    }

    fn run_maintenance(&mut self, defragment: bool, release_empty_heaps: bool) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        if defragment {
            self.defragment(&mut report);
        }
        if release_empty_heaps {
            self.release_empty(&mut report);
        }
        report
    }

    fn drain_heap_events(&mut self) -> Vec<HeapEvent> {
        std::mem::take(&mut self.events)
    }

    fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            heaps: self.live_heaps(),
            heap_size_in_tiles: self.heap_size_in_tiles,
            allocated_tiles: self.heaps.iter().flatten().map(|h| h.used).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(num_tiles: u32) -> TileLayout {
        TileLayout {
            num_tiles,
            num_regular_tiles: num_tiles.saturating_sub(1),
        }
    }

    #[test]
    fn test_map_and_unmap() {
        let mut allocator = HeapTileAllocator::new(4, 0);
        let texture = allocator.register_texture(layout(8));

        let a = allocator.map_tile(texture, 0).unwrap();
        assert_eq!(a, TileAllocation { heap: 0, slot: 0 });
        // Remapping returns the existing slot
        assert_eq!(allocator.map_tile(texture, 0), Some(a));
        assert_eq!(allocator.stats().allocated_tiles, 1);

        allocator.unmap_tiles(texture, &[0]);
        assert!(allocator.allocation(texture, 0).is_none());
        assert_eq!(allocator.stats().allocated_tiles, 0);
        assert_eq!(
            allocator.drain_heap_events(),
            vec![HeapEvent::Created { heap: 0, size_in_tiles: 4 }]
        );
    }

    #[test]
    fn test_growth_and_exhaustion() {
        let mut allocator = HeapTileAllocator::new(2, 2);
        let texture = allocator.register_texture(layout(8));

        let results = allocator.map_tiles(texture, &[0, 1, 2, 3, 4]);
        assert_eq!(results, vec![true, true, true, true, false]);

        let stats = allocator.stats();
        assert_eq!(stats.heaps, 2);
        assert_eq!(stats.capacity_tiles(), 4);
        assert_eq!(stats.free_tiles(), 0);
        assert_eq!(stats.allocation_bytes(), 4 * 65536);
    }

    #[test]
    fn test_out_of_range_tile() {
        let mut allocator = HeapTileAllocator::new(2, 0);
        let texture = allocator.register_texture(layout(2));

        assert!(allocator.map_tile(texture, 5).is_none());
        assert!(allocator.drain_heap_events().is_empty());
    }

    #[test]
    fn test_unregister_frees_tiles() {
        let mut allocator = HeapTileAllocator::new(4, 0);
        let a = allocator.register_texture(layout(4));
        let b = allocator.register_texture(layout(4));
        allocator.map_tiles(a, &[0, 1, 2]);
        allocator.map_tiles(b, &[0]);

        allocator.unregister_texture(a);
        assert_eq!(allocator.stats().allocated_tiles, 1);
        assert!(allocator.map_tile(a, 0).is_none());
    }

    #[test]
    fn test_defragment_moves_tiles_into_fullest_heap() {
        let mut allocator = HeapTileAllocator::new(4, 0);
        let texture = allocator.register_texture(layout(16));
        allocator.map_tiles(texture, &[0, 1, 2, 3, 4, 5, 6, 7]);
        // Heap 0 keeps 3 tiles, heap 1 keeps 1
        allocator.unmap_tiles(texture, &[0, 5, 6, 7]);

        let report = allocator.run_maintenance(true, true);
        assert_eq!(report.relocations.len(), 1);
        let relocation = report.relocations[0];
        assert_eq!(relocation.tile_index, 4);
        assert_eq!(relocation.from.heap, 1);
        assert_eq!(relocation.to.heap, 0);
        assert_eq!(allocator.allocation(texture, 4), Some(relocation.to));

        assert_eq!(report.heaps_released, 1);
        assert_eq!(allocator.stats().heaps, 1);
        let events = allocator.drain_heap_events();
        assert_eq!(events.last(), Some(&HeapEvent::Released { heap: 1 }));
    }

    #[test]
    fn test_defragment_skips_when_nothing_to_gain() {
        let mut allocator = HeapTileAllocator::new(4, 0);
        let texture = allocator.register_texture(layout(16));
        allocator.map_tiles(texture, &[0, 1, 2, 3, 4, 5, 6, 7]);

        let report = allocator.run_maintenance(true, false);
        assert!(report.relocations.is_empty());
    }

    #[test]
    fn test_released_heap_index_is_reused() {
        let mut allocator = HeapTileAllocator::new(1, 0);
        let texture = allocator.register_texture(layout(4));
        allocator.map_tiles(texture, &[0, 1]);
        allocator.unmap_tiles(texture, &[0]);
        allocator.run_maintenance(false, true);
        allocator.drain_heap_events();

        let allocation = allocator.map_tile(texture, 2).unwrap();
        assert_eq!(allocation.heap, 0);
        assert_eq!(
            allocator.drain_heap_events(),
            vec![HeapEvent::Created { heap: 0, size_in_tiles: 1 }]
        );
    }
}
