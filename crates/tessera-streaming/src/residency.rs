//! Tile Residency
//!
//! Per-tile state machine and the global standby LRU.
//!
//! ```text
//! Unmapped → Requested → Active ⇄ Idle → Standby → Unmapped
//! ```
//!
//! Idle tiles move to standby after the tile timeout; standby tiles stay
//! mapped until trimmed or reclaimed, and return to active without a
//! re-upload when sampled again.

use std::collections::VecDeque;

/// Residency state of one tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TileState {
    /// No memory bound
    #[default]
    Unmapped,
    /// Wanted by feedback, waiting for memory and data
    Requested,
    /// Mapped, uploaded and sampled recently
    Active,
    /// Mapped but not sampled in the latest feedback
    Idle,
    /// Mapped past its timeout, first in line for eviction
    Standby,
}

impl TileState {
    /// Check whether the tile holds valid texel data
    pub fn is_resident(self) -> bool {
        matches!(self, TileState::Active | TileState::Idle | TileState::Standby)
    }
}

/// Tile counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileCounts {
    pub requested: u32,
    pub active: u32,
    pub idle: u32,
    pub standby: u32,
}

impl TileCounts {
    fn slot(&mut self, state: TileState) -> Option<&mut u32> {
        match state {
            TileState::Unmapped => None,
            TileState::Requested => Some(&mut self.requested),
            TileState::Active => Some(&mut self.active),
            TileState::Idle => Some(&mut self.idle),
            TileState::Standby => Some(&mut self.standby),
        }
    }

    /// Accumulate another texture's counts
    pub fn add(&mut self, other: &TileCounts) {
        self.requested += other.requested;
        self.active += other.active;
        self.idle += other.idle;
        self.standby += other.standby;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct TileResidency {
    state: TileState,
    last_requested: f64,
    standby_stamp: u64,
}

/// Tiles whose state changed while applying feedback
#[derive(Debug, Default)]
pub struct FeedbackTransitions {
    /// Unmapped tiles that became requested
    pub newly_requested: Vec<u32>,
    /// Requested tiles that timed out before being mapped
    pub aged_out: Vec<u32>,
}

impl FeedbackTransitions {
    pub fn clear(&mut self) {
        self.newly_requested.clear();
        self.aged_out.clear();
    }
}

/// Residency of every tile of one texture
#[derive(Debug, Clone)]
pub struct TextureResidency {
    tiles: Vec<TileResidency>,
    counts: TileCounts,
}

impl TextureResidency {
    pub fn new(num_tiles: u32) -> Self {
        Self {
            tiles: vec![TileResidency::default(); num_tiles as usize],
            counts: TileCounts::default(),
        }
    }

    pub fn num_tiles(&self) -> u32 {
        self.tiles.len() as u32
    }

    pub fn state(&self, tile: u32) -> TileState {
        self.tiles
            .get(tile as usize)
            .map_or(TileState::Unmapped, |t| t.state)
    }

    pub fn counts(&self) -> TileCounts {
        self.counts
    }

    pub fn is_resident(&self, tile: u32) -> bool {
        self.state(tile).is_resident()
    }

    /// Stamp of the tile's latest standby entry
    pub fn standby_stamp(&self, tile: u32) -> Option<u64> {
        self.tiles
            .get(tile as usize)
            .filter(|t| t.state == TileState::Standby)
            .map(|t| t.standby_stamp)
    }

    /// Set a tile's state, keeping the counts in sync
    pub fn set_state(&mut self, tile: u32, state: TileState) {
        let Some(entry) = self.tiles.get_mut(tile as usize) else {
            return;
        };
        let previous = std::mem::replace(&mut entry.state, state);
        if let Some(count) = self.counts.slot(previous) {
            *count -= 1;
        }
        if let Some(count) = self.counts.slot(state) {
            *count += 1;
        }
    }

    /// Iterate over tiles in a given state
    pub fn tiles_in_state(&self, state: TileState) -> impl Iterator<Item = u32> + '_ {
        self.tiles
            .iter()
            .enumerate()
            .filter(move |(_, t)| t.state == state)
            .map(|(index, _)| index as u32)
    }

    /// Advance every tile by one feedback observation
    ///
    /// `required` holds one flag per tile. Tiles entering standby are pushed
    /// to `standby` under `key`.
    pub fn apply_feedback<K: Copy>(
        &mut self,
        key: K,
        required: &[bool],
        now: f64,
        timeout: f64,
        standby: &mut StandbyQueue<K>,
        out: &mut FeedbackTransitions,
    ) {
        for tile in 0..self.tiles.len() {
            let index = tile as u32;
            let state = self.tiles[tile].state;

            if required.get(tile).copied().unwrap_or(false) {
                self.tiles[tile].last_requested = now;
                match state {
                    TileState::Unmapped => {
                        self.set_state(index, TileState::Requested);
                        out.newly_requested.push(index);
                    }
                    TileState::Idle | TileState::Standby => {
                        self.set_state(index, TileState::Active);
                    }
                    TileState::Requested | TileState::Active => {}
                }
                continue;
            }

            let expired = now - self.tiles[tile].last_requested >= timeout;
            match state {
                TileState::Active if expired => self.enter_standby(key, index, standby),
                TileState::Active => self.set_state(index, TileState::Idle),
                TileState::Idle if expired => self.enter_standby(key, index, standby),
                TileState::Requested if expired => {
                    self.set_state(index, TileState::Unmapped);
                    out.aged_out.push(index);
                }
                _ => {}
            }
        }
    }

    fn enter_standby<K: Copy>(&mut self, key: K, tile: u32, standby: &mut StandbyQueue<K>) {
        self.set_state(tile, TileState::Standby);
        self.tiles[tile as usize].standby_stamp = standby.push(key, tile);
    }
}

/// Entry in the standby LRU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyEntry<K> {
    pub texture: K,
    pub tile_index: u32,
    pub stamp: u64,
}

/// Global LRU of standby tiles with lazy deletion
///
/// Entries are never removed when a tile leaves standby; a popped entry is
/// only honored if its stamp still matches the tile's current standby stamp.
#[derive(Debug)]
pub struct StandbyQueue<K> {
    entries: VecDeque<StandbyEntry<K>>,
    next_stamp: u64,
}

impl<K: Copy> StandbyQueue<K> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_stamp: 1,
        }
    }

    /// Append a tile as most recently used, returning its stamp
    pub fn push(&mut self, texture: K, tile_index: u32) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.entries.push_back(StandbyEntry {
            texture,
            tile_index,
            stamp,
        });
        stamp
    }

    /// Pop the oldest live entry, discarding stale ones
    pub fn pop_oldest(&mut self, mut is_live: impl FnMut(&StandbyEntry<K>) -> bool) -> Option<StandbyEntry<K>> {
        while let Some(entry) = self.entries.pop_front() {
            if is_live(&entry) {
                return Some(entry);
            }
        }
        None
    }

    /// Drop stale entries
    pub fn retain_live(&mut self, mut is_live: impl FnMut(&StandbyEntry<K>) -> bool) {
        self.entries.retain(|entry| is_live(entry));
    }

    /// Number of entries, including stale ones
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<K: Copy> Default for StandbyQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: f64 = 2.0;

    fn step(
        residency: &mut TextureResidency,
        standby: &mut StandbyQueue<u32>,
        required: &[bool],
        now: f64,
    ) -> FeedbackTransitions {
        let mut out = FeedbackTransitions::default();
        residency.apply_feedback(7, required, now, TIMEOUT, standby, &mut out);
        out
    }

    #[test]
    fn test_request_emitted_once() {
        let mut residency = TextureResidency::new(2);
        let mut standby = StandbyQueue::new();

        let out = step(&mut residency, &mut standby, &[true, false], 0.0);
        assert_eq!(out.newly_requested, vec![0]);
        assert_eq!(residency.state(0), TileState::Requested);

        let out = step(&mut residency, &mut standby, &[true, false], 0.1);
        assert!(out.newly_requested.is_empty());
        assert_eq!(residency.counts().requested, 1);
    }

    #[test]
    fn test_idle_then_standby_after_timeout() {
        let mut residency = TextureResidency::new(1);
        let mut standby = StandbyQueue::new();
        step(&mut residency, &mut standby, &[true], 0.0);
        residency.set_state(0, TileState::Active);

        step(&mut residency, &mut standby, &[false], 0.5);
        assert_eq!(residency.state(0), TileState::Idle);

        step(&mut residency, &mut standby, &[false], 1.9);
        assert_eq!(residency.state(0), TileState::Idle);

        step(&mut residency, &mut standby, &[false], 2.0);
        assert_eq!(residency.state(0), TileState::Standby);
        assert_eq!(standby.len(), 1);
        assert!(residency.standby_stamp(0).is_some());
    }

    #[test]
    fn test_rerequest_within_timeout_keeps_tile() {
        let mut residency = TextureResidency::new(1);
        let mut standby = StandbyQueue::new();
        step(&mut residency, &mut standby, &[true], 0.0);
        residency.set_state(0, TileState::Active);

        step(&mut residency, &mut standby, &[false], 1.0);
        let out = step(&mut residency, &mut standby, &[true], 1.5);

        assert_eq!(residency.state(0), TileState::Active);
        assert!(out.newly_requested.is_empty());
        assert!(standby.is_empty());
    }

    #[test]
    fn test_standby_reactivation_invalidates_entry() {
        let mut residency = TextureResidency::new(1);
        let mut standby = StandbyQueue::new();
        step(&mut residency, &mut standby, &[true], 0.0);
        residency.set_state(0, TileState::Active);
        step(&mut residency, &mut standby, &[false], 5.0);
        assert_eq!(residency.state(0), TileState::Standby);

        step(&mut residency, &mut standby, &[true], 6.0);
        assert_eq!(residency.state(0), TileState::Active);

        let live = standby.pop_oldest(|e| residency.standby_stamp(e.tile_index) == Some(e.stamp));
        assert!(live.is_none());
    }

    #[test]
    fn test_requested_ages_out() {
        let mut residency = TextureResidency::new(1);
        let mut standby = StandbyQueue::new();
        step(&mut residency, &mut standby, &[true], 0.0);

        let out = step(&mut residency, &mut standby, &[false], 1.0);
        assert!(out.aged_out.is_empty());

        let out = step(&mut residency, &mut standby, &[false], 2.5);
        assert_eq!(out.aged_out, vec![0]);
        assert_eq!(residency.state(0), TileState::Unmapped);
        assert_eq!(residency.counts(), TileCounts::default());
    }

    #[test]
    fn test_standby_lru_order() {
        let mut queue = StandbyQueue::new();
        let a = queue.push(1u32, 0);
        let _b = queue.push(1u32, 1);
        let c = queue.push(2u32, 0);

        let first = queue.pop_oldest(|e| e.stamp != a).unwrap();
        assert_eq!(first.tile_index, 1);
        let second = queue.pop_oldest(|_| true).unwrap();
        assert_eq!(second.stamp, c);
        assert!(queue.is_empty());
    }
}
