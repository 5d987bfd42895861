//! Streaming Statistics

use std::fmt;

/// Snapshot of heap usage, tile states and per-phase CPU time
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeedbackStats {
    /// Bytes committed to tile heaps
    pub heap_allocation_bytes: u64,
    /// Tile slots across all heaps
    pub heap_tiles_capacity: u32,
    /// Unused tile slots
    pub heap_tiles_free: u32,
    /// Tiles across all tracked textures
    pub tiles_total: u32,
    /// Tiles waiting for memory and data
    pub tiles_requested: u32,
    /// Active tiles
    pub tiles_allocated: u32,
    pub tiles_idle: u32,
    pub tiles_standby: u32,
    /// Seconds spent in `begin_frame`
    pub cpu_time_begin_frame: f64,
    /// Seconds spent in `update_tile_mappings`
    pub cpu_time_update_tile_mappings: f64,
    /// Seconds spent in `resolve_feedback`
    pub cpu_time_resolve: f64,
}

impl FeedbackStats {
    /// Tiles holding heap memory in any mapped state
    pub fn tiles_mapped(&self) -> u32 {
        self.tiles_allocated + self.tiles_idle + self.tiles_standby
    }

    pub fn heap_allocation_mib(&self) -> f64 {
        self.heap_allocation_bytes as f64 / (1024.0 * 1024.0)
    }
}

impl fmt::Display for FeedbackStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "heap {:.1} MiB ({}/{} tiles free), tiles total {} requested {} allocated {} idle {} standby {}, cpu begin {:.3} ms update {:.3} ms resolve {:.3} ms",
            self.heap_allocation_mib(),
            self.heap_tiles_free,
            self.heap_tiles_capacity,
            self.tiles_total,
            self.tiles_requested,
            self.tiles_allocated,
            self.tiles_idle,
            self.tiles_standby,
            self.cpu_time_begin_frame * 1000.0,
            self.cpu_time_update_tile_mappings * 1000.0,
            self.cpu_time_resolve * 1000.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapped_tiles_and_display() {
        let stats = FeedbackStats {
            heap_allocation_bytes: 2 * 1024 * 1024,
            heap_tiles_capacity: 32,
            heap_tiles_free: 20,
            tiles_allocated: 8,
            tiles_idle: 3,
            tiles_standby: 1,
            ..Default::default()
        };

        assert_eq!(stats.tiles_mapped(), 12);
        assert_eq!(stats.heap_allocation_mib(), 2.0);
        assert!(stats.to_string().starts_with("heap 2.0 MiB (20/32 tiles free)"));
    }
}
