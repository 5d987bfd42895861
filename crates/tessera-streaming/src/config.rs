//! Streaming Configuration
//!
//! Policy knobs for residency and upload, loadable from JSON. Knobs are
//! snapshotted into a [`FeedbackUpdateConfig`] once per frame so nothing is
//! read live while a phase is running.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{StreamingError, StreamingResult};

/// Settings for the render passes that write feedback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackPassSettings {
    /// Write sampler feedback at all
    pub write_feedback: bool,
    /// Randomly skip feedback writes
    pub stochastic_feedback: bool,
    /// Probability of writing feedback when stochastic
    pub feedback_probability_threshold: f32,
    /// Tint regions sampled without resident data
    pub show_unmapped_regions: bool,
    /// Enable shader debug output
    pub enable_debug: bool,
}

impl Default for FeedbackPassSettings {
    fn default() -> Self {
        Self {
            write_feedback: true,
            stochastic_feedback: true,
            feedback_probability_threshold: 0.005,
            show_unmapped_regions: false,
            enable_debug: false,
        }
    }
}

/// Per-frame constants for feedback-writing passes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedbackPassConstants {
    pub frame_index: u32,
    pub show_unmapped_regions: bool,
    pub enable_debug: bool,
    /// Probability a shader invocation writes feedback
    pub feedback_threshold: f32,
}

/// Streaming configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Frames whose GPU work may be outstanding at once
    pub frames_in_flight: u32,
    /// Tiles per heap
    pub heap_size_in_tiles: u32,
    /// Heap ceiling (0 = unlimited)
    pub max_heaps: u32,
    /// Textures read back per frame (0 = all)
    pub max_textures_per_frame: u32,
    /// Regular tiles uploaded per frame
    pub tiles_per_frame: u32,
    /// Tiles per staging buffer
    pub staging_capacity_tiles: u32,
    /// Seconds of disuse before a tile moves to standby
    pub tile_timeout_seconds: f32,
    /// Standby tiles kept mapped after trimming
    pub num_extra_standby_tiles: u32,
    pub defragment_heaps: bool,
    pub release_empty_heaps: bool,
    pub trim_standby_tiles: bool,
    /// Group material textures into texture sets
    pub texture_sets_enabled: bool,
    pub feedback_pass: FeedbackPassSettings,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            heap_size_in_tiles: 128,
            max_heaps: 0,
            max_textures_per_frame: 0,
            tiles_per_frame: 256,
            staging_capacity_tiles: 256,
            tile_timeout_seconds: 2.0,
            num_extra_standby_tiles: 1000,
            defragment_heaps: true,
            release_empty_heaps: true,
            trim_standby_tiles: true,
            texture_sets_enabled: false,
            feedback_pass: FeedbackPassSettings::default(),
        }
    }
}

impl StreamingConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> StreamingResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> StreamingResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> StreamingResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> StreamingResult<()> {
        if self.frames_in_flight == 0 {
            return Err(StreamingError::InvalidConfig(
                "frames_in_flight must be at least 1".into(),
            ));
        }
        if self.heap_size_in_tiles == 0 {
            return Err(StreamingError::InvalidConfig(
                "heap_size_in_tiles must be at least 1".into(),
            ));
        }
        if self.staging_capacity_tiles == 0 {
            return Err(StreamingError::InvalidConfig(
                "staging_capacity_tiles must be at least 1".into(),
            ));
        }
        if !self.tile_timeout_seconds.is_finite() || self.tile_timeout_seconds < 0.0 {
            return Err(StreamingError::InvalidConfig(format!(
                "tile_timeout_seconds must be a non-negative number, got {}",
                self.tile_timeout_seconds
            )));
        }
        let threshold = self.feedback_pass.feedback_probability_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(StreamingError::InvalidConfig(format!(
                "feedback_probability_threshold must be within 0..=1, got {threshold}"
            )));
        }
        Ok(())
    }

    /// Snapshot the per-frame residency policy
    ///
    /// A camera cut lifts the texture limit for the frame so the whole
    /// visible set is requested at once.
    pub fn update_config(&self, frame_index: u64, camera_cut: bool) -> FeedbackUpdateConfig {
        FeedbackUpdateConfig {
            frame_index,
            max_textures_to_update: if camera_cut { 0 } else { self.max_textures_per_frame },
            camera_cut,
            tile_timeout_seconds: self.tile_timeout_seconds,
            defragment_heaps: self.defragment_heaps,
            release_empty_heaps: self.release_empty_heaps,
            trim_standby_tiles: self.trim_standby_tiles,
            num_extra_standby_tiles: self.num_extra_standby_tiles,
        }
    }

    /// Constants for this frame's feedback-writing passes
    pub fn pass_constants(&self, frame_index: u64) -> FeedbackPassConstants {
        let pass = &self.feedback_pass;
        let feedback_threshold = if !pass.write_feedback {
            0.0
        } else if pass.stochastic_feedback {
            pass.feedback_probability_threshold
        } else {
            1.0
        };

        FeedbackPassConstants {
            frame_index: frame_index as u32,
            show_unmapped_regions: pass.show_unmapped_regions,
            enable_debug: pass.enable_debug,
            feedback_threshold,
        }
    }
}

/// Residency policy for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedbackUpdateConfig {
    pub frame_index: u64,
    /// Textures whose feedback is collected this frame (0 = all)
    pub max_textures_to_update: u32,
    /// Set on the frame after a scene load or teleport
    pub camera_cut: bool,
    pub tile_timeout_seconds: f32,
    pub defragment_heaps: bool,
    pub release_empty_heaps: bool,
    pub trim_standby_tiles: bool,
    pub num_extra_standby_tiles: u32,
}

impl Default for FeedbackUpdateConfig {
    fn default() -> Self {
        StreamingConfig::default().update_config(0, false)
    }
}
