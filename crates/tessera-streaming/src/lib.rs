//! # Tessera Streaming
//!
//! Tile residency and texture streaming driven by sampler feedback.
//!
//! ## Features
//! - Reserved textures backed by a sparse set of 64 KiB memory tiles
//! - Per-frame feedback readback with frames-in-flight latency
//! - Tile state machine with idle timeout and a global standby LRU
//! - Bounded per-frame tile uploads through a staging ring
//! - Texture sets driving follower residency from a primary texture
//! - Memoized material bindings with fallback resources
//!
//! The graphics API is reached only through [`StreamingBackend`]; the
//! [`HeadlessBackend`] implements it in memory for tests and tooling.

pub mod allocator;
pub mod backend;
pub mod binding;
pub mod config;
pub mod feedback;
pub mod headless;
pub mod manager;
pub mod maps;
pub mod pipeline;
pub mod residency;
pub mod scheduler;
pub mod stats;
pub mod texture;
pub mod texture_set;
pub mod tiling;
pub mod upload;

pub use allocator::{HeapTileAllocator, TileAllocation, TileAllocator, TileLayout};
pub use backend::{
    BufferId, FallbackResources, FeedbackSurfaceId, HeapId, ResourceState, SamplerId,
    StreamingBackend, TextureId, TiledResources,
};
pub use binding::{Material, MaterialBindingCache, MaterialBindings, MaterialId, MaterialSlot};
pub use config::{FeedbackPassConstants, FeedbackPassSettings, FeedbackUpdateConfig, StreamingConfig};
pub use headless::HeadlessBackend;
pub use manager::{FeedbackManager, FeedbackTextureCollection, FeedbackTextureUpdate, TileMappingOutcome};
pub use maps::FeedbackTextureMaps;
pub use pipeline::{FrameUploads, MipData, SourceTexture, SourceTextureId, StreamingPipeline};
pub use scheduler::{RequestedTile, TileRequestQueue};
pub use stats::FeedbackStats;
pub use texture::{TextureHandle, TiledTexture};
pub use texture_set::{AdmissionError, TextureSet, TextureSetHandle};
pub use tiling::{TextureDesc, TextureTiling, TileInfo, TileShape, UntileableReason, TILE_SIZE_IN_BYTES};
pub use upload::{SubresourceData, TileUploadStage};

use thiserror::Error;

/// Streaming errors
#[derive(Error, Debug)]
pub enum StreamingError {
    #[error("Texture '{name}' cannot be tiled: {reason}")]
    Untileable {
        name: String,
        reason: UntileableReason,
    },

    #[error("Texture handle is stale or was released")]
    StaleTexture,

    #[error("Texture set handle is stale or was released")]
    StaleTextureSet,

    #[error("Tile index {tile} is out of range for a texture with {total} tiles")]
    MalformedTileIndex { tile: u32, total: u32 },

    #[error("Feedback readback size mismatch: expected {expected} bytes, got {actual}")]
    FeedbackSizeMismatch { expected: usize, actual: usize },

    #[error("Texture set rejected: {0}")]
    SetAdmission(#[from] AdmissionError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Source data for '{name}' mip {mip} is too small for the requested tile")]
    SourceDataTooSmall { name: String, mip: u32 },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

/// Result type for streaming operations
pub type StreamingResult<T> = Result<T, StreamingError>;
