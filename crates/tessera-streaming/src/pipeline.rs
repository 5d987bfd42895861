//! Streaming Pipeline
//!
//! Scene-level facade tying the feedback manager, request queue, upload
//! stage and binding cache together. Each frame:
//!
//! ```text
//! before_render: begin_frame → queue → schedule → map → re-queue deferred → upload
//! (render passes sample textures and write feedback)
//! after_render:  resolve_feedback → end_frame → stats
//! ```

use std::sync::Arc;

use ahash::AHashMap;
use smallvec::SmallVec;
use tessera_core::{Clock, MonotonicClock, ScopedTimer};

use crate::allocator::HeapTileAllocator;
use crate::backend::{ResourceState, StreamingBackend, TextureId};
use crate::binding::{
    FeedbackSlots, Material, MaterialBindingCache, MaterialBindings, MaterialFeedbackConstants,
    MaterialId, MaterialSlot,
};
use crate::config::{FeedbackPassConstants, StreamingConfig};
use crate::manager::FeedbackManager;
use crate::maps::{FeedbackTextureMaps, MaterialFeedbackState, TextureBinding, TextureRecord};
use crate::residency::TileState;
use crate::scheduler::{RequestedTile, TileRequestQueue};
use crate::stats::FeedbackStats;
use crate::texture::{TextureHandle, TiledTexture};
use crate::tiling::TextureDesc;
use crate::upload::{SubresourceData, TileUploadStage};
use crate::{StreamingError, StreamingResult};

/// Source texture identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceTextureId(pub u64);

/// Texel data of one mip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MipData {
    pub data: Vec<u8>,
    /// Bytes per row of compression blocks
    pub row_pitch: u32,
}

/// Decoded texture as provided by the asset loader
#[derive(Debug, Clone, PartialEq)]
pub struct SourceTexture {
    pub id: SourceTextureId,
    pub desc: TextureDesc,
    pub mips: Vec<MipData>,
}

impl SourceTexture {
    pub fn new(id: SourceTextureId, desc: TextureDesc, mips: Vec<MipData>) -> Self {
        Self { id, desc, mips }
    }

    /// Texture whose every byte is `value`, with tightly packed rows
    pub fn filled(id: SourceTextureId, desc: TextureDesc, value: u8) -> Self {
        let (block_width, block_height) = desc.format.block_dimensions();
        let bytes_per_block = desc.format.block_copy_size(None).unwrap_or(0);
        let mips = (0..desc.mip_levels)
            .map(|mip| {
                let extent = desc.block_rounded_extent(mip);
                let row_pitch = extent.x / block_width * bytes_per_block;
                let rows = extent.y / block_height;
                MipData {
                    data: vec![value; (row_pitch * rows) as usize],
                    row_pitch,
                }
            })
            .collect();
        Self { id, desc, mips }
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn mip(&self, mip: u32) -> Option<SubresourceData<'_>> {
        self.mips.get(mip as usize).map(|m| SubresourceData {
            data: &m.data,
            row_pitch: m.row_pitch,
        })
    }
}

/// Work done by one `before_render`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameUploads {
    /// Tiles newly reported by feedback
    pub tiles_requested: usize,
    /// Textures whose packed tail was written
    pub packed_textures: usize,
    /// Regular tiles copied through staging
    pub regular_tiles: usize,
    /// Tiles left queued for lack of heap memory
    pub deferred: usize,
    /// Tiles still queued after this frame
    pub queued: usize,
}

/// Texture streaming for one loaded scene
pub struct StreamingPipeline {
    config: StreamingConfig,
    manager: FeedbackManager,
    maps: FeedbackTextureMaps,
    queue: TileRequestQueue,
    upload: TileUploadStage,
    bindings: MaterialBindingCache,
    materials: Vec<Material>,
    camera_cut: bool,
}

impl StreamingPipeline {
    /// Create a pipeline timing tiles with the monotonic clock
    pub fn new(backend: &mut dyn StreamingBackend, config: StreamingConfig) -> StreamingResult<Self> {
        Self::with_clock(backend, config, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(
        backend: &mut dyn StreamingBackend,
        config: StreamingConfig,
        clock: Arc<dyn Clock>,
    ) -> StreamingResult<Self> {
        config.validate()?;

        let allocator = HeapTileAllocator::new(config.heap_size_in_tiles, config.max_heaps);
        let manager = FeedbackManager::new(&config, Box::new(allocator), clock);
        let upload = TileUploadStage::new(backend, config.frames_in_flight, config.staging_capacity_tiles)?;
        let bindings = MaterialBindingCache::new(backend.create_fallback_resources()?);

        log::info!(
            "Streaming pipeline: {} frames in flight, {} tiles per heap, {} tiles per frame",
            config.frames_in_flight,
            config.heap_size_in_tiles,
            config.tiles_per_frame
        );
        Ok(Self {
            config,
            manager,
            maps: FeedbackTextureMaps::new(),
            queue: TileRequestQueue::new(),
            upload,
            bindings,
            materials: Vec::new(),
            camera_cut: false,
        })
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn manager(&self) -> &FeedbackManager {
        &self.manager
    }

    pub fn maps(&self) -> &FeedbackTextureMaps {
        &self.maps
    }

    pub fn queue(&self) -> &TileRequestQueue {
        &self.queue
    }

    pub fn binding_cache(&self) -> &MaterialBindingCache {
        &self.bindings
    }

    pub fn materials(&self) -> &[Material] {
        &self.materials
    }

    /// Tiled handle of a loaded texture
    pub fn tiled_texture(&self, name: &str) -> Option<TextureHandle> {
        self.maps.get(name)?.tiled_handle()
    }

    /// Load a scene's textures and materials, replacing any loaded scene
    ///
    /// Tileable textures are streamed; the rest are created fully resident.
    pub fn load_scene(
        &mut self,
        backend: &mut dyn StreamingBackend,
        textures: Vec<Arc<SourceTexture>>,
        materials: Vec<Material>,
    ) -> StreamingResult<()> {
        let _timer = ScopedTimer::traced("load_scene");
        if !self.maps.is_empty() || !self.materials.is_empty() {
            self.unload_scene(backend)?;
        }

        let mut tiled = 0;
        for source in textures {
            let binding = match self.manager.create_texture(backend, &source.desc) {
                Ok(handle) => {
                    tiled += 1;
                    let feedback = self
                        .manager
                        .texture(handle)
                        .ok_or(StreamingError::StaleTexture)?
                        .feedback_surface();
                    TextureBinding::Tiled { handle, feedback }
                }
                Err(StreamingError::Untileable { reason, .. }) => {
                    log::debug!("Texture '{}' stays fully resident: {}", source.name(), reason);
                    TextureBinding::Resident(create_resident(backend, &source)?)
                }
                Err(err) => return Err(err),
            };
            self.maps.insert(TextureRecord {
                name: source.name().to_string(),
                source,
                binding,
            });
        }

        self.materials = materials;
        self.rebuild_material_state()?;
        self.bindings.clear();
        self.camera_cut = true;

        log::info!(
            "Scene loaded: {} textures ({} tiled), {} materials, {} texture sets",
            self.maps.len(),
            tiled,
            self.materials.len(),
            self.manager.texture_sets().count()
        );
        Ok(())
    }

    /// Release every texture and forget the scene
    pub fn unload_scene(&mut self, backend: &mut dyn StreamingBackend) -> StreamingResult<()> {
        let _timer = ScopedTimer::traced("unload_scene");
        self.release_texture_sets()?;
        for record in self.maps.iter() {
            match record.binding {
                TextureBinding::Tiled { handle, .. } => self.manager.release_texture(backend, handle)?,
                TextureBinding::Resident(texture) => backend.destroy_texture(texture),
            }
        }

        self.maps.clear();
        self.queue.clear();
        self.bindings.clear();
        self.materials.clear();
        log::info!("Scene unloaded");
        Ok(())
    }

    /// Release the scene and every GPU object the pipeline owns
    pub fn shutdown(mut self, backend: &mut dyn StreamingBackend) -> StreamingResult<()> {
        self.unload_scene(backend)?;
        let fallback = *self.bindings.fallback();
        backend.destroy_texture(fallback.texture);
        self.upload.destroy(backend);
        Ok(())
    }

    /// Toggle texture-set grouping and rebuild the derived state
    pub fn set_texture_sets_enabled(&mut self, enabled: bool) -> StreamingResult<()> {
        if self.config.texture_sets_enabled == enabled {
            return Ok(());
        }
        self.config.texture_sets_enabled = enabled;
        self.release_texture_sets()?;
        self.rebuild_material_state()?;
        self.bindings.clear();
        Ok(())
    }

    /// Make the next frame inspect every texture
    pub fn request_camera_cut(&mut self) {
        self.camera_cut = true;
    }

    fn release_texture_sets(&mut self) -> StreamingResult<()> {
        let sets: Vec<_> = self.manager.texture_sets().map(|(handle, _)| handle).collect();
        for set in sets {
            self.manager.release_texture_set(set)?;
        }
        Ok(())
    }

    /// Group each material's tiled textures and derive its feedback constants
    ///
    /// The first tiled slot becomes the set primary. A rejected set leaves
    /// every tiled slot writing its own feedback.
    fn rebuild_material_state(&mut self) -> StreamingResult<()> {
        self.maps.clear_material_states();

        for material in &self.materials {
            let mut textures: SmallVec<[(MaterialSlot, TextureHandle); MaterialSlot::COUNT]> = SmallVec::new();
            for slot in MaterialSlot::ALL {
                let handle = material
                    .texture(slot)
                    .and_then(|source| self.maps.by_source(source))
                    .and_then(TextureRecord::tiled_handle);
                if let Some(handle) = handle {
                    if !textures.iter().any(|(_, h)| *h == handle) {
                        textures.push((slot, handle));
                    }
                }
            }

            let independent = MaterialFeedbackState {
                set: None,
                constants: MaterialFeedbackConstants {
                    feedback_slots: textures
                        .iter()
                        .fold(FeedbackSlots::empty(), |slots, (slot, _)| slots | slot.flag()),
                    primary_slot: None,
                },
            };

            let state = match textures.split_first() {
                Some((&(primary_slot, primary), followers))
                    if self.config.texture_sets_enabled && !followers.is_empty() =>
                {
                    let followers: SmallVec<[TextureHandle; 4]> = followers.iter().map(|(_, h)| *h).collect();
                    match self.manager.create_texture_set(primary, &followers) {
                        Ok(set) => MaterialFeedbackState {
                            set: Some(set),
                            constants: MaterialFeedbackConstants {
                                feedback_slots: primary_slot.flag(),
                                primary_slot: Some(primary_slot),
                            },
                        },
                        Err(StreamingError::SetAdmission(reason)) => {
                            log::warn!("Texture set for '{}' rejected: {}", material.name, reason);
                            independent
                        }
                        Err(err) => return Err(err),
                    }
                }
                _ => independent,
            };
            self.maps.set_material_state(material.id, state);
        }
        Ok(())
    }

    /// Bindings of a loaded material
    pub fn material_bindings(&self, material: MaterialId) -> Option<Arc<MaterialBindings>> {
        let material = self.materials.iter().find(|m| m.id == material)?;
        Some(self.bindings.get_or_create(material, &self.maps, &self.manager))
    }

    /// Constants for this frame's feedback-writing passes
    pub fn feedback_pass_constants(&self, frame_index: u64) -> FeedbackPassConstants {
        self.config.pass_constants(frame_index)
    }

    /// Collect feedback, map tiles and upload their data
    pub fn before_render(
        &mut self,
        backend: &mut dyn StreamingBackend,
        frame_index: u64,
    ) -> StreamingResult<FrameUploads> {
        let update = self
            .config
            .update_config(frame_index, std::mem::take(&mut self.camera_cut));
        let requested = self.manager.begin_frame(backend, &update)?;

        let manager = &self.manager;
        self.queue
            .ingest(&requested, |texture, tile| manager.is_tile_packed(texture, tile));

        self.upload.begin_frame(frame_index);
        let scheduled = self.queue.schedule(
            self.config.tiles_per_frame,
            self.upload.remaining(),
            |tile| manager.tile_state(tile.texture, tile.tile_index) == Some(TileState::Requested),
        );
        let outcome = match self.manager.update_tile_mappings(backend, &scheduled.all()) {
            Ok(outcome) => outcome,
            Err(err) => {
                let manager = &self.manager;
                let unmapped: Vec<RequestedTile> = scheduled
                    .all()
                    .into_iter()
                    .filter(|t| manager.tile_state(t.texture, t.tile_index) == Some(TileState::Requested))
                    .collect();
                self.queue
                    .requeue_front(&unmapped, |texture, tile| manager.is_tile_packed(texture, tile));
                return Err(err);
            }
        };

        let manager = &self.manager;
        self.queue
            .requeue_front(&outcome.deferred, |texture, tile| manager.is_tile_packed(texture, tile));

        let mut uploads = self.upload_tiles(backend, &outcome.mapped)?;
        uploads.tiles_requested = requested.num_tiles();
        uploads.deferred = outcome.deferred.len();
        uploads.queued = self.queue.len();
        Ok(uploads)
    }

    fn upload_tiles(
        &mut self,
        backend: &mut dyn StreamingBackend,
        mapped: &[RequestedTile],
    ) -> StreamingResult<FrameUploads> {
        let mut uploads = FrameUploads::default();
        if mapped.is_empty() {
            return Ok(uploads);
        }

        let mut touched: Vec<TextureId> = Vec::new();
        for tile in mapped {
            if let Some(texture) = self.manager.texture(tile.texture) {
                if !touched.contains(&texture.reserved_texture()) {
                    touched.push(texture.reserved_texture());
                }
            }
        }
        for &texture in &touched {
            backend.require_texture_state(texture, ResourceState::CopyDest);
        }
        backend.commit_barriers();

        // Tiles are uploaded independently; the first error is returned
        // after every state change below has been made
        let mut packed_results: AHashMap<TextureHandle, bool> = AHashMap::new();
        let mut not_uploaded = Vec::new();
        let mut first_error = None;
        for &tile in mapped {
            let (Some(texture), Some(record)) =
                (self.manager.texture(tile.texture), self.maps.by_texture(tile.texture))
            else {
                continue;
            };
            let source = &record.source;

            let result = if texture.is_tile_packed(tile.tile_index) {
                match packed_results.get(&tile.texture) {
                    Some(&uploaded) => Ok(uploaded),
                    None => {
                        let result = self
                            .upload
                            .upload_packed_mips(backend, texture, |mip| source.mip(mip))
                            .map(|()| true);
                        packed_results.insert(tile.texture, result.is_ok());
                        if result.is_ok() {
                            uploads.packed_textures += 1;
                        }
                        result
                    }
                }
            } else {
                let result = upload_regular_tile(&mut self.upload, backend, texture, source, tile.tile_index);
                if matches!(result, Ok(true)) {
                    uploads.regular_tiles += 1;
                }
                result
            };

            match result {
                Ok(true) => {}
                Ok(false) => not_uploaded.push(tile),
                Err(err) => {
                    log::warn!(
                        "Upload of tile {} of '{}' failed: {}",
                        tile.tile_index,
                        texture.name(),
                        err
                    );
                    first_error.get_or_insert(err);
                    not_uploaded.push(tile);
                }
            }
        }

        for &texture in &touched {
            backend.require_texture_state(texture, ResourceState::ShaderResource);
        }
        backend.commit_barriers();

        if !not_uploaded.is_empty() {
            log::warn!("{} mapped tiles not uploaded, reissued", not_uploaded.len());
            self.manager.reissue_tiles(backend, &not_uploaded);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(uploads),
        }
    }

    /// Resolve this frame's feedback and close the frame
    pub fn after_render(&mut self, backend: &mut dyn StreamingBackend) -> FeedbackStats {
        self.manager.resolve_feedback(backend);
        self.manager.end_frame();
        self.manager.stats()
    }
}

/// Stage every subresource region of one regular tile
///
/// Returns `false` when the staging buffer is full.
fn upload_regular_tile(
    upload: &mut TileUploadStage,
    backend: &mut dyn StreamingBackend,
    texture: &TiledTexture,
    source: &SourceTexture,
    tile_index: u32,
) -> StreamingResult<bool> {
    let mut staged = true;
    for info in texture.tile_info(tile_index)? {
        let data = source.mip(info.mip).ok_or_else(|| StreamingError::SourceDataTooSmall {
            name: source.name().to_string(),
            mip: info.mip,
        })?;
        staged &= upload.upload_tile(backend, texture, &info, data)?;
    }
    Ok(staged)
}

/// Create a fully resident texture and write every mip
fn create_resident(backend: &mut dyn StreamingBackend, source: &SourceTexture) -> StreamingResult<TextureId> {
    let texture = backend.create_texture(&source.desc)?;
    for mip in 0..source.desc.mip_levels {
        if let Some(data) = source.mip(mip) {
            backend.write_subresource(texture, mip, data.data, data.row_pitch)?;
        }
    }
    Ok(texture)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBackend;
    use crate::tiling::TileShape;
    use tessera_core::ManualClock;
    use wgpu::TextureFormat;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn source(id: u64, name: &str, size: u32, mips: u32) -> Arc<SourceTexture> {
        let desc = TextureDesc::new_2d(name, TextureFormat::Bc7RgbaUnorm, size, size, mips);
        Arc::new(SourceTexture::filled(SourceTextureId(id), desc, id as u8))
    }

    fn pipeline(config: StreamingConfig) -> (StreamingPipeline, HeadlessBackend, Arc<ManualClock>) {
        init_logging();
        let mut backend = HeadlessBackend::with_tile_shape(TileShape::new(64, 64));
        let clock = Arc::new(ManualClock::new());
        let pipeline = StreamingPipeline::with_clock(&mut backend, config, clock.clone()).unwrap();
        (pipeline, backend, clock)
    }

    fn small_config() -> StreamingConfig {
        StreamingConfig {
            frames_in_flight: 1,
            staging_capacity_tiles: 16,
            ..Default::default()
        }
    }

    fn feedback_of(pipeline: &StreamingPipeline, name: &str) -> crate::backend::FeedbackSurfaceId {
        let handle = pipeline.tiled_texture(name).unwrap();
        pipeline.manager().texture(handle).unwrap().feedback_surface()
    }

    #[test]
    fn test_large_texture_tiling() {
        let (mut pipeline, mut backend, _) = pipeline(small_config());
        pipeline
            .load_scene(&mut backend, vec![source(1, "terrain", 2048, 10)], Vec::new())
            .unwrap();

        let handle = pipeline.tiled_texture("terrain").unwrap();
        let texture = pipeline.manager().texture(handle).unwrap();
        let tiling = texture.tiling();
        assert_eq!(tiling.mip_grid(0).map(|g| g.x * g.y), Some(1024));
        assert_eq!(tiling.num_regular_tiles(), 1365);
        assert!(tiling.packed.num_tiles_for_packed_mips > 0);

        assert!(!texture.is_tile_packed(0));
        assert!(!texture.is_tile_packed(1364));
        assert!(texture.is_tile_packed(1365));
        assert!((1365..texture.num_tiles()).all(|t| texture.is_tile_packed(t)));
    }

    #[test]
    fn test_rejected_set_falls_back_to_independent_binding() {
        let (mut pipeline, mut backend, _) = pipeline(StreamingConfig {
            texture_sets_enabled: true,
            ..small_config()
        });
        let material = Material::new(MaterialId(1), "cliff")
            .with_texture(MaterialSlot::Diffuse, SourceTextureId(1))
            .with_texture(MaterialSlot::Normal, SourceTextureId(2));
        pipeline
            .load_scene(
                &mut backend,
                vec![source(1, "cliff_d", 1024, 10), source(2, "cliff_n", 2048, 11)],
                vec![material],
            )
            .unwrap();

        assert_eq!(pipeline.manager().texture_sets().count(), 0);
        assert_eq!(pipeline.manager().readback_ring().len(), 2);

        let bindings = pipeline.material_bindings(MaterialId(1)).unwrap();
        assert_eq!(bindings.constants.primary_slot, None);
        assert_eq!(
            bindings.constants.feedback_slots,
            FeedbackSlots::DIFFUSE | FeedbackSlots::NORMAL
        );
        let diffuse = bindings.slot(MaterialSlot::Diffuse);
        let normal = bindings.slot(MaterialSlot::Normal);
        assert!(diffuse.tiled && normal.tiled);
        assert_eq!(diffuse.feedback, feedback_of(&pipeline, "cliff_d"));
        assert_eq!(normal.feedback, feedback_of(&pipeline, "cliff_n"));
    }

    #[test]
    fn test_accepted_set_and_toggle() {
        let (mut pipeline, mut backend, _) = pipeline(StreamingConfig {
            texture_sets_enabled: true,
            ..small_config()
        });
        let material = Material::new(MaterialId(1), "brick")
            .with_texture(MaterialSlot::Diffuse, SourceTextureId(1))
            .with_texture(MaterialSlot::Normal, SourceTextureId(2));
        pipeline
            .load_scene(
                &mut backend,
                vec![source(1, "brick_d", 1024, 10), source(2, "brick_n", 512, 9)],
                vec![material],
            )
            .unwrap();

        let bindings = pipeline.material_bindings(MaterialId(1)).unwrap();
        assert_eq!(bindings.constants.primary_slot, Some(MaterialSlot::Diffuse));
        assert_eq!(bindings.constants.feedback_slots, FeedbackSlots::DIFFUSE);
        assert_eq!(pipeline.manager().texture_sets().count(), 1);
        assert_eq!(pipeline.manager().readback_ring().len(), 1);

        pipeline.set_texture_sets_enabled(false).unwrap();
        assert_eq!(pipeline.manager().texture_sets().count(), 0);
        assert!(pipeline.binding_cache().is_empty());
        let bindings = pipeline.material_bindings(MaterialId(1)).unwrap();
        assert_eq!(bindings.constants.primary_slot, None);
        assert_eq!(
            bindings.constants.feedback_slots,
            FeedbackSlots::DIFFUSE | FeedbackSlots::NORMAL
        );
    }

    #[test]
    fn test_untileable_texture_is_resident_and_bound_directly() {
        let (mut pipeline, mut backend, _) = pipeline(small_config());
        let desc = TextureDesc::new_2d("lut", TextureFormat::Rgba8Unorm, 64, 64, 7);
        let lut = Arc::new(SourceTexture::filled(SourceTextureId(5), desc, 1));
        let material = Material::new(MaterialId(2), "glass")
            .with_texture(MaterialSlot::Diffuse, SourceTextureId(5))
            .with_texture(MaterialSlot::Emissive, SourceTextureId(99));
        let writes_before = backend.subresource_writes();
        pipeline.load_scene(&mut backend, vec![lut], vec![material]).unwrap();

        assert_eq!(backend.subresource_writes() - writes_before, 7);
        assert!(pipeline.tiled_texture("lut").is_none());

        let bindings = pipeline.material_bindings(MaterialId(2)).unwrap();
        let fallback = *pipeline.binding_cache().fallback();
        let diffuse = bindings.slot(MaterialSlot::Diffuse);
        assert!(!diffuse.tiled);
        assert_ne!(diffuse.texture, fallback.texture);
        assert_eq!(diffuse.feedback, fallback.feedback);
        assert_eq!(diffuse.min_mip, fallback.texture);

        // Unknown and empty slots bind the fallback texture
        assert_eq!(bindings.slot(MaterialSlot::Emissive).texture, fallback.texture);
        assert_eq!(bindings.slot(MaterialSlot::Normal).texture, fallback.texture);
        assert_eq!(bindings.min_mip_sampler, fallback.min_mip_sampler);
    }

    #[test]
    fn test_bindings_are_memoized_until_unload() {
        let (mut pipeline, mut backend, _) = pipeline(small_config());
        let material = Material::new(MaterialId(1), "rock").with_texture(MaterialSlot::Diffuse, SourceTextureId(1));
        pipeline
            .load_scene(&mut backend, vec![source(1, "rock", 256, 9)], vec![material])
            .unwrap();

        let first = pipeline.material_bindings(MaterialId(1)).unwrap();
        let second = pipeline.material_bindings(MaterialId(1)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pipeline.binding_cache().build_count(), 1);
        assert!(pipeline.material_bindings(MaterialId(9)).is_none());

        pipeline.unload_scene(&mut backend).unwrap();
        assert!(pipeline.binding_cache().is_empty());
        assert!(pipeline.material_bindings(MaterialId(1)).is_none());
        assert_eq!(pipeline.manager().num_textures(), 0);
        assert_eq!(backend.live_heaps(), 0);
    }

    #[test]
    fn test_upload_budget_drains_queue_in_order() {
        let (mut pipeline, mut backend, _) = pipeline(StreamingConfig {
            tiles_per_frame: 8,
            ..small_config()
        });
        pipeline
            .load_scene(&mut backend, vec![source(1, "ground", 512, 10)], Vec::new())
            .unwrap();
        let feedback = feedback_of(&pipeline, "ground");

        pipeline.before_render(&mut backend, 0).unwrap();
        backend.sample_all(feedback, 0);
        pipeline.after_render(&mut backend);

        // 64 + 16 + 4 + 1 regular tiles and the packed tail
        let uploads = pipeline.before_render(&mut backend, 1).unwrap();
        assert_eq!(uploads.tiles_requested, 86);
        assert_eq!(uploads.packed_textures, 1);
        assert_eq!(uploads.regular_tiles, 8);
        assert_eq!(uploads.queued, 77);
        assert_eq!(backend.tile_copies().len(), 8);
        backend.sample_all(feedback, 0);
        let stats = pipeline.after_render(&mut backend);
        assert_eq!(stats.tiles_allocated, 9);
        assert_eq!(stats.tiles_requested, 77);

        let uploads = pipeline.before_render(&mut backend, 2).unwrap();
        assert_eq!(uploads.regular_tiles, 8);
        assert_eq!(uploads.packed_textures, 0);
        assert_eq!(uploads.queued, 69);
        // FIFO order continues with the second row of mip 0
        let next = backend.tile_copies()[8].region.dest;
        assert_eq!((next.mip, next.x, next.y), (0, 0, 64));

        let stats = pipeline.after_render(&mut backend);
        assert!(stats.tiles_allocated <= stats.heap_tiles_capacity);
        assert!(stats.tiles_allocated + stats.tiles_idle + stats.tiles_standby <= stats.tiles_total);
    }

    #[test]
    fn test_camera_cut_inspects_every_texture() {
        let (mut pipeline, mut backend, _) = pipeline(StreamingConfig {
            max_textures_per_frame: 1,
            ..small_config()
        });
        pipeline
            .load_scene(
                &mut backend,
                vec![source(1, "a", 256, 9), source(2, "b", 256, 9), source(3, "c", 256, 9)],
                Vec::new(),
            )
            .unwrap();

        pipeline.before_render(&mut backend, 0).unwrap();
        pipeline.after_render(&mut backend);
        assert_eq!(backend.feedback_clears(), 3);

        pipeline.before_render(&mut backend, 1).unwrap();
        pipeline.after_render(&mut backend);
        assert_eq!(backend.feedback_clears(), 4);

        pipeline.request_camera_cut();
        pipeline.before_render(&mut backend, 2).unwrap();
        assert_eq!(backend.feedback_clears(), 7);
    }

    #[test]
    fn test_packed_upload_writes_source_bytes() {
        let (mut pipeline, mut backend, _) = pipeline(small_config());
        pipeline
            .load_scene(&mut backend, vec![source(4, "rock", 256, 9)], Vec::new())
            .unwrap();

        pipeline.before_render(&mut backend, 0).unwrap();
        pipeline.after_render(&mut backend);
        let uploads = pipeline.before_render(&mut backend, 1).unwrap();
        assert_eq!(uploads.packed_textures, 1);
        assert_eq!(uploads.regular_tiles, 0);

        let handle = pipeline.tiled_texture("rock").unwrap();
        let reserved = pipeline.manager().texture(handle).unwrap().reserved_texture();
        let data = backend.subresource_data(reserved, 3).unwrap();
        assert_eq!(data.len(), 8 * 8 * 16);
        assert!(data.iter().all(|&b| b == 4));
        assert_eq!(backend.texture_state(reserved), Some(ResourceState::ShaderResource));
    }

    #[test]
    fn test_failed_upload_restores_state_and_reissues_tile() {
        let (mut pipeline, mut backend, _) = pipeline(small_config());
        let desc = TextureDesc::new_2d("bad", TextureFormat::Bc7RgbaUnorm, 256, 256, 9);
        let mut bad = SourceTexture::filled(SourceTextureId(2), desc, 2);
        bad.mips[2] = MipData {
            data: vec![0; 64],
            row_pitch: 256,
        };
        pipeline
            .load_scene(&mut backend, vec![source(1, "good", 256, 9), Arc::new(bad)], Vec::new())
            .unwrap();
        let good = pipeline.tiled_texture("good").unwrap();
        let bad = pipeline.tiled_texture("bad").unwrap();
        let (good_feedback, bad_feedback) = (feedback_of(&pipeline, "good"), feedback_of(&pipeline, "bad"));
        let texture = |handle: TextureHandle| pipeline.manager().texture(handle).unwrap();
        let (good_reserved, bad_reserved) = (texture(good).reserved_texture(), texture(bad).reserved_texture());
        let bad_min_mip = texture(bad).min_mip_texture();
        let good_min_mip = texture(good).min_mip_texture();

        pipeline.before_render(&mut backend, 0).unwrap();
        backend.sample_all(good_feedback, 2);
        backend.sample_all(bad_feedback, 2);
        pipeline.after_render(&mut backend);

        // Tile 20 holds mip 2, which the bad source cannot fill
        let result = pipeline.before_render(&mut backend, 1);
        assert!(matches!(result, Err(StreamingError::SourceDataTooSmall { mip: 2, .. })));
        assert_eq!(backend.tile_copies().len(), 1);
        assert_eq!(backend.tile_copies()[0].texture, good_reserved);
        assert_eq!(backend.texture_state(good_reserved), Some(ResourceState::ShaderResource));
        assert_eq!(backend.texture_state(bad_reserved), Some(ResourceState::ShaderResource));

        assert_eq!(pipeline.manager().tile_state(good, 20), Some(TileState::Active));
        assert_eq!(pipeline.manager().tile_state(bad, 20), Some(TileState::Requested));
        assert_eq!(pipeline.manager().tile_state(bad, 21), Some(TileState::Active));
        assert_eq!(backend.min_mip_values(good_min_mip).unwrap(), vec![2.0; 16]);
        assert_eq!(backend.min_mip_values(bad_min_mip).unwrap(), vec![3.0; 16]);

        backend.sample_all(good_feedback, 2);
        backend.sample_all(bad_feedback, 2);
        pipeline.after_render(&mut backend);

        // The tile is reported and scheduled again
        let result = pipeline.before_render(&mut backend, 2);
        assert!(matches!(result, Err(StreamingError::SourceDataTooSmall { mip: 2, .. })));
        assert_eq!(backend.tile_copies().len(), 1);
        assert_eq!(pipeline.manager().tile_state(bad, 20), Some(TileState::Requested));
    }

    #[test]
    fn test_tiles_wait_for_failed_heap() {
        let (mut pipeline, mut backend, _) = pipeline(small_config());
        pipeline
            .load_scene(&mut backend, vec![source(1, "rock", 256, 9)], Vec::new())
            .unwrap();
        let feedback = feedback_of(&pipeline, "rock");
        let handle = pipeline.tiled_texture("rock").unwrap();
        let reserved = pipeline.manager().texture(handle).unwrap().reserved_texture();

        pipeline.before_render(&mut backend, 0).unwrap();
        backend.sample_all(feedback, 2);
        pipeline.after_render(&mut backend);

        backend.fail_heap_creations(1);
        let uploads = pipeline.before_render(&mut backend, 1).unwrap();
        assert_eq!(uploads.tiles_requested, 2);
        assert_eq!(uploads.deferred, 2);
        assert_eq!(uploads.queued, 2);
        assert_eq!(uploads.packed_textures + uploads.regular_tiles, 0);
        assert!(backend.bound_tiles(reserved).is_empty());
        assert_eq!(pipeline.manager().tile_state(handle, 20), Some(TileState::Requested));
        backend.sample_all(feedback, 2);
        pipeline.after_render(&mut backend);

        let uploads = pipeline.before_render(&mut backend, 2).unwrap();
        assert_eq!(uploads.packed_textures, 1);
        assert_eq!(uploads.regular_tiles, 1);
        assert_eq!(uploads.queued, 0);
        assert_eq!(backend.bound_tiles(reserved), vec![20, 21]);
        assert_eq!(pipeline.manager().tile_state(handle, 20), Some(TileState::Active));
    }

    #[test]
    fn test_tile_accounting_under_heap_limit() {
        let (mut pipeline, mut backend, clock) = pipeline(StreamingConfig {
            heap_size_in_tiles: 8,
            max_heaps: 2,
            ..small_config()
        });
        let sources = (0..4).map(|id| source(id, &format!("t{id}"), 256, 9)).collect();
        pipeline.load_scene(&mut backend, sources, Vec::new()).unwrap();
        let textures: Vec<_> = (0..4)
            .map(|id| {
                let handle = pipeline.tiled_texture(&format!("t{id}")).unwrap();
                let texture = pipeline.manager().texture(handle).unwrap();
                (handle, texture.feedback_surface(), texture.reserved_texture())
            })
            .collect();

        let mut deferred = 0;
        for frame in 0..16u64 {
            let uploads = pipeline.before_render(&mut backend, frame).unwrap();
            deferred += uploads.deferred;

            // Two textures are in view at a time, each needing 22 tiles
            for (_, feedback, _) in textures.iter().cycle().skip(frame as usize / 2 % 4).take(2) {
                backend.sample_all(*feedback, 0);
            }
            let stats = pipeline.after_render(&mut backend);
            clock.advance_secs(0.5);

            assert!(stats.heap_tiles_capacity <= 16);
            assert!(stats.tiles_mapped() <= stats.heap_tiles_capacity);
            assert!(stats.tiles_mapped() + stats.tiles_requested <= stats.tiles_total);
            assert!(stats.tiles_mapped() <= stats.heap_tiles_capacity - stats.heap_tiles_free);
            for &(handle, _, reserved) in &textures {
                for tile in 0..22 {
                    let state = pipeline.manager().tile_state(handle, tile).unwrap();
                    assert!(!state.is_resident() || backend.is_tile_bound(reserved, tile));
                }
            }
        }
        assert!(deferred > 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut backend = HeadlessBackend::new();
        let config = StreamingConfig {
            frames_in_flight: 0,
            ..Default::default()
        };
        assert!(matches!(
            StreamingPipeline::new(&mut backend, config),
            Err(StreamingError::InvalidConfig(_))
        ));
    }
}
