//! Feedback Texture Maps
//!
//! Scene-lifetime table of texture records keyed by name. Lookups by
//! feedback surface, source texture and tiled handle are derived indices
//! rebuilt from the table whenever it changes.

use std::sync::Arc;

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::backend::{FeedbackSurfaceId, TextureId};
use crate::binding::{MaterialFeedbackConstants, MaterialId};
use crate::pipeline::{SourceTexture, SourceTextureId};
use crate::texture::TextureHandle;
use crate::texture_set::TextureSetHandle;

/// How a source texture is bound on the GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureBinding {
    /// Streamed through a reserved texture
    Tiled {
        handle: TextureHandle,
        feedback: FeedbackSurfaceId,
    },
    /// Fully resident texture
    Resident(TextureId),
}

/// One loaded texture
#[derive(Debug, Clone)]
pub struct TextureRecord {
    pub name: String,
    pub source: Arc<SourceTexture>,
    pub binding: TextureBinding,
}

impl TextureRecord {
    pub fn tiled_handle(&self) -> Option<TextureHandle> {
        match self.binding {
            TextureBinding::Tiled { handle, .. } => Some(handle),
            TextureBinding::Resident(_) => None,
        }
    }
}

/// Derived per-material feedback state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaterialFeedbackState {
    pub set: Option<TextureSetHandle>,
    pub constants: MaterialFeedbackConstants,
}

/// Texture records and their lookups
#[derive(Debug, Default)]
pub struct FeedbackTextureMaps {
    records: IndexMap<String, TextureRecord>,
    by_feedback: AHashMap<FeedbackSurfaceId, usize>,
    by_source: AHashMap<SourceTextureId, usize>,
    by_texture: AHashMap<TextureHandle, usize>,
    materials: AHashMap<MaterialId, MaterialFeedbackState>,
}

impl FeedbackTextureMaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record by name
    pub fn insert(&mut self, record: TextureRecord) {
        self.records.insert(record.name.clone(), record);
        self.rebuild_indices();
    }

    pub fn remove(&mut self, name: &str) -> Option<TextureRecord> {
        let removed = self.records.shift_remove(name);
        if removed.is_some() {
            self.rebuild_indices();
        }
        removed
    }

    fn rebuild_indices(&mut self) {
        self.by_feedback.clear();
        self.by_source.clear();
        self.by_texture.clear();
        for (index, record) in self.records.values().enumerate() {
            self.by_source.insert(record.source.id, index);
            if let TextureBinding::Tiled { handle, feedback } = record.binding {
                self.by_feedback.insert(feedback, index);
                self.by_texture.insert(handle, index);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&TextureRecord> {
        self.records.get(name)
    }

    pub fn by_feedback_surface(&self, feedback: FeedbackSurfaceId) -> Option<&TextureRecord> {
        self.record_at(self.by_feedback.get(&feedback))
    }

    pub fn by_source(&self, source: SourceTextureId) -> Option<&TextureRecord> {
        self.record_at(self.by_source.get(&source))
    }

    pub fn by_texture(&self, texture: TextureHandle) -> Option<&TextureRecord> {
        self.record_at(self.by_texture.get(&texture))
    }

    fn record_at(&self, index: Option<&usize>) -> Option<&TextureRecord> {
        self.records.get_index(*index?).map(|(_, record)| record)
    }

    pub fn material_state(&self, material: MaterialId) -> Option<&MaterialFeedbackState> {
        self.materials.get(&material)
    }

    pub fn set_material_state(&mut self, material: MaterialId, state: MaterialFeedbackState) {
        self.materials.insert(material, state);
    }

    pub fn clear_material_states(&mut self) {
        self.materials.clear();
    }

    /// Records in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &TextureRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record, index and material state
    pub fn clear(&mut self) {
        self.records.clear();
        self.by_feedback.clear();
        self.by_source.clear();
        self.by_texture.clear();
        self.materials.clear();
    }
}
