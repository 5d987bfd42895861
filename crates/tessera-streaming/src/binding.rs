//! Material Binding Cache
//!
//! Resolves a material's texture slots into the GPU objects shaders bind:
//! texture, feedback surface and min-mip texture per slot. Untiled textures
//! bind directly; slots with no tiled companions bind the fallback resources
//! so the binding layout stays valid.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use bitflags::bitflags;
use parking_lot::Mutex;

use crate::backend::{FallbackResources, FeedbackSurfaceId, SamplerId, TextureId};
use crate::manager::FeedbackManager;
use crate::maps::{FeedbackTextureMaps, TextureBinding};
use crate::pipeline::SourceTextureId;

/// Material identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(pub u32);

impl fmt::Display for MaterialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "material#{}", self.0)
    }
}

/// Texture slot of a material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaterialSlot {
    Diffuse,
    Specular,
    Normal,
    Emissive,
    Occlusion,
    Transmission,
}

impl MaterialSlot {
    pub const COUNT: usize = 6;

    /// Every slot in binding order
    pub const ALL: [MaterialSlot; Self::COUNT] = [
        MaterialSlot::Diffuse,
        MaterialSlot::Specular,
        MaterialSlot::Normal,
        MaterialSlot::Emissive,
        MaterialSlot::Occlusion,
        MaterialSlot::Transmission,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn flag(self) -> FeedbackSlots {
        FeedbackSlots::from_bits_truncate(1 << self.index())
    }
}

bitflags! {
    /// Material slots whose shaders write sampler feedback
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FeedbackSlots: u32 {
        const DIFFUSE = 1 << 0;
        const SPECULAR = 1 << 1;
        const NORMAL = 1 << 2;
        const EMISSIVE = 1 << 3;
        const OCCLUSION = 1 << 4;
        const TRANSMISSION = 1 << 5;
    }
}

/// Material as loaded from the scene
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub id: MaterialId,
    pub name: String,
    pub textures: [Option<SourceTextureId>; MaterialSlot::COUNT],
}

impl Material {
    pub fn new(id: MaterialId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            textures: [None; MaterialSlot::COUNT],
        }
    }

    /// Builder-style slot assignment
    pub fn with_texture(mut self, slot: MaterialSlot, texture: SourceTextureId) -> Self {
        self.textures[slot.index()] = Some(texture);
        self
    }

    pub fn texture(&self, slot: MaterialSlot) -> Option<SourceTextureId> {
        self.textures[slot.index()]
    }
}

/// Per-material feedback control constants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaterialFeedbackConstants {
    pub feedback_slots: FeedbackSlots,
    /// Slot of the texture-set primary, if the material uses a set
    pub primary_slot: Option<MaterialSlot>,
}

impl MaterialFeedbackConstants {
    /// Shader-side primary slot index (`u32::MAX` without a set)
    pub fn primary_slot_index(&self) -> u32 {
        self.primary_slot.map_or(u32::MAX, |slot| slot.index() as u32)
    }
}

/// GPU objects bound for one material slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotBinding {
    pub texture: TextureId,
    pub feedback: FeedbackSurfaceId,
    pub min_mip: TextureId,
    /// Whether the slot is backed by a tiled texture
    pub tiled: bool,
}

/// Resolved bindings of one material
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialBindings {
    pub material: MaterialId,
    pub slots: [SlotBinding; MaterialSlot::COUNT],
    pub constants: MaterialFeedbackConstants,
    pub min_mip_sampler: SamplerId,
}

impl MaterialBindings {
    pub fn slot(&self, slot: MaterialSlot) -> &SlotBinding {
        &self.slots[slot.index()]
    }
}

/// Memoized material bindings
///
/// Built at most once per material until [`clear`](Self::clear).
#[derive(Debug)]
pub struct MaterialBindingCache {
    fallback: FallbackResources,
    bindings: Mutex<AHashMap<MaterialId, Arc<MaterialBindings>>>,
    builds: AtomicU64,
}

impl MaterialBindingCache {
    pub fn new(fallback: FallbackResources) -> Self {
        Self {
            fallback,
            bindings: Mutex::new(AHashMap::new()),
            builds: AtomicU64::new(0),
        }
    }

    pub fn fallback(&self) -> &FallbackResources {
        &self.fallback
    }

    /// Get the bindings of a material, building them on first use
    pub fn get_or_create(
        &self,
        material: &Material,
        maps: &FeedbackTextureMaps,
        manager: &FeedbackManager,
    ) -> Arc<MaterialBindings> {
        let mut bindings = self.bindings.lock();
        if let Some(existing) = bindings.get(&material.id) {
            return existing.clone();
        }

        let created = Arc::new(self.build(material, maps, manager));
        bindings.insert(material.id, created.clone());
        self.builds.fetch_add(1, Ordering::Relaxed);
        created
    }

    /// Drop every memoized binding
    pub fn clear(&self) {
        self.bindings.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.bindings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.lock().is_empty()
    }

    /// Bindings built since creation
    pub fn build_count(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    fn build(
        &self,
        material: &Material,
        maps: &FeedbackTextureMaps,
        manager: &FeedbackManager,
    ) -> MaterialBindings {
        let slots = MaterialSlot::ALL.map(|slot| {
            material
                .texture(slot)
                .and_then(|source| maps.by_source(source))
                .and_then(|record| self.slot_binding(&record.binding, manager))
                .unwrap_or(SlotBinding {
                    texture: self.fallback.texture,
                    feedback: self.fallback.feedback,
                    min_mip: self.fallback.texture,
                    tiled: false,
                })
        });

        log::trace!("Built bindings for {} ({})", material.id, material.name);
        MaterialBindings {
            material: material.id,
            slots,
            constants: maps
                .material_state(material.id)
                .map(|state| state.constants)
                .unwrap_or_default(),
            min_mip_sampler: self.fallback.min_mip_sampler,
        }
    }

    fn slot_binding(&self, binding: &TextureBinding, manager: &FeedbackManager) -> Option<SlotBinding> {
        match *binding {
            TextureBinding::Resident(texture) => Some(SlotBinding {
                texture,
                feedback: self.fallback.feedback,
                min_mip: self.fallback.texture,
                tiled: false,
            }),
            TextureBinding::Tiled { handle, .. } => {
                let texture = manager.texture(handle)?;
                Some(SlotBinding {
                    texture: texture.reserved_texture(),
                    feedback: texture.feedback_surface(),
                    min_mip: texture.min_mip_texture(),
                    tiled: true,
                })
            }
        }
    }
}
