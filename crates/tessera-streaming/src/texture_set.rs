//! Texture Sets
//!
//! Groups of textures sharing one coordinate space, e.g. the diffuse, normal
//! and roughness maps of a material. Feedback is read back only for the
//! primary; followers mirror its residency requirements.

use std::fmt;

use smallvec::SmallVec;
use tessera_core::Handle;
use thiserror::Error;

use crate::texture::TextureHandle;
use crate::tiling::TextureDesc;

/// Handle to a texture set owned by the feedback manager
pub type TextureSetHandle = Handle<TextureSet>;

/// Dimension compared during admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetDimension {
    Width,
    Height,
    MipLevels,
}

impl fmt::Display for SetDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetDimension::Width => "width",
            SetDimension::Height => "height",
            SetDimension::MipLevels => "mip count",
        };
        f.write_str(name)
    }
}

/// Reasons a candidate set is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("follower '{follower}' {dimension} {follower_value} exceeds primary '{primary}' ({primary_value})")]
    FollowerExceedsPrimary {
        primary: String,
        follower: String,
        dimension: SetDimension,
        primary_value: u32,
        follower_value: u32,
    },

    #[error("texture '{0}' appears more than once in the set")]
    DuplicateTexture(String),
}

/// Primary texture plus followers driven by its feedback
#[derive(Debug, Clone, PartialEq)]
pub struct TextureSet {
    primary: TextureHandle,
    followers: SmallVec<[TextureHandle; 4]>,
    /// Mip offset of each follower relative to the primary
    mip_offsets: SmallVec<[u32; 4]>,
}

impl TextureSet {
    pub(crate) fn new(
        primary: TextureHandle,
        followers: SmallVec<[TextureHandle; 4]>,
        mip_offsets: SmallVec<[u32; 4]>,
    ) -> Self {
        Self {
            primary,
            followers,
            mip_offsets,
        }
    }

    pub fn primary(&self) -> TextureHandle {
        self.primary
    }

    pub fn followers(&self) -> &[TextureHandle] {
        &self.followers
    }

    /// Followers paired with their mip offsets
    pub fn followers_with_offsets(&self) -> impl Iterator<Item = (TextureHandle, u32)> + '_ {
        self.followers.iter().copied().zip(self.mip_offsets.iter().copied())
    }

    /// All textures, primary first
    pub fn textures(&self) -> impl Iterator<Item = TextureHandle> + '_ {
        std::iter::once(self.primary).chain(self.followers.iter().copied())
    }

    pub fn contains(&self, texture: TextureHandle) -> bool {
        self.textures().any(|t| t == texture)
    }

    pub(crate) fn remove_follower(&mut self, texture: TextureHandle) -> bool {
        match self.followers.iter().position(|&f| f == texture) {
            Some(index) => {
                self.followers.remove(index);
                self.mip_offsets.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Validate a candidate set
///
/// The whole set is rejected if any follower is wider, taller or has more
/// mips than the primary, or if a texture appears twice.
pub fn check_admission(primary: &TextureDesc, followers: &[&TextureDesc]) -> Result<(), AdmissionError> {
    for (index, follower) in followers.iter().enumerate() {
        if follower.name == primary.name || followers[..index].iter().any(|f| f.name == follower.name) {
            return Err(AdmissionError::DuplicateTexture(follower.name.clone()));
        }

        let checks = [
            (SetDimension::Width, primary.width, follower.width),
            (SetDimension::Height, primary.height, follower.height),
            (SetDimension::MipLevels, primary.mip_levels, follower.mip_levels),
        ];
        for (dimension, primary_value, follower_value) in checks {
            if follower_value > primary_value {
                return Err(AdmissionError::FollowerExceedsPrimary {
                    primary: primary.name.clone(),
                    follower: follower.name.clone(),
                    dimension,
                    primary_value,
                    follower_value,
                });
            }
        }
    }
    Ok(())
}

/// Mip levels between the primary and a smaller follower
pub fn mip_offset(primary: &TextureDesc, follower: &TextureDesc) -> u32 {
    (primary.width / follower.width.max(1)).max(1).ilog2()
}
