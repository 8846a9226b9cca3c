//! On-disk texture cache.
//!
//! Tracks every texture referenced by source materials, where its file lives
//! once known, and whether decoded pixels are already at hand.

use crate::error::TextureCacheError;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a texture comes from.
///
/// Remote textures are namespaced separately from local ones, so that a user
/// file can never collide with a texture of the online service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TextureSource {
    /// Fetched from the companion online service.
    #[default]
    Remote,
    /// Supplied directly from the local filesystem.
    LocalDisk,
}

/// Identity of a texture in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureKey {
    pub id: String,
    pub source: TextureSource,
}

impl TextureKey {
    pub fn remote(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: TextureSource::Remote,
        }
    }

    pub fn local(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: TextureSource::LocalDisk,
        }
    }
}

/// Encoded format of downloaded texture bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSourceFormat {
    Jpeg,
    Png,
    Svg,
}

impl ImageSourceFormat {
    /// File extension used in the cache, or `None` for formats glTF cannot reference.
    pub fn extension(self) -> Option<&'static str> {
        match self {
            ImageSourceFormat::Jpeg => Some("jpg"),
            ImageSourceFormat::Png => Some("png"),
            ImageSourceFormat::Svg => None,
        }
    }
}

/// Extensions probed when looking for a cached remote texture.
const CACHED_EXTENSIONS: [&str; 2] = ["jpg", "png"];

#[derive(Debug, Default)]
struct TextureEntry {
    path: Option<PathBuf>,
    /// `None` until probed or written.
    available: Option<bool>,
    image: Option<Arc<RgbaImage>>,
    requires_translucency: Option<bool>,
}

impl TextureEntry {
    fn is_available(&self) -> bool {
        self.available.unwrap_or(false)
    }
}

/// Everything known about how to read one texture.
#[derive(Debug, Clone)]
pub struct TextureAccess {
    pub key: TextureKey,
    /// Local file, when available on disk.
    pub path: Option<PathBuf>,
    /// Decoded pixels, when already in memory.
    pub image: Option<Arc<RgbaImage>>,
}

/// Texture cache owned by the material registry.
#[derive(Debug, Default)]
pub struct TextureCache {
    directory: Option<PathBuf>,
    directory_valid: bool,
    entries: BTreeMap<TextureKey, TextureEntry>,
}

impl TextureCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache directory. It is validated again on next use.
    pub fn set_directory(&mut self, path: impl Into<PathBuf>) {
        self.directory = Some(path.into());
        self.directory_valid = false;
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    /// Make sure the cache directory exists, creating it on first use.
    pub fn ensure_directory(&mut self) -> Result<PathBuf, TextureCacheError> {
        let dir = self
            .directory
            .clone()
            .ok_or(TextureCacheError::DirectoryNotSet)?;
        if !self.directory_valid {
            if !dir.is_dir() {
                fs::create_dir_all(&dir).map_err(|source| TextureCacheError::CreateDirectory {
                    path: dir.clone(),
                    source,
                })?;
                debug!("created texture directory {}", dir.display());
            }
            self.directory_valid = true;
        }
        Ok(dir)
    }

    /// Register a texture of the online service. Idempotent.
    pub fn register_remote(&mut self, id: &str) -> TextureKey {
        let key = TextureKey::remote(id);
        self.entries.entry(key.clone()).or_default();
        key
    }

    pub fn contains(&self, key: &TextureKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write downloaded texture bytes to `<dir>/<id>.<ext>`.
    pub fn store_downloaded_texture(
        &mut self,
        id: &str,
        bytes: &[u8],
        width: u32,
        height: u32,
        format: Option<ImageSourceFormat>,
    ) -> Result<PathBuf, TextureCacheError> {
        if !is_file_stem(id) {
            return Err(TextureCacheError::InvalidTextureId(id.to_string()));
        }
        if bytes.is_empty() || width == 0 || height == 0 {
            return Err(TextureCacheError::EmptyTexture(id.to_string()));
        }
        let extension = format.and_then(ImageSourceFormat::extension).ok_or_else(|| {
            TextureCacheError::UnsupportedFormat {
                id: id.to_string(),
                format: format.map_or_else(|| "unknown".to_string(), |f| format!("{f:?}")),
            }
        })?;
        let dir = self.ensure_directory()?;
        let path = dir.join(format!("{id}.{extension}"));

        let entry = self.entries.entry(TextureKey::remote(id)).or_default();
        entry.requires_translucency = None;
        entry.image = None;
        match fs::write(&path, bytes) {
            Ok(()) => {
                debug!("stored texture {id} ({width}x{height}) at {}", path.display());
                entry.path = Some(path.clone());
                entry.available = Some(true);
                Ok(path)
            }
            Err(e) => {
                entry.path = None;
                entry.available = Some(false);
                Err(TextureCacheError::Write {
                    path,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Register a user texture from the filesystem and return its key.
    ///
    /// The identifier is the canonical path, so the same file reached through
    /// different relative paths maps to one entry.
    pub fn find_or_register_local_texture(&mut self, path: &Path) -> TextureKey {
        let resolved = match fs::canonicalize(path) {
            Ok(canonical) => canonical,
            Err(e) => {
                warn!("cannot canonicalize texture path {}: {e}", path.display());
                path.to_path_buf()
            }
        };
        let key = TextureKey::local(resolved.to_string_lossy().into_owned());
        self.entries.entry(key.clone()).or_insert_with(|| TextureEntry {
            available: Some(resolved.exists()),
            path: Some(resolved),
            ..Default::default()
        });
        key
    }

    /// Identifiers of remote textures that still need to be downloaded.
    ///
    /// Entries never checked before are first looked up in the cache directory.
    pub fn list_missing_remote_textures(&mut self) -> Result<Vec<String>, TextureCacheError> {
        let dir = self.ensure_directory()?;
        let mut missing = Vec::new();
        for (key, entry) in self
            .entries
            .iter_mut()
            .filter(|(key, _)| key.source == TextureSource::Remote)
        {
            if entry.available.is_none() {
                entry.path = find_in_directory(&dir, &key.id);
                entry.available = Some(entry.path.is_some());
            }
            if !entry.is_available() {
                missing.push(key.id.clone());
            }
        }
        Ok(missing)
    }

    /// Delete the whole cache directory, so every remote texture is fetched again.
    ///
    /// Synthesized textures stored in the directory are forgotten, and decoded
    /// pixels of remote textures are dropped with their files.
    pub fn flush(&mut self) -> Result<(), TextureCacheError> {
        let dir = self.ensure_directory()?;
        let canonical_dir = fs::canonicalize(&dir).ok();
        if let Err(e) = fs::remove_dir_all(&dir) {
            warn!("cannot remove texture directory {}: {e}", dir.display());
        }
        self.directory_valid = false;

        let in_directory = |path: &Path| {
            path.starts_with(&dir) || canonical_dir.as_deref().is_some_and(|c| path.starts_with(c))
        };
        self.entries.retain(|key, entry| {
            key.source == TextureSource::Remote || !entry.path.as_deref().is_some_and(|path| in_directory(path))
        });
        for (_, entry) in self
            .entries
            .iter_mut()
            .filter(|(key, _)| key.source == TextureSource::Remote)
        {
            entry.path = None;
            entry.available = None;
            entry.image = None;
            entry.requires_translucency = None;
        }
        Ok(())
    }

    /// Attach decoded pixels to a texture, registering it if needed.
    pub fn store_decoded_image(&mut self, key: &TextureKey, image: Arc<RgbaImage>) {
        self.entries.entry(key.clone()).or_default().image = Some(image);
    }

    /// Local path of an available texture.
    pub fn local_path(&self, key: &TextureKey) -> Option<&Path> {
        self.entries
            .get(key)
            .filter(|e| e.is_available())
            .and_then(|e| e.path.as_deref())
    }

    /// How to read the given texture, if it is available on disk or in memory.
    pub fn texture_access(&self, key: &TextureKey) -> Option<TextureAccess> {
        let entry = self.entries.get(key)?;
        let path = entry.path.clone().filter(|_| entry.is_available());
        if path.is_none() && entry.image.is_none() {
            return None;
        }
        Some(TextureAccess {
            key: key.clone(),
            path,
            image: entry.image.clone(),
        })
    }

    pub fn requires_translucency(&self, key: &TextureKey) -> Option<bool> {
        self.entries.get(key).and_then(|e| e.requires_translucency)
    }

    pub fn set_requires_translucency(&mut self, key: &TextureKey, value: bool) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.requires_translucency = Some(value);
        }
    }

    /// Path of a synthesized texture in the cache directory, if the file exists.
    pub fn find_synthesized(&mut self, file_name: &str) -> Option<PathBuf> {
        let path = self.ensure_directory().ok()?.join(file_name);
        path.exists().then_some(path)
    }

    /// Write a synthesized texture to the cache directory and register it as a local texture.
    pub fn store_synthesized(
        &mut self,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<TextureKey, TextureCacheError> {
        let path = self.ensure_directory()?.join(file_name);
        fs::write(&path, bytes).map_err(|e| TextureCacheError::Write {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        debug!("wrote synthesized texture {}", path.display());
        Ok(self.register_synthesized(path))
    }

    /// Register an existing synthesized file as a local texture.
    pub fn register_synthesized(&mut self, path: PathBuf) -> TextureKey {
        let key = TextureKey::local(path.to_string_lossy().into_owned());
        let entry = self.entries.entry(key.clone()).or_default();
        entry.path = Some(path);
        entry.available = Some(true);
        key
    }
}

/// Whether an identifier names a single file in the cache directory.
fn is_file_stem(id: &str) -> bool {
    let mut components = Path::new(id).components();
    !id.contains(['/', '\\'])
        && matches!((components.next(), components.next()), (Some(Component::Normal(_)), None))
}

fn find_in_directory(dir: &Path, id: &str) -> Option<PathBuf> {
    if !is_file_stem(id) {
        return None;
    }
    CACHED_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{id}.{ext}")))
        .find(|path| path.exists())
}
