//! Access to raw texture bytes.

use super::cache::{TextureAccess, TextureCache, TextureKey};
use crate::error::{Result, TunerError};
use image::RgbaImage;
use std::sync::Arc;

/// Source of encoded texture bytes, supplied by the host.
pub trait TextureLoader: Send + Sync {
    /// Load the encoded bytes of a texture.
    fn load_texture_buffer(&self, access: &TextureAccess) -> Result<Vec<u8>>;
}

/// Loader reading cached textures straight from the filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileTextureLoader;

impl TextureLoader for FileTextureLoader {
    fn load_texture_buffer(&self, access: &TextureAccess) -> Result<Vec<u8>> {
        let path = access.path.as_ref().ok_or_else(|| {
            TunerError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("texture {} has no local file", access.key.id),
            ))
        })?;
        Ok(std::fs::read(path)?)
    }
}

/// Decoded pixels of a texture, decoding and caching them on first use.
pub fn load_image(
    cache: &mut TextureCache,
    loader: &dyn TextureLoader,
    key: &TextureKey,
) -> Result<Arc<RgbaImage>> {
    let access = cache.texture_access(key).ok_or_else(|| {
        TunerError::InvalidGltf(format!("texture {} is not available", key.id))
    })?;
    if let Some(image) = access.image {
        return Ok(image);
    }
    let bytes = loader.load_texture_buffer(&access)?;
    let image = Arc::new(image::load_from_memory(&bytes)?.to_rgba8());
    cache.store_decoded_image(key, image.clone());
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba};

    #[test]
    fn test_load_and_memoize() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("red.png");
        RgbaImage::from_pixel(2, 2, Rgba([255, 0, 0, 255]))
            .save_with_format(&file, ImageFormat::Png)
            .unwrap();

        let mut cache = TextureCache::new();
        let key = cache.find_or_register_local_texture(&file);
        let image = load_image(&mut cache, &FileTextureLoader, &key).unwrap();
        assert_eq!(image.get_pixel(1, 1), &Rgba([255, 0, 0, 255]));

        std::fs::remove_file(&file).unwrap();
        let again = load_image(&mut cache, &FileTextureLoader, &key).unwrap();
        assert!(Arc::ptr_eq(&image, &again));
    }

    #[test]
    fn test_unavailable_texture() {
        let mut cache = TextureCache::new();
        let key = cache.register_remote("missing");
        assert!(load_image(&mut cache, &FileTextureLoader, &key).is_err());
    }

    #[test]
    fn test_malformed_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("broken.png");
        std::fs::write(&file, b"not a png").unwrap();

        let mut cache = TextureCache::new();
        let key = cache.find_or_register_local_texture(&file);
        assert!(matches!(
            load_image(&mut cache, &FileTextureLoader, &key),
            Err(TunerError::Image(_))
        ));
    }
}
