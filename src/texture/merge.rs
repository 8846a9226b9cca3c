//! Synthesis of textures glTF expects in a packed layout.
//!
//! Source materials describe color, alpha, metallic, roughness and occlusion
//! with independent textures. These functions pack them the way glTF PBR
//! reads them and write the result into the texture cache directory.

use super::cache::{TextureCache, TextureKey};
use super::loader::{load_image, TextureLoader};
use crate::error::MergeError;
use image::imageops::FilterType;
use image::{ImageEncoder, Rgba, RgbaImage};
use std::sync::Arc;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

/// Weights used to convert a color into a single gray level.
pub const LUMINANCE_WEIGHTS: [f32; 3] = [0.35, 0.5, 0.15];

const MASKED_SUFFIX: &str = "_masked.png";
const BLEND_SUFFIX: &str = "_blend.png";

/// A texture synthesized in the cache directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedTexture {
    pub key: TextureKey,
    /// Whether the alpha channel holds values other than fully opaque or fully transparent.
    pub requires_translucency: bool,
}

/// Gray level of a pixel.
pub fn luminance(pixel: &Rgba<u8>) -> u8 {
    let [r, g, b, _] = pixel.0;
    let value = LUMINANCE_WEIGHTS[0] * r as f32
        + LUMINANCE_WEIGHTS[1] * g as f32
        + LUMINANCE_WEIGHTS[2] * b as f32;
    value.round().clamp(0.0, 255.0) as u8
}

/// Whether an alpha value is neither opaque nor transparent.
fn is_translucent(alpha: u8) -> bool {
    let alpha = alpha as f32;
    alpha > 0.5 && alpha < 254.5
}

fn resized(image: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    if image.dimensions() == (width, height) {
        image.clone()
    } else {
        image::imageops::resize(image, width, height, FilterType::Triangle)
    }
}

fn max_dimensions<'a>(images: impl IntoIterator<Item = &'a RgbaImage>) -> (u32, u32) {
    images
        .into_iter()
        .fold((1, 1), |(w, h), img| (w.max(img.width()), h.max(img.height())))
}

/// Combine a color image and an alpha source into one RGBA image.
///
/// The alpha source is converted to luminance. Without color image, RGB is white.
/// Returns the merged image and whether it requires translucency.
pub fn merge_color_alpha(color: Option<&RgbaImage>, alpha: &RgbaImage) -> (RgbaImage, bool) {
    let (width, height) = max_dimensions(color.into_iter().chain([alpha]));
    let alpha = resized(alpha, width, height);
    let mut merged = match color {
        Some(color) => resized(color, width, height),
        None => RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255])),
    };
    let mut requires_translucency = false;
    for (pixel, source) in merged.pixels_mut().zip(alpha.pixels()) {
        let a = luminance(source);
        requires_translucency |= is_translucent(a);
        pixel.0[3] = a;
    }
    (merged, requires_translucency)
}

/// Pack metallic and roughness into one image: roughness in G, metallic in B.
///
/// A missing source is filled with 255, so the material factor alone drives that channel.
pub fn merge_metallic_roughness(metallic: Option<&RgbaImage>, roughness: Option<&RgbaImage>) -> Option<RgbaImage> {
    if metallic.is_none() && roughness.is_none() {
        return None;
    }
    let (width, height) = max_dimensions(metallic.into_iter().chain(roughness));
    let metallic = metallic.map(|img| resized(img, width, height));
    let roughness = roughness.map(|img| resized(img, width, height));
    let channel = |source: &Option<RgbaImage>, x: u32, y: u32| {
        source.as_ref().map_or(255, |img| luminance(img.get_pixel(x, y)))
    };
    Some(RgbaImage::from_fn(width, height, |x, y| {
        Rgba([0, channel(&roughness, x, y), channel(&metallic, x, y), 255])
    }))
}

/// Repack an occlusion source so its luminance lands in the R channel.
pub fn reformat_occlusion(occlusion: &RgbaImage) -> RgbaImage {
    RgbaImage::from_fn(occlusion.width(), occlusion.height(), |x, y| {
        let l = luminance(occlusion.get_pixel(x, y));
        Rgba([l, l, l, 255])
    })
}

/// Encode an image as PNG bytes.
pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>, MergeError> {
    let mut bytes = Vec::new();
    let cursor = std::io::Cursor::new(&mut bytes);
    let encoder = image::codecs::png::PngEncoder::new(cursor);

    encoder
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            image::ExtendedColorType::Rgba8,
        )
        .map_err(|e| MergeError::new(format!("Failed to encode PNG: {}", e)))?;

    Ok(bytes)
}

/// Stable short hash of a texture identity, used in synthesized file names.
pub fn texture_hash(key: &TextureKey) -> String {
    format!("{:016x}", xxh3_64(format!("{:?}:{}", key.source, key.id).as_bytes()))
}

fn hash_or_none(key: Option<&TextureKey>) -> String {
    key.map_or_else(|| "none".to_string(), texture_hash)
}

fn load(
    cache: &mut TextureCache,
    loader: &dyn TextureLoader,
    key: &TextureKey,
) -> Result<Arc<RgbaImage>, MergeError> {
    load_image(cache, loader, key).map_err(|e| MergeError::new(format!("cannot load texture {}: {e}", key.id)))
}

fn store(cache: &mut TextureCache, file_name: &str, image: &RgbaImage) -> Result<TextureKey, MergeError> {
    let bytes = encode_png(image)?;
    let key = cache
        .store_synthesized(file_name, &bytes)
        .map_err(|e| MergeError::new(e.to_string()))?;
    cache.store_decoded_image(&key, Arc::new(image.clone()));
    Ok(key)
}

/// Texture combining a color texture and an alpha texture.
///
/// Returns `Ok(None)` when there is no alpha texture to merge. A merged file
/// already present in the cache directory is reused; its suffix tells whether
/// it requires translucency.
pub fn color_alpha_texture(
    cache: &mut TextureCache,
    loader: &dyn TextureLoader,
    color: Option<&TextureKey>,
    alpha: Option<&TextureKey>,
) -> Result<Option<MergedTexture>, MergeError> {
    let Some(alpha) = alpha else {
        return Ok(None);
    };
    let stem = format!("c_{}-a_{}", hash_or_none(color), texture_hash(alpha));
    for (suffix, requires_translucency) in [(MASKED_SUFFIX, false), (BLEND_SUFFIX, true)] {
        if let Some(path) = cache.find_synthesized(&format!("{stem}{suffix}")) {
            let key = cache.register_synthesized(path);
            cache.set_requires_translucency(&key, requires_translucency);
            return Ok(Some(MergedTexture {
                key,
                requires_translucency,
            }));
        }
    }

    let color_image = color.map(|key| load(cache, loader, key)).transpose()?;
    let alpha_image = load(cache, loader, alpha)?;
    let (merged, requires_translucency) = merge_color_alpha(color_image.as_deref(), &alpha_image);
    let suffix = if requires_translucency { BLEND_SUFFIX } else { MASKED_SUFFIX };
    let key = store(cache, &format!("{stem}{suffix}"), &merged)?;
    cache.set_requires_translucency(&key, requires_translucency);
    debug!("merged color and alpha textures into {}", key.id);
    Ok(Some(MergedTexture {
        key,
        requires_translucency,
    }))
}

/// Packed metallic-roughness texture, or `Ok(None)` when neither channel has a texture.
pub fn metallic_roughness_texture(
    cache: &mut TextureCache,
    loader: &dyn TextureLoader,
    metallic: Option<&TextureKey>,
    roughness: Option<&TextureKey>,
) -> Result<Option<MergedTexture>, MergeError> {
    if metallic.is_none() && roughness.is_none() {
        return Ok(None);
    }
    let file_name = format!("m_{}-r_{}.png", hash_or_none(metallic), hash_or_none(roughness));
    if let Some(path) = cache.find_synthesized(&file_name) {
        return Ok(Some(MergedTexture {
            key: cache.register_synthesized(path),
            requires_translucency: false,
        }));
    }
    let metallic_image = metallic.map(|key| load(cache, loader, key)).transpose()?;
    let roughness_image = roughness.map(|key| load(cache, loader, key)).transpose()?;
    let Some(merged) = merge_metallic_roughness(metallic_image.as_deref(), roughness_image.as_deref()) else {
        return Ok(None);
    };
    let key = store(cache, &file_name, &merged)?;
    debug!("merged metallic and roughness textures into {}", key.id);
    Ok(Some(MergedTexture {
        key,
        requires_translucency: false,
    }))
}

/// Occlusion texture in the layout glTF reads, or `Ok(None)` without source texture.
pub fn occlusion_texture(
    cache: &mut TextureCache,
    loader: &dyn TextureLoader,
    occlusion: Option<&TextureKey>,
) -> Result<Option<MergedTexture>, MergeError> {
    let Some(occlusion) = occlusion else {
        return Ok(None);
    };
    let file_name = format!("ao_{}.png", texture_hash(occlusion));
    if let Some(path) = cache.find_synthesized(&file_name) {
        return Ok(Some(MergedTexture {
            key: cache.register_synthesized(path),
            requires_translucency: false,
        }));
    }
    let source = load(cache, loader, occlusion)?;
    let key = store(cache, &file_name, &reformat_occlusion(&source))?;
    Ok(Some(MergedTexture {
        key,
        requires_translucency: false,
    }))
}

/// Whether the decoded pixels of a texture hold translucent alpha values. Cached per texture.
pub fn texture_requires_translucency(
    cache: &mut TextureCache,
    loader: &dyn TextureLoader,
    key: &TextureKey,
) -> Result<bool, MergeError> {
    if let Some(known) = cache.requires_translucency(key) {
        return Ok(known);
    }
    let image = load(cache, loader, key)?;
    let translucent = image.pixels().any(|p| is_translucent(p.0[3]));
    cache.set_requires_translucency(key, translucent);
    Ok(translucent)
}
