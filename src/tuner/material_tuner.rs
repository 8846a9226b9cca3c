//! Conversion of customized source materials into glTF PBR materials.

use crate::gltf::GltfBuilder;
use crate::material::{Channel, MaterialDefinition, MaterialRegistry, RegistryState, UvTransform};
use crate::texture::merge::{self, MergedTexture};
use crate::texture::{TextureKey, TextureLoader};
use gltf_json as json;
use image::ImageFormat;
use json::material::{AlphaMode, NormalTexture, OcclusionTexture, StrengthFactor};
use json::validation::Checked::Valid;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

pub const TEXTURE_TRANSFORM: &str = "KHR_texture_transform";

const OPAQUE_ALPHA: f64 = 1.0 - 1e-5;

/// Result of converting one source material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialConversion {
    /// Index of the glTF material to use.
    pub material: Option<u32>,
    /// Whether vertex colors must be dropped because the material replaces them.
    pub override_color: bool,
}

/// Materials, textures and images of a tuned model.
#[derive(Debug, Default)]
pub struct TunedMaterials {
    pub materials: Vec<json::Material>,
    pub textures: Vec<json::Texture>,
    pub images: Vec<json::Image>,
    pub uses_texture_transform: bool,
}

/// Appends tuned materials to the material list of one tune pass.
///
/// Each source material is converted at most once per pass, and each source
/// texture becomes at most one glTF texture.
pub struct MaterialTuner<'a> {
    registry: &'a MaterialRegistry,
    loader: &'a dyn TextureLoader,
    output: TunedMaterials,
    converted: HashMap<u64, MaterialConversion>,
    converted_textures: HashMap<TextureKey, u32>,
}

impl<'a> MaterialTuner<'a> {
    /// Start from the materials, textures and images of the input model.
    pub fn new(
        registry: &'a MaterialRegistry,
        loader: &'a dyn TextureLoader,
        materials: Vec<json::Material>,
        textures: Vec<json::Texture>,
        images: Vec<json::Image>,
    ) -> Self {
        Self {
            registry,
            loader,
            output: TunedMaterials {
                materials,
                textures,
                images,
                uses_texture_transform: false,
            },
            converted: HashMap::new(),
            converted_textures: HashMap::new(),
        }
    }

    pub fn materials(&self) -> &[json::Material] {
        &self.output.materials
    }

    /// Whether a glTF material samples any texture.
    pub fn material_uses_textures(&self, index: u32) -> bool {
        self.output.materials.get(index as usize).is_some_and(|m| {
            m.pbr_metallic_roughness.base_color_texture.is_some()
                || m.pbr_metallic_roughness.metallic_roughness_texture.is_some()
                || m.normal_texture.is_some()
                || m.occlusion_texture.is_some()
                || m.emissive_texture.is_some()
        })
    }

    /// glTF material to use for primitives of the given source material.
    ///
    /// Without customization the original glTF material is kept. Otherwise a
    /// new material is appended, cloned from the original and overwritten by
    /// the customized channels. Later calls for the same source material reuse
    /// the first result.
    pub fn convert_material(
        &mut self,
        material_id: u64,
        gltf_material: Option<u32>,
        mesh_colors: &[[u8; 4]],
        builder: &mut GltfBuilder,
    ) -> MaterialConversion {
        if let Some(conversion) = self.converted.get(&material_id) {
            return *conversion;
        }
        let registry = self.registry;
        let mut state = registry.write();
        let unchanged = MaterialConversion {
            material: gltf_material,
            override_color: false,
        };
        let (Some(custom), Some(full)) = (
            state.definition(material_id).filter(|d| d.has_custom_definition()).cloned(),
            state.full_definition(material_id),
        ) else {
            return unchanged;
        };

        let original = match gltf_material {
            Some(index) => match self.output.materials.get(index as usize) {
                Some(material) => material.clone(),
                None => {
                    warn!("material {index} referenced by source material {material_id:#x} does not exist");
                    return unchanged;
                }
            },
            None => json::Material::default(),
        };

        let mut converter = Conversion {
            material_id,
            custom: &custom,
            full: &full,
            material: original,
            alpha_mode: None,
            override_color: false,
        };
        converter.apply_factors(&mut state, mesh_colors);
        self.apply_textures(&mut converter, &mut state, builder);

        if let Some(mode) = converter.alpha_mode {
            converter.material.alpha_mode = Valid(mode);
            state.set_current_alpha_mode(material_id, mode);
        }

        self.output.materials.push(converter.material);
        let conversion = MaterialConversion {
            material: Some((self.output.materials.len() - 1) as u32),
            override_color: converter.override_color,
        };
        debug!(
            "converted source material {material_id:#x} into glTF material {:?}",
            conversion.material
        );
        self.converted.insert(material_id, conversion);
        conversion
    }

    fn apply_textures(&mut self, conv: &mut Conversion<'_>, state: &mut RegistryState, builder: &mut GltfBuilder) {
        let transform = conv.full.uv_transform;
        let color_key = conv
            .full
            .color_map(Channel::Color)
            .and_then(|map| state.texture_key(map));
        let alpha_key = conv
            .full
            .intensity_map(Channel::Alpha)
            .and_then(|map| state.texture_key(map));

        // Base color.
        let mut base_color = None;
        if let Some(alpha) = alpha_key {
            match merge::color_alpha_texture(state.textures_mut(), self.loader, color_key.as_ref(), Some(&alpha)) {
                Ok(Some(MergedTexture {
                    key,
                    requires_translucency,
                })) => {
                    if requires_translucency {
                        conv.alpha_mode = Some(AlphaMode::Blend);
                    } else if conv.alpha_mode != Some(AlphaMode::Blend) {
                        conv.alpha_mode = Some(AlphaMode::Mask);
                    }
                    base_color = self.convert_texture(state, &key, builder);
                    if base_color.is_some() {
                        conv.material.pbr_metallic_roughness.base_color_factor.0[3] = 1.0;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("source material {:#x}: {e}", conv.material_id),
            }
        } else if let Some(color) = color_key.filter(|_| conv.custom.defines_channel(Channel::Color)) {
            match merge::texture_requires_translucency(state.textures_mut(), self.loader, &color) {
                Ok(true) if conv.alpha_mode.is_none() => conv.alpha_mode = Some(AlphaMode::Blend),
                Ok(_) => {}
                Err(e) => warn!("source material {:#x}: {e}", conv.material_id),
            }
            base_color = self.convert_texture(state, &color, builder);
        }
        if let Some(index) = base_color {
            conv.material.pbr_metallic_roughness.base_color_texture = Some(self.texture_info(index, &transform));
        }

        // Metallic and roughness share one packed texture.
        let metallic = conv.full.intensity_map(Channel::Metallic).and_then(|m| state.texture_key(m));
        let roughness = conv.full.intensity_map(Channel::Roughness).and_then(|m| state.texture_key(m));
        match merge::metallic_roughness_texture(state.textures_mut(), self.loader, metallic.as_ref(), roughness.as_ref()) {
            Ok(Some(merged)) => {
                if let Some(index) = self.convert_texture(state, &merged.key, builder) {
                    let pbr = &mut conv.material.pbr_metallic_roughness;
                    pbr.metallic_roughness_texture = Some(self.texture_info(index, &transform));
                    if metallic.is_some() {
                        pbr.metallic_factor = StrengthFactor(1.0);
                    }
                    if roughness.is_some() {
                        pbr.roughness_factor = StrengthFactor(1.0);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!("source material {:#x}: {e}", conv.material_id),
        }

        let occlusion = conv
            .full
            .intensity_map(Channel::AmbientOcclusion)
            .and_then(|m| state.texture_key(m));
        match merge::occlusion_texture(state.textures_mut(), self.loader, occlusion.as_ref()) {
            Ok(Some(merged)) => {
                if let Some(index) = self.convert_texture(state, &merged.key, builder) {
                    let strength = conv.full.intensity(Channel::AmbientOcclusion).unwrap_or(1.0);
                    conv.material.occlusion_texture = Some(OcclusionTexture {
                        index: json::Index::new(index),
                        strength: StrengthFactor(strength as f32),
                        tex_coord: 0,
                        extensions: self.transform_extension(&transform).map(|others| {
                            let mut ext = json::extensions::material::OcclusionTexture::default();
                            ext.others = others;
                            ext
                        }),
                        extras: Default::default(),
                    });
                }
            }
            Ok(None) => {}
            Err(e) => warn!("source material {:#x}: {e}", conv.material_id),
        }

        if conv.custom.defines_channel(Channel::Normal) {
            let normal = conv.full.color_map(Channel::Normal).and_then(|m| state.texture_key(m));
            if let Some(index) = normal.and_then(|key| self.convert_texture(state, &key, builder)) {
                let scale = conv.full.intensity(Channel::Normal).unwrap_or(1.0);
                conv.material.normal_texture = Some(NormalTexture {
                    index: json::Index::new(index),
                    scale: scale as f32,
                    tex_coord: 0,
                    extensions: self.transform_extension(&transform).map(|others| {
                        let mut ext = json::extensions::material::NormalTexture::default();
                        ext.others = others;
                        ext
                    }),
                    extras: Default::default(),
                });
            }
        }
    }

    fn texture_info(&mut self, index: u32, transform: &UvTransform) -> json::texture::Info {
        json::texture::Info {
            index: json::Index::new(index),
            tex_coord: 0,
            extensions: self.transform_extension(transform).map(|others| {
                let mut ext = json::extensions::texture::Info::default();
                ext.others = others;
                ext
            }),
            extras: Default::default(),
        }
    }

    /// `KHR_texture_transform` of a texture reference, unless the transform is the identity.
    fn transform_extension(&mut self, transform: &UvTransform) -> Option<Map<String, Value>> {
        if transform.is_identity() {
            return None;
        }
        self.output.uses_texture_transform = true;
        let mut others = Map::new();
        others.insert(
            TEXTURE_TRANSFORM.to_string(),
            serde_json::json!({
                "offset": transform.offset,
                "rotation": transform.rotation,
                "scale": transform.scale,
            }),
        );
        Some(others)
    }

    /// glTF texture showing a cached texture, embedding its image into the output buffer.
    pub fn convert_texture(
        &mut self,
        state: &RegistryState,
        key: &TextureKey,
        builder: &mut GltfBuilder,
    ) -> Option<u32> {
        if let Some(&index) = self.converted_textures.get(key) {
            return Some(index);
        }
        let Some(access) = state.textures().texture_access(key) else {
            warn!("texture {} is not available yet", key.id);
            return None;
        };

        let encoded = if access.path.is_some() {
            self.loader.load_texture_buffer(&access).ok()
        } else {
            None
        };
        let (bytes, mime_type) = match encoded {
            Some(bytes) => match image::guess_format(&bytes) {
                Ok(ImageFormat::Jpeg) => (bytes, "image/jpeg"),
                Ok(ImageFormat::Png) => (bytes, "image/png"),
                _ => (reencode(&bytes)?, "image/png"),
            },
            None => {
                let image = access.image.as_ref()?;
                match merge::encode_png(image) {
                    Ok(bytes) => (bytes, "image/png"),
                    Err(e) => {
                        warn!("cannot encode texture {}: {e}", key.id);
                        return None;
                    }
                }
            }
        };

        let view = builder.add_buffer_view(&bytes, None, None);
        self.output.images.push(json::Image {
            buffer_view: Some(json::Index::new(view)),
            mime_type: Some(json::image::MimeType(mime_type.to_string())),
            uri: None,
            extensions: Default::default(),
            extras: Default::default(),
        });
        self.output.textures.push(json::Texture {
            sampler: None,
            source: json::Index::new((self.output.images.len() - 1) as u32),
            extensions: Default::default(),
            extras: Default::default(),
        });
        let index = (self.output.textures.len() - 1) as u32;
        self.converted_textures.insert(key.clone(), index);
        Some(index)
    }

    pub fn finish(self) -> TunedMaterials {
        self.output
    }
}

fn reencode(bytes: &[u8]) -> Option<Vec<u8>> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| warn!("cannot decode texture: {e}"))
        .ok()?
        .to_rgba8();
    merge::encode_png(&image)
        .map_err(|e| warn!("cannot encode texture: {e}"))
        .ok()
}

/// One material being converted.
struct Conversion<'d> {
    material_id: u64,
    /// Customized channels only.
    custom: &'d MaterialDefinition,
    /// Every channel, completed by its effective value.
    full: &'d MaterialDefinition,
    material: json::Material,
    alpha_mode: Option<AlphaMode>,
    override_color: bool,
}

impl Conversion<'_> {
    fn intensity(&self, channel: Channel) -> f64 {
        self.full.intensity(channel).unwrap_or_default()
    }

    fn apply_factors(&mut self, state: &mut RegistryState, mesh_colors: &[[u8; 4]]) {
        if self.custom.defines_channel(Channel::Roughness) {
            let roughness = self.intensity(Channel::Roughness) as f32;
            self.material.pbr_metallic_roughness.roughness_factor = StrengthFactor(roughness);
        }
        if self.custom.defines_channel(Channel::Metallic) {
            let metallic = self.intensity(Channel::Metallic) as f32;
            self.material.pbr_metallic_roughness.metallic_factor = StrengthFactor(metallic);
        }

        let mut opacity = None;
        if self.custom.defines_channel(Channel::Transparency) || self.custom.defines_channel(Channel::Alpha) {
            let original_mode = match self.material.alpha_mode {
                Valid(mode) => mode,
                _ => AlphaMode::Opaque,
            };
            state.store_initial_alpha_mode_if_needed(self.material_id, original_mode);
            let initial_mode = state.initial_alpha_mode(self.material_id).unwrap_or(original_mode);

            let alpha = if self.custom.defines_channel(Channel::Alpha) {
                self.intensity(Channel::Alpha)
            } else {
                1.0 - self.intensity(Channel::Transparency)
            };
            let mut enforce_opaque = false;
            self.alpha_mode = Some(if alpha < OPAQUE_ALPHA {
                AlphaMode::Blend
            } else if initial_mode == AlphaMode::Blend {
                enforce_opaque = true;
                AlphaMode::Opaque
            } else {
                initial_mode
            });

            let factor = &mut self.material.pbr_metallic_roughness.base_color_factor.0;
            factor[3] = alpha as f32;
            if let Some(first) = mesh_colors.first().filter(|_| enforce_opaque) {
                for (channel, &value) in factor.iter_mut().zip(first).take(3) {
                    *channel = value as f32 / 255.0;
                }
                self.override_color = true;
            }
            opacity = Some(alpha);
        }

        if self.custom.defines_channel(Channel::Color) {
            let color = self.full.color(Channel::Color).unwrap_or(crate::material::types::WHITE);
            let opacity = opacity.unwrap_or(1.0 - self.intensity(Channel::Transparency));
            self.material.pbr_metallic_roughness.base_color_factor.0 =
                [color[0] as f32, color[1] as f32, color[2] as f32, opacity as f32];
            self.override_color = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::{ChannelMap, SourceMaterialProperties};
    use crate::texture::{FileTextureLoader, TextureSource};
    use image::{Rgba, RgbaImage};

    const ID: u64 = 7;

    fn registry() -> MaterialRegistry {
        let registry = MaterialRegistry::new();
        registry
            .write()
            .ingest_source_properties(ID, SourceMaterialProperties::default());
        registry
    }

    fn input_materials() -> Vec<json::Material> {
        let mut material = json::Material::default();
        material.alpha_mode = Valid(AlphaMode::Blend);
        vec![material]
    }

    #[test]
    fn test_uncustomized_material_is_kept() {
        let registry = registry();
        let loader = FileTextureLoader;
        let mut tuner = MaterialTuner::new(&registry, &loader, input_materials(), vec![], vec![]);
        let mut builder = GltfBuilder::new();

        let conversion = tuner.convert_material(ID, Some(0), &[], &mut builder);
        assert_eq!(conversion.material, Some(0));
        assert!(!conversion.override_color);
        assert_eq!(tuner.materials().len(), 1);
    }

    #[test]
    fn test_color_and_roughness_overrides() {
        let registry = registry();
        {
            let mut state = registry.write();
            state.set_channel_color(ID, Channel::Color, [0.2, 0.4, 0.6, 1.0]);
            state.set_channel_intensity(ID, Channel::Roughness, 0.3);
        }
        let loader = FileTextureLoader;
        let mut tuner = MaterialTuner::new(&registry, &loader, input_materials(), vec![], vec![]);
        let mut builder = GltfBuilder::new();

        let conversion = tuner.convert_material(ID, Some(0), &[], &mut builder);
        assert_eq!(conversion.material, Some(1));
        assert!(conversion.override_color);
        let pbr = &tuner.materials()[1].pbr_metallic_roughness;
        assert_eq!(pbr.base_color_factor.0[..3], [0.2, 0.4, 0.6]);
        approx::assert_relative_eq!(pbr.roughness_factor.0, 0.3);

        // Memoized per source material.
        let again = tuner.convert_material(ID, Some(0), &[], &mut builder);
        assert_eq!(again, conversion);
        assert_eq!(tuner.materials().len(), 2);
    }

    #[test]
    fn test_opaque_alpha_on_blend_material_enforces_opaque() {
        let registry = registry();
        let mut definition = MaterialDefinition::default();
        definition.set_intensity(Channel::Alpha, 1.0);
        registry.write().set_full_definition(ID, definition);
        let loader = FileTextureLoader;
        let mut tuner = MaterialTuner::new(&registry, &loader, input_materials(), vec![], vec![]);
        let mut builder = GltfBuilder::new();

        let conversion = tuner.convert_material(ID, Some(0), &[[255, 0, 51, 255]], &mut builder);
        assert!(conversion.override_color);
        let material = &tuner.materials()[1];
        assert_eq!(material.alpha_mode, Valid(AlphaMode::Opaque));
        assert_eq!(material.pbr_metallic_roughness.base_color_factor.0, [1.0, 0.0, 0.2, 1.0]);
        assert_eq!(registry.read().initial_alpha_mode(ID), Some(AlphaMode::Blend));
        assert_eq!(registry.read().current_alpha_mode(ID), Some(AlphaMode::Opaque));
    }

    #[test]
    fn test_partial_transparency_blends() {
        let registry = registry();
        registry.write().set_channel_intensity(ID, Channel::Transparency, 0.25);
        let loader = FileTextureLoader;
        let mut material = json::Material::default();
        material.alpha_mode = Valid(AlphaMode::Opaque);
        let mut tuner = MaterialTuner::new(&registry, &loader, vec![material], vec![], vec![]);
        let mut builder = GltfBuilder::new();

        tuner.convert_material(ID, Some(0), &[], &mut builder);
        let material = &tuner.materials()[1];
        assert_eq!(material.alpha_mode, Valid(AlphaMode::Blend));
        assert_eq!(material.pbr_metallic_roughness.base_color_factor.0[3], 0.75);
    }

    #[test]
    fn test_color_texture_is_embedded_once() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("wood.png");
        RgbaImage::from_pixel(2, 2, Rgba([120, 80, 40, 255])).save(&file).unwrap();

        let registry = registry();
        registry.write().ingest_source_properties(8, SourceMaterialProperties::default());
        let map = ChannelMap::new(file.to_string_lossy(), TextureSource::LocalDisk);
        {
            let mut state = registry.write();
            state.textures_mut().set_directory(tmp.path().join("cache"));
            state.set_channel_color_map(ID, Channel::Color, map.clone());
            state.set_channel_color_map(8, Channel::Color, map);
            state.set_uv_transform(
                ID,
                UvTransform {
                    scale: [2.0, 2.0],
                    ..Default::default()
                },
            );
        }
        let loader = FileTextureLoader;
        let mut tuner = MaterialTuner::new(&registry, &loader, input_materials(), vec![], vec![]);
        let mut builder = GltfBuilder::new();

        let first = tuner.convert_material(ID, Some(0), &[], &mut builder);
        let second = tuner.convert_material(8, Some(0), &[], &mut builder);
        assert_eq!(first.material, Some(1));
        assert_eq!(second.material, Some(2));
        assert!(tuner.material_uses_textures(1));
        assert!(!tuner.material_uses_textures(0));

        let info = tuner.materials()[1].pbr_metallic_roughness.base_color_texture.clone().unwrap();
        assert!(info.extensions.unwrap().others.contains_key(TEXTURE_TRANSFORM));
        let output = tuner.finish();
        assert_eq!(output.textures.len(), 1);
        assert_eq!(output.images.len(), 1);
        assert_eq!(output.images[0].mime_type.as_ref().unwrap().0, "image/png");
        assert!(output.uses_texture_transform);
        assert_eq!(builder.buffer_view_count(), 1);
    }

    #[test]
    fn test_unavailable_texture_leaves_channel_unset() {
        let registry = registry();
        registry
            .write()
            .set_channel_color_map(ID, Channel::Color, ChannelMap::new("remote-1", TextureSource::Remote));
        let loader = FileTextureLoader;
        let mut tuner = MaterialTuner::new(&registry, &loader, input_materials(), vec![], vec![]);
        let mut builder = GltfBuilder::new();

        let conversion = tuner.convert_material(ID, Some(0), &[], &mut builder);
        assert_eq!(conversion.material, Some(1));
        assert!(tuner.materials()[1].pbr_metallic_roughness.base_color_texture.is_none());
    }
}
