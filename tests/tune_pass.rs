//! Tune passes over small tiles built in memory.

use glam::{DMat4, DVec3};
use gltf_json as json;
use gltf_tuner::gltf::accessor::{self, AccessorView};
use gltf_tuner::gltf::builder::{primitive, set_feature_ids};
use gltf_tuner::gltf::metadata::{StructuralMetadata, ELEMENT_PROPERTY, STRUCTURAL_METADATA};
use gltf_tuner::gltf::{feature_id_semantic, GltfBuilder};
use gltf_tuner::material::{Channel, ChannelMap};
use gltf_tuner::texture::TextureSource;
use gltf_tuner::{ElementGroup, GltfModel, GltfTuner, Rules, TunerConfig};
use image::{Rgba, RgbaImage};
use json::material::AlphaMode;
use json::mesh::{Mode, Semantic};
use json::validation::Checked::Valid;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

const SOURCE_MATERIAL: u64 = 7;

struct Prim<'a> {
    positions: &'a [[f32; 3]],
    indices: &'a [u32],
    feature_ids: &'a [u32],
}

const TRIANGLE: Prim<'static> = Prim {
    positions: &[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
    indices: &[0, 1, 2],
    feature_ids: &[0, 0, 0],
};

/// A tile with one mesh, one node and one material. Feature ids index an
/// element table and a material table.
fn tile(primitives: &[Prim<'_>], elements: &[u64], materials: &[u64]) -> GltfModel {
    let mut builder = GltfBuilder::new();
    let bytes = |values: &[u64]| values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>();
    let element_view = builder.add_buffer_view(&bytes(elements), None, None);
    let material_view = builder.add_buffer_view(&bytes(materials), None, None);

    let primitives: Vec<json::mesh::Primitive> = primitives
        .iter()
        .map(|p| {
            let indices = builder.add_indices(p.indices);
            let positions = builder.add_positions(p.positions);
            let mut prim = primitive([(Semantic::Positions, positions)], Some(indices), Some(0), Mode::Triangles);
            let ids = builder.add_feature_ids(p.feature_ids);
            set_feature_ids(&mut prim, ids, p.feature_ids, &[0, 1]);
            prim
        })
        .collect();

    let metadata = serde_json::json!({
        "schema": {"classes": {
            "features": {"properties": {"element": {"type": "SCALAR", "componentType": "UINT64"}}},
            "materials": {"properties": {"material": {"type": "SCALAR", "componentType": "UINT64"}}}
        }},
        "propertyTables": [
            {"class": "features", "count": elements.len(), "properties": {"element": {"values": element_view}}},
            {"class": "materials", "count": materials.len(), "properties": {"material": {"values": material_view}}}
        ]
    });

    let mut root = json::Root {
        materials: vec![json::Material::default()],
        meshes: vec![json::Mesh {
            extensions: Default::default(),
            extras: Default::default(),
            primitives,
            weights: None,
        }],
        nodes: vec![json::Node {
            camera: None,
            children: None,
            extensions: Default::default(),
            extras: Default::default(),
            matrix: None,
            mesh: Some(json::Index::new(0)),
            rotation: None,
            scale: None,
            translation: Some([1000.5, 0.0, 0.0]),
            skin: None,
            weights: None,
        }],
        scenes: vec![json::Scene {
            extensions: Default::default(),
            extras: Default::default(),
            nodes: vec![json::Index::new(0)],
        }],
        scene: Some(json::Index::new(0)),
        extensions_used: vec!["EXT_mesh_features".to_string(), STRUCTURAL_METADATA.to_string()],
        ..Default::default()
    };
    root.extensions
        .get_or_insert_with(Default::default)
        .others
        .insert(STRUCTURAL_METADATA.to_string(), metadata);

    // Go through the binary container, like tiles read from disk.
    let glb = builder.finish(root).to_glb().unwrap();
    GltfModel::from_glb(&glb).unwrap()
}

fn color_texture(dir: &Path) -> String {
    let path = dir.join("bricks.png");
    RgbaImage::from_pixel(4, 4, Rgba([180, 60, 40, 255])).save(&path).unwrap();
    path.to_string_lossy().into_owned()
}

/// Tuner splitting on the source material, which is customized with a color texture.
fn textured_tuner(dir: &Path) -> GltfTuner {
    let config = TunerConfig::new("model")
        .with_texture_dir(dir.join("cache"))
        .with_split_materials([SOURCE_MATERIAL]);
    let tuner = GltfTuner::new(config);
    {
        let mut registry = tuner.registry().write();
        registry.create_slot(SOURCE_MATERIAL);
        let map = ChannelMap::new(color_texture(dir), TextureSource::LocalDisk);
        assert!(registry.set_channel_color_map(SOURCE_MATERIAL, Channel::Color, map));
    }
    tuner
}

fn gray_texture(dir: &Path, name: &str, pixels: &[u8]) -> String {
    let path = dir.join(name);
    // Same size as the color texture, so merges never resample.
    let image = RgbaImage::from_fn(4, 4, |x, y| {
        let v = pixels[(y * 4 + x) as usize % pixels.len()];
        Rgba([v, v, v, 255])
    });
    image.save(&path).unwrap();
    path.to_string_lossy().into_owned()
}

/// Tuner splitting on the source material, with intensity maps on the given channels.
fn mapped_tuner(dir: &Path, maps: &[(Channel, String)]) -> GltfTuner {
    let config = TunerConfig::new("model")
        .with_texture_dir(dir.join("cache"))
        .with_split_materials([SOURCE_MATERIAL]);
    let tuner = GltfTuner::new(config);
    {
        let mut registry = tuner.registry().write();
        registry.create_slot(SOURCE_MATERIAL);
        for (channel, path) in maps {
            let map = ChannelMap::new(path.clone(), TextureSource::LocalDisk);
            assert!(registry.set_channel_intensity_map(SOURCE_MATERIAL, *channel, map));
        }
    }
    tuner
}

/// Files synthesized into the texture directory whose name matches.
fn synthesized(dir: &Path, prefix: &str, suffix: &str) -> Vec<PathBuf> {
    std::fs::read_dir(dir.join("cache"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            let name = path.file_name().unwrap().to_string_lossy();
            name.starts_with(prefix) && name.ends_with(suffix)
        })
        .collect()
}

fn tune(tuner: &GltfTuner, model: &GltfModel) -> GltfModel {
    tuner.tune(model, DMat4::IDENTITY, DVec3::ZERO).unwrap()
}

#[test]
fn test_customized_color_texture_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let tuner = textured_tuner(tmp.path());
    let model = tile(&[TRIANGLE], &[100], &[SOURCE_MATERIAL]);

    let tuned = tune(&tuner, &model);

    assert_eq!(tuned.root.materials.len(), 2);
    assert_eq!(tuned.root.textures.len(), 1);
    assert_eq!(tuned.root.images.len(), 1);
    let material = &tuned.root.materials[1];
    let base_color = material.pbr_metallic_roughness.base_color_texture.as_ref().unwrap();
    assert_eq!(base_color.index.value(), 0);

    let primitives = &tuned.root.meshes[0].primitives;
    assert_eq!(primitives.len(), 1);
    let prim = &primitives[0];
    assert_eq!(prim.material.map(|m| m.value()), Some(1));

    let uv_accessor = prim.attributes.get(&Valid(Semantic::TexCoords(0))).unwrap();
    let uvs = accessor::vec2(&tuned, uv_accessor.value()).unwrap();
    assert_eq!(uvs.len(), 3);

    let extras: serde_json::Value = serde_json::from_str(prim.extras.as_ref().unwrap().get()).unwrap();
    assert_eq!(extras["itwinMaterialId"], "0x7");

    // Survives the binary container.
    let reparsed = GltfModel::from_glb(&tuned.to_glb().unwrap()).unwrap();
    assert_eq!(reparsed.root.materials.len(), 2);
}

#[test]
fn test_tune_is_deterministic() {
    let tmp = tempfile::tempdir().unwrap();
    let quad = Prim {
        positions: &[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]],
        indices: &[0, 1, 2, 2, 3, 0],
        feature_ids: &[0, 0, 1, 1],
    };
    let model = tile(&[quad, TRIANGLE], &[100, 200], &[SOURCE_MATERIAL, 8]);

    let tuner = textured_tuner(tmp.path());
    let first = tune(&tuner, &model).to_glb().unwrap();
    let second = tune(&tuner, &model).to_glb().unwrap();
    assert_eq!(first, second);

    let other = textured_tuner(tmp.path());
    assert_eq!(tune(&other, &model).to_glb().unwrap(), first);
}

#[test]
fn test_shared_vertices_are_emitted_once() {
    let quad = Prim {
        positions: &[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]],
        indices: &[0, 1, 2, 2, 3, 0],
        feature_ids: &[0, 0, 0, 0],
    };
    let model = tile(&[quad], &[100], &[SOURCE_MATERIAL]);
    let tuner = GltfTuner::new(TunerConfig::new("model"));

    let tuned = tune(&tuner, &model);
    let prim = &tuned.root.meshes[0].primitives[0];
    let positions = prim.attributes.get(&Valid(Semantic::Positions)).unwrap();
    let indices = accessor::indices(&tuned, prim.indices.unwrap().value()).unwrap();

    assert_eq!(tuned.root.accessors[positions.value()].count.0, 4);
    let remapped: Vec<u32> = (0..indices.len()).map(|i| indices.get(i)).collect();
    assert_eq!(remapped, vec![0, 1, 2, 2, 3, 0]);
}

#[test]
fn test_primitives_merge_unless_grouped_apart() {
    let second = Prim {
        positions: &[[5.0, 0.0, 0.0], [6.0, 0.0, 0.0], [5.0, 1.0, 0.0]],
        indices: &[0, 1, 2],
        feature_ids: &[1, 1, 1],
    };
    let model = tile(&[TRIANGLE, second], &[100, 200], &[SOURCE_MATERIAL, SOURCE_MATERIAL]);
    let tuner = GltfTuner::new(TunerConfig::new("model"));

    let merged = tune(&tuner, &model);
    let primitives = &merged.root.meshes[0].primitives;
    assert_eq!(primitives.len(), 1);
    let indices = accessor::indices(&merged, primitives[0].indices.unwrap().value()).unwrap();
    assert_eq!(indices.len(), 6);
    // Source material is not split on, so it is not recorded.
    assert!(primitives[0].extras.is_none());

    tuner.set_rules(Rules {
        element_groups: vec![ElementGroup {
            elements: BTreeSet::from([200]),
            ..Default::default()
        }],
        ..Default::default()
    });
    let split = tune(&tuner, &model);
    assert_eq!(split.root.meshes[0].primitives.len(), 2);
    assert_eq!(split.root.materials.len(), 1);
}

#[test]
fn test_feature_ids_point_at_relocated_tables() {
    let model = tile(&[TRIANGLE], &[100], &[SOURCE_MATERIAL]);
    let tuner = GltfTuner::new(TunerConfig::new("model"));

    let tuned = tune(&tuner, &model);
    let metadata = StructuralMetadata::from_root(&tuned.root).unwrap();
    assert_eq!(metadata.property_tables.len(), 2);
    assert_eq!(metadata.read_column(&tuned, 0, ELEMENT_PROPERTY), Some(vec![100]));

    let prim = &tuned.root.meshes[0].primitives[0];
    assert!(prim.attributes.contains_key(&feature_id_semantic(0).unwrap()));
    let features = &prim.extensions.as_ref().unwrap().others["EXT_mesh_features"];
    let tables: Vec<u64> = features["featureIds"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["propertyTable"].as_u64().unwrap())
        .collect();
    assert_eq!(tables, vec![0, 1]);
    assert_eq!(tuned.root.extensions_used.len(), 2);
}

#[test]
fn test_metallic_and_roughness_maps_are_packed() {
    let tmp = tempfile::tempdir().unwrap();
    let metallic = gray_texture(tmp.path(), "metal.png", &[200]);
    let roughness = gray_texture(tmp.path(), "rough.png", &[50]);
    let tuner = mapped_tuner(
        tmp.path(),
        &[(Channel::Metallic, metallic), (Channel::Roughness, roughness)],
    );
    let model = tile(&[TRIANGLE], &[100], &[SOURCE_MATERIAL]);

    let tuned = tune(&tuner, &model);
    let pbr = &tuned.root.materials[1].pbr_metallic_roughness;
    let packed = pbr.metallic_roughness_texture.as_ref().unwrap();
    assert!(packed.index.value() < tuned.root.textures.len());
    assert_eq!(pbr.metallic_factor.0, 1.0);
    assert_eq!(pbr.roughness_factor.0, 1.0);
    assert!(pbr.base_color_texture.is_none());

    let files = synthesized(tmp.path(), "m_", ".png");
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.contains("-r_"), "{name}");
    assert!(!name.contains("none"), "{name}");
    let image = image::open(&files[0]).unwrap().to_rgba8();
    assert_eq!(image.get_pixel(0, 0), &Rgba([0, 50, 200, 255]));
}

#[test]
fn test_roughness_map_alone_fills_metallic() {
    let tmp = tempfile::tempdir().unwrap();
    let roughness = gray_texture(tmp.path(), "rough.png", &[80]);
    let tuner = mapped_tuner(tmp.path(), &[(Channel::Roughness, roughness)]);
    let model = tile(&[TRIANGLE], &[100], &[SOURCE_MATERIAL]);

    let tuned = tune(&tuner, &model);
    let pbr = &tuned.root.materials[1].pbr_metallic_roughness;
    assert!(pbr.metallic_roughness_texture.is_some());
    assert_eq!(pbr.roughness_factor.0, 1.0);

    let files = synthesized(tmp.path(), "m_none-r_", ".png");
    assert_eq!(files.len(), 1);
    let image = image::open(&files[0]).unwrap().to_rgba8();
    assert_eq!(image.get_pixel(1, 1), &Rgba([0, 80, 255, 255]));
}

#[test]
fn test_occlusion_map_is_reformatted() {
    let tmp = tempfile::tempdir().unwrap();
    let occlusion = gray_texture(tmp.path(), "ao.png", &[90]);
    let tuner = mapped_tuner(tmp.path(), &[(Channel::AmbientOcclusion, occlusion)]);
    assert!(tuner
        .registry()
        .write()
        .set_channel_intensity(SOURCE_MATERIAL, Channel::AmbientOcclusion, 0.6));
    let model = tile(&[TRIANGLE], &[100], &[SOURCE_MATERIAL]);

    let tuned = tune(&tuner, &model);
    let material = &tuned.root.materials[1];
    let occlusion = material.occlusion_texture.as_ref().unwrap();
    assert!(occlusion.index.value() < tuned.root.textures.len());
    assert_eq!(occlusion.strength.0, 0.6);
    assert!(material.pbr_metallic_roughness.metallic_roughness_texture.is_none());

    let files = synthesized(tmp.path(), "ao_", ".png");
    assert_eq!(files.len(), 1);
    let image = image::open(&files[0]).unwrap().to_rgba8();
    assert_eq!(image.get_pixel(0, 1), &Rgba([90, 90, 90, 255]));
}

#[test]
fn test_binary_alpha_map_masks_the_color() {
    let tmp = tempfile::tempdir().unwrap();
    let alpha = gray_texture(tmp.path(), "cutout.png", &[0, 255]);
    let tuner = mapped_tuner(tmp.path(), &[(Channel::Alpha, alpha)]);
    {
        let mut registry = tuner.registry().write();
        let map = ChannelMap::new(color_texture(tmp.path()), TextureSource::LocalDisk);
        assert!(registry.set_channel_color_map(SOURCE_MATERIAL, Channel::Color, map));
    }
    let model = tile(&[TRIANGLE], &[100], &[SOURCE_MATERIAL]);

    let tuned = tune(&tuner, &model);
    let material = &tuned.root.materials[1];
    assert_eq!(material.alpha_mode, Valid(AlphaMode::Mask));
    assert!(material.pbr_metallic_roughness.base_color_texture.is_some());
    assert_eq!(material.pbr_metallic_roughness.base_color_factor.0[3], 1.0);

    assert!(synthesized(tmp.path(), "c_", "_blend.png").is_empty());
    let files = synthesized(tmp.path(), "c_", "_masked.png");
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(!name.starts_with("c_none"), "{name}");
    let image = image::open(&files[0]).unwrap().to_rgba8();
    assert_eq!(image.get_pixel(0, 0)[3], 0);
    assert_eq!(image.get_pixel(1, 0), &Rgba([180, 60, 40, 255]));
}

#[test]
fn test_translucent_alpha_map_blends() {
    let tmp = tempfile::tempdir().unwrap();
    let alpha = gray_texture(tmp.path(), "glass.png", &[128]);
    let tuner = mapped_tuner(tmp.path(), &[(Channel::Alpha, alpha)]);
    let model = tile(&[TRIANGLE], &[100], &[SOURCE_MATERIAL]);

    let tuned = tune(&tuner, &model);
    let material = &tuned.root.materials[1];
    assert_eq!(material.alpha_mode, Valid(AlphaMode::Blend));
    assert!(material.pbr_metallic_roughness.base_color_texture.is_some());

    assert!(synthesized(tmp.path(), "c_", "_masked.png").is_empty());
    let files = synthesized(tmp.path(), "c_none-a_", "_blend.png");
    assert_eq!(files.len(), 1);
    let image = image::open(&files[0]).unwrap().to_rgba8();
    assert_eq!(image.get_pixel(0, 0), &Rgba([255, 255, 255, 128]));
}
