//! The tune pass: re-clusters the primitives of a glTF tile and bakes
//! customized materials into it.

pub mod cluster;
pub mod material_tuner;
pub mod rules;

pub use cluster::{Cluster, ClusterKey, ClusterSet};
pub use material_tuner::{MaterialConversion, MaterialTuner};
pub use rules::{DerivedRules, ElementGroup, Rules};

use crate::config::TunerConfig;
use crate::error::{Result, TunerError};
use crate::gltf::metadata::{MeshFeatures, StructuralMetadata, ELEMENT_PROPERTY, MATERIAL_PROPERTY, STRUCTURAL_METADATA};
use crate::gltf::{accessor, builder, feature_id_semantic, GltfBuilder, GltfModel};
use crate::material::{parse_material_id, MaterialRegistry};
use crate::texture::{FileTextureLoader, TextureLoader};
use cluster::{Grouping, PrimitiveInfo, PrimitiveViews};
use glam::{DMat4, DVec3, DVec4};
use gltf_json as json;
use json::mesh::{Mode, Semantic};
use json::validation::Checked::{self, Valid};
use material_tuner::TEXTURE_TRANSFORM;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Source material listed by a tileset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialInfo {
    pub id: u64,
    pub name: String,
}

/// Called once the material list of a tileset is parsed.
pub type MaterialInfoCallback = Box<dyn Fn(&[MaterialInfo]) + Send + Sync>;

#[derive(Default)]
struct TunerState {
    rules: Arc<Rules>,
    version: u64,
    derived: Arc<DerivedRules>,
    material_info: Vec<MaterialInfo>,
}

/// Tunes glTF tiles according to grouping rules and material customizations.
///
/// Rules can be replaced from any thread while a tune pass runs on another.
/// At most one tune pass should run at a time on a given tuner.
pub struct GltfTuner {
    state: Mutex<TunerState>,
    registry: Arc<MaterialRegistry>,
    loader: Arc<dyn TextureLoader>,
    config: TunerConfig,
    on_material_info: Option<MaterialInfoCallback>,
}

impl GltfTuner {
    /// Tuner with its own material registry.
    pub fn new(config: TunerConfig) -> Self {
        Self::with_registry(config, Arc::new(MaterialRegistry::new()))
    }

    /// Tuner sharing an existing material registry.
    pub fn with_registry(config: TunerConfig, registry: Arc<MaterialRegistry>) -> Self {
        if let Some(dir) = &config.texture_dir {
            registry.write().textures_mut().set_directory(dir);
        }
        Self {
            state: Mutex::new(TunerState::default()),
            registry,
            loader: Arc::new(FileTextureLoader),
            config,
            on_material_info: None,
        }
    }

    /// Use another source of texture bytes.
    pub fn with_loader(mut self, loader: Arc<dyn TextureLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn set_material_info_callback(&mut self, callback: MaterialInfoCallback) {
        self.on_material_info = Some(callback);
    }

    pub fn registry(&self) -> &Arc<MaterialRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    /// Replace the grouping rules. Lookups are recomputed by the next tune pass.
    pub fn set_rules(&self, rules: Rules) {
        let mut state = self.state.lock();
        state.rules = Arc::new(rules);
        state.version += 1;
    }

    pub fn rules_version(&self) -> u64 {
        self.state.lock().version
    }

    /// Rule lookups matching the latest rules.
    fn derived_rules(&self) -> Arc<DerivedRules> {
        let (rules, version) = {
            let state = self.state.lock();
            if state.derived.version == state.version {
                return state.derived.clone();
            }
            (state.rules.clone(), state.version)
        };
        let derived = Arc::new(DerivedRules::new(rules, version));
        debug!(
            "rebuilt element lookup for rules version {version} ({} groups)",
            derived.group_count()
        );
        let mut state = self.state.lock();
        if state.derived.version < version {
            state.derived = derived.clone();
        }
        derived
    }

    /// Re-cluster the primitives of a tile and convert its customized materials.
    ///
    /// `root_translation` is removed from `tile_transform` so that texture
    /// coordinates synthesized from world positions keep their precision.
    pub fn tune(&self, model: &GltfModel, tile_transform: DMat4, root_translation: DVec3) -> Result<GltfModel> {
        if model.buffers.len() != model.root.buffers.len() {
            return Err(TunerError::InvalidGltf(format!(
                "{} buffers declared but {} loaded",
                model.root.buffers.len(),
                model.buffers.len()
            )));
        }
        let rules = self.derived_rules();
        let split_materials: BTreeSet<u64> = rules
            .rules
            .split_materials
            .union(&self.config.split_materials)
            .copied()
            .collect();
        let mut tile_transform = tile_transform;
        tile_transform.w_axis -= DVec4::from((root_translation, 0.0));

        TunePass {
            model,
            rules: &rules,
            split_materials: &split_materials,
            tile_transform,
            registry: &self.registry,
            loader: self.loader.as_ref(),
        }
        .run()
    }

    /// Read the source material list a tileset carries in `asset.extras.iTwinMaterials`.
    ///
    /// Returns false when the tileset has no such list. Entries without id or
    /// name are skipped.
    pub fn parse_tileset_json(&self, tileset: &Value) -> bool {
        let Some(entries) = tileset
            .pointer("/asset/extras/iTwinMaterials")
            .and_then(Value::as_array)
        else {
            return false;
        };
        let materials: Vec<MaterialInfo> = entries
            .iter()
            .filter_map(|entry| {
                Some(MaterialInfo {
                    id: parse_material_id(entry.get("id")?)?,
                    name: entry.get("name")?.as_str()?.to_string(),
                })
            })
            .collect();
        debug!("tileset lists {} source materials", materials.len());
        self.state.lock().material_info = materials.clone();
        if let Some(callback) = &self.on_material_info {
            callback(&materials);
        }
        true
    }

    pub fn material_info(&self) -> Vec<MaterialInfo> {
        self.state.lock().material_info.clone()
    }

    pub fn has_material_info(&self) -> bool {
        !self.state.lock().material_info.is_empty()
    }
}

/// Property tables located in the input model.
struct Tables {
    elements: Option<Vec<u64>>,
    materials: Option<Vec<u64>>,
    /// Input table index of the element and material columns.
    element_table: Option<usize>,
    material_table: Option<usize>,
    /// Output table index of the element and material columns.
    element_output: Option<u32>,
    material_output: Option<u32>,
}

struct TunePass<'a> {
    model: &'a GltfModel,
    rules: &'a DerivedRules,
    split_materials: &'a BTreeSet<u64>,
    tile_transform: DMat4,
    registry: &'a MaterialRegistry,
    loader: &'a dyn TextureLoader,
}

impl<'a> TunePass<'a> {
    fn run(self) -> Result<GltfModel> {
        let input = &self.model.root;
        let mut builder = GltfBuilder::new();
        let (tables, metadata) = self.locate_tables(&mut builder);
        let images = self.relocate_images(&mut builder);
        let mut materials = MaterialTuner::new(
            self.registry,
            self.loader,
            input.materials.clone(),
            input.textures.clone(),
            images,
        );

        let mut meshes = Vec::with_capacity(input.meshes.len());
        let mut primitive_count = 0;
        for (mesh_index, mesh) in input.meshes.iter().enumerate() {
            let mut clusters = ClusterSet::new();
            let grouping = Grouping {
                rules: self.rules,
                split_materials: self.split_materials,
                elements: tables.elements.as_deref(),
                materials: tables.materials.as_deref(),
            };
            for primitive in &mesh.primitives {
                self.add_primitive(primitive, &tables, &grouping, &mut clusters);
            }

            let primitives: Vec<json::mesh::Primitive> = clusters
                .iter()
                .map(|(key, cluster)| {
                    self.emit_primitive(mesh_index, key, cluster, &tables, &mut materials, &mut builder)
                })
                .collect();
            primitive_count += primitives.len();
            meshes.push(json::Mesh {
                primitives,
                weights: None,
                ..mesh.clone()
            });
        }

        let tuned = materials.finish();
        let mut root = json::Root {
            asset: input.asset.clone(),
            cameras: input.cameras.clone(),
            nodes: input.nodes.clone(),
            samplers: input.samplers.clone(),
            scene: input.scene,
            scenes: input.scenes.clone(),
            extensions_used: input.extensions_used.clone(),
            extensions_required: input.extensions_required.clone(),
            extras: input.extras.clone(),
            materials: tuned.materials,
            textures: tuned.textures,
            images: tuned.images,
            meshes,
            ..Default::default()
        };
        // Skins are not carried over.
        for node in &mut root.nodes {
            node.skin = None;
        }
        if tuned.uses_texture_transform && !root.extensions_used.iter().any(|e| e == TEXTURE_TRANSFORM) {
            root.extensions_used.push(TEXTURE_TRANSFORM.to_string());
        }
        if let Some(metadata) = metadata {
            root.extensions
                .get_or_insert_with(Default::default)
                .others
                .insert(STRUCTURAL_METADATA.to_string(), metadata.to_value());
        }

        debug!(
            "tuned {} meshes into {primitive_count} primitives, {} materials",
            root.meshes.len(),
            root.materials.len()
        );
        Ok(builder.finish(root))
    }

    /// Find the element and material tables, and copy them to the output buffer.
    fn locate_tables(&self, builder: &mut GltfBuilder) -> (Tables, Option<StructuralMetadata>) {
        let mut tables = Tables {
            elements: None,
            materials: None,
            element_table: None,
            material_table: None,
            element_output: None,
            material_output: None,
        };
        let Some(metadata) = StructuralMetadata::from_root(&self.model.root) else {
            return (tables, None);
        };

        let element_table = metadata.find_table(ELEMENT_PROPERTY, 0);
        // Material ids usually come in the table after the element ids.
        let material_start = if element_table == Some(0) { 1 } else { 0 };
        let material_table = metadata.find_table(MATERIAL_PROPERTY, material_start);

        let mut copied = Vec::new();
        for table in [element_table, material_table].into_iter().flatten() {
            if !copied.contains(&table) {
                copied.push(table);
            }
        }
        if copied.is_empty() {
            return (tables, None);
        }
        let output_index = |table: Option<usize>| {
            table.and_then(|t| copied.iter().position(|&c| c == t)).map(|p| p as u32)
        };

        tables.elements = element_table.and_then(|t| metadata.read_column(self.model, t, ELEMENT_PROPERTY));
        tables.materials = material_table.and_then(|t| metadata.read_column(self.model, t, MATERIAL_PROPERTY));
        tables.element_table = element_table;
        tables.material_table = material_table;
        tables.element_output = output_index(element_table);
        tables.material_output = output_index(material_table);

        let relocated = metadata.relocate(self.model, &copied, builder);
        (tables, Some(relocated))
    }

    /// Images stored in buffer views, moved into the output buffer.
    fn relocate_images(&self, builder: &mut GltfBuilder) -> Vec<json::Image> {
        self.model
            .root
            .images
            .iter()
            .map(|image| {
                let mut image = image.clone();
                if let Some(view) = image.buffer_view {
                    match builder.copy_buffer_view(self.model, view.value()) {
                        Some(relocated) => image.buffer_view = Some(json::Index::new(relocated)),
                        None => {
                            warn!("image buffer view {} is out of range", view.value());
                            image.buffer_view = None;
                        }
                    }
                }
                image
            })
            .collect()
    }

    fn attribute(&self, primitive: &json::mesh::Primitive, semantic: Checked<Semantic>) -> Option<usize> {
        primitive.attributes.get(&semantic).map(|index| index.value())
    }

    /// Accessor of the feature ids pointing at an input property table.
    fn feature_attribute(&self, primitive: &json::mesh::Primitive, table: Option<usize>) -> Option<usize> {
        let set = MeshFeatures::from_primitive(primitive)?.attribute_for_table(table?)?;
        self.attribute(primitive, feature_id_semantic(set)?)
    }

    fn add_primitive(
        &self,
        primitive: &json::mesh::Primitive,
        tables: &Tables,
        grouping: &Grouping<'_>,
        clusters: &mut ClusterSet,
    ) {
        let model = self.model;
        let Some(positions) = self
            .attribute(primitive, Valid(Semantic::Positions))
            .and_then(|a| accessor::vec3(model, a))
        else {
            warn!("skipping primitive without usable positions");
            return;
        };
        let indices = match primitive.indices {
            Some(index) => match accessor::indices(model, index.value()) {
                Some(view) => Some(view),
                None => {
                    warn!("skipping primitive with unusable indices {}", index.value());
                    return;
                }
            },
            None => None,
        };

        let element_attribute = tables
            .elements
            .as_ref()
            .and_then(|_| self.feature_attribute(primitive, tables.element_table));
        let material_attribute = tables
            .materials
            .as_ref()
            .and_then(|_| self.feature_attribute(primitive, tables.material_table));
        debug_assert!(material_attribute.is_none() || material_attribute == element_attribute);
        let feature_ids = element_attribute.and_then(|a| accessor::feature_ids(model, a));

        let info = PrimitiveInfo {
            material: primitive.material.map(|m| m.value() as u32),
            mode: match primitive.mode {
                Valid(mode) => mode,
                _ => Mode::Triangles,
            },
            has_material_feature_id: material_attribute.is_some() && feature_ids.is_some(),
        };
        let views = PrimitiveViews {
            positions,
            indices,
            normals: self
                .attribute(primitive, Valid(Semantic::Normals))
                .and_then(|a| accessor::vec3(model, a)),
            uvs: self
                .attribute(primitive, Valid(Semantic::TexCoords(0)))
                .and_then(|a| accessor::vec2(model, a)),
            colors: self
                .attribute(primitive, Valid(Semantic::Colors(0)))
                .and_then(|a| accessor::colors(model, a)),
            feature_ids,
        };
        clusters.add_primitive(&info, &views, grouping);
    }

    fn emit_primitive(
        &self,
        mesh_index: usize,
        key: &ClusterKey,
        cluster: &Cluster,
        tables: &Tables,
        materials: &mut MaterialTuner<'_>,
        builder: &mut GltfBuilder,
    ) -> json::mesh::Primitive {
        let mut conversion = MaterialConversion {
            material: key.material,
            override_color: false,
        };
        if let (Some(source), Some(_)) = (key.source_material, key.material) {
            conversion = materials.convert_material(source, key.material, &cluster.colors, builder);
        }
        let custom_material = conversion.material.is_some() && conversion.material != key.material;

        let indices = builder.add_indices(&cluster.indices);
        let mut attributes = vec![(Semantic::Positions, builder.add_positions(&cluster.positions))];
        if !cluster.normals.is_empty() {
            attributes.push((Semantic::Normals, builder.add_normals(&cluster.normals)));
        }
        if !cluster.uvs.is_empty() {
            attributes.push((Semantic::TexCoords(0), builder.add_uvs(&cluster.uvs)));
        } else if custom_material && conversion.material.is_some_and(|m| materials.material_uses_textures(m)) {
            let uvs = self.fast_uvs(mesh_index, cluster);
            attributes.push((Semantic::TexCoords(0), builder.add_uvs(&uvs)));
        }
        if !cluster.colors.is_empty() && !conversion.override_color {
            attributes.push((Semantic::Colors(0), builder.add_colors(&cluster.colors)));
        }

        let mut primitive = builder::primitive(attributes, Some(indices), conversion.material, key.topology.mode());
        if !cluster.feature_ids.is_empty() {
            let accessor = builder.add_feature_ids(&cluster.feature_ids);
            let property_tables: Vec<u32> = [
                tables.element_output,
                tables.material_output.filter(|_| key.has_material_feature_id),
            ]
            .into_iter()
            .flatten()
            .collect();
            builder::set_feature_ids(&mut primitive, accessor, &cluster.feature_ids, &property_tables);
        }
        if let Some(source) = key.source_material {
            primitive.extras = serde_json::value::to_raw_value(&serde_json::json!({
                "itwinMaterialId": format!("{source:#x}"),
            }))
            .ok();
        }
        primitive
    }

    /// Planar texture coordinates, anchored on the first node showing the mesh.
    fn fast_uvs(&self, mesh_index: usize, cluster: &Cluster) -> Vec<[f32; 2]> {
        let node = self
            .model
            .root
            .nodes
            .iter()
            .find(|node| node.mesh.is_some_and(|m| m.value() == mesh_index));
        let to_world = match node {
            Some(node) => self.tile_transform * builder::node_matrix(node),
            None => {
                warn!("no node shows mesh {mesh_index}");
                self.tile_transform
            }
        };
        let anchor = to_world.transform_point3(DVec3::ZERO);
        builder::fast_uvs(&cluster.positions, &cluster.normals, &cluster.indices, to_world, anchor)
    }
}
