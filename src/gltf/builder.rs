//! Incremental construction of a single-buffer glTF model.

use super::{feature_id_semantic, GltfModel};
use gltf_json as json;
use glam::{DMat4, DQuat, DVec3};
use json::accessor::{ComponentType, Type};
use json::buffer::Target;
use json::validation::Checked::Valid;
use json::validation::USize64;
use std::collections::BTreeSet;

/// Appends vertex data, index data and embedded blobs to one binary buffer,
/// creating the buffer views and accessors that describe them.
#[derive(Debug, Default)]
pub struct GltfBuilder {
    buffer: Vec<u8>,
    buffer_views: Vec<json::buffer::View>,
    accessors: Vec<json::Accessor>,
}

impl GltfBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes as a new buffer view, aligned to 4 bytes. Returns the view index.
    pub fn add_buffer_view(&mut self, bytes: &[u8], byte_stride: Option<usize>, target: Option<Target>) -> u32 {
        let padding = (4 - (self.buffer.len() % 4)) % 4;
        self.buffer.extend(std::iter::repeat(0u8).take(padding));
        let offset = self.buffer.len();
        self.buffer.extend_from_slice(bytes);

        self.buffer_views.push(json::buffer::View {
            buffer: json::Index::new(0),
            byte_length: USize64(bytes.len() as u64),
            byte_offset: Some(USize64(offset as u64)),
            byte_stride: byte_stride.map(json::buffer::Stride),
            extensions: Default::default(),
            extras: Default::default(),
            target: target.map(Valid),
        });
        (self.buffer_views.len() - 1) as u32
    }

    /// Copy a buffer view of another model into this buffer. Returns the new view index.
    pub fn copy_buffer_view(&mut self, source: &GltfModel, view_index: usize) -> Option<u32> {
        let data = source.buffer_view_data(view_index)?;
        let view = &source.root.buffer_views[view_index];
        let stride = view.byte_stride.map(|s| s.0);
        let target = match view.target {
            Some(Valid(target)) => Some(target),
            _ => None,
        };
        Some(self.add_buffer_view(data, stride, target))
    }

    /// Describe data of a buffer view. Returns the accessor index.
    pub fn add_accessor(
        &mut self,
        buffer_view: u32,
        count: usize,
        component_type: ComponentType,
        type_: Type,
        normalized: bool,
        bounds: Option<(Vec<f64>, Vec<f64>)>,
    ) -> u32 {
        let (min, max) = bounds.map_or((None, None), |(min, max)| {
            (Some(json::Value::from(min)), Some(json::Value::from(max)))
        });
        self.accessors.push(json::Accessor {
            buffer_view: Some(json::Index::new(buffer_view)),
            byte_offset: Some(USize64(0)),
            count: USize64(count as u64),
            component_type: Valid(json::accessor::GenericComponentType(component_type)),
            extensions: Default::default(),
            extras: Default::default(),
            type_: Valid(type_),
            min,
            max,
            normalized,
            sparse: None,
        });
        (self.accessors.len() - 1) as u32
    }

    /// Add an index buffer using the narrowest component type able to hold every index.
    pub fn add_indices(&mut self, indices: &[u32]) -> u32 {
        let max = indices.iter().copied().max().unwrap_or(0);
        let (bytes, component_type): (Vec<u8>, _) = if max <= u8::MAX as u32 {
            (indices.iter().map(|&i| i as u8).collect(), ComponentType::U8)
        } else if max <= u16::MAX as u32 {
            (indices.iter().flat_map(|&i| (i as u16).to_le_bytes()).collect(), ComponentType::U16)
        } else {
            (indices.iter().flat_map(|i| i.to_le_bytes()).collect(), ComponentType::U32)
        };
        let view = self.add_buffer_view(&bytes, None, Some(Target::ElementArrayBuffer));
        let bounds = (!indices.is_empty()).then(|| {
            let min = indices.iter().copied().min().unwrap_or(0);
            (vec![min as f64], vec![max as f64])
        });
        self.add_accessor(view, indices.len(), component_type, Type::Scalar, false, bounds)
    }

    /// Add vertex positions, with the bounds glTF requires.
    pub fn add_positions(&mut self, positions: &[[f32; 3]]) -> u32 {
        let bounds = vec3_bounds(positions);
        self.add_vertex_floats(positions, Type::Vec3, bounds)
    }

    pub fn add_normals(&mut self, normals: &[[f32; 3]]) -> u32 {
        self.add_vertex_floats(normals, Type::Vec3, None)
    }

    pub fn add_uvs(&mut self, uvs: &[[f32; 2]]) -> u32 {
        self.add_vertex_floats(uvs, Type::Vec2, None)
    }

    /// Add RGBA8 vertex colors as normalized unsigned bytes.
    pub fn add_colors(&mut self, colors: &[[u8; 4]]) -> u32 {
        let bytes: Vec<u8> = colors.iter().flatten().copied().collect();
        let view = self.add_buffer_view(&bytes, None, Some(Target::ArrayBuffer));
        self.add_accessor(view, colors.len(), ComponentType::U8, Type::Vec4, true, None)
    }

    /// Add feature identifiers, stored as floats.
    pub fn add_feature_ids(&mut self, ids: &[u32]) -> u32 {
        let values: Vec<[f32; 1]> = ids.iter().map(|&id| [id as f32]).collect();
        self.add_vertex_floats(&values, Type::Scalar, None)
    }

    fn add_vertex_floats<const N: usize>(
        &mut self,
        values: &[[f32; N]],
        type_: Type,
        bounds: Option<(Vec<f64>, Vec<f64>)>,
    ) -> u32 {
        let bytes: Vec<u8> = values.iter().flatten().flat_map(|v| v.to_le_bytes()).collect();
        let view = self.add_buffer_view(&bytes, None, Some(Target::ArrayBuffer));
        self.add_accessor(view, values.len(), ComponentType::F32, type_, false, bounds)
    }

    pub fn buffer_view_count(&self) -> usize {
        self.buffer_views.len()
    }

    /// Complete `root` with the buffer, buffer views and accessors built so far.
    pub fn finish(self, mut root: json::Root) -> GltfModel {
        root.buffers = vec![json::Buffer {
            byte_length: USize64(self.buffer.len() as u64),
            extensions: Default::default(),
            extras: Default::default(),
            uri: None,
        }];
        root.buffer_views = self.buffer_views;
        root.accessors = self.accessors;
        GltfModel::new(root, vec![self.buffer])
    }
}

fn vec3_bounds(values: &[[f32; 3]]) -> Option<(Vec<f64>, Vec<f64>)> {
    let first = values.first()?;
    let mut min = first.map(f64::from);
    let mut max = min;
    for value in values {
        for i in 0..3 {
            min[i] = min[i].min(value[i] as f64);
            max[i] = max[i].max(value[i] as f64);
        }
    }
    Some((min.to_vec(), max.to_vec()))
}

/// Primitive with the given attributes, indices and material.
pub fn primitive(
    attributes: impl IntoIterator<Item = (json::mesh::Semantic, u32)>,
    indices: Option<u32>,
    material: Option<u32>,
    mode: json::mesh::Mode,
) -> json::mesh::Primitive {
    json::mesh::Primitive {
        attributes: attributes
            .into_iter()
            .map(|(semantic, accessor)| (Valid(semantic), json::Index::new(accessor)))
            .collect(),
        extensions: Default::default(),
        extras: Default::default(),
        indices: indices.map(json::Index::new),
        material: material.map(json::Index::new),
        mode: Valid(mode),
        targets: None,
    }
}

/// Attach `_FEATURE_ID_0` to a primitive, and `EXT_mesh_features` entries
/// pointing each given property table at it.
pub fn set_feature_ids(
    primitive: &mut json::mesh::Primitive,
    accessor: u32,
    ids: &[u32],
    property_tables: &[u32],
) {
    let Some(semantic) = feature_id_semantic(0) else {
        return;
    };
    primitive.attributes.insert(semantic, json::Index::new(accessor));
    let feature_count = ids.iter().collect::<BTreeSet<_>>().len();
    let feature_ids: Vec<json::Value> = property_tables
        .iter()
        .map(|&table| {
            serde_json::json!({
                "featureCount": feature_count,
                "attribute": 0,
                "propertyTable": table,
            })
        })
        .collect();
    primitive
        .extensions
        .get_or_insert_with(Default::default)
        .others
        .insert(
            "EXT_mesh_features".to_string(),
            serde_json::json!({ "featureIds": feature_ids }),
        );
}

/// Local transformation of a node.
pub fn node_matrix(node: &json::Node) -> DMat4 {
    if let Some(m) = node.matrix {
        return DMat4::from_cols_array(&m.map(f64::from));
    }
    let translation = node.translation.map_or(DVec3::ZERO, |t| DVec3::from(t.map(f64::from)));
    let rotation = node.rotation.map_or(DQuat::IDENTITY, |r| {
        let [x, y, z, w] = r.0.map(f64::from);
        DQuat::from_xyzw(x, y, z, w)
    });
    let scale = node.scale.map_or(DVec3::ONE, |s| DVec3::from(s.map(f64::from)));
    DMat4::from_scale_rotation_translation(scale, rotation, translation)
}

/// Planar texture coordinates for geometry exported without any.
///
/// Each vertex is projected on the world plane most facing its normal, at one
/// texture repeat per world unit. Coordinates are offset by a whole number of
/// repeats taken from `anchor`, which keeps them small without breaking
/// continuity between tiles.
pub fn fast_uvs(
    positions: &[[f32; 3]],
    normals: &[[f32; 3]],
    indices: &[u32],
    to_world: DMat4,
    anchor: DVec3,
) -> Vec<[f32; 2]> {
    let world: Vec<DVec3> = positions
        .iter()
        .map(|p| to_world.transform_point3(DVec3::from(p.map(f64::from))))
        .collect();

    let world_normals: Vec<DVec3> = if normals.len() == positions.len() {
        normals
            .iter()
            .map(|n| to_world.transform_vector3(DVec3::from(n.map(f64::from))))
            .collect()
    } else {
        let mut accumulated = vec![DVec3::ZERO; positions.len()];
        for triangle in indices.chunks_exact(3) {
            let [a, b, c] = [triangle[0], triangle[1], triangle[2]].map(|i| i as usize);
            if a.max(b).max(c) >= world.len() {
                continue;
            }
            let face = (world[b] - world[a]).cross(world[c] - world[a]);
            for i in [a, b, c] {
                accumulated[i] += face;
            }
        }
        accumulated
    };

    let origin = anchor.floor();
    world
        .iter()
        .zip(world_normals)
        .map(|(p, n)| {
            let local = *p - origin;
            let n = n.abs();
            let uv = if n.x >= n.y && n.x >= n.z {
                [local.y, local.z]
            } else if n.y >= n.z {
                [local.x, local.z]
            } else {
                [local.x, local.y]
            };
            uv.map(|v| v as f32)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gltf::accessor;
    use approx::assert_relative_eq;

    #[test]
    fn test_buffer_views_are_aligned() {
        let mut builder = GltfBuilder::new();
        builder.add_buffer_view(&[1, 2, 3], None, None);
        builder.add_buffer_view(&[4], None, None);
        let model = builder.finish(json::Root::default());

        assert_eq!(model.root.buffer_views[1].byte_offset, Some(USize64(4)));
        assert_eq!(model.buffers[0], vec![1, 2, 3, 0, 4]);
        assert_eq!(model.root.buffers[0].byte_length, USize64(5));
    }

    #[test]
    fn test_narrowest_index_type() {
        let mut builder = GltfBuilder::new();
        let small = builder.add_indices(&[0, 1, 255]);
        let medium = builder.add_indices(&[0, 256]);
        let large = builder.add_indices(&[0, 65_536]);
        let model = builder.finish(json::Root::default());

        let component = |i: u32| match &model.root.accessors[i as usize].component_type {
            Valid(c) => c.0,
            _ => unreachable!(),
        };
        assert_eq!(component(small), ComponentType::U8);
        assert_eq!(component(medium), ComponentType::U16);
        assert_eq!(component(large), ComponentType::U32);
    }

    #[test]
    fn test_position_bounds() {
        let mut builder = GltfBuilder::new();
        let positions = builder.add_positions(&[[0.0, 5.0, -1.0], [2.0, -3.0, 4.0]]);
        let model = builder.finish(json::Root::default());
        let accessor = &model.root.accessors[positions as usize];
        assert_eq!(accessor.min, Some(json::Value::from(vec![0.0, -3.0, -1.0])));
        assert_eq!(accessor.max, Some(json::Value::from(vec![2.0, 5.0, 4.0])));
    }

    #[test]
    fn test_copy_buffer_view() {
        let mut source = GltfBuilder::new();
        source.add_buffer_view(&[9, 9], None, None);
        let source = source.finish(json::Root::default());

        let mut builder = GltfBuilder::new();
        builder.add_buffer_view(&[1], None, None);
        let copied = builder.copy_buffer_view(&source, 0).unwrap();
        assert!(builder.copy_buffer_view(&source, 4).is_none());
        let model = builder.finish(json::Root::default());
        assert_eq!(model.buffer_view_data(copied as usize), Some(&[9u8, 9][..]));
    }

    #[test]
    fn test_feature_ids_extension() {
        let mut builder = GltfBuilder::new();
        let ids = [4, 4, 9];
        let accessor = builder.add_feature_ids(&ids);
        let mut prim = primitive([], None, None, json::mesh::Mode::Triangles);
        set_feature_ids(&mut prim, accessor, &ids, &[0, 1]);

        let ext = &prim.extensions.as_ref().unwrap().others["EXT_mesh_features"];
        assert_eq!(ext["featureIds"].as_array().unwrap().len(), 2);
        assert_eq!(ext["featureIds"][0]["featureCount"], 2);
        assert_eq!(ext["featureIds"][1]["propertyTable"], 1);
        assert!(prim.attributes.contains_key(&feature_id_semantic(0).unwrap()));

        let model = builder.finish(json::Root::default());
        let view = accessor::feature_ids(&model, accessor as usize).unwrap();
        assert_eq!(view.get(2), 9);
    }

    #[test]
    fn test_fast_uvs_follow_dominant_axis() {
        // Triangle in the XY plane, no normals given.
        let positions = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 2.0, 0.0]];
        let uvs = fast_uvs(&positions, &[], &[0, 1, 2], DMat4::IDENTITY, DVec3::ZERO);
        assert_eq!(uvs, vec![[0.0, 0.0], [1.0, 0.0], [0.0, 2.0]]);

        // Vertical wall facing X, translated far away.
        let normals = [[1.0, 0.0, 0.0]; 3];
        let to_world = DMat4::from_translation(DVec3::new(1000.0, 1000.5, 0.0));
        let uvs = fast_uvs(&positions, &normals, &[0, 1, 2], to_world, DVec3::new(1000.0, 1000.5, 0.0));
        assert_relative_eq!(uvs[2][0], 2.5);
        assert_relative_eq!(uvs[2][1], 0.0);
    }

    #[test]
    fn test_node_matrix_from_trs() {
        let node = json::Node {
            camera: None,
            children: None,
            extensions: Default::default(),
            extras: Default::default(),
            matrix: None,
            mesh: None,
            rotation: None,
            scale: Some([2.0, 2.0, 2.0]),
            translation: Some([1.0, 0.0, 0.0]),
            skin: None,
            weights: None,
        };
        let p = node_matrix(&node).transform_point3(DVec3::new(1.0, 1.0, 1.0));
        assert_eq!(p, DVec3::new(3.0, 2.0, 2.0));
    }
}
