//! Re-clustering of primitive pieces.
//!
//! Every piece (point, line or triangle) of a primitive is routed to a cluster
//! by its [`ClusterKey`]. Each cluster later becomes one output primitive.

use super::rules::DerivedRules;
use crate::gltf::accessor::AccessorView;
use gltf_json::mesh::Mode;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

/// Topology of output primitives. Strips, loops and fans are expanded to lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topology {
    Points,
    Lines,
    Triangles,
}

impl Topology {
    pub fn from_mode(mode: Mode) -> Self {
        match mode {
            Mode::Points => Topology::Points,
            Mode::Lines | Mode::LineLoop | Mode::LineStrip => Topology::Lines,
            Mode::Triangles | Mode::TriangleStrip | Mode::TriangleFan => Topology::Triangles,
        }
    }

    pub fn mode(self) -> Mode {
        match self {
            Topology::Points => Mode::Points,
            Topology::Lines => Mode::Lines,
            Topology::Triangles => Mode::Triangles,
        }
    }
}

/// Identifies the cluster a piece is added to. Clusters are emitted in key order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    /// glTF material of the output primitive.
    pub material: Option<u32>,
    /// Source material, when primitives are split on it.
    pub source_material: Option<u64>,
    pub topology: Topology,
    pub has_normal: bool,
    pub has_uv: bool,
    pub has_color: bool,
    pub has_feature_id: bool,
    pub has_material_feature_id: bool,
    /// Element group the pieces belong to.
    pub group: Option<usize>,
}

/// Vertex data accumulated for one output primitive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cluster {
    pub indices: Vec<u32>,
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub uvs: Vec<[f32; 2]>,
    pub colors: Vec<[u8; 4]>,
    pub feature_ids: Vec<u32>,
}

/// Call `f` with the vertex-index positions of each piece of a primitive.
pub fn for_each_piece(mode: Mode, count: usize, mut f: impl FnMut(&[usize])) {
    match mode {
        Mode::Points => (0..count).for_each(|i| f(&[i])),
        Mode::Lines => (0..count / 2).for_each(|i| f(&[2 * i, 2 * i + 1])),
        Mode::LineLoop => (0..count).for_each(|i| f(&[i, (i + 1) % count])),
        Mode::LineStrip => (0..count.saturating_sub(1)).for_each(|i| f(&[i, i + 1])),
        Mode::Triangles => (0..count / 3).for_each(|i| f(&[3 * i, 3 * i + 1, 3 * i + 2])),
        // Winding alternates between consecutive strip triangles.
        Mode::TriangleStrip => {
            (0..count.saturating_sub(2)).for_each(|i| f(&[i, i + 1 + i % 2, i + 2 - i % 2]))
        }
        Mode::TriangleFan => (0..count.saturating_sub(2)).for_each(|i| f(&[i + 1, i + 2, 0])),
    }
}

/// Attribute views of one input primitive.
pub struct PrimitiveViews<'a> {
    pub positions: Box<dyn AccessorView<[f32; 3]> + 'a>,
    pub indices: Option<Box<dyn AccessorView<u32> + 'a>>,
    pub normals: Option<Box<dyn AccessorView<[f32; 3]> + 'a>>,
    pub uvs: Option<Box<dyn AccessorView<[f32; 2]> + 'a>>,
    pub colors: Option<Box<dyn AccessorView<[u8; 4]> + 'a>>,
    pub feature_ids: Option<Box<dyn AccessorView<u32> + 'a>>,
}

impl PrimitiveViews<'_> {
    fn index_count(&self) -> usize {
        match &self.indices {
            Some(indices) => indices.len(),
            None => self.positions.len(),
        }
    }

    fn vertex(&self, position: usize) -> u32 {
        match &self.indices {
            Some(indices) => indices.get(position),
            None => position as u32,
        }
    }

    /// Whether every optional attribute covers the vertex.
    fn is_valid_vertex(&self, vertex: u32) -> bool {
        let v = vertex as usize;
        v < self.positions.len()
            && self.normals.as_ref().map_or(true, |n| v < n.len())
            && self.uvs.as_ref().map_or(true, |n| v < n.len())
            && self.colors.as_ref().map_or(true, |n| v < n.len())
            && self.feature_ids.as_ref().map_or(true, |n| v < n.len())
    }
}

/// Properties of an input primitive that are shared by all its pieces.
#[derive(Debug, Clone, Copy)]
pub struct PrimitiveInfo {
    pub material: Option<u32>,
    pub mode: Mode,
    /// Whether the feature ids also index the material property table.
    pub has_material_feature_id: bool,
}

/// Property table columns and rules used to route pieces.
pub struct Grouping<'a> {
    pub rules: &'a DerivedRules,
    pub split_materials: &'a BTreeSet<u64>,
    pub elements: Option<&'a [u64]>,
    pub materials: Option<&'a [u64]>,
}

impl Grouping<'_> {
    fn key(&self, info: &PrimitiveInfo, views: &PrimitiveViews<'_>, first_vertex: u32) -> ClusterKey {
        let feature_id = views
            .feature_ids
            .as_ref()
            .filter(|_| self.elements.is_some())
            .map(|ids| ids.get(first_vertex as usize) as usize);
        let has_feature_id = feature_id.is_some();
        let has_material_feature_id = info.has_material_feature_id && has_feature_id && self.materials.is_some();
        debug_assert!(!info.has_material_feature_id || has_material_feature_id);

        // Pieces are assumed to share the element of their first vertex.
        let element = feature_id
            .and_then(|id| self.elements?.get(id).copied())
            .unwrap_or(0);
        let group = self.rules.group_of(element);

        let (material, source_material) = match group {
            Some((_, group)) => (group.material.or(info.material), group.source_material),
            None => {
                let source = feature_id
                    .filter(|_| has_material_feature_id)
                    .and_then(|id| self.materials?.get(id).copied());
                (info.material, source)
            }
        };

        ClusterKey {
            material,
            source_material: source_material.filter(|id| self.split_materials.contains(id)),
            topology: Topology::from_mode(info.mode),
            has_normal: views.normals.is_some(),
            has_uv: views.uvs.is_some(),
            has_color: views.colors.is_some(),
            has_feature_id,
            has_material_feature_id,
            group: group.map(|(index, _)| index),
        }
    }
}

/// Clusters of one mesh.
#[derive(Debug, Default)]
pub struct ClusterSet {
    clusters: BTreeMap<ClusterKey, Cluster>,
}

impl ClusterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route every piece of a primitive to its cluster.
    ///
    /// A vertex referenced several times is copied once into each cluster it
    /// lands in, and every reference points to that copy.
    pub fn add_primitive(&mut self, info: &PrimitiveInfo, views: &PrimitiveViews<'_>, grouping: &Grouping<'_>) {
        let mut remapped: HashMap<(ClusterKey, u32), u32> = HashMap::new();
        let mut skipped = 0usize;
        for_each_piece(info.mode, views.index_count(), |piece| {
            let vertices: Vec<u32> = piece.iter().map(|&p| views.vertex(p)).collect();
            if !vertices.iter().all(|&v| views.is_valid_vertex(v)) {
                skipped += 1;
                return;
            }
            let key = grouping.key(info, views, vertices[0]);
            let cluster = self.clusters.entry(key).or_default();
            for vertex in vertices {
                let index = *remapped
                    .entry((key, vertex))
                    .or_insert_with(|| push_vertex(cluster, views, vertex as usize));
                cluster.indices.push(index);
            }
        });
        if skipped > 0 {
            warn!("skipped {skipped} pieces referencing missing vertices");
        }
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Clusters in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&ClusterKey, &Cluster)> {
        self.clusters.iter()
    }
}

fn push_vertex(cluster: &mut Cluster, views: &PrimitiveViews<'_>, vertex: usize) -> u32 {
    cluster.positions.push(views.positions.get(vertex));
    if let Some(normals) = &views.normals {
        cluster.normals.push(normals.get(vertex));
    }
    if let Some(uvs) = &views.uvs {
        cluster.uvs.push(uvs.get(vertex));
    }
    if let Some(colors) = &views.colors {
        cluster.colors.push(colors.get(vertex));
    }
    if let Some(ids) = &views.feature_ids {
        cluster.feature_ids.push(ids.get(vertex));
    }
    (cluster.positions.len() - 1) as u32
}
