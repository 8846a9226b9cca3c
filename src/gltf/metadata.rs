//! `EXT_structural_metadata` property tables and `EXT_mesh_features` feature ids.

use super::builder::GltfBuilder;
use super::GltfModel;
use gltf_json as json;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

pub const STRUCTURAL_METADATA: &str = "EXT_structural_metadata";
pub const MESH_FEATURES: &str = "EXT_mesh_features";

/// Property holding element identifiers.
pub const ELEMENT_PROPERTY: &str = "element";
/// Property holding source material identifiers.
pub const MATERIAL_PROPERTY: &str = "material";

/// Model-level structural metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuralMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub property_tables: Vec<PropertyTable>,
    #[serde(flatten)]
    pub others: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyTable {
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyTableProperty>,
    #[serde(flatten)]
    pub others: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyTableProperty {
    pub values: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_offsets: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_offsets: Option<u32>,
    #[serde(flatten)]
    pub others: Map<String, Value>,
}

/// Primitive-level feature id sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshFeatures {
    #[serde(default)]
    pub feature_ids: Vec<FeatureId>,
    #[serde(flatten)]
    pub others: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureId {
    #[serde(default)]
    pub feature_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_table: Option<u32>,
    #[serde(flatten)]
    pub others: Map<String, Value>,
}

impl StructuralMetadata {
    /// Metadata of a model, if present and well-formed.
    pub fn from_root(root: &json::Root) -> Option<Self> {
        let value = root.extensions.as_ref()?.others.get(STRUCTURAL_METADATA)?;
        serde_json::from_value(value.clone())
            .map_err(|e| warn!("ignoring malformed {STRUCTURAL_METADATA}: {e}"))
            .ok()
    }

    /// First property table, from `start` on, exposing the given property.
    pub fn find_table(&self, property: &str, start: usize) -> Option<usize> {
        self.property_tables
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, table)| table.properties.contains_key(property))
            .map(|(index, _)| index)
    }

    fn component_type(&self, table: &PropertyTable, property: &str) -> Option<String> {
        self.schema
            .as_ref()?
            .get("classes")?
            .get(&table.class)?
            .get("properties")?
            .get(property)?
            .get("componentType")?
            .as_str()
            .map(str::to_string)
    }

    /// Values of a scalar integer property. Component types default to UINT64.
    ///
    /// Signed values are sign-extended, so negative ids keep their 64-bit two's
    /// complement form.
    pub fn read_column(&self, model: &GltfModel, table_index: usize, property: &str) -> Option<Vec<u64>> {
        let table = self.property_tables.get(table_index)?;
        let column = table.properties.get(property)?;
        let data = model.buffer_view_data(column.values as usize)?;
        let component = self.component_type(table, property);
        let (size, signed) = match component.as_deref() {
            Some("UINT8") => (1, false),
            Some("INT8") => (1, true),
            Some("UINT16") => (2, false),
            Some("INT16") => (2, true),
            Some("UINT32" | "FLOAT32") => (4, false),
            Some("INT32") => (4, true),
            _ => (8, false),
        };
        let count = table.count as usize;
        if data.len() < count * size {
            warn!("property {property} of table {table_index} exceeds its buffer view");
            return None;
        }
        let values = data
            .chunks_exact(size)
            .take(count)
            .map(|chunk| {
                let negative = signed && chunk[size - 1] & 0x80 != 0;
                let mut bytes = [if negative { 0xff } else { 0 }; 8];
                bytes[..size].copy_from_slice(chunk);
                u64::from_le_bytes(bytes)
            })
            .collect();
        Some(values)
    }

    /// Copy the given tables into `builder`'s buffer.
    ///
    /// Property data is appended by property name order, so identical inputs
    /// produce identical buffers. The schema is kept; other property tables,
    /// textures and attributes are dropped since they reference the old buffer.
    pub fn relocate(&self, source: &GltfModel, tables: &[usize], builder: &mut GltfBuilder) -> Self {
        let mut relocate_view = |view: u32| {
            builder
                .copy_buffer_view(source, view as usize)
                .unwrap_or_else(|| {
                    warn!("property table buffer view {view} is out of range");
                    view
                })
        };
        let property_tables = tables
            .iter()
            .filter_map(|&index| self.property_tables.get(index))
            .map(|table| {
                let mut table = table.clone();
                for property in table.properties.values_mut() {
                    property.values = relocate_view(property.values);
                    property.array_offsets = property.array_offsets.map(&mut relocate_view);
                    property.string_offsets = property.string_offsets.map(&mut relocate_view);
                }
                table
            })
            .collect();
        Self {
            schema: self.schema.clone(),
            schema_uri: self.schema_uri.clone(),
            property_tables,
            others: Map::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl MeshFeatures {
    pub fn from_primitive(primitive: &json::mesh::Primitive) -> Option<Self> {
        let value = primitive.extensions.as_ref()?.others.get(MESH_FEATURES)?;
        serde_json::from_value(value.clone())
            .map_err(|e| warn!("ignoring malformed {MESH_FEATURES}: {e}"))
            .ok()
    }

    /// Attribute set index of the feature ids pointing at the given property table.
    pub fn attribute_for_table(&self, table: usize) -> Option<u32> {
        self.feature_ids
            .iter()
            .find(|f| f.property_table == Some(table as u32))?
            .attribute
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn model_with_tables() -> GltfModel {
        let mut builder = GltfBuilder::new();
        let elements: Vec<u8> = [10u64, 20, 30].iter().flat_map(|v| v.to_le_bytes()).collect();
        let categories: Vec<u8> = [1u32, 2, 3].iter().flat_map(|v| v.to_le_bytes()).collect();
        let materials: Vec<u8> = [0x7u64, 0x8].iter().flat_map(|v| v.to_le_bytes()).collect();
        let elements = builder.add_buffer_view(&elements, None, None);
        let categories = builder.add_buffer_view(&categories, None, None);
        let materials = builder.add_buffer_view(&materials, None, None);

        let metadata = json!({
            "schema": {"classes": {
                "features": {"properties": {
                    "element": {"type": "SCALAR", "componentType": "UINT64"},
                    "category": {"type": "SCALAR", "componentType": "UINT32"}
                }},
                "materials": {"properties": {"material": {"type": "SCALAR", "componentType": "UINT64"}}}
            }},
            "propertyTables": [
                {"class": "features", "count": 3, "properties": {
                    "element": {"values": elements}, "category": {"values": categories}
                }},
                {"class": "materials", "count": 2, "properties": {"material": {"values": materials}}}
            ],
            "propertyTextures": [{"class": "features"}]
        });
        let mut root = json::Root::default();
        root.extensions
            .get_or_insert_with(Default::default)
            .others
            .insert(STRUCTURAL_METADATA.to_string(), metadata);
        builder.finish(root)
    }

    #[test]
    fn test_find_and_read_tables() {
        let model = model_with_tables();
        let metadata = StructuralMetadata::from_root(&model.root).unwrap();

        let element_table = metadata.find_table(ELEMENT_PROPERTY, 0).unwrap();
        assert_eq!(element_table, 0);
        assert_eq!(metadata.find_table(MATERIAL_PROPERTY, 1), Some(1));
        assert_eq!(metadata.find_table("missing", 0), None);

        assert_eq!(metadata.read_column(&model, 0, ELEMENT_PROPERTY), Some(vec![10, 20, 30]));
        assert_eq!(metadata.read_column(&model, 0, "category"), Some(vec![1, 2, 3]));
        assert_eq!(metadata.read_column(&model, 1, MATERIAL_PROPERTY), Some(vec![7, 8]));
    }

    #[test]
    fn test_relocation_orders_by_property_name() {
        let model = model_with_tables();
        let metadata = StructuralMetadata::from_root(&model.root).unwrap();

        let mut builder = GltfBuilder::new();
        let relocated = metadata.relocate(&model, &[0], &mut builder);
        let output = builder.finish(json::Root::default());

        assert_eq!(relocated.property_tables.len(), 1);
        assert!(relocated.others.is_empty());
        let table = &relocated.property_tables[0];
        // "category" sorts before "element".
        assert_eq!(table.properties["category"].values, 0);
        assert_eq!(table.properties["element"].values, 1);
        assert_eq!(relocated.read_column(&output, 0, ELEMENT_PROPERTY), Some(vec![10, 20, 30]));
    }

    #[test]
    fn test_mesh_features_lookup() {
        let features: MeshFeatures = serde_json::from_value(json!({
            "featureIds": [
                {"featureCount": 3, "attribute": 0, "propertyTable": 0},
                {"featureCount": 2, "attribute": 0, "propertyTable": 1, "label": "mat"}
            ]
        }))
        .unwrap();
        assert_eq!(features.attribute_for_table(1), Some(0));
        assert_eq!(features.attribute_for_table(2), None);
        assert_eq!(features.feature_ids[1].others["label"], "mat");
    }

    #[test]
    fn test_signed_columns_are_sign_extended() {
        let mut builder = GltfBuilder::new();
        let small: Vec<u8> = [-2i8, 5].iter().flat_map(|v| v.to_le_bytes()).collect();
        let wide: Vec<u8> = [-300i16, 300].iter().flat_map(|v| v.to_le_bytes()).collect();
        let small = builder.add_buffer_view(&small, None, None);
        let wide = builder.add_buffer_view(&wide, None, None);
        let metadata = json!({
            "schema": {"classes": {"features": {"properties": {
                "small": {"type": "SCALAR", "componentType": "INT8"},
                "wide": {"type": "SCALAR", "componentType": "INT16"}
            }}}},
            "propertyTables": [{"class": "features", "count": 2, "properties": {
                "small": {"values": small}, "wide": {"values": wide}
            }}]
        });
        let mut root = json::Root::default();
        root.extensions
            .get_or_insert_with(Default::default)
            .others
            .insert(STRUCTURAL_METADATA.to_string(), metadata);
        let model = builder.finish(root);
        let metadata = StructuralMetadata::from_root(&model.root).unwrap();

        assert_eq!(metadata.read_column(&model, 0, "small"), Some(vec![-2i64 as u64, 5]));
        assert_eq!(metadata.read_column(&model, 0, "wide"), Some(vec![-300i64 as u64, 300]));
    }
}
