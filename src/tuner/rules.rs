//! Grouping rules deciding how primitives are merged or split.

use crate::material::types::{id_set, optional_id};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Elements merged into the same primitives, regardless of their original material.
///
/// Pieces of different groups are never merged together. Merging is still
/// prevented between different topologies or attribute lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ElementGroup {
    #[serde(with = "id_set")]
    pub elements: BTreeSet<u64>,
    /// glTF material of the merged primitives. `None` keeps each primitive's material.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub material: Option<u32>,
    /// Source material carried by the merged primitives.
    #[serde(with = "optional_id", skip_serializing_if = "Option::is_none")]
    pub source_material: Option<u64>,
}

/// Rules of a tune pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Rules {
    pub element_groups: Vec<ElementGroup>,
    /// Source materials primitives are split on.
    #[serde(with = "id_set")]
    pub split_materials: BTreeSet<u64>,
}

/// Rules with the lookups derived from them.
#[derive(Debug, Clone, Default)]
pub struct DerivedRules {
    /// Version of the rules the lookups were computed from.
    pub version: u64,
    pub rules: Arc<Rules>,
    element_to_group: HashMap<u64, usize>,
}

impl DerivedRules {
    /// Compute the lookups of the given rules. An element listed in several
    /// groups belongs to the last one.
    pub fn new(rules: Arc<Rules>, version: u64) -> Self {
        let element_to_group = rules
            .element_groups
            .iter()
            .enumerate()
            .flat_map(|(index, group)| group.elements.iter().map(move |&element| (element, index)))
            .collect();
        Self {
            version,
            rules,
            element_to_group,
        }
    }

    /// Index and description of the group containing an element.
    pub fn group_of(&self, element: u64) -> Option<(usize, &ElementGroup)> {
        let index = *self.element_to_group.get(&element)?;
        Some((index, &self.rules.element_groups[index]))
    }

    pub fn group_count(&self) -> usize {
        self.rules.element_groups.len()
    }
}
