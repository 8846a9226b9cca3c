//! Tuner configuration.

use crate::error::Result;
use crate::material::types::optional_id;
use crate::material::{MaterialDefinition, SourceMaterialProperties};
use crate::tuner::Rules;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Externally configured inputs of a tune pass, besides the grouping rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TunerConfig {
    /// Identifier of the model, forwarded to the persistence manager.
    pub model_id: String,
    /// Directory where downloaded and synthesized textures are cached.
    pub texture_dir: Option<PathBuf>,
    /// Source materials for which primitives are split, so that each output
    /// primitive carries exactly one of them.
    #[serde(with = "crate::material::types::id_set")]
    pub split_materials: BTreeSet<u64>,
}

impl TunerConfig {
    /// Create config for the given model.
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            ..Default::default()
        }
    }

    /// Set the texture cache directory.
    pub fn with_texture_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.texture_dir = Some(dir.into());
        self
    }

    /// Add source materials to split primitives on.
    pub fn with_split_materials(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.split_materials.extend(ids);
        self
    }
}

/// Source material described by a tuning project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProjectMaterial {
    #[serde(with = "optional_id")]
    pub id: Option<u64>,
    pub properties: SourceMaterialProperties,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customization: Option<MaterialDefinition>,
}

/// Everything needed to tune tiles from the command line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TuningProject {
    pub config: TunerConfig,
    pub rules: Rules,
    pub materials: Vec<ProjectMaterial>,
    /// Column-major tile transformation. Identity when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tile_transform: Option<[f64; 16]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_translation: Option<[f64; 3]>,
}

impl TuningProject {
    /// Load a project from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
