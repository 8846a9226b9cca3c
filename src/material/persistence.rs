//! Bridge to the external store of material customizations.

use super::types::MaterialDefinition;
use crate::texture::TextureSource;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Storage of per-material customizations, implemented by the host.
pub trait MaterialPersistence: Send + Sync {
    /// Customization stored for a material, if any.
    fn get_material_settings(&self, model_id: &str, material_id: u64) -> Option<MaterialDefinition>;

    /// Store a fully completed customization.
    fn set_material_settings(&self, model_id: &str, material_id: u64, definition: &MaterialDefinition);

    /// URL a texture can be fetched from.
    fn get_texture_url(&self, texture_id: &str, source: TextureSource) -> Option<String>;
}

/// Persistence kept in memory, for tests and hosts without a backing store.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    settings: Mutex<HashMap<(String, u64), MaterialDefinition>>,
    texture_urls: Mutex<HashMap<String, String>>,
    writes: Mutex<usize>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a customization without counting it as a write.
    pub fn insert(&self, model_id: &str, material_id: u64, definition: MaterialDefinition) {
        self.settings
            .lock()
            .insert((model_id.to_string(), material_id), definition);
    }

    pub fn remove(&self, model_id: &str, material_id: u64) -> Option<MaterialDefinition> {
        self.settings.lock().remove(&(model_id.to_string(), material_id))
    }

    pub fn set_texture_url(&self, texture_id: &str, url: &str) {
        self.texture_urls
            .lock()
            .insert(texture_id.to_string(), url.to_string());
    }

    /// Number of `set_material_settings` calls so far.
    pub fn write_count(&self) -> usize {
        *self.writes.lock()
    }
}

impl MaterialPersistence for InMemoryPersistence {
    fn get_material_settings(&self, model_id: &str, material_id: u64) -> Option<MaterialDefinition> {
        self.settings
            .lock()
            .get(&(model_id.to_string(), material_id))
            .cloned()
    }

    fn set_material_settings(&self, model_id: &str, material_id: u64, definition: &MaterialDefinition) {
        *self.writes.lock() += 1;
        self.insert(model_id, material_id, definition.clone());
    }

    fn get_texture_url(&self, texture_id: &str, source: TextureSource) -> Option<String> {
        match source {
            TextureSource::Remote => self.texture_urls.lock().get(texture_id).cloned(),
            TextureSource::LocalDisk => Some(format!("file://{texture_id}")),
        }
    }
}
