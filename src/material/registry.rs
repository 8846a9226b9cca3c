//! Per-material customization state.
//!
//! The registry owns one slot per source material and the texture cache, both
//! behind a single reader/writer lock. Callers take the lock once through
//! [`MaterialRegistry::read`] or [`MaterialRegistry::write`] and run a whole
//! read-then-write sequence on the returned guard.

use super::defaults;
use super::persistence::MaterialPersistence;
use super::types::{
    Channel, ChannelMap, Color, MaterialDefinition, MaterialKind, SourceMaterialProperties,
    UvTransform, COLOR_EPSILON, INTENSITY_EPSILON,
};
use crate::texture::{TextureCache, TextureKey, TextureSource};
use gltf_json::material::AlphaMode;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Everything known about one source material.
#[derive(Debug, Clone, Default)]
pub struct MaterialSlot {
    pub properties: SourceMaterialProperties,
    pub definition: MaterialDefinition,
    initial_alpha_mode: Option<AlphaMode>,
    current_alpha_mode: Option<AlphaMode>,
}

/// State guarded by the registry lock.
#[derive(Default)]
pub struct RegistryState {
    materials: HashMap<u64, MaterialSlot>,
    textures: TextureCache,
    persistence: Option<Arc<dyn MaterialPersistence>>,
    model_id: String,
}

/// Thread-safe registry of source materials and their customizations.
#[derive(Default)]
pub struct MaterialRegistry {
    state: RwLock<RegistryState>,
}

impl MaterialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry bound to a persistence manager for the given model.
    pub fn with_persistence(model_id: impl Into<String>, persistence: Arc<dyn MaterialPersistence>) -> Self {
        let registry = Self::new();
        registry.write().set_persistence(model_id, persistence);
        registry
    }

    /// Shared access, for queries.
    pub fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read()
    }

    /// Exclusive access, for edits and texture registration.
    pub fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write()
    }
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= INTENSITY_EPSILON
}

fn colors_close(a: &Color, b: &Color) -> bool {
    a.iter().zip(b).all(|(x, y)| (x - y).abs() <= COLOR_EPSILON)
}

impl RegistryState {
    pub fn set_persistence(&mut self, model_id: impl Into<String>, persistence: Arc<dyn MaterialPersistence>) {
        self.model_id = model_id.into();
        self.persistence = Some(persistence);
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn textures(&self) -> &TextureCache {
        &self.textures
    }

    pub fn textures_mut(&mut self) -> &mut TextureCache {
        &mut self.textures
    }

    pub fn contains(&self, material_id: u64) -> bool {
        self.materials.contains_key(&material_id)
    }

    /// Known material identifiers, sorted.
    pub fn material_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.materials.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn slot(&self, material_id: u64) -> Option<&MaterialSlot> {
        self.materials.get(&material_id)
    }

    /// Record the source properties of a material.
    ///
    /// A new slot is seeded from the persistence manager; an existing one keeps
    /// its customization. Texture maps are registered as remote textures.
    pub fn ingest_source_properties(&mut self, material_id: u64, properties: SourceMaterialProperties) {
        for texture_id in properties.texture_ids() {
            self.textures.register_remote(texture_id);
        }
        match self.materials.get_mut(&material_id) {
            Some(slot) => slot.properties = properties,
            None => {
                let definition = self.fetch_customization(material_id).unwrap_or_default();
                self.materials.insert(
                    material_id,
                    MaterialSlot {
                        properties,
                        definition,
                        ..Default::default()
                    },
                );
            }
        }
    }

    /// Create an empty slot if the material is unknown.
    pub fn create_slot(&mut self, material_id: u64) {
        if !self.materials.contains_key(&material_id) {
            let definition = self.fetch_customization(material_id).unwrap_or_default();
            self.materials.insert(
                material_id,
                MaterialSlot {
                    definition,
                    ..Default::default()
                },
            );
        }
    }

    fn fetch_customization(&self, material_id: u64) -> Option<MaterialDefinition> {
        let definition = self
            .persistence
            .as_ref()?
            .get_material_settings(&self.model_id, material_id)?;
        debug!("loaded customization of material {material_id:#x}");
        Some(definition)
    }

    fn with_properties<T>(&self, material_id: u64, f: impl FnOnce(&SourceMaterialProperties) -> T) -> T {
        match self.materials.get(&material_id) {
            Some(slot) => f(&slot.properties),
            None => f(&SourceMaterialProperties::default()),
        }
    }

    pub fn channel_intensity(&self, material_id: u64, channel: Channel) -> f64 {
        self.materials
            .get(&material_id)
            .and_then(|slot| slot.definition.intensity(channel))
            .unwrap_or_else(|| self.with_properties(material_id, |p| defaults::default_intensity(channel, p)))
    }

    pub fn channel_color(&self, material_id: u64, channel: Channel) -> Color {
        self.materials
            .get(&material_id)
            .and_then(|slot| slot.definition.color(channel))
            .unwrap_or_else(|| self.with_properties(material_id, |p| defaults::default_color(channel, p)))
    }

    pub fn channel_intensity_map(&self, material_id: u64, channel: Channel) -> ChannelMap {
        self.materials
            .get(&material_id)
            .and_then(|slot| slot.definition.intensity_map(channel).cloned())
            .unwrap_or_else(|| {
                self.with_properties(material_id, |p| defaults::default_intensity_map(channel, p))
            })
    }

    pub fn channel_color_map(&self, material_id: u64, channel: Channel) -> ChannelMap {
        self.materials
            .get(&material_id)
            .and_then(|slot| slot.definition.color_map(channel).cloned())
            .unwrap_or_else(|| self.with_properties(material_id, |p| defaults::default_color_map(channel, p)))
    }

    /// Set a channel intensity. Returns true if the effective value changed.
    pub fn set_channel_intensity(&mut self, material_id: u64, channel: Channel, intensity: f64) -> bool {
        if !self.contains(material_id) || close(self.channel_intensity(material_id, channel), intensity) {
            return false;
        }
        self.edit(material_id, |def| def.set_intensity(channel, intensity))
    }

    /// Set a channel color. Returns true if the effective value changed.
    pub fn set_channel_color(&mut self, material_id: u64, channel: Channel, color: Color) -> bool {
        if !self.contains(material_id) || colors_close(&self.channel_color(material_id, channel), &color) {
            return false;
        }
        self.edit(material_id, |def| def.set_color(channel, color))
    }

    /// Set a channel intensity map. Returns true if the effective map changed.
    ///
    /// Installing a map on a channel without one first bakes the current intensity.
    pub fn set_channel_intensity_map(&mut self, material_id: u64, channel: Channel, map: ChannelMap) -> bool {
        if !self.contains(material_id) {
            return false;
        }
        let previous = self.channel_intensity_map(material_id, channel);
        if previous == map {
            return false;
        }
        let baked = (previous.is_empty() && !map.is_empty())
            .then(|| self.channel_intensity(material_id, channel));
        self.edit(material_id, |def| {
            if let Some(intensity) = baked {
                def.set_intensity(channel, intensity);
            }
            def.set_intensity_map(channel, map);
        })
    }

    /// Set a channel color map. Returns true if the effective map changed.
    ///
    /// Installing a map on a channel without one first bakes the current color,
    /// or the current intensity for normal maps.
    pub fn set_channel_color_map(&mut self, material_id: u64, channel: Channel, map: ChannelMap) -> bool {
        if !self.contains(material_id) {
            return false;
        }
        let previous = self.channel_color_map(material_id, channel);
        if previous == map {
            return false;
        }
        let installing = previous.is_empty() && !map.is_empty();
        let baked_intensity = (installing && channel == Channel::Normal)
            .then(|| self.channel_intensity(material_id, channel));
        let baked_color = (installing && channel != Channel::Normal)
            .then(|| self.channel_color(material_id, channel));
        self.edit(material_id, |def| {
            if let Some(intensity) = baked_intensity {
                def.set_intensity(channel, intensity);
            }
            if let Some(color) = baked_color {
                def.set_color(channel, color);
            }
            def.set_color_map(channel, map);
        })
    }

    pub fn uv_transform(&self, material_id: u64) -> UvTransform {
        self.materials
            .get(&material_id)
            .map(|slot| slot.definition.uv_transform)
            .unwrap_or_default()
    }

    pub fn set_uv_transform(&mut self, material_id: u64, transform: UvTransform) -> bool {
        if !self.contains(material_id) || self.uv_transform(material_id).approx_eq(&transform) {
            return false;
        }
        self.edit(material_id, |def| def.uv_transform = transform)
    }

    pub fn kind(&self, material_id: u64) -> MaterialKind {
        self.materials
            .get(&material_id)
            .map(|slot| slot.definition.kind)
            .unwrap_or_default()
    }

    pub fn set_kind(&mut self, material_id: u64, kind: MaterialKind) -> bool {
        if !self.contains(material_id) || self.kind(material_id) == kind {
            return false;
        }
        self.edit(material_id, |def| def.kind = kind)
    }

    pub fn display_name(&self, material_id: u64) -> Option<&str> {
        self.materials
            .get(&material_id)
            .map(|slot| slot.definition.display_name.as_str())
    }

    pub fn set_display_name(&mut self, material_id: u64, name: &str) -> bool {
        if !self.contains(material_id) || self.display_name(material_id) == Some(name) {
            return false;
        }
        let name = name.to_string();
        self.edit(material_id, |def| def.display_name = name)
    }

    /// Apply an edit known to change the definition, then persist the result.
    fn edit(&mut self, material_id: u64, f: impl FnOnce(&mut MaterialDefinition)) -> bool {
        let Some(slot) = self.materials.get_mut(&material_id) else {
            return false;
        };
        f(&mut slot.definition);
        self.persist(material_id);
        true
    }

    fn persist(&self, material_id: u64) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if let Some(definition) = self.full_definition(material_id) {
            persistence.set_material_settings(&self.model_id, material_id, &definition);
        }
    }

    /// Sparse customization, as stored.
    pub fn definition(&self, material_id: u64) -> Option<&MaterialDefinition> {
        self.materials.get(&material_id).map(|slot| &slot.definition)
    }

    /// Customization with every channel completed by its effective value.
    pub fn full_definition(&self, material_id: u64) -> Option<MaterialDefinition> {
        let slot = self.materials.get(&material_id)?;
        let mut definition = slot.definition.clone();
        for channel in Channel::ALL {
            definition.set_intensity(channel, self.channel_intensity(material_id, channel));
            definition.set_color(channel, self.channel_color(material_id, channel));
            definition.set_intensity_map(channel, self.channel_intensity_map(material_id, channel));
            definition.set_color_map(channel, self.channel_color_map(material_id, channel));
        }
        Some(definition)
    }

    /// Replace the customization wholesale and persist it.
    pub fn set_full_definition(&mut self, material_id: u64, definition: MaterialDefinition) -> bool {
        self.edit(material_id, |def| *def = definition)
    }

    /// Whether the stored customization differs from the defaults.
    pub fn has_custom_definition(&self, material_id: u64) -> bool {
        self.definition(material_id)
            .is_some_and(MaterialDefinition::has_custom_definition)
    }

    /// Record the alpha mode a material had before any tuning. Only the first call counts.
    pub fn store_initial_alpha_mode_if_needed(&mut self, material_id: u64, mode: AlphaMode) -> bool {
        match self.materials.get_mut(&material_id) {
            Some(slot) if slot.initial_alpha_mode.is_none() => {
                slot.initial_alpha_mode = Some(mode);
                true
            }
            _ => false,
        }
    }

    pub fn initial_alpha_mode(&self, material_id: u64) -> Option<AlphaMode> {
        self.materials.get(&material_id)?.initial_alpha_mode
    }

    pub fn current_alpha_mode(&self, material_id: u64) -> Option<AlphaMode> {
        self.materials.get(&material_id)?.current_alpha_mode
    }

    pub fn set_current_alpha_mode(&mut self, material_id: u64, mode: AlphaMode) {
        if let Some(slot) = self.materials.get_mut(&material_id) {
            slot.current_alpha_mode = Some(mode);
        }
    }

    /// Re-fetch every customization from the persistence manager.
    ///
    /// With `reset_if_none`, materials without a stored customization are reset.
    pub fn load_customizations(&mut self, reset_if_none: bool) {
        for material_id in self.material_ids() {
            let fetched = self.fetch_customization(material_id);
            if let Some(slot) = self.materials.get_mut(&material_id) {
                match fetched {
                    Some(definition) => slot.definition = definition,
                    None if reset_if_none => slot.definition = MaterialDefinition::default(),
                    None => {}
                }
            }
        }
    }

    /// Register the local or remote texture referenced by a channel map.
    pub fn texture_key(&mut self, map: &ChannelMap) -> Option<TextureKey> {
        if map.is_empty() {
            return None;
        }
        let key = TextureKey {
            id: map.texture.clone(),
            source: map.source,
        };
        match map.source {
            TextureSource::Remote => {
                self.textures.register_remote(&key.id);
                Some(key)
            }
            TextureSource::LocalDisk => Some(
                self.textures
                    .find_or_register_local_texture(Path::new(&key.id)),
            ),
        }
    }
}
