//! Source material properties and material customizations.

use crate::texture::TextureSource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tolerance used when comparing intensities.
pub const INTENSITY_EPSILON: f64 = 1e-5;
/// Tolerance used when comparing colors and UV transform components.
pub const COLOR_EPSILON: f64 = 1e-4;

/// RGBA color, each component in [0, 1].
pub type Color = [f64; 4];

/// Opaque white.
pub const WHITE: Color = [1.0, 1.0, 1.0, 1.0];

/// A physically-based-rendering material input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    Color,
    Normal,
    Metallic,
    Roughness,
    AmbientOcclusion,
    Alpha,
    Opacity,
    Transparency,
    Bump,
    Displacement,
    Backlight,
    Luminous,
    Reflection,
    Refraction,
    Specular,
}

impl Channel {
    /// All channels, in the order they are processed when completing a definition.
    pub const ALL: [Channel; 15] = [
        Channel::Color,
        Channel::Normal,
        Channel::Metallic,
        Channel::Roughness,
        Channel::AmbientOcclusion,
        Channel::Alpha,
        Channel::Opacity,
        Channel::Transparency,
        Channel::Bump,
        Channel::Displacement,
        Channel::Backlight,
        Channel::Luminous,
        Channel::Reflection,
        Channel::Refraction,
        Channel::Specular,
    ];
}

/// Reference to a texture used by a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelMap {
    /// Texture identifier; empty means "no texture".
    pub texture: String,
    pub source: TextureSource,
}

impl ChannelMap {
    pub fn new(texture: impl Into<String>, source: TextureSource) -> Self {
        Self {
            texture: texture.into(),
            source,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.texture.is_empty()
    }
}

/// Sparse override of one channel. `None` means "use the computed default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelDefinition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intensity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<Color>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intensity_map: Option<ChannelMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_map: Option<ChannelMap>,
}

impl ChannelDefinition {
    pub fn is_empty(&self) -> bool {
        self.intensity.is_none()
            && self.color.is_none()
            && self.intensity_map.is_none()
            && self.color_map.is_none()
    }
}

/// Kind of material a customization targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaterialKind {
    #[default]
    Pbr,
    Glass,
}

/// Texture coordinate transformation applied to every map of a material.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UvTransform {
    pub offset: [f64; 2],
    pub scale: [f64; 2],
    /// Rotation in radians.
    pub rotation: f64,
}

impl Default for UvTransform {
    fn default() -> Self {
        Self {
            offset: [0.0, 0.0],
            scale: [1.0, 1.0],
            rotation: 0.0,
        }
    }
}

impl UvTransform {
    /// Component-wise comparison with [`COLOR_EPSILON`] tolerance.
    pub fn approx_eq(&self, other: &UvTransform) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= COLOR_EPSILON;
        close(self.offset[0], other.offset[0])
            && close(self.offset[1], other.offset[1])
            && close(self.scale[0], other.scale[0])
            && close(self.scale[1], other.scale[1])
            && close(self.rotation, other.rotation)
    }

    pub fn is_identity(&self) -> bool {
        self.approx_eq(&UvTransform::default())
    }
}

/// Customization of one source material: a sparse override of the default material.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MaterialDefinition {
    pub kind: MaterialKind,
    pub display_name: String,
    pub uv_transform: UvTransform,
    pub channels: BTreeMap<Channel, ChannelDefinition>,
}

impl MaterialDefinition {
    /// Returns true if this definition holds an override for the given channel.
    pub fn defines_channel(&self, channel: Channel) -> bool {
        self.channels.get(&channel).is_some_and(|c| !c.is_empty())
    }

    /// Returns true if this definition differs from "use every default".
    pub fn has_custom_definition(&self) -> bool {
        self.channels.values().any(|c| !c.is_empty())
            || !self.uv_transform.is_identity()
            || self.kind != MaterialKind::default()
    }

    pub fn channel(&self, channel: Channel) -> Option<&ChannelDefinition> {
        self.channels.get(&channel)
    }

    fn channel_mut(&mut self, channel: Channel) -> &mut ChannelDefinition {
        self.channels.entry(channel).or_default()
    }

    pub fn intensity(&self, channel: Channel) -> Option<f64> {
        self.channel(channel).and_then(|c| c.intensity)
    }

    pub fn color(&self, channel: Channel) -> Option<Color> {
        self.channel(channel).and_then(|c| c.color)
    }

    pub fn intensity_map(&self, channel: Channel) -> Option<&ChannelMap> {
        self.channel(channel).and_then(|c| c.intensity_map.as_ref())
    }

    pub fn color_map(&self, channel: Channel) -> Option<&ChannelMap> {
        self.channel(channel).and_then(|c| c.color_map.as_ref())
    }

    pub fn set_intensity(&mut self, channel: Channel, intensity: f64) {
        self.channel_mut(channel).intensity = Some(intensity);
    }

    pub fn set_color(&mut self, channel: Channel, color: Color) {
        self.channel_mut(channel).color = Some(color);
    }

    pub fn set_intensity_map(&mut self, channel: Channel, map: ChannelMap) {
        self.channel_mut(channel).intensity_map = Some(map);
    }

    pub fn set_color_map(&mut self, channel: Channel, map: ChannelMap) {
        self.channel_mut(channel).color_map = Some(map);
    }
}

/// Value of one source material attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Number(f64),
    Vec2([f64; 2]),
    Vec3([f64; 3]),
    String(String),
}

/// Free-form attribute bag.
pub type AttributeMap = BTreeMap<String, AttributeValue>;

/// Map types whose textures are never fetched.
const UNSUPPORTED_MAP_TYPES: [&str; 3] = ["AnisotropicDirection", "Finish", "Geometry"];

/// Raw properties of one source material, as exported with the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceMaterialProperties {
    pub attributes: AttributeMap,
    /// Texture maps keyed by map type (eg. "Pattern").
    pub maps: BTreeMap<String, AttributeMap>,
}

// Type mismatches in the attribute bag read as "absent".
impl SourceMaterialProperties {
    pub fn number(&self, name: &str) -> Option<f64> {
        match self.attributes.get(name) {
            Some(AttributeValue::Number(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn flag(&self, name: &str) -> bool {
        matches!(self.attributes.get(name), Some(AttributeValue::Bool(true)))
    }

    pub fn vec3(&self, name: &str) -> Option<[f64; 3]> {
        match self.attributes.get(name) {
            Some(AttributeValue::Vec3(v)) => Some(*v),
            _ => None,
        }
    }

    /// Texture identifier of the given map, if the map exists and names one.
    pub fn map_texture_id(&self, map_type: &str) -> Option<&str> {
        match self.maps.get(map_type)?.get("TextureId") {
            Some(AttributeValue::String(id)) if !id.is_empty() => Some(id),
            _ => None,
        }
    }

    /// Texture identifiers of every supported map, in map-type order.
    pub fn texture_ids(&self) -> impl Iterator<Item = &str> {
        self.maps
            .keys()
            .filter(|map_type| !UNSUPPORTED_MAP_TYPES.contains(&map_type.as_str()))
            .filter_map(|map_type| self.map_texture_id(map_type))
    }
}

/// Parse a material identifier given either as a JSON number or as a hexadecimal string.
pub fn parse_material_id(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::String(s) => {
            let digits = s.trim_start_matches("0x").trim_start_matches("0X");
            u64::from_str_radix(digits, 16).ok()
        }
        serde_json::Value::Number(n) => n.as_u64().or_else(|| n.as_i64().map(|v| v as u64)),
        _ => None,
    }
}

/// Serde adapter for sets of material identifiers (numbers or hex strings).
pub mod id_set {
    use super::parse_material_id;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeSet;

    pub fn serialize<S: Serializer>(ids: &BTreeSet<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(ids.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeSet<u64>, D::Error> {
        let values = Vec::<serde_json::Value>::deserialize(deserializer)?;
        values
            .iter()
            .map(|v| parse_material_id(v).ok_or_else(|| D::Error::custom(format!("invalid material id {v}"))))
            .collect()
    }
}

/// Serde adapter for an optional material identifier (number or hex string).
pub mod optional_id {
    use super::parse_material_id;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match id {
            Some(id) => serializer.serialize_some(&format!("{id:#x}")),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        match Option::<serde_json::Value>::deserialize(deserializer)? {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(v) => parse_material_id(&v)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid material id {v}"))),
        }
    }
}
