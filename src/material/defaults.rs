//! Default channel values derived from source material properties.
//!
//! These replicate the heuristics of the exporter that produced the original
//! glTF tiles, so that an uncustomized channel reads back exactly what the
//! tile already displays.

use super::types::{Channel, ChannelMap, Color, SourceMaterialProperties, WHITE};
use crate::texture::TextureSource;

/// Map type holding the base color texture.
pub const PATTERN_MAP: &str = "Pattern";

/// Specular exponent used when the material does not define a finish.
const DEFAULT_SPECULAR_EXPONENT: f64 = 13.5;

/// Specular threshold above which a material without base color texture is metallic.
const METALLIC_SPECULAR_THRESHOLD: f64 = 0.25;

const BLACK: Color = [0.0, 0.0, 0.0, 1.0];

/// Default intensity of a channel.
pub fn default_intensity(channel: Channel, props: &SourceMaterialProperties) -> f64 {
    match channel {
        Channel::Metallic => {
            let specular = props.number("specular").unwrap_or(0.0);
            if specular > METALLIC_SPECULAR_THRESHOLD
                && default_color_map(Channel::Color, props).is_empty()
            {
                1.0
            } else {
                0.0
            }
        }
        Channel::Roughness => roughness_from_exponent(specular_exponent(props)),
        Channel::Normal | Channel::AmbientOcclusion => 1.0,
        Channel::Alpha | Channel::Opacity => 1.0 - transmit(props),
        Channel::Transparency => transmit(props),
        _ => 0.0,
    }
}

/// Default color of a channel.
pub fn default_color(channel: Channel, props: &SourceMaterialProperties) -> Color {
    if channel != Channel::Color {
        return BLACK;
    }
    // A pattern texture overrides the base color.
    if props.map_texture_id(PATTERN_MAP).is_some() {
        return WHITE;
    }
    match props.vec3("color") {
        Some([r, g, b]) if props.flag("HasBaseColor") => [r, g, b, 1.0],
        _ => WHITE,
    }
}

/// Default intensity map of a channel. Source materials never provide one.
pub fn default_intensity_map(_channel: Channel, _props: &SourceMaterialProperties) -> ChannelMap {
    ChannelMap::default()
}

/// Default color map of a channel.
pub fn default_color_map(channel: Channel, props: &SourceMaterialProperties) -> ChannelMap {
    match (channel, props.map_texture_id(PATTERN_MAP)) {
        (Channel::Color, Some(id)) => ChannelMap::new(id, TextureSource::Remote),
        _ => ChannelMap::default(),
    }
}

fn transmit(props: &SourceMaterialProperties) -> f64 {
    props.number("transmit").unwrap_or(0.0).clamp(0.0, 1.0)
}

fn specular_exponent(props: &SourceMaterialProperties) -> f64 {
    if props.flag("HasFinish") {
        props.number("finish").unwrap_or(DEFAULT_SPECULAR_EXPONENT)
    } else {
        DEFAULT_SPECULAR_EXPONENT
    }
}

fn roughness_from_exponent(exponent: f64) -> f64 {
    (2.0 / (exponent + 2.0)).sqrt()
}
