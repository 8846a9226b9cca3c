//! Source materials, their customizations and default channel values.

pub mod defaults;
pub mod persistence;
pub mod registry;
pub mod types;

pub use persistence::{InMemoryPersistence, MaterialPersistence};
pub use registry::{MaterialRegistry, MaterialSlot, RegistryState};
pub use types::{
    parse_material_id, AttributeMap, AttributeValue, Channel, ChannelDefinition, ChannelMap, Color,
    MaterialDefinition, MaterialKind, SourceMaterialProperties, UvTransform,
};
