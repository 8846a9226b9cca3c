//! Texture cache, loading and synthesis of merged textures.

pub mod cache;
pub mod loader;
pub mod merge;

pub use cache::{ImageSourceFormat, TextureAccess, TextureCache, TextureKey, TextureSource};
pub use loader::{FileTextureLoader, TextureLoader};
pub use merge::MergedTexture;
