//! # glTF Tuner
//!
//! A Rust library for re-clustering the primitives of glTF tiles and baking
//! customized materials into them.
//!
//! ## Overview
//!
//! Tiles exported from infrastructure models carry per-vertex element ids and
//! source material ids in `EXT_structural_metadata` property tables. The tuner
//! merges or splits primitives according to grouping rules, and replaces the
//! glTF material of customized source materials with a tuned PBR material.
//!
//! ## Quick Start
//!
//! ```ignore
//! use gltf_tuner::{GltfModel, GltfTuner, TunerConfig};
//! use gltf_tuner::material::Channel;
//! use glam::{DMat4, DVec3};
//!
//! let tuner = GltfTuner::new(TunerConfig::new("model").with_texture_dir("cache"));
//!
//! // Customize a source material
//! {
//!     let mut registry = tuner.registry().write();
//!     registry.create_slot(0x7);
//!     registry.set_channel_intensity(0x7, Channel::Roughness, 0.2);
//! }
//!
//! // Tune a tile
//! let tile = GltfModel::from_glb(&std::fs::read("tile.glb")?)?;
//! let tuned = tuner.tune(&tile, DMat4::IDENTITY, DVec3::ZERO)?;
//! std::fs::write("tuned.glb", tuned.to_glb()?)?;
//! ```
//!
//! ## Concurrency
//!
//! Rules can be replaced through [`GltfTuner::set_rules`] while a tune pass
//! runs on another thread. Material customizations are edited through the
//! lock guards of [`MaterialRegistry`], so read-then-write sequences are atomic.

pub mod config;
pub mod error;
pub mod gltf;
pub mod material;
pub mod texture;
pub mod tuner;

// Re-export main types for convenience
pub use config::TunerConfig;
pub use error::{Result, TunerError};
pub use gltf::GltfModel;
pub use material::{MaterialDefinition, MaterialRegistry};
pub use texture::TextureCache;
pub use tuner::{ElementGroup, GltfTuner, MaterialInfo, Rules};
