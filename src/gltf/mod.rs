//! In-memory glTF model and binary container I/O.

pub mod accessor;
pub mod builder;
pub mod metadata;

pub use builder::GltfBuilder;

use crate::error::{Result, TunerError};
use gltf_json as json;
use json::mesh::Semantic;
use json::validation::Checked;

const GLB_MAGIC: &[u8; 4] = b"glTF";
const GLB_VERSION: u32 = 2;
const GLB_HEADER_LEN: usize = 12;
const CHUNK_JSON: u32 = 0x4E4F534A;
const CHUNK_BIN: u32 = 0x004E4942;

/// A glTF document with its binary buffers loaded.
#[derive(Debug, Clone, Default)]
pub struct GltfModel {
    pub root: json::Root,
    /// Data of each buffer, indexed like `root.buffers`.
    pub buffers: Vec<Vec<u8>>,
}

impl GltfModel {
    pub fn new(root: json::Root, buffers: Vec<Vec<u8>>) -> Self {
        Self { root, buffers }
    }

    /// Parse a binary glTF container.
    pub fn from_glb(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < GLB_HEADER_LEN || &bytes[0..4] != GLB_MAGIC {
            return Err(TunerError::InvalidGlb("missing glTF magic".to_string()));
        }
        let version = read_u32(bytes, 4)?;
        if version != GLB_VERSION {
            return Err(TunerError::InvalidGlb(format!("unsupported version {version}")));
        }
        let length = (read_u32(bytes, 8)? as usize).min(bytes.len());

        let mut json_chunk = None;
        let mut bin_chunk = None;
        let mut offset = GLB_HEADER_LEN;
        while offset + 8 <= length {
            let chunk_len = read_u32(bytes, offset)? as usize;
            let chunk_type = read_u32(bytes, offset + 4)?;
            let start = offset + 8;
            let end = start
                .checked_add(chunk_len)
                .filter(|&end| end <= length)
                .ok_or_else(|| TunerError::InvalidGlb("chunk exceeds container length".to_string()))?;
            match chunk_type {
                CHUNK_JSON if json_chunk.is_none() => json_chunk = Some(&bytes[start..end]),
                CHUNK_BIN if bin_chunk.is_none() => bin_chunk = Some(&bytes[start..end]),
                _ => {}
            }
            offset = end;
        }

        let json_chunk = json_chunk.ok_or_else(|| TunerError::InvalidGlb("missing JSON chunk".to_string()))?;
        let root: json::Root = serde_json::from_slice(json_chunk)?;

        let mut buffers = Vec::with_capacity(root.buffers.len());
        for (index, buffer) in root.buffers.iter().enumerate() {
            match (&buffer.uri, index, bin_chunk) {
                (None, 0, Some(bin)) => {
                    let len = (buffer.byte_length.0 as usize).min(bin.len());
                    buffers.push(bin[..len].to_vec());
                }
                _ => {
                    return Err(TunerError::InvalidGltf(format!(
                        "buffer {index} is not embedded in the GLB container"
                    )))
                }
            }
        }
        Ok(Self { root, buffers })
    }

    /// Serialize into a binary glTF container. At most one buffer can be embedded.
    pub fn to_glb(&self) -> Result<Vec<u8>> {
        if self.buffers.len() > 1 {
            return Err(TunerError::Export(format!(
                "cannot embed {} buffers in a GLB container",
                self.buffers.len()
            )));
        }
        let buffer_data: &[u8] = self.buffers.first().map(Vec::as_slice).unwrap_or_default();

        let json_string = json::serialize::to_string(&self.root)
            .map_err(|e| TunerError::Export(format!("Failed to serialize glTF JSON: {}", e)))?;
        let json_bytes = json_string.as_bytes();

        // Pad JSON to 4-byte alignment
        let json_padding = (4 - (json_bytes.len() % 4)) % 4;
        let padded_json_len = json_bytes.len() + json_padding;

        // Pad buffer to 4-byte alignment
        let buffer_padding = (4 - (buffer_data.len() % 4)) % 4;
        let padded_buffer_len = buffer_data.len() + buffer_padding;

        let bin_chunk_len = if self.buffers.is_empty() { 0 } else { 8 + padded_buffer_len };
        let total_size = GLB_HEADER_LEN + 8 + padded_json_len + bin_chunk_len;

        let mut glb = Vec::with_capacity(total_size);

        // GLB Header
        glb.extend_from_slice(GLB_MAGIC);
        glb.extend_from_slice(&GLB_VERSION.to_le_bytes());
        glb.extend_from_slice(&(total_size as u32).to_le_bytes());

        // JSON Chunk
        glb.extend_from_slice(&(padded_json_len as u32).to_le_bytes());
        glb.extend_from_slice(&CHUNK_JSON.to_le_bytes());
        glb.extend_from_slice(json_bytes);
        glb.extend_from_slice(&vec![0x20u8; json_padding]);

        // BIN Chunk
        if !self.buffers.is_empty() {
            glb.extend_from_slice(&(padded_buffer_len as u32).to_le_bytes());
            glb.extend_from_slice(&CHUNK_BIN.to_le_bytes());
            glb.extend_from_slice(buffer_data);
            glb.extend_from_slice(&vec![0u8; buffer_padding]);
        }

        Ok(glb)
    }

    /// Bytes covered by a buffer view, if it lies within its buffer.
    pub fn buffer_view_data(&self, view_index: usize) -> Option<&[u8]> {
        let view = self.root.buffer_views.get(view_index)?;
        let buffer = self.buffers.get(view.buffer.value())?;
        let start = view.byte_offset.map_or(0, |o| o.0 as usize);
        let end = start.checked_add(view.byte_length.0 as usize)?;
        buffer.get(start..end)
    }
}

/// Attribute semantic from its glTF name, including application-specific `_NAME` attributes.
pub fn semantic(name: &str) -> Option<Checked<Semantic>> {
    serde_json::from_value(serde_json::Value::String(name.to_string())).ok()
}

/// Semantic of the `_FEATURE_ID_n` attribute.
pub fn feature_id_semantic(set: u32) -> Option<Checked<Semantic>> {
    semantic(&format!("_FEATURE_ID_{set}"))
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| TunerError::InvalidGlb(format!("truncated container at byte {offset}")))
}
