//! Error types for the glTF tuner.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using TunerError.
pub type Result<T> = std::result::Result<T, TunerError>;

/// Main error type for tuning operations.
#[derive(Error, Debug)]
pub enum TunerError {
    /// Failed to parse or serialize JSON data.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failed to read or process an image.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The binary glTF container is malformed.
    #[error("Invalid GLB: {0}")]
    InvalidGlb(String),

    /// The glTF document references data that does not exist.
    #[error("Invalid glTF: {0}")]
    InvalidGltf(String),

    /// Texture cache failure.
    #[error(transparent)]
    TextureCache(#[from] TextureCacheError),

    /// Texture synthesis failure.
    #[error(transparent)]
    Merge(#[from] MergeError),

    /// Failed to export the tuned model.
    #[error("Export error: {0}")]
    Export(String),
}

/// Failures of the on-disk texture cache.
#[derive(Error, Debug)]
pub enum TextureCacheError {
    /// No cache directory was configured.
    #[error("texture directory not set - cannot store textures")]
    DirectoryNotSet,

    /// The cache directory could not be created.
    #[error("cannot create texture directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Downloaded texture data is empty or has a zero dimension.
    #[error("empty texture data for {0}")]
    EmptyTexture(String),

    /// The texture identifier cannot be used as a file name.
    #[error("invalid texture id {0:?}")]
    InvalidTextureId(String),

    /// The texture format is missing or cannot be used by the 3D runtime.
    #[error("unsupported texture format for {id}: {format}")]
    UnsupportedFormat { id: String, format: String },

    /// Writing the texture file failed.
    #[error("cannot write texture {path}: {reason}")]
    Write { path: PathBuf, reason: String },
}

/// Failure while synthesizing a merged texture.
#[derive(Error, Debug)]
#[error("texture merge failed: {0}")]
pub struct MergeError(pub String);

impl MergeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<image::ImageError> for MergeError {
    fn from(e: image::ImageError) -> Self {
        Self(e.to_string())
    }
}
