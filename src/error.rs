use std::io;

use thiserror::Error;

/// Problems found while reading a scene description
#[derive(Error, Debug)]
#[error("{message}")]
pub struct SceneParseError {
    pub message: String,
}

impl SceneParseError {
    pub fn new(message: impl Into<String>) -> Self {
        SceneParseError {
            message: message.into(),
        }
    }
}

/// Unrecoverable failures that stop a render
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("cannot load scene: {0}")]
    Scene(#[from] SceneParseError),

    #[error("invalid render parameters: {0}")]
    Params(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cannot encode png: {0}")]
    Png(#[from] png::EncodingError),
}
