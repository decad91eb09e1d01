use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("Processing failed: {0}")]
    ProcessingError(String),

    #[error("Validation failed: {0}")]
    ValidationError(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Execution context creation failed: {0}")]
    ContextCreation(String),

    #[error("LUT error: {0}")]
    Lut(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ForgeError>;
