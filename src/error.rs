//! Central error handling for the quadglobe engine
//!
//! Provides a unified EngineError enum with consistent categorization.
//! Layer providers report failures through `anyhow`; the engine converts
//! them into `EngineError::DataFetch` at the job boundary.

/// Centralized error type for all engine operations
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("Data fetch error: {0}")]
    DataFetch(String),

    #[error("Invalid extents: {0}")]
    InvalidExtents(String),

    #[error("Invalid mesh: {0}")]
    InvalidMesh(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Convenience constructors for common error types
    pub fn data_fetch<T: ToString>(msg: T) -> Self {
        EngineError::DataFetch(msg.to_string())
    }

    pub fn invalid_extents<T: ToString>(msg: T) -> Self {
        EngineError::InvalidExtents(msg.to_string())
    }

    pub fn invalid_mesh<T: ToString>(msg: T) -> Self {
        EngineError::InvalidMesh(msg.to_string())
    }

    pub fn cache<T: ToString>(msg: T) -> Self {
        EngineError::Cache(msg.to_string())
    }

    pub fn config<T: ToString>(msg: T) -> Self {
        EngineError::Config(msg.to_string())
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
