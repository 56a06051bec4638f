//! Error handling for the peerlink CLI

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("peerlink error: {0}")]
    Peerlink(#[from] peerlink_core::PeerlinkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Demo failed: {0}")]
    Demo(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("Hex decoding error: {0}")]
    HexDecoding(#[from] hex::FromHexError),

    #[error("Feature not available: {0}")]
    FeatureNotAvailable(String),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
