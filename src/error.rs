//! Centralized error types for Osiris

use thiserror::Error;

/// Osiris error types
#[derive(Debug, Error)]
pub enum OsirisError {
    /// Component configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kubernetes API call failed
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Outbound HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Scraper configuration named an unknown scraper
    #[error("Unknown metrics scraper '{0}'")]
    UnknownScraper(String),

    /// Activation of a workload failed
    #[error("Activation failed for {0}: {1}")]
    Activation(String, String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, OsirisError>;
