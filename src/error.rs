//! Error types for fedserve.
//!
//! This module provides a unified error type [`FedServeError`] for every stage of
//! the pipeline, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Configuration**: unknown model/framework/deployer/storage types and invalid
//!   arguments. These fail fast when an object is constructed.
//! - **Data integrity**: missing manifest components, unreadable payloads and
//!   protobuf lookups that miss. No partial component record is ever exposed.
//! - **Remote service**: non-zero return codes from FATE Flow, failed uploads and
//!   Kubernetes API errors. The remote message is carried verbatim.
//!
//! # Example
//!
//! ```rust
//! use fedserve::error::{FedServeError, Result};
//!
//! fn pick_type(name: &str) -> Result<()> {
//!     if !name.eq_ignore_ascii_case("fate") {
//!         return Err(FedServeError::UnknownModelType(name.to_string()));
//!     }
//!     Ok(())
//! }
//!
//! let err = pick_type("tff").unwrap_err();
//! assert!(err.is_configuration());
//! assert_eq!(err.to_string(), "unknown model type: tff");
//! ```

use std::io;
use thiserror::Error;

/// Main error type for fedserve operations.
#[derive(Error, Debug)]
pub enum FedServeError {
    // Configuration errors
    #[error("unknown model type: {0}")]
    UnknownModelType(String),

    #[error("unknown framework: {0}")]
    UnknownFramework(String),

    #[error("unknown deployer type: {0}")]
    UnknownDeployerType(String),

    #[error("unknown model storage type: {0}")]
    UnknownStorageType(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("unknown component type: {0}")]
    UnsupportedComponent(String),

    #[error("invalid config type: {0}")]
    InvalidConfigType(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    // Archive and payload errors
    #[error("unable to find component as the main model in {0}")]
    ComponentNotFound(String),

    #[error("more than one component can serve as the main model: {}", .0.join(", "))]
    AmbiguousComponent(Vec<String>),

    #[error("protobuf message type not found: {0}")]
    ProtoTypeNotFound(String),

    #[error("component {component} is missing field {field}")]
    MissingField { component: String, field: String },

    #[error("no weight recorded for feature: {0}")]
    MissingFeatureWeight(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Dispatch errors
    #[error("cannot find component converter for module: {component_type} in {framework}")]
    ConverterNotFound {
        component_type: String,
        framework: String,
    },

    // Remote service errors
    #[error("{service} error: {message}")]
    Remote { service: String, message: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // Lifecycle errors
    #[error("serving service {0} already exists")]
    AlreadyExists(String),

    #[error("model not converted yet")]
    NotConverted,

    #[error("timed out after {0}s waiting for {1}")]
    Timeout(u64, String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FedServeError {
    /// Shorthand for a remote-service failure carrying the remote message.
    pub fn remote(service: impl Into<String>, message: impl Into<String>) -> Self {
        FedServeError::Remote {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Whether this error stems from bad input or configuration rather than
    /// from data or a remote service.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            FedServeError::UnknownModelType(_)
                | FedServeError::UnknownFramework(_)
                | FedServeError::UnknownDeployerType(_)
                | FedServeError::UnknownStorageType(_)
                | FedServeError::InvalidArgument(_)
                | FedServeError::InvalidConfig { .. }
                | FedServeError::UnsupportedComponent(_)
                | FedServeError::InvalidConfigType(_)
                | FedServeError::NotImplemented(_)
        )
    }
}

impl From<serde_json::Error> for FedServeError {
    fn from(e: serde_json::Error) -> Self {
        FedServeError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for FedServeError {
    fn from(e: serde_yaml::Error) -> Self {
        FedServeError::Manifest(e.to_string())
    }
}

impl From<prost::DecodeError> for FedServeError {
    fn from(e: prost::DecodeError) -> Self {
        FedServeError::Decode(e.to_string())
    }
}

impl From<zip::result::ZipError> for FedServeError {
    fn from(e: zip::result::ZipError) -> Self {
        FedServeError::Decode(format!("zip archive: {}", e))
    }
}

impl From<reqwest::Error> for FedServeError {
    fn from(e: reqwest::Error) -> Self {
        FedServeError::Http(e.to_string())
    }
}

/// Result type alias for fedserve operations.
pub type Result<T> = std::result::Result<T, FedServeError>;
