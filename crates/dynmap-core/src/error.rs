//! Unified error handling for dynmap.
//!
//! The variants follow the failure taxonomy of the engine:
//! structural tree conflicts fail a single mapping at build time, extraction
//! failures are local to one substitution, assembly failures are local to one
//! generated request and validation failures surface when a mapping is saved.

/// Unified error type for dynmap.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mapping failed structural validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Mapping tree insertion or lookup violated a structural invariant.
    #[error("Resolve error: {0}")]
    Resolve(String),

    /// A payload could not be decoded or a path could not be evaluated.
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// A platform request could not be assembled.
    #[error("Assembly error: {0}")]
    Assembly(String),

    /// Identity lookup or implicit device creation failed.
    #[error("Identity error: {0}")]
    Identity(String),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Config(e.to_string())
    }
}

// Identity collaborators are free to use anyhow internally.
impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Identity(format!("{:#}", e))
    }
}

/// Convenience macros for creating errors.
#[macro_export]
macro_rules! config_err {
    ($msg:expr) => {
        $crate::error::Error::Config($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! validation_err {
    ($msg:expr) => {
        $crate::error::Error::Validation($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Validation(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! resolve_err {
    ($msg:expr) => {
        $crate::error::Error::Resolve($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Resolve(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! extraction_err {
    ($msg:expr) => {
        $crate::error::Error::Extraction($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Extraction(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! assembly_err {
    ($msg:expr) => {
        $crate::error::Error::Assembly($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Assembly(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! identity_err {
    ($msg:expr) => {
        $crate::error::Error::Identity($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Identity(format!($fmt, $($arg)*))
    };
}
