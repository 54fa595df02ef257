//! Error types for the content-addressed core

use std::error::Error;
use std::fmt;

/// Boxed error type for error sources
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Core operation error with rich diagnostics
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub struct StoreError {
    kind: StoreErrorKind,
    #[source]
    source: Option<BoxError>,
    #[help]
    help: Option<String>,
    context: Option<String>,
}

/// Error categories for core operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Key or block absent
    NotFound,
    /// Collection creation conflict
    AlreadyExists,
    /// Empty key, undefined CID, or otherwise malformed caller input
    InvalidInput,
    /// A fetched block fails schema or shape checks
    Corrupted,
    /// Serialization/deserialization failed
    Serialization,
    /// Wrapped lower-level storage failure
    Backend,
}

impl StoreError {
    /// Create a new error with the given kind and optional source
    pub fn new(kind: StoreErrorKind, source: Option<BoxError>) -> Self {
        Self {
            kind,
            source,
            help: None,
            context: None,
        }
    }

    /// Add a help message to the error
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Add context information to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Get the error kind
    pub fn kind(&self) -> &StoreErrorKind {
        &self.kind
    }

    /// Whether this error is a `NotFound`
    pub fn is_not_found(&self) -> bool {
        self.kind == StoreErrorKind::NotFound
    }

    // Constructors for different error kinds

    /// Create a not found error
    pub fn not_found(resource: &str, id: impl fmt::Display) -> Self {
        Self::new(StoreErrorKind::NotFound, None)
            .with_context(format!("{} not found: {}", resource, id))
    }

    /// Create an already exists error
    pub fn already_exists(resource: &str, id: impl fmt::Display) -> Self {
        Self::new(StoreErrorKind::AlreadyExists, None)
            .with_context(format!("{} already exists: {}", resource, id))
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::InvalidInput, Some(msg.into().into()))
    }

    /// Create an invalid key error
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::InvalidInput, None)
            .with_help("keys must be non-empty, max 1024 bytes")
            .with_context(format!("key: {}", key.into()))
    }

    /// Create a corrupted block error
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Corrupted, Some(msg.into().into()))
            .with_help("node blocks must satisfy search-tree shape and digest invariants")
    }

    /// Create a serialization error
    pub fn serialization(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(StoreErrorKind::Serialization, Some(Box::new(source)))
    }

    /// Create a backend storage error
    pub fn backend(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(StoreErrorKind::Backend, Some(Box::new(source)))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;

        if let Some(ctx) = &self.context {
            write!(f, ": {}", ctx)?;
        }

        if let Some(src) = &self.source {
            write!(f, ": {}", src)?;
        }

        Ok(())
    }
}

/// Node-level errors raised while decoding or validating tree blocks
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum NodeError {
    /// Empty key not allowed
    #[error("Empty key not allowed")]
    EmptyKey,

    /// Key too long
    #[error("Key too long: {len} bytes (max {max})")]
    KeyTooLong {
        /// Actual key length
        len: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Undefined value CID
    #[error("Value CID must be defined")]
    UndefinedValue,

    /// Node structure invalid
    #[error("Node structure invalid: {0}")]
    InvalidNode(String),

    /// Serialization failed
    #[error("Serialization failed")]
    Serialization(#[source] BoxError),
}

impl From<NodeError> for StoreError {
    fn from(e: NodeError) -> Self {
        match e {
            NodeError::EmptyKey => StoreError::invalid_key(""),
            NodeError::KeyTooLong { len, max } => {
                StoreError::invalid_key(format!("length {}/{}", len, max))
            }
            NodeError::UndefinedValue => {
                StoreError::invalid_input("value CID must be defined")
            }
            NodeError::InvalidNode(msg) => StoreError::corrupted(msg),
            NodeError::Serialization(e) => {
                StoreError::new(StoreErrorKind::Serialization, Some(e))
            }
        }
    }
}
