//! Error types for datastore operations

use std::error::Error;
use std::fmt;

/// Boxed error type for error sources
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Result type alias for datastore operations
pub type Result<T> = std::result::Result<T, DatastoreError>;

/// Datastore operation error with rich diagnostics
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub struct DatastoreError {
    kind: DatastoreErrorKind,
    #[source]
    source: Option<BoxError>,
    #[help]
    help: Option<String>,
    context: Option<String>,
}

/// Error categories for datastore operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatastoreErrorKind {
    /// Key absent
    NotFound,
    /// Malformed caller input: empty key, oversized value, bad directive
    InvalidInput,
    /// A stored record fails shape checks
    Corrupted,
    /// Caller-observable cancellation
    Cancelled,
    /// A deadline expired
    Timeout,
    /// Wrapped lower-level storage failure
    Backend,
    /// A subscriber misbehaved (logged, not propagated to producers)
    Subscriber,
    /// Serialization/deserialization failed
    Serialization,
    /// The datastore has been closed
    Closed,
}

impl DatastoreError {
    /// Create a new error with the given kind and optional source
    pub fn new(kind: DatastoreErrorKind, source: Option<BoxError>) -> Self {
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
    pub fn kind(&self) -> &DatastoreErrorKind {
        &self.kind
    }

    /// Whether this error is a `NotFound`
    pub fn is_not_found(&self) -> bool {
        self.kind == DatastoreErrorKind::NotFound
    }

    /// Whether this error is a `Cancelled`
    pub fn is_cancelled(&self) -> bool {
        self.kind == DatastoreErrorKind::Cancelled
    }

    // Constructors for different error kinds

    /// Create a not found error
    pub fn not_found(key: impl fmt::Display) -> Self {
        Self::new(DatastoreErrorKind::NotFound, None)
            .with_context(format!("key not found: {}", key))
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::new(DatastoreErrorKind::InvalidInput, Some(msg.into().into()))
    }

    /// Create a corrupted record error
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::new(DatastoreErrorKind::Corrupted, Some(msg.into().into()))
    }

    /// Create a cancellation error
    pub fn cancelled() -> Self {
        Self::new(DatastoreErrorKind::Cancelled, None)
    }

    /// Create a timeout error
    pub fn timeout(what: &str) -> Self {
        Self::new(DatastoreErrorKind::Timeout, None)
            .with_context(format!("{} timed out", what))
    }

    /// Create a backend storage error
    pub fn backend(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(DatastoreErrorKind::Backend, Some(Box::new(source)))
    }

    /// Create a subscriber failure error
    pub fn subscriber(id: impl fmt::Display, msg: impl Into<String>) -> Self {
        Self::new(DatastoreErrorKind::Subscriber, Some(msg.into().into()))
            .with_context(format!("subscriber: {}", id))
    }

    /// Create a serialization error
    pub fn serialization(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(DatastoreErrorKind::Serialization, Some(Box::new(source)))
    }

    /// Create a closed-datastore error
    pub fn closed() -> Self {
        Self::new(DatastoreErrorKind::Closed, None)
            .with_help("the datastore has been closed; open a new handle")
    }
}

impl fmt::Display for DatastoreError {
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

impl From<sled::Error> for DatastoreError {
    fn from(e: sled::Error) -> Self {
        DatastoreError::backend(e)
    }
}

impl From<weft_repo::StoreError> for DatastoreError {
    fn from(e: weft_repo::StoreError) -> Self {
        let kind = match e.kind() {
            weft_repo::StoreErrorKind::NotFound => DatastoreErrorKind::NotFound,
            weft_repo::StoreErrorKind::InvalidInput => DatastoreErrorKind::InvalidInput,
            weft_repo::StoreErrorKind::Corrupted => DatastoreErrorKind::Corrupted,
            weft_repo::StoreErrorKind::Serialization => DatastoreErrorKind::Serialization,
            _ => DatastoreErrorKind::Backend,
        };
        DatastoreError::new(kind, Some(Box::new(e)))
    }
}
