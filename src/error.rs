//! Error types for gatt_central
//!
//! `GattError` is the failure taxonomy every operation reports through its
//! terminal event. `AppError` wraps it together with the configuration and
//! I/O failures of the binary.

use std::fmt;

use thiserror::Error;

/// Kind of GATT attribute a lookup was looking for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    /// Primary or included service
    Service,
    /// Characteristic within a service
    Characteristic,
    /// Descriptor within a characteristic
    Descriptor,
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service => write!(f, "service"),
            Self::Characteristic => write!(f, "characteristic"),
            Self::Descriptor => write!(f, "descriptor"),
        }
    }
}

/// Failure of a single GATT operation
///
/// None of these are fatal to the manager. They are reported through the
/// operation's terminal event and, for precondition failures, also returned
/// synchronously from the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GattError {
    /// The device id has never been seen by the registry
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The device is known but holds no active connection
    #[error("device not connected: {0}")]
    NotConnected(String),

    /// The connected device has no attribute with this UUID
    #[error("{kind} {uuid} not found")]
    NotFound { kind: AttributeKind, uuid: String },

    /// The transport call did not complete
    #[error("transport failure: {0}")]
    Transport(String),

    /// The call completed but the remote GATT server reported an error status
    #[error("protocol failure: {0}")]
    Protocol(String),

    /// The call succeeded without the payload it should carry
    #[error("{0}: result is empty")]
    EmptyResult(String),

    /// A UUID string could not be canonicalized
    #[error("invalid UUID: {0}")]
    InvalidUuid(String),
}

impl GattError {
    /// Create a not-found error for an attribute
    pub fn not_found(kind: AttributeKind, uuid: impl Into<String>) -> Self {
        Self::NotFound { kind, uuid: uuid.into() }
    }

    /// Whether this failure was raised before any transport call was made
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::DeviceNotFound(_) | Self::NotConnected(_) | Self::InvalidUuid(_))
    }
}

/// Application error type
#[derive(Debug, Error)]
pub enum AppError {
    /// GATT operation error
    #[error("GATT error: {0}")]
    Gatt(#[from] GattError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Transport construction error
    #[error("Transport error: {0}")]
    Transport(#[from] crate::bluetooth::TransportError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Logger setup error
    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

/// Context attached to log lines and errors of one operation
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Component performing the operation
    pub component: String,
    /// Operation being performed
    pub operation: String,
    /// Extra key/value pairs
    pub metadata: Vec<(String, String)>,
    /// Message suitable for showing to a user
    pub user_message: Option<String>,
}

impl ErrorContext {
    /// Create a new context
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            metadata: Vec::new(),
            user_message: None,
        }
    }

    /// Attach a key/value pair
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.metadata.push((key.into(), value.to_string()));
        self
    }

    /// Attach a user-facing message
    pub fn with_user_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = Some(message.into());
        self
    }
}

/// Renders as a log prefix, e.g. `[BleManager::read device=0a1b2c3d4e5f] `
impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}::{}", self.component, self.operation)?;
        for (key, value) in &self.metadata {
            write!(f, " {}={}", key, value)?;
        }
        write!(f, "] ")
    }
}
