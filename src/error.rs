//! Error types and handling for EvseBridge
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for EvseBridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Main error type for EvseBridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Modbus communication errors
    #[error("Modbus error: {message}")]
    Modbus { message: String },

    /// D-Bus communication errors
    #[error("D-Bus error: {message}")]
    DBus { message: String },

    /// HTTP/Web server errors
    #[error("Web server error: {message}")]
    Web { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Network-related errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// External API integration errors (price feed, etc.)
    #[error("API error: {message}")]
    Api { message: String },

    /// Authentication/authorization errors
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Git/update related errors
    #[error("Update error: {message}")]
    Update { message: String },

    /// A bounded retry loop exhausted its attempts
    #[error("{operation} gave up after {attempts} attempts: {last_cause}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last_cause: String,
    },

    /// A write was not confirmed by a subsequent read-back within tolerance
    #[error("verification of register {register} failed: wrote {written}, read back {read_back}")]
    Verification {
        register: u16,
        written: f32,
        read_back: f32,
    },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl BridgeError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        BridgeError::Config {
            message: message.into(),
        }
    }

    /// Create a new Modbus error
    pub fn modbus<S: Into<String>>(message: S) -> Self {
        BridgeError::Modbus {
            message: message.into(),
        }
    }

    /// Create a new D-Bus error
    pub fn dbus<S: Into<String>>(message: S) -> Self {
        BridgeError::DBus {
            message: message.into(),
        }
    }

    /// Create a new web error
    pub fn web<S: Into<String>>(message: S) -> Self {
        BridgeError::Web {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        BridgeError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        BridgeError::Io {
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        BridgeError::Network {
            message: message.into(),
        }
    }

    /// Create a new API error
    pub fn api<S: Into<String>>(message: S) -> Self {
        BridgeError::Api {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        BridgeError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new update error
    pub fn update<S: Into<String>>(message: S) -> Self {
        BridgeError::Update {
            message: message.into(),
        }
    }

    /// Create a new auth error
    pub fn auth<S: Into<String>>(message: S) -> Self {
        BridgeError::Auth {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        BridgeError::Generic {
            message: message.into(),
        }
    }

    /// Create a retry-exhausted error
    pub fn retry_exhausted<S: Into<String>>(operation: S, attempts: u32, last_cause: S) -> Self {
        BridgeError::RetryExhausted {
            operation: operation.into(),
            attempts,
            last_cause: last_cause.into(),
        }
    }

    /// Create a verification-mismatch error
    pub fn verification(register: u16, written: f32, read_back: f32) -> Self {
        BridgeError::Verification {
            register,
            written,
            read_back,
        }
    }

    /// Whether this error originates in the transport layer (socket reset,
    /// timeout, refused connection) as opposed to a protocol-level rejection.
    /// Only transport errors justify a reconnect-and-retry cycle.
    pub fn is_transport(&self) -> bool {
        match self {
            BridgeError::Modbus { message } => {
                let m = message.to_lowercase();
                m.contains("connection")
                    || m.contains("disconnected")
                    || m.contains("reset")
                    || m.contains("broken pipe")
                    || m.contains("not connected")
            }
            BridgeError::Timeout { .. } | BridgeError::Network { .. } => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for BridgeError {
    fn from(err: serde_yaml::Error) -> Self {
        BridgeError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization {
            message: err.to_string(),
        }
    }
}

// Note: tokio_modbus::Error may not exist in this version, commented out for now
// impl From<tokio_modbus::Error> for BridgeError {
//     fn from(err: tokio_modbus::Error) -> Self {
//         BridgeError::modbus(err.to_string())
//     }
// }

#[cfg(feature = "pricefeed")]
impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        BridgeError::network(err.to_string())
    }
}

// Note: zbus not included in this version, commented out for now
// impl From<zbus::Error> for BridgeError {
//     fn from(err: zbus::Error) -> Self {
//         BridgeError::dbus(err.to_string())
//     }
// }

// External config::ConfigError not used; we manage config locally

impl From<chrono::ParseError> for BridgeError {
    fn from(err: chrono::ParseError) -> Self {
        BridgeError::validation("datetime", &err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = BridgeError::config("test config error");
        assert!(matches!(err, BridgeError::Config { .. }));

        let err = BridgeError::modbus("test modbus error");
        assert!(matches!(err, BridgeError::Modbus { .. }));

        let err = BridgeError::validation("field", "test validation error");
        assert!(matches!(err, BridgeError::Validation { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = BridgeError::config("test error");
        let error_string = format!("{}", err);
        assert_eq!(error_string, "Configuration error: test error");

        let err = BridgeError::validation("test_field", "invalid value");
        let error_string = format!("{}", err);
        assert_eq!(error_string, "Validation error: test_field - invalid value");
    }

    #[test]
    fn transport_errors_are_distinguished_from_protocol_errors() {
        assert!(BridgeError::modbus("connection reset by peer").is_transport());
        assert!(BridgeError::timeout("read timed out").is_transport());
        assert!(!BridgeError::modbus("illegal data address").is_transport());
        assert!(!BridgeError::validation("field", "bad").is_transport());
    }

    #[test]
    fn retry_exhausted_carries_context() {
        let err = BridgeError::retry_exhausted("read_holding_registers", 3, "timeout");
        assert!(matches!(err, BridgeError::RetryExhausted { attempts: 3, .. }));
        assert!(format!("{err}").contains("gave up after 3 attempts"));
    }
}
