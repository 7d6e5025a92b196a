//! Error taxonomy for directory operations.
//!
//! Every fault that originates from a server status carries its
//! [`ResultCode`] so calling code can branch on it, e.g. telling
//! invalid credentials apart from a transient busy server.

use std::time::Duration;

use thiserror::Error;

use crate::control::ResponseControl;
use crate::result_code::ResultCode;

/// Directory client errors.
#[derive(Debug, Error)]
pub enum LdapError {
    /// Server answered with a non-success status.
    #[error("LDAP operation failed with {code}: {message}")]
    Protocol {
        code: ResultCode,
        message: String,
        matched_dn: String,
        controls: Vec<ResponseControl>,
    },

    /// Non-success status that the configured retry set marks as transient.
    #[error("LDAP operation failed with retryable {code}: {message}")]
    Retryable {
        code: ResultCode,
        message: String,
        controls: Vec<ResponseControl>,
    },

    /// Checkout waited past its timeout.
    #[error("Connection pool exhausted: no session available within {0:?}")]
    PoolExhausted(Duration),

    /// Pool has been closed.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// Session failed a health check. The pool handles this internally.
    #[error("Session validation failed: {0}")]
    Validation(String),

    /// Malformed or unknown control or entry payload.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Caller error: unsupported SASL mechanism, malformed DN, bad settings.
    #[error("LDAP configuration error: {0}")]
    Configuration(String),

    /// Backend could not establish a session.
    #[error("LDAP connection failed: {0}")]
    Connection(String),
}

impl LdapError {
    /// Creates a protocol error without controls.
    #[must_use]
    pub fn protocol(code: ResultCode, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
            matched_dn: String::new(),
            controls: Vec::new(),
        }
    }

    /// Creates a decode error.
    #[must_use]
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Creates a connection error.
    #[must_use]
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Result code of the server status behind this error, if any.
    #[must_use]
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            Self::Protocol { code, .. } | Self::Retryable { code, .. } => Some(*code),
            Self::Decode(_) => Some(ResultCode::DecodingError),
            Self::Connection(_) => Some(ResultCode::ConnectError),
            _ => None,
        }
    }

    /// Response controls the server attached to the failed operation.
    #[must_use]
    pub fn controls(&self) -> &[ResponseControl] {
        match self {
            Self::Protocol { controls, .. } | Self::Retryable { controls, .. } => controls,
            _ => &[],
        }
    }

    /// True when a retry wrapper may resubmit the operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    /// True for caller errors that no amount of retrying fixes.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::Configuration(_))
    }

    /// Checks if this is a connection-related error.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::PoolExhausted(_) | Self::PoolClosed
        )
    }
}

/// Result type for directory operations.
pub type LdapResult<T> = Result<T, LdapError>;
