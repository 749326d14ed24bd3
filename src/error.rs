/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The error kinds of spec §7, collapsed into a single enum so call sites can
//! use `?` throughout instead of threading bespoke per-layer error types.

pub type Result<T> = std::result::Result<T, AuthError>;

/// Unified error type for every fallible operation in this crate.
///
/// `Display` renders a single line suitable for logs; callers that need to
/// hand a caller-visible failure code should go through
/// [`AuthError::conn_open_reason`] instead of matching on this directly, since
/// the public façade only promises the four-value `reason` integer of spec §7.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not initialized")]
    NotInitialized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dial timed out")]
    Timeout,
}

impl AuthError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        AuthError::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        AuthError::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        AuthError::AlreadyExists(msg.into())
    }

    pub fn protocol_violation(msg: impl Into<String>) -> Self {
        AuthError::ProtocolViolation(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        AuthError::Crypto(msg.into())
    }

    /// Collapse this error down to the single `reason` integer delivered
    /// through `OnConnOpenFailed`, per spec §7: `0=success, -1=generic
    /// failure, -2=timeout, -3=connection lost`.
    pub fn conn_open_reason(&self) -> i32 {
        match self {
            AuthError::Timeout => -2,
            AuthError::Io(_) => -3,
            _ => -1,
        }
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(e: serde_json::Error) -> Self {
        AuthError::ProtocolViolation(format!("malformed handshake json: {e}"))
    }
}

impl From<aes_gcm::Error> for AuthError {
    fn from(_: aes_gcm::Error) -> Self {
        AuthError::Crypto("aead operation failed".to_string())
    }
}

impl From<hkdf::InvalidLength> for AuthError {
    fn from(_: hkdf::InvalidLength) -> Self {
        AuthError::Crypto("hkdf requested an invalid output length".to_string())
    }
}
