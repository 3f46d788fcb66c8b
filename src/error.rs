//! Error types for the multi-site coordinator
//!
//! Provides structured error types for the coordination store, the
//! coordination primitives, DR operation handlers, and the repair
//! coordinator, plus a recovery-action classification used by the
//! control loop.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the coordinator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Coordination Store Errors
    // =========================================================================
    #[error("Coordination session disconnected")]
    SessionLost,

    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Node not found: {path}")]
    NodeNotFound { path: String },

    #[error("Node already exists: {path}")]
    NodeExists { path: String },

    #[error("Version conflict writing {path}")]
    VersionConflict { path: String },

    #[error("Corrupted record at {path}: {reason}")]
    CorruptedRecord { path: String, reason: String },

    // =========================================================================
    // Primitive Errors
    // =========================================================================
    #[error("Lock {name} is held by {holder}")]
    LockHeld { name: String, holder: String },

    #[error("Lock {name} released without being held")]
    LockNotHeld { name: String },

    #[error("Barrier {name} incomplete: {arrived} of {required} participants")]
    BarrierIncomplete {
        name: String,
        arrived: u32,
        required: u32,
    },

    #[error("Timed out after {waited:?}: {operation}")]
    Timeout { operation: String, waited: Duration },

    // =========================================================================
    // Site / DR Operation Errors
    // =========================================================================
    #[error("Site not found: {site_id}")]
    SiteNotFound { site_id: String },

    #[error("DR operation {operation} failed on site {site_id}: {reason}")]
    SiteOperationFailed {
        site_id: String,
        operation: String,
        reason: String,
    },

    #[error("No handler registered for action: {action}")]
    UnknownAction { action: String },

    #[error("Concurrent DR operation in progress: {operation}")]
    OperationInProgress { operation: String },

    // =========================================================================
    // Service Registry Errors
    // =========================================================================
    #[error("Service not found: {name}/{version}")]
    ServiceNotFound { name: String, version: String },

    #[error("No endpoint {endpoint_key} matching local address family for {name}")]
    EndpointUnresolvable { name: String, endpoint_key: String },

    // =========================================================================
    // Repair Job Errors
    // =========================================================================
    #[error("Repair declined: {0}")]
    RepairDeclined(String),

    #[error("Repair job stalled after {stalled_for:?} at {progress}%")]
    RepairStalled { stalled_for: Duration, progress: u8 },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action the control loop takes in response to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Transient store trouble, retry with exponential backoff
    RetryWithBackoff,
    /// Retry after a specific delay
    RetryAfter(Duration),
    /// Convert the affected site to STANDBY_ERROR and keep looping
    ErrorSite,
    /// Unrecoverable, halt the affected node's loop
    Halt,
}

impl Error {
    /// Determine what action the control loop takes for this error
    pub fn action(&self) -> RecoveryAction {
        match self {
            // Transient coordination trouble - retry with backoff
            Error::SessionLost
            | Error::StoreUnavailable(_)
            | Error::VersionConflict { .. }
            | Error::LockHeld { .. } => RecoveryAction::RetryWithBackoff,

            // Another node is mid-operation - wait for it
            Error::OperationInProgress { .. } => {
                RecoveryAction::RetryAfter(Duration::from_secs(10))
            }

            // Deadline expired - the caller owns the fallback path, the loop
            // itself just comes back around later
            Error::Timeout { .. } | Error::BarrierIncomplete { .. } => {
                RecoveryAction::RetryAfter(Duration::from_secs(30))
            }

            // Handler-level failures error the site, never crash the loop
            Error::SiteOperationFailed { .. }
            | Error::RepairStalled { .. }
            | Error::SiteNotFound { .. } => RecoveryAction::ErrorSite,

            // Corrupt durable state cannot be retried into health
            Error::CorruptedRecord { .. } | Error::Configuration(_) => RecoveryAction::Halt,

            // All other errors - retry with backoff
            _ => RecoveryAction::RetryWithBackoff,
        }
    }

    /// Check if this error is retryable by the control loop
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), RecoveryAction::Halt)
    }

    /// Check if this error is a deadline expiry
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::BarrierIncomplete { .. })
    }

    /// Check if this error is fatal to the node's control loop
    pub fn is_fatal(&self) -> bool {
        matches!(self.action(), RecoveryAction::Halt)
    }
}

/// Result type alias for the coordinator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::OperationInProgress {
            operation: "switchover".into(),
        };
        assert_eq!(
            err.action(),
            RecoveryAction::RetryAfter(Duration::from_secs(10))
        );

        let err = Error::Configuration("bad site id".into());
        assert_eq!(err.action(), RecoveryAction::Halt);

        let err = Error::SiteOperationFailed {
            site_id: "site-2".into(),
            operation: "remove-standby".into(),
            reason: "gossip eviction failed".into(),
        };
        assert_eq!(err.action(), RecoveryAction::ErrorSite);
    }

    #[test]
    fn test_error_classification() {
        let transient = Error::SessionLost;
        assert!(transient.is_retryable());
        assert!(!transient.is_fatal());

        let corrupt = Error::CorruptedRecord {
            path: "/config/targetinfo/global".into(),
            reason: "truncated payload".into(),
        };
        assert!(!corrupt.is_retryable());
        assert!(corrupt.is_fatal());

        let timeout = Error::BarrierIncomplete {
            name: "poweroff".into(),
            arrived: 2,
            required: 3,
        };
        assert!(timeout.is_timeout());
    }
}
