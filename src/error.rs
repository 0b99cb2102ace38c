//! Error types for the pool cluster operator
//!
//! One error enum is shared by the topology planner, the reconciler, the
//! admission webhook and the bootstrap code. Each variant maps to an
//! [`ErrorAction`] so the work queue knows whether and when to retry.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Conflict updating {kind}/{name}: resource version is stale")]
    Conflict { kind: String, name: String },

    // =========================================================================
    // Topology Errors
    // =========================================================================
    #[error("No candidate nodes for pool cluster claim {pcc}")]
    NoCandidates { pcc: String },

    #[error("Node {node} has {found} usable block devices, {required} required")]
    InsufficientDevicesOnNode {
        node: String,
        required: usize,
        found: usize,
    },

    #[error("Block device {device} does not belong to node {node}")]
    DeviceNotOnNode { device: String, node: String },

    #[error("Raid group {group} of type {raid_type} has {count} block devices: {reason}")]
    InvalidArity {
        group: String,
        raid_type: String,
        count: usize,
        reason: String,
    },

    #[error("Block device {device} has no device ID")]
    DeviceMissingId { device: String },

    #[error("Block device {device} is not active")]
    DeviceInactive { device: String },

    #[error("Node selector {selector} matched {matched} nodes, exactly one required")]
    NodeSelectorUnmatched { selector: String, matched: usize },

    // =========================================================================
    // Reconcile Errors
    // =========================================================================
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Invalid {kind}: {}", errors.join("; "))]
    Builder { kind: String, errors: Vec<String> },

    // =========================================================================
    // Admission Errors
    // =========================================================================
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Policy(String),

    // =========================================================================
    // Bootstrap Errors
    // =========================================================================
    #[error("Certificate error: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),

    #[error("TLS error: {0}")]
    Tls(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::Conflict { .. }
            | Error::Timeout(_)
            | Error::InvariantViolation(_) => ErrorAction::RequeueWithBackoff,

            // Waiting on the node agent or on the device discovery daemon
            Error::PreconditionFailed(_) => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            // Cluster shape may change as nodes and devices come and go
            Error::NoCandidates { .. }
            | Error::InsufficientDevicesOnNode { .. }
            | Error::NodeSelectorUnmatched { .. }
            | Error::DeviceInactive { .. }
            | Error::DeviceMissingId { .. } => ErrorAction::RequeueAfter(Duration::from_secs(60)),

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::Validation(_)
            | Error::Policy(_)
            | Error::Builder { .. }
            | Error::InvalidArity { .. }
            | Error::DeviceNotOnNode { .. } => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(resp)) => resp.code == 429 || resp.code >= 500,
            Error::Kube(kube::Error::HyperError(_)) | Error::Kube(kube::Error::Service(_)) => true,
            Error::Kube(_) => false,
            Error::Conflict { .. } | Error::Timeout(_) => true,
            _ => false,
        }
    }

    /// Whether the error reports an object that does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Whether the error reports an object that already exists
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::ResourceExists { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409 && resp.reason == "AlreadyExists",
            _ => false,
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
