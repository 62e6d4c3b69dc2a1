//! Error types for the flowmesh operator
//!
//! Errors are structured with fields so that a failed pass can be reported
//! on the FlowCollector status with a machine-readable reason and a message
//! a human can act on.

use thiserror::Error;

/// Main error type for flowmesh operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The FlowCollector spec is not acceptable
    #[error("validation error for {collector}: {message}")]
    Validation {
        /// Name of the FlowCollector with invalid configuration
        collector: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.processor.port")
        field: Option<String>,
    },

    /// A resource builder could not produce its descriptors
    #[error("build error [{component}]: {message}")]
    Build {
        /// Component whose builder failed
        component: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Optimistic concurrency kept failing for one resource
    #[error("conflict on {kind} {name} after {attempts} attempts")]
    Conflict {
        /// Resource kind
        kind: String,
        /// Resource name, namespace-qualified when namespaced
        name: String,
        /// Number of fetch-merge-write cycles attempted
        attempts: u32,
    },

    /// The pass was cancelled or ran past its deadline
    #[error("cancelled during {context}")]
    Cancelled {
        /// Phase that was interrupted
        context: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "status")
        context: String,
    },
}

impl Error {
    /// Create a validation error with collector context and field path
    pub fn validation_for_field(
        collector: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            collector: collector.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a build error for a component
    pub fn build(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Build {
            component: component.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an exhausted-conflict error
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>, attempts: u32) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            attempts,
        }
    }

    /// Create a cancellation error for the given phase
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// HTTP status code of the API error, if this wraps one
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some(ae.code),
            _ => None,
        }
    }

    /// True for a 409 returned by the API server
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// True for a 404 returned by the API server
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// Check if this error is retryable
    ///
    /// Conflicts, throttling, server errors and connection failures are
    /// transient. Other 4xx answers (forbidden, invalid) and everything caused
    /// by the FlowCollector spec or builder output need a human to fix something first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    !(400..500).contains(&ae.code) || matches!(ae.code, 404 | 409 | 429)
                }
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Build { .. } => false,
            Error::Serialization { .. } => false,
            Error::Conflict { .. } => true,
            Error::Cancelled { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Machine-readable reason used on status conditions and events
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 => "ApiConflict",
                kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => "Forbidden",
                _ => "ApiError",
            },
            Error::Validation { .. } => "ValidationFailed",
            Error::Build { .. } => "BuildFailed",
            Error::Serialization { .. } => "SerializationFailed",
            Error::Conflict { .. } => "ApiConflict",
            Error::Cancelled { .. } => "Cancelled",
            Error::Internal { .. } => "InternalError",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16) -> Error {
    Error::from(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("synthetic {code}"),
        reason: match code {
            404 => "NotFound",
            409 => "Conflict",
            403 => "Forbidden",
            _ => "InternalError",
        }
        .to_string(),
        code,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: How failures are classified during a reconciliation pass
    // ==========================================================================

    /// Story: a bad spec is reported once and never retried
    ///
    /// The operator cannot fix a malformed FlowCollector by trying again, so
    /// validation errors surface as a permanent failure condition.
    #[test]
    fn story_validation_errors_are_permanent() {
        let err = Error::validation_for_field("cluster", "spec.processor.port", "reserved port");
        assert!(err.to_string().contains("cluster"));
        assert!(err.to_string().contains("reserved port"));
        assert!(!err.is_retryable());
        assert_eq!(err.reason(), "ValidationFailed");

        match err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.processor.port"))
            }
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: API server answers are split into transient and permanent
    #[test]
    fn story_api_errors_are_classified_by_status_code() {
        assert!(api_error(409).is_retryable());
        assert!(api_error(409).is_conflict());
        assert_eq!(api_error(409).reason(), "ApiConflict");

        assert!(api_error(429).is_retryable());
        assert!(api_error(503).is_retryable());
        assert!(api_error(404).is_not_found());

        let forbidden = api_error(403);
        assert!(!forbidden.is_retryable());
        assert_eq!(forbidden.reason(), "Forbidden");

        assert!(!api_error(422).is_retryable());
        assert_eq!(api_error(422).reason(), "ApiError");
    }

    /// Story: builder failures name the component that produced them
    #[test]
    fn story_build_errors_carry_component() {
        let err = Error::build("Processor", "asset missing");
        assert!(err.to_string().contains("Processor"));
        assert!(!err.is_retryable());
        assert_eq!(err.reason(), "BuildFailed");
    }

    #[test]
    fn test_conflict_exhaustion_stays_retryable() {
        let err = Error::conflict("Service", "flowmesh/processor", 5);
        assert!(err.to_string().contains("after 5 attempts"));
        assert!(err.is_retryable());
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_serde_errors_convert_to_serialization() {
        let bad: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = bad.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { kind: None, .. }));
        assert!(!err.is_retryable());
    }
}
