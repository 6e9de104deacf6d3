//! Error types for the provisioning system.
//!
//! The hierarchy mirrors the lifecycle of an apply cycle: declaration
//! loading and validation, planning, provider calls, and state persistence.
//! Everything converges into [`ConvergeError`], which also knows how it maps
//! onto CLI exit codes.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the provisioning system.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Declaration loading or validation errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State store errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider API errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Apply cycle errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Declaration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The declaration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The declaration could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Two resources share a logical name.
    #[error("Duplicate {resource_type} name: {name}")]
    DuplicateName {
        /// Kind of resource.
        resource_type: String,
        /// The duplicated name.
        name: String,
    },

    /// A dependency names a resource that is not declared.
    #[error("Resource '{resource}' depends on undeclared resource '{dependency}'")]
    UnknownDependency {
        /// The declaring resource.
        resource: String,
        /// The unresolved dependency name.
        dependency: String,
    },

    /// A required attribute of the resource kind is missing.
    #[error("Resource '{resource}' ({kind}) is missing required attribute '{attribute}'")]
    MissingAttribute {
        /// The declaring resource.
        resource: String,
        /// Kind of the resource.
        kind: String,
        /// The missing attribute.
        attribute: String,
    },
}

/// State store errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Reading or writing the backing storage failed.
    #[error("State storage I/O failed: {message}")]
    Io {
        /// Description of the failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// A held lock was taken over or removed.
    #[error("State lock {lock_id} is no longer held by this process")]
    LockLost {
        /// Identifier of the lost lock.
        lock_id: String,
    },

    /// Recorded state changed between planning and applying.
    #[error("State changed since the plan was computed; run plan again")]
    StalePlan,

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },

    /// A provider identifier is already recorded under another logical name.
    #[error("Provider identifier {provider_id} is already recorded for '{existing}', refusing to assign it to '{name}'")]
    IdentifierConflict {
        /// The identifier being written.
        provider_id: String,
        /// Logical name that already holds it.
        existing: String,
        /// Logical name the write targeted.
        name: String,
    },
}

/// Provider API errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Authentication failed.
    #[error("Provider authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// The provider rejected the request.
    #[error("Provider rejected the request: {status} - {message}")]
    Rejected {
        /// Status code reported by the provider.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// Rate limited.
    #[error("Provider rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// The provider is temporarily unavailable.
    #[error("Provider unavailable: {message}")]
    Unavailable {
        /// Description of the outage.
        message: String,
    },

    /// Resource not found.
    #[error("Resource not found: {provider_id}")]
    NotFound {
        /// Provider identifier of the missing resource.
        provider_id: String,
    },

    /// Network error.
    #[error("Network error communicating with provider: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from the provider.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// The driver cannot manage this kind of resource.
    #[error("Driver '{driver}' does not support {kind} resources")]
    Unsupported {
        /// Driver name.
        driver: String,
        /// Resource kind.
        kind: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected: {cycle}")]
    Cycle {
        /// The resources involved, joined with arrows.
        cycle: String,
    },

    /// A resource depends on another resource scheduled for deletion.
    #[error("Resource '{resource}' depends on '{dependency}', which is scheduled for deletion")]
    DependencyConflict {
        /// The dependent resource.
        resource: String,
        /// The dependency scheduled for deletion.
        dependency: String,
    },

    /// Dependency resolution failed.
    #[error("Failed to resolve dependencies: {message}")]
    DependencyResolutionFailed {
        /// Description of the dependency issue.
        message: String,
    },
}

/// Apply cycle errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Maximum retry attempts exceeded.
    #[error("Maximum retry attempts ({attempts}) exceeded for {resource}")]
    MaxRetriesExceeded {
        /// Number of attempts made.
        attempts: u32,
        /// Resource that failed.
        resource: String,
    },

    /// The apply cycle was aborted.
    #[error("Apply aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for provisioning operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

/// Exit code for a fully successful run.
pub const EXIT_SUCCESS: u8 = 0;

/// Exit code when some resources were left unreconciled.
pub const EXIT_PARTIAL_FAILURE: u8 = 1;

/// Exit code when nothing was attempted because the declaration is invalid.
pub const EXIT_VALIDATION: u8 = 2;

/// Exit code for state store failures.
pub const EXIT_STATE: u8 = 3;

/// Exit code for any other failure.
pub const EXIT_OTHER: u8 = 4;

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true for errors raised before any provider mutation.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Plan(_))
    }

    /// Maps the error onto the CLI exit code.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Plan(_) => EXIT_VALIDATION,
            Self::State(_) => EXIT_STATE,
            _ => EXIT_OTHER,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates an I/O error with the given message.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    /// Returns true for transient failures worth retrying.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Unavailable { .. } | Self::NetworkError { .. }
        )
    }

    /// Returns true when the failed call is known not to have mutated anything.
    ///
    /// Network failures and garbled responses are ambiguous: the request may
    /// have been processed before the connection dropped.
    #[must_use]
    pub const fn leaves_consistent_state(&self) -> bool {
        !matches!(self, Self::NetworkError { .. } | Self::InvalidResponse { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_classification() {
        assert!(ProviderError::RateLimited { retry_after_secs: 3 }.is_retryable());
        assert!(ProviderError::network("reset").is_retryable());
        assert!(!ProviderError::rejected(400, "bad cidr").is_retryable());
        assert!(!ProviderError::network("reset").leaves_consistent_state());
        assert!(ProviderError::rejected(400, "bad cidr").leaves_consistent_state());
    }

    #[test]
    fn test_exit_codes() {
        let validation = ConvergeError::Config(ConfigError::validation_general("bad"));
        assert_eq!(validation.exit_code(), EXIT_VALIDATION);
        assert!(validation.is_validation());

        let cycle = ConvergeError::Plan(PlanError::Cycle {
            cycle: String::from("a -> b -> a"),
        });
        assert_eq!(cycle.exit_code(), EXIT_VALIDATION);

        let state = ConvergeError::State(StateError::io("disk full"));
        assert_eq!(state.exit_code(), EXIT_STATE);

        let provider = ConvergeError::Provider(ProviderError::network("reset"));
        assert_eq!(provider.exit_code(), EXIT_OTHER);
    }
}
