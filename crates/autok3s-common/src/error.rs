//! Error types for autok3s
//!
//! Errors carry the cluster context name and provider so that a failure
//! surfaced from deep inside a provisioning phase is still attributable.
//! The variants follow the failure taxonomy the engine reacts to: credential
//! failures and preflight conflicts fail fast, transient provider errors are
//! retried at the call site, and the remaining variants abort the operation
//! and trigger rollback.

use thiserror::Error;

/// Placeholder cluster or provider name for errors raised outside a cluster
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Every failure the engine and its back-ends can report
#[derive(Debug, Error)]
pub enum Error {
    /// The back-end rejected our credentials
    #[error("credential error [{provider}]: {message}")]
    Credential {
        /// Provider that rejected the credentials
        provider: String,
        /// Back-end response
        message: String,
    },

    /// The operation cannot start (cluster exists, required option missing)
    #[error("preflight check failed for {cluster}: {message}")]
    Preflight {
        /// Context name of the cluster
        cluster: String,
        /// Description of the conflict
        message: String,
    },

    /// Invalid or inconsistent configuration
    #[error("configuration error for {cluster}: {message}")]
    Configuration {
        /// Context name of the cluster
        cluster: String,
        /// Why the configuration cannot be used
        message: String,
        /// The offending option (e.g., "options.subnet_id")
        field: Option<String>,
    },

    /// Back-end API error
    #[error("provider error [{provider}] for {cluster}: {message}")]
    Provider {
        /// Context name of the cluster
        cluster: String,
        /// Provider type (aws, alibaba, tencent, native)
        provider: String,
        /// Back-end response
        message: String,
        /// Throttling and timeouts are retryable; quota and validation are not
        retryable: bool,
    },

    /// The back-end created a different number of instances than requested
    #[error("instance count mismatch for {cluster}: requested {requested} {role} instance(s), back-end returned {returned}")]
    CountMismatch {
        /// Context name of the cluster
        cluster: String,
        /// Role of the batch (master or worker)
        role: String,
        /// Number of instances requested
        requested: usize,
        /// Number of instances the back-end returned
        returned: usize,
    },

    /// Instances never reached the target status within the polling bound
    #[error("instances of {cluster} did not reach {target} after {attempts} attempt(s): {}", pending.join(", "))]
    ConvergenceTimeout {
        /// Context name of the cluster
        cluster: String,
        /// Target status that was awaited
        target: String,
        /// Instance ids that had not converged
        pending: Vec<String>,
        /// Number of polling attempts made
        attempts: u32,
    },

    /// Elastic/floating address allocation or association failed
    #[error("secondary resource error for {cluster}: {message}")]
    SecondaryResource {
        /// Context name of the cluster
        cluster: String,
        /// Which allocation, association, or task step failed
        message: String,
        /// Resource ids (allocations or instances) affected
        resources: Vec<String>,
    },

    /// The k3s install collaborator failed
    #[error("installer error for {cluster}: {message}")]
    Installer {
        /// Context name of the cluster
        cluster: String,
        /// Installer output or failure reason
        message: String,
    },

    /// A state file, inventory, or config document could not be parsed
    #[error("serialization error: {message}")]
    Serialization {
        /// Parser message
        message: String,
    },

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A worker task panicked or was cancelled
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// What went wrong
        message: String,
        /// Context where the error occurred (e.g., "launcher", "poller")
        context: String,
    },
}

impl Error {
    /// Create a credential error for a provider
    pub fn credential(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Credential {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create a preflight error with cluster context
    pub fn preflight(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Preflight {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error with cluster context
    pub fn configuration(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error with cluster context and option path
    pub fn configuration_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    fn provider_error(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable,
        }
    }

    /// Transient back-end failure raised where the cluster is not known,
    /// typically inside an adapter
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::provider_error(UNKNOWN_CONTEXT, UNKNOWN_CONTEXT, msg, true)
    }

    /// Transient back-end failure attributed to a cluster and provider
    pub fn provider_for(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::provider_error(cluster, provider, msg, true)
    }

    /// Back-end failure that retrying cannot fix (quota, invalid request)
    pub fn provider_permanent(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::provider_error(cluster, provider, msg, false)
    }

    /// Create a secondary resource error
    pub fn secondary(
        cluster: impl Into<String>,
        msg: impl Into<String>,
        resources: Vec<String>,
    ) -> Self {
        Self::SecondaryResource {
            cluster: cluster.into(),
            message: msg.into(),
            resources,
        }
    }

    /// Create an installer error
    pub fn installer(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Installer {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Wrap a parser message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Internal failure tagged with the component it came from
    pub fn internal_with_context(msg: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether retrying the failed call might succeed
    ///
    /// Only transient provider errors are retryable. Credential failures in
    /// particular must never be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider {
                retryable: true,
                ..
            }
        )
    }

    /// Whether this is a credential/authorization failure
    pub fn is_credential(&self) -> bool {
        matches!(self, Self::Credential { .. })
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
