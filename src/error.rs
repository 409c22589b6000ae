//! Error taxonomy for the plugin lifecycle core.
//!
//! Every error returned by the [`PluginManager`](crate::plugin::PluginManager)
//! carries the plugin id, the attempted operation and the underlying cause so
//! a caller can decide whether to retry.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::plugin::record::PluginState;

/// Lifecycle operation being attempted when an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Install,
    Enable,
    Disable,
    Uninstall,
    Update,
    Restore,
    Recover,
    Invoke,
    Refresh,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Install => "install",
            Operation::Enable => "enable",
            Operation::Disable => "disable",
            Operation::Uninstall => "uninstall",
            Operation::Update => "update",
            Operation::Restore => "restore",
            Operation::Recover => "recover",
            Operation::Invoke => "invoke",
            Operation::Refresh => "refresh",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a package could not be turned into a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorErrorKind {
    /// No manifest, or the manifest is not well-formed.
    Malformed,
    /// A required manifest key is absent.
    MissingField,
    /// The manifest schema or required interface version is not supported.
    UnsupportedVersion,
}

impl DescriptorErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DescriptorErrorKind::Malformed => "MALFORMED",
            DescriptorErrorKind::MissingField => "MISSING_FIELD",
            DescriptorErrorKind::UnsupportedVersion => "UNSUPPORTED_VERSION",
        }
    }
}

impl fmt::Display for DescriptorErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A package could not be parsed. Always raised before any registry write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct DescriptorError {
    pub kind: DescriptorErrorKind,
    pub message: String,
}

impl DescriptorError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            kind: DescriptorErrorKind::Malformed,
            message: message.into(),
        }
    }

    pub fn missing_field(field: &str) -> Self {
        Self {
            kind: DescriptorErrorKind::MissingField,
            message: format!("manifest is missing required field '{}'", field),
        }
    }

    pub fn unsupported_version(message: impl Into<String>) -> Self {
        Self {
            kind: DescriptorErrorKind::UnsupportedVersion,
            message: message.into(),
        }
    }
}

/// Failure of a plugin or capability store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("plugin '{0}' not found")]
    NotFound(String),

    #[error("plugin '{0}' already exists")]
    Duplicate(String),

    #[error("plugin '{plugin_id}' cannot be deleted in state {state}")]
    InvalidState {
        plugin_id: String,
        state: PluginState,
    },

    #[error("capability '{name}' is owned by plugin '{owner}'")]
    Conflict { name: String, owner: String },

    #[error("store unavailable: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for RegistryError {
    fn from(e: rusqlite::Error) -> Self {
        RegistryError::Storage(e.to_string())
    }
}

/// Failure to fetch, stage or release a plugin package.
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("package '{0}' not found")]
    NotFound(String),

    #[error("I/O error on package '{locator}': {source}")]
    Io {
        locator: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to download package '{locator}': {message}")]
    Http { locator: String, message: String },

    #[error("package entry '{0}' escapes the staging directory")]
    UnsafePath(String),

    #[error("package '{locator}' unpacks to more than {limit} bytes")]
    TooLarge { locator: String, limit: u64 },
}

impl PackageError {
    pub fn io(locator: impl Into<String>, source: std::io::Error) -> Self {
        PackageError::Io {
            locator: locator.into(),
            source,
        }
    }
}

/// The runtime unit of a plugin could not be loaded or initialized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivationError {
    #[error("package is not staged at {0:?}")]
    PackageMissing(PathBuf),

    #[error("entry point '{0}' not found in package")]
    EntryPointMissing(String),

    #[error("{0}")]
    Failed(String),
}

/// A call into an active runtime unit failed.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("runtime unit is not active")]
    NotActive,

    #[error("capability '{0}' is not declared by this plugin")]
    UnknownCapability(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed to start entry point: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("entry point did not answer within {0:?}")]
    Timeout(Duration),

    #[error("entry point broke the invocation protocol: {0}")]
    Protocol(String),

    #[error("plugin reported an error: {0}")]
    Plugin(String),
}

/// Error returned by every Plugin Manager operation.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("invalid plugin package: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("plugin '{plugin_id}' not found")]
    NotFound { plugin_id: String },

    #[error("cannot {operation} plugin '{plugin_id}': {}", state_detail(.state))]
    InvalidState {
        plugin_id: String,
        operation: Operation,
        /// Current state, or `None` when another operation holds the plugin.
        state: Option<PluginState>,
    },

    #[error("{operation} of plugin '{plugin_id}' failed to reach the store: {source}")]
    Storage {
        plugin_id: String,
        operation: Operation,
        #[source]
        source: RegistryError,
    },

    #[error("{operation} of plugin '{plugin_id}' failed to activate it: {source}")]
    Activation {
        plugin_id: String,
        operation: Operation,
        #[source]
        source: ActivationError,
    },

    #[error("{operation} of plugin '{plugin_id}' failed on its package: {source}")]
    Package {
        plugin_id: String,
        operation: Operation,
        #[source]
        source: PackageError,
    },

    #[error("capability '{capability}' of plugin '{plugin_id}' is already provided by '{owner}'")]
    CapabilityConflict {
        plugin_id: String,
        capability: String,
        owner: String,
    },

    #[error("package declares plugin id '{found}', expected '{expected}'")]
    IdentityMismatch { expected: String, found: String },

    #[error("capability '{0}' is temporarily unavailable")]
    Unavailable(String),

    #[error("invocation of capability '{capability}' failed: {source}")]
    Invocation {
        capability: String,
        #[source]
        source: InvokeError,
    },

    #[error("{operation} of plugin '{plugin_id}' was cancelled")]
    Cancelled {
        plugin_id: String,
        operation: Operation,
    },
}

fn state_detail(state: &Option<PluginState>) -> String {
    match state {
        Some(state) => format!("plugin is {}", state),
        None => "another operation is in progress".to_string(),
    }
}

impl PluginError {
    /// Map a store error, keeping not-found and state errors distinct.
    pub fn from_registry(plugin_id: &str, operation: Operation, err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => PluginError::NotFound {
                plugin_id: plugin_id.to_string(),
            },
            RegistryError::InvalidState { state, .. } => PluginError::InvalidState {
                plugin_id: plugin_id.to_string(),
                operation,
                state: Some(state),
            },
            RegistryError::Conflict { name, owner } => PluginError::CapabilityConflict {
                plugin_id: plugin_id.to_string(),
                capability: name,
                owner,
            },
            other => PluginError::Storage {
                plugin_id: plugin_id.to_string(),
                operation,
                source: other,
            },
        }
    }

    pub fn package(plugin_id: &str, operation: Operation, source: PackageError) -> Self {
        PluginError::Package {
            plugin_id: plugin_id.to_string(),
            operation,
            source,
        }
    }

    pub fn activation(plugin_id: &str, operation: Operation, source: ActivationError) -> Self {
        PluginError::Activation {
            plugin_id: plugin_id.to_string(),
            operation,
            source,
        }
    }

    /// Whether repeating the same call later may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        match self {
            PluginError::Storage { .. }
            | PluginError::Unavailable(_)
            | PluginError::Cancelled { .. } => true,
            PluginError::InvalidState { state, .. } => state.is_none(),
            PluginError::Package { source, .. } => {
                matches!(source, PackageError::Io { .. } | PackageError::Http { .. })
            }
            _ => false,
        }
    }

    /// Whether the failure happened before anything was written to the store.
    pub fn is_pre_commit(&self) -> bool {
        matches!(
            self,
            PluginError::Descriptor(_)
                | PluginError::NotFound { .. }
                | PluginError::InvalidState { .. }
                | PluginError::CapabilityConflict { .. }
                | PluginError::IdentityMismatch { .. }
                | PluginError::Activation { .. }
                | PluginError::Cancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_error_display_includes_kind() {
        let err = DescriptorError::missing_field("id");
        assert_eq!(err.kind, DescriptorErrorKind::MissingField);
        assert_eq!(
            err.to_string(),
            "MISSING_FIELD: manifest is missing required field 'id'"
        );
    }

    #[test]
    fn test_from_registry_keeps_not_found_distinct() {
        let err = PluginError::from_registry(
            "acme",
            Operation::Enable,
            RegistryError::NotFound("acme".to_string()),
        );
        assert!(matches!(err, PluginError::NotFound { ref plugin_id } if plugin_id == "acme"));

        let err = PluginError::from_registry(
            "acme",
            Operation::Uninstall,
            RegistryError::Storage("disk full".to_string()),
        );
        assert!(matches!(err, PluginError::Storage { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_from_registry_maps_ownership_conflict() {
        let err = PluginError::from_registry(
            "rival",
            Operation::Enable,
            RegistryError::Conflict {
                name: "gpt-mini".to_string(),
                owner: "acme".to_string(),
            },
        );
        assert!(matches!(
            err,
            PluginError::CapabilityConflict { ref plugin_id, ref capability, ref owner }
                if plugin_id == "rival" && capability == "gpt-mini" && owner == "acme"
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_state_message() {
        let err = PluginError::InvalidState {
            plugin_id: "acme".to_string(),
            operation: Operation::Enable,
            state: Some(PluginState::Enabled),
        };
        assert_eq!(err.to_string(), "cannot enable plugin 'acme': plugin is ENABLED");
        assert!(!err.is_retryable());

        let busy = PluginError::InvalidState {
            plugin_id: "acme".to_string(),
            operation: Operation::Uninstall,
            state: None,
        };
        assert!(busy.to_string().contains("another operation is in progress"));
        assert!(busy.is_retryable());
    }

    #[test]
    fn test_pre_commit_classification() {
        assert!(PluginError::from(DescriptorError::malformed("bad")).is_pre_commit());
        assert!(!PluginError::Unavailable("gpt-mini".to_string()).is_pre_commit());
    }
}
