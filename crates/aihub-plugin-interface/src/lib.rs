//! Plugin-facing types for the aihub plugin interface.
//!
//! Plugin authors depend on this crate to describe what their package
//! provides and to speak the invocation protocol the host uses when it runs
//! a plugin's entry point.

pub mod protocol;
pub mod types;
pub mod version;

pub use protocol::{InvocationRequest, InvocationResponse, PROTOCOL_VERSION};
pub use types::{CapabilityType, PluginType, UnknownVariant};
pub use version::{
    INTERFACE_VERSION, MANIFEST_SCHEMA_VERSION, is_schema_supported, is_version_compatible,
};
