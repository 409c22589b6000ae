//! Interface and manifest versioning.
//!
//! A package is checked against two independent versions when it is parsed:
//! the manifest schema (which keys `plugin.toml` may carry) and the host
//! interface (the envelope contract offered to running plugins).

use semver::Version;

/// Version of the plugin-facing contract this crate describes.
pub const INTERFACE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Newest manifest schema this host reads.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

const OLDEST_MANIFEST_SCHEMA_VERSION: u32 = 1;

pub fn is_schema_supported(schema_version: u32) -> bool {
    (OLDEST_MANIFEST_SCHEMA_VERSION..=MANIFEST_SCHEMA_VERSION).contains(&schema_version)
}

/// Whether a host at `host_version` satisfies a plugin asking for at least
/// `required`.
///
/// The host must share the major version and be no older than the request.
///
/// ```
/// use aihub_plugin_interface::is_version_compatible;
///
/// assert!(is_version_compatible("0.2.0", "0.3.1").unwrap());
/// assert!(!is_version_compatible("0.4.0", "0.3.1").unwrap());
/// assert!(!is_version_compatible("1.0.0", "0.3.1").unwrap());
/// ```
pub fn is_version_compatible(required: &str, host_version: &str) -> Result<bool, semver::Error> {
    let required = Version::parse(required)?;
    let host = Version::parse(host_version)?;
    Ok(required.major == host.major && host >= required)
}
