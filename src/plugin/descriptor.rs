//! Plugin descriptor parsing and validation.
//!
//! A package is a gzip-compressed tar archive with a `plugin.toml` manifest
//! at its root or inside a single top-level directory. Bytes that are not a
//! gzip stream are read as a bare manifest.
//!
//! Parsing is pure: the same package bytes always yield an equal
//! [`PluginDescriptor`], and nothing outside the supplied bytes is read.

use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::{Component, Path};

use aihub_plugin_interface::{
    CapabilityType, INTERFACE_VERSION, PluginType, is_schema_supported, is_version_compatible,
};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tar::Archive;

use crate::error::DescriptorError;
use crate::plugin::package::{PackageHandle, is_gzip};

/// Manifest file name inside a package.
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Locale used when the requested one has no description.
pub const FALLBACK_LOCALE: &str = "en_US";

/// Default bound on a single invocation of the entry point.
pub const DEFAULT_INVOKE_TIMEOUT_SECS: u64 = 30;

/// Largest `plugin.toml` the parser will read.
pub const MAX_MANIFEST_BYTES: u64 = 1024 * 1024;

/// One capability declared by a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDeclaration {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: CapabilityType,
    #[serde(default)]
    pub description: Option<String>,
    /// JSON schema of the parameters the capability accepts.
    #[serde(default)]
    pub parameters: Value,
}

/// Structured metadata extracted from a package manifest.
///
/// Never persisted directly; projected into a
/// [`PluginRecord`](crate::plugin::record::PluginRecord) instead.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginDescriptor {
    pub schema_version: u32,
    pub id: String,
    pub name: String,
    pub version: String,
    pub plugin_type: PluginType,
    pub author: Option<String>,
    /// Declared capabilities, in manifest order.
    pub capabilities: Vec<CapabilityDeclaration>,
    /// Locale tag to description text.
    pub localized_text: BTreeMap<String, String>,
    /// Path of the executable inside the package.
    pub entry_point: String,
    pub min_interface_version: Option<String>,
    pub invoke_timeout_secs: u64,
}

impl PluginDescriptor {
    pub fn description(&self, locale: &str) -> Option<&str> {
        resolve_localized(&self.localized_text, locale)
    }
}

/// Resolve localized text: exact locale, then [`FALLBACK_LOCALE`], then nothing.
pub fn resolve_localized<'a>(texts: &'a BTreeMap<String, String>, locale: &str) -> Option<&'a str> {
    texts
        .get(locale)
        .or_else(|| texts.get(FALLBACK_LOCALE))
        .map(String::as_str)
}

/// Raw manifest as written by plugin authors.
///
/// Every key is optional here so that an absent key is reported as
/// `MISSING_FIELD` rather than as a generic parse error.
#[derive(Debug, Deserialize)]
struct RawManifest {
    id: Option<String>,
    name: Option<String>,
    version: Option<String>,
    #[serde(rename = "type")]
    plugin_type: Option<String>,
    author: Option<String>,
    entry_point: Option<String>,
    min_interface_version: Option<String>,
    invoke_timeout_secs: Option<u64>,
    #[serde(default)]
    description: BTreeMap<String, String>,
    #[serde(default)]
    capabilities: Vec<RawCapability>,
}

#[derive(Debug, Deserialize)]
struct RawCapability {
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    description: Option<String>,
    parameters: Option<toml::Value>,
}

/// Check if a plugin id is a valid identifier.
///
/// Valid ids are non-empty and contain only ASCII alphanumerics, `-`, `_`
/// and `.`, and do not start with a dot.
fn is_valid_plugin_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Entry points must stay inside the package.
fn is_contained_path(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Stateless parser from package bytes to [`PluginDescriptor`].
pub struct DescriptorParser;

impl DescriptorParser {
    /// Parse a package into a descriptor.
    pub fn parse(package: &PackageHandle) -> Result<PluginDescriptor, DescriptorError> {
        let manifest = read_manifest(package.bytes())?;
        Self::parse_manifest(&manifest)
    }

    /// Parse the text of a `plugin.toml` manifest.
    ///
    /// The schema version is checked before anything else so a manifest from
    /// a newer schema is reported as unsupported, not as malformed.
    pub fn parse_manifest(content: &str) -> Result<PluginDescriptor, DescriptorError> {
        let table: toml::Table = toml::from_str(content)
            .map_err(|e| DescriptorError::malformed(format!("invalid {}: {}", MANIFEST_FILE, e)))?;

        let schema_version = match table.get("schema_version") {
            None => return Err(DescriptorError::missing_field("schema_version")),
            Some(toml::Value::Integer(v)) => u32::try_from(*v).map_err(|_| {
                DescriptorError::unsupported_version(format!("schema_version {} is out of range", v))
            })?,
            Some(other) => {
                return Err(DescriptorError::malformed(format!(
                    "schema_version must be an integer, found {}",
                    other.type_str()
                )));
            }
        };
        if !is_schema_supported(schema_version) {
            return Err(DescriptorError::unsupported_version(format!(
                "manifest schema version {} is not supported",
                schema_version
            )));
        }

        let raw: RawManifest = toml::Value::Table(table)
            .try_into()
            .map_err(|e| DescriptorError::malformed(format!("invalid {}: {}", MANIFEST_FILE, e)))?;

        build_descriptor(schema_version, raw)
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, DescriptorError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(DescriptorError::missing_field(field)),
    }
}

fn build_descriptor(schema_version: u32, raw: RawManifest) -> Result<PluginDescriptor, DescriptorError> {
    let id = required(raw.id, "id")?;
    let name = required(raw.name, "name")?;
    let version = required(raw.version, "version")?;
    let plugin_type = required(raw.plugin_type, "type")?;
    let entry_point = required(raw.entry_point, "entry_point")?;

    if !is_valid_plugin_id(&id) {
        return Err(DescriptorError::malformed(format!(
            "invalid plugin id '{}': must contain only alphanumeric characters, '-', '_' and '.'",
            id
        )));
    }

    if semver::Version::parse(&version).is_err() {
        return Err(DescriptorError::malformed(format!(
            "invalid version '{}': must be valid semver",
            version
        )));
    }

    let plugin_type: PluginType = plugin_type
        .parse()
        .map_err(|e: aihub_plugin_interface::UnknownVariant| DescriptorError::malformed(e.to_string()))?;

    if !is_contained_path(&entry_point) {
        return Err(DescriptorError::malformed(format!(
            "entry point '{}' must be a relative path inside the package",
            entry_point
        )));
    }

    if let Some(ref min_ver) = raw.min_interface_version {
        match is_version_compatible(min_ver, INTERFACE_VERSION) {
            Ok(true) => {}
            Ok(false) => {
                return Err(DescriptorError::unsupported_version(format!(
                    "requires interface version {}, host provides {}",
                    min_ver, INTERFACE_VERSION
                )));
            }
            Err(e) => {
                return Err(DescriptorError::malformed(format!(
                    "invalid min_interface_version '{}': {}",
                    min_ver, e
                )));
            }
        }
    }

    let invoke_timeout_secs = raw.invoke_timeout_secs.unwrap_or(DEFAULT_INVOKE_TIMEOUT_SECS);
    if invoke_timeout_secs == 0 {
        return Err(DescriptorError::malformed("invoke_timeout_secs must be positive"));
    }

    if raw.capabilities.is_empty() {
        return Err(DescriptorError::missing_field("capabilities"));
    }

    let mut seen = HashSet::new();
    let mut capabilities = Vec::with_capacity(raw.capabilities.len());
    for raw_cap in raw.capabilities {
        let cap_name = required(raw_cap.name, "capabilities.name")?;
        let kind: CapabilityType = required(raw_cap.kind, "capabilities.type")?
            .parse()
            .map_err(|e: aihub_plugin_interface::UnknownVariant| {
                DescriptorError::malformed(e.to_string())
            })?;

        if !plugin_type.allows(kind) {
            return Err(DescriptorError::malformed(format!(
                "a {} plugin cannot declare {} capability '{}'",
                plugin_type, kind, cap_name
            )));
        }
        if !seen.insert(cap_name.clone()) {
            return Err(DescriptorError::malformed(format!(
                "capability '{}' is declared more than once",
                cap_name
            )));
        }

        let parameters = match raw_cap.parameters {
            Some(params) => serde_json::to_value(&params).map_err(|e| {
                DescriptorError::malformed(format!(
                    "capability '{}' has invalid parameters: {}",
                    cap_name, e
                ))
            })?,
            None => Value::Null,
        };

        capabilities.push(CapabilityDeclaration {
            name: cap_name,
            kind,
            description: raw_cap.description,
            parameters,
        });
    }

    Ok(PluginDescriptor {
        schema_version,
        id,
        name,
        version,
        plugin_type,
        author: raw.author,
        capabilities,
        localized_text: raw.description,
        entry_point,
        min_interface_version: raw.min_interface_version,
        invoke_timeout_secs,
    })
}

fn manifest_too_large() -> DescriptorError {
    DescriptorError::malformed(format!(
        "{} exceeds {} bytes",
        MANIFEST_FILE, MAX_MANIFEST_BYTES
    ))
}

/// Extract the manifest text from package bytes.
fn read_manifest(bytes: &[u8]) -> Result<String, DescriptorError> {
    if !is_gzip(bytes) {
        if bytes.len() as u64 > MAX_MANIFEST_BYTES {
            return Err(manifest_too_large());
        }
        return String::from_utf8(bytes.to_vec())
            .map_err(|_| DescriptorError::malformed(format!("{} is not valid UTF-8", MANIFEST_FILE)));
    }

    let mut archive = Archive::new(GzDecoder::new(bytes));
    let entries = archive
        .entries()
        .map_err(|e| DescriptorError::malformed(format!("unreadable package archive: {}", e)))?;

    // The shallowest manifest wins; a nested one is only accepted one level down.
    let mut found: Option<(usize, String)> = None;
    for entry in entries {
        let mut entry = entry
            .map_err(|e| DescriptorError::malformed(format!("unreadable package archive: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| DescriptorError::malformed(format!("invalid archive entry: {}", e)))?
            .into_owned();

        let parts: Vec<_> = path
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect();
        let depth = parts.len();
        let is_manifest = parts
            .last()
            .is_some_and(|c| c.as_os_str() == MANIFEST_FILE);
        if !is_manifest || depth > 2 {
            continue;
        }
        if found.as_ref().is_some_and(|(d, _)| *d <= depth) {
            continue;
        }

        let mut raw = Vec::new();
        (&mut entry)
            .take(MAX_MANIFEST_BYTES + 1)
            .read_to_end(&mut raw)
            .map_err(|e| DescriptorError::malformed(format!("unreadable {}: {}", MANIFEST_FILE, e)))?;
        if raw.len() as u64 > MAX_MANIFEST_BYTES {
            return Err(manifest_too_large());
        }
        let content = String::from_utf8(raw)
            .map_err(|_| DescriptorError::malformed(format!("{} is not valid UTF-8", MANIFEST_FILE)))?;
        found = Some((depth, content));
    }

    found
        .map(|(_, content)| content)
        .ok_or_else(|| DescriptorError::malformed(format!("package does not contain {}", MANIFEST_FILE)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DescriptorErrorKind;
    use crate::plugin::package::pack_files;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const VALID: &str = r#"
schema_version = 1
id = "acme-models"
name = "Acme Models"
version = "1.2.0"
type = "model-provider"
author = "Acme"
entry_point = "bin/provider.sh"
invoke_timeout_secs = 10

[description]
en_US = "Acme hosted models"
zh_Hans = "Acme 托管模型"

[[capabilities]]
name = "gpt-mini"
type = "model"
description = "Small chat model"

[capabilities.parameters]
type = "object"

[[capabilities]]
name = "gpt-large"
type = "model"
"#;

    fn parse(content: &str) -> Result<PluginDescriptor, DescriptorError> {
        DescriptorParser::parse_manifest(content)
    }

    fn kind_of(content: &str) -> DescriptorErrorKind {
        parse(content).unwrap_err().kind
    }

    #[test]
    fn test_parse_valid_manifest() {
        let descriptor = parse(VALID).unwrap();
        assert_eq!(descriptor.id, "acme-models");
        assert_eq!(descriptor.name, "Acme Models");
        assert_eq!(descriptor.version, "1.2.0");
        assert_eq!(descriptor.plugin_type, PluginType::ModelProvider);
        assert_eq!(descriptor.author.as_deref(), Some("Acme"));
        assert_eq!(descriptor.entry_point, "bin/provider.sh");
        assert_eq!(descriptor.invoke_timeout_secs, 10);

        let names: Vec<_> = descriptor.capabilities.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["gpt-mini", "gpt-large"]);
        assert_eq!(descriptor.capabilities[0].parameters, json!({"type": "object"}));
        assert_eq!(descriptor.capabilities[1].parameters, Value::Null);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let content = format!("{}\nfuture_field = \"ignored\"\n", VALID);
        assert!(parse(&content).is_ok());
    }

    #[test]
    fn test_default_invoke_timeout() {
        let content = VALID.replace("invoke_timeout_secs = 10\n", "");
        assert_eq!(parse(&content).unwrap().invoke_timeout_secs, DEFAULT_INVOKE_TIMEOUT_SECS);
    }

    #[test]
    fn test_missing_id_is_missing_field() {
        let content = VALID.replace("id = \"acme-models\"\n", "");
        let err = parse(&content).unwrap_err();
        assert_eq!(err.kind, DescriptorErrorKind::MissingField);
        assert!(err.message.contains("'id'"));
    }

    #[test]
    fn test_missing_schema_version_is_missing_field() {
        let content = VALID.replace("schema_version = 1\n", "");
        assert_eq!(kind_of(&content), DescriptorErrorKind::MissingField);
    }

    #[test]
    fn test_missing_capabilities_is_missing_field() {
        let content = "schema_version = 1\nid = \"x\"\nname = \"X\"\nversion = \"1.0.0\"\ntype = \"tool\"\nentry_point = \"run.sh\"\n";
        let err = parse(content).unwrap_err();
        assert_eq!(err.kind, DescriptorErrorKind::MissingField);
        assert!(err.message.contains("capabilities"));
    }

    #[test]
    fn test_future_schema_is_unsupported() {
        let content = "schema_version = 2\nsomething_new = { shape = 1 }\n";
        assert_eq!(kind_of(content), DescriptorErrorKind::UnsupportedVersion);
    }

    #[test]
    fn test_incompatible_interface_is_unsupported() {
        let content = format!("min_interface_version = \"99.0.0\"\n{}", VALID);
        assert_eq!(kind_of(&content), DescriptorErrorKind::UnsupportedVersion);
    }

    #[test]
    fn test_invalid_toml_is_malformed() {
        assert_eq!(kind_of("this is not valid toml [[["), DescriptorErrorKind::Malformed);
    }

    #[test]
    fn test_wrong_value_type_is_malformed() {
        let content = VALID.replace("id = \"acme-models\"", "id = 42");
        assert_eq!(kind_of(&content), DescriptorErrorKind::Malformed);
    }

    #[test]
    fn test_invalid_version_is_malformed() {
        let content = VALID.replace("version = \"1.2.0\"", "version = \"not-semver\"");
        let err = parse(&content).unwrap_err();
        assert_eq!(err.kind, DescriptorErrorKind::Malformed);
        assert!(err.message.contains("Invalid version") || err.message.contains("invalid version"));
    }

    #[test]
    fn test_unknown_plugin_type_is_malformed() {
        let content = VALID.replace("type = \"model-provider\"", "type = \"theme\"");
        assert_eq!(kind_of(&content), DescriptorErrorKind::Malformed);
    }

    #[test]
    fn test_capability_type_must_fit_plugin_type() {
        let content = VALID.replace("type = \"model\"\ndescription", "type = \"tool\"\ndescription");
        let err = parse(&content).unwrap_err();
        assert_eq!(err.kind, DescriptorErrorKind::Malformed);
        assert!(err.message.contains("cannot declare"));
    }

    #[test]
    fn test_duplicate_capability_is_malformed() {
        let content = VALID.replace("name = \"gpt-large\"", "name = \"gpt-mini\"");
        let err = parse(&content).unwrap_err();
        assert!(err.message.contains("more than once"));
    }

    #[test]
    fn test_entry_point_must_stay_inside_package() {
        for bad in ["../escape.sh", "/usr/bin/env"] {
            let content = VALID.replace("bin/provider.sh", bad);
            assert_eq!(kind_of(&content), DescriptorErrorKind::Malformed, "{}", bad);
        }
    }

    #[test]
    fn test_is_valid_plugin_id() {
        assert!(is_valid_plugin_id("acme-models"));
        assert!(is_valid_plugin_id("acme_models.v2"));
        assert!(!is_valid_plugin_id(""));
        assert!(!is_valid_plugin_id(".hidden"));
        assert!(!is_valid_plugin_id("acme/models"));
        assert!(!is_valid_plugin_id("acme models"));
    }

    #[test]
    fn test_localized_text_resolution() {
        let descriptor = parse(VALID).unwrap();
        assert_eq!(descriptor.description("zh_Hans"), Some("Acme 托管模型"));
        assert_eq!(descriptor.description("ja_JP"), Some("Acme hosted models"));
        // No prefix matching: "en" is not "en_US", so the fallback answers.
        assert_eq!(descriptor.description("en"), Some("Acme hosted models"));

        let content = VALID.replace("en_US = \"Acme hosted models\"\n", "");
        let descriptor = parse(&content).unwrap();
        assert_eq!(descriptor.description("ja_JP"), None);
        assert_eq!(descriptor.description("zh_Hans"), Some("Acme 托管模型"));
    }

    #[test]
    fn test_parse_archive_package() {
        let bytes = pack_files(&[("plugin.toml", VALID.as_bytes()), ("bin/provider.sh", b"#!/bin/sh\n")]);
        let package = PackageHandle::from_bytes("archive", bytes);
        let descriptor = DescriptorParser::parse(&package).unwrap();
        assert_eq!(descriptor.id, "acme-models");
    }

    #[test]
    fn test_parse_archive_with_nested_directory() {
        let bytes = pack_files(&[("acme-models/plugin.toml", VALID.as_bytes())]);
        let package = PackageHandle::from_bytes("archive", bytes);
        assert!(DescriptorParser::parse(&package).is_ok());
    }

    #[test]
    fn test_archive_without_manifest_is_malformed() {
        let bytes = pack_files(&[("README.md", b"nothing here")]);
        let package = PackageHandle::from_bytes("archive", bytes);
        let err = DescriptorParser::parse(&package).unwrap_err();
        assert_eq!(err.kind, DescriptorErrorKind::Malformed);
        assert!(err.message.contains("does not contain plugin.toml"));
    }

    #[test]
    fn test_parse_is_deterministic() {
        let bytes = pack_files(&[("plugin.toml", VALID.as_bytes())]);
        let first = DescriptorParser::parse(&PackageHandle::from_bytes("a", bytes.clone())).unwrap();
        let second = DescriptorParser::parse(&PackageHandle::from_bytes("b", bytes)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_oversized_manifest_is_malformed() {
        let mut padded = VALID.to_string();
        padded.push_str("# ");
        padded.push_str(&"x".repeat(MAX_MANIFEST_BYTES as usize));

        let archived = PackageHandle::from_bytes("archive", pack_files(&[("plugin.toml", padded.as_bytes())]));
        let err = DescriptorParser::parse(&archived).unwrap_err();
        assert_eq!(err.kind, DescriptorErrorKind::Malformed);
        assert!(err.message.contains("exceeds"));

        let raw = PackageHandle::from_bytes("raw", padded.into_bytes());
        assert_eq!(DescriptorParser::parse(&raw).unwrap_err().kind, DescriptorErrorKind::Malformed);
    }
}
