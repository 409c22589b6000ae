//! Persistent plugin records and lifecycle states.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use aihub_plugin_interface::PluginType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plugin::descriptor::{CapabilityDeclaration, PluginDescriptor, resolve_localized};
use crate::plugin::package::PackageHandle;

/// Lifecycle state of an installed plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginState {
    Installing,
    Installed,
    Enabled,
    Disabled,
    Uninstalling,
    Failed,
}

impl PluginState {
    pub const ALL: [PluginState; 6] = [
        PluginState::Installing,
        PluginState::Installed,
        PluginState::Enabled,
        PluginState::Disabled,
        PluginState::Uninstalling,
        PluginState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginState::Installing => "INSTALLING",
            PluginState::Installed => "INSTALLED",
            PluginState::Enabled => "ENABLED",
            PluginState::Disabled => "DISABLED",
            PluginState::Uninstalling => "UNINSTALLING",
            PluginState::Failed => "FAILED",
        }
    }

    /// A record may only be deleted from these states.
    pub fn is_deletable(&self) -> bool {
        matches!(self, PluginState::Uninstalling | PluginState::Failed)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for PluginState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PluginState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown plugin state '{}'", s))
    }
}

/// Durable identity and state of an installed plugin.
///
/// Besides identity and state, the record keeps the projection of the
/// descriptor needed to enable the plugin again without re-reading its
/// package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub plugin_id: String,
    pub name: String,
    pub version: String,
    pub plugin_type: PluginType,
    pub state: PluginState,
    pub author: Option<String>,
    pub entry_point: String,
    /// Declared capabilities, in manifest order.
    pub capabilities: Vec<CapabilityDeclaration>,
    /// Locale tag to description text.
    pub descriptions: BTreeMap<String, String>,
    /// Locator the package was fetched from.
    pub source_reference: String,
    /// Staging directory of the unpacked package, once staged.
    pub source_path: Option<String>,
    pub content_hash: String,
    pub invoke_timeout_secs: u64,
    /// Opaque identity of whoever installed the plugin.
    pub created_by: String,
    /// Set only while `state == FAILED`.
    pub last_error: Option<String>,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PluginRecord {
    /// Project a freshly parsed descriptor into a new `INSTALLING` record.
    pub fn from_descriptor(
        descriptor: &PluginDescriptor,
        package: &PackageHandle,
        created_by: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            plugin_id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            version: descriptor.version.clone(),
            plugin_type: descriptor.plugin_type,
            state: PluginState::Installing,
            author: descriptor.author.clone(),
            entry_point: descriptor.entry_point.clone(),
            capabilities: descriptor.capabilities.clone(),
            descriptions: descriptor.localized_text.clone(),
            source_reference: package.locator().to_string(),
            source_path: None,
            content_hash: package.content_hash().to_string(),
            invoke_timeout_secs: descriptor.invoke_timeout_secs,
            created_by: created_by.to_string(),
            last_error: None,
            installed_at: now,
            updated_at: now,
        }
    }

    /// Replace the descriptor projection in place, keeping identity,
    /// state, audit fields and the staging path.
    pub fn apply_descriptor(&mut self, descriptor: &PluginDescriptor, package: &PackageHandle) {
        self.name = descriptor.name.clone();
        self.version = descriptor.version.clone();
        self.plugin_type = descriptor.plugin_type;
        self.author = descriptor.author.clone();
        self.entry_point = descriptor.entry_point.clone();
        self.capabilities = descriptor.capabilities.clone();
        self.descriptions = descriptor.localized_text.clone();
        self.source_reference = package.locator().to_string();
        self.content_hash = package.content_hash().to_string();
        self.invoke_timeout_secs = descriptor.invoke_timeout_secs;
        self.updated_at = Utc::now();
    }

    /// Move to `state`. Leaving `FAILED` clears the recorded error.
    pub fn set_state(&mut self, state: PluginState) {
        self.state = state;
        if state != PluginState::Failed {
            self.last_error = None;
        }
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.state = PluginState::Failed;
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }

    pub fn is_enabled(&self) -> bool {
        self.state == PluginState::Enabled
    }

    pub fn capability_names(&self) -> impl Iterator<Item = &str> {
        self.capabilities.iter().map(|c| c.name.as_str())
    }

    pub fn description(&self, locale: &str) -> Option<&str> {
        resolve_localized(&self.descriptions, locale)
    }
}
