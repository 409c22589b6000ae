//! Model/capability registry: the live index of what enabled plugins offer.
//!
//! Entries are only created and removed as a side effect of plugin manager
//! transitions. Readers always see a complete snapshot; writers publish a
//! [`CapabilityEvent`] to every subscriber after the change is visible.

mod memory;

pub use memory::InMemoryCapabilityRegistry;

use aihub_plugin_interface::{CapabilityType, PluginType};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::RegistryError;
use crate::plugin::descriptor::CapabilityDeclaration;
use crate::plugin::record::PluginRecord;

/// A capability currently advertised by an enabled plugin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityEntry {
    pub name: String,
    pub kind: CapabilityType,
    /// Id of the plugin that owns the capability.
    pub plugin_id: String,
    pub plugin_type: PluginType,
    pub description: Option<String>,
    pub parameters: Value,
    /// `false` while the owner is live but cannot serve calls.
    pub available: bool,
}

impl CapabilityEntry {
    pub fn from_declaration(record: &PluginRecord, declaration: &CapabilityDeclaration) -> Self {
        Self {
            name: declaration.name.clone(),
            kind: declaration.kind,
            plugin_id: record.plugin_id.clone(),
            plugin_type: record.plugin_type,
            description: declaration.description.clone(),
            parameters: declaration.parameters.clone(),
            available: true,
        }
    }

    /// Entries for every capability `record` declares, in manifest order.
    pub fn for_record(record: &PluginRecord) -> Vec<Self> {
        record
            .capabilities
            .iter()
            .map(|decl| Self::from_declaration(record, decl))
            .collect()
    }

    /// Same metadata, ignoring the availability flag.
    pub fn same_metadata(&self, other: &Self) -> bool {
        self.name == other.name
            && self.kind == other.kind
            && self.plugin_id == other.plugin_id
            && self.plugin_type == other.plugin_type
            && self.description == other.description
            && self.parameters == other.parameters
    }
}

/// Notification delivered to subscribers.
///
/// Delivery is at-least-once; `sequence` increases by one per event so a
/// subscriber can drop duplicates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityEvent {
    pub sequence: u64,
    #[serde(flatten)]
    pub kind: CapabilityEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CapabilityEventKind {
    Registered(CapabilityEntry),
    Unregistered { name: String, plugin_id: String },
    Updated(CapabilityEntry),
    AvailabilityChanged { name: String, available: bool },
}

impl CapabilityEventKind {
    /// Name of the capability the event is about.
    pub fn capability(&self) -> &str {
        match self {
            CapabilityEventKind::Registered(entry) | CapabilityEventKind::Updated(entry) => {
                &entry.name
            }
            CapabilityEventKind::Unregistered { name, .. }
            | CapabilityEventKind::AvailabilityChanged { name, .. } => name,
        }
    }
}

/// What a [`CapabilityRegistry::refresh`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub registered: usize,
    pub updated: usize,
    pub unregistered: usize,
    /// Capabilities live after the refresh.
    pub total: usize,
}

/// Queryable index of live capabilities.
///
/// Mutations are idempotent so the same contract can be met by an
/// implementation shared between processes.
#[async_trait]
pub trait CapabilityRegistry: Send + Sync {
    /// Add a capability, or update its metadata in place if the name exists.
    ///
    /// A name owned by another plugin is refused with
    /// [`RegistryError::Conflict`].
    async fn register(&self, entry: CapabilityEntry) -> Result<(), RegistryError>;

    /// Remove a capability. Removing an absent name succeeds without effect.
    async fn unregister(&self, name: &str) -> Result<(), RegistryError>;

    /// Flip the availability flag of a live capability.
    async fn set_available(&self, name: &str, available: bool) -> Result<(), RegistryError>;

    /// Rebuild the index from the enabled plugin records.
    async fn refresh(&self) -> Result<RefreshSummary, RegistryError>;

    fn get_by_name(&self, name: &str) -> Option<CapabilityEntry>;

    /// Capabilities of one kind, ordered by name.
    fn get_by_type(&self, kind: CapabilityType) -> Vec<CapabilityEntry>;

    fn get_by_plugin(&self, plugin_id: &str) -> Vec<CapabilityEntry>;

    /// Every live capability, ordered by name.
    fn get_all(&self) -> Vec<CapabilityEntry>;

    fn contains(&self, name: &str) -> bool {
        self.get_by_name(name).is_some()
    }

    fn is_available(&self, name: &str) -> bool {
        self.get_by_name(name).is_some_and(|entry| entry.available)
    }

    /// Receive every event published after this call, in commit order.
    ///
    /// A subscriber that lets its queue fill up is dropped; the receiver
    /// then drains and closes, and should resubscribe and re-read
    /// [`get_all`](Self::get_all).
    fn subscribe(&self) -> mpsc::Receiver<CapabilityEvent>;
}
