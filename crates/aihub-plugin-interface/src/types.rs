//! Plugin and capability kinds shared between the host and plugin packages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when a kind string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    /// What was being parsed ("plugin type", "capability type").
    pub what: &'static str,
    /// The rejected input.
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.what, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Kind of plugin, declared by the `type` key of a manifest.
///
/// The host picks the runtime unit variant from this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginType {
    /// Exposes one or more models to the chat/completion layer.
    ModelProvider,
    /// Exposes tools callable by agents.
    Tool,
    /// Adds nodes to the workflow engine.
    WorkflowExtension,
}

impl PluginType {
    pub const ALL: [PluginType; 3] = [
        PluginType::ModelProvider,
        PluginType::Tool,
        PluginType::WorkflowExtension,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginType::ModelProvider => "model-provider",
            PluginType::Tool => "tool",
            PluginType::WorkflowExtension => "workflow-extension",
        }
    }

    /// Whether a plugin of this type may declare a capability of `kind`.
    ///
    /// Model providers only expose models, tool plugins only tools, and
    /// workflow extensions expose workflow nodes plus the tools those nodes
    /// are built from.
    pub fn allows(&self, kind: CapabilityType) -> bool {
        match self {
            PluginType::ModelProvider => kind == CapabilityType::Model,
            PluginType::Tool => kind == CapabilityType::Tool,
            PluginType::WorkflowExtension => {
                matches!(kind, CapabilityType::WorkflowNode | CapabilityType::Tool)
            }
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for PluginType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PluginType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                what: "plugin type",
                value: s.to_string(),
            })
    }
}

/// Kind of an advertised capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityType {
    Model,
    Tool,
    WorkflowNode,
}

impl CapabilityType {
    pub const ALL: [CapabilityType; 3] = [
        CapabilityType::Model,
        CapabilityType::Tool,
        CapabilityType::WorkflowNode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityType::Model => "model",
            CapabilityType::Tool => "tool",
            CapabilityType::WorkflowNode => "workflow-node",
        }
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for CapabilityType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CapabilityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                what: "capability type",
                value: s.to_string(),
            })
    }
}
