//! Runtime units: the executable form of an enabled plugin.
//!
//! Every plugin type is driven by a child process started from the entry
//! point inside the staged package. One process handles one invocation: it
//! gets the capability name as its argument, an
//! [`InvocationRequest`](aihub_plugin_interface::InvocationRequest) on stdin,
//! and must print an
//! [`InvocationResponse`](aihub_plugin_interface::InvocationResponse) on
//! stdout before the invoke timeout expires.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use aihub_plugin_interface::{CapabilityType, InvocationRequest, InvocationResponse, PluginType};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ActivationError, InvokeError};
use crate::plugin::descriptor::CapabilityDeclaration;
use crate::plugin::record::PluginRecord;

/// Everything needed to activate a plugin, taken from its record.
#[derive(Debug, Clone)]
pub struct RuntimeSpec {
    pub plugin_id: String,
    pub plugin_type: PluginType,
    pub entry_point: String,
    /// Directory of the staged package.
    pub package_dir: PathBuf,
    pub capabilities: Vec<CapabilityDeclaration>,
    pub invoke_timeout: Duration,
}

impl RuntimeSpec {
    pub fn from_record(record: &PluginRecord) -> Result<Self, ActivationError> {
        let package_dir = record
            .source_path
            .as_ref()
            .map(PathBuf::from)
            .ok_or_else(|| ActivationError::PackageMissing(PathBuf::new()))?;

        Ok(Self {
            plugin_id: record.plugin_id.clone(),
            plugin_type: record.plugin_type,
            entry_point: record.entry_point.clone(),
            package_dir,
            capabilities: record.capabilities.clone(),
            invoke_timeout: Duration::from_secs(record.invoke_timeout_secs),
        })
    }

    fn declared_kind(&self, capability: &str) -> Option<CapabilityType> {
        self.capabilities
            .iter()
            .find(|c| c.name == capability)
            .map(|c| c.kind)
    }
}

/// A loaded plugin that can serve capability invocations.
#[async_trait]
pub trait RuntimeUnit: Send + Sync {
    fn plugin_type(&self) -> PluginType;

    /// Load and initialize. Called once, before the unit is shared.
    async fn activate(&mut self) -> Result<(), ActivationError>;

    async fn invoke(&self, capability: &str, input: Value) -> Result<Value, InvokeError>;

    /// Stop serving. Invocations after this fail with `NotActive`.
    async fn deactivate(&self);
}

/// Builds the runtime unit for a plugin record.
pub trait RuntimeFactory: Send + Sync {
    fn create(&self, spec: RuntimeSpec) -> Result<Box<dyn RuntimeUnit>, ActivationError>;
}

/// Maps each plugin type to its process-backed unit.
pub struct DefaultRuntimeFactory {
    max_invoke_timeout: Duration,
}

impl DefaultRuntimeFactory {
    /// Invocations never run longer than `max_invoke_timeout`, whatever the
    /// manifest declares.
    pub fn new(max_invoke_timeout: Duration) -> Self {
        Self { max_invoke_timeout }
    }
}

impl Default for DefaultRuntimeFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl RuntimeFactory for DefaultRuntimeFactory {
    fn create(&self, mut spec: RuntimeSpec) -> Result<Box<dyn RuntimeUnit>, ActivationError> {
        spec.invoke_timeout = spec.invoke_timeout.min(self.max_invoke_timeout);
        let runner = ProcessRunner::new(spec);
        Ok(match runner.spec.plugin_type {
            PluginType::ModelProvider => Box::new(ModelProviderUnit { runner }),
            PluginType::Tool => Box::new(ToolUnit { runner }),
            PluginType::WorkflowExtension => Box::new(WorkflowExtensionUnit { runner }),
        })
    }
}

/// Process plumbing shared by all unit variants.
struct ProcessRunner {
    spec: RuntimeSpec,
    entry: PathBuf,
    active: AtomicBool,
}

impl ProcessRunner {
    fn new(spec: RuntimeSpec) -> Self {
        let entry = spec.package_dir.join(&spec.entry_point);
        Self {
            spec,
            entry,
            active: AtomicBool::new(false),
        }
    }

    fn activate(&mut self) -> Result<(), ActivationError> {
        let package_dir = &self.spec.package_dir;
        if !package_dir.is_dir() {
            return Err(ActivationError::PackageMissing(package_dir.clone()));
        }

        let root = package_dir
            .canonicalize()
            .map_err(|_| ActivationError::PackageMissing(package_dir.clone()))?;
        let entry = self
            .entry
            .canonicalize()
            .map_err(|_| ActivationError::EntryPointMissing(self.spec.entry_point.clone()))?;
        if !entry.starts_with(&root) || !entry.is_file() {
            return Err(ActivationError::EntryPointMissing(self.spec.entry_point.clone()));
        }

        self.entry = entry;
        self.active.store(true, Ordering::SeqCst);
        debug!(plugin = %self.spec.plugin_id, entry = ?self.entry, "Runtime unit activated");
        Ok(())
    }

    fn deactivate(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            debug!(plugin = %self.spec.plugin_id, "Runtime unit deactivated");
        }
    }

    /// Resolve a capability this plugin declares, or fail the call.
    fn capability_kind(&self, capability: &str) -> Result<CapabilityType, InvokeError> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(InvokeError::NotActive);
        }
        self.spec
            .declared_kind(capability)
            .ok_or_else(|| InvokeError::UnknownCapability(capability.to_string()))
    }

    fn command(&self) -> Command {
        let mut cmd = if is_shell_script(&self.entry) {
            let mut cmd = Command::new("sh");
            cmd.arg(&self.entry);
            cmd
        } else {
            Command::new(&self.entry)
        };
        cmd.current_dir(&self.spec.package_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, capability: &str, kind: CapabilityType, input: Value) -> Result<Value, InvokeError> {
        let request = InvocationRequest::new(&self.spec.plugin_id, capability, kind, input);
        let payload =
            serde_json::to_vec(&request).map_err(|e| InvokeError::Protocol(e.to_string()))?;

        let mut child = self.command().arg(capability).spawn().map_err(InvokeError::Spawn)?;
        let stdin = child.stdin.take();

        // The request is fed while the output is drained, both under the
        // deadline. Dropping the future on timeout kills the child.
        let feed = async move {
            if let Some(mut stdin) = stdin {
                match stdin.write_all(&payload).await {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                    _ => {}
                }
            }
            Ok(())
        };
        let exchange = async move {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed?;
            output
        };

        let timeout = self.spec.invoke_timeout;
        let output = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| InvokeError::Timeout(timeout))?
            .map_err(InvokeError::Spawn)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        match serde_json::from_str::<InvocationResponse>(stdout.trim()) {
            Ok(response) => response.into_result().map_err(InvokeError::Plugin),
            Err(_) if !output.status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let detail = stderr.trim();
                Err(InvokeError::Plugin(if detail.is_empty() {
                    format!("entry point exited with {}", output.status)
                } else {
                    detail.to_string()
                }))
            }
            Err(e) => Err(InvokeError::Protocol(format!("invalid response: {}", e))),
        }
    }
}

fn is_shell_script(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "sh")
}

/// Serves `model` capabilities. Input is passed through as-is.
pub struct ModelProviderUnit {
    runner: ProcessRunner,
}

#[async_trait]
impl RuntimeUnit for ModelProviderUnit {
    fn plugin_type(&self) -> PluginType {
        PluginType::ModelProvider
    }

    async fn activate(&mut self) -> Result<(), ActivationError> {
        self.runner.activate()
    }

    async fn invoke(&self, capability: &str, input: Value) -> Result<Value, InvokeError> {
        let kind = self.runner.capability_kind(capability)?;
        self.runner.run(capability, kind, input).await
    }

    async fn deactivate(&self) {
        self.runner.deactivate();
    }
}

/// Serves `tool` capabilities. Arguments must be a JSON object.
pub struct ToolUnit {
    runner: ProcessRunner,
}

#[async_trait]
impl RuntimeUnit for ToolUnit {
    fn plugin_type(&self) -> PluginType {
        PluginType::Tool
    }

    async fn activate(&mut self) -> Result<(), ActivationError> {
        self.runner.activate()
    }

    async fn invoke(&self, capability: &str, input: Value) -> Result<Value, InvokeError> {
        let kind = self.runner.capability_kind(capability)?;
        require_object(&input, "tool arguments")?;
        self.runner.run(capability, kind, input).await
    }

    async fn deactivate(&self) {
        self.runner.deactivate();
    }
}

/// Serves `workflow-node` capabilities and any helper tools they declare.
pub struct WorkflowExtensionUnit {
    runner: ProcessRunner,
}

#[async_trait]
impl RuntimeUnit for WorkflowExtensionUnit {
    fn plugin_type(&self) -> PluginType {
        PluginType::WorkflowExtension
    }

    async fn activate(&mut self) -> Result<(), ActivationError> {
        self.runner.activate()
    }

    async fn invoke(&self, capability: &str, input: Value) -> Result<Value, InvokeError> {
        let kind = self.runner.capability_kind(capability)?;
        let what = match kind {
            CapabilityType::WorkflowNode => "node inputs",
            _ => "tool arguments",
        };
        require_object(&input, what)?;
        self.runner.run(capability, kind, input).await
    }

    async fn deactivate(&self) {
        self.runner.deactivate();
    }
}

fn require_object(input: &Value, what: &str) -> Result<(), InvokeError> {
    if input.is_object() {
        Ok(())
    } else {
        Err(InvokeError::InvalidInput(format!("{} must be a JSON object", what)))
    }
}
