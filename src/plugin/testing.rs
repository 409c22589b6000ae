//! Doubles and a file-backed harness shared by the manager and initializer
//! tests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aihub_plugin_interface::PluginType;
use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::Notify;

use crate::capability::InMemoryCapabilityRegistry;
use crate::error::{ActivationError, InvokeError, PackageError, RegistryError};
use crate::plugin::manager::{OperationContext, PluginManager};
use crate::plugin::package::{FsPackageStore, PackageHandle, PackageStore, pack_files};
use crate::plugin::record::{PluginRecord, PluginState};
use crate::plugin::registry::{PluginRegistry, SqlitePluginRegistry};
use crate::plugin::runtime::{RuntimeFactory, RuntimeSpec, RuntimeUnit};

/// Unit that echoes its input back under `echo`.
pub struct EchoUnit {
    plugin_type: PluginType,
    fail: bool,
    delay: Option<Duration>,
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
    active: AtomicBool,
}

#[async_trait]
impl RuntimeUnit for EchoUnit {
    fn plugin_type(&self) -> PluginType {
        self.plugin_type
    }

    async fn activate(&mut self) -> Result<(), ActivationError> {
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(ActivationError::Failed("provider offline".to_string()));
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn invoke(&self, capability: &str, input: Value) -> Result<Value, InvokeError> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(InvokeError::NotActive);
        }
        Ok(json!({"capability": capability, "echo": input}))
    }

    async fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Builds echo units. Activation can fail per plugin, take a while, or park
/// until released.
#[derive(Default)]
pub struct TestFactory {
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl TestFactory {
    pub fn fail_for(&self, plugin_id: &str) {
        self.failing.lock().unwrap().insert(plugin_id.to_string());
    }

    pub fn slow(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Park the next activations. Returns (entered, release).
    pub fn gate(&self) -> (Arc<Notify>, Arc<Notify>) {
        let pair = (Arc::new(Notify::new()), Arc::new(Notify::new()));
        *self.gate.lock().unwrap() = Some(pair.clone());
        pair
    }
}

impl RuntimeFactory for TestFactory {
    fn create(&self, spec: RuntimeSpec) -> Result<Box<dyn RuntimeUnit>, ActivationError> {
        Ok(Box::new(EchoUnit {
            plugin_type: spec.plugin_type,
            fail: self.failing.lock().unwrap().contains(&spec.plugin_id),
            delay: *self.delay.lock().unwrap(),
            gate: self.gate.lock().unwrap().clone(),
            active: AtomicBool::new(false),
        }))
    }
}

/// Registry whose writes of one chosen state fail like a dropped connection.
pub struct FlakyRegistry {
    inner: SqlitePluginRegistry,
    failing_state: Mutex<Option<PluginState>>,
}

impl FlakyRegistry {
    pub fn open(path: &Path) -> Self {
        Self {
            inner: SqlitePluginRegistry::open(path).unwrap(),
            failing_state: Mutex::new(None),
        }
    }

    /// Refuse every write that would leave a record in `state`.
    pub fn fail_writes_of(&self, state: PluginState) {
        *self.failing_state.lock().unwrap() = Some(state);
    }

    pub fn heal(&self) {
        *self.failing_state.lock().unwrap() = None;
    }

    fn check(&self, record: &PluginRecord) -> Result<(), RegistryError> {
        match *self.failing_state.lock().unwrap() {
            Some(state) if state == record.state => {
                Err(RegistryError::Storage(format!("write of {} refused", state)))
            }
            _ => Ok(()),
        }
    }
}

impl PluginRegistry for FlakyRegistry {
    fn insert(&self, record: &PluginRecord) -> Result<(), RegistryError> {
        self.check(record)?;
        self.inner.insert(record)
    }

    fn update(&self, record: &PluginRecord) -> Result<(), RegistryError> {
        self.check(record)?;
        self.inner.update(record)
    }

    fn upsert(&self, record: &PluginRecord) -> Result<(), RegistryError> {
        self.check(record)?;
        self.inner.upsert(record)
    }

    fn delete(&self, plugin_id: &str) -> Result<(), RegistryError> {
        self.inner.delete(plugin_id)
    }

    fn find_by_plugin_id(&self, plugin_id: &str) -> Result<Option<PluginRecord>, RegistryError> {
        self.inner.find_by_plugin_id(plugin_id)
    }

    fn find_all(&self) -> Result<Vec<PluginRecord>, RegistryError> {
        self.inner.find_all()
    }

    fn find_by_type(&self, plugin_type: PluginType) -> Result<Vec<PluginRecord>, RegistryError> {
        self.inner.find_by_type(plugin_type)
    }

    fn find_by_state(&self, state: PluginState) -> Result<Vec<PluginRecord>, RegistryError> {
        self.inner.find_by_state(state)
    }

    fn find_by_enabled(&self, enabled: bool) -> Result<Vec<PluginRecord>, RegistryError> {
        self.inner.find_by_enabled(enabled)
    }
}

/// Package store that can be told to fail staging.
pub struct FlakyPackageStore {
    inner: FsPackageStore,
    fail_stage: AtomicBool,
}

impl FlakyPackageStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            inner: FsPackageStore::new(root),
            fail_stage: AtomicBool::new(false),
        }
    }

    pub fn fail_stage(&self, fail: bool) {
        self.fail_stage.store(fail, Ordering::SeqCst);
    }
}

impl PackageStore for FlakyPackageStore {
    fn stage(&self, plugin_id: &str, version: &str, package: &PackageHandle) -> Result<PathBuf, PackageError> {
        if self.fail_stage.load(Ordering::SeqCst) {
            return Err(PackageError::io(
                package.locator(),
                std::io::Error::other("disk full"),
            ));
        }
        self.inner.stage(plugin_id, version, package)
    }

    fn release(&self, path: &Path) -> Result<(), PackageError> {
        self.inner.release(path)
    }
}

/// A manager over a SQLite file, a package directory and echo units.
pub struct Platform {
    pub temp: TempDir,
    pub registry: Arc<FlakyRegistry>,
    pub packages: Arc<FlakyPackageStore>,
    pub factory: Arc<TestFactory>,
    pub manager: Arc<PluginManager>,
}

impl Platform {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let registry = Arc::new(FlakyRegistry::open(&temp.path().join("aihub.db")));
        let packages = Arc::new(FlakyPackageStore::new(temp.path().join("packages")));
        let factory = Arc::new(TestFactory::default());
        let manager = manager_over(registry.clone(), packages.clone(), &factory);
        Self {
            temp,
            registry,
            packages,
            factory,
            manager,
        }
    }

    /// A fresh manager over the same durable state, as after a restart.
    pub fn restart(&self) -> Arc<PluginManager> {
        manager_over(self.registry.clone(), self.packages.clone(), &self.factory)
    }

    /// A manager in another process: its own connection and its own index.
    pub fn other_process(&self) -> Arc<PluginManager> {
        let registry = Arc::new(SqlitePluginRegistry::open(&self.temp.path().join("aihub.db")).unwrap());
        let packages = Arc::new(FsPackageStore::new(self.temp.path().join("packages")));
        manager_over(registry, packages, &self.factory)
    }
}

fn manager_over(
    registry: Arc<dyn PluginRegistry>,
    packages: Arc<dyn PackageStore>,
    factory: &Arc<TestFactory>,
) -> Arc<PluginManager> {
    let capabilities = Arc::new(InMemoryCapabilityRegistry::new(Arc::clone(&registry), 64));
    Arc::new(PluginManager::new(registry, capabilities, packages, factory.clone()))
}

pub fn manifest(id: &str, version: &str, capabilities: &[&str]) -> String {
    let mut manifest = format!(
        r#"schema_version = 1
id = "{id}"
name = "{id} models"
version = "{version}"
type = "model-provider"
entry_point = "bin/provider.sh"

[description]
en_US = "Models from {id}"
"#
    );
    for cap in capabilities {
        manifest.push_str(&format!("\n[[capabilities]]\nname = \"{cap}\"\ntype = \"model\"\n"));
    }
    manifest
}

pub fn package(id: &str, version: &str, capabilities: &[&str]) -> PackageHandle {
    let manifest = manifest(id, version, capabilities);
    let bytes = pack_files(&[
        ("plugin.toml", manifest.as_bytes()),
        ("bin/provider.sh", b"#!/bin/sh\ncat\n"),
    ]);
    PackageHandle::from_bytes(format!("file:///plugins/{id}-{version}.tar.gz"), bytes)
}

pub fn ctx() -> OperationContext {
    OperationContext::new("tenant-admin")
}

/// Every capability of an `ENABLED` plugin is live and owned by it; no other
/// plugin owns any live capability.
pub fn assert_capabilities_follow_state(manager: &PluginManager) {
    let records = manager.list_plugins().unwrap();
    let capabilities = manager.capabilities();

    for record in &records {
        let owned: HashSet<String> = capabilities
            .get_by_plugin(&record.plugin_id)
            .into_iter()
            .map(|e| e.name)
            .collect();
        if record.state == PluginState::Enabled {
            let declared: HashSet<String> = record.capability_names().map(str::to_string).collect();
            assert_eq!(owned, declared, "live set of {}", record.plugin_id);
        } else {
            assert!(
                owned.is_empty(),
                "{} is {} but owns {:?}",
                record.plugin_id,
                record.state,
                owned
            );
        }
    }

    for entry in capabilities.get_all() {
        assert!(
            records.iter().any(|r| r.plugin_id == entry.plugin_id),
            "capability {} has no record",
            entry.name
        );
    }
}
