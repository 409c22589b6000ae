//! Plugin lifecycle manager.
//!
//! The manager is the single writer of plugin records. It validates every
//! transition, orders writes so that a capability is never advertised for a
//! plugin that is not `ENABLED`, and owns the runtime units of enabled
//! plugins.
//!
//! Ordering rules:
//! - enable: activate, register capabilities, then write `ENABLED`.
//! - disable: unregister capabilities, write `DISABLED`, then deactivate.
//! - uninstall: disable if needed, write `UNINSTALLING`, release the package,
//!   then delete the record.
//!
//! A crash between two steps leaves a state `refresh` or
//! [`recover_interrupted`](PluginManager::recover_interrupted) can reconcile.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};

use aihub_plugin_interface::{CapabilityType, PluginType};
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use crate::capability::{CapabilityEntry, CapabilityRegistry, RefreshSummary};
use crate::error::{Operation, PluginError, RegistryError};
use crate::plugin::descriptor::{DescriptorParser, PluginDescriptor};
use crate::plugin::locks::KeyedLocks;
use crate::plugin::package::{PackageHandle, PackageStore};
use crate::plugin::record::{PluginRecord, PluginState};
use crate::plugin::registry::PluginRegistry;
use crate::plugin::runtime::{RuntimeFactory, RuntimeSpec, RuntimeUnit};

/// Identity and cancellation for a single manager call.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Opaque identity recorded in audit fields.
    pub actor: String,
    /// Honored only until the first registry write of the operation.
    pub cancel: CancellationToken,
}

impl OperationContext {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn ensure_live(&self, plugin_id: &str, operation: Operation) -> Result<(), PluginError> {
        if self.cancel.is_cancelled() {
            return Err(PluginError::Cancelled {
                plugin_id: plugin_id.to_string(),
                operation,
            });
        }
        Ok(())
    }
}

/// Outcome of [`PluginManager::recover_interrupted`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Installs that were interrupted and are now `FAILED`.
    pub failed_installs: Vec<String>,
    /// Uninstalls that were resumed and completed.
    pub resumed_uninstalls: Vec<String>,
    /// Plugins whose recovery itself failed, with the reason.
    pub errors: Vec<(String, String)>,
}

impl RecoveryReport {
    pub fn recovered(&self) -> usize {
        self.failed_installs.len() + self.resumed_uninstalls.len()
    }
}

/// Orchestrates the plugin lifecycle.
pub struct PluginManager {
    registry: Arc<dyn PluginRegistry>,
    capabilities: Arc<dyn CapabilityRegistry>,
    packages: Arc<dyn PackageStore>,
    runtimes: Arc<dyn RuntimeFactory>,
    locks: KeyedLocks,
    active: RwLock<HashMap<String, Arc<dyn RuntimeUnit>>>,
}

impl PluginManager {
    pub fn new(
        registry: Arc<dyn PluginRegistry>,
        capabilities: Arc<dyn CapabilityRegistry>,
        packages: Arc<dyn PackageStore>,
        runtimes: Arc<dyn RuntimeFactory>,
    ) -> Self {
        Self {
            registry,
            capabilities,
            packages,
            runtimes,
            locks: KeyedLocks::new(),
            active: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn PluginRegistry> {
        &self.registry
    }

    pub fn capabilities(&self) -> &Arc<dyn CapabilityRegistry> {
        &self.capabilities
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Install a package as a new plugin, or retry a `FAILED` one.
    ///
    /// The package is parsed before anything is written, so a bad package
    /// never leaves a record behind. The new record passes through
    /// `INSTALLING` and ends `INSTALLED`; its capabilities stay unpublished
    /// until [`enable_plugin`](Self::enable_plugin).
    pub async fn install_plugin(
        &self,
        package: &PackageHandle,
        ctx: &OperationContext,
    ) -> Result<PluginRecord, PluginError> {
        let descriptor = DescriptorParser::parse(package)?;
        let plugin_id = descriptor.id.clone();
        let op = Operation::Install;
        let _guard = self.lock(&plugin_id, op)?;

        let existing = self
            .registry
            .find_by_plugin_id(&plugin_id)
            .map_err(|e| PluginError::from_registry(&plugin_id, op, e))?;
        if let Some(ref record) = existing
            && record.state != PluginState::Failed
        {
            return Err(invalid_state(record, op));
        }
        ctx.ensure_live(&plugin_id, op)?;

        // Replaces a FAILED record in place; otherwise the id is new.
        let mut record = PluginRecord::from_descriptor(&descriptor, package, &ctx.actor);
        self.registry
            .upsert(&record)
            .map_err(|e| PluginError::from_registry(&plugin_id, op, e))?;
        tracing::info!(plugin = %plugin_id, version = %record.version, actor = %ctx.actor, "Installing plugin");

        let staged = match self.packages.stage(&plugin_id, &descriptor.version, package) {
            Ok(path) => path,
            Err(e) => {
                record.mark_failed(e.to_string());
                self.store_best_effort(&record, op);
                return Err(PluginError::package(&plugin_id, op, e));
            }
        };

        let stale_path = existing.and_then(|r| r.source_path);
        record.source_path = Some(staged.to_string_lossy().into_owned());
        record.set_state(PluginState::Installed);
        self.store(&record, op)?;

        if stale_path != record.source_path {
            self.release_best_effort(&plugin_id, stale_path.as_deref());
        }
        tracing::info!(plugin = %plugin_id, "Plugin installed");
        Ok(record)
    }

    /// Activate a plugin and publish its capabilities.
    ///
    /// Any failure before the record is written leaves it unchanged.
    pub async fn enable_plugin(&self, plugin_id: &str) -> Result<PluginRecord, PluginError> {
        let op = Operation::Enable;
        let _guard = self.lock(plugin_id, op)?;
        let mut record = self.load(plugin_id, op)?;
        if !matches!(record.state, PluginState::Installed | PluginState::Disabled) {
            return Err(invalid_state(&record, op));
        }
        self.check_conflicts(&record, op)?;

        let unit = self.activate(&record, op).await?;

        if let Err(e) = self.publish(&record).await {
            self.withdraw_best_effort(plugin_id).await;
            unit.deactivate().await;
            return Err(PluginError::from_registry(plugin_id, op, e));
        }

        record.set_state(PluginState::Enabled);
        if let Err(e) = self.store(&record, op) {
            self.withdraw_best_effort(plugin_id).await;
            unit.deactivate().await;
            return Err(e);
        }

        self.set_active(plugin_id, unit);
        tracing::info!(
            plugin = %plugin_id,
            capabilities = record.capabilities.len(),
            "Plugin enabled"
        );
        Ok(record)
    }

    /// Withdraw a plugin's capabilities and stop its runtime unit.
    pub async fn disable_plugin(&self, plugin_id: &str) -> Result<PluginRecord, PluginError> {
        let op = Operation::Disable;
        let _guard = self.lock(plugin_id, op)?;
        let mut record = self.load(plugin_id, op)?;
        if record.state != PluginState::Enabled {
            return Err(invalid_state(&record, op));
        }
        self.disable_locked(&mut record, op).await?;
        tracing::info!(plugin = %plugin_id, "Plugin disabled");
        Ok(record)
    }

    /// Remove a plugin, disabling it first if needed.
    ///
    /// A failure after the record reached `UNINSTALLING` leaves it there;
    /// calling this again, or [`recover_interrupted`](Self::recover_interrupted),
    /// resumes the deletion.
    pub async fn uninstall_plugin(&self, plugin_id: &str) -> Result<(), PluginError> {
        let op = Operation::Uninstall;
        let _guard = self.lock(plugin_id, op)?;
        let mut record = self.load(plugin_id, op)?;

        match record.state {
            PluginState::Enabled => self.disable_locked(&mut record, op).await?,
            PluginState::Installing => return Err(invalid_state(&record, op)),
            PluginState::Installed
            | PluginState::Disabled
            | PluginState::Failed
            | PluginState::Uninstalling => {}
        }

        // A FAILED record may still own capabilities from a broken disable.
        self.withdraw(plugin_id)
            .await
            .map_err(|e| PluginError::from_registry(plugin_id, op, e))?;
        if let Some(unit) = self.take_active(plugin_id) {
            unit.deactivate().await;
        }

        if record.state != PluginState::Uninstalling {
            record.set_state(PluginState::Uninstalling);
            self.store(&record, op)?;
        }

        if let Some(ref path) = record.source_path {
            self.packages
                .release(Path::new(path))
                .map_err(|e| PluginError::package(plugin_id, op, e))?;
        }

        self.registry
            .delete(plugin_id)
            .map_err(|e| PluginError::from_registry(plugin_id, op, e))?;
        tracing::info!(plugin = %plugin_id, "Plugin uninstalled");
        Ok(())
    }

    /// Replace a plugin's package, keeping whether it was enabled.
    ///
    /// An enabled plugin keeps serving its old version until the new one is
    /// activated; the capability set is then swapped by registering the new
    /// capabilities before unregistering the ones that disappeared.
    pub async fn update_plugin(
        &self,
        plugin_id: &str,
        package: &PackageHandle,
        ctx: &OperationContext,
    ) -> Result<PluginRecord, PluginError> {
        let descriptor = DescriptorParser::parse(package)?;
        if descriptor.id != plugin_id {
            return Err(PluginError::IdentityMismatch {
                expected: plugin_id.to_string(),
                found: descriptor.id,
            });
        }

        let op = Operation::Update;
        let _guard = self.lock(plugin_id, op)?;
        let record = self.load(plugin_id, op)?;
        ctx.ensure_live(plugin_id, op)?;

        let updated = match record.state {
            PluginState::Enabled => self.update_enabled(record, &descriptor, package).await?,
            PluginState::Installed | PluginState::Disabled | PluginState::Failed => {
                self.update_resting(record, &descriptor, package)?
            }
            PluginState::Installing | PluginState::Uninstalling => {
                return Err(invalid_state(&record, op));
            }
        };

        tracing::info!(
            plugin = %plugin_id,
            version = %updated.version,
            state = %updated.state,
            "Plugin updated"
        );
        Ok(updated)
    }

    /// Bring an `ENABLED` record back to life after a restart.
    ///
    /// Idempotent: an already active plugin only has its capabilities
    /// re-registered. If activation or registration fails the record becomes
    /// `FAILED`.
    pub async fn restore_plugin(&self, plugin_id: &str) -> Result<(), PluginError> {
        let op = Operation::Restore;
        let _guard = self.lock(plugin_id, op)?;
        let mut record = self.load(plugin_id, op)?;
        if record.state != PluginState::Enabled {
            return Err(invalid_state(&record, op));
        }

        let fresh_unit = if self.get_active(plugin_id).is_some() {
            None
        } else {
            match self.activate(&record, op).await {
                Ok(unit) => Some(unit),
                Err(e) => {
                    self.withdraw_best_effort(plugin_id).await;
                    record.mark_failed(e.to_string());
                    self.store_best_effort(&record, op);
                    return Err(e);
                }
            }
        };

        if let Err(e) = self.publish(&record).await {
            let err = PluginError::from_registry(plugin_id, op, e);
            self.withdraw_best_effort(plugin_id).await;
            if let Some(unit) = fresh_unit.or_else(|| self.take_active(plugin_id)) {
                unit.deactivate().await;
            }
            record.mark_failed(err.to_string());
            self.store_best_effort(&record, op);
            return Err(err);
        }
        if let Some(unit) = fresh_unit {
            self.set_active(plugin_id, unit);
        }
        tracing::info!(plugin = %plugin_id, "Plugin restored");
        Ok(())
    }

    /// Settle records left mid-operation by a crash.
    ///
    /// `INSTALLING` records become `FAILED`; `UNINSTALLING` records have
    /// their deletion resumed.
    pub async fn recover_interrupted(&self) -> Result<RecoveryReport, PluginError> {
        let op = Operation::Recover;
        let mut report = RecoveryReport::default();

        let installing = self
            .registry
            .find_by_state(PluginState::Installing)
            .map_err(|e| PluginError::from_registry("*", op, e))?;
        for mut record in installing {
            let plugin_id = record.plugin_id.clone();
            let Some(_guard) = self.locks.try_acquire(&plugin_id) else {
                continue;
            };
            record.mark_failed("interrupted during install");
            match self.store(&record, op) {
                Ok(()) => {
                    tracing::warn!(plugin = %plugin_id, "Interrupted install marked FAILED");
                    report.failed_installs.push(plugin_id);
                }
                Err(e) => report.errors.push((plugin_id, e.to_string())),
            }
        }

        let uninstalling = self
            .registry
            .find_by_state(PluginState::Uninstalling)
            .map_err(|e| PluginError::from_registry("*", op, e))?;
        for record in uninstalling {
            let plugin_id = record.plugin_id;
            match self.uninstall_plugin(&plugin_id).await {
                Ok(()) => {
                    tracing::info!(plugin = %plugin_id, "Resumed interrupted uninstall");
                    report.resumed_uninstalls.push(plugin_id);
                }
                Err(e) => {
                    tracing::warn!(plugin = %plugin_id, error = %e, "Could not resume uninstall");
                    report.errors.push((plugin_id, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    // ------------------------------------------------------------------
    // Capability sink
    // ------------------------------------------------------------------

    /// Invoke a live capability.
    ///
    /// A capability that is absent or unavailable yields the retryable
    /// [`PluginError::Unavailable`]. The owning unit is activated on first
    /// use if the plugin is enabled but not yet loaded.
    pub async fn invoke(&self, capability: &str, input: Value) -> Result<Value, PluginError> {
        let entry = self
            .capabilities
            .get_by_name(capability)
            .filter(|entry| entry.available)
            .ok_or_else(|| PluginError::Unavailable(capability.to_string()))?;

        // The store is the authority: another process may have disabled or
        // removed the owner since this index was built.
        match self.registry.find_by_plugin_id(&entry.plugin_id) {
            Ok(Some(record)) if record.is_enabled() => {}
            Ok(_) => {
                self.retire_stale(&entry.plugin_id).await;
                return Err(PluginError::Unavailable(capability.to_string()));
            }
            Err(e) => return Err(PluginError::from_registry(&entry.plugin_id, Operation::Invoke, e)),
        }

        let unit = match self.get_active(&entry.plugin_id) {
            Some(unit) => unit,
            None => self.activate_lazily(&entry).await?,
        };

        unit.invoke(capability, input)
            .await
            .map_err(|source| PluginError::Invocation {
                capability: capability.to_string(),
                source,
            })
    }

    async fn activate_lazily(&self, entry: &CapabilityEntry) -> Result<Arc<dyn RuntimeUnit>, PluginError> {
        let plugin_id = &entry.plugin_id;
        let unavailable = || PluginError::Unavailable(entry.name.clone());
        let Some(_guard) = self.locks.try_acquire(plugin_id) else {
            return Err(unavailable());
        };
        if let Some(unit) = self.get_active(plugin_id) {
            return Ok(unit);
        }

        let record = self.load(plugin_id, Operation::Invoke)?;
        if !record.is_enabled() {
            return Err(unavailable());
        }
        let unit = self.activate(&record, Operation::Invoke).await?;
        self.set_active(plugin_id, Arc::clone(&unit));
        tracing::debug!(plugin = %plugin_id, "Runtime unit activated on first use");
        Ok(unit)
    }

    /// Withdraw the capabilities and stop the unit of a plugin whose record
    /// is no longer `ENABLED`. Skipped while another operation holds it.
    async fn retire_stale(&self, plugin_id: &str) {
        let Some(_guard) = self.locks.try_acquire(plugin_id) else {
            return;
        };
        match self.registry.find_by_plugin_id(plugin_id) {
            Ok(Some(record)) if record.is_enabled() => {}
            Ok(_) => {
                if let Err(e) = self.sync_plugin(plugin_id, None).await {
                    tracing::warn!(plugin = %plugin_id, error = %e, "Failed to retire stale plugin");
                }
            }
            Err(e) => tracing::warn!(plugin = %plugin_id, error = %e, "Failed to read plugin record"),
        }
    }

    /// Whether `name` is a live, available model of an enabled plugin.
    pub fn is_model_available(&self, name: &str) -> bool {
        let Some(entry) = self.capabilities.get_by_name(name) else {
            return false;
        };
        if !entry.available || entry.kind != CapabilityType::Model {
            return false;
        }
        matches!(
            self.registry.find_by_plugin_id(&entry.plugin_id),
            Ok(Some(record)) if record.is_enabled()
        )
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get_plugin(&self, plugin_id: &str) -> Result<PluginRecord, PluginError> {
        self.load(plugin_id, Operation::Refresh)
    }

    pub fn list_plugins(&self) -> Result<Vec<PluginRecord>, PluginError> {
        self.registry
            .find_all()
            .map_err(|e| PluginError::from_registry("*", Operation::Refresh, e))
    }

    pub fn get_plugins_by_type(&self, plugin_type: PluginType) -> Result<Vec<PluginRecord>, PluginError> {
        self.registry
            .find_by_type(plugin_type)
            .map_err(|e| PluginError::from_registry("*", Operation::Refresh, e))
    }

    /// Records in `ENABLED`. `FAILED` records are never included.
    pub fn get_enabled_plugins(&self) -> Result<Vec<PluginRecord>, PluginError> {
        self.registry
            .find_by_enabled(true)
            .map_err(|e| PluginError::from_registry("*", Operation::Refresh, e))
    }

    /// Rebuild the capability registry from the enabled records.
    pub async fn refresh_capabilities(&self) -> Result<RefreshSummary, PluginError> {
        self.capabilities
            .refresh()
            .await
            .map_err(|e| PluginError::from_registry("*", Operation::Refresh, e))
    }

    /// Bring the capability index and runtime units in line with the store.
    ///
    /// Picks up transitions written by another process sharing the same
    /// registry. Plugins with an operation in flight are left for the next
    /// pass. Returns how many plugins were adjusted.
    pub async fn reconcile(&self) -> Result<usize, PluginError> {
        let op = Operation::Refresh;
        let records = self
            .registry
            .find_all()
            .map_err(|e| PluginError::from_registry("*", op, e))?;

        let mut ids: BTreeSet<String> = records.into_iter().map(|r| r.plugin_id).collect();
        ids.extend(self.capabilities.get_all().into_iter().map(|e| e.plugin_id));
        ids.extend(self.active_ids());

        let mut adjusted = 0;
        for plugin_id in ids {
            let Some(_guard) = self.locks.try_acquire(&plugin_id) else {
                continue;
            };
            let enabled = match self.registry.find_by_plugin_id(&plugin_id) {
                Ok(record) => record.filter(PluginRecord::is_enabled),
                Err(e) => {
                    tracing::warn!(plugin = %plugin_id, error = %e, "Skipping reconcile");
                    continue;
                }
            };
            match self.sync_plugin(&plugin_id, enabled.as_ref()).await {
                Ok(true) => {
                    tracing::info!(plugin = %plugin_id, "Reconciled plugin with the store");
                    adjusted += 1;
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(plugin = %plugin_id, error = %e, "Reconcile failed"),
            }
        }
        Ok(adjusted)
    }

    /// Deactivate every runtime unit. Records and capabilities are left as
    /// they are so the next start can restore them.
    pub async fn shutdown(&self) {
        let units: Vec<_> = {
            let mut active = self.active.write().unwrap_or_else(|p| p.into_inner());
            active.drain().collect()
        };
        for (plugin_id, unit) in units {
            unit.deactivate().await;
            tracing::debug!(plugin = %plugin_id, "Runtime unit stopped");
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn lock(&self, plugin_id: &str, operation: Operation) -> Result<OwnedMutexGuard<()>, PluginError> {
        self.locks
            .try_acquire(plugin_id)
            .ok_or_else(|| PluginError::InvalidState {
                plugin_id: plugin_id.to_string(),
                operation,
                state: None,
            })
    }

    fn load(&self, plugin_id: &str, operation: Operation) -> Result<PluginRecord, PluginError> {
        self.registry
            .find_by_plugin_id(plugin_id)
            .map_err(|e| PluginError::from_registry(plugin_id, operation, e))?
            .ok_or_else(|| PluginError::NotFound {
                plugin_id: plugin_id.to_string(),
            })
    }

    fn store(&self, record: &PluginRecord, operation: Operation) -> Result<(), PluginError> {
        self.registry
            .update(record)
            .map_err(|e| PluginError::from_registry(&record.plugin_id, operation, e))
    }

    fn store_best_effort(&self, record: &PluginRecord, operation: Operation) {
        if let Err(e) = self.store(record, operation) {
            tracing::warn!(plugin = %record.plugin_id, error = %e, "Failed to record plugin state");
        }
    }

    fn release_best_effort(&self, plugin_id: &str, path: Option<&str>) {
        if let Some(path) = path
            && let Err(e) = self.packages.release(Path::new(path))
        {
            tracing::warn!(plugin = %plugin_id, error = %e, "Failed to release staged package");
        }
    }

    fn check_conflicts(&self, record: &PluginRecord, operation: Operation) -> Result<(), PluginError> {
        for name in record.capability_names() {
            if let Some(existing) = self.capabilities.get_by_name(name)
                && existing.plugin_id != record.plugin_id
            {
                tracing::debug!(plugin = %record.plugin_id, %operation, capability = %name, "Capability conflict");
                return Err(PluginError::CapabilityConflict {
                    plugin_id: record.plugin_id.clone(),
                    capability: name.to_string(),
                    owner: existing.plugin_id,
                });
            }
        }
        Ok(())
    }

    async fn activate(
        &self,
        record: &PluginRecord,
        operation: Operation,
    ) -> Result<Arc<dyn RuntimeUnit>, PluginError> {
        let plugin_id = &record.plugin_id;
        let activation = |e| PluginError::activation(plugin_id, operation, e);

        let spec = RuntimeSpec::from_record(record).map_err(activation)?;
        let mut unit = self.runtimes.create(spec).map_err(activation)?;
        unit.activate().await.map_err(activation)?;
        Ok(Arc::from(unit))
    }

    /// Register every capability the record declares.
    async fn publish(&self, record: &PluginRecord) -> Result<(), RegistryError> {
        for entry in CapabilityEntry::for_record(record) {
            self.capabilities.register(entry).await?;
        }
        Ok(())
    }

    /// Unregister every capability owned by `plugin_id`.
    async fn withdraw(&self, plugin_id: &str) -> Result<(), RegistryError> {
        for entry in self.capabilities.get_by_plugin(plugin_id) {
            self.capabilities.unregister(&entry.name).await?;
        }
        Ok(())
    }

    async fn withdraw_best_effort(&self, plugin_id: &str) {
        if let Err(e) = self.withdraw(plugin_id).await {
            tracing::warn!(plugin = %plugin_id, error = %e, "Failed to withdraw capabilities");
        }
    }

    /// Put the capability set back to what `record` declares.
    async fn republish_best_effort(&self, record: &PluginRecord) {
        self.withdraw_best_effort(&record.plugin_id).await;
        if let Err(e) = self.publish(record).await {
            tracing::warn!(plugin = %record.plugin_id, error = %e, "Failed to restore capabilities");
        }
    }

    /// Disable path shared by disable and uninstall. Caller holds the lock.
    async fn disable_locked(&self, record: &mut PluginRecord, operation: Operation) -> Result<(), PluginError> {
        let plugin_id = record.plugin_id.clone();

        if let Err(e) = self.withdraw(&plugin_id).await {
            // Some capabilities may still be live; only an operator can tell.
            record.mark_failed(format!("failed to withdraw capabilities: {}", e));
            self.store_best_effort(record, operation);
            if let Some(unit) = self.take_active(&plugin_id) {
                unit.deactivate().await;
            }
            return Err(PluginError::from_registry(&plugin_id, operation, e));
        }

        record.set_state(PluginState::Disabled);
        if let Err(e) = self.store(record, operation) {
            record.set_state(PluginState::Enabled);
            self.republish_best_effort(record).await;
            return Err(e);
        }

        if let Some(unit) = self.take_active(&plugin_id) {
            unit.deactivate().await;
        }
        Ok(())
    }

    async fn update_enabled(
        &self,
        current: PluginRecord,
        descriptor: &PluginDescriptor,
        package: &PackageHandle,
    ) -> Result<PluginRecord, PluginError> {
        let op = Operation::Update;
        let plugin_id = current.plugin_id.clone();

        let mut next = current.clone();
        next.apply_descriptor(descriptor, package);
        self.check_conflicts(&next, op)?;

        let staged = self
            .packages
            .stage(&plugin_id, &descriptor.version, package)
            .map_err(|e| PluginError::package(&plugin_id, op, e))?;
        next.source_path = Some(staged.to_string_lossy().into_owned());
        let staged_is_new = next.source_path != current.source_path;

        let unit = match self.activate(&next, op).await {
            Ok(unit) => unit,
            Err(e) => {
                if staged_is_new {
                    self.release_best_effort(&plugin_id, next.source_path.as_deref());
                }
                return Err(e);
            }
        };

        let swap = async {
            self.publish(&next).await?;
            let kept: Vec<&str> = next.capability_names().collect();
            for name in current.capability_names() {
                if !kept.contains(&name) {
                    self.capabilities.unregister(name).await?;
                }
            }
            Ok::<(), RegistryError>(())
        };
        let committed = match swap.await {
            Ok(()) => self.store(&next, op),
            Err(e) => Err(PluginError::from_registry(&plugin_id, op, e)),
        };
        if let Err(e) = committed {
            self.republish_best_effort(&current).await;
            unit.deactivate().await;
            if staged_is_new {
                self.release_best_effort(&plugin_id, next.source_path.as_deref());
            }
            return Err(e);
        }

        if let Some(old) = self.set_active(&plugin_id, unit) {
            old.deactivate().await;
        }
        if staged_is_new {
            self.release_best_effort(&plugin_id, current.source_path.as_deref());
        }
        Ok(next)
    }

    fn update_resting(
        &self,
        mut record: PluginRecord,
        descriptor: &PluginDescriptor,
        package: &PackageHandle,
    ) -> Result<PluginRecord, PluginError> {
        let op = Operation::Update;
        let plugin_id = record.plugin_id.clone();
        let prior = record.clone();

        record.set_state(PluginState::Installing);
        self.store(&record, op)?;

        let staged = match self.packages.stage(&plugin_id, &descriptor.version, package) {
            Ok(path) => path,
            Err(e) => {
                self.store_best_effort(&prior, op);
                return Err(PluginError::package(&plugin_id, op, e));
            }
        };

        record.apply_descriptor(descriptor, package);
        record.source_path = Some(staged.to_string_lossy().into_owned());
        record.set_state(PluginState::Installed);
        self.store(&record, op)?;

        if prior.source_path != record.source_path {
            self.release_best_effort(&plugin_id, prior.source_path.as_deref());
        }
        Ok(record)
    }

    /// Make the live state of one plugin match `enabled`, its record if it
    /// is `ENABLED`. Caller holds the lock. Returns whether anything changed.
    async fn sync_plugin(&self, plugin_id: &str, enabled: Option<&PluginRecord>) -> Result<bool, RegistryError> {
        let owned = self.capabilities.get_by_plugin(plugin_id);
        let mut changed = false;

        let Some(record) = enabled else {
            for entry in owned {
                self.capabilities.unregister(&entry.name).await?;
                changed = true;
            }
            if let Some(unit) = self.take_active(plugin_id) {
                unit.deactivate().await;
                changed = true;
            }
            return Ok(changed);
        };

        for entry in CapabilityEntry::for_record(record) {
            match self.capabilities.get_by_name(&entry.name) {
                Some(live) if live.plugin_id == plugin_id && live.same_metadata(&entry) => {}
                _ => {
                    self.capabilities.register(entry).await?;
                    changed = true;
                }
            }
        }
        for entry in owned {
            if !record.capability_names().any(|name| name == entry.name) {
                self.capabilities.unregister(&entry.name).await?;
                changed = true;
            }
        }
        Ok(changed)
    }

    fn active_ids(&self) -> Vec<String> {
        let active = self.active.read().unwrap_or_else(|p| p.into_inner());
        active.keys().cloned().collect()
    }

    fn get_active(&self, plugin_id: &str) -> Option<Arc<dyn RuntimeUnit>> {
        let active = self.active.read().unwrap_or_else(|p| p.into_inner());
        active.get(plugin_id).cloned()
    }

    fn set_active(&self, plugin_id: &str, unit: Arc<dyn RuntimeUnit>) -> Option<Arc<dyn RuntimeUnit>> {
        let mut active = self.active.write().unwrap_or_else(|p| p.into_inner());
        active.insert(plugin_id.to_string(), unit)
    }

    fn take_active(&self, plugin_id: &str) -> Option<Arc<dyn RuntimeUnit>> {
        let mut active = self.active.write().unwrap_or_else(|p| p.into_inner());
        active.remove(plugin_id)
    }
}

fn invalid_state(record: &PluginRecord, operation: Operation) -> PluginError {
    PluginError::InvalidState {
        plugin_id: record.plugin_id.clone(),
        operation,
        state: Some(record.state),
    }
}
