//! Boot-time restoration of plugin state.

use std::sync::Arc;

use serde::Serialize;

use crate::error::PluginError;
use crate::plugin::manager::PluginManager;

/// What happened during startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InitReport {
    /// Records settled by crash recovery.
    pub recovered: usize,
    /// Plugins brought back to `ENABLED` with a live runtime unit.
    pub restored: Vec<String>,
    /// Plugins that could not be restored, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Brings the platform back to its last durable plugin state.
pub struct SystemInitializer {
    manager: Arc<PluginManager>,
    auto_load: bool,
}

impl SystemInitializer {
    pub fn new(manager: Arc<PluginManager>, auto_load: bool) -> Self {
        Self { manager, auto_load }
    }

    /// Recover interrupted operations, rebuild the capability index, then
    /// restore every `ENABLED` plugin if auto-load is on.
    ///
    /// A plugin that fails to restore is logged and reported; it never stops
    /// the others or the host. Only a store failure while listing records is
    /// returned as an error.
    pub async fn run(&self) -> Result<InitReport, PluginError> {
        let mut report = InitReport::default();

        let recovery = self.manager.recover_interrupted().await?;
        report.recovered = recovery.recovered();
        for (plugin_id, reason) in recovery.errors {
            tracing::warn!(plugin = %plugin_id, error = %reason, "Recovery incomplete");
        }

        self.manager.refresh_capabilities().await?;

        if !self.auto_load {
            tracing::info!("Plugin auto-load disabled; runtime units start on first use");
            return Ok(report);
        }

        for record in self.manager.get_enabled_plugins()? {
            let plugin_id = record.plugin_id;
            match self.manager.restore_plugin(&plugin_id).await {
                Ok(()) => report.restored.push(plugin_id),
                Err(e) => {
                    tracing::warn!(plugin = %plugin_id, error = %e, "Failed to restore plugin");
                    report.failed.push((plugin_id, e.to_string()));
                }
            }
        }

        tracing::info!(
            recovered = report.recovered,
            restored = report.restored.len(),
            failed = report.failed.len(),
            "Plugin initialization complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::record::PluginState;
    use crate::plugin::registry::PluginRegistry;
    use crate::plugin::testing::{Platform, assert_capabilities_follow_state, ctx, package};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_restores_enabled_plugins_in_isolation() {
        let p = Platform::new();
        for id in ["alpha", "beta"] {
            let model = format!("{id}-model");
            p.manager
                .install_plugin(&package(id, "1.0.0", &[model.as_str()]), &ctx())
                .await
                .unwrap();
            p.manager.enable_plugin(id).await.unwrap();
        }
        p.manager.shutdown().await;

        p.factory.fail_for("alpha");
        let restarted = p.restart();
        let report = SystemInitializer::new(Arc::clone(&restarted), true)
            .run()
            .await
            .unwrap();

        assert_eq!(report.restored, vec!["beta"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "alpha");

        let alpha = restarted.get_plugin("alpha").unwrap();
        assert_eq!(alpha.state, PluginState::Failed);
        assert!(alpha.last_error.is_some());
        assert!(!restarted.is_model_available("alpha-model"));
        assert!(restarted.is_model_available("beta-model"));
        assert_capabilities_follow_state(&restarted);
    }

    #[tokio::test]
    async fn test_second_claimant_of_a_capability_fails_restore() {
        let p = Platform::new();
        for id in ["first", "second"] {
            p.manager
                .install_plugin(&package(id, "1.0.0", &["gpt-mini"]), &ctx())
                .await
                .unwrap();
        }
        p.manager.enable_plugin("first").await.unwrap();
        // Left behind by an older host that did not check ownership.
        let mut second = p.registry.find_by_plugin_id("second").unwrap().unwrap();
        second.set_state(PluginState::Enabled);
        p.registry.update(&second).unwrap();
        p.manager.shutdown().await;

        let restarted = p.restart();
        let report = SystemInitializer::new(Arc::clone(&restarted), true)
            .run()
            .await
            .unwrap();

        assert_eq!(report.restored, vec!["first"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "second");
        assert_eq!(restarted.get_plugin("second").unwrap().state, PluginState::Failed);
        assert_eq!(
            restarted.capabilities().get_by_name("gpt-mini").unwrap().plugin_id,
            "first"
        );
        assert_capabilities_follow_state(&restarted);
    }

    #[tokio::test]
    async fn test_without_auto_load_activates_on_first_use() {
        let p = Platform::new();
        p.manager
            .install_plugin(&package("acme", "1.0.0", &["gpt-mini"]), &ctx())
            .await
            .unwrap();
        p.manager.enable_plugin("acme").await.unwrap();
        p.manager.shutdown().await;

        let restarted = p.restart();
        let report = SystemInitializer::new(Arc::clone(&restarted), false)
            .run()
            .await
            .unwrap();
        assert!(report.restored.is_empty());
        assert!(restarted.is_model_available("gpt-mini"));

        let output = restarted.invoke("gpt-mini", json!("ping")).await.unwrap();
        assert_eq!(output["echo"], "ping");
    }

    #[tokio::test]
    async fn test_resumes_interrupted_uninstall() {
        let p = Platform::new();
        let mut record = p
            .manager
            .install_plugin(&package("acme", "1.0.0", &["gpt-mini"]), &ctx())
            .await
            .unwrap();
        record.set_state(PluginState::Uninstalling);
        p.registry.update(&record).unwrap();

        let restarted = p.restart();
        let report = SystemInitializer::new(Arc::clone(&restarted), true)
            .run()
            .await
            .unwrap();

        assert_eq!(report.recovered, 1);
        assert!(!p.registry.exists_by_plugin_id("acme").unwrap());
    }
}
