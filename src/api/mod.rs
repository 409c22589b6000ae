//! Admin HTTP adapter: one route per plugin manager operation.

pub mod handlers;
pub mod models;
pub mod routes;

use std::sync::Arc;

use crate::plugin::manager::PluginManager;

pub use routes::create_router;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<PluginManager>,
}

impl AppState {
    pub fn new(manager: Arc<PluginManager>) -> Self {
        Self { manager }
    }
}
