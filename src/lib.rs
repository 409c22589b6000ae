pub mod api;
pub mod capability;
pub mod config;
pub mod error;
pub mod plugin;
pub mod utils;
