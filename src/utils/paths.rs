use anyhow::{Result, anyhow};
use std::fs;
use std::path::PathBuf;

pub fn get_aihub_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("Could not find home directory"))?;
    Ok(home.join(".aihub"))
}

pub fn get_config_path() -> Result<PathBuf> {
    let aihub_dir = get_aihub_dir()?;
    Ok(aihub_dir.join("config.toml"))
}

pub fn get_database_path() -> Result<PathBuf> {
    let aihub_dir = get_aihub_dir()?;
    Ok(aihub_dir.join("aihub.db"))
}

/// Root of the staged package store.
pub fn get_packages_dir() -> Result<PathBuf> {
    let aihub_dir = get_aihub_dir()?;
    Ok(aihub_dir.join("packages"))
}

pub fn get_logs_dir() -> Result<PathBuf> {
    let aihub_dir = get_aihub_dir()?;
    Ok(aihub_dir.join("logs"))
}

pub fn ensure_aihub_dir_exists() -> Result<PathBuf> {
    let aihub_dir = get_aihub_dir()?;
    if !aihub_dir.exists() {
        fs::create_dir_all(&aihub_dir)?;
    }
    Ok(aihub_dir)
}
