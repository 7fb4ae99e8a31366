use crate::paths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

pub const DEFAULT_MO2_DOWNLOAD_URL: &str =
    "https://github.com/ModOrganizer2/modorganizer/releases/download/v2.5.2/Mod.Organizer-2.5.2.7z";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_true")]
    pub use_hardlinks: bool,
    #[serde(default)]
    pub replace_existing: bool,
    #[serde(default = "default_modname_limit")]
    pub modname_limit: usize,
    #[serde(default = "default_true")]
    pub activate_new_instance: bool,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_mo2_download_url")]
    pub mo2_download_url: String,
    #[serde(default)]
    pub mo2_download_sha256: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            use_hardlinks: true,
            replace_existing: false,
            modname_limit: default_modname_limit(),
            activate_new_instance: true,
            worker_threads: default_worker_threads(),
            log_level: default_log_level(),
            mo2_download_url: default_mo2_download_url(),
            mo2_download_sha256: None,
        }
    }
}

impl AppConfig {
    pub fn load_or_create() -> Result<Self> {
        let base_dir = paths::app_data_dir()?;
        Self::load_or_create_in(&base_dir)
    }

    pub fn load_or_create_in(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read app config")?;
            let mut config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            if config.worker_threads == 0 || config.modname_limit == 0 {
                config.worker_threads = config.worker_threads.max(1);
                if config.modname_limit == 0 {
                    config.modname_limit = default_modname_limit();
                }
                config.save_in(base_dir)?;
            }
            return Ok(config);
        }

        let config = AppConfig::default();
        config.save_in(base_dir)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let base_dir = paths::app_data_dir()?;
        self.save_in(&base_dir)
    }

    pub fn save_in(&self, base_dir: &Path) -> Result<()> {
        fs::create_dir_all(base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(path, raw).context("write app config")?;
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_modname_limit() -> usize {
    100
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(4)
        .min(8)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mo2_download_url() -> String {
    DEFAULT_MO2_DOWNLOAD_URL.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_default_config_on_first_load() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_create_in(tmp.path()).unwrap();
        assert!(config.use_hardlinks);
        assert!(!config.replace_existing);
        assert!(tmp.path().join("config.json").exists());
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("config.json"),
            r#"{ "replace_existing": true, "modname_limit": 0 }"#,
        )
        .unwrap();
        let config = AppConfig::load_or_create_in(tmp.path()).unwrap();
        assert!(config.replace_existing);
        assert!(config.use_hardlinks);
        assert_eq!(config.modname_limit, 100);
        assert_eq!(config.log_level, "info");
    }
}
