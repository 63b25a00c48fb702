use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server_port: u16,
    pub data_dir: PathBuf,
    pub log_level: String,
    #[serde(default)]
    pub catalog_url: Option<String>,
    pub catalog_refresh_secs: u64,
    pub max_concurrent_downloads: usize,
    // First-run defaults, the preference store wins afterwards
    pub auto_delete_updates: bool,
    pub ab_perf_mode: bool,
    pub engine_command: String,
    #[serde(default)]
    pub engine_args: Vec<String>,
    #[serde(default)]
    pub engine_perf_args: Vec<String>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_builder(
            Config::builder()
                // Config file (optional)
                .add_source(File::with_name("updaterd").required(false))
                // Environment variables (e.g. UPDATERD_SERVER_PORT=8080)
                .add_source(
                    Environment::with_prefix("UPDATERD")
                        .try_parsing(true)
                        .list_separator(" ")
                        .with_list_parse_key("engine_args")
                        .with_list_parse_key("engine_perf_args"),
                ),
        )
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        builder
            // Default settings
            .set_default("server_port", 3000)?
            .set_default("data_dir", "./data")?
            .set_default("log_level", "info")?
            .set_default("catalog_refresh_secs", 24 * 3600)?
            .set_default("max_concurrent_downloads", 0)?
            .set_default("auto_delete_updates", false)?
            .set_default("ab_perf_mode", false)?
            .set_default("engine_command", "update_engine_client")?
            .build()?
            .try_deserialize()
    }

    pub fn updates_dir(&self) -> PathBuf {
        self.data_dir.join("updates")
    }

    pub fn preferences_path(&self) -> PathBuf {
        self.data_dir.join("preferences.json")
    }
}
