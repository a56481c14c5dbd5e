use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::logging::LogLevel;
use crate::Result;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Minimum level of query log events the receiver emits.
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default = "default_module_tag")]
    pub module_tag: bool,
    #[serde(default)]
    pub from_context: bool,
    #[serde(default)]
    pub fields_key: Option<String>,
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Config {
    /// Loads `path`, then applies `PG_COPY_OUT_*` environment overrides
    /// (`PG_COPY_OUT_LOGGING__LEVEL=debug`).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_COPY_OUT")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            module_tag: default_module_tag(),
            from_context: false,
            fields_key: None,
            json: false,
            filter: default_filter(),
        }
    }
}

fn default_read_buffer_size() -> usize {
    8192
}

fn default_module_tag() -> bool {
    true
}

fn default_filter() -> String {
    "pg_copy_out=info,warn".to_string()
}
