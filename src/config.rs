//! Engine settings, read from an optional file and `CONTINUUM_*` environment
//! variables on top of the defaults.

use std::path::Path;

// config lets you read a separate config file
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Drive engine time from the wall clock on a background thread.
    pub internal_timer: bool,
    pub timer_resolution_ms: u64,
    /// Engine time at construction, when the internal timer is off.
    pub start_time_ms: i64,
    /// Include the offending event in fault warnings.
    pub log_fault_events: bool,
    /// Start events beyond this many live partitions of one context are ignored.
    pub max_partitions_per_context: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            internal_timer: false,
            timer_resolution_ms: 100,
            start_time_ms: 0,
            log_fault_events: true,
            max_partitions_per_context: None,
        }
    }
}

impl EngineConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings = builder
            .add_source(Environment::with_prefix("CONTINUUM").try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("continuum-config-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "timer_resolution_ms = 5\nmax_partitions_per_context = 3").unwrap();
        let config = EngineConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.timer_resolution_ms, 5);
        assert_eq!(config.max_partitions_per_context, Some(3));
        assert!(!config.internal_timer);
    }
}
