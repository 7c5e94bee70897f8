//! TOML configuration file loading
//!
//! Supports `~/.config/fleet/dispatch/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct DispatchConfigFile {
    /// Server/runtime configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Connection liveness timings
    #[serde(default)]
    pub liveness: LivenessFileConfig,

    /// Command delivery settings
    #[serde(default)]
    pub dispatch: DispatchFileConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// API server port
    pub port: Option<u16>,

    /// Bearer key required on operator and agent routes
    pub api_key: Option<String>,

    /// Serve without a key when none is configured
    pub allow_unauthenticated: Option<bool>,

    /// Directory holding the SQLite database
    pub data_dir: Option<String>,
}

/// Liveness monitor configuration (all values in seconds)
#[derive(Debug, Default, Deserialize)]
pub struct LivenessFileConfig {
    pub sweep_interval_secs: Option<u64>,
    pub ping_after_secs: Option<u64>,
    pub evict_after_secs: Option<u64>,
    pub offline_grace_secs: Option<u64>,
}

/// Dispatcher configuration
#[derive(Debug, Default, Deserialize)]
pub struct DispatchFileConfig {
    pub ack_timeout_secs: Option<u64>,
    pub reaper_interval_secs: Option<u64>,
    pub write_timeout_secs: Option<u64>,
    pub queue_capacity: Option<usize>,
    pub max_malformed_frames: Option<u32>,
    pub retention_secs: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `DispatchConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> DispatchConfigFile {
    let Some(path) = config_file_path() else {
        return DispatchConfigFile::default();
    };
    load_config_file_from(&path)
}

/// Load a TOML config file from an explicit path
pub fn load_config_file_from(path: &Path) -> DispatchConfigFile {
    if !path.exists() {
        return DispatchConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                DispatchConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            DispatchConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/fleet/dispatch/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("fleet")
            .join("dispatch")
            .join("config.toml")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_parses() {
        let fc: DispatchConfigFile = toml::from_str(
            r#"
            [server]
            port = 9000

            [liveness]
            evict_after_secs = 300
            "#,
        )
        .unwrap();

        assert_eq!(fc.server.port, Some(9000));
        assert_eq!(fc.liveness.evict_after_secs, Some(300));
        assert!(fc.liveness.ping_after_secs.is_none());
        assert!(fc.dispatch.queue_capacity.is_none());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let fc = load_config_file_from(Path::new("/nonexistent/fleet/config.toml"));
        assert!(fc.server.port.is_none());
    }
}
