//! Configuration management for the fleet dispatcher

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use crate::Result;

/// Fleet dispatcher configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP API server configuration
    pub api_server: ApiServerConfig,

    /// Path to data directory (database)
    pub data_dir: PathBuf,

    /// Connection liveness timings
    pub liveness: LivenessConfig,

    /// Command delivery settings
    pub dispatch: DispatchConfig,
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port to listen on
    pub port: u16,

    /// Bearer key for operator and agent routes (from `FLEET_API_KEY` env)
    pub api_key: Option<String>,

    /// Serve without a key (from `FLEET_ALLOW_UNAUTHENTICATED` env); for
    /// local development only
    pub allow_unauthenticated: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            api_key: None,
            allow_unauthenticated: false,
        }
    }
}

/// Liveness monitor and registry timings
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// How often the liveness sweep runs
    pub sweep_interval: Duration,

    /// Idle time after which a transport ping is sent
    pub ping_after: Duration,

    /// Idle time after which an unanswered ping evicts the connection
    pub evict_after: Duration,

    /// Delay before a disconnect is reported as offline
    pub offline_grace: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            ping_after: Duration::from_secs(30),
            evict_after: Duration::from_secs(120),
            offline_grace: Duration::from_secs(30),
        }
    }
}

/// Dispatcher and command-state settings
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Grace period for a sent command to be acknowledged
    pub ack_timeout: Duration,

    /// How often the ack reaper runs
    pub reaper_interval: Duration,

    /// Upper bound on a single connection write
    pub write_timeout: Duration,

    /// Capacity of each priority queue
    pub queue_capacity: usize,

    /// Consecutive malformed frames tolerated before a connection is dropped
    pub max_malformed_frames: u32,

    /// How long finished command states stay queryable
    pub retention: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(15),
            write_timeout: Duration::from_secs(10),
            queue_capacity: 1000,
            max_malformed_frames: 5,
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Read a duration in whole seconds from an environment variable
fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Default data directory: `~/.local/share/fleet/dispatch` on Linux
fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".local/share/fleet/dispatch"),
        |d| d.data_dir().join("fleet").join("dispatch"),
    )
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if the resulting timings are inconsistent
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_file_config(fc)
    }

    /// Build configuration from a parsed file overlay plus the environment
    ///
    /// # Errors
    ///
    /// Returns error if the resulting timings are inconsistent
    pub fn from_file_config(fc: file::DispatchConfigFile) -> Result<Self> {
        let api_server = ApiServerConfig {
            port: std::env::var("FLEET_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .or(fc.server.port)
                .unwrap_or(8080),
            api_key: std::env::var("FLEET_API_KEY").ok().or(fc.server.api_key),
            allow_unauthenticated: std::env::var("FLEET_ALLOW_UNAUTHENTICATED")
                .ok()
                .map(|v| matches!(v.as_str(), "1" | "true"))
                .or(fc.server.allow_unauthenticated)
                .unwrap_or(false),
        };

        let data_dir = std::env::var("FLEET_DATA_DIR")
            .ok()
            .or(fc.server.data_dir)
            .map_or_else(default_data_dir, PathBuf::from);

        let defaults = LivenessConfig::default();
        let liveness = LivenessConfig {
            sweep_interval: fc
                .liveness
                .sweep_interval_secs
                .map_or(defaults.sweep_interval, Duration::from_secs),
            ping_after: env_secs("FLEET_PING_AFTER_SECS")
                .or(fc.liveness.ping_after_secs.map(Duration::from_secs))
                .unwrap_or(defaults.ping_after),
            evict_after: env_secs("FLEET_EVICT_AFTER_SECS")
                .or(fc.liveness.evict_after_secs.map(Duration::from_secs))
                .unwrap_or(defaults.evict_after),
            offline_grace: env_secs("FLEET_OFFLINE_GRACE_SECS")
                .or(fc.liveness.offline_grace_secs.map(Duration::from_secs))
                .unwrap_or(defaults.offline_grace),
        };

        let defaults = DispatchConfig::default();
        let dispatch = DispatchConfig {
            ack_timeout: env_secs("FLEET_ACK_TIMEOUT_SECS")
                .or(fc.dispatch.ack_timeout_secs.map(Duration::from_secs))
                .unwrap_or(defaults.ack_timeout),
            reaper_interval: fc
                .dispatch
                .reaper_interval_secs
                .map_or(defaults.reaper_interval, Duration::from_secs),
            write_timeout: env_secs("FLEET_WRITE_TIMEOUT_SECS")
                .or(fc.dispatch.write_timeout_secs.map(Duration::from_secs))
                .unwrap_or(defaults.write_timeout),
            queue_capacity: fc.dispatch.queue_capacity.unwrap_or(defaults.queue_capacity),
            max_malformed_frames: fc
                .dispatch
                .max_malformed_frames
                .unwrap_or(defaults.max_malformed_frames),
            retention: fc
                .dispatch
                .retention_secs
                .map_or(defaults.retention, Duration::from_secs),
        };

        let config = Self {
            api_server,
            data_dir,
            liveness,
            dispatch,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that timings are usable
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first inconsistency
    pub fn validate(&self) -> Result<()> {
        if self.liveness.sweep_interval.is_zero() || self.dispatch.reaper_interval.is_zero() {
            return Err(crate::Error::Config(
                "sweep and reaper intervals must be non-zero".to_string(),
            ));
        }
        if self.liveness.evict_after <= self.liveness.ping_after {
            return Err(crate::Error::Config(format!(
                "evict_after ({:?}) must exceed ping_after ({:?})",
                self.liveness.evict_after, self.liveness.ping_after
            )));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(crate::Error::Config(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Path to the SQLite database file
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("fleet.db")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_server: ApiServerConfig::default(),
            data_dir: default_data_dir(),
            liveness: LivenessConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.liveness.evict_after, Duration::from_secs(120));
        assert_eq!(config.dispatch.ack_timeout, Duration::from_secs(60));
    }

    #[test]
    fn evict_must_exceed_ping() {
        let mut config = Config::default();
        config.liveness.evict_after = Duration::from_secs(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_overlay_applies() {
        let fc: file::DispatchConfigFile = toml::from_str(
            r#"
            [dispatch]
            queue_capacity = 16
            max_malformed_frames = 2
            "#,
        )
        .unwrap();
        let config = Config::from_file_config(fc).unwrap();
        assert_eq!(config.dispatch.queue_capacity, 16);
        assert_eq!(config.dispatch.max_malformed_frames, 2);
    }
}
