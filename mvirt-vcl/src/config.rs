//! Session layer configuration.
//!
//! Read once at startup: the JSON file named by `VCL_CONFIG` (if any), then
//! environment overrides. The result is immutable for the lifetime of the
//! context.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::handle::MAX_WORKERS;

/// Environment variable naming the config file.
pub const VCL_CONFIG_ENV: &str = "VCL_CONFIG";

/// Longest accepted namespace id.
pub const MAX_NAMESPACE_ID_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// What a forked child does with the worker it inherited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForkPolicy {
    /// Register a fresh worker and carry the parent's sessions over.
    #[default]
    CloneParent,
    /// Register a fresh, empty worker.
    Discard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VclConfig {
    pub heapsize: u64,
    pub max_workers: u32,
    pub vpp_api_q_length: u32,
    pub segment_baseva: u64,
    pub segment_size: u64,
    pub add_segment_size: u64,
    pub preallocated_fifo_pairs: u32,
    pub rx_fifo_size: u32,
    pub tx_fifo_size: u32,
    pub event_queue_size: u32,
    pub listen_queue_size: u32,
    pub app_scope_local: bool,
    pub app_scope_global: bool,
    pub app_proxy_transport_tcp: bool,
    pub app_proxy_transport_udp: bool,
    pub namespace_id: String,
    pub namespace_secret: u64,
    pub use_mq_eventfd: bool,
    /// Seconds to wait for app/worker registration replies.
    pub app_timeout: f64,
    /// Seconds a blocking session call may wait.
    pub session_timeout: f64,
    /// Seconds a blocking accept may wait.
    pub accept_timeout: f64,
    pub event_ring_size: u32,
    pub event_log_path: PathBuf,
    /// 0 = info, 1 = debug, 2+ = trace.
    pub debug: u8,
    pub fork_policy: ForkPolicy,
    pub max_segments: u32,
}

impl Default for VclConfig {
    fn default() -> Self {
        VclConfig {
            heapsize: 256 << 20,
            max_workers: 16,
            vpp_api_q_length: 1024,
            segment_baseva: 0x2_0000_0000,
            segment_size: 256 << 20,
            add_segment_size: 128 << 20,
            preallocated_fifo_pairs: 0,
            rx_fifo_size: 1 << 20,
            tx_fifo_size: 1 << 20,
            event_queue_size: 2048,
            listen_queue_size: 1024,
            app_scope_local: false,
            app_scope_global: false,
            app_proxy_transport_tcp: false,
            app_proxy_transport_udp: false,
            namespace_id: String::new(),
            namespace_secret: 0,
            use_mq_eventfd: true,
            app_timeout: 600.0,
            session_timeout: 600.0,
            accept_timeout: 60.0,
            event_ring_size: 1 << 20,
            event_log_path: PathBuf::from("/dev/shm"),
            debug: 0,
            fork_policy: ForkPolicy::CloneParent,
            max_segments: 256,
        }
    }
}

impl VclConfig {
    /// Load from `VCL_CONFIG` (if set) and the environment, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(VCL_CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `VCL_*` overrides looked up through `get`.
    pub fn apply_env(
        &mut self,
        get: impl Fn(&'static str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = get("VCL_DEBUG") {
            self.debug = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Env {
                    var: "VCL_DEBUG",
                    value,
                })?;
        }
        if let Some(value) = get("VCL_APP_NAMESPACE_ID") {
            self.namespace_id = value;
        }
        if let Some(value) = get("VCL_APP_NAMESPACE_SECRET") {
            self.namespace_secret = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Env {
                    var: "VCL_APP_NAMESPACE_SECRET",
                    value,
                })?;
        }
        // Presence alone enables these
        if get("VCL_APP_SCOPE_LOCAL").is_some() {
            self.app_scope_local = true;
        }
        if get("VCL_APP_SCOPE_GLOBAL").is_some() {
            self.app_scope_global = true;
        }
        if get("VCL_APP_PROXY_TRANSPORT_TCP").is_some() {
            self.app_proxy_transport_tcp = true;
        }
        if get("VCL_APP_PROXY_TRANSPORT_UDP").is_some() {
            self.app_proxy_transport_udp = true;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 || self.max_workers > MAX_WORKERS {
            return Err(ConfigError::Invalid(format!(
                "max_workers must be in 1..={MAX_WORKERS}, got {}",
                self.max_workers
            )));
        }
        if self.namespace_id.len() > MAX_NAMESPACE_ID_LEN {
            return Err(ConfigError::Invalid(format!(
                "namespace_id longer than {MAX_NAMESPACE_ID_LEN} bytes"
            )));
        }
        for (name, secs) in [
            ("app_timeout", self.app_timeout),
            ("session_timeout", self.session_timeout),
            ("accept_timeout", self.accept_timeout),
        ] {
            if !secs.is_finite() || secs < 0.0 {
                return Err(ConfigError::Invalid(format!("{name} must be >= 0")));
            }
        }
        Ok(())
    }

    pub fn app_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.app_timeout)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.session_timeout)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.accept_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = VclConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_workers, 16);
        assert_eq!(config.rx_fifo_size, 1 << 20);
        assert_eq!(config.accept_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_workers": 4, "namespace_id": "blue", "fork_policy": "discard"}}"#
        )
        .unwrap();

        let config = VclConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.namespace_id, "blue");
        assert_eq!(config.fork_policy, ForkPolicy::Discard);
        assert_eq!(config.event_queue_size, 2048);
    }

    #[test]
    fn test_bad_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = VclConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("VCL_DEBUG", "2"),
            ("VCL_APP_NAMESPACE_ID", "red"),
            ("VCL_APP_NAMESPACE_SECRET", "42"),
            ("VCL_APP_SCOPE_LOCAL", ""),
        ]
        .into_iter()
        .collect();

        let mut config = VclConfig::default();
        config
            .apply_env(|var| env.get(var).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.debug, 2);
        assert_eq!(config.namespace_id, "red");
        assert_eq!(config.namespace_secret, 42);
        assert!(config.app_scope_local);
        assert!(!config.app_scope_global);
    }

    #[test]
    fn test_env_bad_number() {
        let mut config = VclConfig::default();
        let err = config
            .apply_env(|var| (var == "VCL_DEBUG").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "VCL_DEBUG", .. }));
    }

    #[test]
    fn test_validate_bounds() {
        let mut config = VclConfig {
            max_workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.max_workers = MAX_WORKERS + 1;
        assert!(config.validate().is_err());
        config.max_workers = MAX_WORKERS;
        config.validate().unwrap();

        config.namespace_id = "x".repeat(MAX_NAMESPACE_ID_LEN + 1);
        assert!(config.validate().is_err());
    }
}
