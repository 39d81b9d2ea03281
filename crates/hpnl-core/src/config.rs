//! Service configuration.
//!
//! Every field has a serde default, so an empty TOML document is a valid
//! configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buffer::METADATA_SIZE;

/// Errors produced while loading or validating a [`ServiceConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Configuration of an [`EventQueueService`](crate::EventQueueService).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Worker threads requested by the caller. The service polls from a
    /// single loop thread; the value is validated and logged.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Number of send buffers allocated up front.
    #[serde(default = "default_buffer_num")]
    pub buffer_num: usize,

    /// Size of every send and receive buffer in bytes, header included.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Buffers added to a pool each time it grows.
    #[serde(default = "default_next_batch_size")]
    pub next_batch_size: usize,

    /// Receive pool size as a multiple of `buffer_num`.
    #[serde(default = "default_recv_buffer_multiplier")]
    pub recv_buffer_multiplier: usize,

    /// Receive buffers posted on each new connection.
    #[serde(default = "default_recv_depth")]
    pub recv_depth: usize,

    /// Server services listen and accept; client services connect.
    #[serde(default)]
    pub is_server: bool,

    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    #[serde(default = "default_max_completions_per_poll")]
    pub max_completions_per_poll: usize,
}

fn default_worker_threads() -> usize {
    1
}
fn default_buffer_num() -> usize {
    32
}
fn default_buffer_size() -> usize {
    64 * 1024
}
fn default_next_batch_size() -> usize {
    16
}
fn default_recv_buffer_multiplier() -> usize {
    2
}
fn default_recv_depth() -> usize {
    16
}
fn default_poll_timeout_ms() -> u64 {
    100
}
fn default_max_completions_per_poll() -> usize {
    64
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            buffer_num: default_buffer_num(),
            buffer_size: default_buffer_size(),
            next_batch_size: default_next_batch_size(),
            recv_buffer_multiplier: default_recv_buffer_multiplier(),
            recv_depth: default_recv_depth(),
            is_server: false,
            poll_timeout_ms: default_poll_timeout_ms(),
            max_completions_per_poll: default_max_completions_per_poll(),
        }
    }
}

impl ServiceConfig {
    /// Defaults for a listening service.
    pub fn server() -> Self {
        Self {
            is_server: true,
            ..Self::default()
        }
    }

    /// Defaults for a connecting service.
    pub fn client() -> Self {
        Self::default()
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("worker_threads", self.worker_threads),
            ("buffer_num", self.buffer_num),
            ("next_batch_size", self.next_batch_size),
            ("recv_buffer_multiplier", self.recv_buffer_multiplier),
            ("max_completions_per_poll", self.max_completions_per_poll),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.buffer_size <= METADATA_SIZE {
            return Err(ConfigError::Invalid {
                field: "buffer_size",
                reason: format!("must be larger than the {METADATA_SIZE}-byte header"),
            });
        }
        if self.recv_depth > self.recv_buffer_count() {
            return Err(ConfigError::Invalid {
                field: "recv_depth",
                reason: format!(
                    "cannot exceed the receive pool size of {}",
                    self.recv_buffer_count()
                ),
            });
        }
        if self.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "poll_timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Initial size of the receive pool.
    pub fn recv_buffer_count(&self) -> usize {
        self.buffer_num.saturating_mul(self.recv_buffer_multiplier)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.buffer_num, 32);
        assert_eq!(config.buffer_size, 65536);
        assert_eq!(config.recv_buffer_count(), 64);
        assert!(!config.is_server);
        assert!(ServiceConfig::server().is_server);
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = ServiceConfig::from_toml_str("").unwrap();
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = ServiceConfig::from_toml_str(
            r#"
            is_server = true
            buffer_size = 4096
            next_batch_size = 4
            "#,
        )
        .unwrap();
        assert!(config.is_server);
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.next_batch_size, 4);
        assert_eq!(config.buffer_num, 32);
    }

    #[test]
    fn test_rejects_tiny_buffers() {
        let err = ServiceConfig::from_toml_str("buffer_size = 17").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "buffer_size",
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_zero_counts() {
        let config = ServiceConfig {
            next_batch_size: 0,
            ..ServiceConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "next_batch_size",
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_recv_depth_beyond_pool() {
        let config = ServiceConfig {
            buffer_num: 2,
            recv_depth: 5,
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.toml");
        std::fs::write(&path, "buffer_num = 8\nrecv_depth = 4\n").unwrap();
        let config = ServiceConfig::load(&path).unwrap();
        assert_eq!(config.buffer_num, 8);
        assert!(matches!(
            ServiceConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = ServiceConfig::server();
        let json = serde_json::to_string(&config).unwrap();
        let back: ServiceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
