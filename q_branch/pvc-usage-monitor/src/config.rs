//! Command line and environment configuration.
//!
//! Every option can be given as a flag or through its environment variable,
//! which is how the DaemonSet manifest passes them (`NODE_NAME` comes from the
//! downward API).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::claims::DEFAULT_PAGE_SIZE;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// PVC usage monitor
#[derive(Parser, Debug, Clone)]
#[command(name = "pvc-usage-monitor")]
#[command(about = "Export requested and used bytes for locally provisioned PVCs")]
#[command(version)]
pub struct Args {
    /// Root directory holding one subdirectory per provisioned volume
    #[arg(long, env = "DEFAULT_PATH")]
    pub default_path: PathBuf,

    /// Seconds between reconcile ticks
    #[arg(long, env = "DELAY_SECONDS", default_value = "30")]
    pub delay_seconds: u64,

    /// Only claims of this storage class are exported
    #[arg(long, env = "STORAGE_CLASS", default_value = "local-path")]
    pub storage_class: String,

    /// Name of the node this instance runs on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Address for the /metrics endpoint
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:2112")]
    pub listen_addr: SocketAddr,

    /// Upper bound in seconds for the volume walk and the claim list (0 disables)
    #[arg(long, env = "SOURCE_TIMEOUT_SECONDS", default_value = "0")]
    pub source_timeout_seconds: u64,

    /// Claims requested per page when listing from the API server
    #[arg(long, env = "LIST_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE)]
    pub list_page_size: u32,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

/// Validated runtime configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub root_path: PathBuf,
    pub interval: Duration,
    pub storage_class: String,
    pub node_name: String,
    pub listen_addr: SocketAddr,
    pub source_timeout: Option<Duration>,
    pub list_page_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("delay must be at least one second")]
    ZeroDelay,

    #[error("list page size must be at least 1")]
    ZeroPageSize,
}

impl Args {
    pub fn into_config(self) -> Result<Config, ConfigError> {
        if self.default_path.as_os_str().is_empty() {
            return Err(ConfigError::Empty("default path"));
        }
        if self.storage_class.trim().is_empty() {
            return Err(ConfigError::Empty("storage class"));
        }
        if self.node_name.trim().is_empty() {
            return Err(ConfigError::Empty("node name"));
        }
        if self.delay_seconds == 0 {
            return Err(ConfigError::ZeroDelay);
        }
        if self.list_page_size == 0 {
            return Err(ConfigError::ZeroPageSize);
        }

        Ok(Config {
            root_path: self.default_path,
            interval: Duration::from_secs(self.delay_seconds),
            storage_class: self.storage_class,
            node_name: self.node_name,
            listen_addr: self.listen_addr,
            source_timeout: (self.source_timeout_seconds > 0)
                .then(|| Duration::from_secs(self.source_timeout_seconds)),
            list_page_size: self.list_page_size,
        })
    }
}
