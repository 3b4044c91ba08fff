use serde::Deserialize;
use std::convert::TryFrom;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::request::Limits;

/// How workers are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// One forked process per worker.
    Process,
    /// One thread per worker inside the supervisor process.
    Thread,
}

/// Process-level settings for the server.
///
/// The site itself (ports, rules, handler) is described by the sitefile;
/// this struct only carries what the process needs to run it. Values come
/// from an optional `hearth` config file and environment variables with the
/// "HEARTH_" prefix.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Path of the sitefile. Defaults to "sitefile".
    #[serde(default = "default_sitefile")]
    pub sitefile: PathBuf,
    /// Address every declared port is bound on. Defaults to "0.0.0.0".
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Total process count including the supervisor. Defaults to CPU count + 1.
    #[serde(default = "default_processes")]
    pub processes: usize,
    /// Listen backlog per port. Defaults to 100.
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_worker_mode")]
    pub worker_mode: WorkerMode,
    /// Log filter used when RUST_LOG is unset. Defaults to "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Append log records to this file instead of stderr.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Unprivileged user to switch to once ports are bound.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pidfile: Option<PathBuf>,
    /// Longest accepted request or header line. Defaults to 8kb.
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Largest accepted request body. Defaults to 8mb.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

/// Implements conversion from the config crate's Config type to ServerConfig.
impl TryFrom<config::Config> for ServerConfig {
    type Error = config::ConfigError;

    fn try_from(config: config::Config) -> Result<Self, Self::Error> {
        config.try_deserialize()
    }
}

impl ServerConfig {
    /// Creates a new ServerConfig instance from environment variables and config file.
    ///
    /// This method will:
    /// 1. Load environment variables from a .env file if present
    /// 2. Load configuration from a "hearth" file (if it exists)
    /// 3. Override with environment variables prefixed with "HEARTH_"
    ///
    /// # Errors
    /// Returns a ConfigError if configuration loading or parsing fails.
    pub fn new() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("hearth").required(false))
            .add_source(config::Environment::with_prefix("HEARTH"));

        builder.build()?.try_into()
    }

    /// Number of worker slots: one per process besides the supervisor.
    pub fn workers(&self) -> usize {
        self.processes.saturating_sub(1).max(1)
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_line_length: self.max_line_length,
            max_body_size: self.max_body_size,
        }
    }
}

fn default_sitefile() -> PathBuf {
    PathBuf::from("sitefile")
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_processes() -> usize {
    num_cpus::get() + 1
}

fn default_backlog() -> u32 {
    100
}

fn default_worker_mode() -> WorkerMode {
    WorkerMode::Process
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_line_length() -> usize {
    8 * 1024
}

fn default_max_body_size() -> usize {
    8 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sitefile: default_sitefile(),
            host: default_host(),
            processes: default_processes(),
            backlog: default_backlog(),
            worker_mode: default_worker_mode(),
            log_level: default_log_level(),
            log_file: None,
            user: None,
            pidfile: None,
            max_line_length: default_max_line_length(),
            max_body_size: default_max_body_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    /// Tests that the default configuration values are set correctly.
    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.processes, num_cpus::get() + 1);
        assert_eq!(config.workers(), num_cpus::get());
        assert_eq!(config.backlog, 100);
        assert_eq!(config.sitefile, PathBuf::from("sitefile"));
        assert_eq!(config.worker_mode, WorkerMode::Process);
        assert_eq!(config.limits().max_line_length, 8192);
    }

    /// A single process still gets one worker.
    #[test]
    fn test_workers_minimum() {
        let config = ServerConfig {
            processes: 1,
            ..ServerConfig::default()
        };
        assert_eq!(config.workers(), 1);
    }

    /// Tests configuration loading from environment variables with the
    /// "HEARTH_" prefix.
    #[test]
    fn test_config_from_env() {
        env::set_var("HEARTH_PROCESSES", "3");
        env::set_var("HEARTH_BACKLOG", "16");
        env::set_var("HEARTH_WORKER_MODE", "thread");
        env::set_var("HEARTH_SITEFILE", "/etc/hearth/site");

        let config = ServerConfig::new().unwrap();
        assert_eq!(config.processes, 3);
        assert_eq!(config.workers(), 2);
        assert_eq!(config.backlog, 16);
        assert_eq!(config.worker_mode, WorkerMode::Thread);
        assert_eq!(config.sitefile, PathBuf::from("/etc/hearth/site"));

        env::remove_var("HEARTH_PROCESSES");
        env::remove_var("HEARTH_BACKLOG");
        env::remove_var("HEARTH_WORKER_MODE");
        env::remove_var("HEARTH_SITEFILE");
    }
}
