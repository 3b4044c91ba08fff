//! Installs the `log` backend.

use std::fs::OpenOptions;

use env_logger::{Builder, Env, Target};

use crate::config::ServerConfig;
use crate::error::ServerError;

/// Sets up `env_logger` with the configured level as the default filter.
/// `RUST_LOG` still takes precedence. Records go to `log_file` when set,
/// otherwise to stderr.
pub fn init(config: &ServerConfig) -> Result<(), ServerError> {
    let mut builder = Builder::from_env(Env::default().default_filter_or(config.log_level.as_str()));

    if let Some(path) = &config.log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ServerError::Logging(format!("cannot open {}: {}", path.display(), e)))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder
        .try_init()
        .map_err(|e| ServerError::Logging(e.to_string()))
}
