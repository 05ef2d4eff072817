//! Logger setup.
//!
//! Stdout carries the protocol when the client talks over stdio, so log records go to
//! stderr or to a file. `RUST_LOG` keeps working, an explicit level overrides it.

use env_logger::{Builder, Target};
use log::LevelFilter;
use std::fs::OpenOptions;
use std::path::Path;

/// Where log records go.
#[derive(Debug, Clone, Default)]
pub struct LogConfig<'a> {
    pub file: Option<&'a Path>,
    pub level: Option<LevelFilter>,
}

fn builder(config: &LogConfig) -> std::io::Result<Builder> {
    let mut builder = Builder::from_default_env();
    if let Some(level) = config.level {
        builder.filter_level(level);
    }
    builder.format_timestamp_millis();
    match config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.target(Target::Pipe(Box::new(file)));
        }
        None => {
            builder.target(Target::Stderr);
        }
    }
    Ok(builder)
}

/// Install the global logger, only the first call has an effect.
pub fn init(config: &LogConfig) -> std::io::Result<()> {
    let mut builder = builder(config)?;
    if builder.try_init().is_err() {
        log::debug!(target: "adapter", "logger already installed");
    }
    Ok(())
}
