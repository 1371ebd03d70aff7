//! CLI argument parsing and the final configuration-layering step (spec §6
//! "Configuration": defaults -> file (TOML) -> environment -> CLI flags).
//!
//! The first three layers are handled by [`bridge_core::BridgeConfig::load`];
//! this module owns the CLI layer, since `clap`'s derive macro needs to live
//! in the binary crate.

use std::path::PathBuf;

use bridge_core::BridgeConfig;
use clap::Parser;

/// Govee ArtNet/sACN bridge — headless daemon.
#[derive(Parser, Debug)]
#[command(name = "govee-artnet-bridged")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "GOVEE_BRIDGE_LOG_LEVEL")]
    pub log_level: log::LevelFilter,

    /// Path to the SQLite database file (overrides config file/env).
    #[arg(long, env = "GOVEE_BRIDGE_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// ArtNet UDP port (overrides config file/env).
    #[arg(long)]
    pub artnet_port: Option<u16>,

    /// sACN UDP port (overrides config file/env).
    #[arg(long)]
    pub sacn_port: Option<u16>,

    /// Apply schema migrations then exit, without starting any subsystem.
    #[arg(long)]
    pub migrate_only: bool,

    /// Run in dry-run mode: transports are skipped, sends are logged and
    /// treated as success.
    #[arg(long)]
    pub dry_run: bool,
}

impl Args {
    /// Loads the layered [`BridgeConfig`] (defaults -> file -> env), then
    /// applies this process's CLI overrides as the final layer.
    pub fn load_config(&self) -> Result<BridgeConfig, bridge_core::BridgeError> {
        let mut config = BridgeConfig::load(self.config.as_deref())?;

        if let Some(ref db_path) = self.db_path {
            config.db_path = db_path.clone();
        }
        if let Some(port) = self.artnet_port {
            config.artnet_port = port;
        }
        if let Some(port) = self.sacn_port {
            config.sacn_port = port;
        }
        if self.migrate_only {
            config.migrate_only = true;
        }
        if self.dry_run {
            config.dry_run = true;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_apply_on_top_of_defaults() {
        let args = Args {
            config: None,
            log_level: log::LevelFilter::Info,
            db_path: Some(PathBuf::from("/tmp/override.db")),
            artnet_port: Some(7000),
            sacn_port: None,
            migrate_only: false,
            dry_run: true,
        };
        let config = args.load_config().unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/override.db"));
        assert_eq!(config.artnet_port, 7000);
        assert_eq!(config.sacn_port, 5568);
        assert!(config.dry_run);
    }
}
