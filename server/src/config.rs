//! Startup configuration: a typed view of the TOML file the server is
//! pointed at.

use serde::Deserialize;
use std::{env, fs};

#[derive(Clone, Deserialize)]
pub struct EnvironmentConfig {
    pub dev_mode: bool,
    pub database_path: String,
    pub bind: String,
    /// Where the debug log file goes.
    pub log_file: String,
    /// TOML table of handshake tokens. Optional in dev mode, where the
    /// legacy `userId` handshake is accepted instead.
    #[serde(default)]
    pub trusted_tokens_file: Option<String>,
}

/// Picks the config file from the first command line argument, falling back
/// to `dev-config.toml` when none is given, and parses it into an
/// `EnvironmentConfig`. A server without valid configuration cannot do
/// anything useful, so any failure here ends the process.
pub fn load_config() -> EnvironmentConfig {
    match load_config_inner() {
        Ok(config) => config,
        Err(err) => {
            // The logger is only set up after the config is read, so this
            // goes straight to stdout.
            println!("Error loading config: {err}");
            std::process::exit(1);
        }
    }
}

/// Fallible part of the loading, so every failure funnels into one exit
/// path above.
fn load_config_inner() -> Result<EnvironmentConfig, String> {
    let args: Vec<String> = env::args().collect();

    let config_filename = match args.len() {
        1 => "dev-config.toml".to_string(),
        2 => args[1].clone(),
        _ => {
            return Err(format!("Usage: {} [config_file]", args[0]));
        }
    };

    let config_file = fs::read_to_string(&config_filename)
        .map_err(|_| format!("Could not read config file at path: {config_filename}"))?;

    let config: EnvironmentConfig = toml::from_str(&config_file).map_err(|e| {
        format!(
            "Could not parse config file at path: {}\nCaused by: {:?}",
            config_filename, e
        )
    })?;

    if !config.dev_mode && config.trusted_tokens_file.is_none() {
        return Err("A production config needs a trusted_tokens_file".to_owned());
    }

    Ok(config)
}
