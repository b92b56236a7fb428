//! Process configuration, resolved from the systemd environment.
//!
//! All three binaries share the same environment file, so they all parse the
//! same set of variables.

use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading /etc/machine-id: {0}")]
    MachineId(#[from] std::io::Error),

    #[error("/etc/machine-id is corrupt: {0:?}")]
    BadMachineId(String),
}

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Directory for persistent state (queue, settings, blacklist, logs).
    #[arg(long, env = "STATE_PATH")]
    pub state_path: PathBuf,

    /// Base URL of the update server.
    #[arg(long, env = "UPDATE_BASEURL")]
    pub update_baseurl: String,

    /// MySQL DSN for the barcode sink.
    #[arg(long, env = "DATABASE_DSN")]
    pub database_dsn: String,

    /// Telegram bot token for the out-of-band channel.
    #[arg(long, env = "TELEGRAM_TOKEN")]
    pub telegram_token: String,

    /// Telegram channel the bot reports into.
    #[arg(long, env = "TELEGRAM_CHANNELID", allow_hyphen_values = true)]
    pub telegram_channel_id: i64,

    /// Board revision; 2 and above drives the GPIO LEDs alongside the beeper.
    #[arg(long, env = "HARDWARE_VERSION", default_value_t = 1)]
    pub hardware_version: i64,
}

/// Read and validate the machine identity, 32 hex chars from
/// `/etc/machine-id`.
pub fn machine_id() -> Result<String, ConfigError> {
    let raw = std::fs::read_to_string("/etc/machine-id")?;
    validate_machine_id(&raw)
}

fn validate_machine_id(raw: &str) -> Result<String, ConfigError> {
    let id = raw.trim();
    if id.len() != 32 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ConfigError::BadMachineId(id.to_owned()));
    }
    Ok(id.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_trims_and_validates() {
        let id = validate_machine_id("0123456789abcdef0123456789abcdef\n").unwrap();
        assert_eq!(id.len(), 32);
    }

    #[test]
    fn machine_id_rejects_garbage() {
        assert!(validate_machine_id("").is_err());
        assert!(validate_machine_id("zz23456789abcdef0123456789abcdef").is_err());
        assert!(validate_machine_id("0123456789abcdef").is_err());
    }
}
