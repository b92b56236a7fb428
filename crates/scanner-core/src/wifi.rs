//! Wi-Fi provisioning and the reconnect watchdog.
//!
//! Provisioning shells out to NetworkManager: list the active connections,
//! drop everything that is not wired, connect with the stored credentials.
//! The watchdog probes real internet reachability instead of link state,
//! because the access point being up says nothing about the uplink.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::files;
use crate::record::{Record, RecordError, RecordReader, RecordWriter};

/// End-to-end budget for one provisioning pass.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Watchdog cadence.
const PROBE_INTERVAL: Duration = Duration::from_secs(300);
/// Spacing between the confirmation probes of a suspected outage.
const PROBE_RETRY_DELAY: Duration = Duration::from_secs(30);

/// 204-with-no-body endpoint, the de-facto connectivity oracle.
const PROBE_URL: &str = "http://clients3.google.com/generate_204";

#[derive(Debug, Error)]
pub enum WifiError {
    #[error(transparent)]
    File(#[from] crate::files::FileError),

    #[error("running {cmd}: {source}")]
    Spawn {
        cmd: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{cmd} failed: {output}")]
    Command { cmd: &'static str, output: String },

    #[error("wifi setup timed out")]
    Timeout,
}

/// Stored Wi-Fi credentials; the provisioning UI is the only producer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Account {
    pub ssid: String,
    pub pw: String,
}

impl Record for Account {
    fn encode(&self) -> Vec<u8> {
        let mut w = RecordWriter::new();
        w.put_str("SSID", &self.ssid).put_str("PW", &self.pw);
        w.into_bytes()
    }

    fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        let r = RecordReader::parse(bytes)?;
        Ok(Self {
            ssid: r.str("SSID")?.to_owned(),
            pw: r.str("PW")?.to_owned(),
        })
    }
}

fn account_path(state_path: &Path) -> PathBuf {
    state_path.join("WiFiAccount")
}

/// Load the stored account; a missing file yields empty credentials.
pub fn load_account(state_path: &Path) -> Result<Account, WifiError> {
    let path = account_path(state_path);
    if !files::exists(&path) {
        debug!("no stored wifi account, returning empty credentials");
        return Ok(Account::default());
    }
    Ok(files::unserialize(&path)?)
}

/// Persist the account unless it matches what is already stored.
pub fn store_account(state_path: &Path, acc: &Account) -> Result<(), WifiError> {
    let current = load_account(state_path)?;
    if current == *acc {
        return Ok(());
    }

    debug!(ssid = %acc.ssid, "storing wifi account");
    files::serialize(&account_path(state_path), acc)?;
    Ok(())
}

/// Persist the credentials, then try to bring the connection up within the
/// ten-second budget.
pub async fn store_and_try(state_path: &Path, acc: &Account) -> Result<(), WifiError> {
    store_account(state_path, acc)?;

    match tokio::time::timeout(CONNECT_TIMEOUT, connect(acc)).await {
        Err(_) => Err(WifiError::Timeout),
        Ok(r) => r,
    }
}

/// Re-run the provisioning flow from the stored credentials.
pub async fn reconnect(state_path: &Path) -> Result<(), WifiError> {
    let acc = load_account(state_path)?;
    match tokio::time::timeout(CONNECT_TIMEOUT, connect(&acc)).await {
        Err(_) => Err(WifiError::Timeout),
        Ok(r) => r,
    }
}

/// Probe internet reachability.
pub async fn is_connected(http: &reqwest::Client) -> bool {
    http.get(PROBE_URL)
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .is_ok()
}

/// Background watchdog: every five minutes confirm reachability; after
/// three failed probes spaced 30 s apart, re-provision from the stored
/// account. Also makes one connect attempt right away when offline.
pub fn spawn_watchdog(
    cancel: CancellationToken,
    state_path: PathBuf,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let http = reqwest::Client::new();

        if !is_connected(&http).await {
            if let Err(e) = reconnect(&state_path).await {
                debug!(error = %e, "initial wifi connect failed");
            }
        }

        let mut tick = tokio::time::interval(PROBE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = tick.tick() => {}
            }

            // confirm the outage three times to ride out transient drops
            let mut reachable = false;
            for attempt in 0..3 {
                if cancel.is_cancelled() || is_connected(&http).await {
                    reachable = true;
                    break;
                }
                debug!(attempt, "connectivity probe failed");
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(PROBE_RETRY_DELAY) => {}
                }
            }

            if !reachable {
                warn!("no internet connection detected, re-running wifi setup");
                if let Err(e) = reconnect(&state_path).await {
                    warn!(error = %e, "wifi re-provisioning failed");
                }
            }
        }
    })
}

/// Tear down every non-wired connection, then join the configured network.
async fn connect(acc: &Account) -> Result<(), WifiError> {
    delete_connections().await?;

    let out = nmcli(&["device", "wifi", "connect", &acc.ssid, "password", &acc.pw]).await?;
    info!(ssid = %acc.ssid, "nmcli connect finished");
    debug!(output = %String::from_utf8_lossy(&out.stdout), "nmcli output");
    Ok(())
}

async fn delete_connections() -> Result<(), WifiError> {
    let out = nmcli(&["-t", "-c", "no", "--fields", "NAME", "con", "show", "--active"]).await?;

    for name in String::from_utf8_lossy(&out.stdout).lines() {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        if name.contains("Wired") {
            debug!(%name, "keeping wired connection");
            continue;
        }

        debug!(%name, "deleting connection");
        nmcli(&["con", "delete", name]).await?;
    }
    Ok(())
}

async fn nmcli(args: &[&str]) -> Result<Output, WifiError> {
    let out = Command::new("nmcli")
        .args(args)
        .output()
        .await
        .map_err(|source| WifiError::Spawn {
            cmd: "nmcli",
            source,
        })?;

    if !out.status.success() {
        return Err(WifiError::Command {
            cmd: "nmcli",
            output: String::from_utf8_lossy(&out.stderr).into_owned(),
        });
    }
    Ok(out)
}
