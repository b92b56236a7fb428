//! Post-crash triage.
//!
//! The init system invokes us with `EXIT_CODE`, `EXIT_STATUS` and
//! `SERVICE_RESULT` in the environment. We first ship whatever diagnostics
//! accumulated (logs, captured stderr, the kernel ring buffer), and only
//! then decide: a clean exit needs nothing more, a crash blacklists the
//! current binary hash and rolls back to the backup. A crashing update thus
//! gets exactly one chance to explain itself before the device self-heals.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use scanner_core::config::Config;
use scanner_core::telegram::Bot;
use scanner_core::update::{self, Binary};
use scanner_core::{files, gpio};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// What systemd tells us about the dead unit.
#[derive(Debug, Clone, Default)]
pub struct ExitInfo {
    pub exit_code: String,
    pub exit_status: String,
    pub service_result: String,
}

pub fn exit_info_from_env() -> ExitInfo {
    ExitInfo {
        exit_code: std::env::var("EXIT_CODE").unwrap_or_default(),
        exit_status: std::env::var("EXIT_STATUS").unwrap_or_default(),
        service_result: std::env::var("SERVICE_RESULT").unwrap_or_default(),
    }
}

/// An update-triggered or operator-requested exit needs no rollback.
pub fn is_clean_exit(info: &ExitInfo) -> bool {
    info.exit_status == "0" && info.service_result == "success"
}

pub struct Checker {
    cfg: Config,
    bot: Arc<Bot>,
    binary: String,
}

impl Checker {
    pub fn new(cfg: Config, bot: Arc<Bot>, binary: String) -> Self {
        Self { cfg, bot, binary }
    }

    /// Ship and truncate `<state>/<bin>.log` and `<bindir>/<bin>.output`
    /// for each named binary. Empty or missing files are skipped.
    pub async fn ship_logs(&self, binaries: &[&str]) {
        let bin_dir = binary_dir();

        for bin in binaries {
            let log = self.cfg.state_path.join(format!("{bin}.log"));
            self.ship_and_truncate(&log, &stamped_name(bin, "log")).await;

            if let Some(dir) = &bin_dir {
                let output = dir.join(format!("{bin}.output"));
                self.ship_and_truncate(&output, &stamped_name(bin, "out"))
                    .await;
            }
        }
    }

    /// Dump the kernel ring buffer and ship it, clearing it in the process.
    pub async fn ship_dmesg(&self) {
        let out = match Command::new("dmesg").args(["-e", "-c"]).output().await {
            Ok(out) if out.status.success() => out.stdout,
            Ok(out) => {
                warn!(status = %out.status, "dmesg -e -c failed");
                return;
            }
            Err(e) => {
                warn!(error = %e, "dmesg -e -c failed");
                return;
            }
        };
        if out.is_empty() {
            debug!("dmesg output was empty");
            return;
        }

        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let inner = format!("{stamp}_dmesg.txt");
        match files::zip_bytes(&out, &inner) {
            Ok(archive) => {
                if let Err(e) = self
                    .bot
                    .send_file(archive, &format!("{inner}.zip"), true)
                    .await
                {
                    warn!(error = %e, "sending dmesg archive failed");
                }
            }
            Err(e) => warn!(error = %e, "zipping dmesg failed"),
        }
    }

    /// The blacklist-and-restore decision.
    pub async fn handle_service_error(&self, info: &ExitInfo) {
        info!(
            binary = %self.binary,
            code = %info.exit_code,
            status = %info.exit_status,
            result = %info.service_result,
            "unit exited"
        );

        if self.binary == "barcode-scanner" && self.cfg.hardware_version >= 2 {
            // leave the fail-safe LED burning until the scanner recovers
            if let Err(e) = gpio::force_red_on() {
                warn!(error = %e, "could not force the red led on");
            }
        }

        if is_clean_exit(info) {
            debug!(binary = %self.binary, "clean exit, nothing to do");
            return;
        }

        let Some(bin_dir) = binary_dir() else {
            warn!("cannot locate binary directory, skipping rollback");
            return;
        };
        let bin_path = bin_dir.join(&self.binary);

        if let Err(e) = blacklist_and_restore(&bin_path, &self.cfg).await {
            warn!(error = %e, "rollback failed");
            return;
        }
        info!(binary = %self.binary, "blacklisted and restored backup");
    }

    async fn ship_and_truncate(&self, path: &Path, filename: &str) {
        if !files::exists(path) || files::is_empty(path) {
            debug!(path = %path.display(), "log missing or empty, skipping");
            return;
        }
        info!(path = %path.display(), "zipping and shipping log");

        let data = match files::read_all(path) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "could not read log");
                return;
            }
        };
        let archive = match files::zip_bytes(&data, filename.trim_end_matches(".zip")) {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "could not zip log");
                return;
            }
        };
        if let Err(e) = self.bot.send_file(archive, filename, true).await {
            warn!(error = %e, "sending log failed");
            return;
        }

        if let Err(e) = std::fs::File::create(path) {
            warn!(error = %e, "truncating shipped log failed");
        }
    }
}

/// Blacklist the current (crashing) hash, then roll back to `<bin>.bkup`.
pub async fn blacklist_and_restore(bin_path: &Path, cfg: &Config) -> anyhow::Result<()> {
    update::blacklist_update(bin_path, &cfg.state_path)?;
    let binary = Binary::new(bin_path, cfg)?;
    binary.restore_to_backup().await?;
    Ok(())
}

fn binary_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_owned))
}

fn stamped_name(bin: &str, kind: &str) -> String {
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    format!("{bin}_{stamp}.{kind}.zip")
}
