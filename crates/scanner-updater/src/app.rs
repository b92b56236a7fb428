//! The update daemon's main loop.
//!
//! Every five minutes: if our own restart signal is present, exit cleanly
//! and let the init system bring up the new version; otherwise check each
//! managed binary with five seconds of spacing, then make sure the scanner
//! service is not wedged in systemd's start-limit state.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use scanner_core::config::Config;
use scanner_core::files;
use scanner_core::update::Binary;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const UPDATE_INTERVAL: Duration = Duration::from_secs(5 * 60);
const CHECK_SPACING: Duration = Duration::from_secs(5);

pub struct Updater {
    cancel: CancellationToken,
    binaries: Vec<Binary>,
    self_name: String,
}

impl Updater {
    /// All managed binaries live in the updater's own directory.
    pub fn new(
        cancel: CancellationToken,
        cfg: &Config,
        names: &[&str],
    ) -> anyhow::Result<Self> {
        let self_path = std::env::current_exe().context("cannot locate own executable")?;
        let base_dir: PathBuf = self_path
            .parent()
            .context("executable has no parent directory")?
            .to_owned();
        let self_name = self_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut binaries = Vec::with_capacity(names.len());
        for name in names {
            let path = base_dir.join(name);
            if !files::exists(&path) {
                bail!("could not find {name} at {}", path.display());
            }
            let binary = Binary::new(&path, cfg)
                .with_context(|| format!("could not create updater for {name}"))?;
            if *name == self_name {
                // we are the new version now, eat our own restart signal
                binary.cleanup();
            }
            binaries.push(binary);
        }

        trace!(?names, "updaters set up");
        Ok(Self {
            cancel,
            binaries,
            self_name,
        })
    }

    pub async fn run(&self) {
        let mut tick = tokio::time::interval(UPDATE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                _ = tick.tick() => {}
            }

            if self.should_restart() {
                info!("updater restarting cleanly because of update");
                self.cancel.cancel();
                return;
            }

            trace!("checking for updates");
            self.check_binaries().await;
            self.check_service().await;
        }
    }

    async fn check_binaries(&self) {
        for binary in &self.binaries {
            if let Err(e) = binary.check().await {
                warn!(binary = %binary.name, error = %e, "update check failed");
            }
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(CHECK_SPACING) => {}
            }
        }
    }

    fn should_restart(&self) -> bool {
        self.binaries
            .iter()
            .find(|b| b.name == self.self_name)
            .is_some_and(Binary::should_restart)
    }

    /// A scanner that crash-looped into systemd's start limit stays down
    /// until somebody clears the failed state; be that somebody.
    async fn check_service(&self) {
        let running = match Command::new("pidof").arg("barcode-scanner").output().await {
            Ok(out) => out.status.success() && !out.stdout.is_empty(),
            Err(e) => {
                warn!(error = %e, "pidof barcode-scanner failed");
                return;
            }
        };
        if running {
            return;
        }

        match Command::new("systemctl").arg("reset-failed").output().await {
            Ok(out) if out.status.success() => {
                info!("barcode-scanner was not running, systemctl reset-failed");
            }
            Ok(out) => {
                warn!(status = %out.status, "systemctl reset-failed failed");
            }
            Err(e) => {
                warn!(error = %e, "systemctl reset-failed failed");
            }
        }
    }
}

pub fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut int), Ok(mut term), Ok(mut hup)) = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
        ) else {
            debug!("could not install signal handlers");
            return;
        };

        tokio::select! {
            _ = int.recv() => {}
            _ = term.recv() => {}
            _ = hup.recv() => {}
        }
        warn!("caught signal, exiting");
        cancel.cancel();
    });
}
