//! Periodic device vitals, shipped through the notifier.
//!
//! One line every five minutes: CPU temperature, load averages, process
//! count, free memory, free root filesystem, uptime. Fresh kernel ring
//! buffer output goes along as a zipped attachment so driver trouble shows
//! up without anyone ssh-ing in.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{trace, warn};

use crate::files;
use crate::telegram::Bot;

const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("reading {0}: {1}")]
    Read(&'static str, #[source] std::io::Error),

    #[error("unparsable temperature reading {0:?}")]
    BadTemp(String),

    #[error("sysinfo failed: {0}")]
    Sysinfo(#[source] nix::Error),

    #[error("statvfs failed: {0}")]
    Statvfs(#[source] nix::Error),
}

/// A single sample of everything we report.
#[derive(Debug, Clone, PartialEq)]
pub struct Vitals {
    pub temp_c: f64,
    pub load: (f64, f64, f64),
    pub proc_count: u64,
    pub free_ram_pct: f64,
    pub free_swap_pct: f64,
    pub free_root_pct: f64,
    pub uptime: Duration,
}

pub struct Reporter {
    bot: Arc<Bot>,
}

impl Reporter {
    pub fn new(bot: Arc<Bot>) -> Self {
        Self { bot }
    }

    /// One reporting pass; failures are logged, never propagated.
    pub async fn check(&self) {
        match collect_vitals() {
            Ok(v) => {
                if let Err(e) = self.bot.send(&format_vitals(&v), true).await {
                    warn!(error = %e, "sending vitals failed");
                }
            }
            Err(e) => warn!(error = %e, "collecting vitals failed"),
        }

        self.ship_dmesg().await;
    }

    /// Drain the kernel ring buffer and ship anything new.
    async fn ship_dmesg(&self) {
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
            trace!("dmesg output was empty");
            return;
        }

        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let inner = format!("{stamp}_dmesg.txt");
        let archive = match files::zip_bytes(&out, &inner) {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "zipping dmesg failed");
                return;
            }
        };

        if let Err(e) = self.bot.send_file(archive, &format!("{inner}.zip"), true).await {
            warn!(error = %e, "sending dmesg archive failed");
        }
    }
}

fn collect_vitals() -> Result<Vitals, StatusError> {
    let raw = std::fs::read_to_string(THERMAL_ZONE)
        .map_err(|e| StatusError::Read(THERMAL_ZONE, e))?;
    let temp_c = parse_millidegrees(&raw)?;

    let si = nix::sys::sysinfo::sysinfo().map_err(StatusError::Sysinfo)?;
    let free_ram_pct = percentage(si.ram_unused(), si.ram_total());
    let free_swap_pct = percentage(si.swap_free(), si.swap_total());

    let fs = nix::sys::statvfs::statvfs("/").map_err(StatusError::Statvfs)?;
    let free_root_pct = percentage(fs.blocks_free(), fs.blocks());

    Ok(Vitals {
        temp_c,
        load: si.load_average(),
        proc_count: u64::from(si.process_count()),
        free_ram_pct,
        free_swap_pct,
        free_root_pct,
        uptime: si.uptime(),
    })
}

/// `/sys/class/thermal` reports millidegrees: `43802` means 43.802 °C.
fn parse_millidegrees(raw: &str) -> Result<f64, StatusError> {
    raw.trim()
        .parse::<i64>()
        .map(|md| md as f64 / 1000.0)
        .map_err(|_| StatusError::BadTemp(raw.trim().to_owned()))
}

fn percentage<T: Into<u64>>(part: T, whole: T) -> f64 {
    let whole = whole.into();
    if whole == 0 {
        return 0.0;
    }
    (part.into() as f64 / whole as f64) * 100.0
}

fn format_vitals(v: &Vitals) -> String {
    format!(
        "[{:.1}°C | CPU: {:.1} {:.1} {:.1} | Proc: {} | Free: {:.1}%(ram) {:.1}%(swap) {:.1}%(/) | Up: {}]",
        v.temp_c,
        v.load.0,
        v.load.1,
        v.load.2,
        v.proc_count,
        v.free_ram_pct,
        v.free_swap_pct,
        v.free_root_pct,
        format_uptime(v.uptime),
    )
}

fn format_uptime(d: Duration) -> String {
    let secs = d.as_secs();
    let (days, rest) = (secs / 86_400, secs % 86_400);
    let (hours, rest) = (rest / 3_600, rest % 3_600);
    let mins = rest / 60;

    if days > 0 {
        format!("{days}d{hours}h{mins}m")
    } else if hours > 0 {
        format!("{hours}h{mins}m")
    } else {
        format!("{mins}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millidegrees_parse() {
        assert_eq!(parse_millidegrees("43802\n").unwrap(), 43.802);
        assert!(parse_millidegrees("warm").is_err());
    }

    #[test]
    fn vitals_line_format() {
        let v = Vitals {
            temp_c: 43.802,
            load: (0.11, 0.25, 0.33),
            proc_count: 87,
            free_ram_pct: 51.234,
            free_swap_pct: 99.0,
            free_root_pct: 38.4,
            uptime: Duration::from_secs(3 * 3600 + 2 * 60),
        };
        assert_eq!(
            format_vitals(&v),
            "[43.8°C | CPU: 0.1 0.2 0.3 | Proc: 87 | Free: 51.2%(ram) 99.0%(swap) 38.4%(/) | Up: 3h2m]"
        );
    }

    #[test]
    fn uptime_shapes() {
        assert_eq!(format_uptime(Duration::from_secs(59)), "0m");
        assert_eq!(format_uptime(Duration::from_secs(61 * 60)), "1h1m");
        assert_eq!(format_uptime(Duration::from_secs(90 * 3600)), "3d18h0m");
    }

    #[test]
    fn percentage_handles_zero_whole() {
        assert_eq!(percentage(0u64, 0u64), 0.0);
        assert_eq!(percentage(1u64, 2u64), 50.0);
    }
}
