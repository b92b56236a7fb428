//! Piezo buzzer on the hardware PWM, v1 boards.
//!
//! Exports `pwmchip0/pwm0` at roughly 2068 Hz with a 50% duty cycle and
//! shapes beeps by toggling the enable file. Depending on CPU load the
//! transistor driving the piezo drifts into its active region from PWM line
//! noise while idle and heats up; a 10 ms re-pulse every five minutes keeps
//! it discharged.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const PWM_BASE: &str = "/sys/class/pwm/pwmchip0";
const PORT: &str = "pwm0";

/// 2068 Hz.
const PERIOD_NS: &str = "483558";
/// 50% duty.
const DUTY_NS: &str = "241779";

const BEEP: Duration = Duration::from_millis(150);
const DENOISE_INTERVAL: Duration = Duration::from_secs(300);
const DENOISE_PULSE: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum BuzzerError {
    #[error("pwm sysfs write failed: {0}")]
    Io(#[from] io::Error),
}

struct PwmState {
    exported: bool,
    last_beep: Instant,
}

/// The PWM buzzer; all access is serialized behind one mutex.
#[derive(Clone)]
pub struct Buzzer {
    state: Arc<Mutex<PwmState>>,
}

impl Buzzer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PwmState {
                exported: false,
                last_beep: Instant::now(),
            })),
        }
    }

    /// Export and configure the PWM channel.
    pub async fn setup(&self) -> Result<(), BuzzerError> {
        let mut st = self.state.lock().await;
        ensure_exported(&mut st)?;
        denoise(&mut st).await;
        Ok(())
    }

    /// Short chirp on power-up, a third of the normal beep.
    pub async fn startup_beep(&self) -> Result<(), BuzzerError> {
        let mut st = self.state.lock().await;
        ensure_exported(&mut st)?;
        pulse(&mut st, BEEP / 3).await;
        Ok(())
    }

    pub async fn success_beep(&self) -> Result<(), BuzzerError> {
        let mut st = self.state.lock().await;
        ensure_exported(&mut st)?;
        pulse(&mut st, BEEP).await;
        Ok(())
    }

    /// Four short pulses.
    pub async fn fail_beep(&self) -> Result<(), BuzzerError> {
        let mut st = self.state.lock().await;
        ensure_exported(&mut st)?;
        for _ in 0..4 {
            pulse(&mut st, BEEP / 2).await;
            tokio::time::sleep(BEEP / 2).await;
        }
        Ok(())
    }

    /// Background de-noiser; see the module docs.
    pub fn spawn_denoiser(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(DENOISE_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = tick.tick() => {}
                }

                let mut st = state.lock().await;
                if !st.exported || st.last_beep.elapsed() < DENOISE_INTERVAL {
                    continue;
                }
                denoise(&mut st).await;
            }
        })
    }
}

impl Default for Buzzer {
    fn default() -> Self {
        Self::new()
    }
}

async fn pulse(st: &mut PwmState, duration: Duration) {
    enable(st);
    tokio::time::sleep(duration).await;
    disable(st);
    st.last_beep = Instant::now();
}

async fn denoise(st: &mut PwmState) {
    enable(st);
    tokio::time::sleep(DENOISE_PULSE).await;
    disable(st);
    st.last_beep = Instant::now();
}

fn ensure_exported(st: &mut PwmState) -> Result<(), BuzzerError> {
    if !st.exported {
        if Path::new(PWM_BASE).join(PORT).exists() {
            st.exported = true;
        } else {
            write(&format!("{PWM_BASE}/export"), "0")?;
            st.exported = true;
        }

        write(&format!("{PWM_BASE}/{PORT}/period"), PERIOD_NS)?;
        write(&format!("{PWM_BASE}/{PORT}/duty_cycle"), DUTY_NS)?;
        write(&format!("{PWM_BASE}/{PORT}/polarity"), "normal")?;
    }
    Ok(())
}

fn unexport(st: &mut PwmState) {
    let _ = write(&format!("{PWM_BASE}/unexport"), "0");
    st.exported = false;
}

fn enable(st: &mut PwmState) {
    if !st.exported {
        return;
    }
    if let Err(e) = write(&format!("{PWM_BASE}/{PORT}/enable"), "1") {
        warn!(error = %e, "pwm enable failed, unexporting");
        unexport(st);
    }
}

fn disable(st: &mut PwmState) {
    if !st.exported {
        return;
    }
    if let Err(e) = write(&format!("{PWM_BASE}/{PORT}/enable"), "0") {
        debug!(error = %e, "pwm disable failed, unexporting");
        unexport(st);
    }
}

fn write(path: &str, value: &str) -> io::Result<()> {
    std::fs::write(path, value)
}
