//! Status LEDs and the beeper pin on v2 boards, via sysfs GPIO.
//!
//! Orange Pi PC Plus numbering: (letter position in the alphabet − 1) × 32 +
//! pin. Green means running, blue flashes on success, red on failure.
//!
//! The red LED is the fail-safe: the pin is wired always-on and controlled
//! by flipping its *direction*. Input leaves it lit, output drives it dark,
//! so a crashed process leaves the red LED burning.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

const GPIO_BASE: &str = "/sys/class/gpio";

const BEEPER_PIN: &str = "20";
const GREEN_PIN: &str = "8";
const BLUE_PIN: &str = "9";
const RED_PIN: &str = "10";

const BEEP: Duration = Duration::from_millis(150);
const FLASH: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("gpio sysfs write failed on pin {pin}: {source}")]
    Io {
        pin: &'static str,
        #[source]
        source: io::Error,
    },
}

#[derive(Clone, Copy)]
struct Pin {
    number: &'static str,
}

impl Pin {
    fn export(self) -> Result<(), GpioError> {
        if std::path::Path::new(GPIO_BASE)
            .join(format!("gpio{}", self.number))
            .exists()
        {
            return Ok(());
        }
        self.write(&format!("{GPIO_BASE}/export"), self.number)
    }

    fn direction(self, dir: &str) -> Result<(), GpioError> {
        self.write(&self.path("direction"), dir)
    }

    fn enable(self) -> Result<(), GpioError> {
        self.write(&self.path("value"), "1")
    }

    fn disable(self) {
        let _ = self.write(&self.path("value"), "0");
    }

    fn path(self, file: &str) -> String {
        format!("{GPIO_BASE}/gpio{}/{file}", self.number)
    }

    fn write(self, path: &str, value: &str) -> Result<(), GpioError> {
        std::fs::write(path, value).map_err(|source| GpioError::Io {
            pin: self.number,
            source,
        })
    }
}

const BEEPER: Pin = Pin { number: BEEPER_PIN };
const GREEN: Pin = Pin { number: GREEN_PIN };
const BLUE: Pin = Pin { number: BLUE_PIN };
const RED: Pin = Pin { number: RED_PIN };

/// The v2 feedback hardware.
pub struct Leds {
    // serializes the beeper so overlapping feedback does not interleave
    beep_mu: Mutex<()>,
}

impl Leds {
    pub fn new() -> Self {
        Self {
            beep_mu: Mutex::new(()),
        }
    }

    /// Export and orient every pin. The red pin gets no direction here, it
    /// stays in its power-on (lit) state until [`Leds::red_off`].
    pub fn setup(&self) -> Result<(), GpioError> {
        for pin in [BEEPER, GREEN, BLUE] {
            pin.export()?;
            pin.direction("out")?;
        }
        RED.export()
    }

    pub async fn startup_beep(&self) -> Result<(), GpioError> {
        let _guard = self.beep_mu.lock().await;
        BEEPER.enable()?;
        tokio::time::sleep(BEEP / 3).await;
        BEEPER.disable();
        Ok(())
    }

    /// Success: one long beep and a blue flash, run in parallel; both must
    /// finish before the call returns.
    pub async fn success(&self) -> Result<(), GpioError> {
        let (beep, flash) = tokio::join!(self.success_beep(), self.success_flash());
        beep.and(flash)
    }

    /// Failure: four short pulses and a red flash in parallel.
    pub async fn fail(&self) -> Result<(), GpioError> {
        let (beep, flash) = tokio::join!(self.fail_beep(), self.fail_flash());
        beep.and(flash)
    }

    pub fn green_on(&self) -> Result<(), GpioError> {
        GREEN.enable()
    }

    pub fn green_off(&self) {
        GREEN.disable();
    }

    /// Enabled means direction "in": the always-on wiring lights the LED.
    pub fn red_on(&self) -> Result<(), GpioError> {
        RED.direction("in")
    }

    pub fn red_off(&self) {
        if let Err(e) = RED.direction("out") {
            debug!(error = %e, "could not darken red led");
        }
    }

    async fn success_beep(&self) -> Result<(), GpioError> {
        let _guard = self.beep_mu.lock().await;
        BEEPER.enable()?;
        tokio::time::sleep(BEEP).await;
        BEEPER.disable();
        Ok(())
    }

    async fn fail_beep(&self) -> Result<(), GpioError> {
        let _guard = self.beep_mu.lock().await;
        for _ in 0..4 {
            BEEPER.enable()?;
            tokio::time::sleep(BEEP / 2).await;
            BEEPER.disable();
            tokio::time::sleep(BEEP / 2).await;
        }
        Ok(())
    }

    async fn success_flash(&self) -> Result<(), GpioError> {
        GREEN.disable();
        let r = async {
            BLUE.enable()?;
            tokio::time::sleep(FLASH).await;
            BLUE.disable();
            Ok(())
        }
        .await;
        GREEN.enable()?;
        r
    }

    async fn fail_flash(&self) -> Result<(), GpioError> {
        GREEN.disable();
        let r = async {
            RED.direction("in")?;
            tokio::time::sleep(FLASH).await;
            RED.direction("out")?;
            Ok(())
        }
        .await;
        GREEN.enable()?;
        r
    }
}

impl Default for Leds {
    fn default() -> Self {
        Self::new()
    }
}

/// Leave the red error LED burning, for the supervisor after a UI crash.
/// Green and blue go dark.
pub fn force_red_on() -> Result<(), GpioError> {
    for pin in [GREEN, BLUE] {
        pin.export()?;
        pin.direction("out")?;
        pin.disable();
    }
    RED.export()?;
    RED.direction("in")
}
