//! Operator feedback: tones and lights, switched on the board revision.
//!
//! Version 1 boards only have the PWM piezo. Version 2 adds the GPIO LEDs
//! and a beeper pin; success and failure there are a beep and a flash run in
//! parallel.

use scanner_core::buzzer::Buzzer;
use scanner_core::gpio::Leds;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub struct Feedback {
    hardware_version: i64,
    buzzer: Buzzer,
    leds: Leds,
}

impl Feedback {
    pub fn new(hardware_version: i64) -> Self {
        Self {
            hardware_version,
            buzzer: Buzzer::new(),
            leds: Leds::new(),
        }
    }

    fn v2(&self) -> bool {
        self.hardware_version >= 2
    }

    /// Export and configure whatever hardware this board has. Absence is
    /// logged and tolerated.
    pub async fn setup(&self, cancel: CancellationToken) {
        if self.v2() {
            if let Err(e) = self.leds.setup() {
                warn!(error = %e, "gpio setup failed, feedback disabled");
            }
        } else {
            if let Err(e) = self.buzzer.setup().await {
                warn!(error = %e, "buzzer setup failed, feedback disabled");
            }
            self.buzzer.spawn_denoiser(cancel);
        }
    }

    pub async fn on_startup(&self) {
        if self.v2() {
            self.leds.red_off();
            if let Err(e) = self.leds.green_on() {
                warn!(error = %e, "could not switch green led on");
            }
        } else if let Err(e) = self.buzzer.startup_beep().await {
            warn!(error = %e, "startup beep failed");
        }
    }

    /// Shutdown leaves the fail-safe red LED burning on v2 boards.
    pub fn on_shutdown(&self) {
        if self.v2() {
            self.leds.green_off();
            if let Err(e) = self.leds.red_on() {
                warn!(error = %e, "could not switch red led on");
            }
        }
    }

    pub async fn success(&self) {
        let result = if self.v2() {
            self.leds.success().await.map_err(|e| e.to_string())
        } else {
            self.buzzer.success_beep().await.map_err(|e| e.to_string())
        };
        if let Err(e) = result {
            warn!(error = %e, "success feedback failed");
        }
    }

    pub async fn fail(&self) {
        let result = if self.v2() {
            self.leds.fail().await.map_err(|e| e.to_string())
        } else {
            self.buzzer.fail_beep().await.map_err(|e| e.to_string())
        };
        if let Err(e) = result {
            warn!(error = %e, "fail feedback failed");
        }
    }
}
