//! The input state machine, as a pure transition function.
//!
//! [`Machine::handle`] maps an event onto the next state plus a list of
//! [`Effect`]s; it touches no hardware and takes no locks, so the whole
//! transition table is testable without a device. The driver loop in
//! [`crate::app`] executes the effects.

use std::sync::LazyLock;

use regex::Regex;
use scanner_core::input::Key;
use scanner_core::storage::Direction;

/// Grammar of barcodes that reconfigure the device instead of being stored.
/// Case-insensitive, anchored: `INGRESS-7`, `egress-12`, `WS$myssid`,
/// `WP$secret`.
static SPECIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:(INGRESS|EGRESS)-(\d+)|(WS|WP)\$(.+))$").expect("special barcode regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    ReadBarcode,
    WifiSetupSsid,
    WifiSetupPw,
    WifiSetupDone,
    WifiPrint,
}

/// What the driver feeds the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Key(Key),
    /// Outcome of the connection attempt started by [`Effect::SaveWifi`].
    WifiResult(bool),
    /// The post-connect display pause has elapsed.
    ReturnTimeout,
}

/// Side effects, returned as data and executed by the driver loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Redraw the scan screen (title comes from the current mode).
    EnterScan,
    /// Echo a finished barcode on line 2.
    EchoScan(String),
    /// Echo the in-progress setup line on line 2.
    EchoLine(String),
    ShowWifiSsidScreen,
    ShowWifiPwScreen,
    ShowWifiDoneScreen,
    ShowWifiOutcome(bool),
    ShowWifiPrintScreen,
    /// A mode barcode was scanned: install and persist the new mode.
    SetMode {
        direction: Direction,
        currier: String,
    },
    /// Store credentials and attempt to connect; `ssid: None` reuses the
    /// stored SSID.
    SaveWifi {
        ssid: Option<String>,
        pw: String,
    },
    /// Package the scan with the current mode and hand it to storage.
    Enqueue(String),
    FeedbackSuccess,
    FeedbackFail,
}

#[derive(Debug)]
pub struct Machine {
    state: State,
    line: String,
    staged_ssid: Option<String>,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            state: State::ReadBarcode,
            line: String::new(),
            staged_ssid: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        match self.state {
            State::ReadBarcode => self.handle_read_barcode(event),
            State::WifiSetupSsid | State::WifiSetupPw => self.handle_wifi_entry(event),
            State::WifiSetupDone => self.handle_wifi_done(event),
            State::WifiPrint => self.handle_wifi_print(event),
        }
    }

    fn handle_read_barcode(&mut self, event: Event) -> Vec<Effect> {
        let Event::Key(key) = event else {
            return Vec::new();
        };

        match key {
            Key::Escape => {
                self.enter(State::WifiSetupSsid);
                vec![Effect::ShowWifiSsidScreen]
            }
            Key::ArrowUp => {
                self.enter(State::WifiPrint);
                vec![Effect::ShowWifiPrintScreen]
            }
            Key::Enter => self.finish_barcode(),
            Key::Char(c) => {
                // the scanner is ASCII; anything else is line noise
                if c.is_ascii() && !c.is_ascii_control() {
                    self.line.push(c);
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn finish_barcode(&mut self) -> Vec<Effect> {
        let bc = std::mem::take(&mut self.line);
        if bc.trim().is_empty() {
            return vec![Effect::FeedbackFail];
        }

        let mut effects = vec![Effect::EchoScan(bc.clone())];

        if let Some(caps) = SPECIAL_RE.captures(&bc) {
            if let Some(dir) = caps.get(1) {
                let direction = Direction::from_name(dir.as_str()).expect("anchored alternation");
                effects.push(Effect::SetMode {
                    direction,
                    currier: caps[2].to_owned(),
                });
                effects.push(Effect::FeedbackSuccess);
            } else {
                let payload = caps[4].to_owned();
                if caps[3].eq_ignore_ascii_case("WS") {
                    // SSID staged; the password comes as the next scan or
                    // gets typed on the password screen
                    self.staged_ssid = Some(payload);
                    self.enter_keep_stash(State::WifiSetupPw);
                    effects.push(Effect::ShowWifiPwScreen);
                } else {
                    let ssid = self.staged_ssid.take();
                    self.enter(State::WifiSetupDone);
                    effects.push(Effect::ShowWifiDoneScreen);
                    effects.push(Effect::SaveWifi { ssid, pw: payload });
                }
                effects.push(Effect::FeedbackSuccess);
            }
            return effects;
        }

        effects.push(Effect::Enqueue(bc));
        effects.push(Effect::FeedbackSuccess);
        effects
    }

    fn handle_wifi_entry(&mut self, event: Event) -> Vec<Effect> {
        let Event::Key(key) = event else {
            return Vec::new();
        };

        match key {
            Key::Escape => self.cancel_wifi(),
            Key::Enter => {
                let line = std::mem::take(&mut self.line);
                if line.is_empty() {
                    return Vec::new();
                }
                match self.state {
                    State::WifiSetupSsid => {
                        self.staged_ssid = Some(line);
                        self.enter_keep_stash(State::WifiSetupPw);
                        vec![Effect::ShowWifiPwScreen]
                    }
                    State::WifiSetupPw => {
                        let ssid = self.staged_ssid.take();
                        self.enter(State::WifiSetupDone);
                        vec![
                            Effect::ShowWifiDoneScreen,
                            Effect::SaveWifi { ssid, pw: line },
                        ]
                    }
                    _ => unreachable!("handle_wifi_entry covers the entry states"),
                }
            }
            Key::Backspace | Key::Delete => {
                if self.line.pop().is_some() {
                    vec![Effect::EchoLine(self.line.clone())]
                } else {
                    Vec::new()
                }
            }
            Key::Char(c) => {
                if !c.is_ascii_control() {
                    self.line.push(c);
                    vec![Effect::EchoLine(self.line.clone())]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    fn handle_wifi_done(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::WifiResult(ok) => vec![Effect::ShowWifiOutcome(ok)],
            Event::ReturnTimeout => self.cancel_wifi(),
            Event::Key(Key::Escape) => self.cancel_wifi(),
            Event::Key(_) => Vec::new(),
        }
    }

    fn handle_wifi_print(&mut self, event: Event) -> Vec<Effect> {
        match event {
            // any key returns to scanning
            Event::Key(_) => self.cancel_wifi(),
            _ => Vec::new(),
        }
    }

    fn cancel_wifi(&mut self) -> Vec<Effect> {
        self.enter(State::ReadBarcode);
        vec![Effect::EnterScan]
    }

    fn enter(&mut self, state: State) {
        self.state = state;
        self.line.clear();
        if state != State::WifiSetupDone {
            self.staged_ssid = None;
        }
    }

    fn enter_keep_stash(&mut self, state: State) {
        self.state = state;
        self.line.clear();
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}
