//! Wiring and the effect driver loop.
//!
//! One task owns the state machine and is the only writer of mode state;
//! everything else (storage consumer, idle loop, watchdogs, notifier) runs
//! beside it and talks through channels, the shared mode lock, or the
//! cancellation token.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use scanner_core::config::Config;
use scanner_core::display::Screen;
use scanner_core::input::{Key, Tty};
use scanner_core::logging::LogHandle;
use scanner_core::status::Reporter;
use scanner_core::storage::{now_nanos, Barcode, Direction, Storage};
use scanner_core::telegram::Bot;
use scanner_core::update::Binary;
use scanner_core::wifi::{self, Account};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::feedback::Feedback;
use crate::settings::{self, Settings};
use crate::state::{Effect, Event, Machine};

/// No keystrokes for this long means the device is idle.
const IDLE_AFTER: Duration = Duration::from_secs(60 * 60);
/// Continuous idle after which the mode resets to `(EGRESS, "0")`.
const EXTENDED_IDLE: Duration = Duration::from_secs(6 * 60 * 60);
/// Vitals cadence.
const STATUS_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// How long the Wi-Fi outcome stays on screen.
const WIFI_OUTCOME_PAUSE: Duration = Duration::from_secs(2);

struct ModeState {
    direction: Direction,
    currier: String,
    /// Nanoseconds since epoch when the current idle period began; zero
    /// while the operator is active.
    idle_start_nanos: i64,
}

pub struct App {
    cfg: Config,
    cancel: CancellationToken,
    bot: Arc<Bot>,
    log_handle: LogHandle,
    screen: Arc<Screen>,
    storage: Storage,
    upd: Option<Binary>,
    feedback: Arc<Feedback>,
    reporter: Reporter,
    mode: RwLock<ModeState>,
    activity_tx: mpsc::Sender<()>,
    activity_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl App {
    pub fn new(
        cfg: Config,
        cancel: CancellationToken,
        bot: Arc<Bot>,
        log_handle: LogHandle,
    ) -> anyhow::Result<Arc<Self>> {
        let storage = Storage::new(cancel.clone(), &cfg)?;

        let screen = match Screen::detect() {
            Ok(s) => Arc::new(s),
            Err(e) => {
                error!(error = %e, "no display detected, running headless");
                Arc::new(Screen::disabled())
            }
        };

        let upd = match std::env::current_exe() {
            Ok(path) => match Binary::new(path, &cfg) {
                Ok(b) => {
                    b.cleanup();
                    Some(b)
                }
                Err(e) => {
                    error!(error = %e, "updater setup failed, self-update disabled");
                    None
                }
            },
            Err(e) => {
                error!(error = %e, "cannot locate own executable, self-update disabled");
                None
            }
        };

        let restored = settings::load(&cfg.state_path);
        debug!(?restored, "settings restored");

        let (activity_tx, activity_rx) = mpsc::channel(1);

        Ok(Arc::new(Self {
            feedback: Arc::new(Feedback::new(cfg.hardware_version)),
            reporter: Reporter::new(bot.clone()),
            mode: RwLock::new(ModeState {
                direction: restored.direction,
                currier: restored.currier,
                idle_start_nanos: restored.idle_start_nanos,
            }),
            cfg,
            cancel,
            bot,
            log_handle,
            screen,
            storage,
            upd,
            activity_tx,
            activity_rx: tokio::sync::Mutex::new(Some(activity_rx)),
        }))
    }

    /// Run until cancelled.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        self.spawn_signal_handler();

        let _ = self
            .bot
            .send(&format!("BS-start @ {}", chrono::Utc::now().to_rfc3339()), true)
            .await;
        self.spawn_message_handler();

        self.screen.write_title("STARTUP");
        self.screen.write_line(2, "OK");
        self.screen.write_help("scanner ready");

        self.feedback.setup(self.cancel.clone()).await;
        self.feedback.on_startup().await;

        wifi::spawn_watchdog(self.cancel.clone(), self.cfg.state_path.clone());

        let keys = self.spawn_input_reader();
        tokio::spawn(self.clone().drive(keys));

        let activity_rx = self
            .activity_rx
            .lock()
            .await
            .take()
            .expect("idle loop started twice");
        tokio::spawn(self.clone().idle_loop(activity_rx));

        // cancelling the token is the normal way to exit
        self.cancel.cancelled().await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        self.feedback.on_shutdown();
        Ok(())
    }

    fn spawn_signal_handler(&self) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let (Ok(mut int), Ok(mut term), Ok(mut hup)) = (
                signal(SignalKind::interrupt()),
                signal(SignalKind::terminate()),
                signal(SignalKind::hangup()),
            ) else {
                error!("could not install signal handlers");
                return;
            };

            tokio::select! {
                _ = int.recv() => {}
                _ = term.recv() => {}
                _ = hup.recv() => {}
            }
            warn!("caught signal, exiting cleanly");
            cancel.cancel();
        });
    }

    fn spawn_message_handler(self: &Arc<Self>) {
        let app = self.clone();
        tokio::spawn(async move {
            loop {
                let result = app
                    .bot
                    .handle_messages(|msg| app.handle_command(msg), false)
                    .await;
                if let Err(e) = result {
                    error!(error = %e, "notifier message stream failed");
                }
                tokio::select! {
                    () = app.cancel.cancelled() => return,
                    () = tokio::time::sleep(Duration::from_secs(60)) => {}
                }
            }
        });
    }

    fn handle_command(&self, msg: &str) {
        match parse_command(msg) {
            Some(Command::Restart) => {
                warn!("restart requested over the notifier");
                self.cancel.cancel();
            }
            Some(Command::LogSpec(spec)) => match self.log_handle.apply_spec(&spec) {
                Ok(()) => debug!(%spec, "log spec applied"),
                Err(e) => warn!(error = %e, "rejected log spec"),
            },
            None => {}
        }
    }

    /// Reader thread: the only place that touches the TTY.
    fn spawn_input_reader(&self) -> mpsc::UnboundedReceiver<Key> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = self.cancel.clone();

        std::thread::spawn(move || {
            let mut tty = match Tty::open(cancel.clone()) {
                Ok(t) => t,
                Err(e) => {
                    error!(error = %e, "no TTY available, input disabled");
                    return;
                }
            };

            loop {
                if cancel.is_cancelled() {
                    return;
                }
                match tty.read_key() {
                    Ok(Key::EndOfTransmission) => {
                        warn!("ctrl+d pressed, exiting");
                        cancel.cancel();
                        return;
                    }
                    Ok(key) => {
                        trace!(?key, "key read");
                        if tx.send(key).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        // expected for exotic escape sequences
                        debug!(error = %e, "read key error");
                    }
                }
            }
        });

        rx
    }

    async fn drive(self: Arc<Self>, mut keys: mpsc::UnboundedReceiver<Key>) {
        let mut machine = Machine::new();
        self.enter_scan();

        loop {
            let key = tokio::select! {
                () = self.cancel.cancelled() => return,
                k = keys.recv() => match k {
                    Some(k) => k,
                    None => return,
                },
            };

            self.ping_activity();
            let effects = machine.handle(Event::Key(key));
            self.apply(&mut machine, effects).await;
        }
    }

    async fn apply(&self, machine: &mut Machine, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::EnterScan => self.enter_scan(),
                Effect::EchoScan(bc) => self.screen.write_line(2, &bc),
                Effect::EchoLine(line) => self.screen.write_line(2, &line),
                Effect::ShowWifiSsidScreen => self.wifi_entry_screen("SSID:"),
                Effect::ShowWifiPwScreen => self.wifi_entry_screen("Password:"),
                Effect::ShowWifiDoneScreen => {
                    self.screen.clear();
                    self.screen.write_title("WI-FI SETUP");
                    self.screen.write_line(1, "Checking…");
                    self.screen.write_line(2, "Please wait…");
                    self.screen.write_help("");
                }
                Effect::ShowWifiOutcome(ok) => {
                    self.screen
                        .write_line(2, if ok { "Success!" } else { "Error!" });
                }
                Effect::ShowWifiPrintScreen => self.wifi_print_screen(),
                Effect::SetMode {
                    direction,
                    currier,
                } => self.set_mode(direction, currier),
                Effect::SaveWifi { ssid, pw } => {
                    let ok = self.save_wifi(ssid, pw).await;
                    queue.extend(machine.handle(Event::WifiResult(ok)));
                    tokio::time::sleep(WIFI_OUTCOME_PAUSE).await;
                    queue.extend(machine.handle(Event::ReturnTimeout));
                }
                Effect::Enqueue(bc) => self.enqueue(bc),
                Effect::FeedbackSuccess => {
                    let feedback = self.feedback.clone();
                    tokio::spawn(async move { feedback.success().await });
                }
                Effect::FeedbackFail => {
                    let feedback = self.feedback.clone();
                    tokio::spawn(async move { feedback.fail().await });
                }
            }
        }
    }

    fn enter_scan(&self) {
        self.screen.clear();
        self.write_mode_title();
        self.screen.write_line(1, "Barcode data:");
        self.screen.write_help("waiting for scan");
    }

    fn write_mode_title(&self) {
        let mode = self.mode.read().expect("mode lock poisoned");
        self.screen
            .write_title(&format!("{}-{}", mode.direction, mode.currier));
    }

    fn wifi_entry_screen(&self, prompt: &str) {
        self.screen.clear();
        self.screen.write_title("WI-FI SETUP");
        self.screen.write_line(1, prompt);
        self.screen.write_line(2, "");
        self.screen.write_help("(ESC to cancel)");
    }

    fn wifi_print_screen(&self) {
        self.screen.clear();
        self.screen.write_title("WI-FI INFO");
        self.screen.write_help("(any key to return)");

        match wifi::load_account(&self.cfg.state_path) {
            Ok(acc) => {
                self.screen.write_line(1, &format!("SSID: {}", acc.ssid));
                self.screen.write_line(2, &format!("PW: {}", acc.pw));
            }
            Err(e) => {
                self.screen.write_line(1, "Error loading info");
                self.screen.write_line(2, &e.to_string());
            }
        }
    }

    fn set_mode(&self, direction: Direction, currier: String) {
        {
            let mut mode = self.mode.write().expect("mode lock poisoned");
            mode.direction = direction;
            mode.currier = currier;
            self.persist_mode(&mode);
        }
        info!(%direction, "mode changed");
        self.write_mode_title();
    }

    fn persist_mode(&self, mode: &ModeState) {
        let snapshot = Settings {
            direction: mode.direction,
            currier: mode.currier.clone(),
            idle_start_nanos: mode.idle_start_nanos,
        };
        if let Err(e) = settings::store(&self.cfg.state_path, &snapshot) {
            warn!(error = %e, "failed to persist settings");
        }
    }

    fn enqueue(&self, bc: String) {
        let record = {
            let mode = self.mode.read().expect("mode lock poisoned");
            Barcode {
                barcode: bc,
                direction: mode.direction,
                currier_service: mode.currier.clone(),
                created_at_nanos: now_nanos(),
            }
        };
        trace!(?record, "inserting barcode");
        self.storage.insert(record);
    }

    async fn save_wifi(&self, ssid: Option<String>, pw: String) -> bool {
        let ssid = match ssid {
            Some(s) => s,
            None => match wifi::load_account(&self.cfg.state_path) {
                Ok(acc) if !acc.ssid.is_empty() => acc.ssid,
                _ => {
                    warn!("password-only wifi barcode without a stored SSID");
                    return false;
                }
            },
        };

        match wifi::store_and_try(&self.cfg.state_path, &Account { ssid, pw }).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "wifi setup failed");
                false
            }
        }
    }

    fn ping_activity(&self) {
        let _ = self.activity_tx.try_send(());
    }

    /// Status ticks, the idle timer and the idle tasks. Idle tasks run when
    /// the timer first fires and then every hour while idle, in registration
    /// order: update-restart check, screen blanking, extended-idle reset.
    async fn idle_loop(self: Arc<Self>, mut activity_rx: mpsc::Receiver<()>) {
        self.reporter.check().await;

        let mut status_tick = tokio::time::interval(STATUS_INTERVAL);
        status_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        status_tick.tick().await;

        let idle = tokio::time::sleep(IDLE_AFTER);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                Some(()) = activity_rx.recv() => {
                    idle.as_mut().reset(tokio::time::Instant::now() + IDLE_AFTER);
                    let mut mode = self.mode.write().expect("mode lock poisoned");
                    mode.idle_start_nanos = 0;
                }
                _ = status_tick.tick() => self.reporter.check().await,
                () = &mut idle => {
                    self.on_idle();
                    idle.as_mut().reset(tokio::time::Instant::now() + IDLE_AFTER);
                }
            }
        }
    }

    fn on_idle(&self) {
        {
            let mut mode = self.mode.write().expect("mode lock poisoned");
            if mode.idle_start_nanos == 0 {
                mode.idle_start_nanos = now_nanos();
                self.persist_mode(&mode);
            }
        }

        if let Some(upd) = &self.upd {
            if upd.should_restart() {
                warn!("update available, exiting cleanly");
                self.cancel.cancel();
                return;
            }
        }

        if self.screen.should_blank() {
            self.screen.blank();
        }

        self.reset_mode_if_stale();
    }

    /// After six hours of continuous idle the mode falls back to
    /// `(EGRESS, "0")`; happens at most once per idle period because the
    /// reset leaves the mode at the default.
    fn reset_mode_if_stale(&self) {
        let reset = {
            let mut mode = self.mode.write().expect("mode lock poisoned");
            let idle_long_enough = mode.idle_start_nanos != 0
                && now_nanos() - mode.idle_start_nanos >= EXTENDED_IDLE.as_nanos() as i64;
            let mode_is_default =
                mode.direction == Direction::Egress && mode.currier == "0";

            if idle_long_enough && !mode_is_default {
                mode.direction = Direction::Egress;
                mode.currier = "0".into();
                self.persist_mode(&mode);
                true
            } else {
                false
            }
        };

        if reset {
            info!("extended idle, mode reset to EGRESS-0");
            self.write_mode_title();
            self.screen.blank();
        }
    }
}

/// The two remote commands the scanner understands.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Restart,
    LogSpec(String),
}

pub fn parse_command(msg: &str) -> Option<Command> {
    const RESTART: &str = "!restart barcode-scanner";
    const LOG_PREFIX: &str = "!log barcode-scanner ";

    let msg = msg.trim();
    if msg.eq_ignore_ascii_case(RESTART) {
        return Some(Command::Restart);
    }
    if let Some(head) = msg.get(..LOG_PREFIX.len()) {
        if head.eq_ignore_ascii_case(LOG_PREFIX) {
            let spec = msg[LOG_PREFIX.len()..].trim();
            if !spec.is_empty() {
                return Some(Command::LogSpec(spec.to_owned()));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_command_parses_case_insensitively() {
        assert_eq!(
            parse_command("!RESTART barcode-scanner"),
            Some(Command::Restart)
        );
        assert_eq!(parse_command(" !restart barcode-scanner "), Some(Command::Restart));
    }

    #[test]
    fn log_command_carries_the_spec() {
        assert_eq!(
            parse_command("!log barcode-scanner warn,storage=debug"),
            Some(Command::LogSpec("warn,storage=debug".into()))
        );
    }

    #[test]
    fn unrelated_chatter_is_ignored() {
        assert_eq!(parse_command("hello there"), None);
        assert_eq!(parse_command("!log other-binary debug"), None);
        assert_eq!(parse_command("!log barcode-scanner "), None);
    }
}
