//! The daemon's state machine and thread model (SPEC_FULL.md §4.1, §5),
//! modeled on `lianad::{DaemonControl, DaemonHandle}`: a small set of
//! long-lived threads (here: main watcher, UI-command, optional poweroff)
//! plus short-lived detached workers for blocking user-initiated
//! operations, coordinated through a `mpsc::sync_channel` handle the
//! teacher also uses to signal its poller thread to stop.

mod workers;

use std::io::{Read, Write};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::bitcoind::BitcoinRpcClient;
use crate::config::ConfigStore;
use crate::lnd::LndClient;
use crate::message::{read_command, write_message, CodecError, Command, Message};
use crate::reports::{PoweroffProgress, ServiceStopStatus};
use crate::supervisor::{ServiceStatus, ServiceSupervisor};
use crate::wpa::WpaControl;

const ONCHAIN_REPORT_INTERVAL: Duration = Duration::from_secs(60);
const LND_REPORT_INTERVAL: Duration = Duration::from_secs(60);
const TICK_PERIOD: Duration = Duration::from_secs(1);

/// The five user-visible modes of §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Running,
    Standby,
    Poweroff,
    WalletReset,
}

/// Events that drive the state machine, one per §4.1 table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start,
    StopComplete,
    Standby,
    Wakeup,
    BeginPoweroff,
    BeginWalletOp,
    WalletOpDone,
}

/// Outcomes of a transition attempt, named after the table's cell labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Transitioned(DaemonState),
    Noop,
    AlreadyStarted,
    PoweroffActive,
    /// `beginWalletInit/Reset` while already in `wallet_reset`.
    ReentrancyFailed,
    Invalid,
}

/// Apply `event` to `state`. `pre_wallet_reset` is the state to restore on
/// `WalletOpDone`, supplied by the caller since it's tracked outside this
/// pure function (see `Inner::pre_wallet_reset_state`).
pub fn transition(state: DaemonState, event: Event, pre_wallet_reset: Option<DaemonState>) -> Outcome {
    use DaemonState::*;
    use Event::*;
    use Outcome::*;

    match (state, event) {
        (Stopped, Start) => Transitioned(Running),
        (Stopped, Standby | Wakeup | BeginPoweroff | BeginWalletOp) => Invalid,
        (Stopped, StopComplete | WalletOpDone) => Noop,

        (Running, Start) => AlreadyStarted,
        (Running, StopComplete) => Transitioned(Stopped),
        (Running, Standby) => Transitioned(DaemonState::Standby),
        (Running, Wakeup) => Noop,
        (Running, BeginPoweroff) => Transitioned(Poweroff),
        (Running, BeginWalletOp) => Transitioned(WalletReset),
        (Running, WalletOpDone) => Noop,

        (DaemonState::Standby, Start) => AlreadyStarted,
        (DaemonState::Standby, StopComplete) => Transitioned(Stopped),
        (DaemonState::Standby, Standby) => Noop,
        (DaemonState::Standby, Wakeup) => Transitioned(Running),
        (DaemonState::Standby, BeginPoweroff) => Transitioned(Poweroff),
        (DaemonState::Standby, BeginWalletOp) => Transitioned(WalletReset),
        (DaemonState::Standby, WalletOpDone) => Noop,

        (Poweroff, Start) => PoweroffActive,
        (Poweroff, StopComplete) => Transitioned(Stopped),
        (Poweroff, Standby | Wakeup | BeginWalletOp) => Invalid,
        (Poweroff, BeginPoweroff) => Noop,
        (Poweroff, WalletOpDone) => Noop,

        (WalletReset, Start) => AlreadyStarted,
        (WalletReset, StopComplete) => Transitioned(Stopped),
        (WalletReset, Standby) => Transitioned(WalletReset),
        (WalletReset, Wakeup) => Transitioned(WalletReset),
        (WalletReset, BeginPoweroff) => Transitioned(WalletReset),
        (WalletReset, BeginWalletOp) => ReentrancyFailed,
        (WalletReset, WalletOpDone) => {
            Transitioned(pre_wallet_reset.unwrap_or(Running))
        }
    }
}

/// State guarded by the daemon's single mutex (§5): the mode enum, every
/// `want_xxx` flag, timers, and the wpa handle once opened.
struct Inner {
    state: DaemonState,
    pre_wallet_reset_state: Option<DaemonState>,
    want_stop: bool,
    want_settings: bool,
    want_wifi_scan: bool,
    want_network_report: bool,
    want_onchain_report: bool,
    want_lnd_report: bool,
    network_report_ready: bool,
    wifi_scan_in_progress: bool,
    save_on_connect: bool,
    wifi_key_invalid: bool,
    onchain_timer: Instant,
    lnd_timer: Instant,
    lnd_tls_reset_done: bool,
    wpa: Option<WpaControl>,
}

impl Inner {
    fn new() -> Self {
        let now = Instant::now();
        Inner {
            state: DaemonState::Stopped,
            pre_wallet_reset_state: None,
            want_stop: false,
            want_settings: false,
            want_wifi_scan: false,
            want_network_report: false,
            want_onchain_report: false,
            want_lnd_report: false,
            network_report_ready: false,
            wifi_scan_in_progress: false,
            save_on_connect: false,
            wifi_key_invalid: false,
            onchain_timer: now,
            lnd_timer: now,
            lnd_tls_reset_done: false,
            wpa: None,
        }
    }

    fn apply(&mut self, event: Event) -> Outcome {
        let outcome = transition(self.state, event, self.pre_wallet_reset_state);
        if let Outcome::Transitioned(new_state) = outcome {
            if event == Event::BeginWalletOp && self.state != DaemonState::WalletReset {
                self.pre_wallet_reset_state = Some(self.state);
            }
            if event == Event::WalletOpDone {
                self.pre_wallet_reset_state = None;
            }
            self.state = new_state;
        }
        outcome
    }
}

/// Fixed filesystem locations the lnd client and config generator need,
/// gathered in one place so a TLS reset can rebuild the client (§4.6
/// `resetLndTls`).
#[derive(Debug, Clone)]
pub struct LndPaths {
    pub rest_base_url: String,
    pub tls_cert: std::path::PathBuf,
    pub tls_key: std::path::PathBuf,
    pub readonly_macaroon: std::path::PathBuf,
}

pub type UiWriter = Arc<Mutex<dyn Write + Send>>;

/// Owns every subsystem handle the daemon needs: `ConfigStore`, the
/// service list, the bitcoind and lnd clients, and the wpa control path.
/// Mirrors `DaemonControl` owning `bitcoin`/`db`/`poller_sender`.
pub struct Daemon {
    config: Arc<ConfigStore>,
    services: Arc<Mutex<ServiceSupervisor>>,
    bitcoind: Arc<BitcoinRpcClient>,
    lnd: Arc<Mutex<LndClient>>,
    lnd_paths: LndPaths,
    wpa_ctrl_path: std::path::PathBuf,
    inner: Arc<Mutex<Inner>>,
    /// Command/reply connection used exclusively by worker threads
    /// (`workers::with_wpa`), kept separate from `inner.wpa`'s attached
    /// event-draining connection so a pushed event can't be misread as a
    /// command's reply (§4.9).
    wpa_cmd: Mutex<Option<WpaControl>>,
    /// Forces the screen backlight on (§4.1: poweroff and a wallet-op begun
    /// from standby both "wake the display"). §6 never names a concrete
    /// backlight mechanism (sysfs brightness path, DBus call, ...), so this
    /// defaults to a logged no-op that a platform integration can replace
    /// via `set_display_wake_hook`.
    display_wake: Box<dyn Fn() + Send + Sync>,
}

impl Daemon {
    pub fn new(
        config: Arc<ConfigStore>,
        services: ServiceSupervisor,
        bitcoind: BitcoinRpcClient,
        lnd: LndClient,
        lnd_paths: LndPaths,
        wpa_ctrl_path: std::path::PathBuf,
    ) -> Self {
        Daemon {
            config,
            services: Arc::new(Mutex::new(services)),
            bitcoind: Arc::new(bitcoind),
            lnd: Arc::new(Mutex::new(lnd)),
            lnd_paths,
            wpa_ctrl_path,
            inner: Arc::new(Mutex::new(Inner::new())),
            wpa_cmd: Mutex::new(None),
            display_wake: Box::new(|| log::info!("forcing screen backlight on")),
        }
    }

    pub fn state(&self) -> DaemonState {
        self.inner.lock().expect("lock poisoned").state
    }

    /// Replace the backlight hook installed by `new` (a logged no-op) with
    /// the platform's real one.
    pub fn set_display_wake_hook(&mut self, hook: Box<dyn Fn() + Send + Sync>) {
        self.display_wake = hook;
    }

    /// Force the screen backlight on (§4.1).
    fn wake_display(&self) {
        (self.display_wake)()
    }
}

/// The three (optionally two) long-lived threads plus the channel used to
/// request a clean shutdown. Mirrors `lianad::DaemonHandle`'s
/// `poller_sender`/`poller_handle` pair, with a third slot for the
/// poweroff worker.
pub struct DaemonHandle {
    daemon: Arc<Daemon>,
    main_handle: Option<JoinHandle<()>>,
    ui_handle: Option<JoinHandle<()>>,
    poweroff_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    stop_tx: mpsc::SyncSender<()>,
}

impl DaemonHandle {
    /// Start the daemon: opens the wpa control socket, transitions
    /// `stopped -> running`, and spawns the main watcher and UI-command
    /// threads. `ui_in`/`ui_out` are the two ends of the UI byte pipe.
    pub fn start(
        daemon: Daemon,
        ui_in: impl Read + Send + 'static,
        ui_out: impl Write + Send + 'static,
    ) -> Self {
        let daemon = Arc::new(daemon);
        {
            let mut inner = daemon.inner.lock().expect("lock poisoned");
            match WpaControl::open(&daemon.wpa_ctrl_path) {
                Ok(wpa) => {
                    let _ = wpa.attach();
                    inner.wpa = Some(wpa);
                }
                Err(e) => log::warn!("failed to open wpa_supplicant control socket: {}", e),
            }
            inner.apply(Event::Start);
        }
        match WpaControl::open_commands(&daemon.wpa_ctrl_path) {
            Ok(wpa) => *daemon.wpa_cmd.lock().expect("lock poisoned") = Some(wpa),
            Err(e) => log::warn!("failed to open wpa_supplicant command socket: {}", e),
        }

        let (stop_tx, stop_rx) = mpsc::sync_channel::<()>(0);
        let ui_out: UiWriter = Arc::new(Mutex::new(ui_out));
        let poweroff_handle = Arc::new(Mutex::new(None));

        let main_handle = thread::Builder::new()
            .name("ndg-main".to_string())
            .spawn({
                let daemon = daemon.clone();
                let ui_out = ui_out.clone();
                let poweroff_handle = poweroff_handle.clone();
                move || main_loop(daemon, ui_out, poweroff_handle, stop_rx)
            })
            .expect("spawning the main thread must never fail");

        let ui_handle = thread::Builder::new()
            .name("ndg-ui-command".to_string())
            .spawn({
                let daemon = daemon.clone();
                let ui_out = ui_out.clone();
                move || ui_command_loop(daemon, ui_in, ui_out)
            })
            .expect("spawning the UI-command thread must never fail");

        DaemonHandle {
            daemon,
            main_handle: Some(main_handle),
            ui_handle: Some(ui_handle),
            poweroff_handle,
            stop_tx,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.main_handle.as_ref().is_some_and(|h| !h.is_finished())
            && self.ui_handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn state(&self) -> DaemonState {
        self.daemon.state()
    }

    /// Request shutdown. Does not block; call `wait` to join the threads.
    pub fn stop(&self) {
        let mut inner = self.daemon.inner.lock().expect("lock poisoned");
        inner.want_stop = true;
        drop(inner);
        let _ = self.stop_tx.try_send(());
    }

    /// Join main, UI, and (if running) poweroff threads, in that order
    /// (§5's ordering guarantee).
    pub fn wait(mut self) {
        if let Some(h) = self.main_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.ui_handle.take() {
            let _ = h.join();
        }
        let poweroff = self.poweroff_handle.lock().expect("lock poisoned").take();
        if let Some(h) = poweroff {
            let _ = h.join();
        }
    }
}

fn main_loop(
    daemon: Arc<Daemon>,
    ui_out: UiWriter,
    poweroff_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    stop_rx: mpsc::Receiver<()>,
) {
    loop {
        {
            let mut inner = daemon.inner.lock().expect("lock poisoned");
            if inner.want_stop {
                break;
            }
            run_tick(&daemon, &mut inner, &ui_out);

            if inner.state == DaemonState::Poweroff {
                let mut guard = poweroff_handle.lock().expect("lock poisoned");
                if guard.is_none() {
                    *guard = Some(spawn_poweroff_worker(daemon.clone(), ui_out.clone()));
                }
            }
        }
        if stop_rx.recv_timeout(TICK_PERIOD).is_ok() {
            continue;
        }
    }

    if let Some(wpa) = daemon.inner.lock().expect("lock poisoned").wpa.take() {
        let _ = wpa.detach();
    }
}

fn run_tick(daemon: &Arc<Daemon>, inner: &mut Inner, ui_out: &UiWriter) {
    if inner.want_settings {
        let settings = build_settings_message(&daemon.config);
        if send(ui_out, &Message::Settings(settings)).is_ok() {
            inner.want_settings = false;
        }
    }

    drain_wpa_events(inner);

    if inner.want_wifi_scan {
        if let Some(wpa) = &inner.wpa {
            let _ = wpa.scan();
        }
        inner.want_wifi_scan = false;
        inner.wifi_scan_in_progress = true;
        inner.network_report_ready = false;
    }

    if inner.want_network_report && inner.network_report_ready {
        let report = crate::network::build_report(inner.wpa.as_ref(), false);
        let _ = send(ui_out, &Message::NetworkReport(report));
        inner.want_network_report = false;
        inner.wifi_scan_in_progress = false;
    }

    let onchain_due = inner.want_onchain_report || inner.onchain_timer.elapsed() >= ONCHAIN_REPORT_INTERVAL;
    if onchain_due {
        match daemon.bitcoind.onchain_report() {
            Ok(report) => {
                let _ = send(ui_out, &Message::OnchainReport(report));
            }
            Err(e) if e.is_warming_up() || e.is_cookie_not_found() => {
                log::debug!("bitcoind not ready yet: {}", e);
            }
            Err(e) => log::warn!("error fetching onchain report: {}", e),
        }
        inner.want_onchain_report = false;
        inner.onchain_timer = Instant::now();
    }

    let lnd_due = inner.want_lnd_report || inner.lnd_timer.elapsed() >= LND_REPORT_INTERVAL;
    if inner.state != DaemonState::WalletReset && lnd_due {
        fetch_lightning_report(daemon, inner, ui_out);
        inner.want_lnd_report = false;
        inner.lnd_timer = Instant::now();
    }
}

fn fetch_lightning_report(daemon: &Arc<Daemon>, inner: &mut Inner, ui_out: &UiWriter) {
    let lnd = daemon.lnd.lock().expect("lock poisoned");
    match lnd.lightning_report() {
        Ok(report) => {
            let _ = send(ui_out, &Message::LightningReport(report));
        }
        Err(e) => {
            drop(lnd);
            if let Some(code) = classify_lnd_error(daemon, inner, &e) {
                let _ = send(ui_out, &Message::LightningError { code });
            } else {
                log::warn!("unclassified lnd error: {}", e);
            }
        }
    }
}

/// §4.6's error-classification policy.
fn classify_lnd_error(
    daemon: &Arc<Daemon>,
    inner: &mut Inner,
    err: &crate::lnd::LndError,
) -> Option<crate::reports::LightningErrorCode> {
    use crate::lnd::LndError;
    use crate::reports::LightningErrorCode;

    match err {
        LndError::ConnectionRefused | LndError::TlsCertNotFound => {
            return Some(LightningErrorCode::NotReady);
        }
        LndError::TlsInitFailure(_) | LndError::TlsCertUnreadable(_) => {
            if !inner.lnd_tls_reset_done {
                inner.lnd_tls_reset_done = true;
                workers::reset_lnd_tls(daemon.clone());
                return Some(LightningErrorCode::NotReady);
            }
            // The one-shot reset already fired once (§8: "resets
            // certificates at most once; a second identical failure
            // propagates normally") — fall through to the walletstatus
            // check below instead of swallowing this forever.
        }
        _ => {}
    }

    let lnd = daemon.lnd.lock().expect("lock poisoned");
    match lnd.walletstatus() {
        Ok(status) => {
            let state = status["state"].as_str().unwrap_or("");
            match state {
                "NON_EXISTING" => Some(LightningErrorCode::Uninitialized),
                "LOCKED" => Some(LightningErrorCode::Locked),
                "UNLOCKED" | "RPC_ACTIVE" | "WAITING_TO_START" => Some(LightningErrorCode::NotReady),
                _ => None,
            }
        }
        Err(_) => crate::lnd::classify_error(err),
    }
}

fn drain_wpa_events(inner: &mut Inner) {
    use crate::wpa::WpaEvent;
    let Some(wpa) = &inner.wpa else { return };
    while matches!(wpa.pending(), Ok(true)) {
        match wpa.receive() {
            Ok(WpaEvent::ScanResults) => inner.network_report_ready = true,
            Ok(WpaEvent::Connected) => {
                inner.want_network_report = true;
                if inner.save_on_connect {
                    let _ = wpa.save_config();
                    inner.save_on_connect = false;
                }
            }
            Ok(WpaEvent::SsidTempDisabled { auth_failures }) if auth_failures != 0 => {
                inner.wifi_key_invalid = true;
                inner.save_on_connect = false;
            }
            Ok(_) => {}
            Err(e) => {
                log::debug!("wpa event read error: {}", e);
                break;
            }
        }
    }
}

fn build_settings_message(config: &ConfigStore) -> crate::message::SettingsMessage {
    let hostname = config.hostname();
    let (channel, slock_enabled) = config.with_read_lock(|cfg| (cfg.syschannel, cfg.slock.is_some()));
    crate::message::SettingsMessage {
        hostname,
        sysupdates: crate::message::SettingsSysupdates { channel },
        slock_enabled,
    }
}

fn ui_command_loop(daemon: Arc<Daemon>, mut ui_in: impl Read, ui_out: UiWriter) {
    loop {
        match read_command(&mut ui_in) {
            Ok(cmd) => handle_command(&daemon, cmd, &ui_out),
            Err(CodecError::EndOfStream) => {
                let mut inner = daemon.inner.lock().expect("lock poisoned");
                if inner.state != DaemonState::Stopped && inner.state != DaemonState::Poweroff {
                    inner.want_stop = true;
                }
                return;
            }
            Err(e) => {
                log::warn!("error reading UI command: {}", e);
            }
        }
    }
}

fn handle_command(daemon: &Arc<Daemon>, cmd: Command, ui_out: &UiWriter) {
    match cmd {
        Command::Pong => {}
        Command::Poweroff => {
            let mut inner = daemon.inner.lock().expect("lock poisoned");
            inner.apply(Event::BeginPoweroff);
        }
        Command::GetNetworkReport { scan } => {
            let mut inner = daemon.inner.lock().expect("lock poisoned");
            inner.want_network_report = true;
            if scan {
                inner.want_wifi_scan = true;
            } else {
                inner.network_report_ready = true;
            }
        }
        Command::WifiConnect { ssid, password } => workers::spawn_wifi_connect(daemon.clone(), ssid, password),
        Command::Standby => {
            let mut inner = daemon.inner.lock().expect("lock poisoned");
            inner.apply(Event::Standby);
        }
        Command::Wakeup => {
            let mut inner = daemon.inner.lock().expect("lock poisoned");
            inner.apply(Event::Wakeup);
        }
        Command::SwitchSysupdates { chan } => workers::spawn_switch_sysupdates(daemon.clone(), chan),
        Command::LightningGenseed => workers::spawn_lightning_genseed(daemon.clone(), ui_out.clone()),
        Command::LightningInitWallet { mnemonic } => {
            workers::spawn_lightning_init_wallet(daemon.clone(), ui_out.clone(), mnemonic)
        }
        Command::LightningGetCtrlconn => workers::spawn_lightning_ctrlconn(daemon.clone(), ui_out.clone()),
        Command::LightningReset => workers::spawn_lightning_reset(daemon.clone(), ui_out.clone()),
        Command::SetNodename { name } => workers::spawn_set_nodename(daemon.clone(), name),
        Command::SlockSetPincode { code } => workers::spawn_slock_set_pincode(daemon.clone(), code),
        Command::UnlockScreen { code } => workers::spawn_unlock_screen(daemon.clone(), code),
    }
}

fn spawn_poweroff_worker(daemon: Arc<Daemon>, ui_out: UiWriter) -> JoinHandle<()> {
    thread::Builder::new()
        .name("ndg-poweroff".to_string())
        .spawn(move || poweroff_worker(daemon, ui_out))
        .expect("spawning the poweroff thread must never fail")
}

/// Ordered teardown: stop every service without waiting (one snapshot),
/// then `stopWait` each in turn (one snapshot per service) — exactly
/// `1 + N` messages, per §8.
fn poweroff_worker(daemon: Arc<Daemon>, ui_out: UiWriter) {
    daemon.wake_display();

    let mut services = daemon.services.lock().expect("lock poisoned");

    for svc in services.services_mut() {
        if let Err(e) = svc.stop() {
            log::warn!("error stopping {}: {}", svc.name, e);
        }
    }
    let _ = send(&ui_out, &Message::PoweroffProgress(snapshot(services.services())));

    for idx in 0..services.services().len() {
        let svc = &mut services.services_mut()[idx];
        svc.wait_stopped();
        let _ = send(&ui_out, &Message::PoweroffProgress(snapshot(services.services())));
    }

    drop(services);
    let mut inner = daemon.inner.lock().expect("lock poisoned");
    inner.apply(Event::StopComplete);
    inner.want_stop = true;

    let _ = std::process::Command::new("poweroff").status();
}

fn snapshot(services: &[crate::supervisor::ServiceDescriptor]) -> PoweroffProgress {
    PoweroffProgress {
        services: services
            .iter()
            .map(|s| ServiceStopStatus {
                name: s.name.clone(),
                stopped: s.status() == ServiceStatus::Stopped,
                err: s.last_stop_error().map(String::from),
            })
            .collect(),
    }
}

fn send(ui_out: &UiWriter, msg: &Message) -> Result<(), CodecError> {
    let mut w = ui_out.lock().expect("lock poisoned");
    write_message(&mut *w, msg)
}
