//! Short-lived detached workers for UI commands that would otherwise block
//! the UI-command loop (SPEC_FULL.md §4.1 "UI-command loop", §4.7-§4.9):
//! wifi connect, sysupdates channel switch, and every lightning-wallet
//! operation. Grounded in the same "spawn a named thread, own your inputs"
//! shape the teacher uses for its Bitcoin poller thread
//! (`lianad::bitcoin::poller::Poller::poll_forever` runs detached from the
//! command-processing thread); here each worker is even shorter-lived,
//! running once to completion rather than looping.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::SysupdatesChannel;
use crate::message::{LndConnType, LndCtrlConn, Message};
use crate::wpa::{WpaControl, WpaError};

use super::{send, Daemon, DaemonState, Event, Outcome, UiWriter};

/// §8's "empty SSID is rejected before any wpa_supplicant command is
/// issued" boundary behavior.
#[derive(Debug)]
pub enum WifiError {
    EmptySsid,
    Wpa(WpaError),
}

impl std::fmt::Display for WifiError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::EmptySsid => write!(f, "ConnectWifiEmptySSID: SSID must not be empty"),
            Self::Wpa(e) => write!(f, "{}", e),
        }
    }
}

impl From<WpaError> for WifiError {
    fn from(e: WpaError) -> Self {
        Self::Wpa(e)
    }
}

/// Run `f` against the dedicated command/reply wpa control handle
/// (`Daemon::wpa_cmd`), never the main loop's attached event-draining
/// connection — keeping them separate means a pushed `CTRL-EVENT-*` line
/// can never be misread as this command's reply (§4.9). Locks only the
/// command socket's own mutex, not the daemon's state mutex, for the
/// duration of the single request (§5's "workers never hold the daemon
/// mutex across blocking operations longer than necessary").
fn with_wpa<T>(
    daemon: &Daemon,
    f: impl FnOnce(&WpaControl) -> Result<T, WpaError>,
) -> Result<T, WpaError> {
    let wpa_cmd = daemon.wpa_cmd.lock().expect("lock poisoned");
    match wpa_cmd.as_ref() {
        Some(wpa) => f(wpa),
        None => Err(WpaError::GenericFailure("wpa_supplicant control socket not open".into())),
    }
}

pub fn spawn_wifi_connect(daemon: Arc<Daemon>, ssid: String, password: Option<String>) {
    thread::Builder::new()
        .name("ndg-wifi-connect".to_string())
        .spawn(move || wifi_connect(&daemon, &ssid, password.as_deref()))
        .expect("spawning a wifi-connect worker must never fail");
}

/// §4.9's connect flow: add the network, configure auth, drop any stale
/// duplicate entries for the same SSID, select+enable (removing the new
/// network again if enable fails), then arm save-on-connect so the main
/// loop persists the config once `CTRL-EVENT-CONNECTED` actually fires.
fn wifi_connect(daemon: &Daemon, ssid: &str, password: Option<&str>) {
    if ssid.is_empty() {
        log::warn!("wifi_connect: {}", WifiError::EmptySsid);
        return;
    }

    let result = (|| -> Result<(), WifiError> {
        let id = with_wpa(daemon, |wpa| wpa.add_network())?;
        with_wpa(daemon, |wpa| {
            wpa.set_network_param(id, "ssid", &format!("\"{}\"", ssid))
        })?;
        match password {
            Some(pw) => with_wpa(daemon, |wpa| wpa.set_network_param(id, "psk", &format!("\"{}\"", pw)))?,
            None => with_wpa(daemon, |wpa| wpa.set_network_param(id, "key_mgmt", "NONE"))?,
        };

        let existing = with_wpa(daemon, |wpa| wpa.list_networks())?;
        for (other_id, other_ssid) in existing {
            if other_id != id && other_ssid == ssid {
                let _ = with_wpa(daemon, |wpa| wpa.remove_network(other_id));
            }
        }

        with_wpa(daemon, |wpa| wpa.select_network(id))?;
        if let Err(e) = with_wpa(daemon, |wpa| wpa.enable_network(id)) {
            let _ = with_wpa(daemon, |wpa| wpa.remove_network(id));
            return Err(e.into());
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            let mut inner = daemon.inner.lock().expect("lock poisoned");
            inner.save_on_connect = true;
            inner.wifi_key_invalid = false;
        }
        Err(e) => log::warn!("wifi_connect({}) failed: {}", ssid, e),
    }
}

pub fn spawn_switch_sysupdates(daemon: Arc<Daemon>, chan: SysupdatesChannel) {
    thread::Builder::new()
        .name("ndg-switch-sysupdates".to_string())
        .spawn(move || {
            if let Err(e) = daemon.config.switch_sysupdates(chan, true) {
                log::warn!("switch_sysupdates({:?}) failed: {}", chan, e);
                return;
            }
            daemon.inner.lock().expect("lock poisoned").want_settings = true;
        })
        .expect("spawning a switch-sysupdates worker must never fail");
}

pub fn spawn_set_nodename(daemon: Arc<Daemon>, name: String) {
    thread::Builder::new()
        .name("ndg-set-nodename".to_string())
        .spawn(move || {
            if let Err(e) = daemon.config.set_hostname(&name) {
                log::warn!("set_nodename({}) failed: {}", name, e);
                return;
            }
            daemon.inner.lock().expect("lock poisoned").want_settings = true;
        })
        .expect("spawning a set-nodename worker must never fail");
}

pub fn spawn_slock_set_pincode(daemon: Arc<Daemon>, code: Option<String>) {
    thread::Builder::new()
        .name("ndg-slock-set-pincode".to_string())
        .spawn(move || {
            if let Err(e) = daemon.config.set_slock_pin(code.as_deref()) {
                log::warn!("slock_set_pincode failed: {}", e);
                return;
            }
            daemon.inner.lock().expect("lock poisoned").want_settings = true;
        })
        .expect("spawning a slock-set-pincode worker must never fail");
}

pub fn spawn_unlock_screen(daemon: Arc<Daemon>, code: String) {
    thread::Builder::new()
        .name("ndg-unlock-screen".to_string())
        .spawn(move || {
            if let Err(e) = daemon.config.verify_slock_pin(&code) {
                log::debug!("unlock_screen: {}", e);
            }
        })
        .expect("spawning an unlock-screen worker must never fail");
}

pub fn spawn_lightning_genseed(daemon: Arc<Daemon>, ui_out: UiWriter) {
    thread::Builder::new()
        .name("ndg-lnd-genseed".to_string())
        .spawn(move || match daemon.lnd.lock().expect("lock poisoned").genseed() {
            Ok(mnemonic) => {
                let _ = send(&ui_out, &Message::LightningGenseedResult { mnemonic });
            }
            Err(e) => log::warn!("lightning_genseed failed: {}", e),
        })
        .expect("spawning a lightning-genseed worker must never fail");
}

pub fn spawn_lightning_ctrlconn(daemon: Arc<Daemon>, ui_out: UiWriter) {
    thread::Builder::new()
        .name("ndg-lnd-ctrlconn".to_string())
        .spawn(move || lightning_ctrlconn(&daemon, &ui_out))
        .expect("spawning a lightning-ctrlconn worker must never fail");
}

/// Builds both `lndconnect://` flavors (gRPC and REST ports) for the admin
/// macaroon, per §4.2's `lndConnectWaitMacaroonFile`.
fn lightning_ctrlconn(daemon: &Daemon, ui_out: &UiWriter) {
    let mut conns = Vec::new();
    for typ in [LndConnType::LndRpc, LndConnType::LndHttp] {
        match daemon
            .config
            .lndconnect_wait_macaroon_file(typ, Duration::from_secs(10))
        {
            Ok(url) => conns.push(LndCtrlConn {
                url,
                typ,
                perm: crate::config::default_conn_perm(),
            }),
            Err(e) => log::warn!("lightning_get_ctrlconn({:?}) failed: {}", typ, e),
        }
    }
    let _ = send(ui_out, &Message::LightningCtrlconn(conns));
}

pub fn spawn_lightning_init_wallet(daemon: Arc<Daemon>, ui_out: UiWriter, mnemonic: Vec<String>) {
    thread::Builder::new()
        .name("ndg-lnd-init".to_string())
        .spawn(move || lightning_init_wallet(&daemon, &ui_out, mnemonic))
        .expect("spawning a lightning-init-wallet worker must never fail");
}

pub fn spawn_lightning_reset(daemon: Arc<Daemon>, ui_out: UiWriter) {
    thread::Builder::new()
        .name("ndg-lnd-reset".to_string())
        .spawn(move || lightning_reset(&daemon, &ui_out))
        .expect("spawning a lightning-reset worker must never fail");
}

/// Restores `state` to whatever it was before the wallet operation began
/// once this guard drops, regardless of whether the operation below it
/// succeeded (§4.7, §4.8: "leaves the state machine to be restored ... by
/// a deferred guard").
struct WalletOpGuard<'a> {
    daemon: &'a Daemon,
}

impl Drop for WalletOpGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.daemon.inner.lock().expect("lock poisoned");
        inner.apply(Event::WalletOpDone);
    }
}

/// Enters `wallet_reset`, running `body`, and restores the previous state
/// on the way out no matter how `body` returns. Returns `None` when the
/// precondition (running/standby, not already mid wallet-op) isn't met.
fn with_wallet_reset<T>(daemon: &Daemon, op_name: &str, body: impl FnOnce() -> T) -> Option<T> {
    let woke_from_standby;
    {
        let mut inner = daemon.inner.lock().expect("lock poisoned");
        woke_from_standby = inner.state == DaemonState::Standby;
        match inner.apply(Event::BeginWalletOp) {
            Outcome::Transitioned(_) => {}
            other => {
                log::warn!("{}: cannot start ({:?})", op_name, other);
                return None;
            }
        }
    }
    // §4.1: a wallet op begun from standby wakes the display (allowed,
    // backlight on), unlike the reject-outright poweroff/standby/wakeup
    // events in that state.
    if woke_from_standby {
        daemon.wake_display();
    }
    let _guard = WalletOpGuard { daemon };
    Some(body())
}

/// §4.7's wallet-init sequence: generate+persist an unlock secret, call
/// `initwallet`, regenerate the config without autounlock, restart lnd and
/// best-effort wait for `LOCKED`, unlock with the same secret (this is what
/// actually creates the macaroons on disk), then regenerate the config
/// again with autounlock enabled so lnd survives a reboot unattended.
fn lightning_init_wallet(daemon: &Daemon, _ui_out: &UiWriter, mnemonic: Vec<String>) {
    let outcome = with_wallet_reset(daemon, "lightning_init_wallet", || -> Result<(), String> {
        let unlock_hex = daemon
            .config
            .make_wallet_unlock_file(8)
            .map_err(|e| e.to_string())?;

        daemon
            .lnd
            .lock()
            .expect("lock poisoned")
            .initwallet(&mnemonic, unlock_hex.as_bytes())
            .map_err(|e| e.to_string())?;

        daemon
            .config
            .gen_lnd_config(false, None)
            .map_err(|e| e.to_string())?;

        restart_lnd(daemon)?;
        wait_for_lnd_state(daemon, "LOCKED", Duration::from_secs(10));

        daemon
            .lnd
            .lock()
            .expect("lock poisoned")
            .unlockwallet(unlock_hex.as_bytes())
            .map_err(|e| e.to_string())?;

        daemon
            .config
            .gen_lnd_config(true, None)
            .map_err(|e| e.to_string())?;
        Ok(())
    });

    match outcome {
        Some(Ok(())) => log::info!("lightning wallet initialized"),
        Some(Err(e)) => log::warn!("lightning_init_wallet failed: {}", e),
        None => {}
    }
}

/// §4.8's factory reset: idempotent teardown, wipe the data/log/TLS/unlock
/// files, regenerate the config without autounlock, restart.
fn lightning_reset(daemon: &Daemon, _ui_out: &UiWriter) {
    let outcome = with_wallet_reset(daemon, "lightning_reset", || -> Result<(), String> {
        {
            let mut services = daemon.services.lock().expect("lock poisoned");
            if let Some(svc) = services.by_name_mut("lnd") {
                svc.stop().map_err(|e| e.to_string())?;
                svc.wait_stopped();
            }
        }

        remove_dir_best_effort(std::path::Path::new(crate::config::LND_DATA_DIR));
        remove_dir_best_effort(std::path::Path::new(crate::config::LND_LOG_DIR));
        let _ = std::fs::remove_file(crate::config::WALLET_UNLOCK_PATH);
        if let Some(tls_dir) = daemon.lnd_paths.tls_cert.parent() {
            remove_dir_best_effort(tls_dir);
        }

        daemon
            .config
            .gen_lnd_config(false, None)
            .map_err(|e| e.to_string())?;

        let mut services = daemon.services.lock().expect("lock poisoned");
        if let Some(svc) = services.by_name_mut("lnd") {
            svc.start().map_err(|e| e.to_string())?;
        }
        Ok(())
    });

    match outcome {
        Some(Ok(())) => log::info!("lightning wallet reset"),
        Some(Err(e)) => log::warn!("lightning_reset failed: {}", e),
        None => {}
    }
}

/// §4.6's one-shot `resetLndTls`: delete the TLS material, bounce lnd, and
/// rebuild the in-memory `LndClient` against whatever cert lnd regenerates
/// on restart. Skipping the rebuild would leave the daemon pinned to the
/// deleted certificate forever, since `reqwest::Client` loads its trust
/// anchor once at construction.
pub fn reset_lnd_tls(daemon: Arc<Daemon>) {
    thread::Builder::new()
        .name("ndg-lnd-tls-reset".to_string())
        .spawn(move || {
            let _ = std::fs::remove_file(&daemon.lnd_paths.tls_key);
            let _ = std::fs::remove_file(&daemon.lnd_paths.tls_cert);
            {
                let mut services = daemon.services.lock().expect("lock poisoned");
                if let Some(svc) = services.by_name_mut("lnd") {
                    let _ = svc.stop();
                    svc.wait_stopped();
                    let _ = svc.start();
                }
            }

            let macaroon = daemon.lnd_paths.readonly_macaroon.exists().then(|| daemon.lnd_paths.readonly_macaroon.clone());
            match crate::lnd::LndClient::new(
                daemon.lnd_paths.rest_base_url.as_str(),
                &daemon.lnd_paths.tls_cert,
                macaroon.as_deref(),
            ) {
                Ok(fresh) => *daemon.lnd.lock().expect("lock poisoned") = fresh,
                Err(e) => log::warn!("rebuilding lnd client after TLS reset failed (will retry): {}", e),
            }
        })
        .expect("spawning a lnd-tls-reset worker must never fail");
}

fn restart_lnd(daemon: &Daemon) -> Result<(), String> {
    let mut services = daemon.services.lock().expect("lock poisoned");
    if let Some(svc) = services.by_name_mut("lnd") {
        svc.stop().map_err(|e| e.to_string())?;
        svc.wait_stopped();
        svc.start().map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// Best-effort 1Hz poll, per §9's open question: "best-effort wait, then
/// attempt unlock" — a timeout here is not itself a failure, the caller's
/// next step simply tries and propagates whatever it gets.
fn wait_for_lnd_state(daemon: &Daemon, want_state: &str, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let reached = daemon
            .lnd
            .lock()
            .expect("lock poisoned")
            .walletstatus()
            .map(|s| s["state"].as_str() == Some(want_state))
            .unwrap_or(false);
        if reached || Instant::now() >= deadline {
            return;
        }
        thread::sleep(Duration::from_secs(1));
    }
}

fn remove_dir_best_effort(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_dir_all(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::debug!("removing {}: {}", path.display(), e);
        }
    }
}
