//! Control-socket client for `wpa_supplicant` (SPEC_FULL.md §4.9).
//!
//! No crate in the retrieved corpus wraps this protocol, so this is built
//! directly on `std::os::unix::net::UnixDatagram`, following the same
//! "bind our end, connect to the peer's well-known path" shape the teacher
//! uses for its own Unix-domain RPC socket
//! (`lianad::jsonrpc::server::rpcserver_setup`/`bind`): a leftover socket
//! from our own end is removed and recreated on startup rather than
//! treated as fatal.

use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum WpaError {
    Io(io::Error),
    Timeout,
    /// The control interface answered something other than `OK` or the
    /// expected payload shape.
    GenericFailure(String),
}

impl std::fmt::Display for WpaError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "wpa_supplicant control socket I/O error: {}", e),
            Self::Timeout => write!(f, "wpa_supplicant control request timed out"),
            Self::GenericFailure(s) => write!(f, "wpa_supplicant request failed: {}", s),
        }
    }
}

impl std::error::Error for WpaError {}

impl From<io::Error> for WpaError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut {
            Self::Timeout
        } else {
            Self::Io(e)
        }
    }
}

/// A connected handle to wpa_supplicant's control interface for a single
/// network interface (normally `wlan0`).
pub struct WpaControl {
    sock: UnixDatagram,
    our_path: PathBuf,
}

/// A single scan result line, as returned by the `SCAN_RESULTS` command.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub bssid: String,
    pub frequency: u32,
    pub signal_level: i32,
    pub flags: String,
    pub ssid: String,
}

/// Events the supplicant may push to an attached control connection
/// (§4.9's network-state table).
#[derive(Debug, Clone, PartialEq)]
pub enum WpaEvent {
    ScanResults,
    Connected,
    Disconnected,
    /// `CTRL-EVENT-SSID-TEMP-DISABLED ... auth_failures=N ...`
    SsidTempDisabled { auth_failures: u32 },
    Other(String),
}

impl WpaControl {
    /// Bind our end at `<socket_dir>/ndg-<pid>-events.sock`, connect to the
    /// supplicant's `ctrl_path` socket (normally
    /// `/var/run/wpa_supplicant/wlan0`), and `ATTACH` it. Dedicated to the
    /// main loop's event drain (`receive`/`pending`) — never issue a
    /// request/reply command against this connection, since an unsolicited
    /// event could then be misread as that command's reply. Use
    /// `open_commands` for request/reply traffic instead.
    pub fn open(ctrl_path: impl AsRef<Path>) -> Result<Self, WpaError> {
        Self::open_tagged(ctrl_path, "events")
    }

    /// A second, unattached connection dedicated to synchronous
    /// command/reply exchanges (`ADD_NETWORK`, `SET_NETWORK`, ...), kept
    /// separate from the attached `open` connection so a pushed
    /// `CTRL-EVENT-*` line can never land in the middle of a command's
    /// reply (SPEC_FULL.md §4.9).
    pub fn open_commands(ctrl_path: impl AsRef<Path>) -> Result<Self, WpaError> {
        Self::open_tagged(ctrl_path, "cmd")
    }

    fn open_tagged(ctrl_path: impl AsRef<Path>, tag: &str) -> Result<Self, WpaError> {
        let pid = std::process::id();
        let our_path = PathBuf::from(format!("/var/run/wpa_supplicant/ndg-{}-{}.sock", pid, tag));
        if our_path.exists() {
            std::fs::remove_file(&our_path)?;
        }
        let sock = UnixDatagram::bind(&our_path)?;
        sock.set_read_timeout(Some(DEFAULT_TIMEOUT))?;
        sock.connect(ctrl_path.as_ref())?;
        Ok(WpaControl { sock, our_path })
    }

    /// Send a raw command string and read back a single reply.
    fn request(&self, cmd: &str) -> Result<String, WpaError> {
        self.sock.send(cmd.as_bytes())?;
        let mut buf = [0u8; 4096];
        let n = self.sock.recv(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
    }

    /// Send a command expected to reply with a bare `OK`.
    fn req_ok(&self, cmd: &str) -> Result<(), WpaError> {
        let reply = self.request(cmd)?;
        if reply.trim() == "OK" {
            Ok(())
        } else {
            Err(WpaError::GenericFailure(reply))
        }
    }

    /// Register this socket to also receive unsolicited events.
    pub fn attach(&self) -> Result<(), WpaError> {
        self.req_ok("ATTACH")
    }

    pub fn detach(&self) -> Result<(), WpaError> {
        self.req_ok("DETACH")
    }

    /// Block (up to the read timeout) for the next unsolicited event.
    pub fn receive(&self) -> Result<WpaEvent, WpaError> {
        let mut buf = [0u8; 4096];
        let n = self.sock.recv(&mut buf)?;
        let line = String::from_utf8_lossy(&buf[..n]).into_owned();
        Ok(parse_event(&line))
    }

    /// Non-blocking check for a pending event without consuming it from a
    /// request-reply exchange; callers typically poll `receive` on a
    /// dedicated thread instead.
    pub fn pending(&self) -> Result<bool, WpaError> {
        self.sock.set_nonblocking(true)?;
        let mut buf = [0u8; 1];
        let res = self.sock.peek(&mut buf);
        self.sock.set_nonblocking(false)?;
        match res {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn scan(&self) -> Result<(), WpaError> {
        self.req_ok("SCAN")
    }

    /// Raw `STATUS` reply, a `key=value` block including `ssid=` and
    /// `wpa_state=` when associated.
    pub fn status(&self) -> Result<String, WpaError> {
        self.request("STATUS")
    }

    /// Currently associated SSID, if any.
    pub fn current_ssid(&self) -> Result<Option<String>, WpaError> {
        let status = self.status()?;
        Ok(status
            .lines()
            .find_map(|line| line.strip_prefix("ssid=").map(String::from)))
    }

    pub fn scan_results(&self) -> Result<Vec<ScanResult>, WpaError> {
        let reply = self.request("SCAN_RESULTS")?;
        Ok(reply.lines().skip(1).filter_map(parse_scan_result_line).collect())
    }

    /// `LIST_NETWORKS` reply as `(id, ssid)` pairs, for the duplicate-entry
    /// cleanup step of a connect flow.
    pub fn list_networks(&self) -> Result<Vec<(u32, String)>, WpaError> {
        let reply = self.request("LIST_NETWORKS")?;
        Ok(reply.lines().skip(1).filter_map(parse_network_list_line).collect())
    }

    pub fn save_config(&self) -> Result<(), WpaError> {
        self.req_ok("SAVE_CONFIG")
    }

    /// Returns the new network id.
    pub fn add_network(&self) -> Result<u32, WpaError> {
        let reply = self.request("ADD_NETWORK")?;
        reply
            .trim()
            .parse()
            .map_err(|_| WpaError::GenericFailure(reply))
    }

    pub fn remove_network(&self, id: u32) -> Result<(), WpaError> {
        self.req_ok(&format!("REMOVE_NETWORK {}", id))
    }

    pub fn select_network(&self, id: u32) -> Result<(), WpaError> {
        self.req_ok(&format!("SELECT_NETWORK {}", id))
    }

    pub fn enable_network(&self, id: u32) -> Result<(), WpaError> {
        self.req_ok(&format!("ENABLE_NETWORK {}", id))
    }

    /// `SET_NETWORK <id> <param> <value>`. `value` should already be
    /// formatted the way wpa_supplicant expects (quoted for strings).
    pub fn set_network_param(&self, id: u32, param: &str, value: &str) -> Result<(), WpaError> {
        self.req_ok(&format!("SET_NETWORK {} {} {}", id, param, value))
    }
}

impl Drop for WpaControl {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.our_path);
    }
}

fn parse_scan_result_line(line: &str) -> Option<ScanResult> {
    let mut fields = line.split('\t');
    let bssid = fields.next()?.to_string();
    let frequency = fields.next()?.parse().ok()?;
    let signal_level = fields.next()?.parse().ok()?;
    let flags = fields.next()?.to_string();
    let ssid = fields.next().unwrap_or("").to_string();
    Some(ScanResult {
        bssid,
        frequency,
        signal_level,
        flags,
        ssid,
    })
}

fn parse_network_list_line(line: &str) -> Option<(u32, String)> {
    let mut fields = line.split('\t');
    let id = fields.next()?.trim().parse().ok()?;
    let ssid = fields.next()?.to_string();
    Some((id, ssid))
}

fn parse_event(line: &str) -> WpaEvent {
    if let Some(rest) = line.strip_prefix("<3>CTRL-EVENT-SSID-TEMP-DISABLED ") {
        let auth_failures = rest
            .split_whitespace()
            .find_map(|tok| tok.strip_prefix("auth_failures="))
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        return WpaEvent::SsidTempDisabled { auth_failures };
    }
    if line.contains("CTRL-EVENT-SCAN-RESULTS") {
        return WpaEvent::ScanResults;
    }
    if line.contains("CTRL-EVENT-CONNECTED") {
        return WpaEvent::Connected;
    }
    if line.contains("CTRL-EVENT-DISCONNECTED") {
        return WpaEvent::Disconnected;
    }
    WpaEvent::Other(line.to_string())
}
