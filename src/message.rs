//! Framing and schema for the daemon <-> UI message channel (see SPEC_FULL.md
//! §4.10 and §6). Messages are tagged, length-prefixed JSON values. The
//! framing purposefully mirrors the simplest of the teacher's own RPC
//! encodings (`lianad::jsonrpc::rpc`): a typed envelope over `serde_json`,
//! just swapping the JSONRPC2 request/response shape for a plain sum type
//! since the UI channel has no notion of request/response correlation.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::config::SysupdatesChannel;
use crate::reports::{LightningErrorCode, LightningReport, NetworkReport, OnchainReport, PoweroffProgress};

/// Current wire format version. Bumped whenever a breaking schema change is
/// made; readers reject any other value outright.
pub const FORMAT_VERSION: u8 = 1;

/// The maximum size of a single framed message. Guards against a
/// misbehaving or malicious peer asking us to allocate an unbounded buffer.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LndConnType {
    LndRpc,
    LndHttp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LndConnPerm {
    Admin,
    Readonly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LndCtrlConn {
    pub url: String,
    pub typ: LndConnType,
    pub perm: LndConnPerm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsSysupdates {
    pub channel: SysupdatesChannel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsMessage {
    pub hostname: String,
    pub sysupdates: SettingsSysupdates,
    pub slock_enabled: bool,
}

/// Messages sent by the UI process to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Pong,
    Poweroff,
    GetNetworkReport { scan: bool },
    WifiConnect { ssid: String, password: Option<String> },
    Standby,
    Wakeup,
    SwitchSysupdates { chan: SysupdatesChannel },
    LightningGenseed,
    LightningInitWallet { mnemonic: Vec<String> },
    LightningGetCtrlconn,
    LightningReset,
    SetNodename { name: String },
    SlockSetPincode { code: Option<String> },
    UnlockScreen { code: String },
}

/// Messages sent by the daemon to the UI process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Settings(SettingsMessage),
    NetworkReport(NetworkReport),
    OnchainReport(OnchainReport),
    LightningReport(LightningReport),
    LightningError { code: LightningErrorCode },
    LightningGenseedResult { mnemonic: Vec<String> },
    LightningCtrlconn(Vec<LndCtrlConn>),
    PoweroffProgress(PoweroffProgress),
}

#[derive(Debug)]
pub enum CodecError {
    /// The peer closed its end of the stream cleanly (no partial frame was
    /// read). Treated as a graceful disconnect by callers, per §7.
    EndOfStream,
    FrameTooLarge(u32),
    UnsupportedVersion(u8),
    Io(io::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::EndOfStream => write!(f, "end of stream"),
            Self::FrameTooLarge(len) => write!(f, "frame of {} bytes exceeds the maximum", len),
            Self::UnsupportedVersion(v) => write!(f, "unsupported wire format version {}", v),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Json(e) => write!(f, "malformed message: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::EndOfStream
        } else {
            Self::Io(e)
        }
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

/// Writes a single frame: `[version: u8][len: u32 BE][json payload]`.
fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<(), CodecError> {
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(CodecError::FrameTooLarge(payload.len() as u32));
    }
    w.write_all(&[FORMAT_VERSION])?;
    w.write_all(&(payload.len() as u32).to_be_bytes())?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>, CodecError> {
    let mut version = [0u8; 1];
    r.read_exact(&mut version)?;
    if version[0] != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version[0]));
    }
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Reads one `Command` off the UI channel. Blocking.
pub fn read_command<R: Read>(r: &mut R) -> Result<Command, CodecError> {
    let buf = read_frame(r)?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Writes one `Message` to the UI channel. Blocking.
pub fn write_message<W: Write>(w: &mut W, msg: &Message) -> Result<(), CodecError> {
    let payload = serde_json::to_vec(msg)?;
    write_frame(w, &payload)
}
