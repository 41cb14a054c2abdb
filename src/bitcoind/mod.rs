//! JSON-RPC 1.0 client for bitcoind (SPEC_FULL.md §4.4), modeled directly
//! on `lianad::bitcoin::d::BitcoinD`: a single-shot `jsonrpc::client::Client`
//! over `minreq_http`, cookie-file authentication, and a typed error
//! wrapper distinguishing warm-up, transient and credential failures.
//! Unlike the teacher we talk to bitcoind's base RPC endpoint only (no
//! watchonly wallet): the appliance never asks bitcoind to hold funds.
//!
//! The cookie is re-read and the transport rebuilt on every call rather
//! than once at construction: bitcoind may not have written its cookie
//! file yet when the daemon starts, and §7 requires that absence to be
//! swallowed and retried on a later cycle rather than fail daemon startup
//! outright. Calls do not retry internally — a warm-up or transient error
//! is reported to the caller immediately, since the daemon's single mutex
//! is held for the duration of a watcher-loop tick (§5) and an internal
//! backoff here would stall every other "want-xxx" flag for its duration.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use jsonrpc::minreq_http::{self, MinreqHttpTransport};
use jsonrpc::client::Client;
use serde_json::Value as Json;

use crate::reports::{MempoolInfo, OnchainReport, WalletBalance};

const RPC_SOCKET_TIMEOUT: u64 = 30;

/// Numeric RPC error codes we give distinct handling to, taken from
/// bitcoind's `src/rpc/protocol.h`.
mod codes {
    pub const IN_WARMUP: i32 = -28;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const VERIFY_ALREADY_IN_CHAIN: i32 = -27;
}

#[derive(Debug)]
pub enum BitcoindError {
    CookieFile(io::Error),
    Server(jsonrpc::error::Error),
    MethodNotFound(String),
    InvalidParams(String),
    VerifyAlreadyInChain,
    Rpc(i32, String),
}

impl BitcoindError {
    pub fn is_warming_up(&self) -> bool {
        matches!(
            self,
            Self::Server(jsonrpc::error::Error::Rpc(jsonrpc::error::RpcError {
                code: codes::IN_WARMUP,
                ..
            }))
        )
    }

    pub fn is_transient(&self) -> bool {
        if let Self::Server(jsonrpc::Error::Transport(ref e)) = self {
            if let Some(e) = e.downcast_ref::<minreq_http::Error>() {
                if let minreq_http::Error::Http(minreq_http::HttpError { status_code, .. }) = e {
                    return *status_code == 503;
                }
                return matches!(e, minreq_http::Error::Minreq(jsonrpc::minreq::Error::IoError(_)));
            }
        }
        false
    }

    /// Whether this failure should be swallowed rather than surfaced, per
    /// §7's "absent cookie file is not an error while bitcoind hasn't
    /// started yet" rule.
    pub fn is_cookie_not_found(&self) -> bool {
        matches!(self, Self::CookieFile(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

impl std::fmt::Display for BitcoindError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::CookieFile(e) => write!(f, "reading bitcoind cookie file: {}", e),
            Self::Server(e) => write!(f, "bitcoind RPC error: {}", e),
            Self::MethodNotFound(m) => write!(f, "unknown bitcoind RPC method: {}", m),
            Self::InvalidParams(m) => write!(f, "invalid parameters for {}", m),
            Self::VerifyAlreadyInChain => write!(f, "transaction already in chain"),
            Self::Rpc(code, msg) => write!(f, "bitcoind error {}: {}", code, msg),
        }
    }
}

impl std::error::Error for BitcoindError {}

impl From<jsonrpc::error::Error> for BitcoindError {
    fn from(e: jsonrpc::error::Error) -> Self {
        if let jsonrpc::error::Error::Rpc(ref rpc_err) = e {
            match rpc_err.code {
                codes::METHOD_NOT_FOUND => return Self::MethodNotFound(rpc_err.message.clone()),
                codes::INVALID_PARAMS => return Self::InvalidParams(rpc_err.message.clone()),
                codes::VERIFY_ALREADY_IN_CHAIN => return Self::VerifyAlreadyInChain,
                code => return Self::Rpc(code, rpc_err.message.clone()),
            }
        }
        Self::Server(e)
    }
}

impl From<minreq_http::Error> for BitcoindError {
    fn from(e: minreq_http::Error) -> Self {
        jsonrpc::error::Error::Transport(Box::new(e)).into()
    }
}

/// Holds only the address and cookie path: no network I/O happens, and no
/// file is read, until a call is actually made.
pub struct BitcoinRpcClient {
    addr: String,
    cookie_path: PathBuf,
}

impl BitcoinRpcClient {
    pub fn new(addr: impl Into<String>, cookie_path: impl Into<PathBuf>) -> Self {
        BitcoinRpcClient {
            addr: addr.into(),
            cookie_path: cookie_path.into(),
        }
    }

    fn client(&self) -> Result<Client, BitcoindError> {
        let cookie = fs::read_to_string(&self.cookie_path).map_err(BitcoindError::CookieFile)?;
        let url = format!("http://{}", self.addr);
        let transport = MinreqHttpTransport::builder()
            .cookie_auth(cookie)
            .url(&url)
            .map_err(BitcoindError::from)?
            .timeout(Duration::from_secs(RPC_SOCKET_TIMEOUT))
            .build();
        Ok(Client::with_transport(transport))
    }

    fn call(&self, method: &str, params: Option<&serde_json::value::RawValue>) -> Result<Json, BitcoindError> {
        let client = self.client()?;
        let req = client.build_request(method, params);
        let resp = client.send_request(req).map_err(BitcoindError::from)?;
        resp.result::<Json>().map_err(BitcoindError::from)
    }

    pub fn getblockchaininfo(&self) -> Result<Json, BitcoindError> {
        self.call("getblockchaininfo", None)
    }

    pub fn getnetworkinfo(&self) -> Result<Json, BitcoindError> {
        self.call("getnetworkinfo", None)
    }

    pub fn getmempoolinfo(&self) -> Result<Json, BitcoindError> {
        self.call("getmempoolinfo", None)
    }

    /// Fetch the on-chain report subfields in one cycle's worth of calls,
    /// per §4.4's watcher-cycle contract. Wallet balance is left `None`
    /// until a watchonly wallet is wired (kept out of scope per
    /// the Non-goals; bitcoind never holds funds here).
    pub fn onchain_report(&self) -> Result<OnchainReport, BitcoindError> {
        let chaininfo = self.getblockchaininfo()?;
        let netinfo = self.getnetworkinfo()?;
        let mempoolinfo = self.getmempoolinfo()?;

        let mempool = MempoolInfo {
            loaded: mempoolinfo["loaded"].as_bool().unwrap_or(true),
            txcount: mempoolinfo["size"].as_u64().unwrap_or(0),
            usage: mempoolinfo["usage"].as_u64().unwrap_or(0),
            max: mempoolinfo["maxmempool"].as_u64().unwrap_or(0),
            total_fee: mempoolinfo["total_fee"].as_f64().unwrap_or(0.0),
            min_fee: mempoolinfo["mempoolminfee"].as_f64().unwrap_or(0.0),
            fullrbf: mempoolinfo["fullrbf"].as_bool().unwrap_or(false),
        };

        let connections = netinfo["connections_in"].as_u64().unwrap_or(0) as u32;
        let outbound = netinfo["connections_out"].as_u64().unwrap_or(0) as u32;
        let warnings = match &netinfo["warnings"] {
            Json::String(s) if !s.is_empty() => vec![s.clone()],
            Json::Array(arr) => arr.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
            _ => Vec::new(),
        };

        Ok(OnchainReport {
            height: chaininfo["blocks"].as_u64().unwrap_or(0),
            headers: chaininfo["headers"].as_u64().unwrap_or(0),
            bestblockhash: chaininfo["bestblockhash"].as_str().unwrap_or("").to_string(),
            bestblocktime: chaininfo["time"].as_u64().unwrap_or(0),
            ibd: chaininfo["initialblockdownload"].as_bool().unwrap_or(false),
            disk_usage: chaininfo["size_on_disk"].as_u64().unwrap_or(0),
            subversion: netinfo["subversion"].as_str().unwrap_or("").to_string(),
            inbound_peers: connections,
            outbound_peers: outbound,
            warnings,
            mempool,
            wallet_balance: None::<WalletBalance>,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;

    /// Starts a one-shot mock HTTP server that answers every request with
    /// `response_body`, following the teacher's own testing style of a
    /// hand-rolled listener rather than a mocking crate
    /// (`lianad::jsonrpc::server` tests use raw `UnixStream`s the same way).
    fn spawn_mock_server(response_body: &'static str) -> (String, std::thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).unwrap_or(0) == 0 {
                        return;
                    }
                    if line == "\r\n" {
                        break;
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                    response_body.len(),
                    response_body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        (addr.to_string(), handle)
    }

    fn cookie_file() -> tempfile::NamedTempFile {
        let f = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(f.path(), "user:password").unwrap();
        f
    }

    #[test]
    fn getblockchaininfo_parses_successful_response() {
        let body = r#"{"result":{"blocks":800000,"headers":800000,"bestblockhash":"00aa","time":1700000000,"initialblockdownload":false,"size_on_disk":500000000},"error":null,"id":"1"}"#;
        let (addr, _handle) = spawn_mock_server(body);
        let cookie = cookie_file();
        let client = BitcoinRpcClient::new(addr, cookie.path());
        let info = client.getblockchaininfo().unwrap();
        assert_eq!(info["blocks"].as_u64(), Some(800000));
    }

    #[test]
    fn missing_cookie_file_is_reported_as_not_found() {
        let client = BitcoinRpcClient::new("127.0.0.1:8332", "/nonexistent/path/.cookie");
        match client.getblockchaininfo() {
            Err(e) if e.is_cookie_not_found() => {}
            other => panic!("expected cookie-not-found, got {:?}", other.err().map(|e| e.to_string())),
        }
    }

    #[test]
    fn construction_never_touches_the_filesystem() {
        // No cookie file exists at this path; constructing the client must
        // still succeed, since bitcoind may not have started yet (§7).
        let _client = BitcoinRpcClient::new("127.0.0.1:8332", "/nonexistent/path/.cookie");
    }

    #[test]
    fn rpc_error_maps_method_not_found() {
        let body = r#"{"result":null,"error":{"code":-32601,"message":"Method not found"},"id":"1"}"#;
        let (addr, _handle) = spawn_mock_server(body);
        let cookie = cookie_file();
        let client = BitcoinRpcClient::new(addr, cookie.path());
        match client.getblockchaininfo() {
            Err(BitcoindError::MethodNotFound(_)) => {}
            other => panic!("expected MethodNotFound, got {:?}", other.err().map(|e| e.to_string())),
        }
    }
}
