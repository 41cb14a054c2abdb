//! Data types reported by the daemon to the UI, plus the bitcoind/lnd
//! snapshots they are assembled from.

use serde::{Deserialize, Serialize};

/// Snapshot of the local network interfaces and wifi state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkReport {
    pub ipaddrs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_ssid: Option<String>,
    pub wifi_scan_networks: Vec<String>,
}

/// Mempool subfields of an onchain report, taken verbatim from
/// `getmempoolinfo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MempoolInfo {
    pub loaded: bool,
    pub txcount: u64,
    pub usage: u64,
    pub max: u64,
    pub total_fee: f64,
    pub min_fee: f64,
    pub fullrbf: bool,
}

/// Optional wallet-balance subfields, present when bitcoind has a loaded
/// wallet we can query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletBalance {
    pub confirmed: f64,
    pub unconfirmed: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnchainReport {
    pub height: u64,
    pub headers: u64,
    pub bestblockhash: String,
    pub bestblocktime: u64,
    pub ibd: bool,
    pub disk_usage: u64,
    pub subversion: String,
    pub inbound_peers: u32,
    pub outbound_peers: u32,
    pub warnings: Vec<String>,
    pub mempool: MempoolInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet_balance: Option<WalletBalance>,
}

/// State of a single lnd channel, as reported to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Active,
    Inactive,
    PendingOpen,
    PendingClose,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelBalance {
    pub local: u64,
    pub remote: u64,
    pub unsettled: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub state: ChannelState,
    pub private: bool,
    pub funding_point: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closing_txid: Option<String>,
    pub peer_pubkey: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_alias: Option<String>,
    pub capacity: u64,
    pub balance: ChannelBalance,
    pub lifetime_sats_sent: u64,
    pub lifetime_sats_received: u64,
    pub base_fee_msat: u64,
    pub fee_ppm: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForwardingFees {
    pub day: u64,
    pub week: u64,
    pub month: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightningReport {
    pub identity_pubkey: String,
    pub alias: String,
    pub version: String,
    pub peer_count: u32,
    pub block_height: u32,
    pub block_hash: String,
    pub synced_to_chain: bool,
    pub synced_to_graph: bool,
    pub local_balance: u64,
    pub remote_balance: u64,
    pub unsettled_balance: u64,
    pub pending_balance: u64,
    pub forwarding_fees: ForwardingFees,
    pub channels: Vec<ChannelReport>,
}

/// Error classification surfaced to the UI in place of a `lightning_report`
/// when the lnd status cannot be meaningfully reported yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightningErrorCode {
    NotReady,
    Locked,
    Uninitialized,
}

/// Progress snapshot emitted while services are being torn down ahead of a
/// `poweroff`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStopStatus {
    pub name: String,
    pub stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoweroffProgress {
    pub services: Vec<ServiceStopStatus>,
}
