//! Implementation of the database interface using SQLite.
//!
//! We use a bundled SQLite that is compiled with SQLITE_THREADSAFE. Sqlite.org states:
//! > Multi-thread. In this mode, SQLite can be safely used by multiple threads provided that
//! > no single database connection is used simultaneously in two or more threads.
//!
//! We leverage SQLite's `unlock_notify` feature to synchronize writes across connection. More
//! about it at https://sqlite.org/unlock_notify.html.

pub mod schema;
mod utils;

use crate::{
    bitcoin::BlockChainTip,
    database::{
        sqlite::{
            schema::{
                DbAddress, DbCoin, DbLabel, DbLabelledKind, DbSpendTransaction, DbTip, DbWallet,
                DbWalletTransaction, SCHEMA,
            },
            utils::{
                create_fresh_db, curr_timestamp, db_exec, db_query, db_tx_query, db_version,
                maybe_apply_migration, LOOK_AHEAD_LIMIT,
            },
        },
        Coin, CoinStatus, LabelItem,
    },
    payjoin::db::SessionId,
};
use liana::descriptors::LianaDescriptor;
use payjoin::{bitcoin::consensus::Encodable, OhttpKeys};

use std::{
    cmp,
    collections::{HashMap, HashSet},
    convert::TryInto,
    fmt, io, path,
};

use miniscript::bitcoin::{
    self, bip32,
    consensus::encode,
    hashes::{sha256, Hash},
    psbt::Psbt,
    secp256k1,
};

const DB_VERSION: i64 = 8;

/// Last database version for which Bitcoin transactions were not stored in database. In practice
/// this meant we relied on the bitcoind watchonly wallet to store them for us.
pub const MAX_DB_VERSION_NO_TX_DB: i64 = 4;

#[derive(Debug)]
pub enum SqliteDbError {
    FileCreation(io::Error),
    FileNotFound(path::PathBuf),
    UnsupportedVersion(i64),
    InvalidNetwork(bitcoin::Network),
    DescriptorMismatch(Box<LianaDescriptor>),
    Rusqlite(rusqlite::Error),
}

impl std::fmt::Display for SqliteDbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::fmt::Result {
        match self {
            SqliteDbError::FileCreation(e) => {
                write!(f, "Error when create SQLite database file: '{}'", e)
            }
            SqliteDbError::FileNotFound(p) => {
                write!(f, "SQLite database file not found at '{}'.", p.display())
            }
            SqliteDbError::UnsupportedVersion(v) => {
                write!(f, "Unsupported database version '{}'.", v)
            }
            SqliteDbError::InvalidNetwork(net) => {
                write!(f, "Database was created for network '{}'.", net)
            }
            SqliteDbError::DescriptorMismatch(desc) => {
                write!(f, "Database descriptor mismatch: '{}'.", desc)
            }
            SqliteDbError::Rusqlite(e) => write!(f, "SQLite error: '{}'", e),
        }
    }
}

impl std::error::Error for SqliteDbError {}

impl From<io::Error> for SqliteDbError {
    fn from(e: io::Error) -> Self {
        SqliteDbError::FileCreation(e)
    }
}

impl From<rusqlite::Error> for SqliteDbError {
    fn from(e: rusqlite::Error) -> Self {
        SqliteDbError::Rusqlite(e)
    }
}

// In Bitcoin land, txids are usually displayed in reverse byte order. This is what rust-bitcoin
// implements as `fmt::Display` for `bitcoin::Txid`. However, we store them as raw bytes in the
// database and it so happens we sometimes have to look for a txid in hex, in which case we want
// the "frontward" hex serialization. This is a hack to implement it.
#[derive(Debug, Clone, Copy)]
struct FrontwardHexTxid(bitcoin::Txid);

impl fmt::Display for FrontwardHexTxid {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{:x}",
            // sha256 isn't displayed in reverse byte order (contrary to sha256d).
            sha256::Hash::from_byte_array(self.0.to_byte_array())
        )
    }
}

#[derive(Debug, Clone)]
pub struct FreshDbOptions {
    pub(self) bitcoind_network: bitcoin::Network,
    pub(self) main_descriptor: LianaDescriptor,
    pub(self) schema: &'static str,
    pub(self) version: i64,
}

impl FreshDbOptions {
    pub fn new(
        bitcoind_network: bitcoin::Network,
        main_descriptor: LianaDescriptor,
    ) -> FreshDbOptions {
        FreshDbOptions {
            bitcoind_network,
            main_descriptor,
            schema: SCHEMA,
            version: DB_VERSION,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteDb {
    db_path: path::PathBuf,
}

impl SqliteDb {
    /// Instantiate an SQLite database either from an existing database file or by creating a fresh
    /// one.
    /// NOTE: don't forget to apply any migration with `maybe_apply_migration` if necessary.
    pub fn new(
        db_path: path::PathBuf,
        fresh_options: Option<FreshDbOptions>,
        secp: &secp256k1::Secp256k1<secp256k1::VerifyOnly>,
    ) -> Result<SqliteDb, SqliteDbError> {
        // Create the database if needed, and make sure the db file exists.
        if let Some(options) = fresh_options {
            create_fresh_db(&db_path, options, secp)?;
            log::info!("Created a fresh database at {}.", db_path.display());
        }
        if !db_path.exists() {
            return Err(SqliteDbError::FileNotFound(db_path));
        }

        log::info!("Checking if the database needs upgrading.");

        Ok(SqliteDb { db_path })
    }

    /// If the database version is older than expected, migrate it to the current version. If
    /// migrating from a database version 4 or earlier, all the wallet Bitcoin transactions must be
    /// passed through the `bitcoin_txs` parameter otherwise the migration will fail.
    pub fn maybe_apply_migrations(
        &self,
        bitcoin_txs: &[bitcoin::Transaction],
    ) -> Result<(), SqliteDbError> {
        maybe_apply_migration(&self.db_path, bitcoin_txs)
    }

    /// Get a new connection to the database.
    pub fn connection(&self) -> Result<SqliteConn, SqliteDbError> {
        let conn = rusqlite::Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(60))?;
        Ok(SqliteConn { conn })
    }

    /// Perform startup sanity checks.
    pub fn sanity_check(
        &self,
        bitcoind_network: bitcoin::Network,
        main_descriptor: &LianaDescriptor,
    ) -> Result<(), SqliteDbError> {
        let mut conn = self.connection()?;

        // At this point any migration must have been applied.
        let db_version = conn.db_version();
        if db_version != DB_VERSION {
            return Err(SqliteDbError::UnsupportedVersion(db_version));
        }

        // The config and the db should be on the same network.
        let db_tip = conn.db_tip();
        if db_tip.network != bitcoind_network {
            return Err(SqliteDbError::InvalidNetwork(db_tip.network));
        }

        // The config and db descriptors must match!
        let db_wallet = conn.db_wallet();
        if &db_wallet.main_descriptor != main_descriptor {
            return Err(SqliteDbError::DescriptorMismatch(
                db_wallet.main_descriptor.into(),
            ));
        }

        Ok(())
    }
}

// We only support single wallet. The id of the wallet row is always 1.
const WALLET_ID: i64 = 1;

pub struct SqliteConn {
    conn: rusqlite::Connection,
}

impl SqliteConn {
    pub fn db_version(&mut self) -> i64 {
        db_version(&mut self.conn).expect("db must not fail")
    }

    /// Get the network tip.
    pub fn db_tip(&mut self) -> DbTip {
        db_query(
            &mut self.conn,
            "SELECT * FROM tip",
            rusqlite::params![],
            |row| row.try_into(),
        )
        .expect("Db must not fail")
        .pop()
        .expect("There is always a row in the tip table")
    }

    /// Get the information about the wallet.
    pub fn db_wallet(&mut self) -> DbWallet {
        db_query(
            &mut self.conn,
            "SELECT * FROM wallets",
            rusqlite::params![],
            |row| row.try_into(),
        )
        .expect("Db must not fail")
        .pop()
        .expect("There is always a row in the wallet table")
    }

    /// Update the network tip.
    pub fn update_tip(&mut self, tip: &BlockChainTip) {
        db_exec(&mut self.conn, |db_tx| {
            db_tx
                .execute(
                    "UPDATE tip SET blockheight = (?1), blockhash = (?2)",
                    rusqlite::params![tip.height, tip.hash[..].to_vec()],
                )
                .map(|_| ())
        })
        .expect("Database must be available")
    }

    /// Set the derivation index for receiving or change addresses.
    ///
    /// This will populate the address->deriv_index mapping with all the new entries between the
    /// former and new gap limit indexes.
    pub fn set_derivation_index(
        &mut self,
        index: bip32::ChildNumber,
        change: bool,
        secp: &secp256k1::Secp256k1<secp256k1::VerifyOnly>,
    ) {
        let network = self.db_tip().network;

        db_exec(&mut self.conn, |db_tx| {
            let db_wallet: DbWallet =
                db_tx_query(db_tx, "SELECT * FROM wallets", rusqlite::params![], |row| {
                    row.try_into()
                })?
                .pop()
                .expect("There is always a row in the wallet table");

            // Make sure we don't set a lower derivation index. This can happen since the
            // derivation is set outside the atomic transaction. So there may be a race between say
            // the Bitcoin poller thread and the JSONRPC commands thread.
            if (change && index <= db_wallet.change_derivation_index) || (!change && index <= db_wallet.deposit_derivation_index) {
                // It was already set at a higher index.
                return Ok(());
            }

            // First of all set the derivation index
            let index_u32: u32 = index.into();
            if change {
                db_tx.execute(
                    "UPDATE wallets SET change_derivation_index = (?1)",
                    rusqlite::params![index_u32],
                )?;
            } else {
                db_tx.execute(
                    "UPDATE wallets SET deposit_derivation_index = (?1)",
                    rusqlite::params![index_u32],
                )?;
            }

            // Now if this new index is higher than the highest of our current derivation indexes,
            // populate the addresses mapping for derivation indexes between our previous "gap
            // limit index" and the new one.
            let curr_highest_index = cmp::max(
                db_wallet.deposit_derivation_index,
                db_wallet.change_derivation_index,
            ).into();
            if index_u32 > curr_highest_index {
                let receive_desc = db_wallet.main_descriptor.receive_descriptor();
                let change_desc = db_wallet.main_descriptor.change_descriptor();

                for index in curr_highest_index + 1..=index_u32 {
                    let la_index = index + LOOK_AHEAD_LIMIT - 1;
                    let receive_addr = receive_desc.derive(la_index.into(), secp).address(network);
                    let change_addr = change_desc.derive(la_index.into(), secp).address(network);
                    db_tx.execute(
                        "INSERT INTO addresses (receive_address, change_address, derivation_index) VALUES (?1, ?2, ?3)",
                        rusqlite::params![receive_addr.to_string(), change_addr.to_string(), la_index],
                    )?;
                }

            }

            Ok(())
        })
        .expect("Database must be available")
    }

    pub fn set_wallet_rescan_timestamp(&mut self, timestamp: u32) {
        db_exec(&mut self.conn, |db_tx| {
            // NOTE: this will need to be updated if we ever implement multi-wallet support
            db_tx
                .execute(
                    "UPDATE wallets SET rescan_timestamp = (?1)",
                    rusqlite::params![timestamp],
                )
                .map(|_| ())
        })
        .expect("Database must be available")
    }

    /// Drop the rescan timestamp, and set it as the wallet creation timestamp if it
    /// predates it.
    ///
    /// # Panics
    /// - If called while rescan_timestamp is not set
    pub fn complete_wallet_rescan(&mut self) {
        let db_wallet = self.db_wallet();
        let new_timestamp = cmp::min(
            db_wallet.rescan_timestamp.expect("Must be set"),
            db_wallet.timestamp,
        );

        db_exec(&mut self.conn, |db_tx| {
            // NOTE: this will need to be updated if we ever implement multi-wallet support
            db_tx
                .execute(
                    "UPDATE wallets SET timestamp = (?1), rescan_timestamp = NULL",
                    rusqlite::params![new_timestamp],
                )
                .map(|_| ())
        })
        .expect("Database must be available");
    }

    // Sqlite supports i64 integers so we use u32 for the timestamp.
    /// Set the last poll timestamp, where `timestamp` is seconds since UNIX epoch.
    pub fn set_wallet_last_poll_timestamp(&mut self, timestamp: u32) -> Result<(), SqliteDbError> {
        db_exec(&mut self.conn, |db_tx| {
            db_tx
                .execute(
                    "UPDATE wallets SET last_poll_timestamp = (?1) WHERE id = (?2)",
                    rusqlite::params![timestamp, WALLET_ID],
                )
                .map(|_| ())
        })
        .map_err(SqliteDbError::Rusqlite)
    }

    /// Get all the coins from DB, optionally filtered by coin status and/or outpoint.
    pub fn coins(
        &mut self,
        statuses: &[CoinStatus],
        outpoints: &[bitcoin::OutPoint],
    ) -> Vec<DbCoin> {
        let status_condition = statuses
            .iter()
            .map(|c| {
                format!(
                    "({})",
                    match c {
                        CoinStatus::Unconfirmed => {
                            "blocktime IS NULL AND spend_txid IS NULL"
                        }
                        CoinStatus::Confirmed => {
                            "blocktime IS NOT NULL AND spend_txid IS NULL"
                        }
                        CoinStatus::Spending => {
                            "spend_txid IS NOT NULL AND spend_block_time IS NULL"
                        }
                        CoinStatus::Spent => "spend_block_time IS NOT NULL",
                    }
                )
            })
            .collect::<Vec<String>>()
            .join(" OR ");
        // SELECT * FROM coins WHERE (txid, vout) IN ((txidA, voutA), (txidB, voutB));
        let op_condition = if !outpoints.is_empty() {
            let mut cond = "(txid, vout) IN (VALUES ".to_string();
            for (i, outpoint) in outpoints.iter().enumerate() {
                // NOTE: SQLite doesn't know Satoshi decided txids would be displayed as little-endian
                // hex.
                cond += &format!(
                    "(x'{}', {})",
                    FrontwardHexTxid(outpoint.txid),
                    outpoint.vout
                );
                if i != outpoints.len() - 1 {
                    cond += ", ";
                }
            }
            cond += ")";
            cond
        } else {
            String::new()
        };
        let where_clause = if !status_condition.is_empty() && !op_condition.is_empty() {
            format!(" WHERE ({}) AND ({})", status_condition, op_condition)
        } else if status_condition.is_empty() && !op_condition.is_empty() {
            format!(" WHERE {}", op_condition)
        } else if !status_condition.is_empty() && op_condition.is_empty() {
            format!(" WHERE {}", status_condition)
        } else {
            String::new()
        };
        let query = format!("SELECT * FROM coins{}", where_clause);
        db_query(&mut self.conn, &query, rusqlite::params![], |row| {
            row.try_into()
        })
        .expect("Db must not fail")
    }

    /// List coins that are being spent and whose spending transaction is still unconfirmed.
    pub fn list_spending_coins(&mut self) -> Vec<DbCoin> {
        self.coins(&[CoinStatus::Spending], &[])
    }

    // FIXME: don't take the whole coin, we don't need it.
    /// Store new, unconfirmed and unspent, coins.
    /// Will panic if given a coin that is already in DB.
    pub fn new_unspent_coins<'a>(&mut self, coins: impl IntoIterator<Item = &'a Coin>) {
        db_exec(&mut self.conn, |db_tx| {
            for coin in coins {
                let deriv_index: u32 = coin.derivation_index.into();
                db_tx.execute(
                    "INSERT INTO coins (wallet_id, txid, vout, amount_sat, derivation_index, is_change, is_immature) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        WALLET_ID,
                        coin.outpoint.txid[..].to_vec(),
                        coin.outpoint.vout,
                        coin.amount.to_sat(),
                        deriv_index,
                        coin.is_change,
                        coin.is_immature,
                    ],
                )?;
            }
            Ok(())
        })
        .expect("Database must be available")
    }

    pub fn insert_outpoint_seen_before<'a>(
        &mut self,
        outpoints: impl IntoIterator<Item = &'a bitcoin::OutPoint>,
    ) -> bool {
        let mut is_duplicate = false;
        db_exec(&mut self.conn, |db_tx| {
            for outpoint in outpoints {
                let mut buf = Vec::new();
                outpoint
                    .consensus_encode(&mut buf)
                    .expect("Outpoint must encode");
                let affected = db_tx.execute(
                    "INSERT OR IGNORE INTO payjoin_outpoints (outpoint, added_at) \
                        VALUES (?1, ?2)",
                    rusqlite::params![buf, curr_timestamp()],
                )?;

                if affected == 0 {
                    is_duplicate = true
                }
            }
            Ok(())
        })
        .expect("database must be available");

        is_duplicate
    }

    /// Remove a set of coins from the database.
    pub fn remove_coins(&mut self, outpoints: &[bitcoin::OutPoint]) {
        db_exec(&mut self.conn, |db_tx| {
            for outpoint in outpoints {
                db_tx.execute(
                    "DELETE FROM coins WHERE txid = ?1 AND vout = ?2",
                    rusqlite::params![outpoint.txid[..].to_vec(), outpoint.vout,],
                )?;
            }

            Ok(())
        })
        .expect("Database must be available")
    }

    /// Mark a set of coins as confirmed.
    ///
    /// NOTE: this will also mark the coin as mature if it originates from an immature coinbase
    /// deposit.
    pub fn confirm_coins<'a>(
        &mut self,
        outpoints: impl IntoIterator<Item = &'a (bitcoin::OutPoint, i32, u32)>,
    ) {
        db_exec(&mut self.conn, |db_tx| {
            for (outpoint, height, time) in outpoints {
                db_tx.execute(
                    "UPDATE coins SET blockheight = ?1, blocktime = ?2, is_immature = 0 WHERE txid = ?3 AND vout = ?4",
                    rusqlite::params![height, time, outpoint.txid[..].to_vec(), outpoint.vout,],
                )?;
            }

            Ok(())
        })
        .expect("Database must be available")
    }

    /// Mark a set of coins as spending.
    pub fn spend_coins<'a>(
        &mut self,
        outpoints: impl IntoIterator<Item = &'a (bitcoin::OutPoint, bitcoin::Txid)>,
    ) {
        db_exec(&mut self.conn, |db_tx| {
            for (outpoint, spend_txid) in outpoints {
                db_tx.execute(
                    "UPDATE coins SET spend_txid = ?1 WHERE txid = ?2 AND vout = ?3",
                    rusqlite::params![
                        spend_txid[..].to_vec(),
                        outpoint.txid[..].to_vec(),
                        outpoint.vout,
                    ],
                )?;
            }

            Ok(())
        })
        .expect("Database must be available")
    }

    /// Mark a set of coins as not being spent.
    pub fn unspend_coins<'a>(
        &mut self,
        outpoints: impl IntoIterator<Item = &'a bitcoin::OutPoint>,
    ) {
        db_exec(&mut self.conn, |db_tx| {
            for outpoint in outpoints {
                db_tx.execute(
                    "UPDATE coins SET spend_txid = NULL, spend_block_height = NULL, spend_block_time = NULL WHERE txid = ?1 AND vout = ?2",
                    rusqlite::params![
                        outpoint.txid[..].to_vec(),
                        outpoint.vout,
                    ],
                )?;
            }

            Ok(())
        })
        .expect("Database must be available")
    }

    /// Mark the Spend transaction of a given set of coins as being confirmed at a given
    /// block.
    pub fn confirm_spend<'a>(
        &mut self,
        outpoints: impl IntoIterator<Item = &'a (bitcoin::OutPoint, bitcoin::Txid, i32, u32)>,
    ) {
        db_exec(&mut self.conn, |db_tx| {
            for (outpoint, spend_txid, height, time) in outpoints {
                db_tx.execute(
                    "UPDATE coins SET spend_txid = ?1, spend_block_height = ?2, spend_block_time = ?3 WHERE txid = ?4 AND vout = ?5",
                    rusqlite::params![
                        spend_txid[..].to_vec(),
                        height,
                        time,
                        outpoint.txid[..].to_vec(),
                        outpoint.vout,
                    ],
                )?;
            }

            Ok(())
        })
        .expect("Database must be available")
    }

    pub fn db_address(&mut self, address: &bitcoin::Address) -> Option<DbAddress> {
        db_query(
            &mut self.conn,
            "SELECT * FROM addresses WHERE receive_address = ?1 OR change_address = ?1",
            rusqlite::params![address.to_string()],
            |row| row.try_into(),
        )
        .expect("Db must not fail")
        .pop()
    }

    pub fn db_coins(&mut self, outpoints: &[bitcoin::OutPoint]) -> Vec<DbCoin> {
        self.coins(&[], outpoints)
    }

    pub fn db_spend(&mut self, txid: &bitcoin::Txid) -> Option<DbSpendTransaction> {
        db_query(
            &mut self.conn,
            "SELECT * FROM spend_transactions WHERE txid = ?1",
            rusqlite::params![txid[..].to_vec()],
            |row| row.try_into(),
        )
        .expect("Db must not fail")
        .pop()
    }

    /// Insert a new Spend transaction or replace an existing one.
    pub fn store_spend(&mut self, psbt: &Psbt) {
        let txid = &psbt.unsigned_tx.compute_txid()[..].to_vec();

        db_exec(&mut self.conn, |db_tx| {
            db_tx.execute(
                "INSERT into spend_transactions (psbt, txid, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT DO UPDATE SET psbt=excluded.psbt",
                rusqlite::params![psbt.serialize(), txid, curr_timestamp()],
            )?;
            Ok(())
        })
        .expect("Db must not fail");
    }

    pub fn list_spend(&mut self) -> Vec<DbSpendTransaction> {
        db_query(
            &mut self.conn,
            "SELECT * FROM spend_transactions",
            rusqlite::params![],
            |row| row.try_into(),
        )
        .expect("Db must not fail")
    }

    pub fn update_labels(&mut self, items: &HashMap<LabelItem, Option<String>>) {
        db_exec(&mut self.conn, |db_tx| {
            for (labelled, kind, value) in items
                .iter()
                .map(|(a, v)| {
                     match a {
                         LabelItem::Address(a) =>(a.to_string(), DbLabelledKind::Address, v),
                         LabelItem::Txid(a) =>(a.to_string(), DbLabelledKind::Txid, v),
                         LabelItem::OutPoint(a) =>(a.to_string(), DbLabelledKind::OutPoint, v),
                     }
                }) {
                if let Some(value) = value {
                    db_tx.execute(
                        "INSERT INTO labels (wallet_id, item, item_kind, value) VALUES (?1, ?2, ?3, ?4) \
                        ON CONFLICT DO UPDATE SET value=excluded.value",
                        rusqlite::params![WALLET_ID, labelled, kind as i64, value],
                    )?;
                } else {
                    db_tx.execute(
                        "DELETE FROM labels WHERE wallet_id = ?1 AND item = ?2",
                        rusqlite::params![WALLET_ID, labelled],
                    )?;
                }
            }
            Ok(())
        })
        .expect("Db must not fail")
    }

    pub fn db_labels(&mut self, items: &HashSet<LabelItem>) -> Vec<DbLabel> {
        let query = format!(
            "SELECT * FROM labels where item in ({})",
            items
                .iter()
                .map(|a| format!("'{}'", a))
                .collect::<Vec<String>>()
                .join(",")
        );
        db_query(&mut self.conn, &query, rusqlite::params![], |row| {
            row.try_into()
        })
        .expect("Db must not fail")
    }

    pub fn labels_bip329(&mut self, offset: u32, limit: u32) -> Vec<DbLabel> {
        db_query(
            &mut self.conn,
            "SELECT * FROM labels \
                ORDER BY id \
                LIMIT ?1 OFFSET ?2",
            rusqlite::params![limit, offset],
            |row| row.try_into(),
        )
        .expect("Db must not fail")
    }

    /// Retrieves a limited and ordered list of transactions ids that happened during the given
    /// range.
    pub fn db_list_txids(&mut self, start: u32, end: u32, limit: u64) -> Vec<bitcoin::Txid> {
        db_query(
            &mut self.conn,
            "SELECT DISTINCT(txid) FROM ( \
                SELECT * from ( \
                    SELECT txid, blocktime AS date FROM coins \
                    WHERE blocktime >= (?1) \
                    AND blocktime <= (?2) \
                    ORDER BY blocktime \
                ) \
                UNION \
                SELECT * FROM (
                    SELECT spend_txid AS txid, spend_block_time AS date FROM coins \
                    WHERE spend_block_time >= (?1) \
                    AND spend_block_time <= (?2) \
                    ORDER BY spend_block_time \
                ) \
                ORDER BY date DESC LIMIT (?3) \
            )",
            rusqlite::params![start, end, limit],
            |row| {
                let txid: Vec<u8> = row.get(0)?;
                let txid: bitcoin::Txid =
                    encode::deserialize(&txid).expect("We only store valid txids");
                Ok(txid)
            },
        )
        .expect("Db must not fail")
    }

    /// Retrieves all txids from the transactions table whether or not they are referenced by a coin.
    pub fn db_list_saved_txids(&mut self) -> Vec<bitcoin::Txid> {
        db_query(
            &mut self.conn,
            "SELECT txid FROM transactions",
            rusqlite::params![],
            |row| {
                let txid: Vec<u8> = row.get(0)?;
                let txid: bitcoin::Txid =
                    encode::deserialize(&txid).expect("We only store valid txids");
                Ok(txid)
            },
        )
        .expect("Db must not fail")
    }

    pub fn db_list_all_txids(&mut self) -> Vec<bitcoin::Txid> {
        db_query(
            &mut self.conn,
            "
            SELECT txid AS id
            FROM coins
            UNION
            SELECT spend_txid AS id
            FROM coins
            WHERE spend_txid IS NOT NULL
            ",
            rusqlite::params![],
            |row| {
                let txid: Vec<u8> = row.get(0)?;
                let txid: bitcoin::Txid =
                    encode::deserialize(&txid).expect("We only store valid txids");
                Ok(txid)
            },
        )
        .expect("Db must not fail")
    }

    /// Store transactions in database, ignoring any that already exist.
    pub fn new_txs(&mut self, txs: &[bitcoin::Transaction]) {
        db_exec(&mut self.conn, |db_tx| {
            for tx in txs {
                let txid = &tx.compute_txid()[..].to_vec();
                let tx_ser = bitcoin::consensus::serialize(tx);
                db_tx.execute(
                    "INSERT INTO transactions (txid, tx, num_inputs, num_outputs, is_coinbase) \
                        VALUES (?1, ?2, ?3, ?4, ?5) \
                        ON CONFLICT DO NOTHING",
                    rusqlite::params![
                        txid,
                        tx_ser,
                        tx.input.len(),
                        tx.output.len(),
                        tx.is_coinbase()
                    ],
                )?;
            }
            Ok(())
        })
        .expect("Database must be available")
    }

    /// Update `is_from_self` in coins table for all unconfirmed coins
    /// and those confirmed after `prev_tip_height`.
    ///
    /// This only sets the value to true as we do not expect the value
    /// to change from true to false. In case of a reorg, the value
    /// for all unconfirmed coins should be set to false before this
    /// method is called.
    pub fn update_coins_from_self(&mut self, prev_tip_height: i32) -> Result<(), rusqlite::Error> {
        db_exec(&mut self.conn, |db_tx| {
            // Given the requirement for unconfirmed coins that all ancestors
            // be from self, we perform the update in a loop until no further
            // rows are updated in order to iterate over the unconfirmed coins.
            // Although we don't expect any unconfirmed transaction to have
            // more than 25 in-mempool descendants including itself, there
            // could be more descendants in the DB following a reorg and a
            // rollback of the tip. The max number of iterations would be
            // one per unconfirmed coin not from self plus one for all
            // confirmed coins.
            // In any case, the query only sets `is_from_self` to 1 for
            // those coins with value 0 and so the number of rows affected
            // by each iteration must become 0.
            let max_iterations = {
                let num_unconfirmed: u64 = db_tx.query_row(
                    "SELECT COUNT(*) FROM coins
                    WHERE blockheight IS NULL AND is_from_self = 0",
                    [],
                    |row| row.get(0),
                )?;
                // Add 1 for the confirmed coins, which will all
                // be updated in the first iteration, and another 1
                // as a final check there's nothing left to update.
                num_unconfirmed.checked_add(2).expect("must fit")
            };
            log::debug!(
                "Updating is_from_self in up to {} iterations..",
                max_iterations
            );
            let mut updated = 0;
            for i in 0..max_iterations {
                updated = db_tx.execute(
                    "
                    UPDATE coins
                    SET is_from_self = 1
                    FROM transactions t
                        INNER JOIN (
                            SELECT
                                spend_txid,
                                SUM(
                                    CASE
                                        WHEN blockheight IS NOT NULL THEN 1
                                        -- If the spending coin is unconfirmed, only count
                                        -- it as an input coin if it is from self.
                                        WHEN blockheight IS NULL AND is_from_self = 1 THEN 1
                                        ELSE 0
                                    END
                                ) AS cnt
                            FROM coins
                            WHERE spend_txid IS NOT NULL
                            -- We only need to consider spend transactions that are
                            -- unconfirmed or confirmed after `prev_tip_height
                            -- as only these transactions will affect the coins that
                            -- we are updating.
                            AND (spend_block_height IS NULL OR spend_block_height > ?1)
                            GROUP BY spend_txid
                        ) spends
                        ON t.txid = spends.spend_txid AND t.num_inputs = spends.cnt
                    WHERE coins.txid = t.txid
                    AND (coins.blockheight IS NULL OR coins.blockheight > ?1)
                    AND coins.is_from_self = 0
                    ",
                    [prev_tip_height],
                )?;
                if updated == 0 {
                    log::debug!("Finished updating is_from_self in {} iterations.", i + 1);
                    break;
                }
            }
            assert_eq!(
                updated, 0,
                "no rows expected to be updated on final iteration while updating is_from_self",
            );
            Ok(())
        })
    }

    pub fn list_wallet_transactions(
        &mut self,
        txids: &[bitcoin::Txid],
    ) -> Vec<DbWalletTransaction> {
        // The UNION will remove duplicates.
        // We assume that a transaction's block info is the same in every coins row
        // it appears in.
        let query = format!(
            "SELECT t.tx, c.blockheight, c.blocktime \
            FROM transactions t \
            INNER JOIN ( \
                SELECT txid, blockheight, blocktime \
                FROM coins \
                WHERE wallet_id = {WALLET_ID} \
                UNION \
                SELECT spend_txid, spend_block_height, spend_block_time \
                FROM coins \
                WHERE wallet_id = {WALLET_ID} \
                AND spend_txid IS NOT NULL \
            ) c ON t.txid = c.txid \
            WHERE t.txid in ({})",
            txids
                .iter()
                .map(|txid| format!("x'{}'", FrontwardHexTxid(*txid)))
                .collect::<Vec<_>>()
                .join(",")
        );
        let w_txs: Vec<DbWalletTransaction> =
            db_query(&mut self.conn, &query, rusqlite::params![], |row| {
                row.try_into()
            })
            .expect("Db must not fail");
        debug_assert_eq!(
            w_txs.len(),
            w_txs
                .iter()
                .map(|t| t.transaction.compute_txid())
                .collect::<HashSet<_>>()
                .len(),
            "database must not contain inconsistent block info for the same txid"
        );
        w_txs
    }

    pub fn delete_spend(&mut self, txid: &bitcoin::Txid) {
        db_exec(&mut self.conn, |db_tx| {
            db_tx.execute(
                "DELETE FROM spend_transactions WHERE txid = ?1",
                rusqlite::params![txid[..].to_vec()],
            )?;
            Ok(())
        })
        .expect("Db must not fail");
    }

    // TODO: mark coinbase deposits that were mature and became immature as such.
    /// Unconfirm all data that was marked as being confirmed *after* the given chain
    /// tip, and set it as our new best block seen.
    ///
    /// This includes:
    /// - Coins (coinbase deposits that became immature isn't currently implemented)
    /// - Spending transactions confirmation
    /// - Tip
    ///
    /// The `is_from_self` value for all unconfirmed coins following the rollback is
    /// set to false. This is because this value depends on the confirmation status
    /// of ancestor coins and so will need to be re-evaluated.
    ///
    /// This will have to be updated if we are to add new fields based on block data
    /// in the database eventually.
    pub fn rollback_tip(&mut self, new_tip: &BlockChainTip) {
        db_exec(&mut self.conn, |db_tx| {
            db_tx.execute(
                "UPDATE coins SET blockheight = NULL, blocktime = NULL, spend_block_height = NULL, spend_block_time = NULL WHERE blockheight > ?1",
                rusqlite::params![new_tip.height],
            )?;
            db_tx.execute(
                "UPDATE coins SET spend_block_height = NULL, spend_block_time = NULL WHERE spend_block_height > ?1",
                rusqlite::params![new_tip.height],
            )?;
            // This statement must be run after updating `blockheight` above so that it includes coins
            // that become unconfirmed following the rollback.
            db_tx.execute(
                "UPDATE coins SET is_from_self = 0 WHERE blockheight IS NULL",
                rusqlite::params![],
            )?;
            db_tx.execute(
                "UPDATE tip SET blockheight = (?1), blockhash = (?2)",
                rusqlite::params![new_tip.height, new_tip.hash[..].to_vec()],
            )?;
            Ok(())
        })
        .expect("Db must not fail");
    }

    /// Fetch Payjoin OHttpKeys and their timestamp
    pub fn payjoin_get_ohttp_keys(&mut self, relay_url: &str) -> Option<(u32, OhttpKeys)> {
        let entries = db_query(
            &mut self.conn,
            "SELECT timestamp, key FROM payjoin_ohttp_keys WHERE relay_url = ?1 ORDER BY timestamp DESC LIMIT 1",
            rusqlite::params![relay_url],
            |row| {
                let timestamp: u32 = row.get(0)?;
                let ohttp_keys_ser: Vec<u8> = row.get(1)?;
                let ohttp_keys = OhttpKeys::decode(&ohttp_keys_ser).unwrap();
                Ok((timestamp, ohttp_keys))
            },
        )
        .expect("Db must not fail");

        // Check timestamp (7-days)
        if let Some(entry) = entries.first().cloned() {
            let now = curr_timestamp();
            let seven_days_ago = now.saturating_sub(7 * 24 * 60 * 60);
            if entry.0 < seven_days_ago {
                // Delete entry
                db_exec(&mut self.conn, |db_tx| {
                    db_tx.execute(
                        "DELETE FROM payjoin_ohttp_keys WHERE relay_url = ?1",
                        rusqlite::params![relay_url],
                    )?;
                    Ok(())
                })
                .expect("Db must not fail");
                return None;
            } else {
                return Some(entry);
            }
        }
        None
    }

    /// Store new OHttpKeys with timestamp
    pub fn payjoin_save_ohttp_keys(&mut self, relay_url: &str, ohttp_keys: OhttpKeys) {
        let ohttp_keys_ser = ohttp_keys.encode().unwrap();
        db_exec(&mut self.conn, |db_tx| {
            db_tx.execute(
                "INSERT INTO payjoin_ohttp_keys (relay_url, timestamp, key) VALUES (?1, ?2, ?3)",
                rusqlite::params![relay_url, curr_timestamp(), ohttp_keys_ser],
            )?;
            Ok(())
        })
        .expect("Db must not fail");
    }

    /// Create new Receiver Session
    pub fn save_new_payjoin_receiver_session(&mut self) -> i64 {
        // TODO: is there a more elegant way to get the last insert row id atomically?
        let mut id = 0i64;
        db_exec(&mut self.conn, |db_tx| {
            db_tx.execute(
                "INSERT INTO payjoin_receivers (created_at) VALUES (?1)",
                rusqlite::params![curr_timestamp()],
            )?;

            id = db_tx.last_insert_rowid();
            Ok(())
        })
        .expect("Db must not fail");
        id
    }

    /// Get all active receiver session ids
    pub fn get_all_active_receiver_session_ids(&mut self) -> Vec<SessionId> {
        db_query(
            &mut self.conn,
            "SELECT id FROM payjoin_receivers WHERE completed_at IS NULL",
            rusqlite::params![],
            |row| {
                let id: i64 = row.get(0)?;
                Ok(SessionId::new(id))
            },
        )
        .expect("Db must not fail")
    }

    /// Save a Receiver Session Event
    pub fn save_receiver_session_event(&mut self, session_id: &SessionId, event: Vec<u8>) {
        db_exec(&mut self.conn, |db_tx| {
            db_tx.execute(
                "INSERT INTO payjoin_receiver_events (session_id, created_at, event) VALUES (?1, ?2, ?3)",
                rusqlite::params![session_id.0, curr_timestamp(), event],
            )?;
            Ok(())
        })
        .expect("Db must not fail");
    }

    /// Update completed at timestamp for a Receiver Session
    pub fn update_receiver_session_completed_at(&mut self, session_id: &SessionId) {
        db_exec(&mut self.conn, |db_tx| {
            db_tx.execute(
                "UPDATE payjoin_receivers SET completed_at = ?1 WHERE id = ?2",
                rusqlite::params![curr_timestamp(), session_id.0],
            )?;
            Ok(())
        })
        .expect("Db must not fail");
    }

    /// Load all receiver session events for a particular session id
    pub fn load_receiver_session_events(&mut self, session_id: &SessionId) -> Vec<Vec<u8>> {
        db_query(
            &mut self.conn,
            "SELECT event FROM payjoin_receiver_events WHERE session_id = ?1 ORDER BY created_at ASC",
            rusqlite::params![session_id.0],
            |row| {
                let event: Vec<u8> = row.get(0)?;
                Ok(event)
            },
        )
        .expect("Db must not fail")
    }

    /// Save original txid for a sender session
    pub fn update_receiver_session_original_txid(
        &mut self,
        session_id: &SessionId,
        original_txid: &bitcoin::Txid,
    ) {
        db_exec(&mut self.conn, |db_tx| {
            db_tx.execute(
                "UPDATE payjoin_receivers SET original_txid = ?1 WHERE id = ?2",
                rusqlite::params![original_txid[..].to_vec(), session_id.0],
            )?;
            Ok(())
        })
        .expect("Db must not fail");
    }

    /// Save proposed txid for a sender session
    pub fn update_receiver_session_proposed_txid(
        &mut self,
        session_id: &SessionId,
        proposed_txid: &bitcoin::Txid,
    ) {
        db_exec(&mut self.conn, |db_tx| {
            db_tx.execute(
                "UPDATE payjoin_receivers SET proposed_txid = ?1 WHERE id = ?2",
                rusqlite::params![proposed_txid[..].to_vec(), session_id.0],
            )?;
            Ok(())
        })
        .expect("Db must not fail");
    }

    /// Get receiver session id from txid -- this will return the session id if the txid is a proposed payjoin txid or the original txid
    pub fn get_payjoin_receiver_session_id(&mut self, txid: &bitcoin::Txid) -> Option<SessionId> {
        // TODO: This should always be one row.
        let session_id = db_query(
            &mut self.conn,
            "SELECT id FROM payjoin_receivers WHERE proposed_txid = ?1 or original_txid = ?1",
            rusqlite::params![txid[..].to_vec()],
            |row| {
                let id: i64 = row.get(0)?;
                Ok(SessionId::new(id))
            },
        )
        .expect("Db must not fail");
        session_id.first().cloned()
    }

    pub fn save_new_payjoin_sender_session(&mut self, original_txid: &bitcoin::Txid) -> i64 {
        let mut id = 0i64;
        db_exec(&mut self.conn, |db_tx| {
            db_tx.execute(
                "INSERT INTO payjoin_senders (created_at, original_txid) VALUES (?1, ?2)",
                rusqlite::params![curr_timestamp(), original_txid[..].to_vec()],
            )?;
            id = db_tx.last_insert_rowid();
            Ok(())
        })
        .expect("Db must not fail");
        id
    }

    /// Get all active sender session ids
    pub fn get_all_active_sender_session_ids(&mut self) -> Vec<SessionId> {
        db_query(
            &mut self.conn,
            "SELECT id FROM payjoin_senders WHERE completed_at IS NULL",
            rusqlite::params![],
            |row| {
                let id: i64 = row.get(0)?;
                Ok(SessionId::new(id))
            },
        )
        .expect("Db must not fail")
    }

    pub fn save_sender_session_event(&mut self, session_id: &SessionId, event: Vec<u8>) {
        db_exec(&mut self.conn, |db_tx| {
            db_tx.execute(
                "INSERT INTO payjoin_sender_events (session_id, created_at, event) VALUES (?1, ?2, ?3)",
                rusqlite::params![session_id.0, curr_timestamp(), event],
            )?;
            Ok(())
        })
        .expect("Db must not fail");
    }

    pub fn update_sender_session_completed_at(&mut self, session_id: &SessionId) {
        db_exec(&mut self.conn, |db_tx| {
            db_tx.execute(
                "UPDATE payjoin_senders SET completed_at = ?1 WHERE id = ?2",
                rusqlite::params![curr_timestamp(), session_id.0],
            )?;
            Ok(())
        })
        .expect("Db must not fail");
    }

    pub fn load_sender_session_events(&mut self, session_id: &SessionId) -> Vec<Vec<u8>> {
        db_query(
            &mut self.conn,
            "SELECT event FROM payjoin_sender_events WHERE session_id = ?1 ORDER BY created_at ASC",
            rusqlite::params![session_id.0],
            |row| {
                let event: Vec<u8> = row.get(0)?;
                Ok(event)
            },
        )
        .expect("Db must not fail")
    }

    /// Save the proposed txid for a sender session
    pub fn save_proposed_payjoin_txid(
        &mut self,
        session_id: &SessionId,
        proposed_txid: &bitcoin::Txid,
    ) {
        db_exec(&mut self.conn, |db_tx| {
            db_tx.execute(
                "UPDATE payjoin_senders SET proposed_txid = ?1 WHERE id = ?2",
                rusqlite::params![proposed_txid[..].to_vec(), session_id.0],
            )?;
            Ok(())
        })
        .expect("Db must not fail");
    }

    /// Get the payjoin session id from a txid
    ///
    /// This will return the session id if the txid is a proposed payjoin txid or the original txid
    pub fn get_payjoin_sender_session_id(&mut self, txid: &bitcoin::Txid) -> Option<SessionId> {
        // TODO: This should always be one row.
        let session_id = db_query(
            &mut self.conn,
            "SELECT id FROM payjoin_senders WHERE proposed_txid = ?1 or original_txid = ?1",
            rusqlite::params![txid[..].to_vec()],
            |row| {
                let id: i64 = row.get(0)?;
                Ok(SessionId::new(id))
            },
        )
        .expect("Db must not fail");
        session_id.first().cloned()
    }
}
