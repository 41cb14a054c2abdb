//! The lnd INI configuration file, mutated under the process-wide lock
//! handed out by `ConfigStore::begin_mutate_lnd_conf` (SPEC_FULL.md §4.2).
//!
//! lnd's config format is a flat INI; we don't pull in an INI crate for it
//! since we only ever emit it wholesale from fixed sections, never parse
//! arbitrary existing content back into a structured form.

use std::fs;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::MutexGuard;

use super::LndUser;

/// Handle to the lnd config file while the process-wide lock is held.
pub struct LndConfMut<'a> {
    _guard: MutexGuard<'a, ()>,
    path: PathBuf,
    owner: Option<LndUser>,
    contents: String,
}

/// Parsed view of the lnd config, returned for callers that only need to
/// inspect it (not currently exercised outside tests, kept small).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LndConfig {
    pub raw: String,
}

impl<'a> LndConfMut<'a> {
    pub(super) fn load(guard: MutexGuard<'a, ()>, path: PathBuf, owner: Option<LndUser>) -> Self {
        let contents = fs::read_to_string(&path).unwrap_or_default();
        LndConfMut {
            _guard: guard,
            path,
            owner,
            contents,
        }
    }

    /// Current raw file content (empty string if the file did not yet exist).
    pub fn raw(&self) -> &str {
        &self.contents
    }

    /// Overwrite the entire file with the fixed set of sections the daemon
    /// needs lnd to run with: `[Application Options]`, `[Bitcoin]`, and
    /// `[Bitcoind]`, plus `[tor]` when a hidden-service hostname is known.
    /// `autounlock` wires the wallet-unlock file generated by
    /// `make_wallet_unlock_file` so lnd starts unattended after a reboot.
    pub fn regenerate(&mut self, bitcoind_rpc_pass: &str, tor_hostname: Option<&str>, autounlock: bool) {
        let mut out = String::new();
        out.push_str("[Application Options]\n");
        out.push_str("debuglevel=info\n");
        out.push_str("maxbackoff=1s\n");
        out.push_str("norest=false\n");
        out.push_str("restlisten=0.0.0.0:8080\n");
        out.push_str("rpclisten=0.0.0.0:10009\n");
        if let Some(hostname) = tor_hostname {
            out.push_str(&format!("tlsextradomain={}\n", hostname));
            out.push_str(&format!("externalhosts={}\n", hostname));
        }
        if autounlock {
            out.push_str("wallet-unlock-password-file=/home/lnd/walletunlock.txt\n");
            out.push_str("wallet-unlock-allow-create=false\n");
        }
        out.push('\n');

        out.push_str("[Bitcoin]\n");
        out.push_str("bitcoin.active=true\n");
        out.push_str("bitcoin.mainnet=true\n");
        out.push_str("bitcoin.node=bitcoind\n");
        out.push('\n');

        out.push_str("[Bitcoind]\n");
        out.push_str("bitcoind.rpchost=127.0.0.1:8332\n");
        out.push_str("bitcoind.rpcuser=ndg\n");
        out.push_str(&format!("bitcoind.rpcpass={}\n", bitcoind_rpc_pass));
        out.push_str("bitcoind.zmqpubrawblock=tcp://127.0.0.1:28332\n");
        out.push_str("bitcoind.zmqpubrawtx=tcp://127.0.0.1:28333\n");
        out.push('\n');

        out.push_str("[Autopilot]\n");
        out.push_str("autopilot.active=false\n");

        if let Some(hostname) = tor_hostname {
            out.push('\n');
            out.push_str("[tor]\n");
            out.push_str("tor.active=true\n");
            out.push_str("tor.skip-proxy-for-clearnet-targets=true\n");
            out.push_str(&format!("tor.hostname={}\n", hostname));
        }

        self.contents = out;
    }

    /// Write the (possibly regenerated) contents back to disk atomically,
    /// mode 0400 and owned by the lnd user when known (§6 "lnd config INI
    /// ... mode 0400").
    pub fn persist(self) -> io::Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let tmp_path = dir.join(format!(
            ".{}.tmp",
            self.path.file_name().and_then(|n| n.to_str()).unwrap_or("lnd.conf")
        ));
        {
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o400)
                .open(&tmp_path)?;
            use std::io::Write;
            f.write_all(self.contents.as_bytes())?;
            f.sync_all()?;
        }
        if let Some(owner) = self.owner {
            let c_path = std::ffi::CString::new(tmp_path.as_os_str().to_string_lossy().as_bytes())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let ret = unsafe { libc::chown(c_path.as_ptr(), owner.uid, owner.gid) };
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        fs::rename(&tmp_path, &self.path)
    }
}
