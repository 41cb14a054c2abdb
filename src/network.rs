//! Assembles the network status report the UI shows (SPEC_FULL.md §4.5):
//! non-loopback IPv4 addresses of UP interfaces plus the wifi connection
//! state, the latter read through `WpaControl`. Enumerating interfaces
//! with raw `libc::getifaddrs` follows the same register directly with
//! `libc` rather than reach for an additional crate style as
//! `liana::daemonize` uses for process primitives.

use std::net::Ipv4Addr;

use crate::reports::NetworkReport;
use crate::wpa::WpaControl;

/// Enumerate non-loopback, UP IPv4 addresses via `getifaddrs(3)`.
fn local_ipv4_addrs() -> Vec<String> {
    let mut addrs = Vec::new();
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return addrs;
    }
    let mut cur = ifap;
    while !cur.is_null() {
        let ifa = unsafe { &*cur };
        let up = ifa.ifa_flags & (libc::IFF_UP as u32) != 0;
        let loopback = ifa.ifa_flags & (libc::IFF_LOOPBACK as u32) != 0;
        if up && !loopback && !ifa.ifa_addr.is_null() {
            let sa = ifa.ifa_addr as *const libc::sockaddr;
            if unsafe { (*sa).sa_family as i32 } == libc::AF_INET {
                let sin = ifa.ifa_addr as *const libc::sockaddr_in;
                let ip = Ipv4Addr::from(unsafe { (*sin).sin_addr.s_addr }.to_ne_bytes());
                addrs.push(ip.to_string());
            }
        }
        cur = ifa.ifa_next;
    }
    unsafe { libc::freeifaddrs(ifap) };
    addrs
}

/// Reads the currently associated SSID out of wpa_supplicant's `STATUS`
/// reply.
fn current_ssid(wpa: &WpaControl) -> Option<String> {
    wpa.current_ssid().ok().flatten()
}

/// Builds a `NetworkReport` for one watcher cycle. `scan` controls whether
/// a fresh wifi scan is triggered first (§4.5: scanning is opt-in per
/// request since it briefly disrupts an active connection).
pub fn build_report(wpa: Option<&WpaControl>, scan: bool) -> NetworkReport {
    let ipaddrs = local_ipv4_addrs();
    let (wifi_ssid, wifi_scan_networks) = match wpa {
        Some(wpa) => {
            if scan {
                let _ = wpa.scan();
                std::thread::sleep(std::time::Duration::from_secs(2));
            }
            let ssid = current_ssid(wpa);
            let networks = wpa
                .scan_results()
                .map(|results| results.into_iter().map(|r| r.ssid).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default();
            (ssid, networks)
        }
        None => (None, Vec::new()),
    };

    NetworkReport {
        ipaddrs,
        wifi_ssid,
        wifi_scan_networks,
    }
}
