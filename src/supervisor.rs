//! Wraps `sv start|stop|status` (runit) invocations for the services the
//! daemon supervises (SPEC_FULL.md §4.3). Grounded in the general
//! subprocess-wrapping shape the corpus uses for spawning external daemons
//! (`revault-minisafe/gui/src/bitcoind.rs` builds and inspects a
//! `std::process::Command` around a system binary); here the binary is the
//! `sv` control tool rather than bitcoind itself.

use std::process::Command;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Initial,
    Started,
    Stopping,
    Stopped,
}

use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum SupervisorError {
    /// `start()` while the service is mid-`stop()` (§4.3: "illegal when
    /// `stopping`").
    StartWhileStopping,
    BadStartCode(i32),
    BadStartTerm,
    BadStopCode(i32),
    BadStopTerm,
    Io(std::io::Error),
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::StartWhileStopping => write!(f, "cannot start a service that is currently stopping"),
            Self::BadStartCode(c) => write!(f, "`sv start` exited with code {}", c),
            Self::BadStartTerm => write!(f, "`sv start` was terminated by a signal"),
            Self::BadStopCode(c) => write!(f, "`sv stop` exited with code {}", c),
            Self::BadStopTerm => write!(f, "`sv stop` was terminated by a signal"),
            Self::Io(e) => write!(f, "error invoking `sv`: {}", e),
        }
    }
}

impl std::error::Error for SupervisorError {}

impl From<std::io::Error> for SupervisorError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// A single supervised service (a runit service directory name).
pub struct ServiceDescriptor {
    pub name: String,
    /// Max time `stop_wait` will block for before giving up (§4.3).
    pub stop_wait: Duration,
    status: ServiceStatus,
    last_stop_error: Option<String>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, stop_wait: Duration) -> Self {
        ServiceDescriptor {
            name: name.into(),
            stop_wait,
            status: ServiceStatus::Initial,
            last_stop_error: None,
        }
    }

    pub fn status(&self) -> ServiceStatus {
        self.status
    }

    pub fn last_stop_error(&self) -> Option<&str> {
        self.last_stop_error.as_deref()
    }

    /// `sv start <name>`. A nonzero exit code or signal termination is an
    /// error; the service status is advanced to `Started` only on success.
    /// Illegal while the service is `Stopping` (§4.3).
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        if self.status == ServiceStatus::Stopping {
            return Err(SupervisorError::StartWhileStopping);
        }
        let output = Command::new("sv").arg("start").arg(&self.name).output()?;
        match output.status.code() {
            Some(0) => {
                self.status = ServiceStatus::Started;
                Ok(())
            }
            Some(code) => Err(SupervisorError::BadStartCode(code)),
            None => Err(SupervisorError::BadStartTerm),
        }
    }

    /// `sv stop <name>`, fire-and-forget: marks the service `Stopping` and
    /// lets the caller poll `stop_wait` to confirm it actually went down.
    pub fn stop(&mut self) -> Result<(), SupervisorError> {
        let output = Command::new("sv").arg("stop").arg(&self.name).output()?;
        match output.status.code() {
            Some(0) => {
                self.status = ServiceStatus::Stopping;
                Ok(())
            }
            Some(code) => Err(SupervisorError::BadStopCode(code)),
            None => Err(SupervisorError::BadStopTerm),
        }
    }

    /// Poll `sv status <name>` until it reports `down` or `stop_wait`
    /// elapses. Records (and returns) the last-seen error, if any, but
    /// never fails outright: an unresponsive service just stays in
    /// `Stopping` state per §4.3's "no partial-state observation".
    pub fn wait_stopped(&mut self) -> bool {
        let deadline = Instant::now() + self.stop_wait;
        loop {
            match Command::new("sv").arg("status").arg(&self.name).output() {
                Ok(output) => {
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    if stdout.trim_start().starts_with("down:") {
                        self.status = ServiceStatus::Stopped;
                        self.last_stop_error = None;
                        return true;
                    }
                }
                Err(e) => {
                    self.last_stop_error = Some(e.to_string());
                }
            }
            if Instant::now() >= deadline {
                self.last_stop_error.get_or_insert_with(|| {
                    format!("timed out waiting for {} to stop", self.name)
                });
                return false;
            }
            std::thread::sleep(Duration::from_millis(200));
        }
    }
}

/// Owns the fixed set of services the daemon supervises (bitcoind, lnd,
/// tor, and anything else listed in §4.3) and drives them in the
/// shutdown order poweroff requires.
pub struct ServiceSupervisor {
    services: Vec<ServiceDescriptor>,
}

impl ServiceSupervisor {
    pub fn new(services: Vec<ServiceDescriptor>) -> Self {
        ServiceSupervisor { services }
    }

    pub fn services_mut(&mut self) -> &mut [ServiceDescriptor] {
        &mut self.services
    }

    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    pub fn by_name_mut(&mut self, name: &str) -> Option<&mut ServiceDescriptor> {
        self.services.iter_mut().find(|s| s.name == name)
    }
}
