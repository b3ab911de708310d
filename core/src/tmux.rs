//! tmux attachment tracking. A detector capability wraps the tmux client
//! enumeration (argv invocation, per-call timeout); the monitor polls it,
//! joins the result against the registry on the PTY device path, applies
//! per-session deltas and delivers one consolidated status frame per
//! connection per tick. The gateway only observes tmux, never manages it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::TmuxSessionDescriptor;
use crate::registry::SessionRegistry;
use crate::session::Session;

/// Poll interval clamp bounds (also applied to `tmux_config` requests).
pub const MIN_POLL_MS: u64 = 500;
pub const MAX_POLL_MS: u64 = 30_000;

/// Per-invocation timeout for the client listing.
pub const LIST_CLIENTS_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep used after three consecutive detector failures, until one success.
const BACKOFF: Duration = Duration::from_secs(30);
const BACKOFF_AFTER_FAILURES: u32 = 3;

/// Clamp a requested poll interval (milliseconds) to [500 ms, 30 s].
pub fn clamp_poll_interval(ms: u64) -> Duration {
    Duration::from_millis(ms.clamp(MIN_POLL_MS, MAX_POLL_MS))
}

/// tmux session names accepted at create time: 1–256 printable characters,
/// no C0 controls, no DEL.
pub fn valid_tmux_session_name(name: &str) -> bool {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| {
        Regex::new(r"^[^\x00-\x1f\x7f]{1,256}$").expect("tmux name regex")
    });
    re.is_match(name)
}

#[derive(Debug, thiserror::Error)]
pub enum TmuxError {
    #[error("tmux invocation timed out")]
    Timeout,
    #[error("tmux invocation failed: {0}")]
    Command(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The only thing the monitor knows about tmux. The real implementation
/// shells out; tests script a fake. `list_clients` yields
/// `{tty_path → tmux_session_name}` for every attached tmux client.
#[async_trait]
pub trait TmuxDetector: Send + Sync {
    async fn is_available(&self) -> bool;
    async fn list_clients(&self) -> Result<HashMap<String, String>, TmuxError>;
}

/// Subprocess-backed detector. Argument vectors only, never shell strings.
pub struct TmuxCommandDetector {
    timeout: Duration,
}

impl Default for TmuxCommandDetector {
    fn default() -> Self {
        Self {
            timeout: LIST_CLIENTS_TIMEOUT,
        }
    }
}

#[async_trait]
impl TmuxDetector for TmuxCommandDetector {
    async fn is_available(&self) -> bool {
        match tokio::process::Command::new("tmux").arg("-V").output().await {
            Ok(out) => out.status.success(),
            Err(_) => false,
        }
    }

    async fn list_clients(&self) -> Result<HashMap<String, String>, TmuxError> {
        let run = tokio::process::Command::new("tmux")
            .args(["list-clients", "-F", "#{client_tty}\t#{session_name}"])
            .output();
        let out = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| TmuxError::Timeout)??;
        if !out.status.success() {
            // "no server running": no clients, not an error.
            return Ok(HashMap::new());
        }
        Ok(parse_client_lines(&String::from_utf8_lossy(&out.stdout)))
    }
}

/// Parse `tty<TAB>session_name` lines; malformed or empty fields are skipped.
pub fn parse_client_lines(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (tty, name) = line.split_once('\t')?;
            let (tty, name) = (tty.trim(), name.trim());
            if tty.is_empty() || name.is_empty() {
                return None;
            }
            Some((tty.to_string(), name.to_string()))
        })
        .collect()
}

/// Scriptable detector for tests: add/remove clients, toggle availability,
/// force failures.
#[cfg(any(test, feature = "test-util"))]
pub struct FakeTmuxDetector {
    clients: Mutex<HashMap<String, String>>,
    available: AtomicBool,
    failing: AtomicBool,
}

#[cfg(any(test, feature = "test-util"))]
impl Default for FakeTmuxDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl FakeTmuxDetector {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            failing: AtomicBool::new(false),
        }
    }

    pub fn add_client(&self, tty_path: &str, session_name: &str) {
        self.clients
            .lock()
            .expect("clients mutex")
            .insert(tty_path.to_string(), session_name.to_string());
    }

    pub fn remove_client(&self, tty_path: &str) {
        self.clients.lock().expect("clients mutex").remove(tty_path);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.available.store(!unavailable, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl TmuxDetector for FakeTmuxDetector {
    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn list_clients(&self) -> Result<HashMap<String, String>, TmuxError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TmuxError::Command("scripted failure".to_string()));
        }
        Ok(self.clients.lock().expect("clients mutex").clone())
    }
}

/// Monitor internals, separated from the timer loop so ticks are directly
/// drivable in tests.
pub struct MonitorCore {
    registry: Arc<SessionRegistry>,
    detector: Arc<dyn TmuxDetector>,
    available: Arc<AtomicBool>,
    snapshot: Arc<Mutex<HashMap<String, String>>>,
    last_names: BTreeSet<String>,
    consecutive_failures: u32,
}

impl MonitorCore {
    pub fn new(registry: Arc<SessionRegistry>, detector: Arc<dyn TmuxDetector>) -> Self {
        Self {
            registry,
            detector,
            available: Arc::new(AtomicBool::new(false)),
            snapshot: Arc::new(Mutex::new(HashMap::new())),
            last_names: BTreeSet::new(),
            consecutive_failures: 0,
        }
    }

    fn backing_off(&self) -> bool {
        self.consecutive_failures >= BACKOFF_AFTER_FAILURES
    }

    /// One poll: availability probe, registry snapshot, client listing,
    /// tty join, delta application, consolidated delivery.
    pub async fn tick(&mut self) {
        let available = self.detector.is_available().await;
        self.available.store(available, Ordering::SeqCst);
        if !available {
            return;
        }

        // Snapshot before the (slow, external) listing; no registry access
        // is held across it.
        let sessions = self.registry.list();

        let clients = match self.detector.list_clients().await {
            Ok(clients) => {
                self.consecutive_failures = 0;
                clients
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.backing_off() {
                    warn!(error = %e, "tmux detector failing; backing off");
                } else {
                    debug!(error = %e, "tmux detector error; skipping tick");
                }
                return;
            }
        };

        let mut changed: Vec<(Arc<Session>, String)> = Vec::new();
        for session in &sessions {
            let current = session.tmux_session_name();
            let next = clients
                .get(session.tty_path())
                .cloned()
                .unwrap_or_default();
            if current != next {
                changed.push((session.clone(), next));
            }
        }

        let names: BTreeSet<String> = clients.values().cloned().collect();
        let names_changed = names != self.last_names;
        self.last_names = names;
        *self.snapshot.lock().expect("snapshot mutex") = clients;

        for (session, next) in &changed {
            session.apply_tmux_name(next);
        }

        // One consolidated tmux_status per owning connection per tick: group
        // the deltas by connection and send through one member session.
        let mut per_conn: BTreeMap<u64, (Arc<Session>, BTreeMap<String, String>)> = BTreeMap::new();
        for (session, next) in changed {
            let entry = per_conn
                .entry(session.conn_id())
                .or_insert_with(|| (session.clone(), BTreeMap::new()));
            entry.1.insert(session.id().to_string(), next);
        }
        for (_, (representative, updates)) in per_conn {
            let _ = representative.send_tmux_status(updates).await;
        }

        if names_changed {
            let descriptors = self.descriptors();
            let mut seen: BTreeSet<u64> = BTreeSet::new();
            for session in &sessions {
                if seen.insert(session.conn_id()) {
                    let _ = session.send_tmux_sessions(descriptors.clone()).await;
                }
            }
        }
    }

    /// Descriptors from the latest snapshot.
    pub fn descriptors(&self) -> Vec<TmuxSessionDescriptor> {
        let snapshot = self.snapshot.lock().expect("snapshot mutex").clone();
        descriptors_from(&snapshot, &self.registry)
    }
}

/// Descriptors for one snapshot: tmux session name, attached client count,
/// and the trex sessions currently viewing it.
fn descriptors_from(
    snapshot: &HashMap<String, String>,
    registry: &SessionRegistry,
) -> Vec<TmuxSessionDescriptor> {
    let mut counts: BTreeMap<String, u32> = BTreeMap::new();
    for name in snapshot.values() {
        *counts.entry(name.clone()).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(name, clients)| {
            let mut viewers: Vec<String> = registry
                .list_by_tmux_session(&name)
                .iter()
                .map(|s| s.id().to_string())
                .collect();
            viewers.sort();
            TmuxSessionDescriptor {
                name,
                clients,
                viewers,
            }
        })
        .collect()
}

/// Control handle for the running monitor: retune the ticker, read cached
/// availability, snapshot descriptors, stop cooperatively.
#[derive(Clone)]
pub struct MonitorHandle {
    interval_tx: Arc<watch::Sender<Duration>>,
    available: Arc<AtomicBool>,
    snapshot: Arc<Mutex<HashMap<String, String>>>,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
}

impl MonitorHandle {
    /// Apply a `tmux_config` interval request; returns the clamped value.
    pub fn set_interval_ms(&self, ms: u64) -> Duration {
        let clamped = clamp_poll_interval(ms);
        let _ = self.interval_tx.send(clamped);
        clamped
    }

    /// Availability as of the latest tick.
    pub fn tmux_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Descriptors from the most recent successful listing.
    pub fn latest_sessions(&self) -> Vec<TmuxSessionDescriptor> {
        let snapshot = self.snapshot.lock().expect("snapshot mutex").clone();
        descriptors_from(&snapshot, &self.registry)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Start the process-wide monitor loop. It sleeps on the (replaceable)
/// ticker, backs off to 30 s after three consecutive detector failures, and
/// exits when the token fires.
pub fn spawn_monitor(
    registry: Arc<SessionRegistry>,
    detector: Arc<dyn TmuxDetector>,
    initial_interval: Duration,
    cancel: CancellationToken,
) -> MonitorHandle {
    let (interval_tx, interval_rx) = watch::channel(initial_interval);
    let mut core = MonitorCore::new(registry.clone(), detector);
    let handle = MonitorHandle {
        interval_tx: Arc::new(interval_tx),
        available: core.available.clone(),
        snapshot: core.snapshot.clone(),
        registry,
        cancel: cancel.clone(),
    };

    tokio::spawn(async move {
        // First tick immediately: availability and the snapshot are useful
        // from startup, not one period in.
        core.tick().await;
        loop {
            let period = if core.backing_off() {
                BACKOFF
            } else {
                *interval_rx.borrow()
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
            core.tick().await;
        }
        debug!("tmux monitor stopped");
    });

    handle
}
