//! One session: a PTY bound to one client connection. Owns the monotone
//! active → closing → closed state machine, the PTY→client read pump, and
//! the session-scoped senders the pollers and tmux monitor go through.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::protocol::{ClientSink, ServerMessage, SessionInfo, TmuxSessionDescriptor};
use crate::pty::{Pty, PtyError, Utf8Decoder};

/// PTY reads happen in chunks of this size; partial reads are flushed
/// immediately, there is no line buffering.
const READ_BUF_SIZE: usize = 4096;

/// How long `close_gracefully` waits for the read pump to acknowledge
/// closure before marking the session closed regardless.
pub const CLOSE_GRACE: Duration = Duration::from_millis(100);

const STATUS_ACTIVE: u8 = 0;
const STATUS_CLOSING: u8 = 1;
const STATUS_CLOSED: u8 = 2;

/// Observable session states. Transitions are monotone and never reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closing,
    Closed,
}

impl SessionStatus {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATUS_ACTIVE => Self::Active,
            STATUS_CLOSING => Self::Closing,
            _ => Self::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// Displayable default name: "bash-1" for session "s1" of shell_type "bash".
pub fn derived_name(shell_type: &str, id: &str) -> String {
    format!("{}-{}", shell_type, id.trim_start_matches('s'))
}

pub struct Session {
    id: String,
    shell_type: String,
    tty_path: String,
    owner: String,
    default_name: String,
    name: RwLock<String>,
    tmux_session_name: RwLock<String>,
    cwd: RwLock<String>,
    status: AtomicU8,
    created_at: DateTime<Utc>,
    last_activity_ms: AtomicI64,
    pty: Arc<dyn Pty>,
    sink: ClientSink,
    pump_done_tx: watch::Sender<bool>,
    pump_done_rx: watch::Receiver<bool>,
}

impl Session {
    pub fn new(
        id: String,
        shell_type: String,
        owner: String,
        pty: Arc<dyn Pty>,
        sink: ClientSink,
    ) -> Arc<Self> {
        let (pump_done_tx, pump_done_rx) = watch::channel(false);
        let now = Utc::now();
        let default_name = derived_name(&shell_type, &id);
        Arc::new(Self {
            tty_path: pty.tty_path().to_string(),
            name: RwLock::new(default_name.clone()),
            default_name,
            shell_type,
            owner,
            id,
            tmux_session_name: RwLock::new(String::new()),
            cwd: RwLock::new(String::new()),
            status: AtomicU8::new(STATUS_ACTIVE),
            created_at: now,
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            pty,
            sink,
            pump_done_tx,
            pump_done_rx,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn tty_path(&self) -> &str {
        &self.tty_path
    }

    pub fn name(&self) -> String {
        self.name.read().expect("name lock").clone()
    }

    pub fn tmux_session_name(&self) -> String {
        self.tmux_session_name.read().expect("tmux name lock").clone()
    }

    pub fn cwd(&self) -> String {
        self.cwd.read().expect("cwd lock").clone()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_raw(self.status.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.status() == SessionStatus::Active
    }

    pub fn pid(&self) -> u32 {
        self.pty.pid()
    }

    pub fn pty(&self) -> &Arc<dyn Pty> {
        &self.pty
    }

    /// Identity of the owning connection (the serialized write path this
    /// session reports through).
    pub fn conn_id(&self) -> u64 {
        self.sink.conn_id()
    }

    fn touch_activity(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    /// Write client input to the PTY. Silently dropped unless active.
    pub fn write_input(&self, data: &[u8]) -> Result<(), PtyError> {
        if !self.is_running() {
            return Ok(());
        }
        self.pty.write(data)?;
        self.touch_activity();
        Ok(())
    }

    /// Apply a size. Idempotent; applied in arrival order, no coalescing.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if self.status() == SessionStatus::Closed {
            return Ok(());
        }
        self.pty.resize(cols, rows)
    }

    /// Update the tmux attachment. Empty string means detached. While
    /// attached the display name follows the tmux session; on detach it
    /// reverts to the derived default. Returns whether anything changed.
    pub fn apply_tmux_name(&self, tmux_name: &str) -> bool {
        {
            let mut current = self.tmux_session_name.write().expect("tmux name lock");
            if *current == tmux_name {
                return false;
            }
            *current = tmux_name.to_string();
        }
        let mut name = self.name.write().expect("name lock");
        *name = if tmux_name.is_empty() {
            self.default_name.clone()
        } else {
            tmux_name.to_string()
        };
        true
    }

    /// Store a newly detected cwd. Returns false when unchanged, so callers
    /// only emit `cwd_update` on change.
    pub fn set_cwd(&self, cwd: &str) -> bool {
        let mut current = self.cwd.write().expect("cwd lock");
        if *current == cwd {
            return false;
        }
        *current = cwd.to_string();
        true
    }

    pub async fn send_cwd_update(&self, cwd: String) -> bool {
        self.sink
            .send(ServerMessage::CwdUpdate {
                session_id: self.id.clone(),
                cwd,
            })
            .await
    }

    pub async fn send_tmux_status(
        &self,
        updates: std::collections::BTreeMap<String, String>,
    ) -> bool {
        self.sink
            .send(ServerMessage::TmuxStatus {
                tmux_updates: updates,
            })
            .await
    }

    pub async fn send_tmux_sessions(&self, sessions: Vec<TmuxSessionDescriptor>) -> bool {
        self.sink.send(ServerMessage::TmuxSessions { sessions }).await
    }

    /// Completes when the read pump has exited (EOF, read error, or send
    /// failure). Already-completed pumps resolve immediately.
    pub async fn pump_done(&self) {
        let mut rx = self.pump_done_rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// active → closing. False when some other path got there first.
    fn begin_closing(&self) -> bool {
        self.status
            .compare_exchange(
                STATUS_ACTIVE,
                STATUS_CLOSING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Close once: transition out of active, close the PTY (unblocking the
    /// pump), wait a bounded grace for the pump, mark closed. Concurrent
    /// callers all observe the session closed; only one does the work.
    pub async fn close_gracefully(self: &Arc<Self>) {
        if !self.begin_closing() && self.status() == SessionStatus::Closed {
            return;
        }
        // Pty::close is once-only internally, so losing the transition race
        // (e.g. to the pump's EOF path) still converges here.
        let pty = self.pty.clone();
        let _ = tokio::task::spawn_blocking(move || pty.close()).await;
        let _ = tokio::time::timeout(CLOSE_GRACE, self.pump_done()).await;
        self.status.store(STATUS_CLOSED, Ordering::SeqCst);
        debug!(session = %self.id, "session closed");
    }

    /// Long-running PTY→client pump on a dedicated thread. Reads bounded
    /// chunks, tags them with the session id, forwards through the
    /// connection sink. Exits on EOF, read error, or connection loss; an
    /// exit while still active transitions the session to closing (the
    /// protocol for a dying child is silence, not a special frame).
    pub fn spawn_read_pump(self: &Arc<Self>) {
        let session = self.clone();
        let reader = match self.pty.take_reader() {
            Ok(r) => r,
            Err(e) => {
                warn!(session = %self.id, error = %e, "no pty reader; pump not started");
                let _ = self.pump_done_tx.send(true);
                return;
            }
        };
        let builder = std::thread::Builder::new().name(format!("pty-pump-{}", self.id));
        let spawned = builder.spawn(move || {
            let mut reader = reader;
            let mut decoder = Utf8Decoder::new();
            let mut buf = [0u8; READ_BUF_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let text = decoder.decode(&buf[..n]);
                        if text.is_empty() {
                            continue;
                        }
                        session.touch_activity();
                        let sent = session.sink.blocking_send(ServerMessage::Output {
                            session_id: session.id.clone(),
                            data: text,
                        });
                        if !sent {
                            break;
                        }
                    }
                    Err(e) => {
                        // Expected after close (EIO from the torn-down pair);
                        // anything while active means the child side died.
                        if session.is_running() {
                            debug!(session = %session.id, error = %e, "pty read error");
                        }
                        break;
                    }
                }
            }
            let rest = decoder.flush();
            if !rest.is_empty() {
                let _ = session.sink.blocking_send(ServerMessage::Output {
                    session_id: session.id.clone(),
                    data: rest,
                });
            }
            session.begin_closing();
            let _ = session.pump_done_tx.send(true);
        });
        if let Err(e) = spawned {
            warn!(session = %self.id, error = %e, "failed to spawn read pump");
            let _ = self.pump_done_tx.send(true);
        }
    }

    /// Point-in-time snapshot for REST responses.
    pub fn info(&self) -> SessionInfo {
        let last_activity = DateTime::<Utc>::from_timestamp_millis(
            self.last_activity_ms.load(Ordering::SeqCst),
        )
        .unwrap_or(self.created_at);
        SessionInfo {
            id: self.id.clone(),
            name: self.name(),
            shell_type: self.shell_type.clone(),
            status: self.status().as_str().to_string(),
            created_at: self.created_at.to_rfc3339(),
            tty_path: self.tty_path.clone(),
            owner: self.owner.clone(),
            tmux_session_name: self.tmux_session_name(),
            cwd: self.cwd(),
            pid: self.pid(),
            last_activity_at: last_activity.to_rfc3339(),
        }
    }
}
