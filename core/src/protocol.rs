//! Wire protocol: JSON objects, one per text frame, tagged by `type`.
//! Client→server and server→client are disjoint unions; unknown inbound
//! types are tolerated. Also the per-connection sink every producer (pump
//! threads, pollers, tmux monitor, error paths) writes through; a single
//! consumer drains it onto the socket, which is what keeps frames whole.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Outbound frames buffered per connection before the writer task drains
/// them onto the socket.
pub const OUTBOUND_CAP: usize = 256;

/// Client→server control messages (spec'd surface; anything else decodes to
/// `Unknown` and is answered with a non-fatal error frame).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Create {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tmux_session_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tmux_window_index: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Input { session_id: String, data: String },
    #[serde(rename_all = "camelCase")]
    Resize {
        /// Empty means "the single session, if unambiguous" (legacy clients).
        #[serde(default)]
        session_id: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename_all = "camelCase")]
    Close { session_id: String },
    /// Semantic alias of close for tmux-attached sessions; cleanup is
    /// identical, the frontend just renders it differently.
    #[serde(rename_all = "camelCase")]
    Detach { session_id: String },
    /// Retune the tmux monitor poll interval (milliseconds, clamped
    /// server-side to [500, 30000]).
    TmuxConfig { interval: u64 },
    ListTmuxSessions,
    #[serde(other)]
    Unknown,
}

/// Server→client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    SessionCreated {
        session_id: String,
        shell_type: String,
        /// Displayable name, e.g. "bash-1".
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tmux_session_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tmux_window_index: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Output { session_id: String, data: String },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        error: String,
    },
    /// Consolidated per-tick delta: session id → tmux session name, empty
    /// string meaning detached.
    #[serde(rename_all = "camelCase")]
    TmuxStatus {
        tmux_updates: BTreeMap<String, String>,
    },
    TmuxSessions {
        sessions: Vec<TmuxSessionDescriptor>,
    },
    #[serde(rename_all = "camelCase")]
    CwdUpdate { session_id: String, cwd: String },
}

/// One tmux session as seen by the monitor's latest snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TmuxSessionDescriptor {
    pub name: String,
    /// Attached tmux clients (any terminal, not just trex).
    pub clients: u32,
    /// Ids of trex sessions currently viewing this tmux session.
    pub viewers: Vec<String>,
}

/// REST-shaped snapshot of one session (`GET /api/sessions`). Field set per
/// spec §6.4; marshal/unmarshal is lossless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub shell_type: String,
    pub status: String,
    pub created_at: String,
    pub tty_path: String,
    pub owner: String,
    pub tmux_session_name: String,
    pub cwd: String,
    pub pid: u32,
    pub last_activity_at: String,
}

/// Clonable handle onto one connection's serialized write path. Every frame
/// for that client goes through here; the receiving half is drained by a
/// single writer task that owns the socket sink.
#[derive(Clone)]
pub struct ClientSink {
    conn_id: u64,
    tx: mpsc::Sender<ServerMessage>,
}

impl ClientSink {
    pub fn new(conn_id: u64) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAP);
        (Self { conn_id, tx }, rx)
    }

    /// Identity of the owning connection; the tmux monitor groups deltas by
    /// this so a client gets one consolidated frame per tick.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Enqueue a frame. `false` means the connection is gone.
    pub async fn send(&self, msg: ServerMessage) -> bool {
        self.tx.send(msg).await.is_ok()
    }

    /// Enqueue from a blocking thread (the PTY read pump).
    pub fn blocking_send(&self, msg: ServerMessage) -> bool {
        self.tx.blocking_send(msg).is_ok()
    }
}
