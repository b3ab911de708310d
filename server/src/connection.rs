//! Per-connection dispatcher: demultiplexes one WebSocket into any number of
//! sessions. Owns the local session and pending-start maps, the single
//! writer task that serializes every outbound frame, the deferred child
//! start (first resize races a 500 ms fallback, settled by a CAS), the cwd
//! poller, and total teardown when the client hangs up.
//!
//! Lock discipline: registry first, then the local maps, and locks are only
//! ever held to snapshot, never across an await or a write to the socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trex_core::config::Config;
use trex_core::cwd::CwdDetector;
use trex_core::protocol::{ClientMessage, ClientSink, ServerMessage};
use trex_core::pty::{Pty, PtySystem, SpawnSpec};
use trex_core::registry::SessionRegistry;
use trex_core::session::Session;
use trex_core::tmux::{valid_tmux_session_name, MonitorHandle};

/// If no resize has arrived this long after `create`, the child is started
/// at the default 80×24 so background tabs come alive anyway; the client's
/// eventual resize reaches the running shell as a window-change.
pub const FALLBACK_START_DELAY: Duration = Duration::from_millis(500);

/// Cadence of the per-connection working-directory poller.
pub const CWD_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Shared gateway pieces a connection handler needs; cloned per connection.
#[derive(Clone)]
pub struct ConnectionContext {
    pub registry: Arc<SessionRegistry>,
    pub pty_system: Arc<dyn PtySystem>,
    pub cwd_detector: Arc<dyn CwdDetector>,
    pub monitor: MonitorHandle,
    pub config: Arc<Config>,
}

/// A session whose PTY exists but whose child has not launched. The atomic
/// `started` flag is the race arbiter: first resize and fallback timer both
/// try to flip it, exactly one wins and spawns the child.
struct PendingStart {
    pty: Arc<dyn Pty>,
    spec: SpawnSpec,
    started: Arc<AtomicBool>,
}

pub struct ConnectionHandler {
    ctx: ConnectionContext,
    auth_user: String,
    sink: ClientSink,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    pending: Mutex<HashMap<String, Arc<PendingStart>>>,
    cancel: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(
        ctx: ConnectionContext,
        auth_user: String,
        conn_id: u64,
    ) -> (Arc<Self>, tokio::sync::mpsc::Receiver<ServerMessage>) {
        let (sink, rx) = ClientSink::new(conn_id);
        let handler = Arc::new(Self {
            ctx,
            auth_user,
            sink,
            sessions: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });
        (handler, rx)
    }

    async fn send_error(&self, session_id: Option<String>, error: &str) {
        let _ = self
            .sink
            .send(ServerMessage::Error {
                session_id,
                error: error.to_string(),
            })
            .await;
    }

    /// Find a session this connection may touch: the local set first, then
    /// the registry, where a foreign owner is indistinguishable from a
    /// missing session.
    fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        if let Some(session) = self.sessions.lock().expect("sessions mutex").get(id) {
            return Some(session.clone());
        }
        let session = self.ctx.registry.get(id)?;
        if !self.auth_user.is_empty() && session.owner() != self.auth_user {
            return None;
        }
        Some(session)
    }

    fn local_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .expect("sessions mutex")
            .values()
            .cloned()
            .collect()
    }

    pub async fn handle_message(self: &Arc<Self>, msg: ClientMessage) {
        match msg {
            ClientMessage::Create {
                tmux_session_name,
                tmux_window_index,
                cwd,
            } => {
                self.handle_create(tmux_session_name, tmux_window_index, cwd)
                    .await;
            }
            ClientMessage::Input { session_id, data } => {
                self.handle_input(&session_id, data).await;
            }
            ClientMessage::Resize {
                session_id,
                cols,
                rows,
            } => {
                self.handle_resize(&session_id, cols, rows).await;
            }
            ClientMessage::Close { session_id } | ClientMessage::Detach { session_id } => {
                self.handle_close(&session_id).await;
            }
            ClientMessage::TmuxConfig { interval } => {
                let applied = self.ctx.monitor.set_interval_ms(interval);
                debug!(requested_ms = interval, applied = ?applied, "tmux poll retuned");
            }
            ClientMessage::ListTmuxSessions => {
                let _ = self
                    .sink
                    .send(ServerMessage::TmuxSessions {
                        sessions: self.ctx.monitor.latest_sessions(),
                    })
                    .await;
            }
            ClientMessage::Unknown => {
                self.send_error(None, "unknown message type").await;
            }
        }
    }

    /// The create protocol: validate, allocate the PTY (no child), allocate
    /// an id, register, start the pump, acknowledge, then arm the deferred
    /// start.
    async fn handle_create(
        self: &Arc<Self>,
        tmux_session_name: Option<String>,
        tmux_window_index: Option<u32>,
        cwd: Option<String>,
    ) {
        if let Some(ref name) = tmux_session_name {
            if !valid_tmux_session_name(name) {
                self.send_error(None, "invalid tmux session name").await;
                return;
            }
            if !self.ctx.monitor.tmux_available() {
                self.send_error(None, "tmux not available").await;
                return;
            }
        }

        let pty = match self.ctx.pty_system.open() {
            Ok(pty) => pty,
            Err(e) => {
                warn!(error = %e, "pty allocation failed");
                self.send_error(None, "failed to allocate pty").await;
                return;
            }
        };

        let id = self.ctx.registry.next_id();
        let (shell_type, spec) = match tmux_session_name {
            Some(ref name) => (
                "tmux".to_string(),
                SpawnSpec::tmux_attach(name, tmux_window_index),
            ),
            None => {
                let spec = match cwd {
                    Some(ref dir) => SpawnSpec::shell_in_dir(&self.ctx.config.shell, dir),
                    None => SpawnSpec::shell(&self.ctx.config.shell),
                };
                (self.ctx.config.shell_type.clone(), spec)
            }
        };

        let session = Session::new(
            id.clone(),
            shell_type.clone(),
            self.auth_user.clone(),
            pty.clone(),
            self.sink.clone(),
        );
        self.ctx.registry.add(session.clone());
        self.sessions
            .lock()
            .expect("sessions mutex")
            .insert(id.clone(), session.clone());
        let pending = Arc::new(PendingStart {
            pty,
            spec,
            started: Arc::new(AtomicBool::new(false)),
        });
        self.pending
            .lock()
            .expect("pending mutex")
            .insert(id.clone(), pending);

        // Pump first, ack second: the ack frame still precedes any output
        // because both go through the same serialized sink, and the ack is
        // enqueued before the child can exist.
        session.spawn_read_pump();
        self.spawn_pump_watcher(&session);

        let reported_cwd = cwd.clone().unwrap_or_else(|| self.ctx.config.home.clone());
        let _ = self
            .sink
            .send(ServerMessage::SessionCreated {
                session_id: id.clone(),
                shell_type,
                data: session.name(),
                tmux_session_name,
                tmux_window_index,
                cwd: Some(reported_cwd),
            })
            .await;
        info!(session = %id, "session created");

        // Fallback: background tabs never resize, so start the child at the
        // default size once the window for a first resize has passed.
        let handler = self.clone();
        let fallback_id = id;
        tokio::spawn(async move {
            tokio::select! {
                _ = handler.cancel.cancelled() => {}
                _ = tokio::time::sleep(FALLBACK_START_DELAY) => {
                    handler.try_start_pending(&fallback_id, 80, 24).await;
                }
            }
        });
    }

    /// Launch the deferred child if this caller wins the `started` race.
    /// Returns whether this call performed the start.
    async fn try_start_pending(self: &Arc<Self>, id: &str, cols: u16, rows: u16) -> bool {
        let pending = {
            let guard = self.pending.lock().expect("pending mutex");
            match guard.get(id) {
                Some(p) => p.clone(),
                None => return false,
            }
        };
        if pending
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.pending.lock().expect("pending mutex").remove(id);

        if let Err(e) = pending.pty.resize(cols, rows) {
            debug!(session = id, error = %e, "pre-start resize failed");
        }
        let spec = pending.spec.clone();
        let pty = pending.pty.clone();
        let started = tokio::task::spawn_blocking(move || pty.start_command(&spec)).await;
        match started {
            Ok(Ok(pid)) => {
                debug!(session = id, pid, cols, rows, "child started");
                true
            }
            Ok(Err(e)) => {
                // Asynchronous failure path: the session was acknowledged,
                // now it quietly goes away (same protocol as a read error).
                warn!(session = id, error = %e, "child start failed");
                self.cleanup_session(id).await;
                true
            }
            Err(e) => {
                warn!(session = id, error = %e, "child start task failed");
                self.cleanup_session(id).await;
                true
            }
        }
    }

    async fn handle_input(&self, id: &str, data: String) {
        let Some(session) = self.lookup(id) else {
            self.send_error(Some(id.to_string()), "session not found")
                .await;
            return;
        };
        let bytes = data.into_bytes();
        let result =
            tokio::task::spawn_blocking(move || session.write_input(&bytes)).await;
        if let Ok(Err(e)) = result {
            debug!(session = id, error = %e, "pty write failed");
        }
    }

    async fn handle_resize(self: &Arc<Self>, id: &str, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            self.send_error(Some(id.to_string()), "invalid size").await;
            return;
        }
        // Legacy single-session clients omit the id; honor it only when
        // unambiguous.
        let id = if id.is_empty() {
            let local = self.local_sessions();
            match local.as_slice() {
                [only] => only.id().to_string(),
                _ => {
                    debug!(count = local.len(), "ambiguous empty-id resize dropped");
                    return;
                }
            }
        } else {
            id.to_string()
        };

        let Some(session) = self.lookup(&id) else {
            self.send_error(Some(id), "session not found").await;
            return;
        };
        if let Err(e) = session.resize(cols, rows) {
            debug!(session = %id, error = %e, "resize failed");
        }
        // First resize for a pending session is what actually launches the
        // child, at the now-known size.
        self.try_start_pending(&id, cols, rows).await;
    }

    async fn handle_close(&self, id: &str) {
        let Some(session) = self.lookup(id) else {
            self.send_error(Some(id.to_string()), "session not found")
                .await;
            return;
        };
        self.cleanup_session(session.id()).await;
        info!(session = id, "session closed by client");
    }

    /// Remove a session everywhere and close it. Idempotent; every exit path
    /// (explicit close, detach, pump exit, spawn failure, teardown) funnels
    /// through here.
    async fn cleanup_session(&self, id: &str) {
        if let Some(pending) = self.pending.lock().expect("pending mutex").remove(id) {
            // A racing starter that already holds the record loses the CAS.
            pending.started.store(true, Ordering::SeqCst);
        }
        let local = self.sessions.lock().expect("sessions mutex").remove(id);
        let registered = self.ctx.registry.delete(id);
        if let Some(session) = local.or(registered) {
            session.close_gracefully().await;
        }
    }

    /// Watch for the read pump exiting underneath us (child died, PTY error)
    /// and fold it into the common cleanup path.
    fn spawn_pump_watcher(self: &Arc<Self>, session: &Arc<Session>) {
        let handler = self.clone();
        let session = session.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = handler.cancel.cancelled() => {}
                _ = session.pump_done() => {
                    handler.cleanup_session(session.id()).await;
                }
            }
        });
    }

    /// One cwd poll pass: snapshot the local sessions, then detect outside
    /// the lock and report only changes.
    async fn poll_cwd_once(&self) {
        for session in self.local_sessions() {
            if !session.is_running() {
                continue;
            }
            let Some(cwd) = self.ctx.cwd_detector.detect(session.pty().as_ref()) else {
                continue;
            };
            if cwd.is_empty() || !session.set_cwd(&cwd) {
                continue;
            }
            let _ = session.send_cwd_update(cwd).await;
        }
    }

    pub fn spawn_cwd_poller(self: &Arc<Self>) {
        let handler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CWD_POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = handler.cancel.cancelled() => break,
                    _ = ticker.tick() => handler.poll_cwd_once().await,
                }
            }
        });
    }

    /// Total teardown: cancel pollers and watchers, then close and
    /// deregister every owned session.
    pub async fn teardown(&self) {
        self.cancel.cancel();
        let ids: Vec<String> = {
            let guard = self.sessions.lock().expect("sessions mutex");
            guard.keys().cloned().collect()
        };
        for id in ids {
            self.cleanup_session(&id).await;
        }
    }
}

/// Drive one upgraded WebSocket to completion: writer task on one half,
/// dispatch loop on the other, teardown at the end.
pub async fn serve_socket(
    socket: WebSocket,
    ctx: ConnectionContext,
    auth_user: String,
    conn_id: u64,
) {
    info!(conn = conn_id, user = %auth_user, "connection open");
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (handler, mut outbound) = ConnectionHandler::new(ctx, auth_user, conn_id);
    handler.spawn_cwd_poller();

    // The single consumer of the connection's frame channel; nothing else
    // ever writes to the socket.
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let Ok(json) = serde_json::to_string(&msg) else {
                continue;
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(parsed) => handler.handle_message(parsed).await,
                Err(e) => {
                    debug!(conn = conn_id, error = %e, "undecodable frame");
                    handler.send_error(None, "invalid message").await;
                }
            },
            Message::Close(_) => break,
            // Text-framed protocol; pings are answered by axum itself.
            _ => {}
        }
    }

    handler.teardown().await;
    info!(conn = conn_id, "connection closed");
    drop(handler);
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use trex_core::cwd::ScriptedCwdDetector;
    use trex_core::pty::fake::{FakePty, FakePtySystem};
    use trex_core::tmux::{spawn_monitor, FakeTmuxDetector};

    struct Fixture {
        handler: Arc<ConnectionHandler>,
        rx: mpsc::Receiver<ServerMessage>,
        registry: Arc<SessionRegistry>,
        pty_system: Arc<FakePtySystem>,
        cwd: Arc<ScriptedCwdDetector>,
        tmux: Arc<FakeTmuxDetector>,
        cancel: CancellationToken,
    }

    fn fixture(auth_user: &str) -> Fixture {
        fixture_with(auth_user, |_| {})
    }

    fn fixture_with(auth_user: &str, script: impl FnOnce(&FakeTmuxDetector)) -> Fixture {
        let registry = Arc::new(SessionRegistry::new());
        let pty_system = Arc::new(FakePtySystem::new());
        let cwd = Arc::new(ScriptedCwdDetector::new());
        let tmux = Arc::new(FakeTmuxDetector::new());
        script(&tmux);
        let cancel = CancellationToken::new();
        let monitor = spawn_monitor(
            registry.clone(),
            tmux.clone(),
            Duration::from_secs(3600),
            cancel.clone(),
        );
        let ctx = ConnectionContext {
            registry: registry.clone(),
            pty_system: pty_system.clone(),
            cwd_detector: cwd.clone(),
            monitor,
            config: Arc::new(Config::default()),
        };
        let (handler, rx) = ConnectionHandler::new(ctx, auth_user.to_string(), 1);
        Fixture {
            handler,
            rx,
            registry,
            pty_system,
            cwd,
            tmux,
            cancel,
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame within deadline")
            .expect("channel open")
    }

    fn fake_pty(fix: &Fixture, index: usize) -> Arc<FakePty> {
        fix.pty_system.opened()[index].clone()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_acks_before_output() {
        let mut fix = fixture("");
        fix.handler
            .handle_message(ClientMessage::Create {
                tmux_session_name: None,
                tmux_window_index: None,
                cwd: None,
            })
            .await;

        match recv(&mut fix.rx).await {
            ServerMessage::SessionCreated {
                session_id,
                shell_type,
                data,
                cwd,
                ..
            } => {
                assert_eq!(session_id, "s1");
                assert_eq!(shell_type, "sh");
                assert_eq!(data, "sh-1");
                assert_eq!(cwd.as_deref(), Some("/"));
            }
            other => panic!("expected ack, got {other:?}"),
        }
        assert_eq!(fix.registry.count(), 1);

        fake_pty(&fix, 0).emit(b"$ ");
        match recv(&mut fix.rx).await {
            ServerMessage::Output { session_id, data } => {
                assert_eq!(session_id, "s1");
                assert_eq!(data, "$ ");
            }
            other => panic!("expected output, got {other:?}"),
        }
        fix.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn first_resize_starts_child_with_size() {
        let mut fix = fixture("");
        fix.handler
            .handle_message(ClientMessage::Create {
                tmux_session_name: None,
                tmux_window_index: None,
                cwd: None,
            })
            .await;
        recv(&mut fix.rx).await; // ack

        let pty = fake_pty(&fix, 0);
        assert!(pty.spawn_spec().is_none());

        fix.handler
            .handle_message(ClientMessage::Resize {
                session_id: "s1".to_string(),
                cols: 200,
                rows: 50,
            })
            .await;
        let spec = pty.spawn_spec().expect("child spawned");
        assert_eq!(spec.program, "/bin/sh");
        assert!(pty.resizes().contains(&(200, 50)));

        // A second resize must not attempt another start.
        fix.handler
            .handle_message(ClientMessage::Resize {
                session_id: "s1".to_string(),
                cols: 201,
                rows: 51,
            })
            .await;
        assert_eq!(pty.pid(), 1000);
        fix.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_starters_launch_at_most_once() {
        let mut fix = fixture("");
        fix.handler
            .handle_message(ClientMessage::Create {
                tmux_session_name: None,
                tmux_window_index: None,
                cwd: None,
            })
            .await;
        recv(&mut fix.rx).await;
        // Park the fallback timer so the race is strictly between the two
        // explicit starters.
        fix.handler.cancel.cancel();

        let h1 = fix.handler.clone();
        let h2 = fix.handler.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { h1.try_start_pending("s1", 100, 30).await }),
            tokio::spawn(async move { h2.try_start_pending("s1", 80, 24).await }),
        );
        let wins = [a.expect("join"), b.expect("join")]
            .iter()
            .filter(|won| **won)
            .count();
        assert_eq!(wins, 1);
        assert!(fake_pty(&fix, 0).spawn_spec().is_some());
        fix.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fallback_timer_starts_child_at_default_size() {
        let mut fix = fixture("");
        fix.handler
            .handle_message(ClientMessage::Create {
                tmux_session_name: None,
                tmux_window_index: None,
                cwd: None,
            })
            .await;
        recv(&mut fix.rx).await;

        let pty = fake_pty(&fix, 0);
        assert!(pty.spawn_spec().is_none());
        tokio::time::sleep(FALLBACK_START_DELAY + Duration::from_millis(300)).await;
        assert!(pty.spawn_spec().is_some());
        assert!(pty.resizes().contains(&(80, 24)));
        fix.cancel.cancel();
    }

    async fn wait_for_tmux(fix: &Fixture) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !fix.handler.ctx.monitor.tmux_available() {
            assert!(tokio::time::Instant::now() < deadline, "monitor never ticked");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tmux_create_builds_attach_spec() {
        let mut fix = fixture("");
        wait_for_tmux(&fix).await;

        fix.handler
            .handle_message(ClientMessage::Create {
                tmux_session_name: Some("work".to_string()),
                tmux_window_index: Some(2),
                cwd: None,
            })
            .await;
        match recv(&mut fix.rx).await {
            ServerMessage::SessionCreated {
                shell_type,
                tmux_session_name,
                tmux_window_index,
                ..
            } => {
                assert_eq!(shell_type, "tmux");
                assert_eq!(tmux_session_name.as_deref(), Some("work"));
                assert_eq!(tmux_window_index, Some(2));
            }
            other => panic!("expected ack, got {other:?}"),
        }

        fix.handler.try_start_pending("s1", 80, 24).await;
        let spec = fake_pty(&fix, 0).spawn_spec().expect("attach spawned");
        assert_eq!(spec.program, "tmux");
        assert_eq!(
            spec.args,
            vec!["attach".to_string(), "-t".to_string(), "work:2".to_string()]
        );
        assert_eq!(spec.strip_env_prefixes, vec!["TMUX".to_string()]);
        fix.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tmux_create_fails_fast_when_unavailable() {
        let mut fix = fixture_with("", |tmux| tmux.set_unavailable(true));
        fix.handler
            .handle_message(ClientMessage::Create {
                tmux_session_name: Some("work".to_string()),
                tmux_window_index: None,
                cwd: None,
            })
            .await;
        match recv(&mut fix.rx).await {
            ServerMessage::Error { error, .. } => assert_eq!(error, "tmux not available"),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(fix.registry.count(), 0);
        fix.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_tmux_name_rejected_before_allocation() {
        let mut fix = fixture("");
        fix.handler
            .handle_message(ClientMessage::Create {
                tmux_session_name: Some("\x00".to_string()),
                tmux_window_index: None,
                cwd: None,
            })
            .await;
        match recv(&mut fix.rx).await {
            ServerMessage::Error { error, .. } => {
                assert_eq!(error, "invalid tmux session name");
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(fix.registry.count(), 0);
        assert!(fix.pty_system.opened().is_empty());
        fix.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn allocation_failure_leaves_connection_usable() {
        let mut fix = fixture("");
        fix.pty_system.set_fail_open(true);
        fix.handler
            .handle_message(ClientMessage::Create {
                tmux_session_name: None,
                tmux_window_index: None,
                cwd: None,
            })
            .await;
        match recv(&mut fix.rx).await {
            ServerMessage::Error { error, .. } => assert_eq!(error, "failed to allocate pty"),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(fix.registry.count(), 0);

        // Same connection can still create once allocation recovers.
        fix.pty_system.set_fail_open(false);
        fix.handler
            .handle_message(ClientMessage::Create {
                tmux_session_name: None,
                tmux_window_index: None,
                cwd: None,
            })
            .await;
        assert!(matches!(
            recv(&mut fix.rx).await,
            ServerMessage::SessionCreated { .. }
        ));
        assert_eq!(fix.registry.count(), 1);
        fix.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn input_to_unknown_session_is_an_error() {
        let mut fix = fixture("");
        fix.handler
            .handle_message(ClientMessage::Input {
                session_id: "s42".to_string(),
                data: "ls\r".to_string(),
            })
            .await;
        match recv(&mut fix.rx).await {
            ServerMessage::Error { session_id, error } => {
                assert_eq!(session_id.as_deref(), Some("s42"));
                assert_eq!(error, "session not found");
            }
            other => panic!("expected error, got {other:?}"),
        }
        fix.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn input_reaches_started_child() {
        let mut fix = fixture("");
        fix.handler
            .handle_message(ClientMessage::Create {
                tmux_session_name: None,
                tmux_window_index: None,
                cwd: None,
            })
            .await;
        recv(&mut fix.rx).await;
        fix.handler.try_start_pending("s1", 80, 24).await;

        fix.handler
            .handle_message(ClientMessage::Input {
                session_id: "s1".to_string(),
                data: "echo hi\r".to_string(),
            })
            .await;
        assert_eq!(fake_pty(&fix, 0).written(), b"echo hi\r");
        fix.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_resize_id_targets_single_session() {
        let mut fix = fixture("");
        fix.handler
            .handle_message(ClientMessage::Create {
                tmux_session_name: None,
                tmux_window_index: None,
                cwd: None,
            })
            .await;
        recv(&mut fix.rx).await;

        fix.handler
            .handle_message(ClientMessage::Resize {
                session_id: String::new(),
                cols: 120,
                rows: 40,
            })
            .await;
        assert!(fake_pty(&fix, 0).resizes().contains(&(120, 40)));
        fix.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_removes_session_everywhere() {
        let mut fix = fixture("");
        fix.handler
            .handle_message(ClientMessage::Create {
                tmux_session_name: None,
                tmux_window_index: None,
                cwd: None,
            })
            .await;
        recv(&mut fix.rx).await;
        assert_eq!(fix.registry.count(), 1);

        fix.handler
            .handle_message(ClientMessage::Close {
                session_id: "s1".to_string(),
            })
            .await;
        assert_eq!(fix.registry.count(), 0);
        assert!(fake_pty(&fix, 0).is_closed());

        // Closing again reads as not found.
        fix.handler
            .handle_message(ClientMessage::Close {
                session_id: "s1".to_string(),
            })
            .await;
        match recv(&mut fix.rx).await {
            ServerMessage::Error { error, .. } => assert_eq!(error, "session not found"),
            other => panic!("expected error, got {other:?}"),
        }
        fix.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn foreign_owner_is_rendered_not_found() {
        let mut fix = fixture("bob");
        // Seed a session owned by alice directly in the registry.
        let id = fix.registry.next_id();
        let pty = Arc::new(FakePty::new("/dev/pts/300".to_string(), 9));
        let (sink, _alice_rx) = ClientSink::new(2);
        let session = Session::new(id.clone(), "bash".to_string(), "alice".to_string(), pty, sink);
        fix.registry.add(session);

        fix.handler
            .handle_message(ClientMessage::Input {
                session_id: id.clone(),
                data: "whoami\r".to_string(),
            })
            .await;
        match recv(&mut fix.rx).await {
            ServerMessage::Error { error, .. } => assert_eq!(error, "session not found"),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(fix.registry.get(&id).is_some());
        fix.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn spawn_failure_quietly_closes_session() {
        let mut fix = fixture("");
        fix.handler
            .handle_message(ClientMessage::Create {
                tmux_session_name: None,
                tmux_window_index: None,
                cwd: None,
            })
            .await;
        recv(&mut fix.rx).await;
        fake_pty(&fix, 0).set_fail_spawn(true);

        fix.handler.try_start_pending("s1", 80, 24).await;
        assert_eq!(fix.registry.count(), 0);
        assert!(fake_pty(&fix, 0).is_closed());
        fix.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cwd_poller_reports_changes_once() {
        let mut fix = fixture("");
        fix.handler
            .handle_message(ClientMessage::Create {
                tmux_session_name: None,
                tmux_window_index: None,
                cwd: None,
            })
            .await;
        recv(&mut fix.rx).await;

        let tty = fake_pty(&fix, 0).tty_path().to_string();
        fix.cwd.set(&tty, "/srv/app");

        fix.handler.poll_cwd_once().await;
        match recv(&mut fix.rx).await {
            ServerMessage::CwdUpdate { session_id, cwd } => {
                assert_eq!(session_id, "s1");
                assert_eq!(cwd, "/srv/app");
            }
            other => panic!("expected cwd update, got {other:?}"),
        }

        // Unchanged result: no frame.
        fix.handler.poll_cwd_once().await;
        assert!(fix.rx.try_recv().is_err());
        fix.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn teardown_closes_all_owned_sessions() {
        let mut fix = fixture("");
        for _ in 0..3 {
            fix.handler
                .handle_message(ClientMessage::Create {
                    tmux_session_name: None,
                    tmux_window_index: None,
                    cwd: None,
                })
                .await;
            recv(&mut fix.rx).await;
        }
        assert_eq!(fix.registry.count(), 3);

        fix.handler.teardown().await;
        assert_eq!(fix.registry.count(), 0);
        for pty in fix.pty_system.opened() {
            assert!(pty.is_closed());
        }
        fix.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tmux_config_clamps_interval() {
        let fix = fixture("");
        assert_eq!(
            fix.handler.ctx.monitor.set_interval_ms(100),
            Duration::from_millis(500)
        );
        assert_eq!(
            fix.handler.ctx.monitor.set_interval_ms(60_000),
            Duration::from_millis(30_000)
        );
        fix.cancel.cancel();
        let _ = fix.tmux;
    }
}
