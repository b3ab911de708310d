//! Scriptable in-memory PTY for tests: stores writes, records resizes and
//! spawn specs, and emits whatever output the test pushes. Substitutable
//! anywhere the native implementation is used.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use super::{Pty, PtyError, PtySystem, SpawnSpec};

/// Hands out [`FakePty`] instances and keeps them reachable for inspection.
pub struct FakePtySystem {
    next: AtomicU32,
    opened: Mutex<Vec<Arc<FakePty>>>,
    fail_open: AtomicBool,
}

impl Default for FakePtySystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePtySystem {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(0),
            opened: Mutex::new(Vec::new()),
            fail_open: AtomicBool::new(false),
        }
    }

    /// Make the next `open` calls fail, scripting PTY allocation errors.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// All PTYs opened so far, in order.
    pub fn opened(&self) -> Vec<Arc<FakePty>> {
        self.opened.lock().expect("opened mutex").clone()
    }
}

impl PtySystem for FakePtySystem {
    fn open(&self) -> Result<Arc<dyn Pty>, PtyError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(PtyError::Open("scripted failure".to_string()));
        }
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let pty = Arc::new(FakePty::new(format!("/dev/pts/{}", 100 + n), 1000 + n));
        self.opened.lock().expect("opened mutex").push(pty.clone());
        Ok(pty)
    }
}

pub struct FakePty {
    tty_path: String,
    assigned_pid: u32,
    pid: AtomicU32,
    written: Mutex<Vec<u8>>,
    resizes: Mutex<Vec<(u16, u16)>>,
    spawned: Mutex<Option<SpawnSpec>>,
    fail_spawn: AtomicBool,
    closed: AtomicBool,
    fg_pgid: Mutex<Option<i32>>,
    output_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    output_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl FakePty {
    pub fn new(tty_path: String, assigned_pid: u32) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tty_path,
            assigned_pid,
            pid: AtomicU32::new(0),
            written: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            spawned: Mutex::new(None),
            fail_spawn: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fg_pgid: Mutex::new(None),
            output_tx: Mutex::new(Some(tx)),
            output_rx: Mutex::new(Some(rx)),
        }
    }

    /// Script output as if the child had written it.
    pub fn emit(&self, data: &[u8]) {
        if let Some(tx) = self.output_tx.lock().expect("tx mutex").as_ref() {
            let _ = tx.send(data.to_vec());
        }
    }

    /// End the output stream (child exit): the reader sees EOF.
    pub fn end_output(&self) {
        drop(self.output_tx.lock().expect("tx mutex").take());
    }

    pub fn set_fail_spawn(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    pub fn set_foreground_pgid(&self, pgid: Option<i32>) {
        *self.fg_pgid.lock().expect("pgid mutex") = pgid;
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().expect("written mutex").clone()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().expect("resizes mutex").clone()
    }

    pub fn spawn_spec(&self) -> Option<SpawnSpec> {
        self.spawned.lock().expect("spawned mutex").clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Pty for FakePty {
    fn tty_path(&self) -> &str {
        &self.tty_path
    }

    fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        let rx = self
            .output_rx
            .lock()
            .expect("rx mutex")
            .take()
            .ok_or(PtyError::Closed)?;
        Ok(Box::new(FakeReader {
            rx,
            buf: VecDeque::new(),
        }))
    }

    fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.written
            .lock()
            .expect("written mutex")
            .extend_from_slice(data);
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.resizes
            .lock()
            .expect("resizes mutex")
            .push((cols, rows));
        Ok(())
    }

    fn start_command(&self, spec: &SpawnSpec) -> Result<u32, PtyError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(PtyError::Spawn("scripted failure".to_string()));
        }
        let mut spawned = self.spawned.lock().expect("spawned mutex");
        if spawned.is_some() {
            return Err(PtyError::Spawn("child already started".to_string()));
        }
        *spawned = Some(spec.clone());
        self.pid.store(self.assigned_pid, Ordering::SeqCst);
        Ok(self.assigned_pid)
    }

    fn pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    fn foreground_process_group(&self) -> Option<i32> {
        *self.fg_pgid.lock().expect("pgid mutex")
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.end_output();
    }
}

/// Blocking reader over the scripted output channel; EOF when the sender is
/// dropped (scripted child exit or close).
struct FakeReader {
    rx: mpsc::Receiver<Vec<u8>>,
    buf: VecDeque<u8>,
}

impl Read for FakeReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if self.buf.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.buf.extend(chunk),
                Err(_) => return Ok(0),
            }
        }
        let n = out.len().min(self.buf.len());
        for slot in out.iter_mut().take(n) {
            *slot = self.buf.pop_front().expect("buffered byte");
        }
        Ok(n)
    }
}
