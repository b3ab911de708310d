//! PTY adapter: allocate a pseudoterminal pair first, start the child later.
//! The two-phase open/start split exists so the secondary device path is
//! known before any child runs: the tmux monitor joins on that path, and
//! session creation defers the child until the client's first resize arrives.
//! Built on portable-pty; all ioctl-level work stays behind that crate.

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize, SlavePty};

/// Errors from PTY allocation, spawn and I/O.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    Open(String),
    #[error("failed to spawn child: {0}")]
    Spawn(String),
    #[error("pty is closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything needed to launch a child on an already-open PTY: argument
/// vector (never a shell string), environment additions, environment
/// prefixes to strip from the inherited environment, optional working dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub strip_env_prefixes: Vec<String>,
    pub cwd: Option<String>,
}

impl SpawnSpec {
    /// Login shell with TERM/COLORTERM injected so the session is seen as a
    /// modern truecolor terminal (matches xterm.js on the client side).
    pub fn shell(path: &str) -> Self {
        Self {
            program: path.to_string(),
            args: vec!["-l".to_string()],
            env: vec![
                ("TERM".to_string(), "xterm-256color".to_string()),
                ("COLORTERM".to_string(), "truecolor".to_string()),
            ],
            strip_env_prefixes: Vec::new(),
            cwd: None,
        }
    }

    /// Shell started in a specific directory.
    pub fn shell_in_dir(path: &str, dir: &str) -> Self {
        let mut spec = Self::shell(path);
        spec.cwd = Some(dir.to_string());
        spec
    }

    /// `tmux attach -t <name>[:<window>]`. TMUX-prefixed variables are
    /// stripped so nested-attach detection inside tmux behaves correctly.
    pub fn tmux_attach(session_name: &str, window_index: Option<u32>) -> Self {
        let target = match window_index {
            Some(w) => format!("{}:{}", session_name, w),
            None => session_name.to_string(),
        };
        Self {
            program: "tmux".to_string(),
            args: vec!["attach".to_string(), "-t".to_string(), target],
            env: vec![("TERM".to_string(), "xterm-256color".to_string())],
            strip_env_prefixes: vec!["TMUX".to_string()],
            cwd: None,
        }
    }
}

/// Allocates PTYs. The gateway holds one of these; tests substitute
/// `fake::FakePtySystem`.
pub trait PtySystem: Send + Sync {
    fn open(&self) -> Result<std::sync::Arc<dyn Pty>, PtyError>;
}

/// One PTY pair as a byte-oriented duplex with explicit resize and a
/// deferred child start. `pid()` is zero until `start_command` runs.
pub trait Pty: Send + Sync {
    /// Secondary device path, e.g. "/dev/pts/5". Known from `open`, before
    /// any child exists; empty only if the platform cannot report it.
    fn tty_path(&self) -> &str;

    /// Blocking reader over PTY output; the session's pump thread owns it.
    fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError>;

    /// Write bytes to the child's input. Discarded after close.
    fn write(&self, data: &[u8]) -> Result<(), PtyError>;

    /// Apply a new size. Idempotent and cheap; delivers SIGWINCH to a
    /// running child.
    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError>;

    /// Fork/exec the child with the secondary as stdin/stdout/stderr and as
    /// its controlling terminal. At most one child per PTY; returns the pid.
    fn start_command(&self, spec: &SpawnSpec) -> Result<u32, PtyError>;

    fn start_shell(&self, shell: &str) -> Result<u32, PtyError> {
        self.start_command(&SpawnSpec::shell(shell))
    }

    fn start_shell_in_dir(&self, shell: &str, dir: &str) -> Result<u32, PtyError> {
        self.start_command(&SpawnSpec::shell_in_dir(shell, dir))
    }

    /// Child pid; zero before `start_command`.
    fn pid(&self) -> u32;

    /// Foreground process group of the PTY (TIOCGPGRP), for cwd detection.
    fn foreground_process_group(&self) -> Option<i32>;

    /// Close descriptors (the child sees SIGHUP), kill and reap the child.
    /// Once-only; later calls are no-ops, and reads/writes after it are
    /// EOF/discarded respectively.
    fn close(&self);
}

/// The real PTY system.
pub struct NativePtySystem;

impl PtySystem for NativePtySystem {
    fn open(&self) -> Result<std::sync::Arc<dyn Pty>, PtyError> {
        Ok(std::sync::Arc::new(NativePty::open()?))
    }
}

/// portable-pty-backed implementation. The secondary half is parked until
/// `start_command` consumes it; the writer is taken once at open so writes
/// never contend with resize on the master lock.
pub struct NativePty {
    tty_path: String,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    slave: Mutex<Option<Box<dyn SlavePty + Send>>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    pid: AtomicU32,
    closed: AtomicBool,
}

impl NativePty {
    pub fn open() -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Open(e.to_string()))?;

        #[cfg(unix)]
        let tty_path = pair
            .master
            .tty_name()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        #[cfg(not(unix))]
        let tty_path = String::new();

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Open(e.to_string()))?;

        Ok(Self {
            tty_path,
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(Some(writer)),
            slave: Mutex::new(Some(pair.slave)),
            child: Mutex::new(None),
            pid: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        })
    }

    fn command_builder(spec: &SpawnSpec) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&spec.program);
        for arg in &spec.args {
            cmd.arg(arg);
        }
        for prefix in &spec.strip_env_prefixes {
            for (key, _) in std::env::vars() {
                if key.starts_with(prefix.as_str()) {
                    cmd.env_remove(key);
                }
            }
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = spec.cwd {
            cmd.cwd(dir);
        }
        cmd
    }
}

impl Pty for NativePty {
    fn tty_path(&self) -> &str {
        &self.tty_path
    }

    fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        let guard = self.master.lock().expect("master mutex");
        let master = guard.as_ref().ok_or(PtyError::Closed)?;
        master
            .try_clone_reader()
            .map_err(|e| PtyError::Open(e.to_string()))
    }

    fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut guard = self.writer.lock().expect("writer mutex");
        let Some(writer) = guard.as_mut() else {
            return Ok(());
        };
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let guard = self.master.lock().expect("master mutex");
        let master = guard.as_ref().ok_or(PtyError::Closed)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Io(std::io::Error::other(e.to_string())))
    }

    fn start_command(&self, spec: &SpawnSpec) -> Result<u32, PtyError> {
        let slave = self
            .slave
            .lock()
            .expect("slave mutex")
            .take()
            .ok_or_else(|| PtyError::Spawn("child already started".to_string()))?;

        let child = slave
            .spawn_command(Self::command_builder(spec))
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        // The child has inherited the secondary; the master keeps the pair alive.
        drop(slave);

        let pid = child.process_id().unwrap_or(0);
        self.pid.store(pid, Ordering::SeqCst);
        *self.child.lock().expect("child mutex") = Some(child);
        Ok(pid)
    }

    fn pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    fn foreground_process_group(&self) -> Option<i32> {
        #[cfg(unix)]
        {
            let guard = self.master.lock().expect("master mutex");
            guard.as_ref().and_then(|m| m.process_group_leader())
        }
        #[cfg(not(unix))]
        None
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the writer and master closes the descriptor pair: readers
        // unblock with EOF/EIO and the foreground group receives SIGHUP.
        drop(self.writer.lock().expect("writer mutex").take());
        drop(self.master.lock().expect("master mutex").take());
        drop(self.slave.lock().expect("slave mutex").take());
        if let Some(mut child) = self.child.lock().expect("child mutex").take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Stateful UTF-8 decoder for PTY output read in fixed-size chunks. A
/// multi-byte sequence can be split across read boundaries; the incomplete
/// tail is held back and prepended to the next chunk instead of being
/// replaced with U+FFFD.
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Default for Utf8Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self {
            pending: Vec::with_capacity(4),
        }
    }

    /// Decode a chunk, buffering an incomplete trailing sequence. Invalid
    /// bytes mid-chunk become U+FFFD.
    pub fn decode(&mut self, input: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(input);
        match std::str::from_utf8(&data) {
            Ok(s) => s.to_string(),
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                self.pending = data[valid..].to_vec();
                String::from_utf8_lossy(&data[..valid]).into_owned()
            }
            Err(_) => {
                let tail = incomplete_tail_len(&data);
                let keep = data.len() - tail;
                self.pending = data[keep..].to_vec();
                String::from_utf8_lossy(&data[..keep]).into_owned()
            }
        }
    }

    /// Drain whatever is still buffered (EOF); lossy by necessity.
    pub fn flush(&mut self) -> String {
        let data = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&data).into_owned()
    }
}

/// Length of an incomplete UTF-8 sequence at the end of `data`, 0 if the
/// trailing bytes are complete (or completely invalid).
fn incomplete_tail_len(data: &[u8]) -> usize {
    let scan_from = data.len().saturating_sub(3);
    for i in (scan_from..data.len()).rev() {
        let b = data[i];
        if b & 0xC0 != 0x80 {
            let need = if b >= 0xF0 {
                4
            } else if b >= 0xE0 {
                3
            } else if b >= 0xC0 {
                2
            } else {
                1
            };
            let have = data.len() - i;
            return if need > have { have } else { 0 };
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_spec_injects_term() {
        let spec = SpawnSpec::shell("/bin/bash");
        assert_eq!(spec.program, "/bin/bash");
        assert_eq!(spec.args, vec!["-l".to_string()]);
        assert!(spec
            .env
            .contains(&("TERM".to_string(), "xterm-256color".to_string())));
        assert!(spec.strip_env_prefixes.is_empty());
    }

    #[test]
    fn tmux_attach_spec_targets_window_and_strips_tmux_env() {
        let spec = SpawnSpec::tmux_attach("work", Some(2));
        assert_eq!(spec.program, "tmux");
        assert_eq!(
            spec.args,
            vec!["attach".to_string(), "-t".to_string(), "work:2".to_string()]
        );
        assert_eq!(spec.strip_env_prefixes, vec!["TMUX".to_string()]);

        let plain = SpawnSpec::tmux_attach("work", None);
        assert_eq!(plain.args[2], "work");
    }

    #[test]
    fn utf8_decoder_reassembles_split_sequences() {
        let mut dec = Utf8Decoder::new();
        let emoji = "a😀b".as_bytes();
        // Split inside the 4-byte emoji.
        let first = dec.decode(&emoji[..3]);
        let second = dec.decode(&emoji[3..]);
        assert_eq!(format!("{first}{second}"), "a😀b");
    }

    #[test]
    fn utf8_decoder_passes_ascii_through() {
        let mut dec = Utf8Decoder::new();
        assert_eq!(dec.decode(b"plain text"), "plain text");
        assert_eq!(dec.flush(), "");
    }

    #[test]
    fn utf8_decoder_replaces_invalid_bytes() {
        let mut dec = Utf8Decoder::new();
        let out = dec.decode(&[0x68, 0xFF, 0x69]);
        assert_eq!(out, "h\u{FFFD}i");
    }

    #[test]
    fn utf8_decoder_flush_drains_pending() {
        let mut dec = Utf8Decoder::new();
        let euro = "€".as_bytes(); // 3 bytes
        assert_eq!(dec.decode(&euro[..2]), "");
        assert_eq!(dec.flush(), "\u{FFFD}");
    }

    #[test]
    fn incomplete_tail_detection() {
        assert_eq!(incomplete_tail_len(b"abc"), 0);
        assert_eq!(incomplete_tail_len(&[0x61, 0xE2]), 1); // lead of 3-byte seq
        assert_eq!(incomplete_tail_len(&[0x61, 0xE2, 0x82]), 2);
        assert_eq!(incomplete_tail_len("€".as_bytes()), 0);
    }
}
