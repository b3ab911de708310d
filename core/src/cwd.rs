//! Working-directory detection: resolve the cwd of the *foreground* process
//! inside a PTY (not the shell itself), so `cd` in the shell, or in whatever
//! the shell spawned, is what gets reported.

#[cfg(any(test, feature = "test-util"))]
use std::collections::HashMap;
#[cfg(any(test, feature = "test-util"))]
use std::sync::Mutex;

use crate::pty::Pty;

/// Capability the cwd poller calls once per session per tick. Stateless:
/// a pure function of the PTY's current foreground process group.
pub trait CwdDetector: Send + Sync {
    /// Current working directory of the PTY's foreground process, or `None`
    /// when it cannot be determined. Callers treat `None`/empty as "no
    /// update", never as a change.
    fn detect(&self, pty: &dyn Pty) -> Option<String>;
}

/// OS-backed detector: foreground process group from the PTY (TIOCGPGRP),
/// then the process's cwd from the kernel.
pub struct ProcCwdDetector;

impl CwdDetector for ProcCwdDetector {
    fn detect(&self, pty: &dyn Pty) -> Option<String> {
        let pgid = pty.foreground_process_group()?;
        if pgid <= 0 {
            return None;
        }
        cwd_of_pid(pgid)
    }
}

#[cfg(target_os = "linux")]
fn cwd_of_pid(pid: i32) -> Option<String> {
    std::fs::read_link(format!("/proc/{pid}/cwd"))
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

/// Other platforms report nothing; update-on-change delivery makes the
/// absence silent rather than wrong.
#[cfg(not(target_os = "linux"))]
fn cwd_of_pid(_pid: i32) -> Option<String> {
    None
}

/// Scripted detector for tests: answers by tty path.
#[cfg(any(test, feature = "test-util"))]
pub struct ScriptedCwdDetector {
    by_tty: Mutex<HashMap<String, String>>,
}

#[cfg(any(test, feature = "test-util"))]
impl Default for ScriptedCwdDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl ScriptedCwdDetector {
    pub fn new() -> Self {
        Self {
            by_tty: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, tty_path: &str, cwd: &str) {
        self.by_tty
            .lock()
            .expect("script mutex")
            .insert(tty_path.to_string(), cwd.to_string());
    }

    pub fn clear(&self, tty_path: &str) {
        self.by_tty.lock().expect("script mutex").remove(tty_path);
    }
}

#[cfg(any(test, feature = "test-util"))]
impl CwdDetector for ScriptedCwdDetector {
    fn detect(&self, pty: &dyn Pty) -> Option<String> {
        self.by_tty
            .lock()
            .expect("script mutex")
            .get(pty.tty_path())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::fake::FakePty;

    #[test]
    fn scripted_detector_answers_by_tty() {
        let detector = ScriptedCwdDetector::new();
        let pty = FakePty::new("/dev/pts/200".to_string(), 1);
        assert_eq!(detector.detect(&pty), None);
        detector.set("/dev/pts/200", "/srv/app");
        assert_eq!(detector.detect(&pty), Some("/srv/app".to_string()));
        detector.clear("/dev/pts/200");
        assert_eq!(detector.detect(&pty), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn proc_detector_resolves_own_process() {
        let detector = ProcCwdDetector;
        let pty = FakePty::new("/dev/pts/201".to_string(), 1);
        pty.set_foreground_pgid(Some(std::process::id() as i32));
        let detected = detector.detect(&pty).expect("own cwd");
        let expected = std::env::current_dir().expect("current dir");
        assert_eq!(detected, expected.to_string_lossy());
    }

    #[test]
    fn missing_foreground_group_yields_none() {
        let detector = ProcCwdDetector;
        let pty = FakePty::new("/dev/pts/202".to_string(), 1);
        assert_eq!(detector.detect(&pty), None);
        pty.set_foreground_pgid(Some(-1));
        assert_eq!(detector.detect(&pty), None);
    }
}
