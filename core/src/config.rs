//! Gateway configuration, read once from the process environment and passed
//! down explicitly. Shell selection comes from SHELL (spec'd fallback /bin/sh);
//! everything else is TREX_*-prefixed with sane defaults.

use std::path::Path;
use std::time::Duration;

use crate::tmux::clamp_poll_interval;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_TMUX_POLL_MS: u64 = 2000;

/// Immutable gateway configuration. Built in main, threaded through the
/// server state; never a global.
#[derive(Debug, Clone)]
pub struct Config {
    /// Shell program spawned for plain (non-tmux) sessions, e.g. /bin/zsh.
    pub shell: String,
    /// Basename of `shell`, used as the session's shell_type ("bash", "zsh").
    pub shell_type: String,
    /// Reported as a session's cwd until the first detection succeeds.
    pub home: String,
    /// HTTP/WebSocket listen port.
    pub port: u16,
    /// Initial tmux monitor poll period, clamped to [500 ms, 30 s].
    pub tmux_poll: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let shell = std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string());
        let shell_type = shell_basename(&shell);
        let home = std::env::var("HOME")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/".to_string());
        let port = std::env::var("TREX_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let tmux_poll_ms = std::env::var("TREX_TMUX_POLL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TMUX_POLL_MS);
        Self {
            shell,
            shell_type,
            home,
            port,
            tmux_poll: clamp_poll_interval(tmux_poll_ms),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            shell_type: "sh".to_string(),
            home: "/".to_string(),
            port: DEFAULT_PORT,
            tmux_poll: Duration::from_millis(DEFAULT_TMUX_POLL_MS),
        }
    }
}

/// "bash" from "/usr/bin/bash"; the input itself when it has no directory part.
pub fn shell_basename(shell: &str) -> String {
    Path::new(shell)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| shell.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_strips_directories() {
        assert_eq!(shell_basename("/usr/local/bin/zsh"), "zsh");
        assert_eq!(shell_basename("/bin/bash"), "bash");
        assert_eq!(shell_basename("fish"), "fish");
    }

    #[test]
    fn default_config_falls_back_to_sh() {
        let cfg = Config::default();
        assert_eq!(cfg.shell, "/bin/sh");
        assert_eq!(cfg.shell_type, "sh");
        assert_eq!(cfg.tmux_poll, Duration::from_millis(2000));
    }
}
