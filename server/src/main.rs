//! Standalone trex gateway binary. Run with --port, or set TREX_PORT;
//! authentication is disabled here (a fronting deployment supplies a real
//! PrincipalResolver through the library API).

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use trex_core::config::Config;
use trex_server::NoAuth;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = Config::from_env();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            config.port = args[i + 1].parse().unwrap_or(config.port);
            i += 2;
            continue;
        }
        i += 1;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(trex_server::run_gateway(config, Arc::new(NoAuth)))
}
