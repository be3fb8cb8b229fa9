use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use forking_service::config::{parse_duration, parse_mode};
use forking_service::ServiceConfig;

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

fn mode_arg(s: &str) -> Result<u32, String> {
    parse_mode(s).map_err(|e| e.to_string())
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "forking-service",
    version,
    about = "Fork workers on request over a Unix control socket",
    long_about = "Listens on a Unix socket for hello/quit/fork/fork-env requests. Each fork \
                  runs the command in a child whose stdio is connected through three FIFOs in a \
                  fresh temp directory.\n\nFlags override FORKING_SERVICE_* environment variables."
)]
pub(crate) struct Cli {
    /// Control socket path
    #[arg(long)]
    pub(crate) socket: Option<PathBuf>,

    /// Socket permission bits, octal (e.g. 660)
    #[arg(long = "socket-mode", value_parser = mode_arg)]
    pub(crate) socket_mode: Option<u32>,

    /// Longest idle wait of the main loop (e.g. 1s, 250ms)
    #[arg(long = "accept-timeout", value_parser = duration_arg)]
    pub(crate) accept_timeout: Option<Duration>,

    /// Time allowed to read one complete request
    #[arg(long = "request-timeout", value_parser = duration_arg)]
    pub(crate) request_timeout: Option<Duration>,

    /// Time children get to exit on shutdown before SIGINT
    #[arg(long = "wait-for-children-timeout", value_parser = duration_arg)]
    pub(crate) wait_for_children_timeout: Option<Duration>,

    /// Grace period after SIGINT and after SIGKILL
    #[arg(long = "shutdown-grace", value_parser = duration_arg)]
    pub(crate) shutdown_grace: Option<Duration>,

    /// Give up on clients that do not open the FIFOs in time (default: wait forever)
    #[arg(long = "child-connect-timeout", value_parser = duration_arg)]
    pub(crate) child_connect_timeout: Option<Duration>,

    /// Base directory for per-child temp directories
    #[arg(long = "temp-dir")]
    pub(crate) temp_dir: Option<PathBuf>,

    /// Log at debug level unless FORKING_SERVICE_LOG/RUST_LOG say otherwise
    #[arg(long, short = 'v')]
    pub(crate) verbose: bool,
}

impl Cli {
    /// Layer the flags that were given on top of `cfg`.
    pub(crate) fn apply(&self, mut cfg: ServiceConfig) -> ServiceConfig {
        if let Some(p) = &self.socket {
            cfg.socket_path = p.clone();
        }
        if let Some(m) = self.socket_mode {
            cfg.socket_mode = m;
        }
        if let Some(d) = self.accept_timeout {
            cfg.accept_timeout = d;
        }
        if let Some(d) = self.request_timeout {
            cfg.request_timeout = d;
        }
        if let Some(d) = self.wait_for_children_timeout {
            cfg.wait_for_children_timeout = d;
        }
        if let Some(d) = self.shutdown_grace {
            cfg.shutdown_grace = d;
        }
        if let Some(d) = self.child_connect_timeout {
            cfg.child_connect_timeout = Some(d);
        }
        if let Some(p) = &self.temp_dir {
            cfg.temp_dir = p.clone();
        }
        cfg
    }
}
