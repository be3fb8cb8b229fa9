/*!
Service configuration.

Defaults are compiled in; `FORKING_SERVICE_*` environment variables override them and the
host binary applies command-line flags on top. The resulting `ServiceConfig` is handed to
the service constructor and never consulted through globals afterwards.
*/
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ServiceError;

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/launchpad_forking_service.sock";
pub const DEFAULT_SOCKET_MODE: u32 = 0o660;
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
pub const WAIT_FOR_CHILDREN_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);
pub const TEMP_DIR_PREFIX: &str = "forking-service-child-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    /// Permission bits applied to the socket file after bind.
    pub socket_mode: u32,
    /// Upper bound on one idle wait of the main loop.
    pub accept_timeout: Duration,
    /// Upper bound on reading one complete request from a connection.
    pub request_timeout: Duration,
    pub wait_for_children_timeout: Duration,
    /// Time given to children after SIGINT and again after SIGKILL.
    pub shutdown_grace: Duration,
    /// None blocks the child's FIFO rendezvous until the client connects.
    pub child_connect_timeout: Option<Duration>,
    pub temp_dir: PathBuf,
    pub temp_dir_prefix: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            socket_mode: DEFAULT_SOCKET_MODE,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            wait_for_children_timeout: WAIT_FOR_CHILDREN_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            child_connect_timeout: None,
            temp_dir: env::temp_dir(),
            temp_dir_prefix: TEMP_DIR_PREFIX.to_string(),
        }
    }
}

impl ServiceConfig {
    /// Defaults overridden by any `FORKING_SERVICE_*` variables present in the environment.
    pub fn from_env() -> Result<Self, ServiceError> {
        let mut cfg = ServiceConfig::default();
        if let Some(v) = env_value("FORKING_SERVICE_SOCKET") {
            cfg.socket_path = PathBuf::from(v);
        }
        if let Some(v) = env_value("FORKING_SERVICE_SOCKET_MODE") {
            cfg.socket_mode = parse_mode(&v)?;
        }
        if let Some(v) = env_value("FORKING_SERVICE_ACCEPT_TIMEOUT") {
            cfg.accept_timeout = parse_duration(&v)?;
        }
        if let Some(v) = env_value("FORKING_SERVICE_REQUEST_TIMEOUT") {
            cfg.request_timeout = parse_duration(&v)?;
        }
        if let Some(v) = env_value("FORKING_SERVICE_WAIT_FOR_CHILDREN_TIMEOUT") {
            cfg.wait_for_children_timeout = parse_duration(&v)?;
        }
        if let Some(v) = env_value("FORKING_SERVICE_SHUTDOWN_GRACE") {
            cfg.shutdown_grace = parse_duration(&v)?;
        }
        if let Some(v) = env_value("FORKING_SERVICE_CHILD_CONNECT_TIMEOUT") {
            cfg.child_connect_timeout = Some(parse_duration(&v)?);
        }
        if let Some(v) = env_value("FORKING_SERVICE_TEMP_DIR") {
            cfg.temp_dir = PathBuf::from(v);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(ServiceError::Message("socket path must not be empty".into()));
        }
        if self.socket_mode > 0o7777 {
            return Err(ServiceError::Message(format!(
                "invalid socket mode {:o}",
                self.socket_mode
            )));
        }
        if self.accept_timeout < Duration::from_millis(1) {
            return Err(ServiceError::Message(
                "accept timeout must be at least 1ms".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ServiceError::Message("request timeout must be non-zero".into()));
        }
        if self.temp_dir_prefix.contains('/') {
            return Err(ServiceError::Message(
                "temp dir prefix must not contain '/'".into(),
            ));
        }
        Ok(())
    }

    /// Path of the advisory lock guarding this socket path.
    pub fn lock_path(&self) -> PathBuf {
        let mut s = self.socket_path.clone().into_os_string();
        s.push(".lock");
        PathBuf::from(s)
    }
}

fn env_value(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parse octal permission bits such as `660`, `0660` or `0o660`.
pub fn parse_mode(s: &str) -> Result<u32, ServiceError> {
    let t = s.trim();
    let digits = t.strip_prefix("0o").unwrap_or(t);
    let mode = u32::from_str_radix(digits, 8)
        .map_err(|_| ServiceError::Message(format!("invalid socket mode '{t}': expected octal")))?;
    if mode > 0o7777 {
        return Err(ServiceError::Message(format!(
            "invalid socket mode '{t}': out of range"
        )));
    }
    Ok(mode)
}

/// Parse a duration given as humantime (`250ms`, `5m`) or as plain (possibly fractional) seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ServiceError> {
    let t = s.trim();
    if let Ok(secs) = t.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Ok(Duration::from_secs_f64(secs));
        }
        return Err(ServiceError::Message(format!("invalid duration '{t}'")));
    }
    humantime::parse_duration(t)
        .map_err(|e| ServiceError::Message(format!("invalid duration '{t}': {e}")))
}
