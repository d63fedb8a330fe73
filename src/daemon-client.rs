//! Daemon client with dependency injection for testability
//!
//! This module provides the client side of the daemon protocol: process
//! lifecycle (detect/start/stop via the pid file), the socket transport, a
//! circuit breaker gating connection attempts, and transparent fallback to
//! direct in-process execution when the daemon cannot be reached.

use log::{debug, info, warn};
use serde_json::{Map, Value};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Command as ProcessCommand, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::auth::AuthManager;
use crate::breaker::{BreakerState, CircuitBreaker};
use crate::protocol::{validate_message_size, AuthLine, CommandRequest, CommandResult};
use crate::router::{CommandRouter, RouterError};
use crate::system::{ProcessProber, RealProcessProber, RealSocketConnector, SocketConnector};

// Default timeouts
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 10;
const DEFAULT_START_TIMEOUT_SECS: u64 = 5;
const DEFAULT_LIVENESS_CACHE_SECS: u64 = 5;

/// Configuration for daemon client timeouts and process management
#[derive(Debug, Clone)]
pub struct DaemonClientConfig {
    pub home_dir: PathBuf,
    pub socket_path: PathBuf,
    pub pid_path: PathBuf,
    pub token_path: PathBuf,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub start_timeout: Duration,
    pub liveness_cache: Duration,
    pub auto_start: bool,
    pub fallback_enabled: bool,
    pub daemon_binary: Option<PathBuf>,
}

impl DaemonClientConfig {
    pub fn new(home_dir: PathBuf) -> Self {
        let socket_path = crate::determine_socket_path(&home_dir);
        let pid_path = crate::determine_pid_path(&home_dir);
        let token_path = crate::determine_token_path(&home_dir);
        Self {
            home_dir,
            socket_path,
            pid_path,
            token_path,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            start_timeout: Duration::from_secs(DEFAULT_START_TIMEOUT_SECS),
            liveness_cache: Duration::from_secs(DEFAULT_LIVENESS_CACHE_SECS),
            auto_start: true,
            fallback_enabled: true,
            daemon_binary: None,
        }
    }
}

/// Error types for daemon client operations
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonError {
    ConnectionTimeout,
    ReadTimeout,
    WriteTimeout,
    ConnectionRefused,
    SocketNotFound,
    SocketPermissionDenied,
    ProtocolError(String),
    StartFailed(String),
    TokenError(String),
    UnknownError(String),
}

impl std::fmt::Display for DaemonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonError::ConnectionTimeout => write!(f, "Daemon connection timeout"),
            DaemonError::ReadTimeout => write!(f, "Daemon read timeout"),
            DaemonError::WriteTimeout => write!(f, "Daemon write timeout"),
            DaemonError::ConnectionRefused => write!(f, "Daemon connection refused"),
            DaemonError::SocketNotFound => write!(f, "Daemon socket not found"),
            DaemonError::SocketPermissionDenied => write!(f, "Daemon socket permission denied"),
            DaemonError::ProtocolError(msg) => write!(f, "Daemon protocol error: {msg}"),
            DaemonError::StartFailed(msg) => write!(f, "Daemon failed to start: {msg}"),
            DaemonError::TokenError(msg) => write!(f, "Auth token error: {msg}"),
            DaemonError::UnknownError(msg) => write!(f, "Unknown daemon error: {msg}"),
        }
    }
}

impl std::error::Error for DaemonError {}

/// Categorizes an IO error into a DaemonError
pub fn categorize_io_error(error: &std::io::Error) -> DaemonError {
    use std::io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => DaemonError::ConnectionTimeout,
        ErrorKind::ConnectionRefused => DaemonError::ConnectionRefused,
        ErrorKind::NotFound => DaemonError::SocketNotFound,
        ErrorKind::PermissionDenied => DaemonError::SocketPermissionDenied,
        ErrorKind::WouldBlock => DaemonError::ReadTimeout,
        _ => DaemonError::UnknownError(error.to_string()),
    }
}

fn read_pid(pid_path: &PathBuf) -> Option<u32> {
    fs::read_to_string(pid_path)
        .ok()
        .and_then(|contents| contents.trim().parse().ok())
}

/// Daemon client with injectable socket connector and process prober
pub struct DaemonClient<C: SocketConnector, P: ProcessProber> {
    config: DaemonClientConfig,
    connector: C,
    prober: P,
    auth: AuthManager,
    breaker: Mutex<CircuitBreaker>,
    fallback: Option<Arc<dyn CommandRouter>>,
    liveness: Mutex<Option<(Instant, bool)>>,
}

impl DaemonClient<RealSocketConnector, RealProcessProber> {
    /// Create a new daemon client with real socket and process access
    pub fn new(config: DaemonClientConfig) -> Self {
        Self::with_parts(config, RealSocketConnector, RealProcessProber)
    }
}

impl<C: SocketConnector, P: ProcessProber> DaemonClient<C, P> {
    /// Create a client with custom connector and prober (for testing)
    pub fn with_parts(config: DaemonClientConfig, connector: C, prober: P) -> Self {
        let auth = AuthManager::new(config.token_path.clone());
        Self {
            config,
            connector,
            prober,
            auth,
            breaker: Mutex::new(CircuitBreaker::with_defaults()),
            fallback: None,
            liveness: Mutex::new(None),
        }
    }

    /// Attach the direct-execution strategy used when the daemon is
    /// unreachable. Without one, unavailability becomes a structured failure.
    pub fn with_fallback(mut self, router: Arc<dyn CommandRouter>) -> Self {
        self.fallback = Some(router);
        self
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.lock().expect("breaker lock poisoned").state()
    }

    /// Whether the daemon process is running, per the pid file and a signal-0
    /// probe. A stale pid file is cleaned up. The verdict is cached briefly
    /// to avoid probing on every call.
    pub fn is_daemon_running(&self) -> bool {
        let mut liveness = self.liveness.lock().expect("liveness lock poisoned");
        if let Some((checked_at, alive)) = *liveness {
            if checked_at.elapsed() < self.config.liveness_cache {
                return alive;
            }
        }

        let alive = self.probe_daemon();
        *liveness = Some((Instant::now(), alive));
        alive
    }

    fn probe_daemon(&self) -> bool {
        match read_pid(&self.config.pid_path) {
            Some(pid) if self.prober.is_alive(pid) => true,
            Some(pid) => {
                debug!("🧟 Stale pid file (pid {} gone), cleaning up", pid);
                let _ = fs::remove_file(&self.config.pid_path);
                false
            }
            None => false,
        }
    }

    fn forget_liveness(&self) {
        *self.liveness.lock().expect("liveness lock poisoned") = None;
    }

    /// Locate the daemon binary: explicit config, then a sibling of the
    /// current executable, then ~/.cargo/bin, then whatever PATH resolves.
    fn locate_daemon_binary(&self) -> PathBuf {
        if let Some(binary) = &self.config.daemon_binary {
            return binary.clone();
        }

        if let Ok(current) = std::env::current_exe() {
            if let Some(dir) = current.parent() {
                let sibling = dir.join("mbx-daemon");
                if sibling.exists() {
                    return sibling;
                }
            }
        }

        let cargo_bin = self.config.home_dir.join(".cargo/bin/mbx-daemon");
        if cargo_bin.exists() {
            return cargo_bin;
        }

        PathBuf::from("mbx-daemon")
    }

    /// Spawn the daemon as a detached background process and poll (bounded)
    /// until the pid file and socket exist and the process answers.
    pub fn start_daemon(&self) -> Result<(), DaemonError> {
        if self.is_daemon_running() {
            return Ok(());
        }

        let binary = self.locate_daemon_binary();
        info!("🚀 Starting daemon: {:?}", binary);

        ProcessCommand::new(&binary)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| DaemonError::StartFailed(format!("spawn {:?}: {e}", binary)))?;

        let deadline = Instant::now() + self.config.start_timeout;
        while Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));

            let pid_ready = read_pid(&self.config.pid_path)
                .map(|pid| self.prober.is_alive(pid))
                .unwrap_or(false);
            let socket_ready = self.connector.path_exists(&self.config.socket_path);

            if pid_ready && socket_ready {
                self.forget_liveness();
                info!("✅ Daemon is up");
                return Ok(());
            }
        }

        Err(DaemonError::StartFailed(format!(
            "daemon did not come up within {}s",
            self.config.start_timeout.as_secs()
        )))
    }

    /// Send SIGTERM to the recorded pid; idempotent if already stopped.
    /// Returns whether a signal was actually sent.
    pub fn stop_daemon(&self) -> Result<bool, DaemonError> {
        match read_pid(&self.config.pid_path) {
            Some(pid) if self.prober.is_alive(pid) => {
                info!("🛑 Stopping daemon (pid {})", pid);
                self.prober
                    .terminate(pid)
                    .map_err(|e| DaemonError::UnknownError(e.to_string()))?;
                self.forget_liveness();
                Ok(true)
            }
            _ => {
                debug!("🛑 Daemon already stopped");
                self.forget_liveness();
                Ok(false)
            }
        }
    }

    /// Execute a command, preferring the daemon and falling back to direct
    /// execution. Transport and protocol errors never escape raw: the result
    /// is always a structured `CommandResult`.
    pub fn execute_command(&self, command: &str, args: Map<String, Value>) -> CommandResult {
        let request = CommandRequest {
            command: command.to_string(),
            args,
        };

        let permitted = self
            .breaker
            .lock()
            .expect("breaker lock poisoned")
            .can_attempt();
        if !permitted {
            debug!("⛔ Circuit open, skipping daemon attempt entirely");
            return self.fallback_execute(&request, "circuit breaker open");
        }

        if !self.is_daemon_running() {
            if !self.config.auto_start {
                return self.fallback_execute(&request, "daemon not running");
            }
            if let Err(e) = self.start_daemon() {
                self.record_failure();
                return self.fallback_execute(&request, &e.to_string());
            }
        }

        match self.send_request(&request) {
            Ok(result) => {
                self.breaker
                    .lock()
                    .expect("breaker lock poisoned")
                    .record_success();
                result
            }
            Err(e) => {
                self.record_failure();
                self.forget_liveness();
                self.fallback_execute(&request, &e.to_string())
            }
        }
    }

    fn record_failure(&self) {
        self.breaker
            .lock()
            .expect("breaker lock poisoned")
            .record_failure();
    }

    /// One request over the socket: auth line, command line, one response line.
    fn send_request(&self, request: &CommandRequest) -> Result<CommandResult, DaemonError> {
        if !self.connector.path_exists(&self.config.socket_path) {
            return Err(DaemonError::SocketNotFound);
        }

        let token = self
            .auth
            .get_token()
            .map_err(|e| DaemonError::TokenError(e.to_string()))?;

        debug!("📡 Connecting to daemon at {:?}", self.config.socket_path);
        let mut stream = self
            .connector
            .connect(&self.config.socket_path)
            .map_err(|e| categorize_io_error(&e))?;

        stream
            .set_read_timeout(Some(self.config.read_timeout))
            .map_err(|e| categorize_io_error(&e))?;
        stream
            .set_write_timeout(Some(self.config.connect_timeout))
            .map_err(|e| categorize_io_error(&e))?;

        let auth_line = serde_json::to_string(&AuthLine { token })
            .map_err(|e| DaemonError::ProtocolError(format!("Failed to serialize auth: {e}")))?;
        let request_line = serde_json::to_string(request)
            .map_err(|e| DaemonError::ProtocolError(format!("Failed to serialize request: {e}")))?;

        writeln!(stream, "{auth_line}").map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                DaemonError::WriteTimeout
            } else {
                categorize_io_error(&e)
            }
        })?;
        writeln!(stream, "{request_line}").map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                DaemonError::WriteTimeout
            } else {
                categorize_io_error(&e)
            }
        })?;

        let mut reader = BufReader::new(&mut *stream);
        let mut response_line = String::new();
        reader.read_line(&mut response_line).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                DaemonError::ReadTimeout
            } else {
                categorize_io_error(&e)
            }
        })?;

        debug!("📥 Daemon response: {}", response_line.trim());

        if response_line.trim().is_empty() {
            return Err(DaemonError::ProtocolError("empty response".to_string()));
        }
        validate_message_size(&response_line).map_err(DaemonError::ProtocolError)?;

        serde_json::from_str(response_line.trim())
            .map_err(|e| DaemonError::ProtocolError(format!("Failed to parse response: {e}")))
    }

    /// Direct in-process execution through the same router abstraction the
    /// daemon uses, without caching. The CLI stays functional even if the
    /// daemon can never be started.
    fn fallback_execute(&self, request: &CommandRequest, reason: &str) -> CommandResult {
        let router = match &self.fallback {
            Some(router) if self.config.fallback_enabled => router,
            _ => {
                return CommandResult::err(format!("daemon unavailable: {reason}"))
                    .with_meta("via_daemon", Value::from(false));
            }
        };

        warn!("📥 Daemon unavailable ({reason}), executing directly");

        let result = match router.execute(request) {
            Ok(result) => result,
            Err(RouterError::Unknown(name)) => CommandResult::err(format!("unknown command: {name}"))
                .with_meta("unknown_command", Value::from(true)),
            Err(RouterError::Failed(message)) => CommandResult::err(message),
        };

        result.with_meta("via_daemon", Value::from(false))
    }
}
