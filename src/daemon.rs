use eyre::{Result, WrapErr};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::auth::{AuthManager, SocketGuard};
use crate::cache::{cache_key, ResultCache};
use crate::cfg::loader::Loader;
use crate::cfg::spec::DaemonTuning;
use crate::mail::SharedAccount;
use crate::pool::PoolManager;
use crate::protocol::{validate_message_size, AuthLine, CommandRequest, CommandResult};
use crate::router::{Command, CommandRouter, RouterError, DEFAULT_FOLDER, DRAFTS_FOLDER, SENT_FOLDER};

/// The daemon's command-execution loop: socket accept, authentication,
/// routing with cache read/write and selective invalidation, per-daemon
/// concurrency limiting, and idle self-shutdown.
///
/// Per-connection state machine:
///   Accepted -> Authenticating -> Routing -> Responding -> Closed
/// The concurrency slot is taken on accept and released unconditionally when
/// the connection thread finishes, whatever happened in between.

const DEFAULT_MAX_CLIENTS: usize = 10;
const DEFAULT_SLOT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_IDLE_CHECK_PERIOD_SECS: u64 = 60;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Read timeout for the two request lines; independent of command execution.
const LINE_READ_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub home_dir: PathBuf,
    pub socket_path: PathBuf,
    pub pid_path: PathBuf,
    pub max_clients: usize,
    pub slot_timeout: Duration,
    pub command_timeout: Duration,
    pub idle_timeout: Duration,
    pub idle_check_period: Duration,
    pub shutdown_grace: Duration,
    pub token_max_age_hours: u64,
}

impl DaemonConfig {
    pub fn new(home_dir: PathBuf) -> Self {
        let socket_path = crate::determine_socket_path(&home_dir);
        let pid_path = crate::determine_pid_path(&home_dir);
        Self {
            home_dir,
            socket_path,
            pid_path,
            max_clients: DEFAULT_MAX_CLIENTS,
            slot_timeout: Duration::from_secs(DEFAULT_SLOT_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            idle_check_period: Duration::from_secs(DEFAULT_IDLE_CHECK_PERIOD_SECS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            token_max_age_hours: crate::auth::DEFAULT_TOKEN_MAX_AGE_HOURS,
        }
    }

    /// Apply the `daemon:` block of the user config.
    pub fn with_tuning(mut self, tuning: &DaemonTuning) -> Self {
        self.max_clients = tuning.max_clients;
        self.command_timeout = Duration::from_secs(tuning.command_timeout_secs);
        self.idle_timeout = Duration::from_secs(tuning.idle_timeout_secs);
        self.token_max_age_hours = tuning.token_max_age_hours;
        self
    }
}

/// Bounded admission control: one slot per live client connection. This is
/// the only queueing mechanism in the daemon; waiters past the timeout are
/// turned away with a saturation error.
struct ClientSlots {
    max: usize,
    active: Mutex<usize>,
    released: Condvar,
}

impl ClientSlots {
    fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            max: max.max(1),
            active: Mutex::new(0),
            released: Condvar::new(),
        })
    }

    fn try_acquire(slots: &Arc<Self>, timeout: Duration) -> Option<ClientSlot> {
        let deadline = Instant::now() + timeout;
        let mut active = slots.active.lock().expect("slot lock poisoned");

        while *active >= slots.max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = slots
                .released
                .wait_timeout(active, remaining)
                .expect("slot lock poisoned");
            active = guard;
        }

        *active += 1;
        Some(ClientSlot {
            slots: Arc::clone(slots),
        })
    }

    fn active(&self) -> usize {
        *self.active.lock().expect("slot lock poisoned")
    }

    /// Wait (bounded) for all slots to be released during shutdown.
    fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut active = self.active.lock().expect("slot lock poisoned");
        while *active > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = self
                .released
                .wait_timeout(active, remaining)
                .expect("slot lock poisoned");
            active = guard;
        }
        true
    }
}

/// Admission ticket for one live connection; released on drop, including on
/// any panic or error path in the connection thread.
struct ClientSlot {
    slots: Arc<ClientSlots>,
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        let mut active = self.slots.active.lock().expect("slot lock poisoned");
        *active = active.saturating_sub(1);
        self.slots.released.notify_one();
    }
}

pub struct Daemon {
    config: DaemonConfig,
    router: Arc<dyn CommandRouter>,
    cache: Arc<ResultCache>,
    auth: Arc<AuthManager>,
    pools: Arc<PoolManager>,
    slots: Arc<ClientSlots>,
    shutdown: Arc<AtomicBool>,
    last_activity: Arc<Mutex<Instant>>,
    started: Instant,
    total_requests: AtomicU64,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Daemon {
    pub fn new(
        config: DaemonConfig,
        router: Arc<dyn CommandRouter>,
        cache: Arc<ResultCache>,
        auth: Arc<AuthManager>,
        pools: Arc<PoolManager>,
    ) -> Self {
        let slots = ClientSlots::new(config.max_clients);
        Self {
            config,
            router,
            cache,
            auth,
            pools,
            slots,
            shutdown: Arc::new(AtomicBool::new(false)),
            last_activity: Arc::new(Mutex::new(Instant::now())),
            started: Instant::now(),
            total_requests: AtomicU64::new(0),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Handle for signal handlers: flipping it makes the accept loop exit.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn active_clients(&self) -> usize {
        self.slots.active()
    }

    fn touch_activity(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("activity lock poisoned")
            .elapsed()
    }

    /// Bind the socket and serve until shutdown is requested or the idle
    /// threshold is crossed. Fails closed on any socket-security violation.
    pub fn run(self: Arc<Self>) -> Result<()> {
        let guard = SocketGuard::new(self.config.home_dir.clone());
        guard.check(&self.config.socket_path)?;

        // The token must exist before the socket appears: clients read it as
        // soon as they can see the socket
        self.auth.rotate_if_expired(self.config.token_max_age_hours)?;
        self.auth.get_token()?;

        // A leftover socket file from an unclean exit is stale by definition
        if self.config.socket_path.exists() {
            fs::remove_file(&self.config.socket_path)
                .wrap_err("Can't remove stale socket file")?;
        }

        let listener = UnixListener::bind(&self.config.socket_path)
            .wrap_err_with(|| format!("Can't bind socket {:?}", self.config.socket_path))?;
        guard.tighten(&self.config.socket_path)?;
        listener.set_nonblocking(true)?;

        fs::write(&self.config.pid_path, format!("{}\n", std::process::id()))
            .wrap_err_with(|| format!("Can't write pid file {:?}", self.config.pid_path))?;

        info!(
            "📡 Daemon listening at {:?} (pid {}, max {} clients)",
            self.config.socket_path,
            std::process::id(),
            self.config.max_clients
        );

        self.pools.start_keepalive();
        self.spawn_idle_checker();

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("🛑 Shutdown requested, leaving accept loop");
                break;
            }

            match listener.accept() {
                Ok((stream, _addr)) => {
                    self.touch_activity();
                    let daemon = Arc::clone(&self);
                    std::thread::spawn(move || daemon.serve_connection(stream));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    error!("❌ Accept error: {}", e);
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }

        self.shutdown_sequence();
        Ok(())
    }

    /// Stop accepting, drain in-flight connections (bounded), close pools,
    /// clear the cache, and remove the pid and socket files.
    fn shutdown_sequence(&self) {
        info!(
            "🧹 Draining {} in-flight connection(s)",
            self.slots.active()
        );
        if !self.slots.drain(self.config.shutdown_grace) {
            warn!(
                "⚠️ {} connection(s) still open after {}s grace, closing anyway",
                self.slots.active(),
                self.config.shutdown_grace.as_secs()
            );
        }

        for handle in self.background.lock().expect("background lock poisoned").drain(..) {
            let _ = handle.join();
        }

        self.pools.stop();
        self.cache.invalidate_all();

        if self.config.pid_path.exists() {
            let _ = fs::remove_file(&self.config.pid_path);
        }
        if self.config.socket_path.exists() {
            let _ = fs::remove_file(&self.config.socket_path);
        }

        info!("👋 Daemon stopped");
    }

    /// Idle checker: wakes periodically, triggers graceful shutdown once the
    /// daemon has been idle past the threshold, and rotates an aging token.
    fn spawn_idle_checker(&self) {
        let shutdown = Arc::clone(&self.shutdown);
        let auth = Arc::clone(&self.auth);
        let last_activity = Arc::clone(&self.last_activity);
        let period = self.config.idle_check_period;
        let idle_timeout = self.config.idle_timeout;
        let token_max_age_hours = self.config.token_max_age_hours;

        let handle = std::thread::Builder::new()
            .name("mbx-idle-checker".to_string())
            .spawn(move || {
                let tick = period.clamp(Duration::from_millis(10), Duration::from_millis(250));
                let mut slept = Duration::ZERO;

                while !shutdown.load(Ordering::SeqCst) {
                    std::thread::sleep(tick);
                    slept += tick;
                    if slept < period {
                        continue;
                    }
                    slept = Duration::ZERO;

                    if let Err(e) = auth.rotate_if_expired(token_max_age_hours) {
                        warn!("⚠️ Token rotation check failed: {}", e);
                    }

                    let idle = last_activity
                        .lock()
                        .expect("activity lock poisoned")
                        .elapsed();
                    if idle > idle_timeout {
                        info!(
                            "😴 Idle for {}s (threshold {}s), shutting down",
                            idle.as_secs(),
                            idle_timeout.as_secs()
                        );
                        shutdown.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            })
            .expect("failed to spawn idle checker");

        self.background
            .lock()
            .expect("background lock poisoned")
            .push(handle);
    }

    /// Watch the config file; a content change reloads the account, clears
    /// the cache, and expires both pools so the next connection uses fresh
    /// credentials.
    pub fn watch_config(&self, config_path: PathBuf, account: SharedAccount) {
        use notify::{recommended_watcher, RecursiveMode, Watcher};

        let shutdown = Arc::clone(&self.shutdown);
        let cache = Arc::clone(&self.cache);
        let pools = Arc::clone(&self.pools);
        let handle = std::thread::Builder::new()
            .name("mbx-config-watcher".to_string())
            .spawn(move || {
                let (tx, rx) = mpsc::channel();
                let mut watcher = match recommended_watcher(
                    move |event: std::result::Result<notify::Event, notify::Error>| {
                        let _ = tx.send(event);
                    },
                ) {
                    Ok(watcher) => watcher,
                    Err(e) => {
                        warn!("⚠️ Config watcher unavailable: {}", e);
                        return;
                    }
                };

                if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
                    warn!("⚠️ Can't watch config {:?}: {}", config_path, e);
                    return;
                }

                let mut last_hash = crate::hash_config_file(&config_path).unwrap_or_default();
                debug!("👀 Watching config {:?} (hash {})", config_path, last_hash);

                while !shutdown.load(Ordering::SeqCst) {
                    match rx.recv_timeout(Duration::from_millis(500)) {
                        Ok(_event) => {
                            let current = match crate::hash_config_file(&config_path) {
                                Ok(hash) => hash,
                                Err(_) => continue,
                            };
                            if current == last_hash {
                                continue;
                            }

                            match Loader::new().load(&config_path) {
                                Ok(spec) => {
                                    info!("🔄 Config changed ({} -> {}), reloading", last_hash, current);
                                    last_hash = current;
                                    *account.write().expect("account lock poisoned") = spec.account;
                                    cache.invalidate_all();
                                    pools.expire_all();
                                }
                                Err(e) => {
                                    warn!("⚠️ Config changed but failed to load, keeping old: {}", e);
                                }
                            }
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => continue,
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("failed to spawn config watcher");

        self.background
            .lock()
            .expect("background lock poisoned")
            .push(handle);
    }

    /// One connection, start to finish. The slot is requested first; without
    /// one the client gets a saturation error instead of an unbounded queue.
    fn serve_connection(&self, stream: UnixStream) {
        let slot = ClientSlots::try_acquire(&self.slots, self.config.slot_timeout);

        let result = match &slot {
            Some(_) => self.try_handle(&stream),
            None => {
                warn!(
                    "🚦 All {} client slots busy, rejecting connection",
                    self.config.max_clients
                );
                let saturated = CommandResult::err(format!(
                    "daemon is at capacity ({} concurrent clients)",
                    self.config.max_clients
                ))
                .with_meta("saturated", Value::from(true));
                Self::respond(&stream, &saturated)
            }
        };

        if let Err(e) = result {
            debug!("🔌 Connection error: {}", e);
        }

        // Closed: slot released (drop), activity clock refreshed
        drop(slot);
        self.touch_activity();
    }

    fn try_handle(&self, stream: &UnixStream) -> Result<()> {
        stream.set_read_timeout(Some(Duration::from_secs(LINE_READ_TIMEOUT_SECS)))?;
        stream.set_write_timeout(Some(Duration::from_secs(LINE_READ_TIMEOUT_SECS)))?;

        let mut reader = BufReader::new(stream.try_clone()?);

        // Authenticating: first line carries the token
        let mut line = String::new();
        reader.read_line(&mut line)?;
        if let Err(e) = validate_message_size(&line) {
            return Self::respond(stream, &CommandResult::err(e));
        }

        let authenticated = match serde_json::from_str::<AuthLine>(line.trim()) {
            Ok(auth) => self.auth.verify_token(&auth.token),
            Err(_) => {
                warn!("🔐 Auth failure (reason=malformed_auth_line)");
                false
            }
        };

        if !authenticated {
            return Self::respond(stream, &CommandResult::err("authentication failed"));
        }

        // Routing: second line carries the command
        line.clear();
        reader.read_line(&mut line)?;
        if let Err(e) = validate_message_size(&line) {
            return Self::respond(stream, &CommandResult::err(e));
        }

        let response = match serde_json::from_str::<CommandRequest>(line.trim()) {
            Ok(request) => {
                debug!("📥 Request: {} {:?}", request.command, request.args);
                self.dispatch(&request)
            }
            Err(e) => CommandResult::err(format!("malformed request: {e}")),
        };

        // Responding: exactly one line, regardless of outcome
        Self::respond(stream, &response)
    }

    fn respond(stream: &UnixStream, result: &CommandResult) -> Result<()> {
        let json = serde_json::to_string(result)?;
        let mut writer = stream;
        writeln!(writer, "{json}")?;
        Ok(())
    }

    /// Route one request: reserved status command, cache lookup for reads,
    /// timed execution, cache store and selective invalidation for writes.
    fn dispatch(&self, request: &CommandRequest) -> CommandResult {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        if request.command == "status" {
            return self.status_result();
        }

        let command = Command::parse(&request.command);

        let key = command
            .filter(|c| c.is_cacheable())
            .map(|_| cache_key(&request.command, &request.args));

        if let Some(key) = &key {
            if let Some((value, age)) = self.cache.get(key) {
                debug!("⚡ Cache hit ({}s old): {}", age.as_secs(), key);
                return CommandResult::ok(value)
                    .into_cached(age.as_secs())
                    .with_meta("via_daemon", Value::from(true));
            }
        }

        let result = self.execute_with_timeout(request);

        if result.success {
            if let Some(key) = &key {
                if let Some(data) = &result.data {
                    self.cache.set(key, data.clone());
                }
            }

            match command {
                Some(cmd) if cmd.is_write() => self.invalidate_after_write(cmd, request),
                Some(_) => {}
                None => {
                    // A command we can't classify but that ran and succeeded:
                    // correctness over cache efficiency
                    let removed = self.cache.invalidate_all();
                    warn!(
                        "🗑️ Unrecognized write command '{}', cleared {} cache entries",
                        request.command, removed
                    );
                }
            }
        }

        result.with_meta("via_daemon", Value::from(true))
    }

    /// Dispatch to the router on a worker thread under the command timeout.
    /// Unknown commands and timeouts become failed results, never panics.
    fn execute_with_timeout(&self, request: &CommandRequest) -> CommandResult {
        let router = Arc::clone(&self.router);
        let owned = request.clone();
        let (tx, rx) = mpsc::channel();

        std::thread::spawn(move || {
            let _ = tx.send(router.execute(&owned));
        });

        match rx.recv_timeout(self.config.command_timeout) {
            Ok(Ok(result)) => result,
            Ok(Err(RouterError::Unknown(name))) => {
                CommandResult::err(format!("unknown command: {name}"))
                    .with_meta("unknown_command", Value::from(true))
            }
            Ok(Err(RouterError::Failed(message))) => CommandResult::err(message),
            Err(_) => {
                warn!(
                    "⏱️ Command '{}' timed out after {}s",
                    request.command,
                    self.config.command_timeout.as_secs()
                );
                CommandResult::err(format!(
                    "command '{}' timed out after {}s",
                    request.command,
                    self.config.command_timeout.as_secs()
                ))
            }
        }
    }

    /// The invalidation strategy table for write commands. Each strategy is
    /// idempotent: running it twice removes nothing extra the second time.
    fn invalidate_after_write(&self, command: Command, request: &CommandRequest) {
        let folder = request
            .arg_str("folder")
            .or_else(|| request.arg_str("table"))
            .unwrap_or_else(|| DEFAULT_FOLDER.to_string());

        let removed = match command {
            Command::Move => {
                let mut removed = self.cache.invalidate_table(&folder);
                if let Some(destination) = request.arg_str("to") {
                    removed += self.cache.invalidate_table(&destination);
                }
                removed
            }
            Command::Delete => {
                let mut removed = self.cache.invalidate_table(&folder);
                if let Some(id) = request.arg_str("id") {
                    removed += self.cache.invalidate_email(&id);
                }
                removed
            }
            Command::Flag | Command::Unflag => {
                let mut removed = self.cache.invalidate_table(&folder);
                if let Some(id) = request.arg_str("id") {
                    removed += self.cache.invalidate_email(&id);
                }
                removed += self.cache.invalidate_command("flagged");
                removed += self.cache.invalidate_command("unflagged");
                removed
            }
            Command::Send => self.cache.invalidate_table(SENT_FOLDER),
            Command::Compose => self.cache.invalidate_table(DRAFTS_FOLDER),
            Command::Refresh => self.cache.invalidate_all(),
            Command::List
            | Command::View
            | Command::Search
            | Command::Flagged
            | Command::Unflagged
            | Command::Folders => 0,
        };

        if removed > 0 {
            debug!("🗑️ '{}' invalidated {} cache entries", command, removed);
        }
    }

    /// The reserved status command: daemon/pool/cache/auth metrics without
    /// touching the result cache.
    fn status_result(&self) -> CommandResult {
        let cache = self.cache.stats();
        let pools = self.pools.status();
        let auth = self.auth.metrics();
        let uptime = self.started.elapsed().as_secs();
        let total = self.total_requests.load(Ordering::Relaxed);

        let metadata = serde_json::json!({
            "pid": std::process::id(),
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": uptime,
            "total_requests": total,
            "active_clients": self.slots.active(),
            "idle_secs": self.idle_for().as_secs(),
            "cache": {
                "entries": cache.entries,
                "capacity": cache.capacity,
                "ttl_seconds": cache.ttl_seconds,
                "usage_pct": cache.usage_pct,
                "hits": cache.hits,
                "misses": cache.misses,
                "evictions": cache.evictions,
                "invalidations": cache.invalidations,
            },
            "pools": {
                "imap_connected": pools.imap_connected,
                "smtp_connected": pools.smtp_connected,
            },
            "auth": {
                "verifications": auth.verifications,
                "failures": auth.failures,
            },
        });

        let mut result = CommandResult::ok(format!(
            "daemon up {}s, {} request(s) served, {} client(s) connected",
            uptime,
            total,
            self.slots.active()
        ));
        if let Value::Object(map) = metadata {
            result.metadata = map;
        }
        result.with_meta("via_daemon", Value::from(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::{ImapSession, MailError, MessageSummary, SmtpSender};
    use crate::pool::ClientFactory;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    struct OfflineImapFactory;
    impl ClientFactory<Box<dyn ImapSession>> for OfflineImapFactory {
        fn create(&self) -> Result<Box<dyn ImapSession>, MailError> {
            Err(MailError::Connect("offline".to_string()))
        }
    }

    struct OfflineSmtpFactory;
    impl ClientFactory<Box<dyn SmtpSender>> for OfflineSmtpFactory {
        fn create(&self) -> Result<Box<dyn SmtpSender>, MailError> {
            Err(MailError::Connect("offline".to_string()))
        }
    }

    /// Router stub: every execution returns a fresh numbered payload so cache
    /// hits are distinguishable from re-executions.
    struct CountingRouter {
        executions: AtomicU32,
        delay: Option<Duration>,
    }

    impl CountingRouter {
        fn new() -> Self {
            Self {
                executions: AtomicU32::new(0),
                delay: None,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                executions: AtomicU32::new(0),
                delay: Some(delay),
            }
        }
    }

    impl CommandRouter for CountingRouter {
        fn execute(&self, request: &CommandRequest) -> Result<CommandResult, RouterError> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            let n = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
            match Command::parse(&request.command) {
                Some(_) => Ok(CommandResult::ok(format!("execution-{n}"))),
                None => Err(RouterError::Unknown(request.command.clone())),
            }
        }
    }

    fn daemon_with_router(dir: &TempDir, router: Arc<dyn CommandRouter>) -> Arc<Daemon> {
        let home = dir.path().to_path_buf();
        let mut config = DaemonConfig::new(home.clone());
        config.command_timeout = Duration::from_millis(200);
        config.idle_check_period = Duration::from_millis(50);

        let pools = Arc::new(PoolManager::with_timeouts(
            Box::new(OfflineImapFactory),
            Box::new(OfflineSmtpFactory),
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(60),
        ));

        Arc::new(Daemon::new(
            config,
            router,
            Arc::new(ResultCache::with_defaults()),
            Arc::new(AuthManager::new(crate::determine_token_path(&home))),
            pools,
        ))
    }

    #[test]
    fn test_cacheable_command_hits_cache_on_repeat() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon_with_router(&dir, Arc::new(CountingRouter::new()));
        let request = CommandRequest::new("list").with_arg("limit", json!(10));

        let first = daemon.dispatch(&request);
        assert!(first.success);
        assert!(!first.cached);
        assert_eq!(first.data.as_deref(), Some("execution-1"));

        let second = daemon.dispatch(&request);
        assert!(second.cached);
        assert_eq!(second.data.as_deref(), Some("execution-1"));
        let age = second.metadata.get("cache_age_seconds").unwrap().as_u64().unwrap();
        assert!(age < 60);
    }

    #[test]
    fn test_write_command_is_never_cached() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon_with_router(&dir, Arc::new(CountingRouter::new()));
        let request = CommandRequest::new("flag").with_arg("id", json!(1));

        let first = daemon.dispatch(&request);
        let second = daemon.dispatch(&request);

        assert_eq!(first.data.as_deref(), Some("execution-1"));
        assert_eq!(second.data.as_deref(), Some("execution-2"));
    }

    #[test]
    fn test_flag_invalidates_list_cache() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon_with_router(&dir, Arc::new(CountingRouter::new()));
        let list = CommandRequest::new("list").with_arg("limit", json!(10));

        daemon.dispatch(&list);
        assert!(daemon.dispatch(&list).cached);

        // flag against the same (default) folder clears the listing cache
        daemon.dispatch(&CommandRequest::new("flag").with_arg("id", json!(42)));

        let after = daemon.dispatch(&list);
        assert!(!after.cached);
        assert_eq!(after.data.as_deref(), Some("execution-3"));
    }

    #[test]
    fn test_move_invalidates_both_folders() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon_with_router(&dir, Arc::new(CountingRouter::new()));

        let inbox = CommandRequest::new("list").with_arg("folder", json!("inbox"));
        let archive = CommandRequest::new("list").with_arg("folder", json!("archive"));
        let sent = CommandRequest::new("list").with_arg("folder", json!("sent"));
        daemon.dispatch(&inbox);
        daemon.dispatch(&archive);
        daemon.dispatch(&sent);

        daemon.dispatch(
            &CommandRequest::new("move")
                .with_arg("id", json!(1))
                .with_arg("folder", json!("inbox"))
                .with_arg("to", json!("archive")),
        );

        assert!(!daemon.dispatch(&inbox).cached);
        assert!(!daemon.dispatch(&archive).cached);
        // The uninvolved folder survives
        assert!(daemon.dispatch(&sent).cached);
    }

    #[test]
    fn test_send_invalidates_sent_folder_only() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon_with_router(&dir, Arc::new(CountingRouter::new()));

        let inbox = CommandRequest::new("list").with_arg("folder", json!("inbox"));
        let sent = CommandRequest::new("list").with_arg("folder", json!("sent"));
        daemon.dispatch(&inbox);
        daemon.dispatch(&sent);

        daemon.dispatch(&CommandRequest::new("send").with_arg("to", json!("x@example.com")));

        assert!(daemon.dispatch(&inbox).cached);
        assert!(!daemon.dispatch(&sent).cached);
    }

    #[test]
    fn test_refresh_invalidates_everything() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon_with_router(&dir, Arc::new(CountingRouter::new()));

        let inbox = CommandRequest::new("list").with_arg("folder", json!("inbox"));
        let folders = CommandRequest::new("folders");
        daemon.dispatch(&inbox);
        daemon.dispatch(&folders);

        daemon.dispatch(&CommandRequest::new("refresh"));

        assert!(!daemon.dispatch(&inbox).cached);
        assert!(!daemon.dispatch(&folders).cached);
    }

    #[test]
    fn test_unknown_command_becomes_failed_result() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon_with_router(&dir, Arc::new(CountingRouter::new()));

        let result = daemon.dispatch(&CommandRequest::new("frobnicate"));

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("unknown command: frobnicate"));
        assert_eq!(result.metadata.get("unknown_command"), Some(&json!(true)));
    }

    #[test]
    fn test_command_timeout_becomes_failed_result() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon_with_router(
            &dir,
            Arc::new(CountingRouter::slow(Duration::from_millis(600))),
        );

        let result = daemon.dispatch(&CommandRequest::new("list"));

        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[test]
    fn test_status_reports_metrics_without_touching_cache() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon_with_router(&dir, Arc::new(CountingRouter::new()));

        daemon.dispatch(&CommandRequest::new("list"));
        let status = daemon.dispatch(&CommandRequest::new("status"));

        assert!(status.success);
        assert!(!status.cached);
        assert_eq!(
            status.metadata.get("pid").and_then(|v| v.as_u64()),
            Some(std::process::id() as u64)
        );
        let cache = status.metadata.get("cache").unwrap();
        assert_eq!(cache.get("entries"), Some(&json!(1)));
        assert_eq!(cache.get("capacity"), Some(&json!(50)));

        // status itself is never cached
        let again = daemon.dispatch(&CommandRequest::new("status"));
        assert!(!again.cached);
    }

    #[test]
    fn test_responses_carry_via_daemon_marker() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon_with_router(&dir, Arc::new(CountingRouter::new()));

        let result = daemon.dispatch(&CommandRequest::new("list"));
        assert_eq!(result.metadata.get("via_daemon"), Some(&json!(true)));
    }

    #[test]
    fn test_client_slots_admission_bound() {
        let slots = ClientSlots::new(2);

        let first = ClientSlots::try_acquire(&slots, Duration::from_millis(10)).expect("slot 1");
        let _second = ClientSlots::try_acquire(&slots, Duration::from_millis(10)).expect("slot 2");
        assert_eq!(slots.active(), 2);

        // Third concurrent acquire is turned away
        assert!(ClientSlots::try_acquire(&slots, Duration::from_millis(30)).is_none());

        drop(first);
        assert!(ClientSlots::try_acquire(&slots, Duration::from_millis(30)).is_some());
    }

    #[test]
    fn test_client_slots_release_unblocks_waiter() {
        let slots = ClientSlots::new(1);
        let held = ClientSlots::try_acquire(&slots, Duration::from_millis(10)).expect("slot");

        let slots_clone = Arc::clone(&slots);
        let waiter = std::thread::spawn(move || {
            ClientSlots::try_acquire(&slots_clone, Duration::from_millis(500)).is_some()
        });

        std::thread::sleep(Duration::from_millis(50));
        drop(held);

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_drain_waits_for_release() {
        let slots = ClientSlots::new(4);
        let held = ClientSlots::try_acquire(&slots, Duration::from_millis(10)).expect("slot");

        assert!(!slots.drain(Duration::from_millis(40)));

        drop(held);
        assert!(slots.drain(Duration::from_millis(40)));
    }

    #[test]
    fn test_idle_clock_tracks_activity() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon_with_router(&dir, Arc::new(CountingRouter::new()));

        std::thread::sleep(Duration::from_millis(30));
        assert!(daemon.idle_for() >= Duration::from_millis(20));

        daemon.touch_activity();
        assert!(daemon.idle_for() < Duration::from_millis(20));
    }
}
