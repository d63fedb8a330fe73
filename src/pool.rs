use log::{debug, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::mail::{ImapSession, MailError, SmtpSender};

/// Connection pooling for the protocol clients.
///
/// Each pool wraps one lazily-created client. Staleness is time-based, not
/// just failure-based: a pooled client is discarded whenever it has been idle
/// past the pool timeout, independent of whether the transport would still
/// answer.

/// IMAP sessions are long-lived browsing sessions.
pub const IMAP_POOL_TIMEOUT_SECS: u64 = 300;

/// SMTP connections serve a single send and then likely sit idle.
pub const SMTP_POOL_TIMEOUT_SECS: u64 = 60;

/// How often the keepalive loop wakes to NOOP a live IMAP client.
pub const KEEPALIVE_PERIOD_SECS: u64 = 60;

const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Factory injected into a pool; the wire protocol lives behind it.
pub trait ClientFactory<T>: Send + Sync {
    fn create(&self) -> Result<T, MailError>;
}

/// A client a pool knows how to let go of. Close errors are ignored: the
/// client is being discarded either way.
pub trait PooledClient: Send {
    fn close(&mut self);
}

impl PooledClient for Box<dyn ImapSession> {
    fn close(&mut self) {
        let _ = self.logout();
    }
}

impl PooledClient for Box<dyn SmtpSender> {
    fn close(&mut self) {
        let _ = SmtpSender::close(self.as_mut());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PoolError {
    /// Creation failed after exhausting the reconnect budget. Attributed to
    /// the specific pool so a partial failure (send down, fetch up) is
    /// visible to the caller.
    Exhausted {
        pool: String,
        attempts: u32,
        last_error: String,
    },
    /// The pooled client failed mid-operation.
    Client { pool: String, error: String },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Exhausted {
                pool,
                attempts,
                last_error,
            } => write!(
                f,
                "{pool} pool: connection failed after {attempts} attempts: {last_error}"
            ),
            PoolError::Client { pool, error } => write!(f, "{pool} pool: {error}"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Delay before retry `attempt` (1-based): 2, 4, 8, ... capped at 30 seconds.
pub fn exponential_backoff(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt).min(30))
}

struct PoolState<T> {
    client: Option<T>,
    last_used: Option<Instant>,
    reconnect_attempts: u32,
}

pub struct ConnectionPool<T: PooledClient> {
    label: String,
    timeout: Duration,
    max_reconnect_attempts: u32,
    factory: Box<dyn ClientFactory<T>>,
    backoff: fn(u32) -> Duration,
    state: Mutex<PoolState<T>>,
}

impl<T: PooledClient> ConnectionPool<T> {
    pub fn new(label: impl Into<String>, timeout: Duration, factory: Box<dyn ClientFactory<T>>) -> Self {
        Self::with_backoff(label, timeout, factory, exponential_backoff)
    }

    /// Injectable backoff schedule so tests don't sleep for real.
    pub fn with_backoff(
        label: impl Into<String>,
        timeout: Duration,
        factory: Box<dyn ClientFactory<T>>,
        backoff: fn(u32) -> Duration,
    ) -> Self {
        Self {
            label: label.into(),
            timeout,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            factory,
            backoff,
            state: Mutex::new(PoolState {
                client: None,
                last_used: None,
                reconnect_attempts: 0,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run a closure against the pooled client, creating or recreating it as
    /// needed. Every successful call restarts the TTL clock.
    pub fn with_client<R>(
        &self,
        f: impl FnOnce(&mut T) -> Result<R, MailError>,
    ) -> Result<R, PoolError> {
        let mut state = self.state.lock().expect("pool lock poisoned");

        if let Some(last_used) = state.last_used {
            if state.client.is_some() && last_used.elapsed() > self.timeout {
                debug!(
                    "⏳ {} pool expired after {}s idle, discarding client",
                    self.label,
                    last_used.elapsed().as_secs()
                );
                if let Some(mut old) = state.client.take() {
                    old.close();
                }
            }
        }

        if state.client.is_none() {
            let client = self.create_with_retries(&mut state.reconnect_attempts)?;
            state.client = Some(client);
        }

        state.last_used = Some(Instant::now());

        let client = state.client.as_mut().expect("client was just ensured");
        match f(client) {
            Ok(result) => {
                state.last_used = Some(Instant::now());
                Ok(result)
            }
            Err(error) => {
                // A failed operation leaves the session in an unknown state;
                // force a reconnect on next use
                warn!("⚠️ {} client failed mid-operation: {}", self.label, error);
                if let Some(mut broken) = state.client.take() {
                    broken.close();
                }
                state.last_used = None;
                Err(PoolError::Client {
                    pool: self.label.clone(),
                    error: error.to_string(),
                })
            }
        }
    }

    fn create_with_retries(&self, reconnect_attempts: &mut u32) -> Result<T, PoolError> {
        let mut last_error = String::new();

        for attempt in 1..=self.max_reconnect_attempts {
            *reconnect_attempts = attempt;
            debug!(
                "🔌 {} pool connecting (attempt {}/{})",
                self.label, attempt, self.max_reconnect_attempts
            );

            match self.factory.create() {
                Ok(client) => {
                    info!("✅ {} pool connected on attempt {}", self.label, attempt);
                    *reconnect_attempts = 0;
                    return Ok(client);
                }
                Err(error) => {
                    warn!(
                        "❌ {} pool connect attempt {} failed: {}",
                        self.label, attempt, error
                    );
                    last_error = error.to_string();
                    if attempt < self.max_reconnect_attempts {
                        std::thread::sleep((self.backoff)(attempt));
                    }
                }
            }
        }

        // Exceeding the budget resets the counter and surfaces the last error
        *reconnect_attempts = 0;
        Err(PoolError::Exhausted {
            pool: self.label.clone(),
            attempts: self.max_reconnect_attempts,
            last_error,
        })
    }

    /// Cheap local check: a client exists and the pool is not expired.
    /// Does not probe the network.
    pub fn health_check(&self) -> bool {
        let state = self.state.lock().expect("pool lock poisoned");
        match (&state.client, state.last_used) {
            (Some(_), Some(last_used)) => last_used.elapsed() <= self.timeout,
            _ => false,
        }
    }

    /// Release the underlying client if present; idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("pool lock poisoned");
        if let Some(mut client) = state.client.take() {
            debug!("🔌 {} pool closing client", self.label);
            client.close();
        }
        state.last_used = None;
    }

    /// Force the next use to reconnect without closing eagerly being
    /// observable to callers (used on config reload).
    pub fn expire(&self) {
        self.close();
    }
}

/// Snapshot of both pools for the daemon status surface.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    pub imap_connected: bool,
    pub smtp_connected: bool,
}

/// Owns the IMAP and SMTP pools and the keepalive loop that stops long-lived
/// IMAP sessions from being dropped by the server.
pub struct PoolManager {
    imap: Arc<ConnectionPool<Box<dyn ImapSession>>>,
    smtp: Arc<ConnectionPool<Box<dyn SmtpSender>>>,
    keepalive_period: Duration,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl PoolManager {
    pub fn new(
        imap_factory: Box<dyn ClientFactory<Box<dyn ImapSession>>>,
        smtp_factory: Box<dyn ClientFactory<Box<dyn SmtpSender>>>,
    ) -> Self {
        Self::with_timeouts(
            imap_factory,
            smtp_factory,
            Duration::from_secs(IMAP_POOL_TIMEOUT_SECS),
            Duration::from_secs(SMTP_POOL_TIMEOUT_SECS),
            Duration::from_secs(KEEPALIVE_PERIOD_SECS),
        )
    }

    pub fn with_timeouts(
        imap_factory: Box<dyn ClientFactory<Box<dyn ImapSession>>>,
        smtp_factory: Box<dyn ClientFactory<Box<dyn SmtpSender>>>,
        imap_timeout: Duration,
        smtp_timeout: Duration,
        keepalive_period: Duration,
    ) -> Self {
        Self {
            imap: Arc::new(ConnectionPool::new("imap", imap_timeout, imap_factory)),
            smtp: Arc::new(ConnectionPool::new("smtp", smtp_timeout, smtp_factory)),
            keepalive_period,
            keepalive: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn imap(&self) -> &ConnectionPool<Box<dyn ImapSession>> {
        &self.imap
    }

    pub fn smtp(&self) -> &ConnectionPool<Box<dyn SmtpSender>> {
        &self.smtp
    }

    /// Spawn the keepalive thread. Only a live, non-expired IMAP client gets
    /// a NOOP; a NOOP failure closes that pool's client (forcing reconnect on
    /// next use) rather than crashing the loop.
    pub fn start_keepalive(&self) {
        let imap = Arc::clone(&self.imap);
        let shutdown = Arc::clone(&self.shutdown);
        let period = self.keepalive_period;

        let handle = std::thread::Builder::new()
            .name("mbx-keepalive".to_string())
            .spawn(move || {
                debug!("💓 Keepalive loop started ({}s period)", period.as_secs());
                let tick = period.clamp(Duration::from_millis(10), Duration::from_millis(250));
                let mut slept = Duration::ZERO;

                while !shutdown.load(Ordering::Relaxed) {
                    std::thread::sleep(tick);
                    slept += tick;
                    if slept < period {
                        continue;
                    }
                    slept = Duration::ZERO;

                    if !imap.health_check() {
                        continue;
                    }

                    match imap.with_client(|client| client.noop()) {
                        Ok(()) => debug!("💓 IMAP keepalive NOOP ok"),
                        Err(error) => {
                            // with_client already discarded the broken client
                            warn!("💔 IMAP keepalive failed: {}", error);
                        }
                    }
                }
                debug!("💓 Keepalive loop stopped");
            })
            .expect("failed to spawn keepalive thread");

        *self.keepalive.lock().expect("keepalive lock poisoned") = Some(handle);
    }

    /// Signal shutdown, join the keepalive thread, and close both pools.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.keepalive.lock().expect("keepalive lock poisoned").take() {
            let _ = handle.join();
        }
        self.imap.close();
        self.smtp.close();
    }

    /// Drop both clients so the next use reconnects with fresh credentials.
    pub fn expire_all(&self) {
        self.imap.expire();
        self.smtp.expire();
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            imap_connected: self.imap.health_check(),
            smtp_connected: self.smtp.health_check(),
        }
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        self.stop();
    }
}
