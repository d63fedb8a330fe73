use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use mbx_lib::mail::{ImapSession, MailError, SmtpSender};
use mbx_lib::pool::ClientFactory;
use mbx_lib::{
    determine_token_path, AuthManager, CommandRequest, CommandResult, CommandRouter, Daemon,
    DaemonConfig, PoolManager, ResultCache, RouterError,
};

/// A home directory for tests. Deliberately NOT under /tmp: the daemon's
/// socket guard refuses world-writable temp locations, so test homes live
/// under the build directory instead.
pub fn test_home() -> TempDir {
    let base = PathBuf::from(env!("CARGO_TARGET_TMPDIR"));
    std::fs::create_dir_all(&base).expect("Failed to create test base dir");
    TempDir::new_in(base).expect("Failed to create temp home")
}

/// Router stub for daemon integration tests: numbered payloads make cache
/// hits distinguishable from re-executions without a mail server.
pub struct ScriptedRouter {
    pub executions: AtomicU32,
}

impl ScriptedRouter {
    pub fn new() -> Self {
        Self {
            executions: AtomicU32::new(0),
        }
    }
}

impl CommandRouter for ScriptedRouter {
    fn execute(&self, request: &CommandRequest) -> Result<CommandResult, RouterError> {
        match request.command.as_str() {
            "bogus" => Err(RouterError::Unknown(request.command.clone())),
            "failing" => Err(RouterError::Failed("scripted failure".to_string())),
            "slow" => {
                std::thread::sleep(Duration::from_millis(500));
                Ok(CommandResult::ok("slow done"))
            }
            _ => {
                let n = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(CommandResult::ok(format!("execution-{n}")))
            }
        }
    }
}

/// Always-failing factories: integration tests route through ScriptedRouter,
/// so the pools never actually connect.
pub struct OfflineImapFactory;

impl ClientFactory<Box<dyn ImapSession>> for OfflineImapFactory {
    fn create(&self) -> Result<Box<dyn ImapSession>, MailError> {
        Err(MailError::Connect("offline".to_string()))
    }
}

pub struct OfflineSmtpFactory;

impl ClientFactory<Box<dyn SmtpSender>> for OfflineSmtpFactory {
    fn create(&self) -> Result<Box<dyn SmtpSender>, MailError> {
        Err(MailError::Connect("offline".to_string()))
    }
}

/// A daemon running on a real Unix socket inside a private test home.
pub struct TestDaemon {
    pub home: TempDir,
    pub daemon: Arc<Daemon>,
    handle: std::sync::Mutex<Option<JoinHandle<eyre::Result<()>>>>,
}

impl TestDaemon {
    pub fn start() -> Self {
        Self::start_with(|_| {})
    }

    /// Start a daemon after letting the caller adjust the config.
    pub fn start_with(tweak: impl FnOnce(&mut DaemonConfig)) -> Self {
        let home = test_home();
        let mut config = DaemonConfig::new(home.path().to_path_buf());
        config.idle_timeout = Duration::from_secs(600);
        config.idle_check_period = Duration::from_secs(600);
        config.command_timeout = Duration::from_millis(300);
        config.shutdown_grace = Duration::from_secs(2);
        tweak(&mut config);

        let pools = Arc::new(PoolManager::with_timeouts(
            Box::new(OfflineImapFactory),
            Box::new(OfflineSmtpFactory),
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(600),
        ));

        let daemon = Arc::new(Daemon::new(
            config,
            Arc::new(ScriptedRouter::new()),
            Arc::new(ResultCache::with_defaults()),
            Arc::new(AuthManager::new(determine_token_path(home.path()))),
            pools,
        ));

        let runner = Arc::clone(&daemon);
        let handle = std::thread::spawn(move || runner.run());

        let started = Self {
            home,
            daemon,
            handle: std::sync::Mutex::new(Some(handle)),
        };
        started.wait_until_listening();
        started
    }

    pub fn socket_path(&self) -> PathBuf {
        self.daemon.config().socket_path.clone()
    }

    pub fn pid_path(&self) -> PathBuf {
        self.daemon.config().pid_path.clone()
    }

    pub fn token(&self) -> String {
        AuthManager::new(determine_token_path(self.home.path()))
            .get_token()
            .expect("token should exist")
    }

    fn wait_until_listening(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.socket_path().exists() && self.pid_path().exists() {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("daemon did not start listening in time");
    }

    pub fn connect(&self) -> UnixStream {
        let stream = UnixStream::connect(self.socket_path()).expect("Failed to connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("Failed to set read timeout");
        stream
    }

    /// One full protocol exchange: auth line, command line, one response line.
    pub fn roundtrip(&self, token: &str, request: &CommandRequest) -> CommandResult {
        let mut stream = self.connect();

        let auth_line = format!("{{\"token\": \"{token}\"}}");
        let request_line = serde_json::to_string(request).expect("Failed to serialize request");
        writeln!(stream, "{auth_line}").expect("Failed to write auth line");
        writeln!(stream, "{request_line}").expect("Failed to write request line");

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        reader
            .read_line(&mut response_line)
            .expect("Failed to read response");

        serde_json::from_str(response_line.trim()).expect("Failed to parse response")
    }

    /// Shut the daemon down and wait for its accept loop to finish.
    pub fn stop(&self) {
        self.daemon.request_shutdown();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}
