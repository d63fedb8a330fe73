use eyre::{eyre, Result};
use log::debug;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::xxh3_64;

pub mod auth;
pub mod breaker;
pub mod cache;
pub mod cfg;
pub mod daemon;
#[path = "daemon-client.rs"]
pub mod daemon_client;
pub mod error;
pub mod mail;
pub mod pool;
pub mod protocol;
pub mod router;
pub mod system;
pub mod timing;

// Re-export for binaries
pub use auth::{AuthManager, SocketGuard};
pub use breaker::{BreakerState, CircuitBreaker};
pub use cache::{cache_key, ResultCache};
pub use cfg::loader::Loader as ConfigLoader;
pub use cfg::spec::{Account, DaemonTuning, Spec as ConfigSpec};
pub use daemon::{Daemon, DaemonConfig};
pub use daemon_client::{DaemonClient, DaemonClientConfig, DaemonError};
pub use error::MbxError;
pub use mail::{shared_account, ImapFactory, SharedAccount, SmtpFactory};
pub use pool::PoolManager;
pub use protocol::{AuthLine, CommandRequest, CommandResult};
pub use router::{Command, CommandRouter, DirectRouter, MailRouter, RouterError};
pub use timing::{log_timing, TimingCollector, TimingData};

// Processing mode enum to track daemon vs direct processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    Daemon, // Processing via daemon (goblin emoji 👹)
    Direct, // Processing directly (inbox emoji 📥)
}

/// Per-user application directory holding socket, pid file, token and logs
pub fn data_dir(home_dir: &Path) -> PathBuf {
    home_dir.join(".local").join("share").join("mbx")
}

// Utility functions to determine runtime file locations. The socket lives
// under the home directory so the SocketGuard home-containment check holds.
pub fn determine_socket_path(home_dir: &Path) -> PathBuf {
    data_dir(home_dir).join("daemon.sock")
}

pub fn determine_pid_path(home_dir: &Path) -> PathBuf {
    data_dir(home_dir).join("daemon.pid")
}

pub fn determine_token_path(home_dir: &Path) -> PathBuf {
    data_dir(home_dir).join("daemon.token")
}

pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| eyre!("Could not determine home directory"))
}

pub fn get_config_path(home_dir: &Path) -> Result<PathBuf> {
    let config_dirs = [home_dir.join(".config").join("mbx"), home_dir.to_path_buf()];

    let config_files = ["mbx.yml", "mbx.yaml", ".mbx.yml", ".mbx.yaml"];
    let mut attempted_paths = Vec::new();

    for config_dir in &config_dirs {
        for config_file in &config_files {
            let path = config_dir.join(config_file);
            attempted_paths.push(path.clone());
            if path.exists() {
                return Ok(path);
            }
        }
    }

    Err(eyre!(MbxError::ConfigNotFound {
        attempted_paths,
        home_dir: home_dir.to_path_buf(),
        custom_path: None,
    }))
}

pub fn get_config_path_with_override(
    home_dir: &Path,
    override_path: &Option<PathBuf>,
) -> Result<PathBuf> {
    match override_path {
        Some(path) => {
            if path.exists() {
                Ok(path.clone())
            } else {
                Err(eyre!(MbxError::ConfigNotFound {
                    attempted_paths: vec![path.clone()],
                    home_dir: home_dir.to_path_buf(),
                    custom_path: Some(path.clone()),
                }))
            }
        }
        None => get_config_path(home_dir),
    }
}

pub fn setup_logging(home_dir: &Path) -> Result<()> {
    if timing::is_benchmark_mode() {
        // In benchmark mode, log to stdout for visibility
        env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", "info"))
            .target(env_logger::Target::Stdout)
            .init();
    } else {
        // In normal mode, log to file
        let log_file_path = match std::env::var("MBX_LOG_FILE") {
            Ok(path) => PathBuf::from(path),
            Err(_) => data_dir(home_dir).join("logs").join("mbx.log"),
        };

        if let Some(parent) = log_file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file_path)?;

        env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", "info"))
            .target(env_logger::Target::Pipe(Box::new(log_file)))
            .init();
    }

    Ok(())
}

/// Content hash of the config file, used to detect changes across the
/// daemon's lifetime and to report config identity in status output.
pub fn hash_config_file(config_path: &Path) -> Result<String> {
    let content = std::fs::read(config_path)?;
    let hash = xxh3_64(&content);
    debug!("🔒 Config hash: {:016x}", hash);
    Ok(format!("{:016x}", hash))
}
