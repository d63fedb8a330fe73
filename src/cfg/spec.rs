// src/cfg/spec.rs

use eyre::{eyre, Result};
use regex::Regex;
use serde::Deserialize;

const fn default_version() -> i32 {
    1
}

const fn default_defaults() -> Defaults {
    Defaults {
        version: default_version(),
    }
}

const fn default_imap_port() -> u16 {
    993
}

const fn default_smtp_port() -> u16 {
    465
}

const fn default_idle_timeout_secs() -> u64 {
    1800
}

const fn default_max_clients() -> usize {
    10
}

const fn default_cache_ttl_secs() -> u64 {
    60
}

const fn default_cache_max_entries() -> usize {
    50
}

const fn default_command_timeout_secs() -> u64 {
    30
}

const fn default_token_max_age_hours() -> u64 {
    24
}

const fn default_daemon() -> DaemonTuning {
    DaemonTuning {
        idle_timeout_secs: default_idle_timeout_secs(),
        max_clients: default_max_clients(),
        cache_ttl_secs: default_cache_ttl_secs(),
        cache_max_entries: default_cache_max_entries(),
        command_timeout_secs: default_command_timeout_secs(),
        token_max_age_hours: default_token_max_age_hours(),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_version")]
    pub version: i32,
}

/// One mail account. Credentials are either a literal password or a command
/// that prints it; keystore encryption is out of scope here.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub name: String,

    pub email: String,

    pub imap_host: String,

    #[serde(default = "default_imap_port")]
    pub imap_port: u16,

    pub smtp_host: String,

    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    pub username: String,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub password_cmd: Option<String>,
}

/// Daemon tuning knobs; every field has a production default so a minimal
/// config stays minimal.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct DaemonTuning {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_token_max_age_hours")]
    pub token_max_age_hours: u64,
}

impl Default for DaemonTuning {
    fn default() -> Self {
        default_daemon()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Spec {
    #[serde(default = "default_defaults")]
    pub defaults: Defaults,

    pub account: Account,

    #[serde(default = "default_daemon")]
    pub daemon: DaemonTuning,
}

impl Spec {
    /// Sanity-check the parts the daemon cannot limp along without.
    pub fn validate(&self) -> Result<()> {
        let email_re = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$")?;

        if !email_re.is_match(&self.account.email) {
            return Err(eyre!("account email {:?} is not a valid address", self.account.email));
        }
        if self.account.imap_host.is_empty() {
            return Err(eyre!("account imap_host must not be empty"));
        }
        if self.account.smtp_host.is_empty() {
            return Err(eyre!("account smtp_host must not be empty"));
        }
        if self.account.username.is_empty() {
            return Err(eyre!("account username must not be empty"));
        }
        if self.account.password.is_none() && self.account.password_cmd.is_none() {
            return Err(eyre!("account needs either password or password_cmd"));
        }
        if self.daemon.max_clients == 0 {
            return Err(eyre!("daemon.max_clients must be at least 1"));
        }
        Ok(())
    }
}
