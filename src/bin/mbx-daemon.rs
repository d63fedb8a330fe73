use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// Import from the shared library
use mbx_lib::system::{CommandRunner, RealCommandRunner};
use mbx_lib::{
    determine_token_path, get_config_path_with_override, home_dir, setup_logging, shared_account,
    AuthManager, ConfigLoader, Daemon, DaemonConfig, ImapFactory, MailRouter, PoolManager,
    ResultCache, SmtpFactory,
};

#[derive(Parser)]
#[command(name = "mbx-daemon", about = "MBX Mail Daemon")]
struct DaemonOpts {
    #[clap(long, help = "Log to stdout instead of the log file")]
    foreground: bool,

    #[clap(short, long)]
    config: Option<PathBuf>,
}

fn build_daemon(opts: &DaemonOpts) -> eyre::Result<(Arc<Daemon>, PathBuf, mbx_lib::SharedAccount)> {
    use std::time::Instant;

    let start_daemon_init = Instant::now();
    log::debug!("🚀 Daemon initializing, loading config...");

    let home = home_dir()?;
    let config_path = get_config_path_with_override(&home, &opts.config)?;
    let spec = ConfigLoader::new().load(&config_path)?;

    let account = shared_account(spec.account.clone());
    let runner: Arc<dyn CommandRunner> = Arc::new(RealCommandRunner);

    let pools = Arc::new(PoolManager::new(
        Box::new(ImapFactory::new(Arc::clone(&account), Arc::clone(&runner))),
        Box::new(SmtpFactory::new(Arc::clone(&account), runner)),
    ));

    let router = Arc::new(MailRouter::new(Arc::clone(&pools), Arc::clone(&account)));
    let cache = Arc::new(ResultCache::new(
        spec.daemon.cache_max_entries,
        Duration::from_secs(spec.daemon.cache_ttl_secs),
    ));
    let auth = Arc::new(AuthManager::new(determine_token_path(&home)));

    let config = DaemonConfig::new(home).with_tuning(&spec.daemon);
    let daemon = Arc::new(Daemon::new(config, router, cache, auth, pools));

    log::debug!(
        "✅ Daemon initialization complete: {:.3}ms",
        start_daemon_init.elapsed().as_secs_f64() * 1000.0
    );

    Ok((daemon, config_path, account))
}

fn main() {
    let opts = DaemonOpts::parse();

    // Set up logging
    if opts.foreground {
        env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", "info"))
            .target(env_logger::Target::Stdout)
            .init();
    } else {
        let home = match home_dir() {
            Ok(home) => home,
            Err(e) => {
                eprintln!("Failed to determine home directory: {e}");
                std::process::exit(1);
            }
        };
        if let Err(e) = setup_logging(&home) {
            eprintln!("Warning: Failed to set up logging: {e}");
        }
    }

    info!("🚀 MBX Daemon starting...");

    // Build the daemon from config
    let (daemon, config_path, account) = match build_daemon(&opts) {
        Ok(parts) => parts,
        Err(e) => {
            error!("Failed to create daemon: {e}");
            eprintln!("Failed to create daemon: {e}");
            std::process::exit(1);
        }
    };

    // Set up signal handling
    let shutdown = daemon.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("🛑 Shutdown signal received");
        shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
    }) {
        error!("Error setting signal handler: {e}");
        std::process::exit(1);
    }

    // Reload the account and drop stale state when the config file changes
    daemon.watch_config(config_path, account);

    info!("✅ Daemon running (PID: {})", std::process::id());

    // Run the server; run() handles its own cleanup sequence
    if let Err(e) = daemon.run() {
        error!("Server error: {e}");
        eprintln!("Server error: {e}");
        std::process::exit(1);
    }

    info!("👋 Daemon stopped");
}
