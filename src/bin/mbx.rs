use clap::{Parser, Subcommand};
use colored::Colorize;
use log::debug;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

// Import from the shared library
use mbx_lib::{
    determine_pid_path, determine_socket_path, determine_token_path, home_dir, log_timing,
    setup_logging, AuthManager, CommandResult, CommandRouter, DaemonClient, DaemonClientConfig,
    DirectRouter, ProcessingMode, TimingCollector,
};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/git_describe.rs"));
}

#[derive(Parser)]
#[command(name = "mbx", about = "[m]ail[b]o[x]: a daemon-backed personal email client")]
#[command(version = built_info::GIT_DESCRIBE)]
#[command(author = "Scott A. Idler <scott.a.idler@gmail.com>")]
#[command(arg_required_else_help = true)]
struct MbxOpts {
    #[clap(short, long)]
    config: Option<PathBuf>,

    #[clap(long, help = "Execute directly, bypassing the daemon")]
    direct: bool,

    #[clap(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    #[clap(name = "ls", about = "list messages in a folder")]
    List(ListOpts),

    #[clap(about = "view one message")]
    View(IdOpts),

    #[clap(about = "search messages by keyword")]
    Search(SearchOpts),

    #[clap(about = "list flagged messages")]
    Flagged(ListOpts),

    #[clap(about = "list unflagged messages")]
    Unflagged(ListOpts),

    #[clap(about = "list folders")]
    Folders,

    #[clap(about = "flag a message")]
    Flag(IdOpts),

    #[clap(about = "unflag a message")]
    Unflag(IdOpts),

    #[clap(name = "mv", about = "move a message to another folder")]
    Move(MoveOpts),

    #[clap(name = "rm", about = "delete a message")]
    Delete(IdOpts),

    #[clap(about = "send a message")]
    Send(SendOpts),

    #[clap(about = "save a draft")]
    Compose(SendOpts),

    #[clap(about = "force a mailbox refresh")]
    Refresh,

    #[clap(about = "show daemon status and metrics")]
    Status,

    #[clap(about = "manage the mbx daemon")]
    Daemon(DaemonCmdOpts),

    #[clap(about = "manage the daemon auth token")]
    Token(TokenOpts),
}

#[derive(Parser)]
struct ListOpts {
    folder: Option<String>,

    #[clap(short, long)]
    limit: Option<usize>,
}

#[derive(Parser)]
struct IdOpts {
    id: u32,

    #[clap(short, long)]
    folder: Option<String>,
}

#[derive(Parser)]
struct SearchOpts {
    keyword: String,

    #[clap(short, long)]
    folder: Option<String>,

    #[clap(short, long)]
    limit: Option<usize>,
}

#[derive(Parser)]
struct MoveOpts {
    id: u32,

    #[clap(help = "destination folder")]
    to: String,

    #[clap(short, long, help = "source folder")]
    folder: Option<String>,
}

#[derive(Parser)]
struct SendOpts {
    #[clap(required = true, help = "recipient address(es)")]
    to: Vec<String>,

    #[clap(short, long, default_value = "")]
    subject: String,

    #[clap(short, long, default_value = "")]
    body: String,
}

#[derive(Parser)]
struct DaemonCmdOpts {
    #[clap(long, help = "Start daemon")]
    start: bool,

    #[clap(long, help = "Stop daemon")]
    stop: bool,

    #[clap(long, help = "Restart daemon")]
    restart: bool,

    #[clap(long, help = "Show daemon status")]
    status: bool,
}

#[derive(Parser)]
struct TokenOpts {
    #[clap(long, help = "Rotate the auth token now")]
    rotate: bool,

    #[clap(long, help = "Print the token file path")]
    show_path: bool,
}

/// Map a CLI subcommand onto its wire command name and args. Daemon and
/// token management are handled locally and return None.
fn wire_request(command: &CliCommand) -> Option<(&'static str, Map<String, Value>)> {
    let mut args = Map::new();

    match command {
        CliCommand::List(opts) | CliCommand::Flagged(opts) | CliCommand::Unflagged(opts) => {
            if let Some(folder) = &opts.folder {
                args.insert("folder".to_string(), json!(folder));
            }
            if let Some(limit) = opts.limit {
                args.insert("limit".to_string(), json!(limit));
            }
            let name = match command {
                CliCommand::List(_) => "list",
                CliCommand::Flagged(_) => "flagged",
                _ => "unflagged",
            };
            Some((name, args))
        }

        CliCommand::View(opts) | CliCommand::Flag(opts) | CliCommand::Unflag(opts) | CliCommand::Delete(opts) => {
            args.insert("id".to_string(), json!(opts.id));
            if let Some(folder) = &opts.folder {
                args.insert("folder".to_string(), json!(folder));
            }
            let name = match command {
                CliCommand::View(_) => "view",
                CliCommand::Flag(_) => "flag",
                CliCommand::Unflag(_) => "unflag",
                _ => "delete",
            };
            Some((name, args))
        }

        CliCommand::Search(opts) => {
            args.insert("keyword".to_string(), json!(opts.keyword));
            if let Some(folder) = &opts.folder {
                args.insert("folder".to_string(), json!(folder));
            }
            if let Some(limit) = opts.limit {
                args.insert("limit".to_string(), json!(limit));
            }
            Some(("search", args))
        }

        CliCommand::Move(opts) => {
            args.insert("id".to_string(), json!(opts.id));
            args.insert("to".to_string(), json!(opts.to));
            if let Some(folder) = &opts.folder {
                args.insert("folder".to_string(), json!(folder));
            }
            Some(("move", args))
        }

        CliCommand::Send(opts) | CliCommand::Compose(opts) => {
            args.insert("to".to_string(), json!(opts.to));
            args.insert("subject".to_string(), json!(opts.subject));
            args.insert("body".to_string(), json!(opts.body));
            let name = if matches!(command, CliCommand::Send(_)) {
                "send"
            } else {
                "compose"
            };
            Some((name, args))
        }

        CliCommand::Folders => Some(("folders", args)),
        CliCommand::Refresh => Some(("refresh", args)),
        CliCommand::Status => Some(("status", args)),

        CliCommand::Daemon(_) | CliCommand::Token(_) => None,
    }
}

fn result_mode(result: &CommandResult) -> ProcessingMode {
    match result.metadata.get("via_daemon").and_then(Value::as_bool) {
        Some(true) => ProcessingMode::Daemon,
        _ => ProcessingMode::Direct,
    }
}

/// Execute one wire command, preferring the daemon with direct fallback.
fn run_wire_command(opts: &MbxOpts, name: &str, args: Map<String, Value>) -> (CommandResult, ProcessingMode) {
    let mut timing = TimingCollector::new(ProcessingMode::Daemon);

    let home = match home_dir() {
        Ok(home) => home,
        Err(e) => {
            return (
                CommandResult::err(e.to_string()),
                ProcessingMode::Direct,
            )
        }
    };

    let fallback: Arc<dyn CommandRouter> =
        Arc::new(DirectRouter::new(home.clone(), opts.config.clone()));

    let result = if opts.direct {
        timing.set_mode(ProcessingMode::Direct);
        timing.start_processing();
        match fallback.execute(&mbx_lib::CommandRequest {
            command: name.to_string(),
            args,
        }) {
            Ok(result) => result.with_meta("via_daemon", json!(false)),
            Err(e) => CommandResult::err(e.to_string()).with_meta("via_daemon", json!(false)),
        }
    } else {
        let client = DaemonClient::new(DaemonClientConfig::new(home)).with_fallback(fallback);
        timing.start_ipc();
        client.execute_command(name, args)
    };

    let mode = result_mode(&result);
    timing.set_mode(mode);
    log_timing(timing.finalize());

    (result, mode)
}

fn print_result(result: &CommandResult, mode: ProcessingMode) -> i32 {
    if result.success {
        if let Some(data) = &result.data {
            println!("{data}");
        }
        if result.cached {
            let age = result
                .metadata
                .get("cache_age_seconds")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            debug!("⚡ Served from cache ({age}s old)");
        }
        if matches!(mode, ProcessingMode::Direct) {
            debug!("📥 Executed directly (daemon unavailable or bypassed)");
        }
        0
    } else {
        let message = result.error.as_deref().unwrap_or("unknown error");
        eprintln!("{} {message}", "error:".red().bold());
        1
    }
}

fn render_status(result: &CommandResult) -> i32 {
    if !result.success {
        let message = result.error.as_deref().unwrap_or("unknown error");
        eprintln!("{} {message}", "error:".red().bold());
        return 1;
    }

    let meta = &result.metadata;
    let get_u64 = |key: &str| meta.get(key).and_then(Value::as_u64).unwrap_or(0);

    println!("{}", "🔍 MBX Daemon Status".bold());
    println!();
    println!("  ⚙️  PID: {}", get_u64("pid"));
    println!(
        "  📦 Version: {}",
        meta.get("version").and_then(Value::as_str).unwrap_or("?")
    );
    println!("  ⏱️  Uptime: {}s", get_u64("uptime_secs"));
    println!("  📨 Requests served: {}", get_u64("total_requests"));
    println!("  👥 Active clients: {}", get_u64("active_clients"));

    if let Some(cache) = meta.get("cache") {
        let cache_u64 = |key: &str| cache.get(key).and_then(Value::as_u64).unwrap_or(0);
        println!();
        println!(
            "  🗃️  Cache: {}/{} entries ({} hits, {} misses, {} evictions)",
            cache_u64("entries"),
            cache_u64("capacity"),
            cache_u64("hits"),
            cache_u64("misses"),
            cache_u64("evictions"),
        );
    }

    if let Some(pools) = meta.get("pools") {
        let connected = |key: &str| {
            if pools.get(key).and_then(Value::as_bool).unwrap_or(false) {
                "✅ connected".green().to_string()
            } else {
                "❌ idle".yellow().to_string()
            }
        };
        println!("  📡 IMAP pool: {}", connected("imap_connected"));
        println!("  📤 SMTP pool: {}", connected("smtp_connected"));
    }

    if let Some(auth) = meta.get("auth") {
        let auth_u64 = |key: &str| auth.get(key).and_then(Value::as_u64).unwrap_or(0);
        println!(
            "  🔐 Auth: {} verification(s), {} failure(s)",
            auth_u64("verifications"),
            auth_u64("failures"),
        );
    }

    0
}

fn run_daemon_command(daemon_opts: &DaemonCmdOpts) -> i32 {
    let home = match home_dir() {
        Ok(home) => home,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            return 1;
        }
    };

    let client = DaemonClient::new(DaemonClientConfig::new(home.clone()));

    if daemon_opts.stop || daemon_opts.restart {
        match client.stop_daemon() {
            Ok(true) => println!("🛑 Daemon stopped"),
            Ok(false) => println!("🛑 Daemon was not running"),
            Err(e) => {
                eprintln!("{} {e}", "error:".red().bold());
                return 1;
            }
        }
    }

    if daemon_opts.start || daemon_opts.restart {
        if daemon_opts.restart {
            // Give the old process a moment to remove its pid file
            std::thread::sleep(std::time::Duration::from_millis(300));
        }
        match client.start_daemon() {
            Ok(()) => println!("🚀 Daemon running"),
            Err(e) => {
                let error = mbx_lib::MbxError::DaemonUnavailable {
                    socket_path: determine_socket_path(&home),
                    reason: e.to_string(),
                };
                eprintln!("{} {error}", "error:".red().bold());
                return 1;
            }
        }
    }

    if daemon_opts.status {
        let socket_path = determine_socket_path(&home);
        let pid_path = determine_pid_path(&home);

        let socket_exists = socket_path.exists();
        let process_running = client.is_daemon_running();

        println!("{}", "🔍 MBX Daemon Check".bold());
        println!();
        if socket_exists {
            println!("🔌 Socket file: ✅ Found at {socket_path:?}");
        } else {
            println!("🔌 Socket file: ❌ Not found");
        }
        if pid_path.exists() {
            println!("📄 PID file: ✅ Found at {pid_path:?}");
        } else {
            println!("📄 PID file: ❌ Not found");
        }
        if process_running {
            println!("⚙️  Daemon process: ✅ Running");
        } else {
            println!("⚙️  Daemon process: ❌ Not running");
        }

        let overall = match (socket_exists, process_running) {
            (true, true) => "✅ healthy",
            (true, false) => "⚠️ stale socket",
            (false, false) => "❗ not running",
            (false, true) => "❓ process without socket",
        };
        println!();
        println!("Overall: {overall}");
    }

    if !daemon_opts.start && !daemon_opts.stop && !daemon_opts.restart && !daemon_opts.status {
        eprintln!("{} pass one of --start/--stop/--restart/--status", "error:".red().bold());
        return 2;
    }

    0
}

fn run_token_command(token_opts: &TokenOpts) -> i32 {
    let home = match home_dir() {
        Ok(home) => home,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            return 1;
        }
    };

    let token_path = determine_token_path(&home);

    if token_opts.show_path {
        println!("{}", token_path.display());
    }

    if token_opts.rotate {
        let auth = AuthManager::new(token_path.clone());
        match auth.rotate_token() {
            Ok(_) => println!("🔑 Auth token rotated"),
            Err(e) => {
                let error = mbx_lib::MbxError::TokenError {
                    token_path,
                    operation: "rotation".to_string(),
                    underlying_error: e.to_string(),
                };
                eprintln!("{} {error}", "error:".red().bold());
                return 1;
            }
        }
    }

    if !token_opts.show_path && !token_opts.rotate {
        eprintln!("{} pass one of --rotate/--show-path", "error:".red().bold());
        return 2;
    }

    0
}

fn main() {
    let opts = MbxOpts::parse();

    if let Ok(home) = home_dir() {
        if let Err(e) = setup_logging(&home) {
            eprintln!("Warning: Failed to set up logging: {e}");
        }
    }

    let code = match &opts.command {
        CliCommand::Daemon(daemon_opts) => run_daemon_command(daemon_opts),
        CliCommand::Token(token_opts) => run_token_command(token_opts),
        CliCommand::Status => {
            // status only exists daemon-side; direct mode has nothing to report
            let (result, mode) = run_wire_command(&opts, "status", Map::new());
            if matches!(mode, ProcessingMode::Direct) {
                eprintln!(
                    "{} daemon is not running; start it with: mbx daemon --start",
                    "status:".yellow().bold()
                );
                1
            } else {
                render_status(&result)
            }
        }
        other => match wire_request(other) {
            Some((name, args)) => {
                let (result, mode) = run_wire_command(&opts, name, args);
                print_result(&result, mode)
            }
            None => 2,
        },
    };

    exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_request_for_list() {
        let command = CliCommand::List(ListOpts {
            folder: Some("archive".to_string()),
            limit: Some(5),
        });

        let (name, args) = wire_request(&command).unwrap();
        assert_eq!(name, "list");
        assert_eq!(args.get("folder"), Some(&json!("archive")));
        assert_eq!(args.get("limit"), Some(&json!(5)));
    }

    #[test]
    fn test_wire_request_omits_missing_args() {
        let command = CliCommand::List(ListOpts {
            folder: None,
            limit: None,
        });

        let (name, args) = wire_request(&command).unwrap();
        assert_eq!(name, "list");
        assert!(args.is_empty());
    }

    #[test]
    fn test_wire_request_for_move() {
        let command = CliCommand::Move(MoveOpts {
            id: 42,
            to: "archive".to_string(),
            folder: None,
        });

        let (name, args) = wire_request(&command).unwrap();
        assert_eq!(name, "move");
        assert_eq!(args.get("id"), Some(&json!(42)));
        assert_eq!(args.get("to"), Some(&json!("archive")));
    }

    #[test]
    fn test_wire_request_for_send() {
        let command = CliCommand::Send(SendOpts {
            to: vec!["a@example.com".to_string()],
            subject: "Hi".to_string(),
            body: "Hello".to_string(),
        });

        let (name, args) = wire_request(&command).unwrap();
        assert_eq!(name, "send");
        assert_eq!(args.get("to"), Some(&json!(["a@example.com"])));
        assert_eq!(args.get("subject"), Some(&json!("Hi")));
    }

    #[test]
    fn test_wire_request_skips_local_commands() {
        let command = CliCommand::Token(TokenOpts {
            rotate: true,
            show_path: false,
        });
        assert!(wire_request(&command).is_none());
    }

    #[test]
    fn test_result_mode_reads_via_daemon_marker() {
        let daemon_result = CommandResult::ok("x").with_meta("via_daemon", json!(true));
        let direct_result = CommandResult::ok("x").with_meta("via_daemon", json!(false));
        let unmarked = CommandResult::ok("x");

        assert_eq!(result_mode(&daemon_result), ProcessingMode::Daemon);
        assert_eq!(result_mode(&direct_result), ProcessingMode::Direct);
        assert_eq!(result_mode(&unmarked), ProcessingMode::Direct);
    }
}
