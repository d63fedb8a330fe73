use log::debug;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::mail::{format_summaries, OutgoingMessage, SharedAccount};
use crate::pool::PoolManager;
use crate::protocol::{CommandRequest, CommandResult};

/// Command routing for both the daemon and the client's direct fallback.
///
/// The wire carries command names as strings; internally they resolve to a
/// closed enum so the cacheable set, the write set, and the invalidation
/// strategies stay exhaustive-checkable.

pub const DEFAULT_FOLDER: &str = "inbox";
pub const SENT_FOLDER: &str = "sent";
pub const DRAFTS_FOLDER: &str = "drafts";

const DEFAULT_LIST_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    List,
    View,
    Search,
    Flagged,
    Unflagged,
    Folders,
    Move,
    Delete,
    Flag,
    Unflag,
    Send,
    Refresh,
    Compose,
}

impl Command {
    pub const ALL: &'static [Command] = &[
        Command::List,
        Command::View,
        Command::Search,
        Command::Flagged,
        Command::Unflagged,
        Command::Folders,
        Command::Move,
        Command::Delete,
        Command::Flag,
        Command::Unflag,
        Command::Send,
        Command::Refresh,
        Command::Compose,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "list" => Some(Command::List),
            "view" => Some(Command::View),
            "search" => Some(Command::Search),
            "flagged" => Some(Command::Flagged),
            "unflagged" => Some(Command::Unflagged),
            "folders" => Some(Command::Folders),
            "move" => Some(Command::Move),
            "delete" => Some(Command::Delete),
            "flag" => Some(Command::Flag),
            "unflag" => Some(Command::Unflag),
            "send" => Some(Command::Send),
            "refresh" => Some(Command::Refresh),
            "compose" => Some(Command::Compose),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::List => "list",
            Command::View => "view",
            Command::Search => "search",
            Command::Flagged => "flagged",
            Command::Unflagged => "unflagged",
            Command::Folders => "folders",
            Command::Move => "move",
            Command::Delete => "delete",
            Command::Flag => "flag",
            Command::Unflag => "unflag",
            Command::Send => "send",
            Command::Refresh => "refresh",
            Command::Compose => "compose",
        }
    }

    /// Read commands whose results may be served from the daemon cache.
    pub fn is_cacheable(self) -> bool {
        matches!(
            self,
            Command::List
                | Command::View
                | Command::Search
                | Command::Flagged
                | Command::Unflagged
                | Command::Folders
        )
    }

    /// Commands that mutate mailbox state and must invalidate caches.
    pub fn is_write(self) -> bool {
        !self.is_cacheable()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Error type for the router boundary. An unknown command is distinguishable
/// from a command that ran and failed, so callers can decide whether to retry
/// elsewhere or log differently.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterError {
    Unknown(String),
    Failed(String),
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::Unknown(name) => write!(f, "unknown command: {name}"),
            RouterError::Failed(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for RouterError {}

/// The command-router interface consumed by the daemon and by the client's
/// fallback strategy.
pub trait CommandRouter: Send + Sync {
    fn execute(&self, request: &CommandRequest) -> Result<CommandResult, RouterError>;
}

/// Production router: executes commands against the pooled mail clients.
pub struct MailRouter {
    pools: Arc<PoolManager>,
    account: SharedAccount,
}

impl MailRouter {
    pub fn new(pools: Arc<PoolManager>, account: SharedAccount) -> Self {
        Self { pools, account }
    }

    fn folder(request: &CommandRequest) -> String {
        request
            .arg_str("folder")
            .or_else(|| request.arg_str("table"))
            .unwrap_or_else(|| DEFAULT_FOLDER.to_string())
    }

    fn limit(request: &CommandRequest) -> usize {
        request.arg_usize("limit").unwrap_or(DEFAULT_LIST_LIMIT)
    }

    fn required_id(command: Command, request: &CommandRequest) -> Result<u32, RouterError> {
        request
            .arg_usize("id")
            .map(|id| id as u32)
            .ok_or_else(|| RouterError::Failed(format!("{command} requires an id")))
    }

    fn recipients(request: &CommandRequest) -> Result<Vec<String>, RouterError> {
        match request.args.get("to") {
            Some(Value::String(to)) => Ok(vec![to.clone()]),
            Some(Value::Array(items)) => {
                let recipients: Vec<String> = items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect();
                if recipients.is_empty() {
                    Err(RouterError::Failed("no valid recipients in 'to'".to_string()))
                } else {
                    Ok(recipients)
                }
            }
            _ => Err(RouterError::Failed("send requires a 'to' address".to_string())),
        }
    }

    fn outgoing(&self, request: &CommandRequest) -> Result<OutgoingMessage, RouterError> {
        let from = self
            .account
            .read()
            .expect("account lock poisoned")
            .email
            .clone();
        Ok(OutgoingMessage {
            from,
            to: Self::recipients(request)?,
            subject: request.arg_str("subject").unwrap_or_default(),
            body: request.arg_str("body").unwrap_or_default(),
        })
    }
}

impl CommandRouter for MailRouter {
    fn execute(&self, request: &CommandRequest) -> Result<CommandResult, RouterError> {
        let command = Command::parse(&request.command)
            .ok_or_else(|| RouterError::Unknown(request.command.clone()))?;

        debug!("🧭 Routing command: {}", command);

        let failed = |e: crate::pool::PoolError| RouterError::Failed(e.to_string());

        match command {
            Command::List => {
                let folder = Self::folder(request);
                let limit = Self::limit(request);
                let summaries = self
                    .pools
                    .imap()
                    .with_client(|c| c.list_messages(&folder, limit))
                    .map_err(failed)?;
                Ok(CommandResult::ok(format_summaries(&summaries))
                    .with_meta("folder", Value::from(folder))
                    .with_meta("count", Value::from(summaries.len())))
            }

            Command::View => {
                let folder = Self::folder(request);
                let id = Self::required_id(command, request)?;
                let body = self
                    .pools
                    .imap()
                    .with_client(|c| c.fetch_body(&folder, id))
                    .map_err(failed)?;
                Ok(CommandResult::ok(body).with_meta("id", Value::from(id)))
            }

            Command::Search => {
                let folder = Self::folder(request);
                let limit = Self::limit(request);
                let keyword = request
                    .arg_str("keyword")
                    .ok_or_else(|| RouterError::Failed("search requires a keyword".to_string()))?;
                let summaries = self
                    .pools
                    .imap()
                    .with_client(|c| c.search(&folder, &keyword, limit))
                    .map_err(failed)?;
                Ok(CommandResult::ok(format_summaries(&summaries))
                    .with_meta("keyword", Value::from(keyword)))
            }

            Command::Flagged | Command::Unflagged => {
                let folder = Self::folder(request);
                let limit = Self::limit(request);
                let want_flagged = command == Command::Flagged;
                let summaries = self
                    .pools
                    .imap()
                    .with_client(|c| c.list_flagged(&folder, want_flagged, limit))
                    .map_err(failed)?;
                Ok(CommandResult::ok(format_summaries(&summaries)))
            }

            Command::Folders => {
                let folders = self
                    .pools
                    .imap()
                    .with_client(|c| c.list_folders())
                    .map_err(failed)?;
                let count = folders.len();
                Ok(CommandResult::ok(folders.join("\n")).with_meta("count", Value::from(count)))
            }

            Command::Flag | Command::Unflag => {
                let folder = Self::folder(request);
                let id = Self::required_id(command, request)?;
                let flagged = command == Command::Flag;
                self.pools
                    .imap()
                    .with_client(|c| c.set_flagged(&folder, id, flagged))
                    .map_err(failed)?;
                let verb = if flagged { "flagged" } else { "unflagged" };
                Ok(CommandResult::ok(format!("message {id} {verb}")))
            }

            Command::Move => {
                let src = Self::folder(request);
                let id = Self::required_id(command, request)?;
                let dst = request
                    .arg_str("to")
                    .ok_or_else(|| RouterError::Failed("move requires a 'to' folder".to_string()))?;
                self.pools
                    .imap()
                    .with_client(|c| c.move_message(id, &src, &dst))
                    .map_err(failed)?;
                Ok(CommandResult::ok(format!("message {id} moved {src} -> {dst}")))
            }

            Command::Delete => {
                let folder = Self::folder(request);
                let id = Self::required_id(command, request)?;
                self.pools
                    .imap()
                    .with_client(|c| c.delete_message(&folder, id))
                    .map_err(failed)?;
                Ok(CommandResult::ok(format!("message {id} deleted")))
            }

            Command::Send => {
                let message = self.outgoing(request)?;
                let recipients = message.to.join(", ");
                self.pools
                    .smtp()
                    .with_client(|c| c.send(&message))
                    .map_err(failed)?;
                Ok(CommandResult::ok(format!("message sent to {recipients}")))
            }

            Command::Compose => {
                let message = self.outgoing(request)?;
                let draft = format!(
                    "From: {}\r\nTo: {}\r\nSubject: {}\r\n\r\n{}",
                    message.from,
                    message.to.join(", "),
                    message.subject,
                    message.body
                );
                self.pools
                    .imap()
                    .with_client(|c| c.append(DRAFTS_FOLDER, &draft))
                    .map_err(failed)?;
                Ok(CommandResult::ok("draft saved"))
            }

            Command::Refresh => {
                // Force a fresh session so the next reads see server state
                self.pools.imap().expire();
                self.pools
                    .imap()
                    .with_client(|c| c.noop())
                    .map_err(failed)?;
                Ok(CommandResult::ok("mailbox refreshed"))
            }
        }
    }
}

/// Direct-execution strategy for the CLI fallback path. Loads the config and
/// connects only when actually invoked, so the daemon fast path never pays
/// config or connection costs; pooling is moot across a single invocation.
pub struct DirectRouter {
    home_dir: std::path::PathBuf,
    config_override: Option<std::path::PathBuf>,
}

impl DirectRouter {
    pub fn new(home_dir: std::path::PathBuf, config_override: Option<std::path::PathBuf>) -> Self {
        Self {
            home_dir,
            config_override,
        }
    }
}

impl CommandRouter for DirectRouter {
    fn execute(&self, request: &CommandRequest) -> Result<CommandResult, RouterError> {
        use crate::cfg::loader::Loader;
        use crate::mail::{shared_account, ImapFactory, SmtpFactory};
        use crate::system::{CommandRunner, RealCommandRunner};

        let config_path =
            crate::get_config_path_with_override(&self.home_dir, &self.config_override)
                .map_err(|e| RouterError::Failed(e.to_string()))?;
        let spec = Loader::new()
            .load(&config_path)
            .map_err(|e| RouterError::Failed(e.to_string()))?;

        let account = shared_account(spec.account);
        let runner: Arc<dyn CommandRunner> = Arc::new(RealCommandRunner);
        let pools = Arc::new(PoolManager::new(
            Box::new(ImapFactory::new(Arc::clone(&account), Arc::clone(&runner))),
            Box::new(SmtpFactory::new(Arc::clone(&account), runner)),
        ));

        MailRouter::new(pools, account).execute(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::spec::Account;
    use crate::mail::{shared_account, ImapSession, MailError, MessageSummary, SmtpSender};
    use crate::pool::ClientFactory;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MailboxState {
        folders: HashMap<String, Vec<MessageSummary>>,
        sent: Vec<OutgoingMessage>,
        appended: Vec<(String, String)>,
    }

    struct SharedImapSession {
        state: Arc<Mutex<MailboxState>>,
    }

    impl ImapSession for SharedImapSession {
        fn list_messages(&mut self, folder: &str, limit: usize) -> Result<Vec<MessageSummary>, MailError> {
            let state = self.state.lock().unwrap();
            let mut messages = state.folders.get(folder).cloned().unwrap_or_default();
            messages.truncate(limit);
            Ok(messages)
        }

        fn fetch_body(&mut self, folder: &str, id: u32) -> Result<String, MailError> {
            let state = self.state.lock().unwrap();
            state
                .folders
                .get(folder)
                .and_then(|msgs| msgs.iter().find(|m| m.id == id))
                .map(|m| format!("body of {}", m.subject))
                .ok_or_else(|| MailError::Protocol(format!("no message {id}")))
        }

        fn search(&mut self, folder: &str, keyword: &str, limit: usize) -> Result<Vec<MessageSummary>, MailError> {
            let state = self.state.lock().unwrap();
            let mut matches: Vec<MessageSummary> = state
                .folders
                .get(folder)
                .map(|msgs| {
                    msgs.iter()
                        .filter(|m| m.subject.contains(keyword))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            matches.truncate(limit);
            Ok(matches)
        }

        fn list_flagged(&mut self, folder: &str, flagged: bool, limit: usize) -> Result<Vec<MessageSummary>, MailError> {
            let state = self.state.lock().unwrap();
            let mut matches: Vec<MessageSummary> = state
                .folders
                .get(folder)
                .map(|msgs| {
                    msgs.iter()
                        .filter(|m| m.flagged == flagged)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            matches.truncate(limit);
            Ok(matches)
        }

        fn set_flagged(&mut self, folder: &str, id: u32, flagged: bool) -> Result<(), MailError> {
            let mut state = self.state.lock().unwrap();
            let message = state
                .folders
                .get_mut(folder)
                .and_then(|msgs| msgs.iter_mut().find(|m| m.id == id))
                .ok_or_else(|| MailError::Protocol(format!("no message {id}")))?;
            message.flagged = flagged;
            Ok(())
        }

        fn move_message(&mut self, id: u32, src_folder: &str, dst_folder: &str) -> Result<(), MailError> {
            let mut state = self.state.lock().unwrap();
            let message = {
                let src = state
                    .folders
                    .get_mut(src_folder)
                    .ok_or_else(|| MailError::Protocol(format!("no folder {src_folder}")))?;
                let index = src
                    .iter()
                    .position(|m| m.id == id)
                    .ok_or_else(|| MailError::Protocol(format!("no message {id}")))?;
                src.remove(index)
            };
            state.folders.entry(dst_folder.to_string()).or_default().push(message);
            Ok(())
        }

        fn delete_message(&mut self, folder: &str, id: u32) -> Result<(), MailError> {
            let mut state = self.state.lock().unwrap();
            let msgs = state
                .folders
                .get_mut(folder)
                .ok_or_else(|| MailError::Protocol(format!("no folder {folder}")))?;
            msgs.retain(|m| m.id != id);
            Ok(())
        }

        fn list_folders(&mut self) -> Result<Vec<String>, MailError> {
            let state = self.state.lock().unwrap();
            let mut names: Vec<String> = state.folders.keys().cloned().collect();
            names.sort();
            Ok(names)
        }

        fn append(&mut self, folder: &str, message: &str) -> Result<(), MailError> {
            let mut state = self.state.lock().unwrap();
            state.appended.push((folder.to_string(), message.to_string()));
            Ok(())
        }

        fn noop(&mut self) -> Result<(), MailError> {
            Ok(())
        }

        fn logout(&mut self) -> Result<(), MailError> {
            Ok(())
        }
    }

    struct SharedImapFactory {
        state: Arc<Mutex<MailboxState>>,
    }

    impl ClientFactory<Box<dyn ImapSession>> for SharedImapFactory {
        fn create(&self) -> Result<Box<dyn ImapSession>, MailError> {
            Ok(Box::new(SharedImapSession {
                state: Arc::clone(&self.state),
            }))
        }
    }

    struct SharedSmtpSender {
        state: Arc<Mutex<MailboxState>>,
    }

    impl SmtpSender for SharedSmtpSender {
        fn send(&mut self, message: &OutgoingMessage) -> Result<(), MailError> {
            self.state.lock().unwrap().sent.push(message.clone());
            Ok(())
        }
        fn noop(&mut self) -> Result<(), MailError> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), MailError> {
            Ok(())
        }
    }

    struct SharedSmtpFactory {
        state: Arc<Mutex<MailboxState>>,
    }

    impl ClientFactory<Box<dyn SmtpSender>> for SharedSmtpFactory {
        fn create(&self) -> Result<Box<dyn SmtpSender>, MailError> {
            Ok(Box::new(SharedSmtpSender {
                state: Arc::clone(&self.state),
            }))
        }
    }

    fn summary(id: u32, subject: &str, flagged: bool) -> MessageSummary {
        MessageSummary {
            id,
            from: "alice@example.com".to_string(),
            subject: subject.to_string(),
            date: "Mon, 1 Jan 2024 00:00:00 +0000".to_string(),
            flagged,
            seen: true,
        }
    }

    fn router_with_state() -> (MailRouter, Arc<Mutex<MailboxState>>) {
        let mut folders = HashMap::new();
        folders.insert(
            "inbox".to_string(),
            vec![
                summary(3, "Invoice attached", true),
                summary(2, "Lunch on Friday?", false),
                summary(1, "Welcome", false),
            ],
        );
        folders.insert("sent".to_string(), Vec::new());

        let state = Arc::new(Mutex::new(MailboxState {
            folders,
            sent: Vec::new(),
            appended: Vec::new(),
        }));

        let pools = Arc::new(PoolManager::with_timeouts(
            Box::new(SharedImapFactory {
                state: Arc::clone(&state),
            }),
            Box::new(SharedSmtpFactory {
                state: Arc::clone(&state),
            }),
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(60),
        ));

        let account = Account {
            name: "personal".to_string(),
            email: "me@example.com".to_string(),
            imap_host: "imap.example.com".to_string(),
            imap_port: 993,
            smtp_host: "smtp.example.com".to_string(),
            smtp_port: 465,
            username: "me@example.com".to_string(),
            password: Some("secret".to_string()),
            password_cmd: None,
        };

        (MailRouter::new(pools, shared_account(account)), state)
    }

    #[test]
    fn test_command_parse_roundtrip() {
        for command in Command::ALL {
            assert_eq!(Command::parse(command.name()), Some(*command));
        }
        assert_eq!(Command::parse("bogus"), None);
    }

    #[test]
    fn test_cacheable_and_write_sets_partition_commands() {
        for command in Command::ALL {
            assert_ne!(command.is_cacheable(), command.is_write());
        }
        assert!(Command::List.is_cacheable());
        assert!(Command::Flag.is_write());
        assert!(Command::Refresh.is_write());
    }

    #[test]
    fn test_list_returns_formatted_summaries() {
        let (router, _) = router_with_state();
        let request = CommandRequest::new("list").with_arg("limit", json!(10));

        let result = router.execute(&request).expect("list should succeed");
        assert!(result.success);
        let data = result.data.expect("list should carry data");
        assert!(data.contains("Invoice attached"));
        assert!(data.contains("count: 3"));
        assert_eq!(result.metadata.get("folder"), Some(&json!("inbox")));
    }

    #[test]
    fn test_list_respects_limit() {
        let (router, _) = router_with_state();
        let request = CommandRequest::new("list").with_arg("limit", json!(1));

        let result = router.execute(&request).expect("list should succeed");
        assert_eq!(result.metadata.get("count"), Some(&json!(1)));
    }

    #[test]
    fn test_view_requires_id() {
        let (router, _) = router_with_state();
        let request = CommandRequest::new("view");

        let error = router.execute(&request).expect_err("view without id must fail");
        assert!(matches!(error, RouterError::Failed(_)));
        assert!(error.to_string().contains("requires an id"));
    }

    #[test]
    fn test_view_fetches_body() {
        let (router, _) = router_with_state();
        let request = CommandRequest::new("view").with_arg("id", json!(2));

        let result = router.execute(&request).expect("view should succeed");
        assert_eq!(result.data.as_deref(), Some("body of Lunch on Friday?"));
    }

    #[test]
    fn test_search_filters_by_keyword() {
        let (router, _) = router_with_state();
        let request = CommandRequest::new("search").with_arg("keyword", json!("Invoice"));

        let result = router.execute(&request).expect("search should succeed");
        let data = result.data.expect("search should carry data");
        assert!(data.contains("Invoice attached"));
        assert!(data.contains("count: 1"));
    }

    #[test]
    fn test_flag_mutates_state() {
        let (router, state) = router_with_state();
        let request = CommandRequest::new("flag").with_arg("id", json!(2));

        router.execute(&request).expect("flag should succeed");

        let state = state.lock().unwrap();
        let message = state.folders["inbox"].iter().find(|m| m.id == 2).unwrap();
        assert!(message.flagged);
    }

    #[test]
    fn test_move_relocates_message() {
        let (router, state) = router_with_state();
        let request = CommandRequest::new("move")
            .with_arg("id", json!(1))
            .with_arg("to", json!("archive"));

        router.execute(&request).expect("move should succeed");

        let state = state.lock().unwrap();
        assert!(state.folders["inbox"].iter().all(|m| m.id != 1));
        assert_eq!(state.folders["archive"].len(), 1);
    }

    #[test]
    fn test_delete_removes_message() {
        let (router, state) = router_with_state();
        let request = CommandRequest::new("delete").with_arg("id", json!(3));

        router.execute(&request).expect("delete should succeed");

        assert!(state.lock().unwrap().folders["inbox"].iter().all(|m| m.id != 3));
    }

    #[test]
    fn test_send_uses_account_from_address() {
        let (router, state) = router_with_state();
        let request = CommandRequest::new("send")
            .with_arg("to", json!("bob@example.com"))
            .with_arg("subject", json!("Hi"))
            .with_arg("body", json!("Hello Bob"));

        let result = router.execute(&request).expect("send should succeed");
        assert!(result.data.unwrap().contains("bob@example.com"));

        let state = state.lock().unwrap();
        assert_eq!(state.sent.len(), 1);
        assert_eq!(state.sent[0].from, "me@example.com");
        assert_eq!(state.sent[0].to, vec!["bob@example.com".to_string()]);
    }

    #[test]
    fn test_send_accepts_recipient_list() {
        let (router, state) = router_with_state();
        let request = CommandRequest::new("send")
            .with_arg("to", json!(["a@example.com", "b@example.com"]))
            .with_arg("subject", json!("Hi"));

        router.execute(&request).expect("send should succeed");
        assert_eq!(state.lock().unwrap().sent[0].to.len(), 2);
    }

    #[test]
    fn test_send_without_recipient_fails() {
        let (router, _) = router_with_state();
        let request = CommandRequest::new("send").with_arg("subject", json!("Hi"));

        let error = router.execute(&request).expect_err("send without to must fail");
        assert!(error.to_string().contains("'to'"));
    }

    #[test]
    fn test_compose_appends_draft() {
        let (router, state) = router_with_state();
        let request = CommandRequest::new("compose")
            .with_arg("to", json!("carol@example.com"))
            .with_arg("subject", json!("Draft"))
            .with_arg("body", json!("wip"));

        router.execute(&request).expect("compose should succeed");

        let state = state.lock().unwrap();
        assert_eq!(state.appended.len(), 1);
        assert_eq!(state.appended[0].0, DRAFTS_FOLDER);
        assert!(state.appended[0].1.contains("Subject: Draft"));
    }

    #[test]
    fn test_unknown_command_is_distinguishable() {
        let (router, _) = router_with_state();
        let request = CommandRequest::new("frobnicate");

        let error = router.execute(&request).expect_err("unknown must fail");
        assert_eq!(error, RouterError::Unknown("frobnicate".to_string()));
        assert_eq!(error.to_string(), "unknown command: frobnicate");
    }

    #[test]
    fn test_flagged_and_unflagged_listings() {
        let (router, _) = router_with_state();

        let flagged = router
            .execute(&CommandRequest::new("flagged"))
            .expect("flagged should succeed");
        assert!(flagged.data.unwrap().contains("count: 1"));

        let unflagged = router
            .execute(&CommandRequest::new("unflagged"))
            .expect("unflagged should succeed");
        assert!(unflagged.data.unwrap().contains("count: 2"));
    }

    #[test]
    fn test_direct_router_reports_missing_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let router = DirectRouter::new(dir.path().to_path_buf(), None);

        let error = router
            .execute(&CommandRequest::new("list"))
            .expect_err("no config available");
        assert!(matches!(error, RouterError::Failed(_)));
        assert!(error.to_string().contains("Configuration file not found"));
    }

    #[test]
    fn test_folders_listing() {
        let (router, _) = router_with_state();

        let result = router
            .execute(&CommandRequest::new("folders"))
            .expect("folders should succeed");
        let data = result.data.unwrap();
        assert!(data.contains("inbox"));
        assert!(data.contains("sent"));
    }
}
