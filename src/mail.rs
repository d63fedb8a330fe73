use log::debug;
use native_tls::TlsConnector;
use std::fmt;
use std::net::TcpStream;
use std::sync::{Arc, RwLock};

use crate::cfg::spec::Account;
use crate::system::CommandRunner;

/// Account state shared between the factories, the router, and the daemon's
/// config watcher; a reload swaps credentials for the next connection.
pub type SharedAccount = Arc<RwLock<Account>>;

pub fn shared_account(account: Account) -> SharedAccount {
    Arc::new(RwLock::new(account))
}

/// Narrow protocol-client interfaces consumed by the connection pools and the
/// command router. The IMAP/SMTP wire exchange itself stays behind these
/// traits; the daemon core only cares about connect/use/noop/close.

#[derive(Debug, Clone, PartialEq)]
pub enum MailError {
    Connect(String),
    Auth(String),
    Protocol(String),
    Send(String),
}

impl fmt::Display for MailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailError::Connect(msg) => write!(f, "Mail server connection failed: {msg}"),
            MailError::Auth(msg) => write!(f, "Mail server authentication failed: {msg}"),
            MailError::Protocol(msg) => write!(f, "Mail protocol error: {msg}"),
            MailError::Send(msg) => write!(f, "Message send failed: {msg}"),
        }
    }
}

impl std::error::Error for MailError {}

/// One row in a mailbox listing.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSummary {
    pub id: u32,
    pub from: String,
    pub subject: String,
    pub date: String,
    pub flagged: bool,
    pub seen: bool,
}

/// Outgoing message assembled by the compose/send commands.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// IMAP operations the router needs. Message ids are server UIDs.
pub trait ImapSession: Send {
    fn list_messages(&mut self, folder: &str, limit: usize) -> Result<Vec<MessageSummary>, MailError>;
    fn fetch_body(&mut self, folder: &str, id: u32) -> Result<String, MailError>;
    fn search(&mut self, folder: &str, keyword: &str, limit: usize) -> Result<Vec<MessageSummary>, MailError>;
    fn list_flagged(&mut self, folder: &str, flagged: bool, limit: usize) -> Result<Vec<MessageSummary>, MailError>;
    fn set_flagged(&mut self, folder: &str, id: u32, flagged: bool) -> Result<(), MailError>;
    fn move_message(&mut self, id: u32, src_folder: &str, dst_folder: &str) -> Result<(), MailError>;
    fn delete_message(&mut self, folder: &str, id: u32) -> Result<(), MailError>;
    fn list_folders(&mut self) -> Result<Vec<String>, MailError>;
    fn append(&mut self, folder: &str, message: &str) -> Result<(), MailError>;
    fn noop(&mut self) -> Result<(), MailError>;
    fn logout(&mut self) -> Result<(), MailError>;
}

/// SMTP operations the router needs.
pub trait SmtpSender: Send {
    fn send(&mut self, message: &OutgoingMessage) -> Result<(), MailError>;
    fn noop(&mut self) -> Result<(), MailError>;
    fn close(&mut self) -> Result<(), MailError>;
}

/// Resolve an account's password: the literal `password` field wins, then
/// `password_cmd` is executed and its first stdout line used.
pub fn resolve_password(account: &Account, runner: &dyn CommandRunner) -> Result<String, MailError> {
    if let Some(password) = &account.password {
        return Ok(password.clone());
    }

    let cmdline = account
        .password_cmd
        .as_deref()
        .ok_or_else(|| MailError::Auth("account has neither password nor password_cmd".to_string()))?;

    let mut parts = cmdline.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| MailError::Auth("password_cmd is empty".to_string()))?;
    let args: Vec<&str> = parts.collect();

    let output = runner
        .run(program, &args)
        .map_err(|e| MailError::Auth(format!("password_cmd failed to run: {e}")))?;

    if !output.success {
        return Err(MailError::Auth(format!(
            "password_cmd exited with {:?}: {}",
            output.code,
            output.stderr_str().trim()
        )));
    }

    let password = output
        .stdout_str()
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();

    if password.is_empty() {
        return Err(MailError::Auth("password_cmd produced no output".to_string()));
    }
    Ok(password)
}

// ============================================================================
// IMAP (TLS) implementation
// ============================================================================

type TlsImap = imap::Session<native_tls::TlsStream<TcpStream>>;

pub struct TlsImapSession {
    session: TlsImap,
    /// Folder of the last successful SELECT, skipped when unchanged
    selected: Option<String>,
}

impl TlsImapSession {
    pub fn connect(account: &Account, runner: &dyn CommandRunner) -> Result<Self, MailError> {
        let password = resolve_password(account, runner)?;

        let tls = TlsConnector::builder()
            .build()
            .map_err(|e| MailError::Connect(e.to_string()))?;

        debug!("📡 Connecting to IMAP {}:{}", account.imap_host, account.imap_port);
        let client = imap::connect(
            (account.imap_host.as_str(), account.imap_port),
            account.imap_host.as_str(),
            &tls,
        )
        .map_err(|e| MailError::Connect(e.to_string()))?;

        let session = client
            .login(&account.username, &password)
            .map_err(|e| MailError::Auth(e.0.to_string()))?;

        Ok(Self {
            session,
            selected: None,
        })
    }

    fn select(&mut self, folder: &str) -> Result<u32, MailError> {
        let mailbox = self
            .session
            .select(folder)
            .map_err(|e| {
                self.selected = None;
                MailError::Protocol(format!("SELECT {folder}: {e}"))
            })?;
        self.selected = Some(folder.to_string());
        Ok(mailbox.exists)
    }

    fn ensure_selected(&mut self, folder: &str) -> Result<(), MailError> {
        if self.selected.as_deref() == Some(folder) {
            return Ok(());
        }
        self.select(folder).map(|_| ())
    }

    fn summaries_for(&mut self, sequence_set: &str) -> Result<Vec<MessageSummary>, MailError> {
        let fetches = self
            .session
            .fetch(sequence_set, "(UID FLAGS RFC822.HEADER)")
            .map_err(|e| MailError::Protocol(format!("FETCH {sequence_set}: {e}")))?;

        let mut summaries = Vec::new();
        for fetch in fetches.iter() {
            let id = match fetch.uid {
                Some(uid) => uid,
                None => continue,
            };

            let headers = fetch
                .header()
                .map(|bytes| String::from_utf8_lossy(bytes).to_string())
                .unwrap_or_default();

            let mut flagged = false;
            let mut seen = false;
            for flag in fetch.flags() {
                match flag {
                    imap::types::Flag::Flagged => flagged = true,
                    imap::types::Flag::Seen => seen = true,
                    _ => {}
                }
            }

            summaries.push(MessageSummary {
                id,
                from: header_value(&headers, "From").unwrap_or_else(|| "(unknown)".to_string()),
                subject: header_value(&headers, "Subject").unwrap_or_else(|| "(no subject)".to_string()),
                date: header_value(&headers, "Date").unwrap_or_default(),
                flagged,
                seen,
            });
        }

        // Newest first, matching how the listing is rendered
        summaries.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(summaries)
    }

    /// Run a UID SEARCH and fetch summaries for the newest `limit` matches.
    fn uid_query_summaries(&mut self, query: &str, limit: usize) -> Result<Vec<MessageSummary>, MailError> {
        let uids = self
            .session
            .uid_search(query)
            .map_err(|e| MailError::Protocol(format!("SEARCH {query}: {e}")))?;

        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable_by(|a, b| b.cmp(a));
        uids.truncate(limit.max(1));

        let uid_set = uids
            .iter()
            .map(|uid| uid.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let fetches = self
            .session
            .uid_fetch(&uid_set, "(UID FLAGS RFC822.HEADER)")
            .map_err(|e| MailError::Protocol(format!("UID FETCH {uid_set}: {e}")))?;

        let mut summaries = Vec::new();
        for fetch in fetches.iter() {
            if let Some(uid) = fetch.uid {
                let headers = fetch
                    .header()
                    .map(|bytes| String::from_utf8_lossy(bytes).to_string())
                    .unwrap_or_default();
                let mut flagged = false;
                let mut seen = false;
                for flag in fetch.flags() {
                    match flag {
                        imap::types::Flag::Flagged => flagged = true,
                        imap::types::Flag::Seen => seen = true,
                        _ => {}
                    }
                }
                summaries.push(MessageSummary {
                    id: uid,
                    from: header_value(&headers, "From").unwrap_or_else(|| "(unknown)".to_string()),
                    subject: header_value(&headers, "Subject")
                        .unwrap_or_else(|| "(no subject)".to_string()),
                    date: header_value(&headers, "Date").unwrap_or_default(),
                    flagged,
                    seen,
                });
            }
        }
        summaries.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(summaries)
    }
}

/// Pull one header value out of a raw RFC822 header block, unfolding
/// continuation lines.
fn header_value(headers: &str, name: &str) -> Option<String> {
    let prefix = format!("{}:", name.to_ascii_lowercase());
    let mut value: Option<String> = None;

    for line in headers.lines() {
        if let Some(current) = &mut value {
            if line.starts_with(' ') || line.starts_with('\t') {
                current.push(' ');
                current.push_str(line.trim());
                continue;
            }
            break;
        }
        if line.to_ascii_lowercase().starts_with(&prefix) {
            value = Some(line[prefix.len()..].trim().to_string());
        }
    }

    value.filter(|v| !v.is_empty())
}

impl ImapSession for TlsImapSession {
    fn list_messages(&mut self, folder: &str, limit: usize) -> Result<Vec<MessageSummary>, MailError> {
        let exists = self.select(folder)?;
        if exists == 0 {
            return Ok(Vec::new());
        }

        let start = exists.saturating_sub(limit.max(1) as u32 - 1).max(1);
        self.summaries_for(&format!("{start}:{exists}"))
    }

    fn fetch_body(&mut self, folder: &str, id: u32) -> Result<String, MailError> {
        self.ensure_selected(folder)?;

        let fetches = self
            .session
            .uid_fetch(id.to_string(), "RFC822")
            .map_err(|e| MailError::Protocol(format!("UID FETCH {id}: {e}")))?;

        let fetch = fetches
            .iter()
            .next()
            .ok_or_else(|| MailError::Protocol(format!("no message with id {id} in {folder}")))?;

        Ok(fetch
            .body()
            .map(|bytes| String::from_utf8_lossy(bytes).to_string())
            .unwrap_or_default())
    }

    fn search(&mut self, folder: &str, keyword: &str, limit: usize) -> Result<Vec<MessageSummary>, MailError> {
        self.ensure_selected(folder)?;

        // TEXT covers headers and body; the keyword is quoted as a literal
        let escaped = keyword.replace('\\', "").replace('"', "");
        self.uid_query_summaries(&format!("TEXT \"{escaped}\""), limit)
    }

    fn list_flagged(&mut self, folder: &str, flagged: bool, limit: usize) -> Result<Vec<MessageSummary>, MailError> {
        self.ensure_selected(folder)?;
        let query = if flagged { "FLAGGED" } else { "UNFLAGGED" };
        self.uid_query_summaries(query, limit)
    }

    fn set_flagged(&mut self, folder: &str, id: u32, flagged: bool) -> Result<(), MailError> {
        self.ensure_selected(folder)?;
        let query = if flagged {
            "+FLAGS (\\Flagged)"
        } else {
            "-FLAGS (\\Flagged)"
        };
        self.session
            .uid_store(id.to_string(), query)
            .map_err(|e| MailError::Protocol(format!("UID STORE {id}: {e}")))?;
        Ok(())
    }

    fn move_message(&mut self, id: u32, src_folder: &str, dst_folder: &str) -> Result<(), MailError> {
        self.select(src_folder)?;

        // COPY + \Deleted + EXPUNGE; MOVE is not universally supported
        self.session
            .uid_copy(id.to_string(), dst_folder)
            .map_err(|e| MailError::Protocol(format!("UID COPY {id} -> {dst_folder}: {e}")))?;
        self.session
            .uid_store(id.to_string(), "+FLAGS (\\Deleted)")
            .map_err(|e| MailError::Protocol(format!("UID STORE {id}: {e}")))?;
        self.session
            .expunge()
            .map_err(|e| MailError::Protocol(format!("EXPUNGE: {e}")))?;
        Ok(())
    }

    fn delete_message(&mut self, folder: &str, id: u32) -> Result<(), MailError> {
        self.ensure_selected(folder)?;
        self.session
            .uid_store(id.to_string(), "+FLAGS (\\Deleted)")
            .map_err(|e| MailError::Protocol(format!("UID STORE {id}: {e}")))?;
        self.session
            .expunge()
            .map_err(|e| MailError::Protocol(format!("EXPUNGE: {e}")))?;
        Ok(())
    }

    fn list_folders(&mut self) -> Result<Vec<String>, MailError> {
        let names = self
            .session
            .list(Some(""), Some("*"))
            .map_err(|e| MailError::Protocol(format!("LIST: {e}")))?;
        Ok(names.iter().map(|name| name.name().to_string()).collect())
    }

    fn append(&mut self, folder: &str, message: &str) -> Result<(), MailError> {
        self.session
            .append(folder, message.as_bytes())
            .map_err(|e| MailError::Protocol(format!("APPEND {folder}: {e}")))?;
        Ok(())
    }

    fn noop(&mut self) -> Result<(), MailError> {
        self.session
            .noop()
            .map_err(|e| MailError::Protocol(format!("NOOP: {e}")))
    }

    fn logout(&mut self) -> Result<(), MailError> {
        self.session
            .logout()
            .map_err(|e| MailError::Protocol(format!("LOGOUT: {e}")))
    }
}

// ============================================================================
// SMTP (lettre) implementation
// ============================================================================

pub struct LettreSmtpSender {
    transport: lettre::SmtpTransport,
}

impl LettreSmtpSender {
    pub fn connect(account: &Account, runner: &dyn CommandRunner) -> Result<Self, MailError> {
        use lettre::transport::smtp::authentication::Credentials;

        let password = resolve_password(account, runner)?;

        debug!("📡 Connecting to SMTP {}:{}", account.smtp_host, account.smtp_port);
        let transport = lettre::SmtpTransport::relay(&account.smtp_host)
            .map_err(|e| MailError::Connect(e.to_string()))?
            .port(account.smtp_port)
            .credentials(Credentials::new(account.username.clone(), password))
            .build();

        let sender = Self { transport };

        // Fail fast on bad credentials instead of at first send
        sender
            .transport
            .test_connection()
            .map_err(|e| MailError::Connect(e.to_string()))?;

        Ok(sender)
    }
}

impl SmtpSender for LettreSmtpSender {
    fn send(&mut self, message: &OutgoingMessage) -> Result<(), MailError> {
        use lettre::message::header::ContentType;
        use lettre::Transport;

        let mut builder = lettre::Message::builder()
            .from(
                message
                    .from
                    .parse()
                    .map_err(|e| MailError::Send(format!("bad from address: {e}")))?,
            )
            .subject(message.subject.clone())
            .header(ContentType::TEXT_PLAIN);

        for to in &message.to {
            builder = builder.to(to
                .parse()
                .map_err(|e| MailError::Send(format!("bad to address '{to}': {e}")))?);
        }

        let email = builder
            .body(message.body.clone())
            .map_err(|e| MailError::Send(e.to_string()))?;

        self.transport
            .send(&email)
            .map_err(|e| MailError::Send(e.to_string()))?;
        Ok(())
    }

    fn noop(&mut self) -> Result<(), MailError> {
        match self.transport.test_connection() {
            Ok(true) => Ok(()),
            Ok(false) => Err(MailError::Protocol("SMTP connection test failed".to_string())),
            Err(e) => Err(MailError::Protocol(e.to_string())),
        }
    }

    fn close(&mut self) -> Result<(), MailError> {
        // lettre tears the connection down on drop
        Ok(())
    }
}

// ============================================================================
// Pool factories
// ============================================================================

pub struct ImapFactory {
    account: SharedAccount,
    runner: Arc<dyn CommandRunner>,
}

impl ImapFactory {
    pub fn new(account: SharedAccount, runner: Arc<dyn CommandRunner>) -> Self {
        Self { account, runner }
    }
}

impl crate::pool::ClientFactory<Box<dyn ImapSession>> for ImapFactory {
    fn create(&self) -> Result<Box<dyn ImapSession>, MailError> {
        let account = self.account.read().expect("account lock poisoned").clone();
        TlsImapSession::connect(&account, self.runner.as_ref())
            .map(|session| Box::new(session) as Box<dyn ImapSession>)
    }
}

pub struct SmtpFactory {
    account: SharedAccount,
    runner: Arc<dyn CommandRunner>,
}

impl SmtpFactory {
    pub fn new(account: SharedAccount, runner: Arc<dyn CommandRunner>) -> Self {
        Self { account, runner }
    }
}

impl crate::pool::ClientFactory<Box<dyn SmtpSender>> for SmtpFactory {
    fn create(&self) -> Result<Box<dyn SmtpSender>, MailError> {
        let account = self.account.read().expect("account lock poisoned").clone();
        LettreSmtpSender::connect(&account, self.runner.as_ref())
            .map(|sender| Box::new(sender) as Box<dyn SmtpSender>)
    }
}

/// Render message summaries the way the CLI shows them: aligned columns,
/// flag marker first, newest message on top.
pub fn format_summaries(summaries: &[MessageSummary]) -> String {
    if summaries.is_empty() {
        return "No messages.\n\ncount: 0".to_string();
    }

    let id_width = summaries
        .iter()
        .map(|s| s.id.to_string().len())
        .max()
        .unwrap_or(1);

    let from_width = summaries.iter().map(|s| s.from.len()).max().unwrap_or(0).min(40);

    let rows = summaries
        .iter()
        .map(|s| {
            let marker = if s.flagged { "⚑" } else if !s.seen { "●" } else { " " };
            let from: String = s.from.chars().take(40).collect();
            format!(
                "{} {:>id_width$} {:<from_width$} {}",
                marker,
                s.id,
                from,
                s.subject,
                id_width = id_width,
                from_width = from_width
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!("{}\n\ncount: {}", rows, summaries.len())
}
