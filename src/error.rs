use std::fmt;
use std::path::PathBuf;

/// Enhanced error types with rich context for better debugging and user experience
#[derive(Debug, Clone)]
pub enum MbxError {
    /// Configuration file not found
    ConfigNotFound {
        attempted_paths: Vec<PathBuf>,
        home_dir: PathBuf,
        custom_path: Option<PathBuf>,
    },

    /// Configuration file parsing or validation error
    ConfigInvalid {
        file_path: PathBuf,
        underlying_error: String,
    },

    /// Daemon could not be reached or started
    DaemonUnavailable {
        socket_path: PathBuf,
        reason: String,
    },

    /// The daemon's socket location failed a security check
    SocketSecurity {
        socket_path: PathBuf,
        reason: String,
    },

    /// Auth token file operation failed
    TokenError {
        token_path: PathBuf,
        operation: String,
        underlying_error: String,
    },

    /// Runtime error during an operation
    RuntimeError {
        operation: String,
        underlying_error: String,
        suggestions: Vec<String>,
    },
}

impl fmt::Display for MbxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MbxError::ConfigNotFound {
                attempted_paths,
                home_dir,
                custom_path,
            } => {
                writeln!(f, "Configuration file not found")?;
                if let Some(custom) = custom_path {
                    writeln!(f, "  Custom config path: {}", custom.display())?;
                } else {
                    writeln!(f, "  Home directory: {}", home_dir.display())?;
                    writeln!(f, "  Attempted paths:")?;
                    for path in attempted_paths {
                        writeln!(f, "    - {}", path.display())?;
                    }
                    writeln!(f)?;
                    writeln!(f, "  To create a config file, run:")?;
                    writeln!(
                        f,
                        "    mkdir -p {}",
                        home_dir.join(".config/mbx").display()
                    )?;
                    write!(
                        f,
                        "    $EDITOR {}",
                        home_dir.join(".config/mbx/mbx.yml").display()
                    )?;
                }
                Ok(())
            }

            MbxError::ConfigInvalid {
                file_path,
                underlying_error,
            } => {
                writeln!(f, "Configuration error in {}", file_path.display())?;
                writeln!(f, "  Error: {underlying_error}")?;
                write!(
                    f,
                    "  Check the YAML syntax and that the account block has imap_host, smtp_host, username and a credential."
                )
            }

            MbxError::DaemonUnavailable {
                socket_path,
                reason,
            } => {
                writeln!(f, "Daemon unavailable")?;
                writeln!(f, "  Socket: {}", socket_path.display())?;
                writeln!(f, "  Reason: {reason}")?;
                write!(f, "  Commands still work in direct mode; start the daemon with: mbx daemon --start")
            }

            MbxError::SocketSecurity {
                socket_path,
                reason,
            } => {
                writeln!(f, "Refusing to use insecure socket location")?;
                writeln!(f, "  Socket: {}", socket_path.display())?;
                write!(f, "  Reason: {reason}")
            }

            MbxError::TokenError {
                token_path,
                operation,
                underlying_error,
            } => {
                writeln!(f, "Auth token {operation} failed")?;
                writeln!(f, "  Token file: {}", token_path.display())?;
                writeln!(f, "  Error: {underlying_error}")?;
                write!(f, "  Rotate a fresh token with: mbx token --rotate")
            }

            MbxError::RuntimeError {
                operation,
                underlying_error,
                suggestions,
            } => {
                writeln!(f, "Error during {operation}")?;
                write!(f, "  {underlying_error}")?;
                if !suggestions.is_empty() {
                    writeln!(f)?;
                    writeln!(f, "  Suggestions:")?;
                    for (index, suggestion) in suggestions.iter().enumerate() {
                        if index + 1 < suggestions.len() {
                            writeln!(f, "    - {suggestion}")?;
                        } else {
                            write!(f, "    - {suggestion}")?;
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for MbxError {}
