//! System abstraction layer for mocking external resources
//!
//! This module provides traits for system operations that can be mocked in tests:
//! - Socket connections (Unix sockets)
//! - Process probing and signalling (kill)
//! - Credential command execution (password_cmd)

use std::io::{self, Read, Write};
use std::path::Path;
use std::process::Output;
use std::time::Duration;

// ============================================================================
// Socket Abstractions
// ============================================================================

/// Trait for socket connections - allows mocking Unix socket I/O
pub trait SocketStream: Read + Write + Send + std::fmt::Debug {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

/// Trait for creating socket connections
pub trait SocketConnector: Send + Sync {
    fn connect(&self, path: &Path) -> io::Result<Box<dyn SocketStream>>;
    fn path_exists(&self, path: &Path) -> bool;
    fn is_socket(&self, path: &Path) -> io::Result<bool>;
}

/// Real Unix socket implementation
#[derive(Default)]
pub struct RealSocketConnector;

impl SocketConnector for RealSocketConnector {
    fn connect(&self, path: &Path) -> io::Result<Box<dyn SocketStream>> {
        let stream = std::os::unix::net::UnixStream::connect(path)?;
        Ok(Box::new(RealSocketStream(stream)))
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_socket(&self, path: &Path) -> io::Result<bool> {
        use std::os::unix::fs::FileTypeExt;
        let metadata = std::fs::metadata(path)?;
        Ok(metadata.file_type().is_socket())
    }
}

#[derive(Debug)]
struct RealSocketStream(std::os::unix::net::UnixStream);

impl Read for RealSocketStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for RealSocketStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl SocketStream for RealSocketStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.0.set_read_timeout(timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.0.set_write_timeout(timeout)
    }
}

// ============================================================================
// Process Abstractions
// ============================================================================

/// Trait for probing and signalling processes - allows mocking pid checks
pub trait ProcessProber: Send + Sync {
    /// Whether a process with this pid exists (signal 0)
    fn is_alive(&self, pid: u32) -> bool;

    /// Send SIGTERM to a process
    fn terminate(&self, pid: u32) -> io::Result<()>;
}

/// Real prober using libc::kill
#[derive(Default)]
pub struct RealProcessProber;

impl ProcessProber for RealProcessProber {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

// ============================================================================
// Command Abstractions
// ============================================================================

/// Result of running a command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub success: bool,
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: output.stdout,
            stderr: output.stderr,
            success: output.status.success(),
            code: output.status.code(),
        }
    }
}

/// Trait for running system commands (e.g. an account's password_cmd)
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput>;
}

/// Real command runner using std::process::Command
#[derive(Default)]
pub struct RealCommandRunner;

impl CommandRunner for RealCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        let output = std::process::Command::new(program).args(args).output()?;
        Ok(output.into())
    }
}

// ============================================================================
// Mock Implementations (for testing)
// ============================================================================


// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mock::*;

    #[test]
    fn test_mock_socket_stream_read_write() {
        let mut stream = MockSocketStream::new("hello");
        let mut buf = [0u8; 5];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");

        stream.write_all(b"sent").unwrap();
        assert_eq!(stream.written_string(), "sent");
    }

    #[test]
    fn test_mock_socket_stream_read_error() {
        let mut stream = MockSocketStream::new("").with_read_error(io::ErrorKind::TimedOut);
        let mut buf = [0u8; 4];
        let result = stream.read(&mut buf);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_mock_socket_stream_write_error() {
        let mut stream = MockSocketStream::new("").with_write_error(io::ErrorKind::BrokenPipe);
        assert_eq!(
            stream.write(b"x").unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }

    #[test]
    fn test_mock_connector_counts_connects() {
        let connector = MockSocketConnector::new("line\n");
        let _ = connector.connect(Path::new("/tmp/test.sock"));
        let _ = connector.connect(Path::new("/tmp/test.sock"));
        assert_eq!(connector.connects(), 2);
    }

    #[test]
    fn test_mock_connector_connection_refused() {
        let connector = MockSocketConnector::connection_refused();
        let result = connector.connect(Path::new("/tmp/test.sock"));
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn test_mock_connector_not_found_has_no_socket() {
        let connector = MockSocketConnector::not_found();
        assert!(!connector.path_exists(Path::new("/tmp/test.sock")));
    }

    #[test]
    fn test_mock_prober_alive_and_terminate() {
        let prober = MockProcessProber::with_alive(&[4242]);
        assert!(prober.is_alive(4242));
        assert!(!prober.is_alive(1));

        prober.terminate(4242).unwrap();
        assert!(!prober.is_alive(4242));
        assert_eq!(*prober.terminated.lock().unwrap(), vec![4242]);
    }

    #[test]
    fn test_real_prober_sees_own_process() {
        let prober = RealProcessProber;
        assert!(prober.is_alive(std::process::id()));
        assert!(!prober.is_alive(0));
    }

    #[test]
    fn test_mock_command_runner_password() {
        let runner = MockCommandRunner::new().password("pass", "hunter2");
        let output = runner.run("pass", &["show", "mail"]).unwrap();
        assert!(output.success);
        assert_eq!(output.stdout_str().trim(), "hunter2");
    }

    #[test]
    fn test_mock_command_runner_not_mocked() {
        let runner = MockCommandRunner::new();
        assert!(runner.run("unknown", &[]).is_err());
    }
}
