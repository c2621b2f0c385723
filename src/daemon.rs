//! Background start-up hand-off.
//!
//! The parent process re-executes itself with [`CHILD_PROCESS_ARG`], writes
//! the full configuration to the child's stdin and then reads the child's
//! merged stdout/stderr line by line. The child answers with exactly one
//! sentinel line once it has either reached the consume loop or given up.
//! Anything else the child prints before that is relayed to the parent's
//! stderr.

use crate::config::ServiceConfig;
use crate::error::{PurgemanError, Result};
use parking_lot::Mutex;
use std::io::{self, BufRead, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Marker argument telling the binary it runs as the background child.
pub const CHILD_PROCESS_ARG: &str = "--child-process";

/// Line sent by the child once it is consuming events.
pub const SUCCESS_SENTINEL: &str = "<<COMMUNICATION_CLOSE_SUCCESS>>";

/// Line sent by the child when it could not start.
pub const ERROR_SENTINEL: &str = "<<COMMUNICATION_CLOSE_ERROR>>";

/// Start-up outcome reported by the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    Success,
    Error,
}

impl Sentinel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentinel::Success => SUCCESS_SENTINEL,
            Sentinel::Error => ERROR_SENTINEL,
        }
    }

    /// Parse one output line, ignoring surrounding whitespace.
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            SUCCESS_SENTINEL => Some(Sentinel::Success),
            ERROR_SENTINEL => Some(Sentinel::Error),
            _ => None,
        }
    }
}

/// Serialize `config` for the child and close the stream.
pub fn send_config<W: Write>(mut writer: W, config: &ServiceConfig) -> Result<()> {
    let yaml = config.to_yaml()?;
    writer.write_all(yaml.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Read the configuration handed over by the parent.
pub fn read_config<R: Read>(reader: R) -> Result<ServiceConfig> {
    ServiceConfig::from_reader(reader)
}

/// Read child output until a sentinel shows up.
///
/// Non-sentinel lines are copied to `relay`. End of stream without a
/// sentinel counts as a failed start.
pub fn await_child_startup<R: BufRead, W: Write>(reader: R, mut relay: W) -> Result<()> {
    for line in reader.lines() {
        let line = line.map_err(|e| {
            PurgemanError::Handshake(format!("failed to read child output: {}", e))
        })?;

        match Sentinel::parse(&line) {
            Some(Sentinel::Success) => return Ok(()),
            Some(Sentinel::Error) => {
                return Err(PurgemanError::Handshake(
                    "child reported a start-up failure".to_string(),
                ))
            }
            None => {
                // Relaying is best effort.
                let _ = writeln!(relay, "{}", line);
            }
        }
    }

    Err(PurgemanError::Handshake(
        "child exited before confirming start-up".to_string(),
    ))
}

/// Child side of the hand-off. Emits at most one sentinel.
pub struct StartupNotifier {
    writer: Mutex<Box<dyn Write + Send>>,
    sent: AtomicBool,
}

impl StartupNotifier {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
            sent: AtomicBool::new(false),
        }
    }

    /// Notifier writing to the process stdout.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Whether a sentinel has been written.
    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::SeqCst)
    }

    /// Write `sentinel` unless one was already written.
    ///
    /// Returns `true` if this call wrote it.
    pub fn notify(&self, sentinel: Sentinel) -> bool {
        if self
            .sent
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{}", sentinel.as_str()).and_then(|_| writer.flush()) {
            debug!(error = %e, "Failed to write start-up sentinel");
        }
        true
    }
}

/// Start the background child and wait for its start-up report.
///
/// `program` is the binary to execute, normally the current executable.
/// Returns the child's pid once it confirmed a successful start.
#[cfg(unix)]
pub fn spawn_background(program: &std::path::Path, config: &ServiceConfig) -> Result<u32> {
    use std::fs::File;
    use std::io::BufReader;
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    let (read_end, write_end) = output_pipe()?;
    let stderr_end = write_end.try_clone()?;

    let mut command = Command::new(program);
    command
        .arg(CHILD_PROCESS_ARG)
        .stdin(Stdio::piped())
        .stdout(Stdio::from(write_end))
        .stderr(Stdio::from(stderr_end))
        .process_group(0);

    let mut child = command.spawn().map_err(|e| {
        PurgemanError::Handshake(format!("failed to start {}: {}", program.display(), e))
    })?;
    // Drop our copies of the write end so EOF reaches the reader when the child exits.
    drop(command);

    let pid = child.id();
    info!(pid, "Started background process");

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| PurgemanError::Handshake("child stdin is not piped".to_string()))?;
    send_config(stdin, config)?;

    await_child_startup(BufReader::new(File::from(read_end)), io::stderr())?;

    info!(pid, "Background process is running");
    Ok(pid)
}

/// Pipe for the child's merged output, both ends close-on-exec.
#[cfg(unix)]
fn output_pipe() -> io::Result<(std::os::fd::OwnedFd, std::os::fd::OwnedFd)> {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds has room for the two descriptors pipe() writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: pipe() succeeded, so both descriptors are open and owned by nobody else.
    let (read_end, write_end) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    for fd in [&read_end, &write_end] {
        // SAFETY: fd is a valid open descriptor.
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok((read_end, write_end))
}

/// Non-Unix stub implementation.
#[cfg(not(unix))]
pub fn spawn_background(_program: &std::path::Path, _config: &ServiceConfig) -> Result<u32> {
    Err(PurgemanError::Io(io::Error::new(
        io::ErrorKind::Unsupported,
        "Running in the background is only supported on Unix systems",
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_sentinel_parse() {
        assert_eq!(Sentinel::parse(SUCCESS_SENTINEL), Some(Sentinel::Success));
        assert_eq!(
            Sentinel::parse("  <<COMMUNICATION_CLOSE_ERROR>>\r"),
            Some(Sentinel::Error)
        );
        assert_eq!(Sentinel::parse("<<COMMUNICATION_CLOSE>>"), None);
    }

    #[test]
    fn test_await_success_relays_diagnostics() {
        let output = "connecting to broker\nconnecting to catalog\n<<COMMUNICATION_CLOSE_SUCCESS>>\nlate line\n";
        let mut relayed = Vec::new();

        await_child_startup(Cursor::new(output), &mut relayed).unwrap();

        assert_eq!(
            String::from_utf8(relayed).unwrap(),
            "connecting to broker\nconnecting to catalog\n"
        );
    }

    #[test]
    fn test_await_error_sentinel() {
        let output = "could not connect\n<<COMMUNICATION_CLOSE_ERROR>>\n";
        let err = await_child_startup(Cursor::new(output), io::sink()).unwrap_err();
        assert!(matches!(err, PurgemanError::Handshake(_)));
    }

    #[test]
    fn test_await_eof_without_sentinel() {
        let err = await_child_startup(Cursor::new("panicked\n"), io::sink()).unwrap_err();
        assert!(matches!(err, PurgemanError::Handshake(_)));

        let err = await_child_startup(Cursor::new(""), io::sink()).unwrap_err();
        assert!(matches!(err, PurgemanError::Handshake(_)));
    }

    #[test]
    fn test_config_hand_off() {
        let mut config = ServiceConfig::default();
        config.broker.exchange = "irods".to_string();
        config.catalog.zone = "tempZone".to_string();
        config.cache.url_prefixes = vec!["http://a/".to_string(), "http://b/".to_string()];

        let mut pipe = Vec::new();
        send_config(&mut pipe, &config).unwrap();
        let received = read_config(Cursor::new(pipe)).unwrap();

        assert_eq!(received.broker.exchange, "irods");
        assert_eq!(received.catalog.zone, "tempZone");
        assert_eq!(received.cache.url_prefixes.len(), 2);
    }

    #[test]
    fn test_notifier_sends_once() {
        let buffer = SharedBuffer::default();
        let notifier = StartupNotifier::new(buffer.clone());

        assert!(!notifier.is_sent());
        assert!(notifier.notify(Sentinel::Success));
        assert!(!notifier.notify(Sentinel::Error));
        assert!(notifier.is_sent());

        assert_eq!(buffer.contents(), format!("{}\n", SUCCESS_SENTINEL));
    }

    #[test]
    fn test_notifier_output_satisfies_parent() {
        let buffer = SharedBuffer::default();
        let notifier = StartupNotifier::new(buffer.clone());
        notifier.notify(Sentinel::Error);

        let result = await_child_startup(Cursor::new(buffer.contents()), io::sink());
        assert!(result.is_err());
    }
}
