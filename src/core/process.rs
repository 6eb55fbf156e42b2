//! Child processes for pipeline steps.
//!
//! Every step runs as the leader of its own process group so cancellation
//! can signal the whole tree (shell wrappers, pipes, encoder children), not
//! just the direct child.

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use super::error::ProcessError;

const READ_CHUNK: usize = 8 * 1024;
const STRAGGLER_POLL: Duration = Duration::from_millis(50);

/// A spawned step with its merged stdout/stderr line stream.
pub struct StepProcess {
    pub child: Child,
    pub pgid: i32,
    pub lines: mpsc::UnboundedReceiver<String>,
    program: String,
}

impl StepProcess {
    /// Launch `argv` in a new process group with both output streams piped.
    pub fn spawn(argv: &[String]) -> Result<Self, ProcessError> {
        let (program, args) = argv.split_first().ok_or_else(|| ProcessError::Launch {
            program: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(false)
            .spawn()
            .map_err(|source| ProcessError::Launch {
                program: program.clone(),
                source,
            })?;

        // With process_group(0) the group id equals the leader's pid.
        let pgid = child.id().map(|pid| pid as i32).ok_or_else(|| ProcessError::Io {
            program: program.clone(),
            source: std::io::Error::other("child exited before its pid was read"),
        })?;

        let (tx, lines) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, tx));
        }

        debug!(program = %program, pgid, "Step process spawned");

        Ok(Self {
            child,
            pgid,
            lines,
            program: program.clone(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        self.child.wait().await.map_err(|source| ProcessError::Io {
            program: self.program.clone(),
            source,
        })
    }
}

/// Split a byte stream into lines on `\n` or `\r`. Progress meters such as
/// `dd status=progress` redraw with bare carriage returns.
async fn pump_lines<R>(mut reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK];
    let mut line = Vec::new();

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Step output stream closed with error");
                break;
            }
        };

        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                if !line.is_empty() {
                    let text = String::from_utf8_lossy(&line).into_owned();
                    line.clear();
                    if tx.send(text).is_err() {
                        return;
                    }
                }
            } else {
                line.push(b);
            }
        }
    }

    if !line.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&line).into_owned());
    }
}

/// Signal a whole process group. A group that is already gone is not an
/// error.
pub fn signal_group(pgid: i32, signal: Signal) {
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => debug!(pgid, signal = ?signal, "Signalled process group"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, signal = ?signal, error = %e, "Failed to signal process group"),
    }
}

/// True while any process in the group still exists (zombies included).
pub fn group_alive(pgid: i32) -> bool {
    killpg(Pid::from_raw(pgid), None::<Signal>).is_ok()
}

/// After the leader is gone, give the rest of the group until `deadline` to
/// exit, then SIGKILL whatever is left.
pub async fn kill_group_stragglers(pgid: i32, deadline: Instant) {
    while group_alive(pgid) {
        if Instant::now() >= deadline {
            warn!(pgid, "Process group outlived its leader, killing it");
            signal_group(pgid, Signal::SIGKILL);
            return;
        }
        sleep(STRAGGLER_POLL).await;
    }
}
