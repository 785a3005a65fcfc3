//! Running task commands.
//!
//! [`ProcessExecutor`] is the seam between the scheduler and the operating
//! system. [`SystemProcessExecutor`] spawns real processes; tests substitute
//! a scripted executor.

use crate::definition::{DependencyInfo, Task};
use crate::depinfo::read_dependency_info;
use async_trait::async_trait;
use kiln_core::{CancellationSignal, Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

const SIGINT: i32 = 2;
const SIGKILL: i32 = 9;
const SIGTERM: i32 = 15;

/// Everything needed to run one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub command_line: Vec<String>,
    /// The complete environment; nothing is inherited
    pub environment: BTreeMap<String, String>,
    pub working_directory: PathBuf,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
    pub dependency_info: Option<DependencyInfo>,
    /// Interleave stdout and stderr into one stream in arrival order
    pub merge_output: bool,
    pub outputs: Vec<PathBuf>,
}

impl ProcessRequest {
    pub fn for_task(task: &Task, default_timeout: Option<Duration>) -> Self {
        Self {
            command_line: task.command_line().to_vec(),
            environment: task.environment().clone(),
            working_directory: task.working_directory().to_path_buf(),
            stdin: None,
            timeout: task.timeout().or(default_timeout),
            dependency_info: task.dependency_info().cloned(),
            merge_output: true,
            outputs: task.declared_outputs().to_vec(),
        }
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    /// Killed by a signal. `cancelled` is set when the build asked for it
    /// or the signal was an interrupt.
    Signalled { signal: i32, cancelled: bool },
    TimedOut,
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, ExitStatus::Signalled { cancelled: true, .. })
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit code {code}"),
            ExitStatus::Signalled { signal, .. } => write!(f, "signal {signal}"),
            ExitStatus::TimedOut => f.write_str("timed out"),
        }
    }
}

/// Captured stdout/stderr
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapturedOutput {
    Split { stdout: Vec<u8>, stderr: Vec<u8> },
    Merged(Vec<u8>),
}

impl CapturedOutput {
    pub fn is_empty(&self) -> bool {
        match self {
            CapturedOutput::Split { stdout, stderr } => stdout.is_empty() && stderr.is_empty(),
            CapturedOutput::Merged(bytes) => bytes.is_empty(),
        }
    }

    /// Output as text for diagnostics
    pub fn text(&self) -> String {
        match self {
            CapturedOutput::Split { stdout, stderr } => {
                let mut text = String::from_utf8_lossy(stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(stderr));
                text
            }
            CapturedOutput::Merged(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub status: ExitStatus,
    pub output: CapturedOutput,
    /// Reported inputs; only read after a successful exit
    pub discovered_inputs: Vec<PathBuf>,
    pub discovered_outputs: Vec<PathBuf>,
    pub duration: Duration,
}

#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    /// Run the request to completion.
    ///
    /// A process that runs and fails is an `Ok` outcome with a non-success
    /// status. `Err` means it could not be run at all, or its dependency
    /// report could not be read.
    async fn execute(&self, request: ProcessRequest, cancel: CancellationSignal) -> Result<ProcessOutcome>;
}

/// Spawns real processes in their own process group
#[derive(Debug, Clone)]
pub struct SystemProcessExecutor {
    termination_grace: Duration,
}

impl SystemProcessExecutor {
    pub fn new(termination_grace: Duration) -> Self {
        Self { termination_grace }
    }
}

impl Default for SystemProcessExecutor {
    fn default() -> Self {
        Self::new(Duration::from_millis(kiln_core::DEFAULT_TERMINATION_GRACE_MS))
    }
}

enum Finish {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

struct Capture {
    merge: bool,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Capture {
    fn stdout(&mut self, chunk: &[u8]) {
        self.stdout.extend_from_slice(chunk);
    }

    fn stderr(&mut self, chunk: &[u8]) {
        if self.merge {
            self.stdout.extend_from_slice(chunk);
        } else {
            self.stderr.extend_from_slice(chunk);
        }
    }

    fn finish(self) -> CapturedOutput {
        if self.merge {
            CapturedOutput::Merged(self.stdout)
        } else {
            CapturedOutput::Split {
                stdout: self.stdout,
                stderr: self.stderr,
            }
        }
    }
}

async fn read_some<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl ProcessExecutor for SystemProcessExecutor {
    async fn execute(&self, request: ProcessRequest, mut cancel: CancellationSignal) -> Result<ProcessOutcome> {
        let started = Instant::now();
        let (program, args) = request
            .command_line
            .split_first()
            .ok_or_else(|| Error::invalid_description("empty command line"))?;

        if cancel.is_cancelled() {
            return Ok(ProcessOutcome {
                status: ExitStatus::Signalled {
                    signal: SIGTERM,
                    cancelled: true,
                },
                output: Capture {
                    merge: request.merge_output,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                }
                .finish(),
                discovered_inputs: Vec::new(),
                discovered_outputs: Vec::new(),
                duration: started.elapsed(),
            });
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(&request.environment)
            .current_dir(&request.working_directory)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            Error::command_execution(program, args.to_vec(), format!("failed to spawn: {e}"), None)
        })?;
        debug!(pid = child.id(), command = %program, "spawned process");

        if let (Some(data), Some(mut stdin)) = (request.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                // The child may exit without reading; a broken pipe is fine.
                let _ = stdin.write_all(&data).await;
            });
        }

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut stdout_buf = [0u8; 8192];
        let mut stderr_buf = [0u8; 8192];
        let mut capture = Capture {
            merge: request.merge_output,
            stdout: Vec::new(),
            stderr: Vec::new(),
        };

        let deadline = async {
            match request.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let finish = loop {
            tokio::select! {
                read = read_some(&mut stdout, &mut stdout_buf), if stdout.is_some() => match read {
                    Ok(0) | Err(_) => stdout = None,
                    Ok(n) => capture.stdout(&stdout_buf[..n]),
                },
                read = read_some(&mut stderr, &mut stderr_buf), if stderr.is_some() => match read {
                    Ok(0) | Err(_) => stderr = None,
                    Ok(n) => capture.stderr(&stderr_buf[..n]),
                },
                status = child.wait(), if stdout.is_none() && stderr.is_none() => break Finish::Exited(status),
                _ = &mut deadline => break Finish::TimedOut,
                _ = cancel.cancelled() => break Finish::Cancelled,
            }
        };

        let status = match finish {
            Finish::Exited(status) => {
                let status = status.map_err(|e| {
                    Error::command_execution(program, args.to_vec(), format!("failed to wait: {e}"), None)
                })?;
                convert_status(status)
            }
            Finish::TimedOut => {
                warn!(command = %program, "process timed out; terminating");
                terminate(&mut child, self.termination_grace).await;
                ExitStatus::TimedOut
            }
            Finish::Cancelled => {
                debug!(command = %program, "process cancelled; terminating");
                let signal = terminate(&mut child, self.termination_grace).await;
                ExitStatus::Signalled {
                    signal,
                    cancelled: true,
                }
            }
        };

        let (discovered_inputs, discovered_outputs) = match (&request.dependency_info, status.is_success()) {
            (Some(info), true) => {
                let deps = read_dependency_info(info, &request.working_directory)?;
                (deps.inputs, deps.outputs)
            }
            _ => (Vec::new(), Vec::new()),
        };

        Ok(ProcessOutcome {
            status,
            output: capture.finish(),
            discovered_inputs,
            discovered_outputs,
            duration: started.elapsed(),
        })
    }
}

fn convert_status(status: std::process::ExitStatus) -> ExitStatus {
    if let Some(code) = status.code() {
        return ExitStatus::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitStatus::Signalled {
                signal,
                cancelled: signal == SIGINT || signal == SIGKILL,
            };
        }
    }
    ExitStatus::Exited(-1)
}

/// Stop the child's whole process group: SIGTERM, then SIGKILL once the
/// grace period runs out. Returns the signal that ended it.
async fn terminate(child: &mut Child, grace: Duration) -> i32 {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let group = -(pid as libc::pid_t);
        // SAFETY: kill(2) has no memory-safety preconditions.
        unsafe {
            libc::kill(group, libc::SIGTERM);
        }
        if let Ok(Ok(_)) = tokio::time::timeout(grace, child.wait()).await {
            // Stragglers that ignored SIGTERM still go.
            unsafe {
                libc::kill(group, libc::SIGKILL);
            }
            return SIGTERM;
        }
        unsafe {
            libc::kill(group, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.start_kill() {
        debug!(error = %e, "child already gone");
    }
    let _ = child.wait().await;
    SIGKILL
}
