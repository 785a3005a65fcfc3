//! Test support: a [`ProcessExecutor`] that plays back scripts instead of
//! spawning processes.
//!
//! Scripts are keyed by the command line joined with spaces. Commands with
//! no script succeed after writing every declared output.

use crate::process::{CapturedOutput, ExitStatus, ProcessExecutor, ProcessOutcome, ProcessRequest};
use async_trait::async_trait;
use kiln_core::{CancellationSignal, Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// What a scripted command does
#[derive(Debug, Clone, Default)]
pub struct Script {
    exit_code: i32,
    delay: Duration,
    skip_outputs: bool,
    writes: Vec<(PathBuf, Vec<u8>)>,
    reads: Vec<PathBuf>,
    discovered_outputs: Vec<PathBuf>,
    output: String,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Do not create the declared outputs
    pub fn without_outputs(mut self) -> Self {
        self.skip_outputs = true;
        self
    }

    /// Write an extra file, reported as a discovered output
    pub fn writes(mut self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) -> Self {
        let path = path.into();
        self.discovered_outputs.push(path.clone());
        self.writes.push((path, content.into()));
        self
    }

    /// Report `path` as a discovered input
    pub fn reads(mut self, path: impl Into<PathBuf>) -> Self {
        self.reads.push(path.into());
        self
    }

    pub fn output(mut self, text: impl Into<String>) -> Self {
        self.output = text.into();
        self
    }
}

/// Scripted executor that records what ran and how many ran at once
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, Script>>,
    log: Mutex<Vec<String>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, command: impl Into<String>, script: Script) {
        self.scripts.lock().insert(command.into(), script);
    }

    /// Commands started so far, in start order
    pub fn executed(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.log.lock().len()
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessExecutor for ScriptedExecutor {
    async fn execute(&self, request: ProcessRequest, mut cancel: CancellationSignal) -> Result<ProcessOutcome> {
        let started = Instant::now();
        let command = request.command_line.join(" ");
        let script = self.scripts.lock().get(&command).cloned().unwrap_or_default();
        self.log.lock().push(command);

        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = RunningGuard(&self.running);
        self.max_running.fetch_max(now_running, Ordering::SeqCst);

        let cancelled = tokio::select! {
            _ = tokio::time::sleep(script.delay) => false,
            _ = cancel.cancelled() => true,
        };
        if cancelled {
            return Ok(ProcessOutcome {
                status: ExitStatus::Signalled {
                    signal: 15,
                    cancelled: true,
                },
                output: CapturedOutput::Merged(Vec::new()),
                discovered_inputs: Vec::new(),
                discovered_outputs: Vec::new(),
                duration: started.elapsed(),
            });
        }

        let declared = if script.skip_outputs || script.exit_code != 0 {
            Vec::new()
        } else {
            request
                .outputs
                .iter()
                .map(|p| (p.clone(), request.command_line.join(" ").into_bytes()))
                .collect()
        };
        for (path, content) in declared.iter().chain(&script.writes) {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::file_system(parent, "create scripted output directory", e))?;
            }
            std::fs::write(path, content).map_err(|e| Error::file_system(path, "write scripted output", e))?;
        }

        Ok(ProcessOutcome {
            status: ExitStatus::Exited(script.exit_code),
            output: CapturedOutput::Merged(script.output.into_bytes()),
            discovered_inputs: script.reads,
            discovered_outputs: script.discovered_outputs,
            duration: started.elapsed(),
        })
    }
}
