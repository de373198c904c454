use async_trait::async_trait;
use parking_lot::Mutex;
use primer_orca::*;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::job::{INIT_PRIMERS, INIT_SCORES, OUT_PRIMERS, OUT_SCORES};

/// What the scripted optimizer does on one invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Script {
    /// Write the four fixture outputs and exit 0.
    Succeed,
    /// Exit 0 without writing anything.
    SucceedWithoutOutputs,
    /// Exit with the given code and a message on stderr.
    Exit(i32),
    /// Die as if SIGKILLed.
    Crash,
    /// Fail to start.
    SpawnError(String),
    /// Sleep, then behave like `Succeed`.
    Slow(Duration),
}

/// [`ProcessRunner`] that follows a script instead of running anything.
///
/// Invocations consume queued scripts in order and fall back to the default
/// once the queue is empty. Every command line is recorded.
#[derive(Clone)]
pub struct ScriptedProcessRunner {
    queued: Arc<Mutex<VecDeque<Script>>>,
    default: Arc<Mutex<Script>>,
    calls: Arc<Mutex<Vec<CommandLine>>>,
}

impl std::fmt::Debug for ScriptedProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedProcessRunner")
            .field("queued", &self.queued.lock().len())
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}

impl ScriptedProcessRunner {
    pub fn new() -> Self {
        Self::with_default(Script::Succeed)
    }

    pub fn with_default(script: Script) -> Self {
        Self {
            queued: Arc::new(Mutex::new(VecDeque::new())),
            default: Arc::new(Mutex::new(script)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue `script` for the next unscripted invocation.
    pub fn then(self, script: Script) -> Self {
        self.queued.lock().push_back(script);
        self
    }

    pub fn set_default(&self, script: Script) {
        *self.default.lock() = script;
    }

    pub fn calls(&self) -> Vec<CommandLine> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.call_count();
        assert_eq!(
            actual, expected,
            "Expected {expected} optimizer invocations, got {actual}"
        );
    }

    /// `--threads=` value of the `index`th invocation.
    pub fn threads_of(&self, index: usize) -> Option<u32> {
        self.calls
            .lock()
            .get(index)
            .and_then(|cmd| flag(cmd, "--threads="))
            .and_then(|v| v.parse().ok())
    }

    fn next_script(&self) -> Script {
        self.queued
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default.lock().clone())
    }
}

impl Default for ScriptedProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn flag(command: &CommandLine, prefix: &str) -> Option<String> {
    command
        .args
        .iter()
        .find_map(|arg| arg.strip_prefix(prefix))
        .map(str::to_string)
}

async fn write_outputs(command: &CommandLine) -> anyhow::Result<()> {
    let init = flag(command, "--outInitFileName=")
        .ok_or_else(|| anyhow::anyhow!("missing --outInitFileName"))?;
    let out = flag(command, "--outFileName=")
        .ok_or_else(|| anyhow::anyhow!("missing --outFileName"))?;

    for (prefix, primers, scores) in [
        (init, INIT_PRIMERS, INIT_SCORES),
        (out, OUT_PRIMERS, OUT_SCORES),
    ] {
        let prefix = PathBuf::from(prefix);
        tokio::fs::write(with_suffix(&prefix, "primers"), primers).await?;
        tokio::fs::write(with_suffix(&prefix, "scores"), scores).await?;
    }
    Ok(())
}

fn success() -> ProcessOutput {
    ProcessOutput {
        exit_code: 0,
        stdout: "optimization finished\n".to_string(),
        stderr: String::new(),
    }
}

#[async_trait]
impl ProcessRunner for ScriptedProcessRunner {
    async fn run(&self, command: &CommandLine) -> anyhow::Result<ProcessOutput> {
        self.calls.lock().push(command.clone());

        match self.next_script() {
            Script::Succeed => {
                write_outputs(command).await?;
                Ok(success())
            }
            Script::SucceedWithoutOutputs => Ok(success()),
            Script::Exit(code) => Ok(ProcessOutput {
                exit_code: code,
                stdout: String::new(),
                stderr: format!("fatal: exit {code}\n"),
            }),
            Script::Crash => Ok(ProcessOutput {
                exit_code: -9,
                stdout: "iteration 1\n".to_string(),
                stderr: String::new(),
            }),
            Script::SpawnError(message) => Err(anyhow::anyhow!(message)),
            Script::Slow(delay) => {
                tokio::time::sleep(delay).await;
                write_outputs(command).await?;
                Ok(success())
            }
        }
    }
}
