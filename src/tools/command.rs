//! Subprocess execution with line streaming and cooperative abort.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

/// Cooperative cancellation flag shared between an operation and the
/// subprocesses it drives.
#[derive(Clone)]
pub struct AbortFlag {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for AbortFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortFlag {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the flag fires.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // no sender left, the flag can never fire
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn fail_on_abort(&self) -> Result<(), Error> {
        if self.is_aborted() {
            bail!("abort requested - aborting");
        }
        Ok(())
    }
}

/// Sleeps unless the abort flag fires first.
pub async fn abortable_sleep(abort: &AbortFlag, duration: Duration) -> Result<(), Error> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = abort.aborted() => bail!("abort requested - aborting"),
    }
}

/// Receives each non-empty output line of a running child process.
pub trait LineHandler: Send + Sync {
    fn on_line(&self, line: &str);
}

/// Forwards output lines to the global logger at debug level.
pub struct DebugLineHandler;

impl LineHandler for DebugLineHandler {
    fn on_line(&self, line: &str) {
        log::debug!("{}", line);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// An external program invocation.
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<S: AsRef<str>>(program: &str, args: &[S]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.as_ref().to_string()).collect(),
        }
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "'{} {}'", self.program, self.args.join(" "))
    }
}

#[derive(Clone, Debug)]
/// Exit state of a completed child process.
pub struct CommandOutput {
    pub exit_code: i32,
    /// Last non-empty line seen across stdout and stderr
    pub last_message: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("command aborted")]
    Aborted,
    #[error("{0}")]
    Other(#[from] Error),
}

/// Seam between the engine and the external CLI tools it drives.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs a child process to completion, streaming every non-empty
    /// stdout/stderr line through the handler.
    async fn exec(
        &self,
        spec: &CommandSpec,
        abort: &AbortFlag,
        on_line: &dyn LineHandler,
    ) -> Result<CommandOutput, CommandError>;
}

/// Runs commands as tokio child processes.
pub struct TokioCommandRunner;

impl TokioCommandRunner {
    fn handle_line(line: &str, last_message: &mut String, on_line: &dyn LineHandler) {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return;
        }
        on_line.on_line(line);
        last_message.clear();
        last_message.push_str(line);
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn exec(
        &self,
        spec: &CommandSpec,
        abort: &AbortFlag,
        on_line: &dyn LineHandler,
    ) -> Result<CommandOutput, CommandError> {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        // bundled tool directories carry their co-located libraries
        if let Some(dir) = Path::new(&spec.program).parent() {
            if !dir.as_os_str().is_empty() {
                command.current_dir(dir);
            }
        }

        let mut child = command
            .spawn()
            .map_err(|err| format_err!("failed to execute {} - {}", spec, err))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| format_err!("unable to capture stdout of {}", spec.program))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| format_err!("unable to capture stderr of {}", spec.program))?;

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stdout_done = false;
        let mut stderr_done = false;
        let mut last_message = String::new();

        while !(stdout_done && stderr_done) {
            tokio::select! {
                line = stdout_lines.next_line(), if !stdout_done => match line {
                    Ok(Some(line)) => Self::handle_line(&line, &mut last_message, on_line),
                    Ok(None) => stdout_done = true,
                    Err(err) => {
                        stdout_done = true;
                        log::warn!("error reading stdout of {} - {}", spec.program, err);
                    }
                },
                line = stderr_lines.next_line(), if !stderr_done => match line {
                    Ok(Some(line)) => Self::handle_line(&line, &mut last_message, on_line),
                    Ok(None) => stderr_done = true,
                    Err(err) => {
                        stderr_done = true;
                        log::warn!("error reading stderr of {} - {}", spec.program, err);
                    }
                },
                _ = abort.aborted() => {
                    let _ = child.kill().await;
                    return Err(CommandError::Aborted);
                }
            }
        }

        let wait_result = tokio::select! {
            status = child.wait() => Some(status),
            _ = abort.aborted() => None,
        };

        let status = match wait_result {
            Some(status) => {
                status.map_err(|err| format_err!("failed to wait for {} - {}", spec, err))?
            }
            None => {
                let _ = child.kill().await;
                return Err(CommandError::Aborted);
            }
        };

        let exit_code = status
            .code()
            .ok_or_else(|| format_err!("{} terminated by signal", spec.program))?;

        Ok(CommandOutput {
            exit_code,
            last_message,
        })
    }
}

/// Replays canned tool output in order (simulation and tests).
///
/// Expected invocations are matched strictly against the program name
/// (ignoring a configured tool directory) and the argument list.
#[derive(Default)]
pub struct ScriptedCommandRunner {
    script: Mutex<VecDeque<ScriptedCall>>,
    invocations: Mutex<Vec<CommandSpec>>,
}

struct ScriptedCall {
    program: String,
    args: Vec<String>,
    exit_code: i32,
    output: String,
}

impl ScriptedCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the next expected invocation together with its canned output.
    pub fn expect<S: AsRef<str>>(&self, program: &str, args: &[S], exit_code: i32, output: &str) {
        self.script.lock().unwrap().push_back(ScriptedCall {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.as_ref().to_string()).collect(),
            exit_code,
            output: output.to_string(),
        });
    }

    /// All invocations seen so far.
    pub fn invocations(&self) -> Vec<CommandSpec> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

#[async_trait]
impl CommandRunner for ScriptedCommandRunner {
    async fn exec(
        &self,
        spec: &CommandSpec,
        _abort: &AbortFlag,
        on_line: &dyn LineHandler,
    ) -> Result<CommandOutput, CommandError> {
        self.invocations.lock().unwrap().push(spec.clone());

        let call = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| format_err!("unexpected command {}", spec))?;

        let program = Path::new(&spec.program)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| spec.program.clone());

        if program != call.program || spec.args != call.args {
            return Err(CommandError::Other(format_err!(
                "unexpected command {} - expected '{} {}'",
                spec,
                call.program,
                call.args.join(" ")
            )));
        }

        let mut last_message = String::new();
        for line in call.output.lines() {
            if line.trim().is_empty() {
                continue;
            }
            on_line.on_line(line);
            last_message = line.to_string();
        }

        Ok(CommandOutput {
            exit_code: call.exit_code,
            last_message,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct CollectLines(Mutex<Vec<String>>);

    impl LineHandler for CollectLines {
        fn on_line(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    #[tokio::test]
    async fn test_scripted_replay() -> Result<(), Error> {
        let runner = ScriptedCommandRunner::new();
        runner.expect("mtx", &["-f", "/dev/sg2", "status"], 0, "line one\n\nline two\n");

        let lines = CollectLines(Mutex::new(Vec::new()));
        let output = runner
            .exec(
                &CommandSpec::new("/opt/tools/mtx", &["-f", "/dev/sg2", "status"]),
                &AbortFlag::new(),
                &lines,
            )
            .await?;

        assert_eq!(output.exit_code, 0);
        assert_eq!(output.last_message, "line two");
        assert_eq!(lines.0.lock().unwrap().len(), 2);
        assert_eq!(runner.remaining(), 0);

        // out of script
        assert!(runner
            .exec(
                &CommandSpec::new("mtx", &["status"]),
                &AbortFlag::new(),
                &DebugLineHandler,
            )
            .await
            .is_err());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_runner() -> Result<(), Error> {
        let lines = CollectLines(Mutex::new(Vec::new()));
        let output = TokioCommandRunner
            .exec(
                &CommandSpec::new("sh", &["-c", "echo first; echo second 1>&2; exit 3"]),
                &AbortFlag::new(),
                &lines,
            )
            .await?;

        assert_eq!(output.exit_code, 3);
        let mut seen = lines.0.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["first".to_string(), "second".to_string()]);
        Ok(())
    }
}
