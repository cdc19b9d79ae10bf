//! Media changer control via the mtx CLI.

pub mod parse_mtx_status;

pub use parse_mtx_status::{parse_mtx_status, ElementKind, ElementRecord};

use std::sync::Mutex;

use anyhow::{bail, Error};

use crate::tools::command::{AbortFlag, CommandOutput, CommandRunner, CommandSpec, LineHandler};

/// Buffers output lines for parsing while forwarding them to an inner
/// handler.
pub struct BufferedLines<'a> {
    buffer: Mutex<String>,
    inner: &'a dyn LineHandler,
}

impl<'a> BufferedLines<'a> {
    pub fn new(inner: &'a dyn LineHandler) -> Self {
        Self {
            buffer: Mutex::new(String::new()),
            inner,
        }
    }

    pub fn into_string(self) -> String {
        self.buffer.into_inner().unwrap()
    }
}

impl LineHandler for BufferedLines<'_> {
    fn on_line(&self, line: &str) {
        let mut buffer = self.buffer.lock().unwrap();
        buffer.push_str(line);
        buffer.push('\n');
        drop(buffer);
        self.inner.on_line(line);
    }
}

/// Runs `mtx -f {changer} status` and returns the parsed element list.
pub async fn mtx_status(
    runner: &dyn CommandRunner,
    program: &str,
    changer: &str,
    abort: &AbortFlag,
    on_line: &dyn LineHandler,
) -> Result<Vec<ElementRecord>, Error> {
    let buffer = BufferedLines::new(on_line);
    let spec = CommandSpec::new(program, &["-f", changer, "status"]);
    let output = runner.exec(&spec, abort, &buffer).await?;
    if !output.success() {
        bail!("mtx status failed - {}", output.last_message);
    }
    parse_mtx_status(&buffer.into_string())
}

/// Runs `mtx -f {changer} load {slot} {drive}`.
pub async fn mtx_load(
    runner: &dyn CommandRunner,
    program: &str,
    changer: &str,
    slot: u64,
    drivenum: u64,
    abort: &AbortFlag,
    on_line: &dyn LineHandler,
) -> Result<CommandOutput, Error> {
    let slot = slot.to_string();
    let drivenum = drivenum.to_string();
    let spec = CommandSpec::new(
        program,
        &["-f", changer, "load", slot.as_str(), drivenum.as_str()],
    );
    Ok(runner.exec(&spec, abort, on_line).await?)
}

/// Runs `mtx -f {changer} unload {slot} {drive}`.
pub async fn mtx_unload(
    runner: &dyn CommandRunner,
    program: &str,
    changer: &str,
    slot: u64,
    drivenum: u64,
    abort: &AbortFlag,
    on_line: &dyn LineHandler,
) -> Result<CommandOutput, Error> {
    let slot = slot.to_string();
    let drivenum = drivenum.to_string();
    let spec = CommandSpec::new(
        program,
        &["-f", changer, "unload", slot.as_str(), drivenum.as_str()],
    );
    Ok(runner.exec(&spec, abort, on_line).await?)
}

/// Runs `mtx -f {changer} transfer {from} {to}`.
pub async fn mtx_transfer(
    runner: &dyn CommandRunner,
    program: &str,
    changer: &str,
    from_slot: u64,
    to_slot: u64,
    abort: &AbortFlag,
    on_line: &dyn LineHandler,
) -> Result<CommandOutput, Error> {
    let from_slot = from_slot.to_string();
    let to_slot = to_slot.to_string();
    let spec = CommandSpec::new(
        program,
        &["-f", changer, "transfer", from_slot.as_str(), to_slot.as_str()],
    );
    Ok(runner.exec(&spec, abort, on_line).await?)
}
