//! Per-session command execution context.

use std::path::{Path, PathBuf};

use rsh_core::protocol::is_control_verb;
use tracing::{debug, info};

use crate::builtins::{self, Builtin, HELP_TEXT};
use crate::error::SpawnError;
use crate::parser::{parse_segment, split_segments, Stage};
use crate::pipeline::{self, ExecOptions};

/// Whether the session keeps going after a line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// `halt` ran; the whole service is to shut down.
    Halt,
}

#[derive(Debug)]
pub enum SegmentOutcome {
    Output(Vec<u8>),
    Halt,
}

#[derive(Debug)]
pub struct LineOutcome {
    pub output: Vec<u8>,
    pub flow: Flow,
}

/// Execution state owned by exactly one session. The working directory here
/// is what `cd` changes and what every spawned stage inherits.
#[derive(Debug)]
pub struct Shell {
    cwd: PathBuf,
    options: ExecOptions,
}

impl Shell {
    pub fn new(cwd: PathBuf, options: ExecOptions) -> Self {
        Self { cwd, options }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Run every `;` segment of `line` in order and concatenate their output.
    /// Each segment is parsed only after the previous one has finished.
    pub async fn execute_line(&mut self, line: &str) -> Result<LineOutcome, SpawnError> {
        let mut output = Vec::new();
        for segment in split_segments(line) {
            match self.execute_segment(segment).await? {
                SegmentOutcome::Output(bytes) => output.extend_from_slice(&bytes),
                SegmentOutcome::Halt => {
                    return Ok(LineOutcome {
                        output,
                        flow: Flow::Halt,
                    })
                }
            }
        }
        Ok(LineOutcome {
            output,
            flow: Flow::Continue,
        })
    }

    pub async fn execute_segment(&mut self, segment: &str) -> Result<SegmentOutcome, SpawnError> {
        let pipeline = match parse_segment(segment) {
            Ok(Some(pipeline)) => pipeline,
            Ok(None) => return Ok(SegmentOutcome::Output(Vec::new())),
            Err(err) => {
                debug!(segment, error = %err, "parse error");
                return Ok(SegmentOutcome::Output(format!("[ERROR] parse error: {err}\n").into_bytes()));
            }
        };

        let first = pipeline.first();
        if let Some(builtin) = Builtin::lookup(first.program()) {
            return Ok(self.run_builtin(builtin, first).await);
        }
        if is_control_verb(first.program()) {
            return Ok(SegmentOutcome::Output(
                format!("[ERROR] {}: must be issued on its own line\n", first.program()).into_bytes(),
            ));
        }

        let result = pipeline::execute(&pipeline, &self.cwd, &self.options).await?;
        Ok(SegmentOutcome::Output(result.into_bytes()))
    }

    async fn run_builtin(&mut self, builtin: Builtin, stage: &Stage) -> SegmentOutcome {
        match builtin {
            Builtin::Help => SegmentOutcome::Output(HELP_TEXT.as_bytes().to_vec()),
            Builtin::Halt => SegmentOutcome::Halt,
            Builtin::Cd => {
                let target = stage.arguments().first().map(String::as_str);
                let message = match builtins::change_directory(&self.cwd, target).await {
                    Ok(path) => {
                        info!(cwd = %path.display(), "working directory changed");
                        self.cwd = path;
                        format!("[INFO] Changed directory to: {}\n", target.unwrap_or_default())
                    }
                    Err(err) => format!("[ERROR] {err}\n"),
                };
                SegmentOutcome::Output(message.into_bytes())
            }
        }
    }
}
