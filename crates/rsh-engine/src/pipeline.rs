//! Pipeline executor.
//!
//! A pipeline of N stages runs as N processes joined by N-1 anonymous pipes.
//! The last stage writes into a result pipe that this process drains to
//! end-of-stream before reaping the children. Every pipe end this process
//! hands to a child is closed here as soon as the child is spawned, so the
//! result pipe reaches EOF once every stage has exited or closed its copy.

use std::fs::{File, OpenOptions};
use std::io::{self, PipeReader, PipeWriter, Write};
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{is_resource_exhaustion, SpawnError, StageError};
use crate::parser::{OutputMode, OutputRedirect, Pipeline, Stage};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Clone, Debug)]
pub struct ExecOptions {
    /// Bytes of result kept; the rest is drained and discarded.
    pub max_output_bytes: usize,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            max_output_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Pipe ends belonging to one stage before it is launched.
struct StageEnds {
    /// Read end of the previous inter-stage pipe; `None` for stage 0.
    stdin: Option<PipeReader>,
    /// Write end of the next inter-stage pipe, or of the result pipe for the
    /// final stage.
    stdout: PipeWriter,
}

/// Pipe topology for a pipeline, allocated before any process starts.
pub struct ProcessGraph {
    ends: Vec<StageEnds>,
    result: PipeReader,
    inter_stage: usize,
}

impl ProcessGraph {
    /// Allocate `stage_count - 1` inter-stage pipes plus the result pipe.
    pub fn allocate(stage_count: usize) -> Result<Self, SpawnError> {
        let (result, result_tx) = io::pipe().map_err(SpawnError::Pipe)?;

        let mut stdins = Vec::with_capacity(stage_count);
        let mut stdouts = Vec::with_capacity(stage_count);
        stdins.push(None);
        for _ in 1..stage_count {
            let (rx, tx) = io::pipe().map_err(SpawnError::Pipe)?;
            stdouts.push(tx);
            stdins.push(Some(rx));
        }
        stdouts.push(result_tx);

        let inter_stage = stdins.len() - 1;
        let ends = stdins
            .into_iter()
            .zip(stdouts)
            .map(|(stdin, stdout)| StageEnds { stdin, stdout })
            .collect();

        Ok(Self {
            ends,
            result,
            inter_stage,
        })
    }

    pub fn inter_stage_pipes(&self) -> usize {
        self.inter_stage
    }

    pub fn stage_count(&self) -> usize {
        self.ends.len()
    }

    fn into_parts(self) -> (Vec<StageEnds>, PipeReader) {
        (self.ends, self.result)
    }
}

enum Source {
    Empty,
    Pipe(PipeReader),
    File(File),
}

impl From<Source> for Stdio {
    fn from(source: Source) -> Self {
        match source {
            Source::Empty => Stdio::null(),
            Source::Pipe(rx) => rx.into(),
            Source::File(file) => file.into(),
        }
    }
}

enum Sink {
    Pipe(PipeWriter),
    File(File),
}

impl Sink {
    fn try_clone(&self) -> io::Result<Self> {
        Ok(match self {
            Self::Pipe(tx) => Self::Pipe(tx.try_clone()?),
            Self::File(file) => Self::File(file.try_clone()?),
        })
    }

    /// Best effort: a closed downstream simply loses the diagnostic.
    fn write_diagnostic(mut self, err: &StageError) {
        let _ = self.write_all(err.diagnostic().as_bytes());
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Pipe(tx) => tx.write(buf),
            Self::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Pipe(tx) => tx.flush(),
            Self::File(file) => file.flush(),
        }
    }
}

impl From<Sink> for Stdio {
    fn from(sink: Sink) -> Self {
        match sink {
            Sink::Pipe(tx) => tx.into(),
            Sink::File(file) => file.into(),
        }
    }
}

enum LaunchError {
    Stage(StageError),
    Fatal(SpawnError),
}

enum Launched {
    Running { program: String, child: Child },
    Failed { program: String, err: StageError },
}

/// How one stage ended.
#[derive(Debug)]
pub enum StageOutcome {
    Exited(ExitStatus),
    /// Never started; its diagnostic went into the stage's output.
    Failed(StageError),
    /// Started, but waiting on it failed.
    Lost(io::Error),
}

impl StageOutcome {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(status) if status.success())
    }
}

#[derive(Debug)]
pub struct StageReport {
    pub program: String,
    pub outcome: StageOutcome,
}

/// Captured result of one pipeline run.
#[derive(Debug)]
pub struct PipelineOutput {
    pub output: Vec<u8>,
    /// Bytes drained past `max_output_bytes` and thrown away.
    pub discarded: usize,
    /// Set when the result was empty because output went to a file.
    pub saved_to: Option<String>,
    pub stages: Vec<StageReport>,
}

impl PipelineOutput {
    /// Response payload: captured bytes plus confirmation and truncation notes.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut bytes = self.output;
        if let Some(path) = &self.saved_to {
            bytes.extend_from_slice(format!("[INFO] Output saved to file: {path}\n").as_bytes());
        }
        if self.discarded > 0 {
            bytes.extend_from_slice(
                format!("[WARN] output truncated: {} bytes discarded\n", self.discarded).as_bytes(),
            );
        }
        bytes
    }
}

/// Run `pipeline` with `cwd` as every stage's working directory.
pub async fn execute(pipeline: &Pipeline, cwd: &Path, options: &ExecOptions) -> Result<PipelineOutput, SpawnError> {
    let graph = ProcessGraph::allocate(pipeline.len())?;
    debug!(
        stages = graph.stage_count(),
        pipes = graph.inter_stage_pipes(),
        "process graph allocated"
    );
    let (ends, result) = graph.into_parts();

    let mut launched = Vec::with_capacity(pipeline.len());
    for (index, (stage, ends)) in pipeline.stages().iter().zip(ends).enumerate() {
        match launch(stage, ends, cwd) {
            Ok(child) => {
                debug!(stage = index, program = stage.program(), pid = ?child.id(), "stage spawned");
                launched.push(Launched::Running {
                    program: stage.program().to_string(),
                    child,
                });
            }
            Err(LaunchError::Stage(err)) => {
                warn!(stage = index, program = stage.program(), kind = err.error_kind(), error = %err, "stage failed to start");
                launched.push(Launched::Failed {
                    program: stage.program().to_string(),
                    err,
                });
            }
            Err(LaunchError::Fatal(err)) => return Err(err),
        }
    }

    let (output, discarded) = drain(result, options.max_output_bytes).await?;

    let mut stages = Vec::with_capacity(launched.len());
    for entry in launched {
        let report = match entry {
            Launched::Running { program, mut child } => {
                let outcome = match child.wait().await {
                    Ok(status) => StageOutcome::Exited(status),
                    Err(err) => {
                        warn!(program = %program, error = %err, "failed to reap stage");
                        StageOutcome::Lost(err)
                    }
                };
                StageReport { program, outcome }
            }
            Launched::Failed { program, err } => StageReport {
                program,
                outcome: StageOutcome::Failed(err),
            },
        };
        debug!(program = %report.program, outcome = ?report.outcome, "stage finished");
        stages.push(report);
    }

    let saved_to = if output.is_empty() {
        pipeline.output_destination().map(|o| o.path.clone())
    } else {
        None
    };

    Ok(PipelineOutput {
        output,
        discarded,
        saved_to,
        stages,
    })
}

fn launch(stage: &Stage, ends: StageEnds, cwd: &Path) -> Result<Child, LaunchError> {
    let StageEnds { stdin, stdout } = ends;
    let default_sink = Sink::Pipe(stdout);

    let source = match (&stage.input, stdin) {
        (Some(path), upstream) => {
            drop(upstream);
            match File::open(resolve(cwd, path)) {
                Ok(file) => Source::File(file),
                Err(source) => {
                    return Err(stage_failure(
                        default_sink,
                        StageError::InputRedirection {
                            path: path.clone(),
                            source,
                        },
                    ))
                }
            }
        }
        (None, Some(rx)) => Source::Pipe(rx),
        (None, None) => Source::Empty,
    };

    let sink = match &stage.output {
        Some(redirect) => match open_output(cwd, redirect) {
            Ok(file) => {
                drop(default_sink);
                Sink::File(file)
            }
            Err(source) => {
                return Err(stage_failure(
                    default_sink,
                    StageError::OutputRedirection {
                        path: redirect.path.clone(),
                        source,
                    },
                ))
            }
        },
        None => default_sink,
    };

    let fatal = |err| LaunchError::Fatal(SpawnError::Descriptor(err));
    let diagnostics = sink.try_clone().map_err(fatal)?;
    let stderr = sink.try_clone().map_err(fatal)?;

    let mut command = Command::new(stage.program());
    command
        .args(stage.arguments())
        .current_dir(cwd)
        .stdin(source)
        .stdout(sink)
        .stderr(stderr);
    let spawned = command.spawn();
    // The command still owns the parent's copies of the stage's descriptors.
    drop(command);

    match spawned {
        Ok(child) => Ok(child),
        Err(source) if is_resource_exhaustion(&source) => Err(LaunchError::Fatal(SpawnError::Process {
            program: stage.program().to_string(),
            source,
        })),
        Err(source) => Err(stage_failure(
            diagnostics,
            StageError::Exec {
                program: stage.program().to_string(),
                source,
            },
        )),
    }
}

fn stage_failure(sink: Sink, err: StageError) -> LaunchError {
    sink.write_diagnostic(&err);
    LaunchError::Stage(err)
}

fn open_output(cwd: &Path, redirect: &OutputRedirect) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).mode(0o644);
    match redirect.mode {
        OutputMode::Truncate => options.truncate(true),
        OutputMode::Append => options.append(true),
    };
    options.open(resolve(cwd, &redirect.path))
}

fn resolve(cwd: &Path, path: &str) -> PathBuf {
    cwd.join(path)
}

async fn drain(result: PipeReader, limit: usize) -> Result<(Vec<u8>, usize), SpawnError> {
    let mut rx = pipe::Receiver::from_owned_fd(OwnedFd::from(result)).map_err(SpawnError::Drain)?;
    let mut output = Vec::new();
    let mut discarded = 0;
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = rx.read(&mut chunk).await.map_err(SpawnError::Drain)?;
        if n == 0 {
            break;
        }
        let keep = n.min(limit.saturating_sub(output.len()));
        output.extend_from_slice(&chunk[..keep]);
        discarded += n - keep;
    }
    Ok((output, discarded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_segment;

    async fn run_in(dir: &Path, line: &str) -> PipelineOutput {
        let pipeline = parse_segment(line).unwrap().unwrap();
        execute(&pipeline, dir, &ExecOptions::default()).await.unwrap()
    }

    async fn run(line: &str) -> PipelineOutput {
        run_in(&std::env::temp_dir(), line).await
    }

    fn text(out: &PipelineOutput) -> String {
        String::from_utf8_lossy(&out.output).into_owned()
    }

    #[test]
    fn single_stage_has_no_inter_stage_pipes() {
        let graph = ProcessGraph::allocate(1).unwrap();
        assert_eq!(graph.inter_stage_pipes(), 0);
        assert_eq!(graph.stage_count(), 1);
    }

    #[test]
    fn n_stages_have_n_minus_one_pipes() {
        let graph = ProcessGraph::allocate(4).unwrap();
        assert_eq!(graph.inter_stage_pipes(), 3);
        assert_eq!(graph.stage_count(), 4);
    }

    #[tokio::test]
    async fn single_stage_output() {
        let out = run("echo hello world").await;
        assert_eq!(text(&out), "hello world\n");
        assert!(out.saved_to.is_none());
        assert!(out.stages[0].outcome.success());
    }

    #[tokio::test]
    async fn stages_compose_in_order() {
        let out = run("echo hello | tr a-z A-Z | tr -d L").await;
        assert_eq!(text(&out), "HEO\n");
        assert_eq!(out.stages.len(), 3);
        assert!(out.stages.iter().all(|s| s.outcome.success()));
    }

    #[tokio::test]
    async fn first_stage_reads_empty_input() {
        let out = run("cat").await;
        assert!(out.output.is_empty());
        assert!(out.stages[0].outcome.success());
    }

    #[tokio::test]
    async fn ls_piped_to_wc_counts_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("only.txt"), "x").unwrap();
        let out = run_in(dir.path(), "ls | wc -l").await;
        assert_eq!(text(&out).trim(), "1");
    }

    #[tokio::test]
    async fn output_redirection_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        let saved = run_in(dir.path(), "echo hi > f.txt").await;
        assert!(saved.output.is_empty());
        assert_eq!(saved.saved_to.as_deref(), Some("f.txt"));
        assert_eq!(std::fs::read_to_string(dir.path().join("f.txt")).unwrap(), "hi\n");

        let read = run_in(dir.path(), "cat < f.txt").await;
        assert_eq!(text(&read), "hi\n");
        assert!(read.saved_to.is_none());
    }

    #[tokio::test]
    async fn confirmation_names_destination() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_in(dir.path(), "echo hi > out.txt").await;
        assert_eq!(
            String::from_utf8(out.into_bytes()).unwrap(),
            "[INFO] Output saved to file: out.txt\n"
        );
    }

    #[tokio::test]
    async fn append_mode_appends() {
        let dir = tempfile::tempdir().unwrap();
        run_in(dir.path(), "echo a >> log").await;
        run_in(dir.path(), "echo b >> log").await;
        run_in(dir.path(), "echo c > trunc").await;
        run_in(dir.path(), "echo d > trunc").await;
        assert_eq!(std::fs::read_to_string(dir.path().join("log")).unwrap(), "a\nb\n");
        assert_eq!(std::fs::read_to_string(dir.path().join("trunc")).unwrap(), "d\n");
    }

    #[tokio::test]
    async fn input_redirection_overrides_pipe() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in.txt"), "from file\n").unwrap();
        let out = run_in(dir.path(), "echo from pipe | cat < in.txt").await;
        assert_eq!(text(&out), "from file\n");
    }

    #[tokio::test]
    async fn unknown_program_reports_diagnostic() {
        let out = run("rsh-definitely-not-a-program").await;
        let text = text(&out);
        assert!(
            text.starts_with("[ERROR] Execution error: rsh-definitely-not-a-program:"),
            "got: {text}"
        );
        assert!(matches!(out.stages[0].outcome, StageOutcome::Failed(StageError::Exec { .. })));
    }

    #[tokio::test]
    async fn failed_stage_leaves_siblings_running() {
        let out = run("echo hi | rsh-definitely-not-a-program | wc -l").await;
        // wc counts the single diagnostic line produced by the middle stage.
        assert_eq!(text(&out).trim(), "1");
        assert!(matches!(out.stages[0].outcome, StageOutcome::Exited(_)));
        assert!(matches!(out.stages[1].outcome, StageOutcome::Failed(_)));
        assert!(out.stages[2].outcome.success());
    }

    #[tokio::test]
    async fn missing_input_file_is_stage_local() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_in(dir.path(), "cat < missing.txt").await;
        let text = text(&out);
        assert!(text.starts_with("[ERROR] Error opening input file: missing.txt:"), "got: {text}");
        assert!(matches!(
            out.stages[0].outcome,
            StageOutcome::Failed(StageError::InputRedirection { .. })
        ));
    }

    #[tokio::test]
    async fn unwritable_output_file_is_stage_local() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_in(dir.path(), "echo hi > no/such/dir/f.txt").await;
        let text = text(&out);
        assert!(text.starts_with("[ERROR] Error opening file: no/such/dir/f.txt:"), "got: {text}");
        assert!(out.saved_to.is_none());
    }

    #[tokio::test]
    async fn stderr_is_merged_into_output() {
        let out = run("ls /rsh/definitely/missing").await;
        assert!(!out.output.is_empty());
        assert!(!out.stages[0].outcome.success());
    }

    #[tokio::test]
    async fn runs_in_given_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_in(dir.path(), "pwd").await;
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(PathBuf::from(text(&out).trim()).canonicalize().unwrap(), expected);
    }

    #[tokio::test]
    async fn output_beyond_cap_is_discarded() {
        let pipeline = parse_segment("seq 1 20000").unwrap().unwrap();
        let options = ExecOptions { max_output_bytes: 1000 };
        let out = execute(&pipeline, &std::env::temp_dir(), &options).await.unwrap();
        assert_eq!(out.output.len(), 1000);
        assert!(out.discarded > 0);
        assert!(out.stages[0].outcome.success());
        let bytes = out.into_bytes();
        assert!(String::from_utf8_lossy(&bytes).contains("[WARN] output truncated:"));
    }
}
