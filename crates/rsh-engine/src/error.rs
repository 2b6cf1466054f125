use std::io;

use rustix::io::Errno;

/// Malformed command line. Nothing from the offending segment runs.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("missing filename after '{0}'")]
    MissingFilename(&'static str),

    #[error("empty command in pipeline")]
    EmptyCommand,

    #[error("redirection without a command")]
    MissingCommand,
}

/// Pipe or process creation failed for lack of resources. Fatal to the
/// session that owns the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to create pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error("failed to duplicate descriptor: {0}")]
    Descriptor(#[source] io::Error),

    #[error("failed to spawn {program}: {source}")]
    Process { program: String, source: io::Error },

    #[error("failed to read pipeline output: {0}")]
    Drain(#[source] io::Error),
}

/// Failure confined to a single stage. Siblings keep running; the
/// diagnostic travels through the stage's own output.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("Execution error: {program}: {source}")]
    Exec { program: String, source: io::Error },

    #[error("Error opening input file: {path}: {source}")]
    InputRedirection { path: String, source: io::Error },

    #[error("Error opening file: {path}: {source}")]
    OutputRedirection { path: String, source: io::Error },
}

impl StageError {
    /// Line written into the stage's output stream.
    pub fn diagnostic(&self) -> String {
        format!("[ERROR] {self}\n")
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Exec { .. } => "exec",
            Self::InputRedirection { .. } => "input_redirection",
            Self::OutputRedirection { .. } => "output_redirection",
        }
    }
}

/// Whether an OS error means the process table or descriptor table is full,
/// or memory ran out, rather than something wrong with one command.
pub fn is_resource_exhaustion(err: &io::Error) -> bool {
    if matches!(err.kind(), io::ErrorKind::OutOfMemory | io::ErrorKind::WouldBlock) {
        return true;
    }
    Errno::from_io_error(err)
        .is_some_and(|errno| [Errno::MFILE, Errno::NFILE, Errno::AGAIN, Errno::NOMEM].contains(&errno))
}
