//! # rsh-engine
//!
//! Turns a command line into running processes: the tokenizer in
//! [`parser`], the process-graph executor in [`pipeline`], and the
//! per-session [`Shell`] that dispatches builtins and runs segments in order.

pub mod builtins;
pub mod error;
pub mod parser;
pub mod pipeline;
pub mod shell;

pub use error::{ParseError, SpawnError, StageError};
pub use parser::{parse, parse_segment, split_segments, OutputMode, OutputRedirect, Pipeline, Stage};
pub use pipeline::{execute, ExecOptions, PipelineOutput, ProcessGraph, StageOutcome};
pub use shell::{Flow, LineOutcome, SegmentOutcome, Shell};
