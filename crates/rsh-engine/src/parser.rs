//! Command-line tokenizer.
//!
//! A line is split on `;` into segments, a segment on `|` into stages, and a
//! stage on whitespace into arguments. `<`, `>` and `>>` switch into filename
//! capture, which skips spaces and runs until the next `|`, `;`, `<`, `>` or
//! end of line. A backslash makes the next character literal.

use std::iter::Peekable;
use std::str::Chars;

use crate::error::ParseError;

/// How an output redirection opens its file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    Truncate,
    Append,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputRedirect {
    pub path: String,
    pub mode: OutputMode,
}

/// One program invocation inside a pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stage {
    pub args: Vec<String>,
    pub input: Option<String>,
    pub output: Option<OutputRedirect>,
}

impl Stage {
    pub fn program(&self) -> &str {
        // Non-empty by construction in `parse_segment`.
        self.args.first().map_or("", String::as_str)
    }

    pub fn arguments(&self) -> &[String] {
        self.args.get(1..).unwrap_or_default()
    }
}

/// One or more stages connected stdout-to-stdin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

#[allow(clippy::len_without_is_empty)]
impl Pipeline {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn first(&self) -> &Stage {
        &self.stages[0]
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Destination of the first stage that redirects its output.
    pub fn output_destination(&self) -> Option<&OutputRedirect> {
        self.stages.iter().find_map(|s| s.output.as_ref())
    }
}

/// Split a line into `;`-delimited segments. Escaped semicolons stay inside
/// their segment with the escape intact.
pub fn split_segments(line: &str) -> Vec<&str> {
    let line = line.trim_end_matches(['\n', '\r']);
    let mut segments = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (idx, ch) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            ';' => {
                segments.push(&line[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    segments.push(&line[start..]);
    segments
}

/// Parse one segment. `Ok(None)` means the segment was blank.
pub fn parse_segment(segment: &str) -> Result<Option<Pipeline>, ParseError> {
    let mut stages = Vec::new();
    let mut stage = StageBuilder::default();
    let mut chars = segment.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' => stage.word.push(chars.next().unwrap_or('\\')),
            '|' => {
                stage.end_word();
                stages.push(std::mem::take(&mut stage).finish()?);
            }
            '<' => {
                stage.end_word();
                stage.input = Some(read_filename(&mut chars, "<")?);
            }
            '>' => {
                stage.end_word();
                let (mode, op) = if chars.next_if_eq(&'>').is_some() {
                    (OutputMode::Append, ">>")
                } else {
                    (OutputMode::Truncate, ">")
                };
                stage.output = Some(OutputRedirect {
                    path: read_filename(&mut chars, op)?,
                    mode,
                });
            }
            c if c.is_whitespace() => stage.end_word(),
            c => stage.word.push(c),
        }
    }
    stage.end_word();

    if stages.is_empty() && stage.is_blank() {
        return Ok(None);
    }
    stages.push(stage.finish()?);
    Ok(Some(Pipeline { stages }))
}

/// Parse a whole line eagerly. Blank segments are skipped.
pub fn parse(line: &str) -> Result<Vec<Pipeline>, ParseError> {
    let mut pipelines = Vec::new();
    for segment in split_segments(line) {
        if let Some(pipeline) = parse_segment(segment)? {
            pipelines.push(pipeline);
        }
    }
    Ok(pipelines)
}

fn read_filename(chars: &mut Peekable<Chars<'_>>, op: &'static str) -> Result<String, ParseError> {
    let mut name = String::new();
    while let Some(&ch) = chars.peek() {
        match ch {
            '|' | '<' | '>' | ';' => break,
            '\\' => {
                let _ = chars.next();
                name.push(chars.next().unwrap_or('\\'));
            }
            c if c.is_whitespace() => {
                let _ = chars.next();
            }
            c => {
                let _ = chars.next();
                name.push(c);
            }
        }
    }
    if name.is_empty() {
        return Err(ParseError::MissingFilename(op));
    }
    Ok(name)
}

#[derive(Default)]
struct StageBuilder {
    args: Vec<String>,
    word: String,
    input: Option<String>,
    output: Option<OutputRedirect>,
}

impl StageBuilder {
    fn end_word(&mut self) {
        if !self.word.is_empty() {
            self.args.push(std::mem::take(&mut self.word));
        }
    }

    fn is_blank(&self) -> bool {
        self.args.is_empty() && self.input.is_none() && self.output.is_none()
    }

    fn finish(self) -> Result<Stage, ParseError> {
        if self.args.is_empty() {
            return Err(if self.is_blank() {
                ParseError::EmptyCommand
            } else {
                ParseError::MissingCommand
            });
        }
        Ok(Stage {
            args: self.args,
            input: self.input,
            output: self.output,
        })
    }
}
