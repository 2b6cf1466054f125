//! Per-connection session: reads lines, runs them, frames the results.
//!
//! ```text
//! AwaitingCommand ──line──▶ Executing ──▶ AwaitingCommand
//!        │                      │
//!        └──── quit / abort / halt / EOF ────▶ Terminating ──▶ Closed
//! ```
//!
//! `stat`, `abort` and `quit` are forwarded to the listener and nothing else
//! happens locally for that line. `quit` and foreign `abort` end the session
//! from the outside by aborting its task.

use std::fmt;

use bytes::BytesMut;
use futures::StreamExt;
use rsh_core::{ConnectionId, ControlMessage, Marker, Response, SessionId};
use rsh_engine::{parse_segment, split_segments, Flow, LineOutcome, Shell};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{Outbox, FLUSH_GRACE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    AwaitingCommand,
    Executing,
    Terminating,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AwaitingCommand => "awaiting_command",
            Self::Executing => "executing",
            Self::Terminating => "terminating",
            Self::Closed => "closed",
        })
    }
}

/// Why a session loop returned on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    PeerClosed,
    ReadFailed,
    /// Service-wide halt, either observed or issued by this session.
    Halted,
    /// Pipe or process creation failed.
    Fatal,
    /// The writer task is gone.
    WriterClosed,
    /// The listener is no longer taking control messages.
    ListenerClosed,
}

/// Inbound line as seen after length and encoding checks.
#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Line(String),
    TooLong,
    NotUtf8,
}

/// `LinesCodec` that reports oversized and non-UTF-8 lines as items, so the
/// stream keeps going after them.
struct InboundCodec {
    lines: LinesCodec,
}

impl InboundCodec {
    fn new(max_line_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_line_bytes),
        }
    }

    fn classify(result: Result<Option<String>, LinesCodecError>) -> Result<Option<Inbound>, LinesCodecError> {
        match result {
            Ok(line) => Ok(line.map(Inbound::Line)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Inbound::TooLong)),
            Err(LinesCodecError::Io(err)) if err.kind() == std::io::ErrorKind::InvalidData => {
                Ok(Some(Inbound::NotUtf8))
            }
            Err(err) => Err(err),
        }
    }
}

impl Decoder for InboundCodec {
    type Item = Inbound;
    type Error = LinesCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, LinesCodecError> {
        Self::classify(self.lines.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, LinesCodecError> {
        Self::classify(self.lines.decode_eof(src))
    }
}

/// What a line asks for.
#[derive(Debug, PartialEq, Eq)]
enum Request {
    Control(ControlMessage),
    Shell,
    Rejected(Response),
}

/// Control verbs are only recognized when they make up the whole line. The
/// verb is the first word as the shell would tokenize it, so `stat>out` and
/// `stat > out` are the same request.
fn classify(line: &str, requester: SessionId) -> Request {
    let mut segments = split_segments(line).into_iter().filter(|s| !s.trim().is_empty());
    let (Some(segment), None) = (segments.next(), segments.next()) else {
        return Request::Shell;
    };
    let Ok(Some(pipeline)) = parse_segment(segment) else {
        return Request::Shell;
    };
    let stage = pipeline.first();
    match stage.program() {
        "stat" => Request::Control(ControlMessage::Stat { requester }),
        "quit" => Request::Control(ControlMessage::Quit { requester }),
        "abort" => match stage.arguments().first().map(|word| word.parse()) {
            Some(Ok(target)) => Request::Control(ControlMessage::Abort { target, requester }),
            _ => Request::Rejected(Response::error("abort: expected a numeric connection id")),
        },
        _ => Request::Shell,
    }
}

pub struct Session {
    connection_id: ConnectionId,
    shell: Shell,
    outbox: Outbox,
    control: mpsc::Sender<ControlMessage>,
    halt: CancellationToken,
    max_line_bytes: usize,
    state: SessionState,
}

impl Session {
    pub fn new(
        connection_id: ConnectionId,
        shell: Shell,
        outbox: Outbox,
        control: mpsc::Sender<ControlMessage>,
        halt: CancellationToken,
        max_line_bytes: usize,
    ) -> Self {
        Self {
            connection_id,
            shell,
            outbox,
            control,
            halt,
            max_line_bytes,
            state: SessionState::AwaitingCommand,
        }
    }

    /// Serve `reader` until the connection ends. Must run in its own task:
    /// the task id is this session's identity in control messages.
    pub async fn run<R>(mut self, reader: R) -> SessionEnd
    where
        R: AsyncRead + Unpin,
    {
        let owner = tokio::task::id();
        debug!(connection_id = %self.connection_id, session_id = %owner, "session started");
        let mut lines = FramedRead::new(reader, InboundCodec::new(self.max_line_bytes));

        let end = loop {
            self.transition(SessionState::AwaitingCommand);
            let next = tokio::select! {
                biased;
                () = self.halt.cancelled() => break self.finish_halted(Vec::new()).await,
                next = lines.next() => next,
            };

            let line = match next {
                Some(Ok(Inbound::Line(line))) => line,
                Some(Ok(Inbound::TooLong)) => {
                    let response = Response::error(format!("line exceeds {} bytes", self.max_line_bytes));
                    if !self.outbox.send(response).await {
                        break SessionEnd::WriterClosed;
                    }
                    continue;
                }
                Some(Ok(Inbound::NotUtf8)) => {
                    if !self.outbox.send(Response::error("line is not valid UTF-8")).await {
                        break SessionEnd::WriterClosed;
                    }
                    continue;
                }
                Some(Err(err)) => {
                    debug!(connection_id = %self.connection_id, error = %err, "read failed");
                    break SessionEnd::ReadFailed;
                }
                None => break SessionEnd::PeerClosed,
            };

            match classify(&line, owner) {
                Request::Control(msg) => {
                    debug!(connection_id = %self.connection_id, verb = msg.verb(), "forwarding to listener");
                    if self.control.send(msg).await.is_err() {
                        break SessionEnd::ListenerClosed;
                    }
                }
                Request::Rejected(response) => {
                    if !self.outbox.send(response).await {
                        break SessionEnd::WriterClosed;
                    }
                }
                Request::Shell => {
                    if let Some(end) = self.execute(&line).await {
                        break end;
                    }
                }
            }
        };

        self.transition(SessionState::Closed);
        info!(connection_id = %self.connection_id, reason = ?end, "session ended");
        end
    }

    /// Run one line. `Some` means the session is over.
    async fn execute(&mut self, line: &str) -> Option<SessionEnd> {
        self.transition(SessionState::Executing);
        let outcome = tokio::select! {
            biased;
            () = self.halt.cancelled() => None,
            outcome = self.shell.execute_line(line) => Some(outcome),
        };
        let Some(outcome) = outcome else {
            warn!(connection_id = %self.connection_id, "halted while executing");
            return Some(self.finish_halted(Vec::new()).await);
        };

        match outcome {
            Ok(LineOutcome {
                output,
                flow: Flow::Continue,
            }) => (!self.outbox.send(Response::completed(output)).await).then_some(SessionEnd::WriterClosed),
            Ok(LineOutcome { output, flow: Flow::Halt }) => {
                info!(connection_id = %self.connection_id, "halt requested");
                let end = self.finish_halted(output).await;
                self.halt.cancel();
                Some(end)
            }
            Err(err) => {
                error!(connection_id = %self.connection_id, error = %err, "pipeline could not be started");
                self.transition(SessionState::Terminating);
                let _ = self
                    .outbox
                    .send(Response::new(format!("[ERROR] {err}\n"), Marker::Quit))
                    .await;
                Some(SessionEnd::Fatal)
            }
        }
    }

    async fn finish_halted(&mut self, output: Vec<u8>) -> SessionEnd {
        self.transition(SessionState::Terminating);
        let _ = self.outbox.send_within(Response::halted(output), FLUSH_GRACE).await;
        SessionEnd::Halted
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(connection_id = %self.connection_id, from = %self.state, to = %next, "session state");
            self.state = next;
        }
    }
}
