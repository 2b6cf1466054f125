//! Wire protocol: terminal markers, framed responses and control messages.
//!
//! Responses are plain text followed by exactly one marker token. There is no
//! length prefix and no escaping, so a marker token that appears inside real
//! command output is indistinguishable from a genuine marker. This matches the
//! wire format existing clients expect.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;
use crate::ids::{ConnectionId, SessionId};

/// Default upper bound on a single decoded response (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Verbs that need registry-wide knowledge and are serviced by the listener.
pub const CONTROL_VERBS: [&str; 3] = ["stat", "abort", "quit"];

pub fn is_control_verb(word: &str) -> bool {
    CONTROL_VERBS.contains(&word)
}

/// Token terminating a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Marker {
    /// Normal completion.
    End,
    /// Service-wide shutdown in progress.
    Halt,
    /// This session is ending at its own request.
    Quit,
    /// This session was forcibly terminated by another session.
    Abort,
}

impl Marker {
    /// Out-of-band markers. Seeing one anywhere in a chunk ends the exchange.
    pub const SIGNALS: [Marker; 3] = [Marker::Halt, Marker::Quit, Marker::Abort];

    pub const fn token(self) -> &'static str {
        match self {
            Self::End => "[END]",
            Self::Halt => "[HALT]",
            Self::Quit => "[QUIT]",
            Self::Abort => "[ABORT]",
        }
    }

    pub const fn is_signal(self) -> bool {
        !matches!(self, Self::End)
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// A response body plus its single terminal marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    body: Bytes,
    marker: Marker,
}

impl Response {
    pub fn new(body: impl Into<Bytes>, marker: Marker) -> Self {
        Self {
            body: body.into(),
            marker,
        }
    }

    /// Ordinary pipeline result.
    pub fn completed(body: impl Into<Bytes>) -> Self {
        Self::new(body, Marker::End)
    }

    pub fn info(text: impl fmt::Display) -> Self {
        Self::completed(format!("[INFO] {text}\n"))
    }

    pub fn error(text: impl fmt::Display) -> Self {
        Self::completed(format!("[ERROR] {text}\n"))
    }

    pub fn halted(body: impl Into<Bytes>) -> Self {
        Self::new(body, Marker::Halt)
    }

    pub fn closed() -> Self {
        Self::new(Bytes::new(), Marker::Quit)
    }

    pub fn aborted() -> Self {
        Self::new(Bytes::new(), Marker::Abort)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn marker(&self) -> Marker {
        self.marker
    }

    pub fn encoded_len(&self) -> usize {
        self.body.len() + self.marker.token().len()
    }

    /// Wire bytes: body followed by the marker token.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&self.body);
        buf.put_slice(self.marker.token().as_bytes());
        buf.freeze()
    }
}

/// A decoded response as seen by a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub body: Bytes,
    pub marker: Marker,
}

impl Frame {
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Codec for marker-terminated responses.
///
/// Encoding writes `body ++ marker`. Decoding yields one [`Frame`] per marker;
/// when a signal marker is buffered it wins over any earlier `[END]`, whose
/// tokens are then dropped from the body.
#[derive(Clone, Debug)]
pub struct ResponseCodec {
    max_frame_len: usize,
}

impl ResponseCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for ResponseCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Response> for ResponseCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.encoded_len());
        dst.put_slice(item.body());
        dst.put_slice(item.marker().token().as_bytes());
        Ok(())
    }
}

impl Decoder for ResponseCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let signal = Marker::SIGNALS
            .iter()
            .filter_map(|m| find(src, m.token().as_bytes()).map(|pos| (pos, *m)))
            .min_by_key(|(pos, _)| *pos);

        let hit = signal.or_else(|| find(src, Marker::End.token().as_bytes()).map(|pos| (pos, Marker::End)));

        match hit {
            Some((pos, marker)) => {
                let body = src.split_to(pos);
                src.advance(marker.token().len());
                let body = if marker.is_signal() {
                    strip_token(&body, Marker::End.token().as_bytes())
                } else {
                    body.freeze()
                };
                Ok(Some(Frame { body, marker }))
            }
            // Keep enough slack for a marker split across reads.
            None if src.len() > self.max_frame_len + Marker::Abort.token().len() => {
                Err(CodecError::FrameTooLarge {
                    limit: self.max_frame_len,
                })
            }
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => {
                let pending = buf.len();
                buf.clear();
                Err(CodecError::Unterminated { pending })
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn strip_token(body: &[u8], token: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(body.len());
    let mut rest = body;
    while let Some(pos) = find(rest, token) {
        out.put_slice(&rest[..pos]);
        rest = &rest[pos + token.len()..];
    }
    out.put_slice(rest);
    out.freeze()
}

/// Request sent from a session to the listener over the control channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    Abort {
        target: ConnectionId,
        requester: SessionId,
    },
    Stat {
        requester: SessionId,
    },
    Quit {
        requester: SessionId,
    },
}

impl ControlMessage {
    pub fn requester(&self) -> SessionId {
        match self {
            Self::Abort { requester, .. } | Self::Stat { requester } | Self::Quit { requester } => *requester,
        }
    }

    /// Short classification string for logging.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Abort { .. } => "abort",
            Self::Stat { .. } => "stat",
            Self::Quit { .. } => "quit",
        }
    }
}
