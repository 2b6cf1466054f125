//! Connection registry, owned and mutated only by the listener task.

use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat, Utc};
use rsh_core::{ConnectionId, ControlMessage, IdSequence, Response, SessionId};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::connection::{Closer, Outbox};

/// One live connection.
#[derive(Debug)]
pub struct ConnectionEntry {
    pub id: ConnectionId,
    pub owner: SessionId,
    pub peer: String,
    pub connected_at: DateTime<Utc>,
    pub outbox: Outbox,
    closer: Closer,
    session: AbortHandle,
}

impl ConnectionEntry {
    pub fn new(
        id: ConnectionId,
        owner: SessionId,
        peer: String,
        outbox: Outbox,
        closer: Closer,
        session: AbortHandle,
    ) -> Self {
        Self {
            id,
            owner,
            peer,
            connected_at: Utc::now(),
            outbox,
            closer,
            session,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.session.is_finished()
    }

    /// Forcibly stop the session task and have the writer send `last` before
    /// closing the socket. Processes the session spawned keep running.
    fn terminate(self, last: Response) {
        self.session.abort();
        self.closer.close_with(last);
    }
}

/// Insertion-ordered set of connections. Lookups are linear scans.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<ConnectionEntry>,
    ids: IdSequence,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_id(&mut self) -> ConnectionId {
        self.ids.next_connection()
    }

    pub fn register(&mut self, entry: ConnectionEntry) {
        info!(
            connection_id = %entry.id,
            session_id = %entry.owner,
            peer = %entry.peer,
            "connection registered"
        );
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn by_owner(&self, owner: SessionId) -> Option<&ConnectionEntry> {
        self.entries.iter().find(|e| e.owner == owner)
    }

    pub fn by_id(&self, id: ConnectionId) -> Option<&ConnectionEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<ConnectionEntry> {
        let idx = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(idx))
    }

    /// Drop entries whose session task has already ended.
    pub fn reap_finished(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| {
            let finished = entry.is_finished();
            if finished {
                debug!(connection_id = %entry.id, "reaped finished connection");
            }
            !finished
        });
        before - self.entries.len()
    }

    /// Human-readable listing for `stat`.
    pub fn render(&self) -> String {
        let mut out = format!("[INFO] Active connections: {}\n", self.entries.len());
        for entry in &self.entries {
            let _ = writeln!(
                out,
                "  {}\tsession {}\t{}\tconnected {}",
                entry.id,
                entry.owner,
                entry.peer,
                entry.connected_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
        }
        out
    }

    /// Service one control message from a session.
    pub fn dispatch(&mut self, msg: ControlMessage) {
        debug!(verb = msg.verb(), session_id = %msg.requester(), "control message");
        match msg {
            ControlMessage::Stat { requester } => {
                let listing = self.render();
                self.reply(requester, Response::completed(listing));
            }
            ControlMessage::Abort { target, requester } => self.abort(target, requester),
            ControlMessage::Quit { requester } => {
                let Some(id) = self.by_owner(requester).map(|e| e.id) else {
                    warn!(session_id = %requester, "quit from unregistered session");
                    return;
                };
                if let Some(entry) = self.remove(id) {
                    entry.terminate(Response::closed());
                    info!(connection_id = %id, "connection closed by quit");
                }
            }
        }
    }

    fn abort(&mut self, target: ConnectionId, requester: SessionId) {
        let Some(entry) = self.by_id(target) else {
            self.reply(requester, Response::info(format!("abort: no connection with id {target}")));
            return;
        };

        if entry.owner == requester {
            let _ = entry.outbox.try_send(Response::aborted());
            info!(connection_id = %target, "connection aborted itself");
            return;
        }

        self.reply(requester, Response::info(format!("Connection {target} aborted")));
        if let Some(entry) = self.remove(target) {
            entry.terminate(Response::aborted());
            info!(connection_id = %target, requester = %requester, "connection aborted");
        }
    }

    fn reply(&self, requester: SessionId, response: Response) {
        match self.by_owner(requester) {
            Some(entry) => {
                let _ = entry.outbox.try_send(response);
            }
            None => debug!(session_id = %requester, "requester no longer registered"),
        }
    }
}
