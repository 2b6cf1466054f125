//! The listener event loop.
//!
//! Owns the registry. Waits on three things: the halt token, the accepting
//! socket and the control channel fed by every session.

use std::path::PathBuf;
use std::time::Duration;

use rsh_core::ControlMessage;
use rsh_engine::{ExecOptions, Shell};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::connection;
use crate::registry::{ConnectionEntry, Registry};
use crate::session::Session;
use crate::transport::{Accepted, Listener};

/// Pause after a failed accept, so descriptor exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Per-connection parameters handed to every new session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub working_directory: PathBuf,
    pub exec: ExecOptions,
    pub max_line_bytes: usize,
    pub send_queue: usize,
}

pub struct EventLoop {
    listener: Listener,
    registry: Registry,
    control_tx: mpsc::Sender<ControlMessage>,
    control_rx: mpsc::Receiver<ControlMessage>,
    tracker: TaskTracker,
    halt: CancellationToken,
    config: SessionConfig,
}

impl EventLoop {
    pub fn new(listener: Listener, config: SessionConfig, control_queue: usize, halt: CancellationToken) -> Self {
        let (control_tx, control_rx) = mpsc::channel(control_queue.max(1));
        Self {
            listener,
            registry: Registry::new(),
            control_tx,
            control_rx,
            tracker: TaskTracker::new(),
            halt,
            config,
        }
    }

    /// Serve until halted, then wait for every session and writer to finish.
    /// Writers observe the same halt, so a stalled peer delays this by at most
    /// the writer's flush grace.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                () = self.halt.cancelled() => break,
                Some(msg) = self.control_rx.recv() => {
                    self.registry.reap_finished();
                    self.registry.dispatch(msg);
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => {
                        self.registry.reap_finished();
                        self.admit(conn);
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        let Self {
            listener,
            registry,
            control_rx,
            tracker,
            ..
        } = self;
        info!(connections = registry.len(), "halt received, shutting down");
        drop(listener);
        drop(control_rx);
        drop(registry);
        tracker.close();
        tracker.wait().await;
        info!("all sessions closed");
    }

    fn admit(&mut self, conn: Accepted) {
        let id = self.registry.allocate_id();
        let (outbox, closer, inbox) = connection::channel(id, self.config.send_queue, &self.halt);
        connection::spawn_writer(&self.tracker, conn.writer, inbox, id);

        let shell = Shell::new(self.config.working_directory.clone(), self.config.exec.clone());
        let session = Session::new(
            id,
            shell,
            outbox.clone(),
            self.control_tx.clone(),
            self.halt.clone(),
            self.config.max_line_bytes,
        );
        let handle = self.tracker.spawn(session.run(conn.reader));

        self.registry.register(ConnectionEntry::new(
            id,
            handle.id(),
            conn.peer,
            outbox,
            closer,
            handle.abort_handle(),
        ));
    }
}
