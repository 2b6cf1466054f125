//! Per-connection outbound queue and the task that drains it to the socket.

use std::time::Duration;

use futures::SinkExt;
use rsh_core::{ConnectionId, Response, ResponseCodec};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// How long a cancelled writer keeps trying to deliver its last frames.
pub const FLUSH_GRACE: Duration = Duration::from_secs(1);

/// Sending side of a connection's response queue. Both the session and the
/// listener hold one; the writer task exits once every clone is gone.
#[derive(Clone, Debug)]
pub struct Outbox {
    connection_id: ConnectionId,
    tx: mpsc::Sender<Response>,
}

/// Listener-side switch that stops a connection's writer.
#[derive(Debug)]
pub struct Closer {
    cancel: CancellationToken,
    last: oneshot::Sender<Response>,
}

/// Everything the writer task consumes.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<Response>,
    cancel: CancellationToken,
    last: oneshot::Receiver<Response>,
}

/// Build the queue for one connection. The writer is cancelled when `halt`
/// fires or the returned [`Closer`] is used.
pub fn channel(connection_id: ConnectionId, capacity: usize, halt: &CancellationToken) -> (Outbox, Closer, Inbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (last_tx, last_rx) = oneshot::channel();
    let cancel = halt.child_token();
    (
        Outbox { connection_id, tx },
        Closer {
            cancel: cancel.clone(),
            last: last_tx,
        },
        Inbox {
            rx,
            cancel,
            last: last_rx,
        },
    )
}

impl Outbox {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Queue a response, waiting for room. Returns false if the writer is gone.
    pub async fn send(&self, response: Response) -> bool {
        self.tx.send(response).await.is_ok()
    }

    /// Like [`Outbox::send`], but gives up after `wait`.
    pub async fn send_within(&self, response: Response, wait: Duration) -> bool {
        match self.tx.send_timeout(response, wait).await {
            Ok(()) => true,
            Err(mpsc::error::SendTimeoutError::Timeout(response)) => {
                warn!(
                    connection_id = %self.connection_id,
                    marker = %response.marker(),
                    "send queue stalled, dropping response"
                );
                false
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => false,
        }
    }

    /// Queue a response without waiting. A full queue drops the response.
    pub fn try_send(&self, response: Response) -> bool {
        match self.tx.try_send(response) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(response)) => {
                warn!(
                    connection_id = %self.connection_id,
                    marker = %response.marker(),
                    len = response.encoded_len(),
                    "send queue full, dropping response"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Closer {
    /// Stop the writer. It drops whatever is still queued and delivers `last`
    /// instead, giving up after [`FLUSH_GRACE`].
    pub fn close_with(self, last: Response) {
        let _ = self.last.send(last);
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
impl Inbox {
    /// Next response the writer would deliver, without a writer.
    pub(crate) fn try_next(&mut self) -> Option<Response> {
        self.last.try_recv().ok().or_else(|| self.rx.try_recv().ok())
    }
}

/// Spawn the writer for one connection on `tracker`.
pub fn spawn_writer<W>(tracker: &TaskTracker, writer: W, inbox: Inbox, connection_id: ConnectionId) -> JoinHandle<()>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    tracker.spawn(write_responses(writer, inbox, connection_id))
}

/// Frame queued responses onto `writer`. Stops after the first terminal
/// marker, then shuts the write half down.
///
/// Once cancelled, the writer either delivers the closer's last response or,
/// on halt, keeps draining the queue until the session's `[HALT]` goes out.
/// Both are bounded by [`FLUSH_GRACE`] so a peer that stopped reading cannot
/// hold shutdown open.
async fn write_responses<W>(writer: W, inbox: Inbox, connection_id: ConnectionId)
where
    W: AsyncWrite + Unpin,
{
    let Inbox {
        mut rx,
        cancel,
        mut last,
    } = inbox;
    let mut sink = FramedWrite::new(writer, ResponseCodec::new());

    let cancelled = tokio::select! {
        biased;
        () = cancel.cancelled() => true,
        () = forward(&mut sink, &mut rx, connection_id) => false,
    };

    if cancelled {
        let flush = async {
            match last.try_recv() {
                Ok(response) => {
                    let marker = response.marker();
                    match sink.send(response).await {
                        Ok(()) => debug!(connection_id = %connection_id, %marker, "terminal marker written"),
                        Err(err) => debug!(connection_id = %connection_id, error = %err, "write failed"),
                    }
                }
                Err(_) => forward(&mut sink, &mut rx, connection_id).await,
            }
        };
        if tokio::time::timeout(FLUSH_GRACE, flush).await.is_err() {
            warn!(connection_id = %connection_id, "peer not reading, abandoning final frames");
        }
    }

    rx.close();
    match tokio::time::timeout(FLUSH_GRACE, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(connection_id = %connection_id, error = %err, "shutdown failed"),
        Err(_) => debug!(connection_id = %connection_id, "shutdown timed out"),
    }
}

/// Write responses until a terminal marker goes out or the queue ends.
async fn forward<W>(sink: &mut FramedWrite<W, ResponseCodec>, rx: &mut mpsc::Receiver<Response>, connection_id: ConnectionId)
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let marker = response.marker();
        if let Err(err) = sink.send(response).await {
            debug!(connection_id = %connection_id, error = %err, "write failed");
            return;
        }
        if marker.is_signal() {
            debug!(connection_id = %connection_id, %marker, "terminal marker written");
            return;
        }
    }
}
