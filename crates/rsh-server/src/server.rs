use rsh_core::{Endpoint, ServerSettings};
use rsh_engine::ExecOptions;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ServerError;
use crate::listener::{EventLoop, SessionConfig};
use crate::transport::Listener;

/// Bind the configured endpoint and start the listener loop.
///
/// Cancelling `halt` (or a session running `halt`) shuts the service down.
pub async fn start(settings: &ServerSettings, halt: CancellationToken) -> Result<ServerHandle, ServerError> {
    let working_directory = match &settings.working_directory {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().map_err(ServerError::WorkingDirectory)?,
    };

    let listener = Listener::bind(&settings.endpoint)
        .await
        .map_err(|source| ServerError::Bind {
            endpoint: settings.endpoint.clone(),
            source,
        })?;
    let endpoint = listener
        .local_endpoint()
        .map_err(|source| ServerError::Bind {
            endpoint: settings.endpoint.clone(),
            source,
        })?;

    tracing::info!(
        endpoint = %endpoint,
        cwd = %working_directory.display(),
        max_line_bytes = settings.max_line_bytes,
        "rsh server listening"
    );

    let config = SessionConfig {
        working_directory,
        exec: ExecOptions {
            max_output_bytes: settings.max_output_bytes,
        },
        max_line_bytes: settings.max_line_bytes,
        send_queue: settings.send_queue,
    };
    let event_loop = EventLoop::new(listener, config, settings.control_queue, halt.clone());
    let task = tokio::spawn(event_loop.run());

    Ok(ServerHandle { endpoint, halt, task })
}

/// Handle returned by [`start`].
pub struct ServerHandle {
    endpoint: Endpoint,
    halt: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// The bound endpoint, with the real port if port 0 was requested.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Broadcast halt to every session.
    pub fn shutdown(&self) {
        self.halt.cancel();
    }

    /// Wait until the listener has stopped and every session has closed.
    pub async fn wait(self) -> Result<(), ServerError> {
        self.task.await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use rsh_core::{Frame, Marker, ResponseCodec};
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::FramedRead;

    use crate::transport::{connect, BoxReader, BoxWriter};

    struct TestClient {
        frames: FramedRead<BoxReader, ResponseCodec>,
        writer: BoxWriter,
    }

    impl TestClient {
        async fn connect(endpoint: &Endpoint) -> Self {
            let (reader, writer) = connect(endpoint).await.unwrap();
            Self {
                frames: FramedRead::new(reader, ResponseCodec::new()),
                writer,
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer.write_all(format!("{line}\n").as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Frame {
            self.frames.next().await.unwrap().unwrap()
        }

        async fn call(&mut self, line: &str) -> Frame {
            self.send(line).await;
            self.recv().await
        }

        async fn at_eof(&mut self) -> bool {
            self.frames.next().await.is_none()
        }
    }

    async fn start_tcp(dir: &std::path::Path) -> ServerHandle {
        let settings = ServerSettings {
            endpoint: Endpoint::tcp("127.0.0.1", 0),
            working_directory: Some(dir.to_path_buf()),
            ..ServerSettings::default()
        };
        start(&settings, CancellationToken::new()).await.unwrap()
    }

    #[tokio::test]
    async fn runs_pipelines_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_tcp(dir.path()).await;
        let mut client = TestClient::connect(server.endpoint()).await;

        let frame = client.call("echo hello | tr a-z A-Z").await;
        assert_eq!(frame.text(), "HELLO\n");
        assert_eq!(frame.marker, Marker::End);

        let frame = client.call("echo hi > f.txt ; cat < f.txt").await;
        assert_eq!(frame.text(), "[INFO] Output saved to file: f.txt\nhi\n");

        server.shutdown();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn stat_lists_connections_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_tcp(dir.path()).await;
        let mut a = TestClient::connect(server.endpoint()).await;
        a.call("echo a").await;
        let mut b = TestClient::connect(server.endpoint()).await;
        b.call("echo b").await;

        let first = a.call("stat").await;
        let second = a.call("stat").await;
        assert_eq!(first, second);
        assert_eq!(first.marker, Marker::End);
        let text = first.text();
        assert!(text.starts_with("[INFO] Active connections: 2\n"), "got: {text}");
        assert!(text.contains("  1\tsession "));
        assert!(text.contains("  2\tsession "));

        server.shutdown();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn abort_disconnects_target_and_confirms() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_tcp(dir.path()).await;
        let mut a = TestClient::connect(server.endpoint()).await;
        a.call("echo a").await;
        let mut b = TestClient::connect(server.endpoint()).await;
        b.call("echo b").await;

        let confirmation = b.call("abort 1").await;
        assert_eq!(confirmation.text(), "[INFO] Connection 1 aborted\n");
        assert_eq!(confirmation.marker, Marker::End);

        let aborted = a.recv().await;
        assert_eq!(aborted.marker, Marker::Abort);
        assert!(a.at_eof().await);

        let listing = b.call("stat").await;
        assert!(listing.text().starts_with("[INFO] Active connections: 1\n"));

        let miss = b.call("abort 1").await;
        assert_eq!(miss.text(), "[INFO] abort: no connection with id 1\n");

        server.shutdown();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn quit_closes_only_the_requester() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_tcp(dir.path()).await;
        let mut a = TestClient::connect(server.endpoint()).await;
        a.call("echo a").await;

        let frame = a.call("quit").await;
        assert_eq!(frame.marker, Marker::Quit);
        assert!(frame.body.is_empty());
        assert!(a.at_eof().await);

        let mut b = TestClient::connect(server.endpoint()).await;
        assert_eq!(b.call("echo still here").await.text(), "still here\n");

        server.shutdown();
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn halt_reaches_every_connection() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_tcp(dir.path()).await;
        let mut a = TestClient::connect(server.endpoint()).await;
        a.call("echo a").await;
        let mut b = TestClient::connect(server.endpoint()).await;
        b.call("echo b").await;

        let frame = a.call("halt").await;
        assert_eq!(frame.marker, Marker::Halt);
        assert_eq!(b.recv().await.marker, Marker::Halt);

        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn halt_completes_while_a_client_stops_reading() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_tcp(dir.path()).await;
        let mut stalled = TestClient::connect(server.endpoint()).await;
        stalled.call("echo ready").await;
        let mut b = TestClient::connect(server.endpoint()).await;
        b.call("echo b").await;

        stalled.send("seq 1 2000000").await;
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;

        server.shutdown();
        assert_eq!(b.recv().await.marker, Marker::Halt);
        tokio::time::timeout(std::time::Duration::from_secs(10), server.wait())
            .await
            .expect("server did not stop after halt")
            .unwrap();
    }

    #[tokio::test]
    async fn abort_releases_a_client_that_stopped_reading() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_tcp(dir.path()).await;
        let mut stalled = TestClient::connect(server.endpoint()).await;
        stalled.call("echo ready").await;
        let mut b = TestClient::connect(server.endpoint()).await;
        b.call("echo b").await;

        stalled.send("seq 1 2000000").await;
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        let confirmation = b.call("abort 1").await;
        assert_eq!(confirmation.text(), "[INFO] Connection 1 aborted\n");
        let listing = b.call("stat").await;
        assert!(listing.text().starts_with("[INFO] Active connections: 1\n"));

        server.shutdown();
        assert_eq!(b.recv().await.marker, Marker::Halt);
        tokio::time::timeout(std::time::Duration::from_secs(5), server.wait())
            .await
            .expect("aborted writer kept the server alive")
            .unwrap();
        drop(stalled);
    }

    #[tokio::test]
    async fn serves_unix_socket_and_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rsh.sock");
        let settings = ServerSettings {
            endpoint: Endpoint::unix(&path),
            working_directory: Some(dir.path().to_path_buf()),
            ..ServerSettings::default()
        };
        let server = start(&settings, CancellationToken::new()).await.unwrap();
        assert!(path.exists());

        let mut client = TestClient::connect(server.endpoint()).await;
        assert_eq!(client.call("pwd").await.text().trim(), dir.path().canonicalize().unwrap().to_str().unwrap());

        server.shutdown();
        assert_eq!(client.recv().await.marker, Marker::Halt);
        server.wait().await.unwrap();
        assert!(!path.exists());
    }
}
