//! Byte-stream transports: a unix domain socket or TCP.

use std::io;
use std::path::{Path, PathBuf};

use rsh_core::Endpoint;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An accepted connection, split into independently owned halves.
pub struct Accepted {
    pub reader: BoxReader,
    pub writer: BoxWriter,
    pub peer: String,
}

/// A bound listening socket.
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixSocket),
}

/// Unix listener that unlinks its socket file when dropped.
pub struct UnixSocket {
    listener: UnixListener,
    path: PathBuf,
}

impl UnixSocket {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UnixSocket {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to remove socket file");
            }
        }
    }
}

impl Listener {
    /// Bind `endpoint`. A leftover unix socket file at the same path is
    /// removed first.
    pub async fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                Ok(Self::Tcp(listener))
            }
            Endpoint::Unix { path } => {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket"),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err),
                }
                let listener = UnixListener::bind(path)?;
                Ok(Self::Unix(UnixSocket {
                    listener,
                    path: path.clone(),
                }))
            }
        }
    }

    /// The endpoint actually bound. For TCP this carries the real port when
    /// port 0 was requested.
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Self::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(Endpoint::tcp(addr.ip().to_string(), addr.port()))
            }
            Self::Unix(socket) => Ok(Endpoint::unix(socket.path())),
        }
    }

    pub async fn accept(&self) -> io::Result<Accepted> {
        match self {
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                let (reader, writer) = stream.into_split();
                Ok(Accepted {
                    reader: Box::new(reader),
                    writer: Box::new(writer),
                    peer: addr.to_string(),
                })
            }
            Self::Unix(socket) => {
                let (stream, addr) = socket.listener.accept().await?;
                let peer = addr
                    .as_pathname()
                    .map_or_else(|| "local".to_string(), |p| p.display().to_string());
                let (reader, writer) = stream.into_split();
                Ok(Accepted {
                    reader: Box::new(reader),
                    writer: Box::new(writer),
                    peer,
                })
            }
        }
    }
}

/// Open a client connection to `endpoint`.
pub async fn connect(endpoint: &Endpoint) -> io::Result<(BoxReader, BoxWriter)> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        Endpoint::Unix { path } => {
            let stream = UnixStream::connect(path).await?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
    }
}
