use std::io;

use rsh_core::Endpoint;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {endpoint}: {source}")]
    Bind { endpoint: Endpoint, source: io::Error },

    #[error("cannot determine working directory: {0}")]
    WorkingDirectory(#[source] io::Error),

    #[error("listener task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
