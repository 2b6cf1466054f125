use std::path::PathBuf;

/// Errors from the response codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("response exceeds {limit} bytes without a terminal marker")]
    FrameTooLarge { limit: usize },

    #[error("stream ended with {pending} bytes and no terminal marker")]
    Unterminated { pending: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from loading layered settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },
}
