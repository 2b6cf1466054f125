//! Layered settings.
//!
//! Settings are resolved from three layers, lowest priority first:
//! 1. compiled defaults ([`Settings::default`]),
//! 2. a JSON file (`~/.rsh/settings.json` unless a path is given), deep-merged
//!    over the defaults,
//! 3. `RSH_*` environment variables.
//!
//! Command-line flags are applied on top by the binary.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SettingsError;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/myshell_socket";
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Where the server listens and the client connects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Endpoint {
    Unix { path: PathBuf },
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::unix(DEFAULT_SOCKET_PATH)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path } => write!(f, "unix:{}", path.display()),
            Self::Tcp { host, port } => write!(f, "tcp:{host}:{port}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    pub endpoint: Endpoint,
    /// Longest accepted command line, newline excluded.
    pub max_line_bytes: usize,
    /// Cap on captured pipeline output kept per segment.
    pub max_output_bytes: usize,
    /// Capacity of the session → listener control channel.
    pub control_queue: usize,
    /// Capacity of each connection's outbound response queue.
    pub send_queue: usize,
    /// Initial working directory of every session. Defaults to the server's.
    pub working_directory: Option<PathBuf>,
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            max_line_bytes: 64 * 1024,
            max_output_bytes: 8 * 1024 * 1024,
            control_queue: 64,
            send_queue: 32,
            working_directory: None,
            log_level: "info".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientSettings {
    pub endpoint: Endpoint,
    pub max_frame_bytes: usize,
    pub log_level: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            max_frame_bytes: crate::protocol::DEFAULT_MAX_FRAME_LEN,
            log_level: "warn".into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub client: ClientSettings,
}

/// Default settings file location: `~/.rsh/settings.json`.
pub fn settings_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".rsh")
        .join("settings.json")
}

/// Load settings from the default location. A missing file means defaults.
pub fn load_settings() -> Result<Settings, SettingsError> {
    let path = settings_path();
    let mut settings = if path.exists() {
        read_file(&path)?
    } else {
        Settings::default()
    };
    apply_env_overrides(&mut settings, |var| std::env::var(var).ok())?;
    Ok(settings)
}

/// Load settings from an explicit file. The file must exist.
pub fn load_settings_from_path(path: &Path) -> Result<Settings, SettingsError> {
    let mut settings = read_file(path)?;
    apply_env_overrides(&mut settings, |var| std::env::var(var).ok())?;
    Ok(settings)
}

fn read_file(path: &Path) -> Result<Settings, SettingsError> {
    let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_owned(),
        source,
    })?;
    let overlay: Value = serde_json::from_str(&raw)?;
    let mut merged = serde_json::to_value(Settings::default())?;
    deep_merge(&mut merged, overlay);
    let settings = serde_json::from_value(merged)?;
    tracing::debug!(path = %path.display(), "settings file loaded");
    Ok(settings)
}

/// Recursively merge `overlay` into `base`. Objects merge key by key; any
/// other value in the overlay replaces the base value.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        let _ = base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Apply `RSH_*` overrides using `lookup` to read variables.
///
/// `RSH_PORT` selects TCP (with `RSH_HOST`, default `127.0.0.1`) and takes
/// precedence over `RSH_SOCKET`.
pub fn apply_env_overrides(
    settings: &mut Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), SettingsError> {
    if let Some(path) = lookup("RSH_SOCKET") {
        let endpoint = Endpoint::unix(path);
        settings.server.endpoint = endpoint.clone();
        settings.client.endpoint = endpoint;
    }

    if let Some(port) = lookup("RSH_PORT") {
        let port = parse_var("RSH_PORT", &port)?;
        let host = lookup("RSH_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let endpoint = Endpoint::tcp(host, port);
        settings.server.endpoint = endpoint.clone();
        settings.client.endpoint = endpoint;
    }

    if let Some(value) = lookup("RSH_MAX_LINE_BYTES") {
        settings.server.max_line_bytes = parse_var("RSH_MAX_LINE_BYTES", &value)?;
    }
    if let Some(value) = lookup("RSH_MAX_OUTPUT_BYTES") {
        settings.server.max_output_bytes = parse_var("RSH_MAX_OUTPUT_BYTES", &value)?;
    }
    if let Some(level) = lookup("RSH_LOG") {
        settings.server.log_level.clone_from(&level);
        settings.client.log_level = level;
    }
    Ok(())
}

fn parse_var<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, SettingsError> {
    value.trim().parse().map_err(|_| SettingsError::Env {
        var,
        value: value.to_string(),
    })
}
