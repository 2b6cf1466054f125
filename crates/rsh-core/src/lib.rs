//! # rsh-core
//!
//! Types shared by every rsh crate: connection identifiers, the
//! marker-framed wire protocol, control messages and layered settings.

pub mod error;
pub mod ids;
pub mod protocol;
pub mod settings;

pub use error::{CodecError, SettingsError};
pub use ids::{ConnectionId, IdSequence, SessionId};
pub use protocol::{ControlMessage, Frame, Marker, Response, ResponseCodec};
pub use settings::{ClientSettings, Endpoint, ServerSettings, Settings};
