//! # rsh-server
//!
//! The networked side of rsh: a listener task that owns the connection
//! registry, one session task per connection, and one writer task per
//! connection that frames responses onto the socket.

pub mod connection;
pub mod error;
pub mod listener;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use error::ServerError;
pub use server::{start, ServerHandle};
pub use transport::{connect, BoxReader, BoxWriter};
