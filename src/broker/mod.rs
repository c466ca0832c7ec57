//! # Broker Module
//!
//! The server side of the broker process.
//!
//! - `server`: listener sockets, live session bookkeeping and ownership of the
//!   persistence handle for the lifetime of the process.
//! - `session`: the seam to the protocol engine. Every accepted connection is
//!   handed to a [`SessionHandler`] together with the listener's auth manager.

pub mod server;
pub mod session;

pub use self::server::{Server, ServerConfig, ServerError, TransportStatus};
pub use self::session::{RejectSessions, Session, SessionHandler, SessionPolicy, SessionStream};
