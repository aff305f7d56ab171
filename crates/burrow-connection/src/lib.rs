//! Agent connection and stream lifecycle management
//!
//! Each authenticated agent socket becomes one [`Connection`] owning a table
//! of multiplexed [`Stream`]s. The [`ConnectionManager`] runs the per-
//! connection frame loop: a reader task decodes frames under a rolling read
//! deadline, the main loop dispatches them, enforces the heartbeat, and
//! tears everything down through a single idempotent close path.

pub mod connection;
pub mod errors;
pub mod manager;
pub mod stream;

pub use connection::Connection;
pub use errors::ConnectionError;
pub use manager::{ConnectionCallback, ConnectionManager, StreamCallback};
pub use stream::{Stream, StreamState};
