//! Network layer: managed per-device connections.

mod connection;

pub use connection::{Connection, ConnectionInfo, ConnectionSender};
