//! Well-known object paths and method names

/// Object path of the daemon control interface, on the broker bus and on
/// every peer-to-peer connection.
pub const DAEMON_PATH: &str = "/org/vfs/Daemon";

/// Interface name reported by the daemon control interface.
pub const DAEMON_INTERFACE: &str = "org.vfs.Daemon";

/// Asks the daemon for a private peer-to-peer address. Returns `{ "address": .. }`.
pub const DAEMON_GET_CONNECTION: &str = "GetConnection";

/// Asks the daemon to cancel the call carrying `{ "serial": .. }`.
pub const DAEMON_CANCEL: &str = "Cancel";

/// Connection-level handshake, sent without an object path.
pub const CONNECTION_HELLO: &str = "Hello";
