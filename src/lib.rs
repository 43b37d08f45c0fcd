// ABOUTME: Pooled management connections to running processes via privileged helper processes
//
// A caller asks the pool for the management connection of a pid. The first
// request spawns a helper running as the process owner, learns the endpoint
// the helper exposes through a handshake over a Unix socket, and connects;
// every later request shares that connection until the last release.
//
// Key components:
// - pool: pid-keyed, reference-counted facade (acquire / release)
// - connector: resolve owner, spawn helper, handshake, connect
// - helper: helper launching plus attach/detach verbs
// - ipc: pool-side handshake socket server
// - handshake: single-assignment endpoint/failure slot with bounded wait
// - connection: management connection, typed proxies, dialing
// - owner: pid to owning username

//! Pooled, reference-counted management connections to local processes.

pub mod config;
pub mod connection;
pub mod connector;
pub mod endpoint;
pub mod error;
pub mod handshake;
pub mod helper;
pub mod ipc;
pub mod logging;
pub mod owner;
pub mod pool;


// Re-exports for convenient access
pub use config::PoolConfig;
pub use connection::{
    Capabilities, Dialer, ManagementConnection, ManagementInterface, NetDialer, ObjectInfo,
    ObjectName, RemoteObject,
};
pub use endpoint::Endpoint;
pub use error::{ConnectionError, ErrorKind, Misuse, Result};
pub use helper::{CommandLauncher, HelperArgs, HelperExit, HelperLauncher, HelperProcess};
pub use owner::{OwnerError, OwnerResolver, ProcOwnerResolver};
pub use pool::ConnectionPool;
