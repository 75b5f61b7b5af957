//! SSH transport: credentials, the connection pool and ssh client invocation

pub mod credentials;
pub mod pool;
pub mod transport;

pub use credentials::{Credentials, fingerprint};
pub use pool::{
    ConnectionKey, ConnectionLease, ConnectionPool, ConnectionSnapshot, ConnectionState,
    PoolStats, PooledConnection,
};
pub use transport::{MasterConnection, SshSession, SshTransport};
