//! Destination-scoped client socket pool.
//!
//! Sockets are grouped by [`GroupId`]. Each group queues requests by
//! priority, runs connect jobs on their behalf and keeps returned sockets
//! idle for reuse, within a per-group and a pool-wide socket limit.

pub mod client_pool;
pub mod clock;
pub mod connect_job;
pub mod event;
mod group;
pub mod handle;
#[cfg(feature = "metrics")]
pub mod metrics;
mod request;
pub mod service;
pub mod socket;
pub mod stats;
pub mod types;

pub use client_pool::{
    ClientSocketPool, HigherLayeredPool, PoolSettings, RequestStatus, MIN_TIMER_PERIOD,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use connect_job::{
    AuthCallback, AuthController, AuthRequest, AuthResume, ConnectJob, ConnectJobFactory,
    ConnectOutcome, JobDelegate,
};
pub use event::PoolEvent;
pub use handle::{ClientSocketHandle, InitOptions, PooledSocket};
pub use service::{PoolClient, PoolService};
pub use socket::{StreamSocket, TcpSocket};
pub use stats::{GroupStats, PoolStats};
pub use types::{
    AuthChallenge, CertRequestInfo, ConnectionKind, GroupId, HostPortPair, JobId, LayeredPoolId,
    LoadState, Priority, PrivacyMode, RequestId, RespectLimits, SocketParams, SocketReuseType,
};

// Reasons logged when the pool closes a socket.
pub const CLOSED_BY_CALLER: &str = "closed by caller";
pub const CLOSED_CONNECTION_RETURNED_TO_POOL: &str = "connection closed before return";
pub const DATA_RECEIVED_UNEXPECTEDLY: &str = "data received unexpectedly";
pub const IDLE_TIME_LIMIT_EXPIRED: &str = "idle time limit expired";
pub const NETWORK_CHANGED: &str = "network changed";
pub const REFRESHED_BY_CALLER: &str = "refreshed by caller";
pub const REMOTE_SIDE_CLOSED_CONNECTION: &str = "remote side closed connection";
pub const SOCKET_GENERATION_OUT_OF_DATE: &str = "socket generation out of date";
pub const SOCKET_POOL_DESTROYED: &str = "socket pool destroyed";
pub const SSL_CONFIG_CHANGED: &str = "ssl config changed";
