//! Connect jobs that build plain TCP connections.

pub mod resolver;
pub mod tcp;

pub use resolver::resolve_host;
pub use tcp::{TcpConnectJob, TcpConnectJobFactory, TcpConnectOptions};
