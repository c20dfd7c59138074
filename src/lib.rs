// connpool - Destination-scoped client connection pool

pub mod config;
pub mod pool;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use pool::{
    ClientSocketHandle, ClientSocketPool, GroupId, PoolClient, PoolService, PoolSettings,
    PooledSocket, Priority,
};
pub use utils::error::{PoolError, Result};
