use crate::pool::HostPortPair;
use crate::utils::error::{PoolError, Result};
use std::io;
use std::net::{IpAddr, SocketAddr};
use tracing::instrument;

/// Resolve a destination into socket addresses. Literal IPs skip the
/// lookup. With `prefer_ipv6`, IPv6 entries go first while keeping the
/// resolver's order inside each family.
#[instrument(level = "debug", skip(destination), fields(destination = %destination))]
pub async fn resolve_host(
    destination: &HostPortPair,
    prefer_ipv6: bool,
) -> Result<Vec<SocketAddr>> {
    let host = destination.host.trim_start_matches('[').trim_end_matches(']');
    let mut targets: Vec<SocketAddr> = match host.parse::<IpAddr>() {
        Ok(ip) => vec![SocketAddr::new(ip, destination.port)],
        Err(_) => tokio::net::lookup_host((host, destination.port))
            .await
            .map_err(PoolError::from)?
            .collect(),
    };

    if prefer_ipv6 {
        targets.sort_by_key(|addr| match addr.ip() {
            IpAddr::V6(_) => 0,
            IpAddr::V4(_) => 1,
        });
    }

    if targets.is_empty() {
        return Err(PoolError::from(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no addresses found for destination",
        )));
    }

    Ok(targets)
}
