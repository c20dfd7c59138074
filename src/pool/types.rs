use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Request priority, least urgent first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Throttled,
    Idle,
    #[default]
    Lowest,
    Low,
    Medium,
    Highest,
}

impl Priority {
    pub const MAXIMUM: Priority = Priority::Highest;
    pub const MINIMUM: Priority = Priority::Throttled;
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Throttled => "THROTTLED",
            Priority::Idle => "IDLE",
            Priority::Lowest => "LOWEST",
            Priority::Low => "LOW",
            Priority::Medium => "MEDIUM",
            Priority::Highest => "HIGHEST",
        };
        f.write_str(name)
    }
}

/// Whether a request is subject to the global and per-group socket limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespectLimits {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostPortPair {
    pub host: String,
    pub port: u16,
}

impl HostPortPair {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, accepting bracketed IPv6 literals.
    pub fn parse(input: &str) -> Option<Self> {
        let (host, port) = input.rsplit_once(':')?;
        let port = port.parse().ok()?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port))
    }
}

impl fmt::Display for HostPortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Http,
    Https,
    WebSocket,
    Ftp,
}

impl ConnectionKind {
    pub fn is_secure(self) -> bool {
        matches!(self, ConnectionKind::Https)
    }

    fn scheme(self) -> &'static str {
        match self {
            ConnectionKind::Http => "http",
            ConnectionKind::Https => "https",
            ConnectionKind::WebSocket => "ws",
            ConnectionKind::Ftp => "ftp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PrivacyMode {
    #[default]
    Disabled,
    Enabled,
}

/// Identity of a connection group (the destination key).
///
/// Ordering is significant: groups are walked in key order when the pool
/// looks for an idle socket to evict or a stalled group to serve.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId {
    pub destination: HostPortPair,
    pub kind: ConnectionKind,
    pub privacy_mode: PrivacyMode,
    /// Network isolation partition, if any.
    pub partition: Option<String>,
    pub disable_secure_dns: bool,
}

impl GroupId {
    pub fn new(destination: HostPortPair, kind: ConnectionKind) -> Self {
        Self {
            destination,
            kind,
            privacy_mode: PrivacyMode::Disabled,
            partition: None,
            disable_secure_dns: false,
        }
    }

    pub fn with_privacy_mode(mut self, privacy_mode: PrivacyMode) -> Self {
        self.privacy_mode = privacy_mode;
        self
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn with_secure_dns_disabled(mut self) -> Self {
        self.disable_secure_dns = true;
        self
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.privacy_mode == PrivacyMode::Enabled {
            f.write_str("pm/")?;
        }
        if self.disable_secure_dns {
            f.write_str("dsd/")?;
        }
        write!(f, "{}://{}", self.kind.scheme(), self.destination)?;
        if let Some(partition) = &self.partition {
            write!(f, " <{}>", partition)?;
        }
        Ok(())
    }
}

/// Per-request parameters handed through to the connect job factory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketParams {
    /// Proxy to tunnel through, if any.
    pub proxy: Option<HostPortPair>,
}

/// Coarse progress of a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Idle,
    WaitingForStalledSocketPool,
    WaitingForAvailableSocket,
    ResolvingHost,
    Connecting,
    SslHandshake,
    EstablishingProxyTunnel,
    Connected,
}

/// How a handed-out socket was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketReuseType {
    /// Fresh from a connect job.
    Unused,
    /// Never carried traffic, but sat in the idle list (e.g. preconnected).
    UnusedIdle,
    /// Carried traffic before and was returned to the pool.
    ReusedIdle,
}

/// Information attached to a certificate error so the caller can pick a
/// client certificate and retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertRequestInfo {
    pub host_port: String,
    pub cert_authorities: Vec<String>,
}

/// Describes a proxy authentication challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub proxy: HostPortPair,
    pub scheme: String,
    pub realm: Option<String>,
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            pub(crate) fn next() -> Self {
                static NEXT: AtomicU64 = AtomicU64::new(1);
                Self(NEXT.fetch_add(1, Ordering::Relaxed))
            }

            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Identifies a request queued in a group.
    RequestId,
    "request"
);
id_type!(
    /// Identifies a connect job owned by a group.
    JobId,
    "job"
);
id_type!(
    /// Identifies a registered higher-layer pool.
    LayeredPoolId,
    "layered-pool"
);
