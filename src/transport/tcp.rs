use super::resolver::resolve_host;
use crate::pool::{
    ConnectJob, ConnectJobFactory, ConnectOutcome, GroupId, HostPortPair, JobDelegate, LoadState,
    Priority, SocketParams, StreamSocket, TcpSocket,
};
use crate::utils::error::{PoolError, Result};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace};

/// Socket options for TCP connect jobs.
#[derive(Debug, Clone)]
pub struct TcpConnectOptions {
    pub nodelay: bool,
    pub prefer_ipv6: bool,
    /// Per-job deadline; `None` leaves it to the pool.
    pub timeout: Option<Duration>,
}

impl Default for TcpConnectOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            prefer_ipv6: false,
            timeout: None,
        }
    }
}

/// Creates [`TcpConnectJob`]s. Connects to the proxy when the request names
/// one, otherwise to the group's destination.
#[derive(Debug, Clone, Default)]
pub struct TcpConnectJobFactory {
    options: TcpConnectOptions,
}

impl TcpConnectJobFactory {
    pub fn new(options: TcpConnectOptions) -> Self {
        Self { options }
    }
}

impl ConnectJobFactory for TcpConnectJobFactory {
    fn new_connect_job(
        &self,
        group_id: &GroupId,
        params: &SocketParams,
        priority: Priority,
        delegate: JobDelegate,
    ) -> Box<dyn ConnectJob> {
        let target = params
            .proxy
            .clone()
            .unwrap_or_else(|| group_id.destination.clone());
        trace!(job = %delegate.job_id(), %target, %priority, "new TCP connect job");
        Box::new(TcpConnectJob::new(target, self.options.clone(), delegate))
    }
}

/// Progress shared between the job and its connect task.
#[derive(Debug, Default)]
struct Progress {
    load_state: AtomicU8,
    established: AtomicBool,
}

impl Progress {
    fn set(&self, state: LoadState) {
        self.load_state.store(encode(state), Ordering::Release);
    }

    fn get(&self) -> LoadState {
        decode(self.load_state.load(Ordering::Acquire))
    }
}

fn encode(state: LoadState) -> u8 {
    match state {
        LoadState::Idle => 0,
        LoadState::WaitingForStalledSocketPool => 1,
        LoadState::WaitingForAvailableSocket => 2,
        LoadState::ResolvingHost => 3,
        LoadState::Connecting => 4,
        LoadState::SslHandshake => 5,
        LoadState::EstablishingProxyTunnel => 6,
        LoadState::Connected => 7,
    }
}

fn decode(value: u8) -> LoadState {
    match value {
        1 => LoadState::WaitingForStalledSocketPool,
        2 => LoadState::WaitingForAvailableSocket,
        3 => LoadState::ResolvingHost,
        4 => LoadState::Connecting,
        5 => LoadState::SslHandshake,
        6 => LoadState::EstablishingProxyTunnel,
        7 => LoadState::Connected,
        _ => LoadState::Idle,
    }
}

/// Resolves the target and connects to the first address that answers.
/// The work runs on a spawned task; dropping the job aborts it.
#[derive(Debug)]
pub struct TcpConnectJob {
    target: HostPortPair,
    options: TcpConnectOptions,
    delegate: Option<JobDelegate>,
    progress: Arc<Progress>,
    task: Option<JoinHandle<()>>,
}

impl TcpConnectJob {
    pub fn new(target: HostPortPair, options: TcpConnectOptions, delegate: JobDelegate) -> Self {
        Self {
            target,
            options,
            delegate: Some(delegate),
            progress: Arc::new(Progress::default()),
            task: None,
        }
    }
}

impl ConnectJob for TcpConnectJob {
    fn connect(&mut self) -> ConnectOutcome {
        let Some(delegate) = self.delegate.take() else {
            return ConnectOutcome::Ready(Err(PoolError::connection_failed(
                "connect job started twice",
            )));
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return ConnectOutcome::Ready(Err(PoolError::connection_failed(
                "no tokio runtime to run the connect job on",
            )));
        };

        self.progress.set(LoadState::ResolvingHost);
        let target = self.target.clone();
        let options = self.options.clone();
        let progress = Arc::clone(&self.progress);
        self.task = Some(runtime.spawn(async move {
            let result = connect_to(&target, &options, &progress)
                .await
                .map(|stream| Box::new(TcpSocket::new(stream)) as Box<dyn StreamSocket>);
            delegate.complete(result);
        }));
        ConnectOutcome::Pending
    }

    fn load_state(&self) -> LoadState {
        self.progress.get()
    }

    fn has_established_connection(&self) -> bool {
        self.progress.established.load(Ordering::Acquire)
    }

    fn timeout(&self) -> Option<Duration> {
        self.options.timeout
    }
}

impl Drop for TcpConnectJob {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[instrument(level = "debug", skip(options, progress), fields(target = %target))]
async fn connect_to(
    target: &HostPortPair,
    options: &TcpConnectOptions,
    progress: &Progress,
) -> Result<TcpStream> {
    let addrs = resolve_host(target, options.prefer_ipv6).await?;
    progress.set(LoadState::Connecting);

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if options.nodelay {
                    stream.set_nodelay(true)?;
                }
                progress.established.store(true, Ordering::Release);
                progress.set(LoadState::Connected);
                debug!(%addr, "TCP connection established");
                return Ok(stream);
            }
            Err(e) => {
                debug!(%addr, error = %e, "TCP connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .map(PoolError::from)
        .unwrap_or_else(|| PoolError::connection_failed("no address could be reached")))
}
