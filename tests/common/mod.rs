//! Shared test doubles: in-memory sockets and a scriptable connect job factory.
#![allow(dead_code)]

use connpool::pool::{
    AuthChallenge, AuthController, ClientSocketPool, ConnectJob, ConnectJobFactory,
    ConnectOutcome, ConnectionKind, GroupId, HostPortPair, JobDelegate, LoadState, ManualClock,
    PoolSettings, Priority, SocketParams, StreamSocket,
};
use connpool::PoolError;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;

/// Health flags of a [`MockSocket`], shared with the test.
#[derive(Debug, Clone)]
pub struct SocketState {
    connected: Arc<AtomicBool>,
    idle: Arc<AtomicBool>,
    used: Arc<AtomicBool>,
}

impl SocketState {
    fn new() -> Self {
        Self {
            connected: Arc::new(AtomicBool::new(true)),
            idle: Arc::new(AtomicBool::new(true)),
            used: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Unread bytes arrive on the socket.
    pub fn receive_unexpected_data(&self) {
        self.idle.store(false, Ordering::SeqCst);
    }

    pub fn mark_used(&self) {
        self.used.store(true, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct MockSocket {
    state: SocketState,
}

impl MockSocket {
    pub fn new() -> (Self, SocketState) {
        let state = SocketState::new();
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }
}

impl AsyncRead for MockSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.state.mark_used();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl StreamSocket for MockSocket {
    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    fn is_connected_and_idle(&self) -> bool {
        self.is_connected() && self.state.idle.load(Ordering::SeqCst)
    }

    fn was_ever_used(&self) -> bool {
        self.state.used.load(Ordering::SeqCst)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 80)))
    }

    fn disconnect(&mut self) {
        self.state.disconnect();
    }
}

/// How a mock job behaves when started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    SucceedSync,
    FailSync,
    /// Waits until the test completes it.
    Pending,
    /// Waits, reporting that it is still resolving the host.
    PendingResolving,
    /// Raises an auth challenge as soon as it starts.
    NeedsAuth,
}

#[derive(Debug, Default)]
struct ControlState {
    delegate: Option<JobDelegate>,
    load_state: Option<LoadState>,
    priority: Option<Priority>,
    restarted: Option<oneshot::Receiver<()>>,
}

/// The test's grip on one job created by [`MockConnectJobFactory`].
#[derive(Debug, Clone)]
pub struct JobControl {
    pub kind: JobKind,
    pub group_id: GroupId,
    state: Arc<Mutex<ControlState>>,
    established: Arc<AtomicBool>,
    dropped: Arc<AtomicBool>,
}

impl JobControl {
    /// Finish the job successfully; returns the new socket's flags.
    pub fn succeed(&self) -> Option<SocketState> {
        let delegate = self.state.lock().unwrap().delegate.take()?;
        let (socket, state) = MockSocket::new();
        delegate.complete(Ok(Box::new(socket)));
        Some(state)
    }

    pub fn fail(&self, error: PoolError) -> bool {
        match self.state.lock().unwrap().delegate.take() {
            Some(delegate) => {
                delegate.complete(Err(error));
                true
            }
            None => false,
        }
    }

    /// Raise a (further) auth challenge from a running job.
    pub fn challenge(&self) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        if let Some(delegate) = &state.delegate {
            let restarted = delegate.needs_input(challenge(), Arc::new(RecordingController));
            state.restarted = Some(restarted);
        }
    }

    /// The job was resumed after its auth challenge.
    pub fn was_restarted(&self) -> bool {
        match self.state.lock().unwrap().restarted.as_mut() {
            Some(rx) => rx.try_recv().is_ok(),
            None => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn set_load_state(&self, load_state: LoadState) {
        self.state.lock().unwrap().load_state = Some(load_state);
    }

    pub fn set_established(&self) {
        self.established.store(true, Ordering::SeqCst);
    }

    pub fn priority(&self) -> Option<Priority> {
        self.state.lock().unwrap().priority
    }
}

pub fn challenge() -> AuthChallenge {
    AuthChallenge {
        proxy: HostPortPair::new("proxy.test", 3128),
        scheme: "basic".to_string(),
        realm: Some("test".to_string()),
    }
}

#[derive(Debug)]
pub struct RecordingController;

impl AuthController for RecordingController {
    fn set_credentials(&self, _username: &str, _password: &str) {}
}

#[derive(Debug)]
struct MockConnectJob {
    kind: JobKind,
    control: JobControl,
    timeout: Option<Duration>,
}

impl ConnectJob for MockConnectJob {
    fn connect(&mut self) -> ConnectOutcome {
        match self.kind {
            JobKind::SucceedSync => {
                self.control.state.lock().unwrap().delegate = None;
                let (socket, _) = MockSocket::new();
                ConnectOutcome::Ready(Ok(Box::new(socket)))
            }
            JobKind::FailSync => {
                self.control.state.lock().unwrap().delegate = None;
                ConnectOutcome::Ready(Err(PoolError::connection_failed("refused")))
            }
            JobKind::Pending => ConnectOutcome::Pending,
            JobKind::PendingResolving => {
                self.control.set_load_state(LoadState::ResolvingHost);
                ConnectOutcome::Pending
            }
            JobKind::NeedsAuth => {
                self.control.challenge();
                ConnectOutcome::Pending
            }
        }
    }

    fn load_state(&self) -> LoadState {
        self.control
            .state
            .lock()
            .unwrap()
            .load_state
            .unwrap_or(LoadState::Connecting)
    }

    fn has_established_connection(&self) -> bool {
        self.control.established.load(Ordering::SeqCst)
    }

    fn set_priority(&mut self, priority: Priority) {
        self.control.state.lock().unwrap().priority = Some(priority);
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl Drop for MockConnectJob {
    fn drop(&mut self) {
        self.control.dropped.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct FactoryState {
    default_kind: JobKind,
    queued: VecDeque<JobKind>,
    jobs: Vec<JobControl>,
    timeout: Option<Duration>,
}

/// Connect job factory whose jobs are driven by the test.
#[derive(Debug)]
pub struct MockConnectJobFactory {
    state: Mutex<FactoryState>,
}

impl MockConnectJobFactory {
    pub fn new(default_kind: JobKind) -> Self {
        Self {
            state: Mutex::new(FactoryState {
                default_kind,
                queued: VecDeque::new(),
                jobs: Vec::new(),
                timeout: None,
            }),
        }
    }

    pub fn set_default_kind(&self, kind: JobKind) {
        self.state.lock().unwrap().default_kind = kind;
    }

    /// Kinds for the next jobs, before falling back to the default.
    pub fn queue(&self, kinds: &[JobKind]) {
        self.state.lock().unwrap().queued.extend(kinds.iter().copied());
    }

    pub fn set_job_timeout(&self, timeout: Option<Duration>) {
        self.state.lock().unwrap().timeout = timeout;
    }

    pub fn job_count(&self) -> usize {
        self.state.lock().unwrap().jobs.len()
    }

    pub fn job(&self, index: usize) -> JobControl {
        self.state.lock().unwrap().jobs[index].clone()
    }

    pub fn last_job(&self) -> JobControl {
        self.state
            .lock()
            .unwrap()
            .jobs
            .last()
            .cloned()
            .expect("no job created yet")
    }

    /// Jobs still running (not completed, not cancelled).
    pub fn live_jobs(&self) -> Vec<JobControl> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .iter()
            .filter(|job| !job.is_cancelled() && job.state.lock().unwrap().delegate.is_some())
            .cloned()
            .collect()
    }
}

impl ConnectJobFactory for MockConnectJobFactory {
    fn new_connect_job(
        &self,
        group_id: &GroupId,
        _params: &SocketParams,
        priority: Priority,
        delegate: JobDelegate,
    ) -> Box<dyn ConnectJob> {
        let mut state = self.state.lock().unwrap();
        let kind = state.queued.pop_front().unwrap_or(state.default_kind);
        let control = JobControl {
            kind,
            group_id: group_id.clone(),
            state: Arc::new(Mutex::new(ControlState {
                delegate: Some(delegate),
                load_state: None,
                priority: Some(priority),
                restarted: None,
            })),
            established: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicBool::new(false)),
        };
        state.jobs.push(control.clone());
        Box::new(MockConnectJob {
            kind,
            control,
            timeout: state.timeout,
        })
    }
}

pub fn group(host: &str) -> GroupId {
    GroupId::new(HostPortPair::new(host, 80), ConnectionKind::Http)
}

pub fn secure_group(host: &str) -> GroupId {
    GroupId::new(HostPortPair::new(host, 443), ConnectionKind::Https)
}

pub struct Harness {
    pub pool: ClientSocketPool,
    pub factory: Arc<MockConnectJobFactory>,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new(settings: PoolSettings, default_kind: JobKind) -> Self {
        let factory = Arc::new(MockConnectJobFactory::new(default_kind));
        let clock = ManualClock::new();
        let pool = ClientSocketPool::with_clock(settings, factory.clone(), Arc::new(clock.clone()));
        Self {
            pool,
            factory,
            clock,
        }
    }

    /// Let time pass and fire whatever came due.
    pub fn advance(&mut self, by: Duration) {
        self.clock.advance(by);
        self.pool.run_due_timers();
        self.pool.process_events();
    }
}

pub fn settings(max_sockets: usize, max_sockets_per_group: usize) -> PoolSettings {
    PoolSettings {
        max_sockets,
        max_sockets_per_group,
        backup_jobs_enabled: false,
        ..PoolSettings::default()
    }
}
