use super::event::{EventSender, PoolEvent};
use super::socket::StreamSocket;
use super::types::{AuthChallenge, GroupId, JobId, LoadState, Priority, SocketParams};
use crate::utils::error::PoolError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Result of starting a connect job.
#[derive(Debug)]
pub enum ConnectOutcome {
    /// The job finished synchronously.
    Ready(Result<Box<dyn StreamSocket>, PoolError>),
    /// The result will be delivered through the job's [`JobDelegate`].
    Pending,
}

/// One connection attempt (TCP, TLS, tunnel, ...).
///
/// A job that returns [`ConnectOutcome::Ready`] from `connect` must not also
/// report through its delegate. Dropping a job cancels the attempt.
pub trait ConnectJob: Send + fmt::Debug {
    fn connect(&mut self) -> ConnectOutcome;

    fn load_state(&self) -> LoadState;

    /// The transport-level connection is up (handshakes may still be running).
    fn has_established_connection(&self) -> bool;

    fn set_priority(&mut self, _priority: Priority) {}

    /// Overrides the pool's default connect timeout. `Some(Duration::ZERO)`
    /// disables the deadline for this job.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Creates connect jobs; swapping the factory swaps the transport.
pub trait ConnectJobFactory: Send + Sync + fmt::Debug {
    fn new_connect_job(
        &self,
        group_id: &GroupId,
        params: &SocketParams,
        priority: Priority,
        delegate: JobDelegate,
    ) -> Box<dyn ConnectJob>;
}

/// Lets the caller answer an authentication challenge.
pub trait AuthController: Send + Sync + fmt::Debug {
    fn set_credentials(&self, username: &str, password: &str);
}

/// Receives auth challenges for a request.
pub type AuthCallback = mpsc::UnboundedSender<AuthRequest>;

/// An auth challenge routed to the request that now owns the job.
#[derive(Debug)]
pub struct AuthRequest {
    pub challenge: AuthChallenge,
    pub controller: Arc<dyn AuthController>,
    pub resume: AuthResume,
}

/// Single-use token that restarts a job suspended on an auth challenge.
pub struct AuthResume {
    restart: oneshot::Sender<()>,
    group_id: GroupId,
    job_id: JobId,
    events: EventSender,
}

impl AuthResume {
    /// Restart the suspended job. Consuming `self` makes a second resume
    /// impossible.
    pub fn resume(self) {
        let _ = self.events.send(PoolEvent::JobResumed {
            group_id: self.group_id,
            job_id: self.job_id,
        });
        let _ = self.restart.send(());
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

impl fmt::Debug for AuthResume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthResume")
            .field("group_id", &self.group_id)
            .field("job_id", &self.job_id)
            .finish()
    }
}

/// A connect job's channel back to the pool.
///
/// Not `Clone`: `complete` takes `self`, so a job reports its result once.
#[derive(Debug)]
pub struct JobDelegate {
    group_id: GroupId,
    job_id: JobId,
    events: EventSender,
}

impl JobDelegate {
    pub(crate) fn new(group_id: GroupId, job_id: JobId, events: EventSender) -> Self {
        Self {
            group_id,
            job_id,
            events,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    /// Report the final result of the attempt.
    pub fn complete(self, result: Result<Box<dyn StreamSocket>, PoolError>) {
        let _ = self.events.send(PoolEvent::JobComplete {
            group_id: self.group_id,
            job_id: self.job_id,
            result,
        });
    }

    /// Suspend on an auth challenge. The returned receiver fires when the
    /// request's owner resumes the job; it errors if the request goes away.
    pub fn needs_input(
        &self,
        challenge: AuthChallenge,
        controller: Arc<dyn AuthController>,
    ) -> oneshot::Receiver<()> {
        let (restart, restarted) = oneshot::channel();
        let resume = AuthResume {
            restart,
            group_id: self.group_id.clone(),
            job_id: self.job_id,
            events: self.events.clone(),
        };
        let _ = self.events.send(PoolEvent::JobNeedsInput {
            group_id: self.group_id.clone(),
            job_id: self.job_id,
            request: AuthRequest {
                challenge,
                controller,
                resume,
            },
        });
        restarted
    }
}
