use super::client_pool::{ClientSocketPool, RequestStatus};
use super::connect_job::AuthCallback;
use super::event::{EventSender, PoolEvent};
use super::request::Completion;
use super::socket::StreamSocket;
use super::types::{
    GroupId, LoadState, Priority, RequestId, RespectLimits, SocketParams, SocketReuseType,
};
use crate::utils::error::PoolError;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use tokio::sync::oneshot::{self, error::TryRecvError};

/// A socket on loan from the pool.
///
/// Dropping it returns the socket to its group; the pool then decides
/// whether it is healthy enough to keep idle.
#[derive(Debug)]
pub struct PooledSocket {
    socket: Option<Box<dyn StreamSocket>>,
    group_id: GroupId,
    generation: u64,
    reuse_type: SocketReuseType,
    idle_time: Duration,
    events: EventSender,
}

impl PooledSocket {
    pub(crate) fn new(
        socket: Box<dyn StreamSocket>,
        group_id: GroupId,
        generation: u64,
        reuse_type: SocketReuseType,
        idle_time: Duration,
        events: EventSender,
    ) -> Self {
        Self {
            socket: Some(socket),
            group_id,
            generation,
            reuse_type,
            idle_time,
            events,
        }
    }

    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn reuse_type(&self) -> SocketReuseType {
        self.reuse_type
    }

    /// How long the socket sat idle before this hand-out.
    pub fn idle_time(&self) -> Duration {
        self.idle_time
    }

    pub fn get(&self) -> Option<&dyn StreamSocket> {
        self.socket.as_deref()
    }

    pub fn get_mut(&mut self) -> Option<&mut (dyn StreamSocket + 'static)> {
        self.socket.as_deref_mut()
    }

    /// Close the underlying connection; the pool discards it on return.
    pub fn disconnect(&mut self) {
        if let Some(socket) = self.socket.as_mut() {
            socket.disconnect();
        }
    }

    /// Take the socket out so the pool can account for it directly instead
    /// of through an event.
    pub(crate) fn into_parts(mut self) -> Option<(GroupId, Box<dyn StreamSocket>, u64)> {
        let socket = self.socket.take()?;
        Some((self.group_id.clone(), socket, self.generation))
    }
}

impl Drop for PooledSocket {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            // The pool may already be gone; the socket then just closes.
            let _ = self.events.send(PoolEvent::SocketReleased {
                group_id: self.group_id.clone(),
                socket,
                generation: self.generation,
            });
        }
    }
}

/// Options for [`ClientSocketHandle::init_with`].
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub params: SocketParams,
    pub respect_limits: Option<RespectLimits>,
    /// Where auth challenges for this request are sent. Without one, a
    /// challenge fails the request with [`PoolError::AuthRequested`].
    pub auth_callback: Option<AuthCallback>,
}

#[derive(Debug, Default)]
enum HandleState {
    #[default]
    Unbound,
    Pending {
        request_id: RequestId,
        completion: oneshot::Receiver<Completion>,
    },
    Bound(PooledSocket),
}

/// The caller's view of one socket request: unbound, waiting, or holding a
/// socket.
///
/// A handle can be reused: `reset` returns whatever it holds and `init`
/// starts a new request.
#[derive(Debug, Default)]
pub struct ClientSocketHandle {
    state: HandleState,
    group_id: Option<GroupId>,
    priority: Priority,
    error: Option<PoolError>,
    events: Option<EventSender>,
}

impl ClientSocketHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a socket for `group_id`. `Ready` means the handle already
    /// holds a socket (or the request failed); `Pending` means the result
    /// arrives later through [`try_complete`](Self::try_complete) or
    /// [`wait`](Self::wait).
    pub fn init(
        &mut self,
        pool: &mut ClientSocketPool,
        group_id: GroupId,
        priority: Priority,
    ) -> Poll<Result<(), PoolError>> {
        self.init_with(pool, group_id, priority, InitOptions::default())
    }

    pub fn init_with(
        &mut self,
        pool: &mut ClientSocketPool,
        group_id: GroupId,
        priority: Priority,
        options: InitOptions,
    ) -> Poll<Result<(), PoolError>> {
        self.reset(pool);

        let respect_limits = options.respect_limits.unwrap_or(RespectLimits::Enabled);
        self.priority = priority;
        self.events = Some(pool.event_sender());
        let status = pool.request_socket(
            &group_id,
            Arc::new(options.params),
            priority,
            respect_limits,
            options.auth_callback,
        );
        self.group_id = Some(group_id);

        match status {
            RequestStatus::Ready(socket) => {
                self.state = HandleState::Bound(socket);
                Poll::Ready(Ok(()))
            }
            RequestStatus::Failed(err) => {
                self.error = Some(err.clone());
                Poll::Ready(Err(err))
            }
            RequestStatus::Pending {
                request_id,
                completion,
            } => {
                self.state = HandleState::Pending {
                    request_id,
                    completion,
                };
                Poll::Pending
            }
        }
    }

    /// Pick up a result the pool has delivered, without blocking.
    pub fn try_complete(&mut self) -> Poll<Result<(), PoolError>> {
        let received = match &mut self.state {
            HandleState::Pending { completion, .. } => completion.try_recv(),
            HandleState::Bound(_) => return Poll::Ready(Ok(())),
            HandleState::Unbound => return Poll::Ready(Err(self.unbound_error())),
        };
        match received {
            Ok(result) => Poll::Ready(self.finish(result)),
            Err(TryRecvError::Empty) => Poll::Pending,
            Err(TryRecvError::Closed) => Poll::Ready(self.finish(Err(PoolError::Aborted))),
        }
    }

    /// Wait for the pending request to finish. Cancel-safe: dropping the
    /// future leaves the request queued.
    pub async fn wait(&mut self) -> Result<(), PoolError> {
        let received = match &mut self.state {
            HandleState::Pending { completion, .. } => completion.await,
            HandleState::Bound(_) => return Ok(()),
            HandleState::Unbound => return Err(self.unbound_error()),
        };
        self.finish(received.unwrap_or(Err(PoolError::Aborted)))
    }

    fn finish(&mut self, result: Completion) -> Result<(), PoolError> {
        match result {
            Ok(socket) => {
                self.state = HandleState::Bound(socket);
                Ok(())
            }
            Err(err) => {
                self.state = HandleState::Unbound;
                self.error = Some(err.clone());
                Err(err)
            }
        }
    }

    fn unbound_error(&self) -> PoolError {
        self.error.clone().unwrap_or(PoolError::NotConnected)
    }

    /// Give up the socket or the pending request. A healthy socket goes back
    /// to the idle list.
    pub fn reset(&mut self, pool: &mut ClientSocketPool) {
        self.reset_internal(pool, false);
    }

    /// Like [`reset`](Self::reset), but the socket is closed instead of kept.
    pub fn reset_and_close(&mut self, pool: &mut ClientSocketPool) {
        self.reset_internal(pool, true);
    }

    fn reset_internal(&mut self, pool: &mut ClientSocketPool, close: bool) {
        match std::mem::take(&mut self.state) {
            HandleState::Unbound => {}
            HandleState::Pending {
                request_id,
                mut completion,
            } => match completion.try_recv() {
                // Delivered but never picked up.
                Ok(Ok(mut socket)) => {
                    if close {
                        socket.disconnect();
                    }
                    pool.release_socket(socket);
                }
                Ok(Err(_)) | Err(TryRecvError::Closed) => {}
                Err(TryRecvError::Empty) => {
                    if let Some(group_id) = &self.group_id {
                        pool.cancel_request(group_id, request_id, true);
                    }
                }
            },
            HandleState::Bound(mut socket) => {
                if close {
                    socket.disconnect();
                }
                pool.release_socket(socket);
            }
        }
        self.group_id = None;
        self.error = None;
        self.events = None;
    }

    /// Change the priority of a pending request; it may take a job from a
    /// less urgent request as a result.
    pub fn set_priority(&mut self, pool: &mut ClientSocketPool, priority: Priority) {
        self.priority = priority;
        if let (HandleState::Pending { request_id, .. }, Some(group_id)) =
            (&self.state, &self.group_id)
        {
            pool.set_priority(group_id, *request_id, priority);
        }
    }

    pub fn load_state(&self, pool: &ClientSocketPool) -> LoadState {
        match (&self.state, &self.group_id) {
            (HandleState::Pending { request_id, .. }, Some(group_id)) => {
                pool.load_state(group_id, *request_id)
            }
            (HandleState::Bound(_), _) => LoadState::Connected,
            _ => LoadState::Idle,
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, HandleState::Bound(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, HandleState::Pending { .. })
    }

    pub fn request_id(&self) -> Option<RequestId> {
        match &self.state {
            HandleState::Pending { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    pub fn group_id(&self) -> Option<&GroupId> {
        self.group_id.as_ref()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn socket(&self) -> Option<&dyn StreamSocket> {
        match &self.state {
            HandleState::Bound(socket) => socket.get(),
            _ => None,
        }
    }

    pub fn socket_mut(&mut self) -> Result<&mut (dyn StreamSocket + 'static), PoolError> {
        match &mut self.state {
            HandleState::Bound(socket) => socket.get_mut().ok_or(PoolError::NotConnected),
            _ => Err(PoolError::NotConnected),
        }
    }

    pub fn pooled_socket(&self) -> Option<&PooledSocket> {
        match &self.state {
            HandleState::Bound(socket) => Some(socket),
            _ => None,
        }
    }

    /// Take the socket out of the handle. It still returns to the pool when
    /// dropped.
    pub fn take_socket(&mut self) -> Option<PooledSocket> {
        match std::mem::take(&mut self.state) {
            HandleState::Bound(socket) => {
                self.group_id = None;
                Some(socket)
            }
            other => {
                self.state = other;
                None
            }
        }
    }

    pub fn reuse_type(&self) -> Option<SocketReuseType> {
        self.pooled_socket().map(PooledSocket::reuse_type)
    }

    pub fn idle_time(&self) -> Option<Duration> {
        self.pooled_socket().map(PooledSocket::idle_time)
    }

    /// The failure of the last request, if it failed.
    pub fn error(&self) -> Option<&PoolError> {
        self.error.as_ref()
    }

    /// Extra state attached to the last failure (certificate request info,
    /// auth challenge).
    pub fn error_details(&self) -> Option<&PoolError> {
        self.error.as_ref().filter(|err| err.has_additional_state())
    }
}

impl Drop for ClientSocketHandle {
    fn drop(&mut self) {
        // A bound socket returns through its own drop.
        if let (HandleState::Pending { request_id, .. }, Some(group_id), Some(events)) =
            (&self.state, &self.group_id, &self.events)
        {
            let _ = events.send(PoolEvent::RequestCancelled {
                group_id: group_id.clone(),
                request_id: *request_id,
            });
        }
    }
}
