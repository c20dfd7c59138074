use super::connect_job::AuthCallback;
use super::handle::PooledSocket;
use super::types::{JobId, Priority, RequestId, RespectLimits, SocketParams};
use crate::utils::error::PoolError;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::oneshot;

pub(crate) type Completion = Result<PooledSocket, PoolError>;

/// A caller's pending demand for a socket in one group.
#[derive(Debug)]
pub(crate) struct Request {
    pub(crate) id: RequestId,
    pub(crate) priority: Priority,
    pub(crate) respect_limits: RespectLimits,
    pub(crate) params: Arc<SocketParams>,
    pub(crate) auth_callback: Option<AuthCallback>,
    /// The connect job currently assigned to this request, if any.
    pub(crate) job: Option<JobId>,
    completion: oneshot::Sender<Completion>,
}

impl Request {
    pub(crate) fn new(
        id: RequestId,
        priority: Priority,
        respect_limits: RespectLimits,
        params: Arc<SocketParams>,
        auth_callback: Option<AuthCallback>,
        completion: oneshot::Sender<Completion>,
    ) -> Self {
        Self {
            id,
            priority,
            respect_limits,
            params,
            auth_callback,
            job: None,
            completion,
        }
    }

    pub(crate) fn spec(&self) -> RequestSpec {
        RequestSpec {
            priority: self.priority,
            respect_limits: self.respect_limits,
            params: Arc::clone(&self.params),
            use_idle_sockets: true,
        }
    }

    /// Deliver the result. A socket the handle no longer wants finds its way
    /// back to the pool through its own drop.
    pub(crate) fn complete(self, result: Completion) {
        let _ = self.completion.send(result);
    }
}

/// The parts of a request needed to obtain a socket for it.
#[derive(Debug, Clone)]
pub(crate) struct RequestSpec {
    pub(crate) priority: Priority,
    pub(crate) respect_limits: RespectLimits,
    pub(crate) params: Arc<SocketParams>,
    pub(crate) use_idle_sockets: bool,
}

impl RequestSpec {
    pub(crate) fn preconnect(params: Arc<SocketParams>) -> Self {
        Self {
            priority: Priority::Idle,
            respect_limits: RespectLimits::Enabled,
            params,
            use_idle_sockets: false,
        }
    }

    pub(crate) fn respects_limits(&self) -> bool {
        self.respect_limits == RespectLimits::Enabled
    }
}

/// Position of a request in its group's queue: most urgent first, then by
/// arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct QueueKey {
    priority: Reverse<Priority>,
    seq: i64,
}

/// Priority-ordered request queue with FIFO tie-breaking.
#[derive(Debug, Default)]
pub(crate) struct RequestQueue {
    entries: BTreeMap<QueueKey, Request>,
    index: HashMap<RequestId, QueueKey>,
    next_back: i64,
    next_front: i64,
}

impl RequestQueue {
    pub(crate) fn new() -> Self {
        Self {
            next_front: -1,
            ..Default::default()
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue behind every request of the same priority.
    pub(crate) fn insert(&mut self, request: Request) -> QueueKey {
        let key = QueueKey {
            priority: Reverse(request.priority),
            seq: self.next_back,
        };
        self.next_back += 1;
        self.place(key, request)
    }

    /// Queue ahead of every request of the same priority.
    pub(crate) fn insert_at_front(&mut self, request: Request) -> QueueKey {
        let key = QueueKey {
            priority: Reverse(request.priority),
            seq: self.next_front,
        };
        self.next_front -= 1;
        self.place(key, request)
    }

    fn place(&mut self, key: QueueKey, request: Request) -> QueueKey {
        self.index.insert(request.id, key);
        self.entries.insert(key, request);
        key
    }

    pub(crate) fn remove(&mut self, key: QueueKey) -> Option<Request> {
        let request = self.entries.remove(&key)?;
        self.index.remove(&request.id);
        Some(request)
    }

    pub(crate) fn key_of(&self, id: RequestId) -> Option<QueueKey> {
        self.index.get(&id).copied()
    }

    pub(crate) fn get(&self, key: QueueKey) -> Option<&Request> {
        self.entries.get(&key)
    }

    pub(crate) fn get_mut(&mut self, key: QueueKey) -> Option<&mut Request> {
        self.entries.get_mut(&key)
    }

    pub(crate) fn first_key(&self) -> Option<QueueKey> {
        self.entries.keys().next().copied()
    }

    pub(crate) fn first(&self) -> Option<&Request> {
        self.entries.values().next()
    }

    /// The next less urgent entry after `key`.
    pub(crate) fn next_key_after(&self, key: QueueKey) -> Option<QueueKey> {
        self.entries
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(key, _)| *key)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (QueueKey, &Request)> + '_ {
        self.entries.iter().map(|(key, request)| (*key, request))
    }

    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut Request> + '_ {
        self.entries.values_mut()
    }
}
