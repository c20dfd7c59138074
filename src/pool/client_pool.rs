use super::clock::{Clock, SystemClock};
use super::connect_job::{
    AuthCallback, AuthRequest, ConnectJob, ConnectJobFactory, ConnectOutcome, JobDelegate,
};
use super::event::{EventReceiver, EventSender, PoolEvent};
use super::group::{BoundRequest, Group, JobSlot};
use super::handle::PooledSocket;
use super::request::{Completion, Request, RequestSpec};
use super::socket::StreamSocket;
use super::stats::{GroupStats, PoolStats};
use super::types::{
    GroupId, HostPortPair, JobId, LayeredPoolId, LoadState, Priority, RequestId, RespectLimits,
    SocketParams, SocketReuseType,
};
use super::{
    CLOSED_CONNECTION_RETURNED_TO_POOL, DATA_RECEIVED_UNEXPECTEDLY, NETWORK_CHANGED,
    SOCKET_GENERATION_OUT_OF_DATE, SOCKET_POOL_DESTROYED, SSL_CONFIG_CHANGED,
};
use crate::utils::error::PoolError;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

#[cfg(feature = "metrics")]
use super::metrics::PoolMetrics;

/// Shortest idle sweep period and backup job delay the pool accepts.
pub const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

/// Limits and timers of a [`ClientSocketPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_sockets: usize,
    pub max_sockets_per_group: usize,
    /// How long a never-used idle socket is kept.
    pub unused_idle_socket_timeout: Duration,
    /// How long a previously used idle socket is kept.
    pub used_idle_socket_timeout: Duration,
    /// Period of the idle-socket sweep.
    pub cleanup_interval: Duration,
    /// Default connect job deadline; zero disables it.
    pub connect_timeout: Duration,
    pub backup_jobs_enabled: bool,
    /// How long the first job of a group may run before a backup job races it.
    pub backup_job_delay: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_sockets: 256,
            max_sockets_per_group: 6,
            unused_idle_socket_timeout: Duration::from_secs(10),
            used_idle_socket_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(240),
            backup_jobs_enabled: true,
            backup_job_delay: Duration::from_millis(250),
        }
    }
}

/// A pool stacked on top of this one (e.g. a TLS or HTTP/2 session pool)
/// that may be holding idle connections built from our sockets.
pub trait HigherLayeredPool: Send + Sync + fmt::Debug {
    /// Close one idle connection if there is one. Returns true if a
    /// connection was closed.
    fn close_one_idle_connection(&self) -> bool;
}

/// What [`ClientSocketPool::request_socket`] produced.
#[derive(Debug)]
pub enum RequestStatus {
    Ready(PooledSocket),
    Failed(PoolError),
    Pending {
        request_id: RequestId,
        completion: oneshot::Receiver<Completion>,
    },
}

/// Result of trying to find or start a socket for one request.
#[derive(Debug)]
enum SlotOutcome {
    Socket(PooledSocket),
    /// A preconnect finished synchronously; the socket went idle.
    Idle,
    Pending,
    Failed(PoolError),
    /// A preconnect ran into a socket limit.
    LimitReached,
}

/// Destination-scoped connection pool.
///
/// All state changes happen through `&mut self`. Connect jobs and returned
/// sockets report back through an event channel; call
/// [`process_events`](Self::process_events) to apply what arrived and
/// [`run_due_timers`](Self::run_due_timers) once
/// [`next_timer_deadline`](Self::next_timer_deadline) has passed.
/// [`PoolService`](super::PoolService) does both on a tokio task.
pub struct ClientSocketPool {
    settings: PoolSettings,
    factory: Arc<dyn ConnectJobFactory>,
    clock: Arc<dyn Clock>,
    groups: BTreeMap<GroupId, Group>,
    higher_pools: Vec<(LayeredPoolId, Arc<dyn HigherLayeredPool>)>,
    events_tx: EventSender,
    events_rx: EventReceiver,
    next_idle_sweep: Option<Instant>,
    /// A request stalled on the global limit since the last event drain.
    layered_close_pending: bool,
}

impl fmt::Debug for ClientSocketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSocketPool")
            .field("settings", &self.settings)
            .field("groups", &self.groups.len())
            .field("idle", &self.idle_socket_count())
            .field("connecting", &self.connecting_socket_count())
            .field("handed_out", &self.handed_out_socket_count())
            .finish()
    }
}

impl ClientSocketPool {
    pub fn new(settings: PoolSettings, factory: Arc<dyn ConnectJobFactory>) -> Self {
        Self::with_clock(settings, factory, Arc::new(SystemClock))
    }

    pub fn with_clock(
        mut settings: PoolSettings,
        factory: Arc<dyn ConnectJobFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        if settings.max_sockets_per_group > settings.max_sockets {
            warn!(
                per_group = settings.max_sockets_per_group,
                max = settings.max_sockets,
                "per-group limit exceeds pool limit, clamping"
            );
            settings.max_sockets_per_group = settings.max_sockets;
        }
        // Re-armed timers must land in the future or the service loop spins.
        if settings.cleanup_interval < MIN_TIMER_PERIOD {
            warn!(
                interval = ?settings.cleanup_interval,
                "idle sweep interval too short, clamping"
            );
            settings.cleanup_interval = MIN_TIMER_PERIOD;
        }
        if settings.backup_job_delay < MIN_TIMER_PERIOD {
            warn!(delay = ?settings.backup_job_delay, "backup job delay too short, clamping");
            settings.backup_job_delay = MIN_TIMER_PERIOD;
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        info!(
            max_sockets = settings.max_sockets,
            max_sockets_per_group = settings.max_sockets_per_group,
            backup_jobs = settings.backup_jobs_enabled,
            "Connection pool created"
        );
        Self {
            settings,
            factory,
            clock,
            groups: BTreeMap::new(),
            higher_pools: Vec::new(),
            events_tx,
            events_rx,
            next_idle_sweep: None,
            layered_close_pending: false,
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub(crate) fn event_sender(&self) -> EventSender {
        self.events_tx.clone()
    }

    // --- requests ---

    /// Ask for a socket. Served from the idle list when possible, otherwise
    /// by a new or preconnected job; queued when a limit is reached.
    ///
    /// Requests that ignore limits always run at maximum priority.
    pub fn request_socket(
        &mut self,
        group_id: &GroupId,
        params: Arc<SocketParams>,
        priority: Priority,
        respect_limits: RespectLimits,
        auth_callback: Option<AuthCallback>,
    ) -> RequestStatus {
        let priority = match respect_limits {
            RespectLimits::Enabled => priority,
            RespectLimits::Disabled => Priority::MAXIMUM,
        };
        self.cleanup_idle_sockets(None);

        let request_id = RequestId::next();
        let (completion_tx, completion) = oneshot::channel();
        let request = Request::new(
            request_id,
            priority,
            respect_limits,
            params,
            auth_callback,
            completion_tx,
        );
        trace!(group = %group_id, request = %request_id, %priority, "requesting socket");

        match self.request_socket_internal(group_id, &request.spec(), false) {
            SlotOutcome::Socket(socket) => RequestStatus::Ready(socket),
            SlotOutcome::Failed(err) => {
                debug!(group = %group_id, error = %err, "connect job failed synchronously");
                // Others are queued: same slot bookkeeping as an async failure.
                if self.groups.get(group_id).is_some_and(Group::has_unbound_requests) {
                    self.on_available_socket_slot(group_id);
                    self.check_for_stalled_socket_groups();
                }
                RequestStatus::Failed(err)
            }
            SlotOutcome::Pending | SlotOutcome::Idle | SlotOutcome::LimitReached => {
                let per_group = self.settings.max_sockets_per_group;
                let group = self.get_or_create_group(group_id);
                group.insert_unbound_request(request);
                // Stalled on the global limit; a higher layer may free a slot.
                if group.can_use_additional_socket_slot(per_group) {
                    self.layered_close_pending = true;
                }
                RequestStatus::Pending {
                    request_id,
                    completion,
                }
            }
        }
    }

    /// Start up to `num_sockets` connections for `group_id` without a
    /// request, counting sockets the group already has. Repeating a call
    /// does not start more. Returns how many new sockets were started.
    pub fn preconnect(
        &mut self,
        group_id: &GroupId,
        params: SocketParams,
        num_sockets: usize,
    ) -> Result<usize, PoolError> {
        self.cleanup_idle_sockets(None);
        let num_sockets = num_sockets.min(self.settings.max_sockets_per_group);
        let spec = RequestSpec::preconnect(Arc::new(params));
        debug!(group = %group_id, num_sockets, "preconnecting");

        self.get_or_create_group(group_id);
        let mut started = 0;
        let mut result = Ok(());
        for _ in 0..num_sockets {
            let slots = self
                .groups
                .get(group_id)
                .map_or(0, Group::num_active_socket_slots);
            if slots >= num_sockets {
                break;
            }
            match self.request_socket_internal(group_id, &spec, true) {
                SlotOutcome::Pending | SlotOutcome::Idle => started += 1,
                SlotOutcome::LimitReached => break,
                SlotOutcome::Failed(err) => {
                    result = Err(err);
                    break;
                }
                SlotOutcome::Socket(_) => unreachable!("preconnects never hand out sockets"),
            }
        }
        self.remove_group_if_empty(group_id);
        result.map(|()| started)
    }

    fn request_socket_internal(
        &mut self,
        group_id: &GroupId,
        spec: &RequestSpec,
        preconnecting: bool,
    ) -> SlotOutcome {
        let per_group = self.settings.max_sockets_per_group;
        let now = self.clock.now();

        if let Some(group) = self.groups.get_mut(group_id) {
            if spec.use_idle_sockets {
                if let Some(socket) = Self::assign_idle_socket(group, now, &self.events_tx) {
                    return SlotOutcome::Socket(socket);
                }
            }

            // A preconnect job nobody claimed yet is already working for us.
            if !preconnecting && group.try_to_use_never_assigned_connect_job() {
                return SlotOutcome::Pending;
            }

            if !group.has_available_socket_slot(per_group) && spec.respects_limits() {
                trace!(group = %group_id, "stalled on per-group socket limit");
                return Self::limit_outcome(preconnecting);
            }
        }

        if self.reached_max_sockets_limit() && spec.respects_limits() {
            if self.idle_socket_count() > 0 {
                // Make room by closing an idle socket elsewhere.
                let closed = self.close_one_idle_socket_except_in_group(Some(group_id));
                if preconnecting && !closed {
                    return SlotOutcome::LimitReached;
                }
            } else {
                trace!(group = %group_id, "stalled on pool socket limit");
                return Self::limit_outcome(preconnecting);
            }
        }

        let job_id = JobId::next();
        let delegate = JobDelegate::new(group_id.clone(), job_id, self.events_tx.clone());
        let mut job = self
            .factory
            .new_connect_job(group_id, &spec.params, spec.priority, delegate);
        #[cfg(feature = "metrics")]
        PoolMetrics::record_job_started(if preconnecting { "preconnect" } else { "normal" });

        match job.connect() {
            ConnectOutcome::Pending => {
                let mut slot = self.job_slot(job_id, job, spec.priority, now);
                slot.preconnect = preconnecting;
                let backup_delay = self
                    .settings
                    .backup_jobs_enabled
                    .then_some(self.settings.backup_job_delay);
                let group = self.get_or_create_group(group_id);
                if let Some(delay) = backup_delay {
                    if group.is_empty() {
                        group.start_backup_job_timer(now + delay);
                    }
                }
                trace!(group = %group_id, job = %job_id, "connect job started");
                group.add_job(slot, preconnecting);
                SlotOutcome::Pending
            }
            ConnectOutcome::Ready(Ok(socket)) => {
                let events = self.events_tx.clone();
                let group = self.get_or_create_group(group_id);
                if preconnecting {
                    group.add_idle_socket(socket, now);
                    self.note_idle_socket_added(now);
                    SlotOutcome::Idle
                } else {
                    SlotOutcome::Socket(group.hand_out_socket(
                        socket,
                        SocketReuseType::Unused,
                        Duration::ZERO,
                        &events,
                    ))
                }
            }
            ConnectOutcome::Ready(Err(err)) => {
                #[cfg(feature = "metrics")]
                PoolMetrics::record_job_failed(&err);
                self.remove_group_if_empty(group_id);
                SlotOutcome::Failed(err)
            }
        }
    }

    fn limit_outcome(preconnecting: bool) -> SlotOutcome {
        if preconnecting {
            SlotOutcome::LimitReached
        } else {
            SlotOutcome::Pending
        }
    }

    fn job_slot(
        &self,
        job_id: JobId,
        job: Box<dyn ConnectJob>,
        priority: Priority,
        now: Instant,
    ) -> JobSlot {
        let timeout = job.timeout().unwrap_or(self.settings.connect_timeout);
        let timeout = (!timeout.is_zero()).then_some(timeout);
        JobSlot::new(job_id, job, priority, now, timeout)
    }

    fn assign_idle_socket(
        group: &mut Group,
        now: Instant,
        events: &EventSender,
    ) -> Option<PooledSocket> {
        let (idle, idle_time) = group.take_idle_socket(now)?;
        let reuse_type = if idle.socket.was_ever_used() {
            SocketReuseType::ReusedIdle
        } else {
            SocketReuseType::UnusedIdle
        };
        trace!(group = %group.id, ?reuse_type, ?idle_time, "reusing idle socket");
        #[cfg(feature = "metrics")]
        PoolMetrics::record_idle_reused();
        Some(group.hand_out_socket(idle.socket, reuse_type, idle_time, events))
    }

    /// Withdraw a request. A job it was using keeps running if another
    /// request can take it; otherwise a surplus job is cancelled when the
    /// caller asks for it or the pool is at its limit. Jobs started by a
    /// preconnect are left to finish.
    pub fn cancel_request(
        &mut self,
        group_id: &GroupId,
        request_id: RequestId,
        cancel_connect_job: bool,
    ) {
        let reached_limit = self.reached_max_sockets_limit();
        let Some(group) = self.groups.get_mut(group_id) else {
            return;
        };

        if let Some(bound) = group.find_and_remove_bound_request(request_id) {
            debug!(
                group = %group_id,
                request = %request_id,
                job = %bound.job.id,
                "cancelled bound request"
            );
            drop(bound);
            self.on_available_socket_slot(group_id);
            self.check_for_stalled_socket_groups();
            return;
        }

        let Some(request) = group.find_and_remove_unbound_request(request_id) else {
            return;
        };
        debug!(group = %group_id, request = %request_id, "cancelled request");
        drop(request);

        if group.jobs.len() > group.unbound_request_count() && (cancel_connect_job || reached_limit)
        {
            if let Some(job_id) = group.oldest_non_preconnect_job() {
                trace!(group = %group_id, job = %job_id, "cancelling surplus connect job");
                drop(group.remove_unbound_job(job_id));
            }
            self.remove_group_if_empty(group_id);
            if reached_limit {
                self.check_for_stalled_socket_groups();
            }
        }
    }

    /// Change a queued request's priority. No-op if the request is unknown.
    pub fn set_priority(&mut self, group_id: &GroupId, request_id: RequestId, priority: Priority) {
        if let Some(group) = self.groups.get_mut(group_id) {
            if group.set_priority(request_id, priority) {
                trace!(
                    group = %group_id,
                    request = %request_id,
                    %priority,
                    "request reprioritized"
                );
            }
        }
    }

    /// Return a socket handed out earlier.
    pub fn release_socket(&mut self, socket: PooledSocket) {
        if let Some((group_id, socket, generation)) = socket.into_parts() {
            self.release_socket_parts(group_id, socket, generation);
        }
    }

    fn release_socket_parts(
        &mut self,
        group_id: GroupId,
        socket: Box<dyn StreamSocket>,
        generation: u64,
    ) {
        let now = self.clock.now();
        let Some(group) = self.groups.get_mut(&group_id) else {
            warn!(group = %group_id, "socket returned to unknown group");
            return;
        };
        debug_assert!(group.active_socket_count > 0);
        group.active_socket_count = group.active_socket_count.saturating_sub(1);

        let close_reason = if !socket.is_connected_and_idle() {
            if socket.is_connected() {
                Some(DATA_RECEIVED_UNEXPECTEDLY)
            } else {
                Some(CLOSED_CONNECTION_RETURNED_TO_POOL)
            }
        } else if generation != group.generation {
            Some(SOCKET_GENERATION_OUT_OF_DATE)
        } else {
            None
        };

        match close_reason {
            None => {
                trace!(group = %group_id, "socket returned to idle list");
                group.add_idle_socket(socket, now);
                self.note_idle_socket_added(now);
                self.on_available_socket_slot(&group_id);
            }
            Some(reason) => {
                debug!(group = %group_id, reason, "closing returned socket");
                #[cfg(feature = "metrics")]
                PoolMetrics::record_idle_closed(reason);
                drop(socket);
                self.remove_group_if_empty(&group_id);
            }
        }
        self.check_for_stalled_socket_groups();
    }

    // --- events ---

    /// Apply everything connect jobs, handles and sockets have reported.
    /// Returns the number of events handled.
    pub fn process_events(&mut self) -> usize {
        let mut handled = 0;
        loop {
            while let Ok(event) = self.events_rx.try_recv() {
                self.handle_event(event);
                handled += 1;
            }
            if !self.try_to_close_sockets_in_layered_pools() {
                break;
            }
        }
        handled
    }

    /// Wait for the next event. Never returns `None` while the pool lives,
    /// since the pool holds a sender itself.
    pub async fn next_event(&mut self) -> Option<PoolEvent> {
        self.events_rx.recv().await
    }

    pub fn handle_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::JobComplete {
                group_id,
                job_id,
                result,
            } => self.on_connect_job_complete(&group_id, job_id, result),
            PoolEvent::JobNeedsInput {
                group_id,
                job_id,
                request,
            } => self.on_needs_input(&group_id, job_id, request),
            PoolEvent::JobResumed { group_id, job_id } => {
                let now = self.clock.now();
                if let Some(slot) = self
                    .groups
                    .get_mut(&group_id)
                    .and_then(|group| group.job_mut(job_id))
                {
                    trace!(group = %group_id, job = %job_id, "connect job resumed");
                    slot.rearm_deadline(now);
                }
            }
            PoolEvent::SocketReleased {
                group_id,
                socket,
                generation,
            } => self.release_socket_parts(group_id, socket, generation),
            PoolEvent::RequestCancelled {
                group_id,
                request_id,
            } => self.cancel_request(&group_id, request_id, true),
        }
    }

    fn on_connect_job_complete(
        &mut self,
        group_id: &GroupId,
        job_id: JobId,
        result: Result<Box<dyn StreamSocket>, PoolError>,
    ) {
        let now = self.clock.now();
        let Some(group) = self.groups.get_mut(group_id) else {
            trace!(group = %group_id, job = %job_id, "result for vanished group ignored");
            return;
        };

        #[cfg(feature = "metrics")]
        if let Err(err) = &result {
            PoolMetrics::record_job_failed(err);
        }

        if let Some(bound) = group.find_and_remove_bound_request_for_job(job_id) {
            let BoundRequest {
                job,
                request,
                generation,
                pending_error,
            } = bound;
            drop(job);

            if let Some(err) = pending_error {
                request.complete(Err(err));
            } else if generation != group.generation {
                // Refreshed while the job ran: requeue and try again.
                debug!(group = %group_id, job = %job_id, "discarding result of stale bound job");
                drop(result);
                group.insert_unbound_request(request);
            } else {
                match result {
                    Ok(socket) => {
                        debug!(group = %group_id, job = %job_id, "bound connect job succeeded");
                        let socket = group.hand_out_socket(
                            socket,
                            SocketReuseType::Unused,
                            Duration::ZERO,
                            &self.events_tx,
                        );
                        request.complete(Ok(socket));
                        return;
                    }
                    Err(err) => {
                        debug!(
                            group = %group_id,
                            job = %job_id,
                            error = %err,
                            "bound connect job failed"
                        );
                        request.complete(Err(err));
                    }
                }
            }
            self.on_available_socket_slot(group_id);
            self.check_for_stalled_socket_groups();
            return;
        }

        if !group.has_unbound_job(job_id) {
            trace!(group = %group_id, job = %job_id, "result for cancelled job ignored");
            return;
        }

        // A failure belongs to the request holding the job; a socket goes to
        // whoever is first in line.
        let socket = match result {
            Ok(socket) => socket,
            Err(err) => {
                debug!(group = %group_id, job = %job_id, error = %err, "connect job failed");
                if let Some((_, Some(holder))) = group.remove_failed_job(job_id) {
                    holder.complete(Err(err));
                }
                self.on_available_socket_slot(group_id);
                self.check_for_stalled_socket_groups();
                return;
            }
        };

        let Some(request) = group.pop_next_unbound_request() else {
            // Nobody waiting: keep the socket for later.
            trace!(group = %group_id, job = %job_id, "connect job finished without a request");
            group.add_idle_socket(socket, now);
            drop(group.remove_unbound_job(job_id));
            self.note_idle_socket_added(now);
            self.on_available_socket_slot(group_id);
            self.check_for_stalled_socket_groups();
            return;
        };

        trace!(group = %group_id, job = %job_id, request = %request.id, "connect job succeeded");
        let socket = group.hand_out_socket(
            socket,
            SocketReuseType::Unused,
            Duration::ZERO,
            &self.events_tx,
        );
        request.complete(Ok(socket));
        drop(group.remove_unbound_job(job_id));
    }

    fn on_needs_input(&mut self, group_id: &GroupId, job_id: JobId, auth_request: AuthRequest) {
        let Some(group) = self.groups.get_mut(group_id) else {
            return;
        };
        if group.job(job_id).is_some_and(|slot| slot.awaiting_input) {
            warn!(group = %group_id, job = %job_id, "second auth challenge while suspended");
            self.on_connect_job_complete(
                group_id,
                job_id,
                Err(PoolError::connection_failed("overlapping auth challenge")),
            );
            return;
        }

        match group.bind_request_to_connect_job(job_id) {
            Some(callback) => {
                debug!(group = %group_id, job = %job_id, "routing auth challenge to request");
                // If the owner stopped listening, the dropped resume token
                // makes the job fail on its own.
                let _ = callback.send(auth_request);
            }
            None => {
                debug!(group = %group_id, job = %job_id, "no request can answer auth challenge");
                self.on_connect_job_complete(
                    group_id,
                    job_id,
                    Err(PoolError::AuthRequested(auth_request.challenge)),
                );
            }
        }
    }

    // --- slots and stalls ---

    fn on_available_socket_slot(&mut self, group_id: &GroupId) {
        let Some(group) = self.groups.get(group_id) else {
            return;
        };
        if group.is_empty() {
            self.groups.remove(group_id);
        } else if group.has_unbound_requests() {
            self.process_pending_request(group_id);
        }
    }

    fn process_pending_request(&mut self, group_id: &GroupId) {
        let per_group = self.settings.max_sockets_per_group;
        let spec = {
            let Some(group) = self.groups.get(group_id) else {
                return;
            };
            let Some(next) = group.next_unbound_request() else {
                return;
            };
            // Nothing can be done for the request right now.
            if group.idle_sockets.is_empty() && !group.can_use_additional_socket_slot(per_group) {
                return;
            }
            next.spec()
        };

        let outcome = self.request_socket_internal(group_id, &spec, false);
        if matches!(outcome, SlotOutcome::Pending) {
            return;
        }
        let Some(request) = self
            .groups
            .get_mut(group_id)
            .and_then(Group::pop_next_unbound_request)
        else {
            return;
        };
        self.remove_group_if_empty(group_id);
        match outcome {
            SlotOutcome::Socket(socket) => request.complete(Ok(socket)),
            SlotOutcome::Failed(err) => request.complete(Err(err)),
            SlotOutcome::Pending | SlotOutcome::Idle | SlotOutcome::LimitReached => {
                unreachable!("only preconnects go idle or hit a limit")
            }
        }
    }

    /// While the pool is at its limit and some group waits for a slot, free
    /// idle sockets and hand the slots to the most urgent group.
    fn check_for_stalled_socket_groups(&mut self) {
        while let Some(group_id) = self.find_top_stalled_group() {
            if self.reached_max_sockets_limit() {
                if self.idle_socket_count() == 0 {
                    return;
                }
                self.close_one_idle_socket();
            }
            self.on_available_socket_slot(&group_id);
        }
    }

    /// The group whose top request is most urgent among groups that could
    /// use another socket. Ties go to the first group in key order.
    fn find_top_stalled_group(&self) -> Option<GroupId> {
        let per_group = self.settings.max_sockets_per_group;
        let mut top: Option<(&GroupId, Priority)> = None;
        for (id, group) in &self.groups {
            let Some(priority) = group.top_pending_priority() else {
                continue;
            };
            if !group.can_use_additional_socket_slot(per_group) {
                continue;
            }
            if top.map_or(true, |(_, best)| priority > best) {
                top = Some((id, priority));
            }
        }
        top.map(|(id, _)| id.clone())
    }

    /// Requests waiting only because the pool as a whole is full.
    fn stalled_request_count(&self) -> usize {
        let per_group = self.settings.max_sockets_per_group;
        self.groups
            .values()
            .filter(|group| group.can_use_additional_socket_slot(per_group))
            .map(|group| {
                let waiting = group.unbound_request_count() - group.jobs.len();
                let room = per_group - group.num_active_socket_slots();
                waiting.min(room)
            })
            .sum()
    }

    // --- idle sockets ---

    /// Close all idle sockets.
    pub fn close_idle_sockets(&mut self, reason: &'static str) {
        self.cleanup_idle_sockets(Some(reason));
    }

    /// Close the idle sockets of one group.
    pub fn close_idle_sockets_in_group(&mut self, group_id: &GroupId, reason: &'static str) {
        let now = self.clock.now();
        let (used, unused) = self.idle_timeouts();
        if let Some(group) = self.groups.get_mut(group_id) {
            let closed = group.cleanup_idle_sockets(Some(reason), now, used, unused);
            #[cfg(feature = "metrics")]
            PoolMetrics::record_idle_closed_n(reason, closed);
            debug!(group = %group_id, closed, reason, "closed idle sockets in group");
        }
        self.remove_group_if_empty(group_id);
    }

    fn idle_timeouts(&self) -> (Duration, Duration) {
        (
            self.settings.used_idle_socket_timeout,
            self.settings.unused_idle_socket_timeout,
        )
    }

    fn cleanup_idle_sockets(&mut self, force: Option<&'static str>) {
        if self.idle_socket_count() == 0 {
            return;
        }
        let now = self.clock.now();
        let (used, unused) = self.idle_timeouts();
        let mut closed = 0;
        for group in self.groups.values_mut() {
            closed += group.cleanup_idle_sockets(force, now, used, unused);
        }
        if closed > 0 {
            debug!(closed, "closed idle sockets");
            #[cfg(feature = "metrics")]
            PoolMetrics::record_idle_closed_n(force.unwrap_or("cleanup"), closed);
        }
        self.groups.retain(|_, group| !group.is_empty());
    }

    fn close_one_idle_socket(&mut self) -> bool {
        self.close_one_idle_socket_except_in_group(None)
    }

    fn close_one_idle_socket_except_in_group(&mut self, except: Option<&GroupId>) -> bool {
        let victim = self
            .groups
            .iter()
            .find(|(id, group)| Some(*id) != except && !group.idle_sockets.is_empty())
            .map(|(id, _)| id.clone());
        let Some(victim) = victim else {
            return false;
        };
        if let Some(group) = self.groups.get_mut(&victim) {
            group.close_oldest_idle_socket();
            trace!(group = %victim, "closed idle socket to free a slot");
            #[cfg(feature = "metrics")]
            PoolMetrics::record_idle_closed("freeing slot");
        }
        self.remove_group_if_empty(&victim);
        true
    }

    fn note_idle_socket_added(&mut self, now: Instant) {
        if self.next_idle_sweep.is_none() {
            self.next_idle_sweep = Some(now + self.settings.cleanup_interval);
        }
    }

    // --- layered pools ---

    pub fn register_layered_pool(&mut self, pool: Arc<dyn HigherLayeredPool>) -> LayeredPoolId {
        let id = LayeredPoolId::next();
        debug!(layered_pool = %id, "layered pool registered");
        self.higher_pools.push((id, pool));
        id
    }

    pub fn unregister_layered_pool(&mut self, id: LayeredPoolId) -> bool {
        let before = self.higher_pools.len();
        self.higher_pools.retain(|(registered, _)| *registered != id);
        before != self.higher_pools.len()
    }

    /// Ask higher layers to close idle connections while requests here are
    /// stalled on the pool limit. Returns true if any layer closed one.
    fn try_to_close_sockets_in_layered_pools(&mut self) -> bool {
        if !std::mem::take(&mut self.layered_close_pending) || self.higher_pools.is_empty() {
            return false;
        }
        if !self.is_stalled() {
            return false;
        }
        let mut closed_any = false;
        for _ in 0..self.stalled_request_count() {
            if !self.close_one_idle_connection_in_higher_layered_pool() {
                break;
            }
            closed_any = true;
        }
        if closed_any {
            debug!("higher layered pools released idle connections");
        }
        closed_any
    }

    fn close_one_idle_connection_in_higher_layered_pool(&self) -> bool {
        self.higher_pools
            .iter()
            .any(|(_, pool)| pool.close_one_idle_connection())
    }

    // --- flushing ---

    /// Fail every pending request with `error` and cancel every connect job.
    /// Requests bound to a job keep it; they get `error` when it finishes.
    /// Idle and handed-out sockets are not touched.
    pub fn flush_with_error(&mut self, error: PoolError) {
        info!(error = %error, "flushing pool");
        for group in self.groups.values_mut() {
            drop(group.remove_all_unbound_jobs());
        }
        for group in self.groups.values_mut() {
            group.set_pending_error_for_all_bound_requests(&error);
            while let Some(request) = group.pop_next_unbound_request() {
                request.complete(Err(error.clone()));
            }
        }
        self.groups.retain(|_, group| !group.is_empty());
    }

    /// Invalidate groups matching `matches`: close their idle sockets,
    /// restart their unbound jobs and mark handed-out sockets stale so they
    /// are closed on return. Waiting requests are not failed. Returns how
    /// many groups were refreshed.
    pub fn refresh_groups<F>(&mut self, matches: F, reason: &'static str) -> usize
    where
        F: Fn(&GroupId) -> bool,
    {
        let now = self.clock.now();
        let (used, unused) = self.idle_timeouts();
        let mut refreshed = 0;
        for (id, group) in self.groups.iter_mut().filter(|(id, _)| matches(id)) {
            let closed = group.cleanup_idle_sockets(Some(reason), now, used, unused);
            let cancelled = group.remove_all_unbound_jobs().len();
            group.increment_generation();
            debug!(
                group = %id,
                closed,
                cancelled,
                generation = group.generation,
                reason,
                "group refreshed"
            );
            refreshed += 1;
        }
        self.groups.retain(|_, group| !group.is_empty());
        if refreshed > 0 {
            self.check_for_stalled_socket_groups();
        }
        refreshed
    }

    /// The network changed: fail waiting requests, drop idle sockets and
    /// make every outstanding socket stale.
    pub fn on_ip_address_changed(&mut self) {
        info!("IP address changed");
        self.flush_with_error(PoolError::NetworkChanged);
        self.refresh_groups(|_| true, NETWORK_CHANGED);
    }

    /// TLS settings changed: every group must build fresh sockets.
    pub fn on_ssl_config_changed(&mut self) {
        let refreshed = self.refresh_groups(|_| true, SSL_CONFIG_CHANGED);
        info!(refreshed, "SSL config changed");
    }

    /// TLS settings changed for some servers: refresh the secure groups
    /// talking to them.
    pub fn on_ssl_config_for_servers_changed(&mut self, servers: &HashSet<HostPortPair>) {
        let refreshed = self.refresh_groups(
            |id| id.kind.is_secure() && servers.contains(&id.destination),
            SSL_CONFIG_CHANGED,
        );
        info!(refreshed, servers = servers.len(), "SSL config changed for servers");
    }

    /// Abort everything and close all idle sockets.
    pub fn shutdown(&mut self) {
        self.flush_with_error(PoolError::Aborted);
        self.close_idle_sockets(SOCKET_POOL_DESTROYED);
        info!("Connection pool shut down");
    }

    // --- timers ---

    /// Earliest instant at which [`run_due_timers`](Self::run_due_timers)
    /// has work to do.
    pub fn next_timer_deadline(&self) -> Option<Instant> {
        let groups = self.groups.values().flat_map(|group| {
            [group.next_job_deadline(), group.backup_job_deadline]
                .into_iter()
                .flatten()
        });
        let sweep = if self.idle_socket_count() > 0 {
            self.next_idle_sweep
        } else {
            None
        };
        groups.chain(sweep).min()
    }

    /// Fire connect timeouts, backup job timers and the idle sweep that are
    /// due.
    pub fn run_due_timers(&mut self) {
        let now = self.clock.now();

        let expired: Vec<(GroupId, JobId)> = self
            .groups
            .iter()
            .flat_map(|(id, group)| {
                group
                    .expired_jobs(now)
                    .into_iter()
                    .map(move |job_id| (id.clone(), job_id))
            })
            .collect();
        for (group_id, job_id) in expired {
            debug!(group = %group_id, job = %job_id, "connect job timed out");
            self.on_connect_job_complete(&group_id, job_id, Err(PoolError::Timeout));
        }

        let backups: Vec<GroupId> = self
            .groups
            .iter()
            .filter(|(_, group)| group.backup_job_deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for group_id in backups {
            if let Some(group) = self.groups.get_mut(&group_id) {
                group.backup_job_deadline = None;
            }
            self.on_backup_job_timer_fired(&group_id);
        }

        if self.idle_socket_count() == 0 {
            self.next_idle_sweep = None;
        } else if self.next_idle_sweep.is_some_and(|sweep| sweep <= now) {
            self.cleanup_idle_sockets(None);
            self.next_idle_sweep = Some(now + self.settings.cleanup_interval);
        }
    }

    fn on_backup_job_timer_fired(&mut self, group_id: &GroupId) {
        let now = self.clock.now();
        let per_group = self.settings.max_sockets_per_group;
        let delay = self.settings.backup_job_delay;
        let reached_limit = self.reached_max_sockets_limit();
        let Some(group) = self.groups.get_mut(group_id) else {
            return;
        };

        let Some(first) = group.jobs.first() else {
            return;
        };
        // The first job already has a connection; a backup cannot beat it.
        if first.job.has_established_connection() {
            return;
        }
        // Still resolving: a backup would wait on the same lookup. Try later.
        if reached_limit
            || !group.has_available_socket_slot(per_group)
            || first.job.load_state() == LoadState::ResolvingHost
        {
            group.start_backup_job_timer(now + delay);
            return;
        }

        let Some(spec) = group.next_unbound_request().map(Request::spec) else {
            return;
        };

        let job_id = JobId::next();
        let delegate = JobDelegate::new(group_id.clone(), job_id, self.events_tx.clone());
        let job = self
            .factory
            .new_connect_job(group_id, &spec.params, spec.priority, delegate);
        let timeout = job.timeout().unwrap_or(self.settings.connect_timeout);
        let mut slot = JobSlot::new(
            job_id,
            job,
            spec.priority,
            now,
            (!timeout.is_zero()).then_some(timeout),
        );
        slot.backup = true;
        debug!(group = %group_id, job = %job_id, "starting backup connect job");
        #[cfg(feature = "metrics")]
        PoolMetrics::record_job_started("backup");

        group.add_job(slot, false);
        let outcome = group.job_mut(job_id).map(|slot| slot.job.connect());
        if let Some(ConnectOutcome::Ready(result)) = outcome {
            self.on_connect_job_complete(group_id, job_id, result);
        }
    }

    // --- introspection ---

    pub fn idle_socket_count(&self) -> usize {
        self.groups.values().map(|g| g.idle_sockets.len()).sum()
    }

    pub fn idle_socket_count_in_group(&self, group_id: &GroupId) -> usize {
        self.groups
            .get(group_id)
            .map_or(0, |group| group.idle_sockets.len())
    }

    /// Sockets being connected, including jobs bound to a request.
    pub fn connecting_socket_count(&self) -> usize {
        self.groups.values().map(Group::connect_job_count).sum()
    }

    pub fn handed_out_socket_count(&self) -> usize {
        self.groups.values().map(|g| g.active_socket_count).sum()
    }

    pub fn has_group(&self, group_id: &GroupId) -> bool {
        self.groups.contains_key(group_id)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn connect_job_count_in_group(&self, group_id: &GroupId) -> usize {
        self.groups
            .get(group_id)
            .map_or(0, Group::connect_job_count)
    }

    pub fn unassigned_job_count_in_group(&self, group_id: &GroupId) -> usize {
        self.groups
            .get(group_id)
            .map_or(0, Group::unassigned_job_count)
    }

    pub fn never_assigned_job_count_in_group(&self, group_id: &GroupId) -> usize {
        self.groups
            .get(group_id)
            .map_or(0, Group::never_assigned_job_count)
    }

    pub fn pending_request_count_in_group(&self, group_id: &GroupId) -> usize {
        self.groups
            .get(group_id)
            .map_or(0, |group| group.unbound_request_count() + group.bound_requests.len())
    }

    pub fn active_socket_count_in_group(&self, group_id: &GroupId) -> usize {
        self.groups
            .get(group_id)
            .map_or(0, |group| group.active_socket_count)
    }

    pub fn group_generation(&self, group_id: &GroupId) -> Option<u64> {
        self.groups.get(group_id).map(|group| group.generation)
    }

    pub fn has_active_socket(&self, group_id: &GroupId) -> bool {
        self.groups.get(group_id).is_some_and(|group| {
            group.active_socket_count > 0
                || !group.idle_sockets.is_empty()
                || group.connect_job_count() > 0
        })
    }

    pub fn backup_job_timer_is_running(&self, group_id: &GroupId) -> bool {
        self.groups
            .get(group_id)
            .is_some_and(Group::backup_job_timer_is_running)
    }

    /// Whether the request in `group_id` has a job working for it.
    pub fn request_has_job(&self, group_id: &GroupId, request_id: RequestId) -> bool {
        self.groups
            .get(group_id)
            .is_some_and(|group| group.job_for_request(request_id).is_some())
    }

    /// Handed-out, connecting and idle sockets together reach `max_sockets`.
    pub fn reached_max_sockets_limit(&self) -> bool {
        let total = self.handed_out_socket_count()
            + self.connecting_socket_count()
            + self.idle_socket_count();
        total >= self.settings.max_sockets
    }

    /// Some group could use a socket the pool cannot give it because the
    /// pool as a whole is full.
    pub fn is_stalled(&self) -> bool {
        let per_group = self.settings.max_sockets_per_group;
        if self.handed_out_socket_count() + self.connecting_socket_count()
            < self.settings.max_sockets
        {
            return false;
        }
        self.groups
            .values()
            .any(|group| group.can_use_additional_socket_slot(per_group))
    }

    /// Progress of the request: its job's state if it has one, otherwise
    /// what it is waiting for.
    pub fn load_state(&self, group_id: &GroupId, request_id: RequestId) -> LoadState {
        let Some(group) = self.groups.get(group_id) else {
            return LoadState::Connecting;
        };
        if let Some(slot) = group.job_for_request(request_id) {
            return slot.job.load_state();
        }
        if group.has_unbound_request(request_id) {
            if group.can_use_additional_socket_slot(self.settings.max_sockets_per_group) {
                return LoadState::WaitingForStalledSocketPool;
            }
            return LoadState::WaitingForAvailableSocket;
        }
        // Already completed; the result is waiting in the handle.
        LoadState::Connecting
    }

    pub fn stats(&self) -> PoolStats {
        let per_group = self.settings.max_sockets_per_group;
        let groups = self
            .groups
            .iter()
            .map(|(id, group)| {
                let stats = GroupStats {
                    pending_request_count: group.unbound_request_count(),
                    bound_request_count: group.bound_requests.len(),
                    active_socket_count: group.active_socket_count,
                    idle_socket_count: group.idle_sockets.len(),
                    connect_job_count: group.connect_job_count(),
                    unassigned_job_count: group.unassigned_job_count(),
                    never_assigned_job_count: group.never_assigned_job_count(),
                    is_stalled: group.can_use_additional_socket_slot(per_group),
                    backup_job_timer_is_running: group.backup_job_timer_is_running(),
                    top_pending_priority: group.top_pending_priority(),
                    generation: group.generation,
                };
                (id.to_string(), stats)
            })
            .collect();
        PoolStats {
            handed_out_socket_count: self.handed_out_socket_count(),
            connecting_socket_count: self.connecting_socket_count(),
            idle_socket_count: self.idle_socket_count(),
            max_socket_count: self.settings.max_sockets,
            max_sockets_per_group: per_group,
            is_stalled: self.is_stalled(),
            groups,
        }
    }

    // --- groups ---

    fn get_or_create_group(&mut self, group_id: &GroupId) -> &mut Group {
        self.groups.entry(group_id.clone()).or_insert_with(|| {
            trace!(group = %group_id, "group created");
            Group::new(group_id.clone())
        })
    }

    fn remove_group_if_empty(&mut self, group_id: &GroupId) {
        if self.groups.get(group_id).is_some_and(Group::is_empty) {
            trace!(group = %group_id, "group removed");
            self.groups.remove(group_id);
        }
    }
}
