use super::connect_job::{AuthCallback, ConnectJob};
use super::event::EventSender;
use super::handle::PooledSocket;
use super::request::{QueueKey, Request, RequestQueue};
use super::socket::StreamSocket;
use super::types::{GroupId, JobId, Priority, RequestId, RespectLimits, SocketReuseType};
use super::{
    DATA_RECEIVED_UNEXPECTEDLY, IDLE_TIME_LIMIT_EXPIRED, REMOTE_SIDE_CLOSED_CONNECTION,
    SOCKET_GENERATION_OUT_OF_DATE,
};
use crate::utils::error::PoolError;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// A connect job owned by a group, plus the pool's bookkeeping for it.
#[derive(Debug)]
pub(crate) struct JobSlot {
    pub(crate) id: JobId,
    pub(crate) job: Box<dyn ConnectJob>,
    pub(crate) priority: Priority,
    pub(crate) created_at: Instant,
    /// Effective timeout; `None` when the job has no deadline.
    pub(crate) timeout: Option<Duration>,
    pub(crate) deadline: Option<Instant>,
    /// Started by a preconnect rather than on behalf of a request.
    pub(crate) preconnect: bool,
    pub(crate) backup: bool,
    /// Suspended on an auth challenge, waiting for a resume.
    pub(crate) awaiting_input: bool,
}

impl JobSlot {
    pub(crate) fn new(
        id: JobId,
        job: Box<dyn ConnectJob>,
        priority: Priority,
        now: Instant,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            job,
            priority,
            created_at: now,
            timeout,
            deadline: timeout.map(|t| now + t),
            preconnect: false,
            backup: false,
            awaiting_input: false,
        }
    }

    pub(crate) fn set_priority(&mut self, priority: Priority) {
        if self.priority != priority {
            self.priority = priority;
            self.job.set_priority(priority);
        }
    }

    pub(crate) fn suspend_deadline(&mut self) {
        self.awaiting_input = true;
        self.deadline = None;
    }

    pub(crate) fn rearm_deadline(&mut self, now: Instant) {
        self.awaiting_input = false;
        self.deadline = self.timeout.map(|t| now + t);
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

/// A request permanently bound to a job that raised an auth challenge.
#[derive(Debug)]
pub(crate) struct BoundRequest {
    pub(crate) job: JobSlot,
    pub(crate) request: Request,
    /// Group generation at bind time; a mismatch on completion means the
    /// group was refreshed and the result must be discarded.
    pub(crate) generation: u64,
    /// Set by a flush; delivered instead of the job's result.
    pub(crate) pending_error: Option<PoolError>,
}

#[derive(Debug)]
pub(crate) struct IdleSocket {
    pub(crate) socket: Box<dyn StreamSocket>,
    pub(crate) since: Instant,
    pub(crate) generation: u64,
}

impl IdleSocket {
    /// A used socket must be connected with nothing unread, since stray
    /// bytes would be taken for the start of the next response. A never-used
    /// socket only has to be connected.
    pub(crate) fn check_usable(&self, current_generation: u64) -> Result<(), &'static str> {
        if self.generation != current_generation {
            return Err(SOCKET_GENERATION_OUT_OF_DATE);
        }
        if self.socket.was_ever_used() {
            if !self.socket.is_connected_and_idle() {
                if !self.socket.is_connected() {
                    return Err(REMOTE_SIDE_CLOSED_CONNECTION);
                }
                return Err(DATA_RECEIVED_UNEXPECTEDLY);
            }
            return Ok(());
        }
        if !self.socket.is_connected() {
            return Err(REMOTE_SIDE_CLOSED_CONNECTION);
        }
        Ok(())
    }
}

/// Per-destination state: waiting requests, connect jobs, sockets.
///
/// Job assignment invariant: walking `unbound_requests` in priority order,
/// the first `jobs.len() - unassigned_jobs.len()` requests each hold a
/// distinct job and none after them does. `unassigned_jobs` is non-empty
/// only when there are more jobs than requests.
#[derive(Debug)]
pub(crate) struct Group {
    pub(crate) id: GroupId,
    pub(crate) unbound_requests: RequestQueue,
    pub(crate) bound_requests: Vec<BoundRequest>,
    pub(crate) jobs: Vec<JobSlot>,
    unassigned_jobs: VecDeque<JobId>,
    never_assigned_job_count: usize,
    /// Oldest first.
    pub(crate) idle_sockets: VecDeque<IdleSocket>,
    pub(crate) active_socket_count: usize,
    pub(crate) generation: u64,
    pub(crate) backup_job_deadline: Option<Instant>,
}

impl Group {
    pub(crate) fn new(id: GroupId) -> Self {
        Self {
            id,
            unbound_requests: RequestQueue::new(),
            bound_requests: Vec::new(),
            jobs: Vec::new(),
            unassigned_jobs: VecDeque::new(),
            never_assigned_job_count: 0,
            idle_sockets: VecDeque::new(),
            active_socket_count: 0,
            generation: 0,
            backup_job_deadline: None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.active_socket_count == 0
            && self.idle_sockets.is_empty()
            && self.jobs.is_empty()
            && self.unbound_requests.is_empty()
            && self.bound_requests.is_empty()
    }

    /// Sockets this group holds or is working on, whatever their state.
    pub(crate) fn num_active_socket_slots(&self) -> usize {
        self.active_socket_count
            + self.jobs.len()
            + self.idle_sockets.len()
            + self.bound_requests.len()
    }

    pub(crate) fn has_available_socket_slot(&self, max_sockets_per_group: usize) -> bool {
        self.num_active_socket_slots() < max_sockets_per_group
    }

    /// Below the per-group limit with a request that has no job: the group
    /// could use one more socket if the pool had one to give.
    pub(crate) fn can_use_additional_socket_slot(&self, max_sockets_per_group: usize) -> bool {
        self.has_available_socket_slot(max_sockets_per_group)
            && self.unbound_requests.len() > self.jobs.len()
    }

    pub(crate) fn has_unbound_requests(&self) -> bool {
        !self.unbound_requests.is_empty()
    }

    pub(crate) fn unbound_request_count(&self) -> usize {
        self.unbound_requests.len()
    }

    pub(crate) fn unassigned_job_count(&self) -> usize {
        self.unassigned_jobs.len()
    }

    pub(crate) fn never_assigned_job_count(&self) -> usize {
        self.never_assigned_job_count
    }

    pub(crate) fn connect_job_count(&self) -> usize {
        self.jobs.len() + self.bound_requests.len()
    }

    pub(crate) fn top_pending_priority(&self) -> Option<Priority> {
        self.unbound_requests.first().map(|r| r.priority)
    }

    pub(crate) fn increment_generation(&mut self) {
        self.generation += 1;
    }

    // --- backup job timer ---

    /// Only one backup timer runs at a time.
    pub(crate) fn start_backup_job_timer(&mut self, deadline: Instant) {
        if self.backup_job_deadline.is_none() {
            self.backup_job_deadline = Some(deadline);
        }
    }

    pub(crate) fn backup_job_timer_is_running(&self) -> bool {
        self.backup_job_deadline.is_some()
    }

    // --- jobs ---

    /// A preconnect job nobody has claimed yet can serve this request.
    pub(crate) fn try_to_use_never_assigned_connect_job(&mut self) -> bool {
        if self.never_assigned_job_count == 0 {
            return false;
        }
        self.never_assigned_job_count -= 1;
        true
    }

    pub(crate) fn add_job(&mut self, slot: JobSlot, is_preconnect: bool) {
        if is_preconnect {
            self.never_assigned_job_count += 1;
        }
        let id = slot.id;
        self.jobs.push(slot);
        self.try_to_assign_unassigned_job(id);
        self.sanity_check();
    }

    pub(crate) fn has_unbound_job(&self, job_id: JobId) -> bool {
        self.jobs.iter().any(|slot| slot.id == job_id)
    }

    pub(crate) fn job(&self, job_id: JobId) -> Option<&JobSlot> {
        self.jobs
            .iter()
            .chain(self.bound_requests.iter().map(|bound| &bound.job))
            .find(|slot| slot.id == job_id)
    }

    pub(crate) fn job_mut(&mut self, job_id: JobId) -> Option<&mut JobSlot> {
        self.jobs
            .iter_mut()
            .chain(self.bound_requests.iter_mut().map(|bound| &mut bound.job))
            .find(|slot| slot.id == job_id)
    }

    /// The job working for `request_id`, bound or assigned.
    pub(crate) fn job_for_request(&self, request_id: RequestId) -> Option<&JobSlot> {
        if let Some(bound) = self
            .bound_requests
            .iter()
            .find(|bound| bound.request.id == request_id)
        {
            return Some(&bound.job);
        }
        let key = self.unbound_requests.key_of(request_id)?;
        let job_id = self.unbound_requests.get(key)?.job?;
        self.jobs.iter().find(|slot| slot.id == job_id)
    }

    pub(crate) fn expired_jobs(&self, now: Instant) -> Vec<JobId> {
        self.jobs
            .iter()
            .chain(self.bound_requests.iter().map(|bound| &bound.job))
            .filter(|slot| slot.is_expired(now))
            .map(|slot| slot.id)
            .collect()
    }

    pub(crate) fn next_job_deadline(&self) -> Option<Instant> {
        self.jobs
            .iter()
            .chain(self.bound_requests.iter().map(|bound| &bound.job))
            .filter_map(|slot| slot.deadline)
            .min()
    }

    /// Remove a job that is not bound to a request. If a request was using
    /// it, that request takes an unassigned job or steals one from a less
    /// urgent request.
    pub(crate) fn remove_unbound_job(&mut self, job_id: JobId) -> Option<JobSlot> {
        let position = self.jobs.iter().position(|slot| slot.id == job_id)?;

        if let Some(index) = self.unassigned_jobs.iter().position(|id| *id == job_id) {
            self.unassigned_jobs.remove(index);
        } else if let Some(key) = self.find_unbound_request_with_job(job_id) {
            self.release_job(key);
            self.try_to_assign_job_to_request(key);
        }

        Some(self.take_job(position))
    }

    /// Remove a failed job along with the request holding it, which is the
    /// only one to hear about the failure. Requests behind it keep their
    /// jobs. An unassigned job has no holder.
    pub(crate) fn remove_failed_job(
        &mut self,
        job_id: JobId,
    ) -> Option<(JobSlot, Option<Request>)> {
        let Some(key) = self.find_unbound_request_with_job(job_id) else {
            return self.remove_unbound_job(job_id).map(|slot| (slot, None));
        };
        let position = self.jobs.iter().position(|slot| slot.id == job_id)?;
        let mut holder = self.unbound_requests.remove(key)?;
        holder.job = None;
        if self.unbound_requests.is_empty() {
            self.backup_job_deadline = None;
        }
        Some((self.take_job(position), Some(holder)))
    }

    fn take_job(&mut self, position: usize) -> JobSlot {
        let slot = self.jobs.remove(position);
        if self.jobs.len() < self.never_assigned_job_count {
            self.never_assigned_job_count = self.jobs.len();
        }

        // No jobs left, so no backup job either.
        if self.jobs.is_empty() {
            debug_assert!(self.unassigned_jobs.is_empty());
            self.backup_job_deadline = None;
        }

        self.sanity_check();
        slot
    }

    /// Drop every job not bound to a request. Bound jobs keep running.
    pub(crate) fn remove_all_unbound_jobs(&mut self) -> Vec<JobSlot> {
        for request in self.unbound_requests.values_mut() {
            request.job = None;
        }
        self.unassigned_jobs.clear();
        self.never_assigned_job_count = 0;
        self.backup_job_deadline = None;
        std::mem::take(&mut self.jobs)
    }

    /// Oldest job that was started for a request rather than a preconnect.
    pub(crate) fn oldest_non_preconnect_job(&self) -> Option<JobId> {
        self.jobs
            .iter()
            .find(|slot| !slot.preconnect)
            .map(|slot| slot.id)
    }

    // --- unbound requests ---

    pub(crate) fn insert_unbound_request(&mut self, request: Request) {
        debug_assert!(request.job.is_none());
        let key = if request.respect_limits == RespectLimits::Disabled {
            // Limit-ignoring requests go ahead of everything at max priority.
            self.unbound_requests.insert_at_front(request)
        } else {
            self.unbound_requests.insert(request)
        };
        self.try_to_assign_job_to_request(key);
        self.sanity_check();
    }

    pub(crate) fn next_unbound_request(&self) -> Option<&Request> {
        self.unbound_requests.first()
    }

    pub(crate) fn has_unbound_request(&self, request_id: RequestId) -> bool {
        self.unbound_requests.key_of(request_id).is_some()
    }

    pub(crate) fn pop_next_unbound_request(&mut self) -> Option<Request> {
        let key = self.unbound_requests.first_key()?;
        self.remove_unbound_request(key)
    }

    pub(crate) fn find_and_remove_unbound_request(
        &mut self,
        request_id: RequestId,
    ) -> Option<Request> {
        let key = self.unbound_requests.key_of(request_id)?;
        self.remove_unbound_request(key)
    }

    fn remove_unbound_request(&mut self, key: QueueKey) -> Option<Request> {
        let mut request = self.unbound_requests.remove(key)?;
        if let Some(job_id) = request.job.take() {
            self.try_to_assign_unassigned_job(job_id);
        }
        // Nobody left to wait for a backup job.
        if self.unbound_requests.is_empty() {
            self.backup_job_deadline = None;
        }
        self.sanity_check();
        Some(request)
    }

    /// Move a request to its new priority, stealing a job on the way if it
    /// now outranks a request holding one. Returns false if the request is
    /// unknown to this group.
    pub(crate) fn set_priority(&mut self, request_id: RequestId, priority: Priority) -> bool {
        if let Some(key) = self.unbound_requests.key_of(request_id) {
            let unchanged = self.unbound_requests.get(key).is_some_and(|request| {
                request.priority == priority || request.respect_limits == RespectLimits::Disabled
            });
            if unchanged {
                return true;
            }
            if let Some(mut request) = self.remove_unbound_request(key) {
                request.priority = priority;
                self.insert_unbound_request(request);
            }
            return true;
        }

        if let Some(bound) = self
            .bound_requests
            .iter_mut()
            .find(|bound| bound.request.id == request_id)
        {
            bound.request.priority = priority;
            bound.job.set_priority(priority);
            return true;
        }
        false
    }

    // --- bound requests ---

    /// Bind `job_id` to a request for an auth round. A job already bound
    /// keeps its request; otherwise the most urgent waiting request takes it,
    /// provided it can answer auth challenges. Returns that request's auth
    /// callback.
    pub(crate) fn bind_request_to_connect_job(&mut self, job_id: JobId) -> Option<AuthCallback> {
        if let Some(bound) = self.bound_requests.iter_mut().find(|b| b.job.id == job_id) {
            bound.job.suspend_deadline();
            return bound.request.auth_callback.clone();
        }

        if !self.has_unbound_job(job_id) {
            return None;
        }
        let callback = self.next_unbound_request()?.auth_callback.clone()?;

        let request = self.pop_next_unbound_request()?;
        let mut job = self.remove_unbound_job(job_id)?;
        job.suspend_deadline();
        trace!(
            group = %self.id,
            job = %job.id,
            request = %request.id,
            "bound request to connect job"
        );
        self.bound_requests.push(BoundRequest {
            job,
            request,
            generation: self.generation,
            pending_error: None,
        });
        Some(callback)
    }

    pub(crate) fn find_and_remove_bound_request_for_job(
        &mut self,
        job_id: JobId,
    ) -> Option<BoundRequest> {
        let index = self
            .bound_requests
            .iter()
            .position(|bound| bound.job.id == job_id)?;
        Some(self.bound_requests.remove(index))
    }

    pub(crate) fn find_and_remove_bound_request(
        &mut self,
        request_id: RequestId,
    ) -> Option<BoundRequest> {
        let index = self
            .bound_requests
            .iter()
            .position(|bound| bound.request.id == request_id)?;
        Some(self.bound_requests.remove(index))
    }

    /// Earlier errors take precedence.
    pub(crate) fn set_pending_error_for_all_bound_requests(&mut self, error: &PoolError) {
        for bound in &mut self.bound_requests {
            if bound.pending_error.is_none() {
                bound.pending_error = Some(error.clone());
            }
        }
    }

    // --- sockets ---

    pub(crate) fn hand_out_socket(
        &mut self,
        socket: Box<dyn StreamSocket>,
        reuse_type: SocketReuseType,
        idle_time: Duration,
        events: &EventSender,
    ) -> PooledSocket {
        self.active_socket_count += 1;
        PooledSocket::new(
            socket,
            self.id.clone(),
            self.generation,
            reuse_type,
            idle_time,
            events.clone(),
        )
    }

    pub(crate) fn add_idle_socket(&mut self, socket: Box<dyn StreamSocket>, now: Instant) {
        self.idle_sockets.push_back(IdleSocket {
            socket,
            since: now,
            generation: self.generation,
        });
    }

    /// Pick an idle socket for a request: the most recently returned socket
    /// that carried traffic before, else the oldest never-used one. Unusable
    /// sockets met on the way are closed.
    pub(crate) fn take_idle_socket(&mut self, now: Instant) -> Option<(IdleSocket, Duration)> {
        let generation = self.generation;
        let id = &self.id;
        self.idle_sockets
            .retain(|idle| match idle.check_usable(generation) {
                Ok(()) => true,
                Err(reason) => {
                    debug!(group = %id, reason, "closing unusable idle socket");
                    false
                }
            });

        let index = self
            .idle_sockets
            .iter()
            .rposition(|idle| idle.socket.was_ever_used())
            .or(if self.idle_sockets.is_empty() {
                None
            } else {
                Some(0)
            })?;
        let idle = self.idle_sockets.remove(index)?;
        let idle_time = now.saturating_duration_since(idle.since);
        Some((idle, idle_time))
    }

    /// Close idle sockets that timed out or went bad; with `force`, close
    /// them all. Returns how many were closed.
    pub(crate) fn cleanup_idle_sockets(
        &mut self,
        force: Option<&'static str>,
        now: Instant,
        used_timeout: Duration,
        unused_timeout: Duration,
    ) -> usize {
        let generation = self.generation;
        let id = &self.id;
        let before = self.idle_sockets.len();
        self.idle_sockets.retain(|idle| {
            let mut reason = force;
            let timeout = if idle.socket.was_ever_used() {
                used_timeout
            } else {
                unused_timeout
            };
            // Timeouts take precedence over the flush reason.
            if now.saturating_duration_since(idle.since) >= timeout {
                reason = Some(IDLE_TIME_LIMIT_EXPIRED);
            }
            // Usability problems take precedence over everything.
            if let Err(unusable) = idle.check_usable(generation) {
                reason = Some(unusable);
            }
            match reason {
                Some(reason) => {
                    debug!(group = %id, reason, "closing idle socket");
                    false
                }
                None => true,
            }
        });
        before - self.idle_sockets.len()
    }

    /// Drop the oldest idle socket, if any.
    pub(crate) fn close_oldest_idle_socket(&mut self) -> bool {
        self.idle_sockets.pop_front().is_some()
    }

    // --- job assignment ---

    fn find_unbound_request_with_job(&self, job_id: JobId) -> Option<QueueKey> {
        self.unbound_requests
            .iter()
            .take_while(|(_, request)| request.job.is_some())
            .find(|(_, request)| request.job == Some(job_id))
            .map(|(key, _)| key)
    }

    fn first_request_without_job(&self) -> Option<QueueKey> {
        self.unbound_requests
            .iter()
            .find(|(_, request)| request.job.is_none())
            .map(|(key, _)| key)
    }

    fn request_has_job(&self, key: QueueKey) -> bool {
        self.unbound_requests
            .get(key)
            .is_some_and(|request| request.job.is_some())
    }

    fn assign_job(&mut self, key: QueueKey, job_id: JobId) {
        let Some(request) = self.unbound_requests.get_mut(key) else {
            return;
        };
        debug_assert!(request.job.is_none());
        request.job = Some(job_id);
        let priority = request.priority;
        if let Some(slot) = self.jobs.iter_mut().find(|slot| slot.id == job_id) {
            slot.set_priority(priority);
        }
    }

    fn release_job(&mut self, key: QueueKey) -> Option<JobId> {
        self.unbound_requests.get_mut(key)?.job.take()
    }

    /// Offer a free job to the first request without one; otherwise it stays
    /// unassigned.
    fn try_to_assign_unassigned_job(&mut self, job_id: JobId) {
        self.unassigned_jobs.push_back(job_id);
        if let Some(key) = self.first_request_without_job() {
            if let Some(job_id) = self.unassigned_jobs.pop_back() {
                self.assign_job(key, job_id);
            }
        }
    }

    /// Give the request at `key` a job: an unassigned one if available,
    /// else the job of the least urgent request behind it that has one.
    fn try_to_assign_job_to_request(&mut self, key: QueueKey) {
        debug_assert!(!self.request_has_job(key));
        if let Some(job_id) = self.unassigned_jobs.pop_front() {
            self.assign_job(key, job_id);
            return;
        }

        // If the next request has no job, nobody behind us has one either.
        let Some(mut victim) = self.unbound_requests.next_key_after(key) else {
            return;
        };
        if !self.request_has_job(victim) {
            return;
        }
        while let Some(next) = self.unbound_requests.next_key_after(victim) {
            if !self.request_has_job(next) {
                break;
            }
            victim = next;
        }

        if let Some(job_id) = self.release_job(victim) {
            trace!(group = %self.id, job = %job_id, "reassigning job to more urgent request");
            self.assign_job(key, job_id);
        }
    }

    fn sanity_check(&self) {
        #[cfg(debug_assertions)]
        {
            debug_assert!(self.never_assigned_job_count <= self.jobs.len());
            debug_assert!(self.unassigned_jobs.len() <= self.jobs.len());
            debug_assert_eq!(
                self.unassigned_jobs.is_empty(),
                self.jobs.len() <= self.unbound_requests.len()
            );
            let assigned = self.jobs.len() - self.unassigned_jobs.len();
            for (index, (_, request)) in self.unbound_requests.iter().enumerate() {
                debug_assert_eq!(request.job.is_some(), index < assigned);
                if let Some(job_id) = request.job {
                    debug_assert!(!self.unassigned_jobs.contains(&job_id));
                    debug_assert!(self.has_unbound_job(job_id));
                }
            }
        }
    }
}
