use super::types::Priority;
use serde::Serialize;
use std::collections::BTreeMap;

/// Snapshot of the pool, keyed by group for stable output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub handed_out_socket_count: usize,
    pub connecting_socket_count: usize,
    pub idle_socket_count: usize,
    pub max_socket_count: usize,
    pub max_sockets_per_group: usize,
    pub is_stalled: bool,
    pub groups: BTreeMap<String, GroupStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupStats {
    /// Requests waiting in the queue.
    pub pending_request_count: usize,
    /// Requests bound to a job for an auth round.
    pub bound_request_count: usize,
    pub active_socket_count: usize,
    pub idle_socket_count: usize,
    pub connect_job_count: usize,
    pub unassigned_job_count: usize,
    pub never_assigned_job_count: usize,
    /// Could use another socket if the pool had one.
    pub is_stalled: bool,
    pub backup_job_timer_is_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_pending_priority: Option<Priority>,
    pub generation: u64,
}

impl PoolStats {
    /// Total sockets the pool accounts for.
    pub fn total_socket_count(&self) -> usize {
        self.handed_out_socket_count + self.connecting_socket_count + self.idle_socket_count
    }
}
