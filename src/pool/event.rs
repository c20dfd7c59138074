use super::connect_job::AuthRequest;
use super::socket::StreamSocket;
use super::types::{GroupId, JobId, RequestId};
use crate::utils::error::PoolError;
use tokio::sync::mpsc;

pub(crate) type EventSender = mpsc::UnboundedSender<PoolEvent>;
pub(crate) type EventReceiver = mpsc::UnboundedReceiver<PoolEvent>;

/// Everything that reaches the pool from outside its own call stack.
///
/// Connect jobs, handles and pooled sockets never call into the pool
/// directly; they post one of these and the pool applies it on its own
/// sequence.
#[derive(Debug)]
pub enum PoolEvent {
    JobComplete {
        group_id: GroupId,
        job_id: JobId,
        result: Result<Box<dyn StreamSocket>, PoolError>,
    },
    JobNeedsInput {
        group_id: GroupId,
        job_id: JobId,
        request: AuthRequest,
    },
    JobResumed {
        group_id: GroupId,
        job_id: JobId,
    },
    SocketReleased {
        group_id: GroupId,
        socket: Box<dyn StreamSocket>,
        generation: u64,
    },
    RequestCancelled {
        group_id: GroupId,
        request_id: RequestId,
    },
}
