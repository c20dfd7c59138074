use crate::utils::error::PoolError;
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec,
    TextEncoder,
};

lazy_static! {
    pub static ref CONNECT_JOBS_STARTED: IntCounterVec = register_int_counter_vec!(
        "connpool_connect_jobs_started_total",
        "Connect jobs started, by origin (normal, preconnect, backup)",
        &["origin"]
    )
    .expect("register connpool_connect_jobs_started_total counter vec");
    pub static ref CONNECT_JOB_FAILURES: IntCounterVec = register_int_counter_vec!(
        "connpool_connect_job_failures_total",
        "Connect jobs that finished with an error, by error class",
        &["error"]
    )
    .expect("register connpool_connect_job_failures_total counter vec");
    pub static ref IDLE_SOCKETS_REUSED: IntCounter = register_int_counter!(
        "connpool_idle_sockets_reused_total",
        "Requests served from the idle socket list"
    )
    .expect("register connpool_idle_sockets_reused_total counter");
    pub static ref IDLE_SOCKETS_CLOSED: IntCounterVec = register_int_counter_vec!(
        "connpool_sockets_closed_total",
        "Idle or returned sockets closed by the pool, by reason",
        &["reason"]
    )
    .expect("register connpool_sockets_closed_total counter vec");
}

#[derive(Debug, Clone, Copy)]
pub struct PoolMetrics;

impl PoolMetrics {
    #[inline]
    pub fn record_job_started(origin: &str) {
        CONNECT_JOBS_STARTED.with_label_values(&[origin]).inc();
    }

    #[inline]
    pub fn record_job_failed(error: &PoolError) {
        CONNECT_JOB_FAILURES
            .with_label_values(&[error_class(error)])
            .inc();
    }

    #[inline]
    pub fn record_idle_reused() {
        IDLE_SOCKETS_REUSED.inc();
    }

    #[inline]
    pub fn record_idle_closed(reason: &str) {
        IDLE_SOCKETS_CLOSED.with_label_values(&[reason]).inc();
    }

    #[inline]
    pub fn record_idle_closed_n(reason: &str, count: usize) {
        if count > 0 {
            IDLE_SOCKETS_CLOSED
                .with_label_values(&[reason])
                .inc_by(count as u64);
        }
    }
}

fn error_class(error: &PoolError) -> &'static str {
    match error {
        PoolError::ConnectionFailed { .. } => "connection_failed",
        PoolError::CertificateError(_) => "certificate",
        PoolError::AuthRequested(_) => "auth_requested",
        PoolError::Timeout => "timeout",
        PoolError::NotConnected => "not_connected",
        PoolError::NetworkChanged => "network_changed",
        PoolError::Aborted => "aborted",
        PoolError::Config(_) => "config",
    }
}

#[inline]
pub fn init() {
    lazy_static::initialize(&CONNECT_JOBS_STARTED);
    lazy_static::initialize(&CONNECT_JOB_FAILURES);
    lazy_static::initialize(&IDLE_SOCKETS_REUSED);
    lazy_static::initialize(&IDLE_SOCKETS_CLOSED);
}

/// Everything registered in the default registry, in the text exposition
/// format.
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
