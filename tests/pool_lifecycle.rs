//! Pool-wide lifecycle tests: refresh, flush, timers, backup jobs, layered
//! pools and auth challenges.
mod common;

use common::{group, secure_group, settings, Harness, JobKind};
use connpool::pool::{
    AuthRequest, ClientSocketHandle, Clock, HigherLayeredPool, HostPortPair, InitOptions,
    LoadState, PoolSettings, PooledSocket, Priority, SocketParams, MIN_TIMER_PERIOD,
    REFRESHED_BY_CALLER,
};
use connpool::PoolError;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok};

fn with_connect_timeout(timeout: Duration) -> PoolSettings {
    PoolSettings {
        connect_timeout: timeout,
        ..settings(10, 2)
    }
}

fn with_backup_jobs() -> PoolSettings {
    PoolSettings {
        backup_jobs_enabled: true,
        backup_job_delay: Duration::from_millis(250),
        ..settings(10, 4)
    }
}

fn auth_options() -> (InitOptions, mpsc::UnboundedReceiver<AuthRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let options = InitOptions {
        auth_callback: Some(tx),
        ..InitOptions::default()
    };
    (options, rx)
}

/// Hands out a socket and returns its handle.
fn connected(h: &mut Harness, group_id: &connpool::GroupId) -> ClientSocketHandle {
    let mut handle = ClientSocketHandle::new();
    assert_pending!(handle.init(&mut h.pool, group_id.clone(), Priority::Medium));
    h.factory.last_job().succeed().unwrap();
    h.pool.process_events();
    assert_ready_ok!(handle.try_complete());
    handle
}

// --- refresh ---

#[test]
fn refresh_makes_handed_out_sockets_stale() {
    let mut h = Harness::new(settings(10, 2), JobKind::Pending);
    let a = group("a");
    let mut handle = connected(&mut h, &a);
    assert_eq!(handle.pooled_socket().unwrap().generation(), 0);

    assert_eq!(h.pool.refresh_groups(|_| true, REFRESHED_BY_CALLER), 1);
    assert_eq!(h.pool.group_generation(&a), Some(1));

    handle.reset(&mut h.pool);
    assert_eq!(h.pool.idle_socket_count(), 0);
    assert!(!h.pool.has_group(&a));
}

#[test]
fn refresh_closes_idle_sockets_of_matching_groups_only() {
    let mut h = Harness::new(settings(10, 2), JobKind::Pending);
    let (a, b) = (group("a"), group("b"));
    connected(&mut h, &a).reset(&mut h.pool);
    connected(&mut h, &b).reset(&mut h.pool);
    assert_eq!(h.pool.idle_socket_count(), 2);

    assert_eq!(h.pool.refresh_groups(|id| *id == a, REFRESHED_BY_CALLER), 1);
    assert_eq!(h.pool.idle_socket_count_in_group(&a), 0);
    assert_eq!(h.pool.idle_socket_count_in_group(&b), 1);
}

#[test]
fn refresh_restarts_jobs_without_failing_requests() {
    let mut h = Harness::new(settings(10, 2), JobKind::Pending);
    let a = group("a");
    let mut handle = ClientSocketHandle::new();
    assert_pending!(handle.init(&mut h.pool, a.clone(), Priority::Medium));

    h.pool.refresh_groups(|_| true, REFRESHED_BY_CALLER);
    assert!(h.factory.job(0).is_cancelled());
    assert_eq!(h.factory.job_count(), 2);
    assert_pending!(handle.try_complete());
    assert!(h.pool.request_has_job(&a, handle.request_id().unwrap()));

    // A result from the cancelled job goes nowhere.
    h.factory.job(0).succeed();
    h.pool.process_events();
    assert_pending!(handle.try_complete());

    h.factory.job(1).succeed().unwrap();
    h.pool.process_events();
    assert_ready_ok!(handle.try_complete());
    assert_eq!(handle.pooled_socket().unwrap().generation(), 1);
}

#[test]
fn tls_change_for_servers_refreshes_only_their_secure_groups() {
    let mut h = Harness::new(settings(10, 2), JobKind::Pending);
    let secure = secure_group("a");
    let plain = group("a");
    let mut secure_handle = connected(&mut h, &secure);
    let mut plain_handle = connected(&mut h, &plain);

    let servers: HashSet<HostPortPair> = [HostPortPair::new("a", 443)].into_iter().collect();
    h.pool.on_ssl_config_for_servers_changed(&servers);
    assert_eq!(h.pool.group_generation(&secure), Some(1));
    assert_eq!(h.pool.group_generation(&plain), Some(0));

    secure_handle.reset(&mut h.pool);
    plain_handle.reset(&mut h.pool);
    assert_eq!(h.pool.idle_socket_count_in_group(&secure), 0);
    assert_eq!(h.pool.idle_socket_count_in_group(&plain), 1);

    h.pool.on_ssl_config_changed();
    assert_eq!(h.pool.idle_socket_count(), 0);
}

// --- flush ---

#[test]
fn flush_fails_waiting_requests_and_spares_sockets() {
    let mut h = Harness::new(settings(10, 4), JobKind::Pending);
    let (a, b) = (group("a"), group("b"));
    let mut held = connected(&mut h, &a);
    connected(&mut h, &b).reset(&mut h.pool);
    let mut waiting = ClientSocketHandle::new();
    assert_pending!(waiting.init(&mut h.pool, a.clone(), Priority::Medium));

    h.pool.flush_with_error(PoolError::NetworkChanged);
    let err = assert_ready_err!(waiting.try_complete());
    assert!(matches!(err, PoolError::NetworkChanged));
    assert!(h.factory.last_job().is_cancelled());
    assert_eq!(h.pool.connecting_socket_count(), 0);
    assert_eq!(h.pool.idle_socket_count(), 1);
    assert!(held.is_initialized());

    held.reset(&mut h.pool);
    assert_eq!(h.pool.idle_socket_count(), 2);
}

#[test]
fn network_change_discards_everything_reusable() {
    let mut h = Harness::new(settings(10, 4), JobKind::Pending);
    let (a, b, c) = (group("a"), group("b"), group("c"));
    let mut held = connected(&mut h, &b);
    connected(&mut h, &c).reset(&mut h.pool);
    let mut waiting = ClientSocketHandle::new();
    assert_pending!(waiting.init(&mut h.pool, a.clone(), Priority::Medium));

    h.pool.on_ip_address_changed();
    assert!(matches!(
        assert_ready_err!(waiting.try_complete()),
        PoolError::NetworkChanged
    ));
    assert_eq!(h.pool.idle_socket_count(), 0);

    held.reset(&mut h.pool);
    assert_eq!(h.pool.idle_socket_count(), 0);
    assert_eq!(h.pool.group_count(), 0);
}

#[test]
fn shutdown_aborts_requests_and_closes_idle_sockets() {
    let mut h = Harness::new(settings(10, 4), JobKind::Pending);
    connected(&mut h, &group("a")).reset(&mut h.pool);
    let mut waiting = ClientSocketHandle::new();
    assert_pending!(waiting.init(&mut h.pool, group("b"), Priority::Medium));

    h.pool.shutdown();
    assert!(matches!(
        assert_ready_err!(waiting.try_complete()),
        PoolError::Aborted
    ));
    assert_eq!(h.pool.idle_socket_count(), 0);
    assert_eq!(h.pool.group_count(), 0);
}

// --- connect timeouts ---

#[test]
fn slow_job_times_out() {
    let mut h = Harness::new(with_connect_timeout(Duration::from_secs(5)), JobKind::Pending);
    let a = group("a");
    let mut handle = ClientSocketHandle::new();
    assert_pending!(handle.init(&mut h.pool, a.clone(), Priority::Medium));

    h.advance(Duration::from_secs(4));
    assert_pending!(handle.try_complete());

    h.advance(Duration::from_secs(1));
    assert!(matches!(
        assert_ready_err!(handle.try_complete()),
        PoolError::Timeout
    ));
    assert!(h.factory.job(0).is_cancelled());
    assert!(!h.pool.has_group(&a));
}

#[test]
fn timeout_fails_only_the_request_holding_the_job() {
    let mut h = Harness::new(with_connect_timeout(Duration::from_secs(60)), JobKind::Pending);
    let a = group("a");
    let mut high = ClientSocketHandle::new();
    let mut low = ClientSocketHandle::new();
    assert_pending!(high.init(&mut h.pool, a.clone(), Priority::Highest));
    h.factory.set_job_timeout(Some(Duration::from_secs(5)));
    assert_pending!(low.init(&mut h.pool, a.clone(), Priority::Low));

    h.advance(Duration::from_secs(5));
    assert!(matches!(
        assert_ready_err!(low.try_complete()),
        PoolError::Timeout
    ));
    assert_pending!(high.try_complete());
    assert!(h.factory.job(1).is_cancelled());
    assert!(!h.factory.job(0).is_cancelled());
    assert!(h.pool.request_has_job(&a, high.request_id().unwrap()));
}

#[test]
fn zero_job_timeout_disables_deadline() {
    let mut h = Harness::new(with_connect_timeout(Duration::from_secs(5)), JobKind::Pending);
    h.factory.set_job_timeout(Some(Duration::ZERO));
    let mut handle = ClientSocketHandle::new();
    assert_pending!(handle.init(&mut h.pool, group("a"), Priority::Medium));
    assert!(h.pool.next_timer_deadline().is_none());

    h.advance(Duration::from_secs(1000));
    assert_pending!(handle.try_complete());
}

#[test]
fn deadline_pauses_while_waiting_for_credentials() {
    let mut h = Harness::new(with_connect_timeout(Duration::from_secs(5)), JobKind::Pending);
    h.factory.queue(&[JobKind::NeedsAuth]);
    let (options, mut auth_rx) = auth_options();
    let mut handle = ClientSocketHandle::new();
    assert_pending!(handle.init_with(&mut h.pool, group("a"), Priority::Medium, options));
    h.pool.process_events();
    let auth = auth_rx.try_recv().unwrap();

    h.advance(Duration::from_secs(60));
    assert_pending!(handle.try_complete());

    auth.resume.resume();
    h.pool.process_events();
    assert!(h.factory.job(0).was_restarted());
    h.advance(Duration::from_secs(5));
    assert!(matches!(
        assert_ready_err!(handle.try_complete()),
        PoolError::Timeout
    ));
}

// --- backup jobs ---

#[test]
fn backup_job_starts_after_delay_and_wins() {
    let mut h = Harness::new(with_backup_jobs(), JobKind::Pending);
    let a = group("a");
    let mut handle = ClientSocketHandle::new();
    assert_pending!(handle.init(&mut h.pool, a.clone(), Priority::Medium));
    assert!(h.pool.backup_job_timer_is_running(&a));

    h.advance(Duration::from_millis(249));
    assert_eq!(h.factory.job_count(), 1);

    h.advance(Duration::from_millis(1));
    assert_eq!(h.factory.job_count(), 2);
    assert_eq!(h.pool.connect_job_count_in_group(&a), 2);
    assert_eq!(h.pool.unassigned_job_count_in_group(&a), 1);
    assert!(!h.pool.backup_job_timer_is_running(&a));

    h.factory.job(1).succeed().unwrap();
    h.pool.process_events();
    assert_ready_ok!(handle.try_complete());

    // The original attempt keeps going and ends up idle.
    assert_eq!(h.pool.connect_job_count_in_group(&a), 1);
    h.factory.job(0).succeed().unwrap();
    h.pool.process_events();
    assert_eq!(h.pool.idle_socket_count_in_group(&a), 1);
}

#[test]
fn backup_timer_waits_out_host_resolution() {
    let mut h = Harness::new(with_backup_jobs(), JobKind::PendingResolving);
    let a = group("a");
    let mut handle = ClientSocketHandle::new();
    assert_pending!(handle.init(&mut h.pool, a.clone(), Priority::Medium));
    assert_eq!(handle.load_state(&h.pool), LoadState::ResolvingHost);

    h.advance(Duration::from_millis(250));
    assert_eq!(h.factory.job_count(), 1);
    assert!(h.pool.backup_job_timer_is_running(&a));

    h.factory.job(0).set_load_state(LoadState::Connecting);
    h.advance(Duration::from_millis(250));
    assert_eq!(h.factory.job_count(), 2);
}

#[test]
fn no_backup_job_once_connection_is_established() {
    let mut h = Harness::new(with_backup_jobs(), JobKind::Pending);
    let a = group("a");
    let mut handle = ClientSocketHandle::new();
    assert_pending!(handle.init(&mut h.pool, a.clone(), Priority::Medium));
    h.factory.job(0).set_established();

    h.advance(Duration::from_millis(250));
    assert_eq!(h.factory.job_count(), 1);
    assert!(!h.pool.backup_job_timer_is_running(&a));
}

#[test]
fn backup_timer_stops_with_last_request() {
    let mut h = Harness::new(with_backup_jobs(), JobKind::Pending);
    let a = group("a");
    let mut handle = ClientSocketHandle::new();
    assert_pending!(handle.init(&mut h.pool, a.clone(), Priority::Medium));
    handle.reset(&mut h.pool);

    assert!(!h.pool.backup_job_timer_is_running(&a));
    h.advance(Duration::from_secs(1));
    assert_eq!(h.factory.job_count(), 1);
}

#[test]
fn zero_backup_delay_rearms_in_the_future() {
    let settings = PoolSettings {
        backup_job_delay: Duration::ZERO,
        ..with_backup_jobs()
    };
    let mut h = Harness::new(settings, JobKind::PendingResolving);
    assert_eq!(h.pool.settings().backup_job_delay, MIN_TIMER_PERIOD);
    let a = group("a");
    let mut handle = ClientSocketHandle::new();
    assert_pending!(handle.init(&mut h.pool, a.clone(), Priority::Medium));

    for _ in 0..3 {
        h.advance(MIN_TIMER_PERIOD);
        assert!(h.pool.backup_job_timer_is_running(&a));
        assert!(h.pool.next_timer_deadline().unwrap() > h.clock.now());
    }
    assert_eq!(h.factory.job_count(), 1);
}

// --- idle sockets ---

#[test]
fn unused_idle_socket_expires() {
    let mut h = Harness::new(settings(10, 2), JobKind::Pending);
    let a = group("a");
    connected(&mut h, &a).reset(&mut h.pool);
    assert_eq!(h.pool.idle_socket_count(), 1);
    assert!(h.pool.next_timer_deadline().is_some());

    h.advance(Duration::from_secs(9));
    assert_eq!(h.pool.idle_socket_count(), 1);
    h.advance(Duration::from_secs(1));
    assert_eq!(h.pool.idle_socket_count(), 0);
    assert!(!h.pool.has_group(&a));
}

#[test]
fn zero_sweep_interval_is_clamped() {
    let settings = PoolSettings {
        cleanup_interval: Duration::ZERO,
        ..settings(10, 2)
    };
    let mut h = Harness::new(settings, JobKind::SucceedSync);
    assert_eq!(h.pool.settings().cleanup_interval, MIN_TIMER_PERIOD);
    let a = group("a");
    assert_eq!(h.pool.preconnect(&a, SocketParams::default(), 1).unwrap(), 1);

    for _ in 0..3 {
        h.advance(MIN_TIMER_PERIOD);
        assert!(h.pool.next_timer_deadline().unwrap() > h.clock.now());
    }
    assert_eq!(h.pool.idle_socket_count_in_group(&a), 1);
}

#[test]
fn used_idle_socket_lives_longer() {
    let mut h = Harness::new(settings(10, 2), JobKind::Pending);
    let a = group("a");
    let mut handle = ClientSocketHandle::new();
    assert_pending!(handle.init(&mut h.pool, a.clone(), Priority::Medium));
    let socket = h.factory.job(0).succeed().unwrap();
    h.pool.process_events();
    assert_ready_ok!(handle.try_complete());
    socket.mark_used();
    handle.reset(&mut h.pool);

    h.advance(Duration::from_secs(290));
    assert_eq!(h.pool.idle_socket_count(), 1);
    h.advance(Duration::from_secs(10));
    assert_eq!(h.pool.idle_socket_count(), 0);
}

#[test]
fn dead_idle_socket_is_skipped() {
    let mut h = Harness::new(settings(10, 2), JobKind::Pending);
    let a = group("a");
    let mut handle = ClientSocketHandle::new();
    assert_pending!(handle.init(&mut h.pool, a.clone(), Priority::Medium));
    let socket = h.factory.job(0).succeed().unwrap();
    h.pool.process_events();
    assert_ready_ok!(handle.try_complete());
    handle.reset(&mut h.pool);
    socket.disconnect();

    assert_pending!(handle.init(&mut h.pool, a.clone(), Priority::Medium));
    assert_eq!(h.factory.job_count(), 2);
    assert_eq!(h.pool.idle_socket_count(), 0);
}

#[test]
fn close_idle_sockets_on_demand() {
    let mut h = Harness::new(settings(10, 2), JobKind::Pending);
    let (a, b) = (group("a"), group("b"));
    connected(&mut h, &a).reset(&mut h.pool);
    connected(&mut h, &b).reset(&mut h.pool);

    h.pool.close_idle_sockets_in_group(&a, connpool::pool::CLOSED_BY_CALLER);
    assert_eq!(h.pool.idle_socket_count(), 1);
    h.pool.close_idle_sockets(connpool::pool::CLOSED_BY_CALLER);
    assert_eq!(h.pool.idle_socket_count(), 0);
    assert_eq!(h.pool.group_count(), 0);
}

// --- layered pools ---

#[derive(Debug, Default)]
struct IdleHolder {
    sockets: Mutex<Vec<PooledSocket>>,
}

impl HigherLayeredPool for IdleHolder {
    fn close_one_idle_connection(&self) -> bool {
        self.sockets.lock().unwrap().pop().is_some()
    }
}

#[test]
fn stalled_pool_asks_higher_layer_for_a_socket() {
    let mut h = Harness::new(settings(1, 1), JobKind::Pending);
    let (a, b) = (group("a"), group("b"));
    let holder = Arc::new(IdleHolder::default());
    let layered = h.pool.register_layered_pool(holder.clone());

    let mut first = connected(&mut h, &a);
    holder.sockets.lock().unwrap().push(first.take_socket().unwrap());

    let mut waiting = ClientSocketHandle::new();
    assert_pending!(waiting.init(&mut h.pool, b.clone(), Priority::Medium));
    assert!(h.pool.is_stalled());

    h.pool.process_events();
    assert!(holder.sockets.lock().unwrap().is_empty());
    assert_eq!(h.factory.job_count(), 2);
    assert!(h.pool.request_has_job(&b, waiting.request_id().unwrap()));
    assert!(!h.pool.has_group(&a));

    assert!(h.pool.unregister_layered_pool(layered));
    assert!(!h.pool.unregister_layered_pool(layered));
}

// --- auth challenges ---

#[test]
fn suspended_job_is_not_preempted_and_resumes_once() {
    let mut h = Harness::new(settings(10, 2), JobKind::Pending);
    let a = group("a");
    h.factory.queue(&[JobKind::NeedsAuth]);
    let (options, mut auth_rx) = auth_options();
    let mut first = ClientSocketHandle::new();
    assert_pending!(first.init_with(&mut h.pool, a.clone(), Priority::Low, options));
    h.pool.process_events();
    let auth = auth_rx.try_recv().unwrap();
    assert_eq!(auth.challenge.realm.as_deref(), Some("test"));

    let mut urgent = ClientSocketHandle::new();
    assert_pending!(urgent.init(&mut h.pool, a.clone(), Priority::Highest));
    assert_eq!(h.factory.job_count(), 2);
    assert!(!h.factory.job(0).is_cancelled());
    assert_eq!(h.factory.job(0).priority(), Some(Priority::Low));
    assert!(h.pool.request_has_job(&a, first.request_id().unwrap()));
    assert!(h.pool.request_has_job(&a, urgent.request_id().unwrap()));

    auth.resume.resume();
    h.pool.process_events();
    assert!(h.factory.job(0).was_restarted());
    assert!(auth_rx.try_recv().is_err());

    // One more round, routed to the same request.
    h.factory.job(0).challenge();
    h.pool.process_events();
    auth_rx.try_recv().unwrap().resume.resume();
    h.pool.process_events();

    h.factory.job(0).succeed().unwrap();
    h.pool.process_events();
    assert_ready_ok!(first.try_complete());
    assert_pending!(urgent.try_complete());
}

#[test]
fn overlapping_challenges_fail_the_request() {
    let mut h = Harness::new(settings(10, 2), JobKind::Pending);
    h.factory.queue(&[JobKind::NeedsAuth]);
    let (options, _auth_rx) = auth_options();
    let mut handle = ClientSocketHandle::new();
    assert_pending!(handle.init_with(&mut h.pool, group("a"), Priority::Medium, options));
    h.factory.job(0).challenge();

    h.pool.process_events();
    assert!(matches!(
        assert_ready_err!(handle.try_complete()),
        PoolError::ConnectionFailed { .. }
    ));
    assert!(h.factory.job(0).is_cancelled());
}

#[test]
fn challenge_without_listener_fails_with_auth_details() {
    let mut h = Harness::new(settings(10, 2), JobKind::Pending);
    h.factory.queue(&[JobKind::NeedsAuth]);
    let mut handle = ClientSocketHandle::new();
    assert_pending!(handle.init(&mut h.pool, group("a"), Priority::Medium));

    h.pool.process_events();
    let err = assert_ready_err!(handle.try_complete());
    assert!(matches!(err, PoolError::AuthRequested(_)));
    assert!(err.has_additional_state());
    assert!(handle.error_details().is_some());
}

#[test]
fn flushed_bound_request_fails_when_its_job_finishes() {
    let mut h = Harness::new(settings(10, 2), JobKind::Pending);
    h.factory.queue(&[JobKind::NeedsAuth]);
    let (options, _auth_rx) = auth_options();
    let mut handle = ClientSocketHandle::new();
    assert_pending!(handle.init_with(&mut h.pool, group("a"), Priority::Medium, options));
    h.pool.process_events();

    h.pool.flush_with_error(PoolError::Aborted);
    assert!(!h.factory.job(0).is_cancelled());
    assert_pending!(handle.try_complete());

    h.factory.job(0).succeed().unwrap();
    h.pool.process_events();
    assert!(matches!(
        assert_ready_err!(handle.try_complete()),
        PoolError::Aborted
    ));
}

#[test]
fn refreshed_bound_request_starts_over() {
    let mut h = Harness::new(settings(10, 2), JobKind::Pending);
    let a = group("a");
    h.factory.queue(&[JobKind::NeedsAuth]);
    let (options, _auth_rx) = auth_options();
    let mut handle = ClientSocketHandle::new();
    assert_pending!(handle.init_with(&mut h.pool, a.clone(), Priority::Medium, options));
    h.pool.process_events();

    h.pool.refresh_groups(|_| true, REFRESHED_BY_CALLER);
    assert!(!h.factory.job(0).is_cancelled());

    h.factory.job(0).succeed().unwrap();
    h.pool.process_events();
    assert_pending!(handle.try_complete());
    assert_eq!(h.factory.job_count(), 2);
    assert!(h.pool.request_has_job(&a, handle.request_id().unwrap()));

    h.factory.job(1).succeed().unwrap();
    h.pool.process_events();
    assert_ready_ok!(handle.try_complete());
}

#[test]
fn cancelling_bound_request_cancels_its_job() {
    let mut h = Harness::new(settings(10, 2), JobKind::Pending);
    let a = group("a");
    h.factory.queue(&[JobKind::NeedsAuth]);
    let (options, _auth_rx) = auth_options();
    let mut handle = ClientSocketHandle::new();
    assert_pending!(handle.init_with(&mut h.pool, a.clone(), Priority::Medium, options));
    h.pool.process_events();
    assert_eq!(h.pool.pending_request_count_in_group(&a), 1);

    handle.set_priority(&mut h.pool, Priority::Highest);
    assert_eq!(h.factory.job(0).priority(), Some(Priority::Highest));

    handle.reset(&mut h.pool);
    assert!(h.factory.job(0).is_cancelled());
    assert!(!h.pool.has_group(&a));
}
