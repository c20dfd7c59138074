use super::client_pool::{ClientSocketPool, RequestStatus};
use super::handle::{InitOptions, PooledSocket};
use super::stats::PoolStats;
use super::types::{GroupId, Priority, RespectLimits, SocketParams};
use crate::utils::error::PoolError;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

type Command = Box<dyn FnOnce(&mut ClientSocketPool) + Send>;

/// Runs a [`ClientSocketPool`] on its own tokio task.
///
/// The task owns the pool and applies, one at a time, commands from
/// [`PoolClient`]s, events from jobs and sockets, and due timers.
#[derive(Debug)]
pub struct PoolService {
    client: PoolClient,
    task: JoinHandle<()>,
}

impl PoolService {
    pub fn spawn(pool: ClientSocketPool) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();
        let task = tokio::spawn(run(pool, commands_rx, cancel_token.clone()));
        info!("Pool service started");
        Self {
            client: PoolClient {
                commands: commands_tx,
                cancel_token,
            },
            task,
        }
    }

    pub fn client(&self) -> PoolClient {
        self.client.clone()
    }

    /// Stop the task. Pending requests fail with [`PoolError::Aborted`].
    pub async fn shutdown(self) {
        self.client.cancel_token.cancel();
        let _ = self.task.await;
    }
}

async fn run(
    mut pool: ClientSocketPool,
    mut commands: mpsc::UnboundedReceiver<Command>,
    cancel_token: CancellationToken,
) {
    loop {
        pool.process_events();
        let deadline = pool.next_timer_deadline();

        // Events first: a command must see every event posted before it.
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                debug!("Pool service cancelled");
                break;
            }
            Some(event) = pool.next_event() => pool.handle_event(event),
            command = commands.recv() => match command {
                Some(command) => command(&mut pool),
                None => {
                    debug!("All pool clients dropped");
                    break;
                }
            },
            _ = sleep_until(deadline) => pool.run_due_timers(),
        }
    }
    pool.shutdown();
    info!("Pool service stopped");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Cheap, cloneable access to a pool running in a [`PoolService`].
#[derive(Debug, Clone)]
pub struct PoolClient {
    commands: mpsc::UnboundedSender<Command>,
    cancel_token: CancellationToken,
}

impl PoolClient {
    /// Run `f` against the pool on the service task and return its result.
    pub async fn execute<F, R>(&self, f: F) -> Result<R, PoolError>
    where
        F: FnOnce(&mut ClientSocketPool) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command: Command = Box::new(move |pool| {
            let _ = reply_tx.send(f(pool));
        });
        self.commands
            .send(command)
            .map_err(|_| PoolError::Aborted)?;
        reply_rx.await.map_err(|_| PoolError::Aborted)
    }

    /// Fire-and-forget variant of [`execute`](Self::execute).
    fn post<F>(&self, f: F)
    where
        F: FnOnce(&mut ClientSocketPool) + Send + 'static,
    {
        let _ = self.commands.send(Box::new(f));
    }

    /// Get a socket for `group_id`, waiting as long as it takes. Dropping the
    /// returned future withdraws the request.
    pub async fn connect(
        &self,
        group_id: GroupId,
        priority: Priority,
    ) -> Result<PooledSocket, PoolError> {
        self.connect_with(group_id, priority, InitOptions::default())
            .await
    }

    pub async fn connect_with(
        &self,
        group_id: GroupId,
        priority: Priority,
        options: InitOptions,
    ) -> Result<PooledSocket, PoolError> {
        let respect_limits = options.respect_limits.unwrap_or(RespectLimits::Enabled);
        let request_group = group_id.clone();
        let status = self
            .execute(move |pool| {
                pool.request_socket(
                    &request_group,
                    Arc::new(options.params),
                    priority,
                    respect_limits,
                    options.auth_callback,
                )
            })
            .await?;

        match status {
            RequestStatus::Ready(socket) => Ok(socket),
            RequestStatus::Failed(err) => Err(err),
            RequestStatus::Pending {
                request_id,
                completion,
            } => {
                trace!(group = %group_id, request = %request_id, "waiting for socket");
                let mut guard = CancelOnDrop {
                    client: self,
                    group_id,
                    request_id,
                    armed: true,
                };
                let result = completion.await;
                guard.armed = false;
                result.unwrap_or(Err(PoolError::Aborted))
            }
        }
    }

    pub async fn preconnect(
        &self,
        group_id: GroupId,
        params: SocketParams,
        num_sockets: usize,
    ) -> Result<usize, PoolError> {
        self.execute(move |pool| pool.preconnect(&group_id, params, num_sockets))
            .await?
    }

    /// Return a socket right away instead of waiting for its drop.
    pub fn release(&self, socket: PooledSocket) {
        self.post(move |pool| pool.release_socket(socket));
    }

    pub async fn stats(&self) -> Result<PoolStats, PoolError> {
        self.execute(|pool| pool.stats()).await
    }

    pub async fn flush_with_error(&self, error: PoolError) -> Result<(), PoolError> {
        self.execute(move |pool| pool.flush_with_error(error)).await
    }

    pub async fn close_idle_sockets(&self) -> Result<(), PoolError> {
        self.execute(|pool| pool.close_idle_sockets(super::CLOSED_BY_CALLER))
            .await
    }

    pub async fn refresh_group(&self, group_id: GroupId) -> Result<usize, PoolError> {
        self.execute(move |pool| {
            pool.refresh_groups(|id| *id == group_id, super::REFRESHED_BY_CALLER)
        })
        .await
    }

    pub async fn on_ip_address_changed(&self) -> Result<(), PoolError> {
        self.execute(|pool| pool.on_ip_address_changed()).await
    }

    pub async fn on_ssl_config_changed(&self) -> Result<(), PoolError> {
        self.execute(|pool| pool.on_ssl_config_changed()).await
    }

    /// Stop the service task.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed() || self.cancel_token.is_cancelled()
    }
}

/// Withdraws a pending request if the waiting future is dropped.
struct CancelOnDrop<'a> {
    client: &'a PoolClient,
    group_id: GroupId,
    request_id: super::types::RequestId,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            let group_id = self.group_id.clone();
            let request_id = self.request_id;
            self.client
                .post(move |pool| pool.cancel_request(&group_id, request_id, true));
        }
    }
}
