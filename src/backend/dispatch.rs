//! Command queue and execution loop shared by databases and nodes.
//!
//! Both a database and a single node accept "fire directly" commands.
//! The intent is queued, a single loop per dispatcher drains the queue
//! and every intent runs on its own task: acquire a connection, execute,
//! release. The [`Dispatch`] trait is the surface the loop needs from
//! its owner.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::select;
use tokio::spawn;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::Error;

use super::pool::Guard;

/// Soft cap on queued intents per dispatcher.
pub const QUEUE_SOFT_CAP: usize = 1_048_576;

/// What kind of command an intent carries.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommandKind {
    /// Start a transaction; the connection is handed off to the caller.
    Begin,
    /// A query returning rows.
    Query,
    /// A statement executed for its side effects.
    Execute,
    /// Multiple statements executed in sequence.
    Perform,
}

impl CommandKind {
    /// Commands that are safe to block waiting for a released
    /// connection. Others get no deadlock-refusal protection because
    /// their completion doesn't depend on connection movement.
    pub fn waitable(&self) -> bool {
        matches!(self, CommandKind::Begin | CommandKind::Query)
    }
}

/// Did the intent's execution hand the connection off?
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReleaseState {
    /// The dispatch loop releases the connection.
    Release,
    /// The intent took ownership, e.g. an open transaction.
    Transferred,
}

/// A queued command.
///
/// Intents are constructed by the caller and consumed by the dispatch
/// loop. Execution resolves the intent's own result handle, success or
/// failure; `fail` resolves it when no connection could be acquired.
#[async_trait]
pub trait Intent: Send + 'static {
    fn kind(&self) -> CommandKind;

    /// The caller's cancellation signal. Aborts the wait for a
    /// connection and the executing command, nothing else.
    fn cancellation(&self) -> CancellationToken;

    /// Run the command against the connection.
    async fn execute(&mut self, conn: &mut Guard) -> ReleaseState;

    /// Resolve the result handle with a failure without executing.
    fn fail(self: Box<Self>, err: Error);
}

/// The surface a dispatch loop needs from its owner. Implemented by
/// both `Database` and `Node` so the loop treats them uniformly.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    /// Name of the logical database, used in errors and logs.
    fn database_name(&self) -> &str;

    /// Number of idle connections available right now.
    fn idle_connections(&self) -> usize;

    /// Obtain a connection, waiting if allowed.
    async fn acquire(&self, kind: CommandKind, cancel: &CancellationToken)
        -> Result<Guard, Error>;

    /// Close up to `n` idle connections. Returns how many closed.
    fn prune(&self, n: usize) -> usize;
}

/// Close roughly `n` idle connections across a group of dispatchers,
/// taking more from those with more to spare.
pub fn prune_connections(dispatchers: &[&dyn Dispatch], n: usize) -> usize {
    let mut ranked = dispatchers
        .iter()
        .map(|d| (d.idle_connections(), *d))
        .collect::<Vec<_>>();
    ranked.sort_by(|a, b| b.0.cmp(&a.0));

    let total: usize = ranked.iter().map(|(idle, _)| idle).sum();
    if total == 0 || n == 0 {
        return 0;
    }

    let mut pruned = 0;
    for (idle, dispatcher) in ranked {
        if pruned >= n {
            break;
        }

        // Proportional share, rounded up so small pools still contribute.
        let share = (n * idle).div_ceil(total);
        let take = share.min(n - pruned).min(idle);

        pruned += dispatcher.prune(take);
    }

    pruned
}

/// Unbounded intent queue with a single execution loop.
pub struct CommandQueue {
    tx: UnboundedSender<Box<dyn Intent>>,
    rx: Mutex<Option<UnboundedReceiver<Box<dyn Intent>>>>,
    depth: Arc<AtomicUsize>,
    running: AtomicBool,
    shutdown: CancellationToken,
    target: String,
}

impl CommandQueue {
    /// Create new command queue for the named target.
    pub fn new(target: &str) -> Self {
        let (tx, rx) = unbounded_channel();

        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            depth: Arc::new(AtomicUsize::new(0)),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            target: target.to_owned(),
        }
    }

    /// Number of intents currently queued.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Queue an intent and make sure the execution loop is running.
    ///
    /// The intent is failed immediately if the queue is closed or
    /// over its soft cap; in both cases its result handle is resolved.
    pub fn dispatch(&self, owner: Arc<dyn Dispatch>, intent: Box<dyn Intent>) {
        if self.shutdown.is_cancelled() {
            intent.fail(Error::Cancelled);
            return;
        }

        if self.depth.fetch_add(1, Ordering::AcqRel) >= QUEUE_SOFT_CAP {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            intent.fail(Error::QueueFull(self.target.clone()));
            return;
        }

        if let Err(err) = self.tx.send(intent) {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            err.0.fail(Error::Cancelled);
            return;
        }

        self.ensure_running(owner);
    }

    /// Close the queue and fail everything still queued.
    pub fn dispose(&self) {
        self.shutdown.cancel();

        // The loop drains in-flight intents; anything never picked up
        // by a loop is drained here. Closing the receiver first makes
        // sends racing past the shutdown check fail at the channel,
        // so no intent can land between the drain and the drop.
        if let Some(mut rx) = self.rx.lock().take() {
            rx.close();
            while let Ok(intent) = rx.try_recv() {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                intent.fail(Error::Cancelled);
            }
        }
    }

    /// Launch the execution loop exactly once.
    fn ensure_running(&self, owner: Arc<dyn Dispatch>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let rx = self.rx.lock().take();
        let shutdown = self.shutdown.clone();
        let depth = self.depth.clone();

        if let Some(rx) = rx {
            spawn(Self::run_loop(owner, rx, shutdown, depth));
        }
    }

    async fn run_loop(
        owner: Arc<dyn Dispatch>,
        mut rx: UnboundedReceiver<Box<dyn Intent>>,
        shutdown: CancellationToken,
        depth: Arc<AtomicUsize>,
    ) {
        debug!("dispatch loop running [{}]", owner.database_name());

        let mut workers = JoinSet::new();

        loop {
            select! {
                maybe = rx.recv() => match maybe {
                    Some(intent) => {
                        depth.fetch_sub(1, Ordering::AcqRel);
                        workers.spawn(Self::run_intent(owner.clone(), intent));
                    }

                    // All senders dropped, nothing left to do.
                    None => break,
                },

                Some(result) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(err) = result {
                        error!("worker failed: {} [{}]", err, owner.database_name());
                    }
                }

                _ = shutdown.cancelled() => {
                    // Refuse further sends, then fail what's left:
                    // a send racing past the shutdown check either
                    // lands before the drain or errors at the channel.
                    rx.close();
                    while let Ok(intent) = rx.try_recv() {
                        depth.fetch_sub(1, Ordering::AcqRel);
                        intent.fail(Error::Cancelled);
                    }
                    break;
                }
            }
        }

        while let Some(result) = workers.join_next().await {
            if let Err(err) = result {
                error!("worker failed: {} [{}]", err, owner.database_name());
            }
        }

        debug!("dispatch loop shut down [{}]", owner.database_name());
    }

    /// One unit of work: acquire, execute, release.
    async fn run_intent(owner: Arc<dyn Dispatch>, mut intent: Box<dyn Intent>) {
        let cancel = intent.cancellation();

        let mut conn = match owner.acquire(intent.kind(), &cancel).await {
            Ok(conn) => conn,
            Err(err) => {
                error!(
                    "could not acquire connection: {} [{}]",
                    err,
                    owner.database_name()
                );
                intent.fail(err);
                return;
            }
        };

        match intent.execute(&mut conn).await {
            // Dropping the guard checks the connection back in.
            ReleaseState::Release => drop(conn),
            // The intent owns it now, e.g. until commit/rollback.
            ReleaseState::Transferred => debug!(
                "connection handed off to caller [{}]",
                owner.database_name()
            ),
        }
    }
}
