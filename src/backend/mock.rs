//! Scriptable connection and connector used in tests.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::select;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

use super::dispatch::{CommandKind, Intent, ReleaseState};
use super::pool::Guard;
use super::{Connection, Connector, Target};

/// A connection whose behavior is scripted by the test.
pub struct MockConnection {
    id: u64,
    broken: AtomicBool,
    released: AtomicBool,
    closed: AtomicBool,
    test_ok: AtomicBool,
    sync_ok: AtomicBool,
    scalars: Mutex<VecDeque<i64>>,
    queries: Mutex<Vec<String>>,
}

impl MockConnection {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            broken: AtomicBool::new(false),
            released: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            test_ok: AtomicBool::new(true),
            sync_ok: AtomicBool::new(true),
            scalars: Mutex::new(VecDeque::new()),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Script the answers `query_scalar` returns, in order.
    pub fn with_scalars(self, scalars: &[i64]) -> Self {
        self.scalars.lock().extend(scalars.iter().copied());
        self
    }

    pub fn break_connection(&self) {
        self.broken.store(true, Ordering::Release);
    }

    pub fn set_test_ok(&self, ok: bool) {
        self.test_ok.store(ok, Ordering::Release);
    }

    pub fn set_sync_ok(&self, ok: bool) {
        self.sync_ok.store(ok, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn activate(&self) {
        self.released.store(false, Ordering::Release);
    }

    fn release(&self) {
        self.released.store(true, Ordering::Release);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    async fn test(&self) -> bool {
        self.test_ok.load(Ordering::Acquire)
    }

    async fn sync(&self) -> Result<(), Error> {
        if self.sync_ok.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::Protocol("sync refused".into()))
        }
    }

    async fn query_scalar(&self, query: &str) -> Result<i64, Error> {
        self.queries.lock().push(query.to_owned());

        self.scalars
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Protocol("no scripted result".into()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Opens `MockConnection`s, optionally failing or stalling on demand.
pub struct MockConnector {
    next_id: AtomicU64,
    failures: Mutex<VecDeque<Error>>,
    scalars: Mutex<Vec<i64>>,
    opened: Mutex<Vec<Arc<MockConnection>>>,
    open_delay: Mutex<Option<Duration>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            failures: Mutex::new(VecDeque::new()),
            scalars: Mutex::new(Vec::new()),
            opened: Mutex::new(Vec::new()),
            open_delay: Mutex::new(None),
        }
    }

    /// Every new connection answers `query_scalar` with these, in order.
    pub fn with_scalars(self, scalars: &[i64]) -> Self {
        *self.scalars.lock() = scalars.to_vec();
        self
    }

    /// Fail the next open attempt with the given error.
    pub fn fail_next(&self, err: Error) {
        self.failures.lock().push_back(err);
    }

    /// Stall every open attempt by this much.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = Some(delay);
    }

    /// Connections opened so far.
    pub fn opened(&self) -> Vec<Arc<MockConnection>> {
        self.opened.lock().clone()
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(
        &self,
        _target: &Target,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Connection>, Error> {
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }

        let delay = *self.open_delay.lock();
        if let Some(delay) = delay {
            select! {
                _ = sleep(delay) => (),
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let conn = Arc::new(
            MockConnection::new(id).with_scalars(&self.scalars.lock().clone()),
        );

        self.opened.lock().push(conn.clone());

        Ok(conn)
    }
}

/// An intent resolving a oneshot with its outcome.
pub struct TestIntent {
    kind: CommandKind,
    cancel: CancellationToken,
    release: ReleaseState,
    panic: bool,
    result: Option<oneshot::Sender<Result<u64, Error>>>,
}

impl TestIntent {
    /// Create an intent of the given kind. The receiver resolves with
    /// the id of the connection it executed on, or the failure.
    pub fn new(kind: CommandKind) -> (Box<Self>, oneshot::Receiver<Result<u64, Error>>) {
        let (tx, rx) = oneshot::channel();

        (
            Box::new(Self {
                kind,
                cancel: CancellationToken::new(),
                release: ReleaseState::Release,
                panic: false,
                result: Some(tx),
            }),
            rx,
        )
    }

    pub fn transferring(mut self: Box<Self>) -> Box<Self> {
        self.release = ReleaseState::Transferred;
        self
    }

    /// Blow up during execution instead of resolving.
    pub fn panicking(mut self: Box<Self>) -> Box<Self> {
        self.panic = true;
        self
    }

    pub fn cancellation_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[async_trait]
impl Intent for TestIntent {
    fn kind(&self) -> CommandKind {
        self.kind
    }

    fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn execute(&mut self, conn: &mut Guard) -> ReleaseState {
        if self.panic {
            panic!("scripted failure");
        }

        let id = conn.id();

        if self.release == ReleaseState::Transferred {
            if let Some((pool, conn)) = conn.detach() {
                pool.release(conn);
            }
        }

        if let Some(tx) = self.result.take() {
            let _ = tx.send(Ok(id));
        }

        self.release
    }

    fn fail(mut self: Box<Self>, err: Error) {
        if let Some(tx) = self.result.take() {
            let _ = tx.send(Err(err));
        }
    }
}
