//! A pool of engines owned by a single arbiter task.
//!
//! The arbiter is the only code that touches the idle set. Callers reach
//! it through two channels: requests (acquire, stats, shutdown) and
//! check-ins (an engine coming back, or word that one was destroyed).
//! Idle engines are reused most-recently-returned first. New engines are
//! only built when an acquire finds nothing idle.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::engine::{Engine, EngineFactory, EngineId};
use crate::error::{RenderError, RenderOutcome};

/// How many requests may queue up for the arbiter before senders wait.
const REQUEST_BACKLOG: usize = 64;

struct PooledEngine {
    id: EngineId,
    inner: Box<dyn Engine>,
}

enum Request {
    Acquire(oneshot::Sender<RenderOutcome<Lease>>),
    Stats(oneshot::Sender<PoolStats>),
    Shutdown(oneshot::Sender<PoolStats>),
}

enum Checkin {
    Release(PooledEngine),
    Discard(EngineId),
}

/// A snapshot of the arbiter's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Engines built so far.
    pub created: u64,
    /// Engines destroyed instead of returned.
    pub discarded: u64,
    /// Engines waiting to be handed out.
    pub idle: usize,
    pub construction_failures: u64,
}

impl PoolStats {
    /// Engines currently held by callers.
    pub fn on_loan(&self) -> u64 {
        self.created
            .saturating_sub(self.discarded)
            .saturating_sub(self.idle as u64)
    }
}

/// Handle to an engine pool. Cheap to clone; every clone talks to the
/// same arbiter. The arbiter stops on [`EnginePool::shutdown`] or once
/// every handle has been dropped.
#[derive(Clone)]
pub struct EnginePool {
    requests: mpsc::Sender<Request>,
}

impl EnginePool {
    /// Start a pool on the current tokio runtime. No engine is built until
    /// the first acquire.
    pub fn new(factory: impl EngineFactory) -> Self {
        Self::with_factory(Arc::new(factory))
    }

    pub fn with_factory(factory: Arc<dyn EngineFactory>) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_BACKLOG);
        let (checkin_tx, checkin_rx) = mpsc::unbounded_channel();

        let arbiter = Arbiter {
            factory,
            requests: requests_rx,
            checkins: checkin_rx,
            checkin_tx,
            staged: None,
            idle: Vec::new(),
            next_id: 0,
            stats: PoolStats::default(),
        };
        tokio::spawn(arbiter.run());

        Self {
            requests: requests_tx,
        }
    }

    /// Take exclusive hold of an engine, building one if none is idle.
    /// Fails if the pool is shut down or the factory fails.
    pub async fn acquire(&self) -> RenderOutcome<Lease> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Acquire(tx))
            .await
            .map_err(|_| RenderError::PoolClosed)?;
        rx.await.map_err(|_| RenderError::PoolClosed)?
    }

    pub async fn stats(&self) -> RenderOutcome<PoolStats> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Stats(tx))
            .await
            .map_err(|_| RenderError::PoolClosed)?;
        rx.await.map_err(|_| RenderError::PoolClosed)
    }

    /// Stop the arbiter and terminate every idle engine. Returns the final
    /// stats. Engines still on loan are terminated when their lease ends.
    pub async fn shutdown(&self) -> RenderOutcome<PoolStats> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Shutdown(tx))
            .await
            .map_err(|_| RenderError::PoolClosed)?;
        rx.await.map_err(|_| RenderError::PoolClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }
}

/// Exclusive use of one engine. End it with [`Lease::release`] to return
/// the engine, or [`Lease::discard`] to destroy it. A lease dropped
/// without either is discarded once [`Lease::engine_mut`] has been called,
/// since the engine may be mid-call. An untouched engine goes back to the
/// pool.
pub struct Lease {
    engine: Option<PooledEngine>,
    checkins: mpsc::UnboundedSender<Checkin>,
    used: bool,
}

impl Lease {
    pub fn id(&self) -> EngineId {
        self.pooled().id
    }

    pub fn engine_mut(&mut self) -> &mut dyn Engine {
        self.used = true;
        match self.engine.as_mut() {
            Some(pooled) => pooled.inner.as_mut(),
            None => unreachable!("lease used after check-in"),
        }
    }

    /// Give the engine back for reuse. If the pool is gone the engine is
    /// terminated instead.
    pub fn release(mut self) {
        if let Some(pooled) = self.engine.take() {
            self.give_back(pooled);
        }
    }

    /// Terminate the engine; it never goes back to the pool.
    pub fn discard(mut self) {
        if let Some(pooled) = self.engine.take() {
            self.destroy(pooled);
        }
    }

    fn pooled(&self) -> &PooledEngine {
        match self.engine.as_ref() {
            Some(pooled) => pooled,
            None => unreachable!("lease used after check-in"),
        }
    }

    fn give_back(&self, pooled: PooledEngine) {
        if let Err(mpsc::error::SendError(Checkin::Release(mut pooled))) =
            self.checkins.send(Checkin::Release(pooled))
        {
            tracing::debug!(engine = %pooled.id, "pool closed, terminating returned engine");
            pooled.inner.terminate();
        }
    }

    fn destroy(&self, mut pooled: PooledEngine) {
        pooled.inner.terminate();
        // The pool may already be gone; nothing left to account for then.
        let _ = self.checkins.send(Checkin::Discard(pooled.id));
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(pooled) = self.engine.take() else {
            return;
        };
        if self.used {
            tracing::warn!(engine = %pooled.id, "lease dropped while held, discarding engine");
            self.destroy(pooled);
        } else {
            tracing::debug!(engine = %pooled.id, "unused lease dropped, returning engine");
            self.give_back(pooled);
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("engine", &self.engine.as_ref().map(|p| p.id))
            .finish()
    }
}

struct Arbiter {
    factory: Arc<dyn EngineFactory>,
    requests: mpsc::Receiver<Request>,
    checkins: mpsc::UnboundedReceiver<Checkin>,
    checkin_tx: mpsc::UnboundedSender<Checkin>,
    /// Next engine to hand out.
    staged: Option<PooledEngine>,
    /// The rest of the idle engines; the last one is the most recent.
    idle: Vec<PooledEngine>,
    next_id: u64,
    stats: PoolStats,
}

impl Arbiter {
    async fn run(mut self) {
        tracing::debug!("engine pool started");
        loop {
            tokio::select! {
                // Returned engines first, so an acquire right after a
                // release reuses the engine instead of building another.
                biased;

                Some(checkin) = self.checkins.recv() => self.absorb(checkin),

                request = self.requests.recv() => match request {
                    Some(Request::Acquire(reply)) => self.hand_out(reply).await,
                    Some(Request::Stats(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Request::Shutdown(reply)) => {
                        let stats = self.snapshot();
                        self.close();
                        let _ = reply.send(stats);
                        return;
                    }
                    None => break,
                },
            }
        }
        self.close();
    }

    fn absorb(&mut self, checkin: Checkin) {
        match checkin {
            Checkin::Release(engine) => {
                tracing::trace!(engine = %engine.id, "engine returned");
                if let Some(previous) = self.staged.replace(engine) {
                    self.idle.push(previous);
                }
            }
            Checkin::Discard(id) => {
                tracing::debug!(engine = %id, "engine discarded");
                self.stats.discarded += 1;
            }
        }
    }

    async fn hand_out(&mut self, reply: oneshot::Sender<RenderOutcome<Lease>>) {
        while let Ok(checkin) = self.checkins.try_recv() {
            self.absorb(checkin);
        }

        if self.staged.is_none() {
            self.staged = self.idle.pop();
        }
        if self.staged.is_none() {
            match self.construct().await {
                Ok(engine) => self.staged = Some(engine),
                Err(e) => {
                    self.stats.construction_failures += 1;
                    tracing::warn!(error = %format!("{e:#}"), "engine construction failed");
                    let _ = reply.send(Err(RenderError::Construction(e)));
                    return;
                }
            }
        }

        let Some(engine) = self.staged.take() else {
            return;
        };
        let id = engine.id;
        let lease = Lease {
            engine: Some(engine),
            checkins: self.checkin_tx.clone(),
            used: false,
        };
        if let Err(Ok(mut lease)) = reply.send(Ok(lease)) {
            // The caller stopped waiting; keep the engine.
            tracing::debug!(engine = %id, "acquirer went away, keeping engine");
            self.staged = lease.engine.take();
        }
    }

    async fn construct(&mut self) -> anyhow::Result<PooledEngine> {
        self.next_id += 1;
        let id = EngineId(self.next_id);
        let started = Instant::now();

        let inner = self.factory.create(id).await?;

        self.stats.created += 1;
        tracing::info!(engine = %id, elapsed = ?started.elapsed(), "initialized new engine");
        Ok(PooledEngine { id, inner })
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.len() + usize::from(self.staged.is_some()),
            ..self.stats
        }
    }

    fn close(&mut self) {
        self.requests.close();
        self.checkins.close();
        while let Ok(checkin) = self.checkins.try_recv() {
            self.absorb(checkin);
        }

        let idle = self.idle.drain(..).chain(self.staged.take());
        let mut count = 0;
        for mut engine in idle {
            engine.inner.terminate();
            count += 1;
        }
        tracing::info!(terminated = count, "engine pool shut down");
    }
}
