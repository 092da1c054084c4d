use anyhow::{Result, bail};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Engine, EngineFactory, EngineId, Headers};
use crate::outbound::OutboundContext;
use crate::protocol::{Callback, Params};

/// What a scripted engine does when its entry point is called.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Call back right away. `None` calls back with no argument.
    Reply(Option<String>),
    /// Call back from a background task after the delay.
    ReplyAfter(Duration, Option<String>),
    /// Hold on to the callback and never call it.
    Hang,
    /// The entry point itself never returns.
    Block,
    /// Let go of the callback without calling it.
    DropCallback,
    /// The entry point throws.
    Throw(String),
}

impl Behavior {
    pub fn reply(payload: impl Into<String>) -> Self {
        Self::Reply(Some(payload.into()))
    }

    pub fn reply_after(delay: Duration, payload: impl Into<String>) -> Self {
        Self::ReplyAfter(delay, Some(payload.into()))
    }
}

type Script = Arc<dyn Fn(&Params) -> Behavior + Send + Sync>;

/// Counters shared by every engine a [`ScriptedFactory`] builds.
#[derive(Debug, Default)]
pub struct Probe {
    created: AtomicUsize,
    terminated: AtomicUsize,
    dropped: AtomicUsize,
    invocations: AtomicUsize,
    overlaps: AtomicUsize,
    last_headers: Mutex<Headers>,
}

impl Probe {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Engines whose memory has been released.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Times an engine was invoked while a previous call on it was still
    /// running. Anything above zero is a pool bug.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    /// Outbound headers in effect at the most recent invocation.
    pub fn last_headers(&self) -> Headers {
        self.last_headers
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }
}

/// An in-process stand-in for a real script engine. Decides what to do
/// per call from a script keyed on the params.
pub struct ScriptedEngine {
    id: EngineId,
    script: Script,
    probe: Arc<Probe>,
    busy: Arc<AtomicBool>,
    outbound: OutboundContext,
    hung: Vec<Callback>,
    terminated: bool,
}

impl ScriptedEngine {
    pub fn id(&self) -> EngineId {
        self.id
    }

    /// The header set a fetch facility built on this engine would use.
    pub fn outbound(&self) -> &OutboundContext {
        &self.outbound
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn set_outbound_context(&mut self, headers: &Headers) {
        self.outbound.set(headers);
    }

    async fn invoke(&mut self, params: &Params, callback: Callback) -> Result<()> {
        if self.terminated {
            bail!("engine {} was terminated", self.id);
        }
        self.probe.invocations.fetch_add(1, Ordering::SeqCst);
        if self.busy.swap(true, Ordering::SeqCst) {
            self.probe.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        if let Ok(mut last) = self.probe.last_headers.lock() {
            *last = self.outbound.headers();
        }

        match (self.script)(params) {
            Behavior::Reply(payload) => {
                self.busy.store(false, Ordering::SeqCst);
                callback.call(payload.as_deref());
            }
            Behavior::ReplyAfter(delay, payload) => {
                let busy = Arc::clone(&self.busy);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    busy.store(false, Ordering::SeqCst);
                    callback.call(payload.as_deref());
                });
            }
            Behavior::Hang => self.hung.push(callback),
            Behavior::Block => std::future::pending::<()>().await,
            Behavior::DropCallback => {
                self.busy.store(false, Ordering::SeqCst);
                drop(callback);
            }
            Behavior::Throw(message) => {
                self.busy.store(false, Ordering::SeqCst);
                bail!("Uncaught Error: {message}");
            }
        }
        Ok(())
    }

    fn terminate(&mut self) {
        if !self.terminated {
            self.terminated = true;
            self.hung.clear();
            self.probe.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for ScriptedEngine {
    fn drop(&mut self) {
        self.probe.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Builds [`ScriptedEngine`]s. Can be told to fail its next constructions
/// or to take a while building each engine.
pub struct ScriptedFactory {
    script: Script,
    probe: Arc<Probe>,
    failures: AtomicUsize,
    construction_delay: Duration,
}

impl ScriptedFactory {
    pub fn new(script: impl Fn(&Params) -> Behavior + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            probe: Arc::new(Probe::default()),
            failures: AtomicUsize::new(0),
            construction_delay: Duration::ZERO,
        }
    }

    /// Every call replies with the same payload.
    pub fn replying(payload: &str) -> Self {
        let payload = payload.to_string();
        Self::new(move |_| Behavior::reply(payload.clone()))
    }

    /// Fail the next `n` constructions.
    pub fn failing_first(self, n: usize) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_construction_delay(mut self, delay: Duration) -> Self {
        self.construction_delay = delay;
        self
    }

    pub fn probe(&self) -> Arc<Probe> {
        Arc::clone(&self.probe)
    }
}

#[async_trait]
impl EngineFactory for ScriptedFactory {
    async fn create(&self, id: EngineId) -> Result<Box<dyn Engine>> {
        if !self.construction_delay.is_zero() {
            tokio::time::sleep(self.construction_delay).await;
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            bail!("could not load bundle into engine {id}");
        }

        self.probe.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedEngine {
            id,
            script: Arc::clone(&self.script),
            probe: Arc::clone(&self.probe),
            busy: Arc::new(AtomicBool::new(false)),
            outbound: OutboundContext::new(),
            hung: Vec::new(),
            terminated: false,
        }))
    }
}
