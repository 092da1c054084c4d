pub mod mock;

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;

use crate::protocol::{Callback, Params};

/// Header name to its values, in the order they were sent.
pub type Headers = BTreeMap<String, Vec<String>>;

/// Number of an engine within its pool, assigned in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineId(pub u64);

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A script engine with the bundle already loaded. Stateful and not
/// reentrant: only one caller may drive it at a time, which the pool
/// guarantees by handing it out by value.
#[async_trait]
pub trait Engine: Send {
    /// Headers to attach to the engine's own outbound requests until the
    /// next call replaces them.
    fn set_outbound_context(&mut self, headers: &Headers);

    /// Call the entry point with `params` and `callback`. Returns once the
    /// entry point has returned; the callback may fire before or after.
    /// An error means the entry point is missing or threw.
    async fn invoke(&mut self, params: &Params, callback: Callback) -> Result<()>;

    /// Abort whatever the engine is running. Best effort: the engine is
    /// never used again afterwards.
    fn terminate(&mut self);
}

/// Builds engines for a pool, loading the bundle into each one.
#[async_trait]
pub trait EngineFactory: Send + Sync + 'static {
    async fn create(&self, id: EngineId) -> Result<Box<dyn Engine>>;
}

#[async_trait]
impl<F> EngineFactory for F
where
    F: Fn(EngineId) -> Result<Box<dyn Engine>> + Send + Sync + 'static,
{
    async fn create(&self, id: EngineId) -> Result<Box<dyn Engine>> {
        self(id)
    }
}
