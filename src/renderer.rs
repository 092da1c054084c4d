use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::Instrument;

use crate::consts::DEFAULT_RENDER_DEADLINE;
use crate::engine::EngineFactory;
use crate::error::RenderOutcome;
use crate::pool::EnginePool;
use crate::protocol::{self, Params, RenderResult};

/// The outermost boundary. The HTTP layer only knows this trait.
#[async_trait]
pub trait Render: Send + Sync {
    async fn render(&self, params: Params) -> RenderOutcome<RenderResult>;
}

#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Past this, the engine is terminated and never reused.
    pub deadline: Duration,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_RENDER_DEADLINE,
        }
    }
}

/// Renders on engines borrowed from an [`EnginePool`]. Safe to share
/// between any number of concurrent callers.
pub struct PooledRenderer {
    pool: EnginePool,
    config: RenderConfig,
}

impl PooledRenderer {
    pub fn new(pool: EnginePool, config: RenderConfig) -> Self {
        Self { pool, config }
    }

    /// A renderer over a fresh pool with the default deadline.
    pub fn with_factory(factory: impl EngineFactory) -> Self {
        Self::new(EnginePool::new(factory), RenderConfig::default())
    }

    pub fn pool(&self) -> &EnginePool {
        &self.pool
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }
}

#[async_trait]
impl Render for PooledRenderer {
    async fn render(&self, params: Params) -> RenderOutcome<RenderResult> {
        let started = Instant::now();
        let mut lease = self.pool.acquire().await?;
        let span = tracing::info_span!(
            "render",
            request_id = %params.request_id,
            engine = %lease.id(),
        );

        async move {
            tracing::debug!(url = %params.url, "rendering");
            let result = protocol::invoke(lease.engine_mut(), &params, self.config.deadline).await;

            match &result {
                Ok(_) => {
                    tracing::debug!(elapsed = ?started.elapsed(), "rendered");
                    lease.release();
                }
                Err(e) if e.destroys_engine() => {
                    tracing::warn!(error = %e, "render timed out, terminating engine");
                    lease.discard();
                }
                Err(e) => {
                    tracing::info!(error = %e, elapsed = ?started.elapsed(), "render failed");
                    lease.release();
                }
            }
            result
        }
        .instrument(span)
        .await
    }
}
