pub mod bundle;
pub mod consts;
pub mod engine;
pub mod error;
pub mod outbound;
pub mod pool;
pub mod protocol;
pub mod renderer;

pub use engine::{Engine, EngineFactory, EngineId, Headers};
pub use error::RenderError;
pub use pool::{EnginePool, Lease, PoolStats};
pub use protocol::{Callback, Params, RenderResult};
pub use renderer::{PooledRenderer, Render, RenderConfig};
