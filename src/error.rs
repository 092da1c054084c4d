//! Errors surfaced by [`Render::render`](crate::renderer::Render::render).

use std::time::Duration;

use crate::consts::NO_RESULT_MESSAGE;
use crate::protocol::RenderResult;

pub type RenderOutcome<T> = Result<T, RenderError>;

#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    /// The factory could not build an engine. Fatal to one acquire only.
    #[error("could not construct rendering engine: {0:#}")]
    Construction(#[source] anyhow::Error),

    /// The pool has been shut down.
    #[error("engine pool is closed")]
    PoolClosed,

    /// The entry point is missing or threw before calling back.
    #[error("call to entry point failed: {0}")]
    Invocation(String),

    /// The callback payload was not valid JSON.
    #[error("malformed result from rendering engine: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{}", NO_RESULT_MESSAGE)]
    NoResult,

    /// The script reported an error. `partial` keeps whatever fields it
    /// sent alongside, a redirect in particular.
    #[error("{message}")]
    Script {
        message: String,
        partial: RenderResult,
    },

    #[error("render timed out after {0:?}")]
    TimedOut(Duration),
}

impl RenderError {
    pub fn invocation(msg: impl Into<String>) -> Self {
        Self::Invocation(msg.into())
    }

    pub fn script(message: impl Into<String>, partial: RenderResult) -> Self {
        Self::Script {
            message: message.into(),
            partial,
        }
    }

    /// Redirect target the script asked for before failing, if any.
    /// Redirects win over rendering errors.
    pub fn redirect(&self) -> Option<&str> {
        match self {
            Self::Script { partial, .. } => partial.redirect_target(),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }

    /// Whether the engine that produced this error must be thrown away
    /// instead of going back to the pool.
    pub fn destroys_engine(&self) -> bool {
        self.is_timeout()
    }
}
