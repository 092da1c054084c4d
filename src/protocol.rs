//! The render protocol: what goes into the bundle's entry point and how
//! the callback payload turns back into a [`RenderResult`].
//!
//! The bundle exposes `main(params, callback)`. `params` is [`Params`]
//! serialized to JSON; `callback` receives one string, a JSON object with
//! the [`RenderResult`] fields and an optional `error`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::oneshot;

use crate::consts::{FORWARDED_HEADERS, UNDEFINED_SENTINEL};
use crate::engine::{Engine, Headers};
use crate::error::{RenderError, RenderOutcome};

/// What to render, and on whose behalf.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Params {
    /// Used by the bundle's router to decide what to render.
    pub url: String,
    /// Added to every request the engine itself makes while rendering, so
    /// API calls act as the original requester.
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub request_id: String,
}

impl Params {
    pub fn new(url: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Headers::new(),
            request_id: request_id.into(),
        }
    }

    /// Append one value for `name`.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.into())
            .or_default()
            .push(value.into());
        self
    }

    /// Copy the forwardable headers (cookies) from an incoming request.
    /// Header names match case-insensitively.
    pub fn forward_headers(mut self, request: &Headers) -> Self {
        for (name, values) in request {
            if FORWARDED_HEADERS
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name))
            {
                self.headers
                    .entry(name.clone())
                    .or_default()
                    .extend(values.iter().cloned());
            }
        }
        self
    }
}

/// A rendered page, as reported by the bundle. Every field may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderResult {
    /// The rendered markup.
    #[serde(rename = "app", deserialize_with = "null_as_empty")]
    pub rendered: String,
    /// Where the client should be sent instead, if non-empty.
    #[serde(deserialize_with = "null_as_empty")]
    pub redirect: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub title: String,
    /// Meta tags for the document head.
    #[serde(deserialize_with = "null_as_empty")]
    pub meta: String,
    /// Initial state JSON to embed in the page.
    #[serde(deserialize_with = "null_as_empty")]
    pub initial: String,
}

impl RenderResult {
    pub fn redirect_target(&self) -> Option<&str> {
        if self.redirect.is_empty() {
            None
        } else {
            Some(&self.redirect)
        }
    }
}

fn null_as_empty<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(de)?.unwrap_or_default())
}

#[derive(Deserialize)]
struct Payload {
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    result: RenderResult,
}

/// Interpret the argument the bundle passed to its callback.
pub fn parse_payload(arg: Option<&str>) -> RenderOutcome<RenderResult> {
    let json = match arg {
        None => return Err(RenderError::NoResult),
        Some(s) if s == UNDEFINED_SENTINEL => return Err(RenderError::NoResult),
        Some(s) => s,
    };

    let payload: Payload = serde_json::from_str(json)?;
    match payload.error {
        Some(message) if !message.is_empty() => {
            Err(RenderError::script(message, payload.result))
        }
        _ => Ok(payload.result),
    }
}

/// One call's outcome, handed from the callback to the waiting caller.
#[derive(Debug)]
pub struct Outcome {
    pub result: RenderOutcome<RenderResult>,
    pub request_id: String,
}

/// The result callback bound for a single call.
///
/// Clones share one single-slot channel: the first call delivers, every
/// later call is dropped. A call that arrives after the caller stopped
/// waiting (deadline passed) is dropped too.
#[derive(Clone)]
pub struct Callback {
    request_id: Arc<str>,
    slot: Arc<Mutex<Option<oneshot::Sender<Outcome>>>>,
}

impl Callback {
    /// Create a fresh binding and the receiver its outcome arrives on.
    pub fn bind(request_id: &str) -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let callback = Self {
            request_id: Arc::from(request_id),
            slot: Arc::new(Mutex::new(Some(tx))),
        };
        (callback, rx)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Whether nobody has called this binding yet.
    pub fn is_pending(&self) -> bool {
        self.slot.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Deliver the payload. `None` means the bundle called back with no
    /// argument. Returns whether the outcome reached a waiting caller.
    pub fn call(&self, arg: Option<&str>) -> bool {
        let sender = match self.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(tx) = sender else {
            tracing::debug!(request_id = %self.request_id, "callback already fired, ignoring");
            return false;
        };

        let outcome = Outcome {
            result: parse_payload(arg),
            request_id: self.request_id.to_string(),
        };
        if tx.send(outcome).is_err() {
            tracing::debug!(
                request_id = %self.request_id,
                "late callback after the caller gave up, dropping result"
            );
            return false;
        }
        true
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("request_id", &self.request_id)
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Run one call against `engine`: set its outbound headers, bind a fresh
/// callback, call the entry point, and wait for the callback.
///
/// `deadline` covers both the entry-point call and the wait. A callback
/// binding dropped without ever firing counts as "no result".
pub async fn invoke(
    engine: &mut dyn Engine,
    params: &Params,
    deadline: Duration,
) -> RenderOutcome<RenderResult> {
    engine.set_outbound_context(&params.headers);
    let (callback, rx) = Callback::bind(&params.request_id);

    let call = async {
        engine
            .invoke(params, callback)
            .await
            .map_err(|e| RenderError::invocation(format!("{e:#}")))?;
        match rx.await {
            Ok(outcome) => {
                if outcome.request_id != params.request_id {
                    tracing::debug!(
                        expected = %params.request_id,
                        got = %outcome.request_id,
                        "callback answered for another request id"
                    );
                }
                outcome.result
            }
            Err(_) => Err(RenderError::NoResult),
        }
    };

    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(RenderError::TimedOut(deadline)),
    }
}
