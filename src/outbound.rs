//! Outbound requests an engine makes while rendering.
//!
//! A bundle that fetches from the local API during server-side rendering
//! must do so as the user whose page is being rendered. The engine keeps an
//! [`OutboundContext`], swapped on every call, and routes its fetches
//! through a [`ForwardingClient`] that copies those headers (cookies, in
//! practice) onto each request to the local server.

use anyhow::{Context, Result};
use reqwest::{Client, Method, RequestBuilder, Response};
use std::sync::{Arc, RwLock};

use crate::engine::Headers;

/// The header set in effect for the engine's current call.
#[derive(Debug, Clone, Default)]
pub struct OutboundContext {
    headers: Arc<RwLock<Headers>>,
}

impl OutboundContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the headers. Only the engine's current holder calls this,
    /// so there is never more than one writer.
    pub fn set(&self, headers: &Headers) {
        match self.headers.write() {
            Ok(mut current) => *current = headers.clone(),
            Err(poisoned) => *poisoned.into_inner() = headers.clone(),
        }
    }

    pub fn headers(&self) -> Headers {
        match self.headers.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// HTTP client for an engine's fetch facility, bound to the local server.
pub struct ForwardingClient {
    client: Client,
    base_url: String,
    context: OutboundContext,
}

impl ForwardingClient {
    pub fn new(base_url: impl Into<String>, context: OutboundContext) -> Self {
        Self::with_client(Client::new(), base_url, context)
    }

    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        context: OutboundContext,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            context,
        }
    }

    pub fn context(&self) -> &OutboundContext {
        &self.context
    }

    /// Build a request. Relative paths resolve against the local server
    /// and carry the forwarded headers; absolute URLs elsewhere get none.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let (url, local) = self.resolve(url);
        let mut builder = self.client.request(method, url);
        if local {
            for (name, values) in self.context.headers() {
                for value in values {
                    builder = builder.header(name.as_str(), value);
                }
            }
        }
        builder
    }

    pub async fn fetch(&self, url: &str) -> Result<Response> {
        let response = self
            .request(Method::GET, url)
            .send()
            .await
            .with_context(|| format!("fetch {url} failed"))?;
        tracing::debug!(url, status = %response.status(), "outbound fetch");
        Ok(response)
    }

    fn resolve(&self, url: &str) -> (String, bool) {
        if url.starts_with("http://") || url.starts_with("https://") {
            let local = url == self.base_url
                || url
                    .strip_prefix(self.base_url.as_str())
                    .is_some_and(|rest| rest.starts_with('/'));
            (url.to_string(), local)
        } else {
            (
                format!("{}/{}", self.base_url, url.trim_start_matches('/')),
                true,
            )
        }
    }
}
