//! The script bundle every engine loads at construction.
//!
//! A bundle is read once and then shared read-only between factories and
//! engines; each engine evaluates its own copy of the code.

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;

use crate::consts::DEFAULT_BUNDLE_NAME;

#[derive(Debug, Clone)]
pub struct Bundle {
    name: Arc<str>,
    code: Arc<str>,
    digest: Arc<str>,
}

impl Bundle {
    /// Wrap already-loaded code. Empty code is rejected: it cannot expose
    /// an entry point.
    pub fn from_source(name: impl Into<String>, code: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let code = code.into();
        if code.trim().is_empty() {
            bail!("bundle {name} is empty");
        }
        let digest = format!("{:x}", Sha256::digest(code.as_bytes()));
        Ok(Self {
            name: Arc::from(name),
            code: Arc::from(code),
            digest: Arc::from(digest),
        })
    }

    /// Read a bundle from disk. The file name becomes the bundle name.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let code = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read bundle {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_BUNDLE_NAME.to_string());
        let bundle = Self::from_source(name, code)?;
        tracing::info!(
            bundle = %bundle.name,
            bytes = bundle.len(),
            digest = %bundle.short_digest(),
            "loaded bundle"
        );
        Ok(bundle)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Hex SHA-256 of the code.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// First 12 hex digits of the digest, for log lines.
    pub fn short_digest(&self) -> &str {
        &self.digest[..12]
    }
}
