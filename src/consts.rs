//! Project-wide constants.

use std::time::Duration;

/// How long one render may take before its engine is presumed wedged.
pub const DEFAULT_RENDER_DEADLINE: Duration = Duration::from_secs(1);

/// Name of the function the bundle must expose: `main(params, callback)`.
pub const ENTRY_POINT: &str = "main";

/// Default name for a bundle loaded from a string.
pub const DEFAULT_BUNDLE_NAME: &str = "bundle.js";

/// What some engines hand to the callback when it is called with nothing.
pub const UNDEFINED_SENTINEL: &str = "undefined";

pub const NO_RESULT_MESSAGE: &str = "no result returned from rendering engine";

/// Request headers forwarded to the engine's own outbound calls by default.
pub const FORWARDED_HEADERS: &[&str] = &["Cookie"];
