//! Availability probe for `archon-probe`.
//!
//! [`probe`] decides whether the Archon integration is usable in the current
//! environment. It only inspects already-resolved [`Settings`]: no network
//! I/O, no file writes, no output. Checks run in priority order and the first
//! failing one names the reason.

use std::path::Path;

use archon_core::Settings;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Why the integration is not usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnavailableReason {
    #[error("disabled by SPECKIT_ARCHON_DISABLED")]
    DisabledByEnv,

    #[error("disabled by `enabled: false` in config")]
    DisabledByConfig,

    #[error("no Archon API endpoint configured (set ARCHON_API_URL or api_url)")]
    NoEndpoint,

    #[error("Archon API endpoint '{0}' is not an http(s) URL")]
    InvalidEndpoint(String),

    #[error("config could not be loaded: {0}")]
    Config(String),
}

/// Outcome of a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available { api_url: String },
    Unavailable(UnavailableReason),
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available { .. })
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Probe already-resolved settings.
pub fn probe(settings: &Settings) -> Availability {
    if let Err(reason) = check(settings) {
        return Availability::Unavailable(reason);
    }
    match settings.api_url() {
        Some(url) => Availability::Available {
            api_url: url.to_string(),
        },
        None => Availability::Unavailable(UnavailableReason::NoEndpoint),
    }
}

/// Resolve settings from `start` and probe them. A config that fails to load
/// counts as unavailable.
pub fn probe_at(start: &Path) -> Availability {
    match Settings::resolve(start) {
        Ok(settings) => probe(&settings),
        Err(err) => Availability::Unavailable(UnavailableReason::Config(err.to_string())),
    }
}

/// `true` iff the integration is usable from `start`.
pub fn is_available(start: &Path) -> bool {
    probe_at(start).is_available()
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

fn check(settings: &Settings) -> Result<(), UnavailableReason> {
    if settings.disabled_by_env {
        return Err(UnavailableReason::DisabledByEnv);
    }
    if !settings.config.enabled {
        return Err(UnavailableReason::DisabledByConfig);
    }
    let Some(url) = settings.api_url() else {
        return Err(UnavailableReason::NoEndpoint);
    };
    if !is_http_url(url) {
        return Err(UnavailableReason::InvalidEndpoint(url.to_string()));
    }
    Ok(())
}

fn is_http_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    matches!(rest, Some(host) if !host.is_empty() && !host.starts_with('/'))
}
