//! Runtime capability detection.
//!
//! The process inspects a handful of environment signals once and derives
//! an immutable [`RuntimeCapabilities`] snapshot. Components consult the
//! snapshot before attempting anything a restricted runtime forbids
//! (opening a socket to the distributed cache, touching the filesystem,
//! loading the heavyweight database driver).
//!
//! Detection itself is pure: [`RuntimeCapabilities::detect`] maps
//! [`EnvironmentSignals`] to booleans and can be driven directly in tests.
//! [`RuntimeCapabilities::current`] reads the real signals the first time it
//! is called and caches the result for the life of the process.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Environment variable holding the process mode.
pub const ENV_MODE: &str = "MATHILDA_ENV";
/// Environment variable set by test harnesses.
pub const ENV_TEST_HARNESS: &str = "MATHILDA_TEST_HARNESS";
/// Environment variable naming the runtime flavour (`edge` for edge-style runtimes).
pub const ENV_RUNTIME: &str = "MATHILDA_RUNTIME";

static CURRENT: Lazy<RuntimeCapabilities> =
    Lazy::new(|| RuntimeCapabilities::detect(&EnvironmentSignals::from_process()));

/// Process mode, as declared by `MATHILDA_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessMode {
    Development,
    Production,
    Test,
}

impl FromStr for ProcessMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            _ => Err(()),
        }
    }
}

/// Raw signals the detector looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSignals {
    /// Compiled for a browser host.
    pub browser_global: bool,
    /// An edge-style runtime marker is present.
    pub edge_runtime_marker: bool,
    /// A test harness announced itself.
    pub test_harness: bool,
    /// Raw value of the process mode variable, if any.
    pub mode: Option<String>,
}

impl EnvironmentSignals {
    /// Read signals from the compilation target and the process environment.
    pub fn from_process() -> Self {
        Self::from_source(
            cfg!(all(target_arch = "wasm32", target_os = "unknown")),
            |key| std::env::var(key).ok(),
        )
    }

    /// Build signals from an arbitrary variable lookup.
    pub fn from_source<F>(browser_global: bool, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let edge_runtime_marker = lookup(ENV_RUNTIME)
            .map(|v| v.trim().eq_ignore_ascii_case("edge"))
            .unwrap_or(false);

        let test_harness = lookup(ENV_TEST_HARNESS)
            .map(|v| {
                let v = v.trim().to_ascii_lowercase();
                !v.is_empty() && v != "0" && v != "false"
            })
            .unwrap_or(false);

        Self {
            browser_global,
            edge_runtime_marker,
            test_harness,
            mode: lookup(ENV_MODE),
        }
    }
}

/// Capabilities that can be queried by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Feature {
    DistributedCache,
    HeavyweightDriver,
    Filesystem,
    BrowserStorage,
}

impl Feature {
    /// Every feature, in table order.
    pub const ALL: [Feature; 4] = [
        Feature::DistributedCache,
        Feature::HeavyweightDriver,
        Feature::Filesystem,
        Feature::BrowserStorage,
    ];

    /// Name used by [`RuntimeCapabilities::is_feature_available`].
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::DistributedCache => "distributedCache",
            Feature::HeavyweightDriver => "heavyweightDriver",
            Feature::Filesystem => "filesystem",
            Feature::BrowserStorage => "browserStorage",
        }
    }

    /// Look up a feature by its table name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == name)
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of what the current runtime permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCapabilities {
    pub is_browser_context: bool,
    pub is_server_process: bool,
    pub is_edge_runtime: bool,
    pub is_test_harness: bool,
    pub is_development: bool,
    pub is_production: bool,
    pub can_use_distributed_cache: bool,
    pub can_use_heavyweight_driver: bool,
    pub can_use_filesystem: bool,
    pub can_use_browser_storage: bool,
}

impl RuntimeCapabilities {
    /// Derive capabilities from raw signals.
    ///
    /// An absent or unrecognised mode is treated as development, so every
    /// field is always a concrete boolean.
    pub fn detect(signals: &EnvironmentSignals) -> Self {
        let mode = signals
            .mode
            .as_deref()
            .and_then(|m| m.parse::<ProcessMode>().ok())
            .unwrap_or(ProcessMode::Development);

        let is_browser_context = signals.browser_global;
        let is_server_process = !is_browser_context;
        let is_edge_runtime = is_server_process && signals.edge_runtime_marker;
        let is_test_harness = signals.test_harness || mode == ProcessMode::Test;

        let can_use_heavyweight_driver = is_server_process && !is_edge_runtime;
        let can_use_filesystem = is_server_process && !is_edge_runtime;
        // Test harnesses never talk to a live distributed cache.
        let can_use_distributed_cache = can_use_heavyweight_driver && !is_test_harness;

        Self {
            is_browser_context,
            is_server_process,
            is_edge_runtime,
            is_test_harness,
            is_development: mode == ProcessMode::Development,
            is_production: mode == ProcessMode::Production,
            can_use_distributed_cache,
            can_use_heavyweight_driver,
            can_use_filesystem,
            can_use_browser_storage: is_browser_context,
        }
    }

    /// The snapshot for this process, computed on first use.
    pub fn current() -> &'static RuntimeCapabilities {
        &CURRENT
    }

    /// A full server process in production mode.
    pub fn server() -> Self {
        Self::detect(&EnvironmentSignals {
            mode: Some("production".to_string()),
            ..Default::default()
        })
    }

    /// An edge-style runtime: no sockets to the cache, no heavy driver.
    pub fn edge() -> Self {
        Self::detect(&EnvironmentSignals {
            edge_runtime_marker: true,
            mode: Some("production".to_string()),
            ..Default::default()
        })
    }

    /// A test harness process.
    pub fn test_harness() -> Self {
        Self::detect(&EnvironmentSignals {
            test_harness: true,
            mode: Some("test".to_string()),
            ..Default::default()
        })
    }

    /// Typed capability lookup.
    pub fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::DistributedCache => self.can_use_distributed_cache,
            Feature::HeavyweightDriver => self.can_use_heavyweight_driver,
            Feature::Filesystem => self.can_use_filesystem,
            Feature::BrowserStorage => self.can_use_browser_storage,
        }
    }

    /// Capability lookup by name.
    ///
    /// Unknown names return `None` rather than an error: callers are
    /// expected to ask only for names in [`Feature::ALL`].
    pub fn is_feature_available(&self, name: &str) -> Option<bool> {
        Feature::from_name(name).map(|f| self.supports(f))
    }

    /// Run `f` only when `feature` is available.
    ///
    /// Returns `fallback` when the feature is unavailable or when `f`
    /// fails or panics; failures are logged, never propagated.
    pub fn if_runtime_supports<T, E, F>(&self, feature: Feature, f: F, fallback: T) -> T
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Display,
    {
        if !self.supports(feature) {
            tracing::debug!(%feature, "Feature unavailable in this runtime");
            return fallback;
        }
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                tracing::warn!(%feature, error = %e, "Runtime-restricted operation failed");
                fallback
            }
            Err(_) => {
                tracing::warn!(%feature, "Runtime-restricted operation panicked");
                fallback
            }
        }
    }

    /// Async twin of [`if_runtime_supports`](Self::if_runtime_supports).
    pub async fn if_runtime_supports_async<T, E, F, Fut>(
        &self,
        feature: Feature,
        f: F,
        fallback: T,
    ) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        if !self.supports(feature) {
            tracing::debug!(%feature, "Feature unavailable in this runtime");
            return fallback;
        }
        match f().await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(%feature, error = %e, "Runtime-restricted operation failed");
                fallback
            }
        }
    }
}
