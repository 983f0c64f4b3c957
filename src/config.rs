//! Form engine configuration.

use std::time::Duration;

/// Tunables for a `Form`.
#[derive(Debug, Clone, PartialEq)]
pub struct FormConfig {
    /// Upper bound on recompute runs in a single `settle()`. Hitting it drops
    /// outstanding work and reports the pass as not converged.
    pub max_recomputes_per_settle: usize,

    /// Per-call limit on lookup resolvers. `None` waits indefinitely.
    pub lookup_timeout: Option<Duration>,

    /// Whether change events are emitted.
    pub events_enabled: bool,

    /// Change event channel capacity.
    ///
    /// - Too small: drops events between drains
    /// - Default: 4096
    pub event_buffer: usize,
}

impl Default for FormConfig {
    fn default() -> Self {
        Self {
            max_recomputes_per_settle: 1000,
            lookup_timeout: Some(Duration::from_secs(10)),
            events_enabled: true,
            event_buffer: 4096,
        }
    }
}

impl FormConfig {
    /// Defaults overridden by `FORMFLOW_MAX_RECOMPUTES`,
    /// `FORMFLOW_LOOKUP_TIMEOUT_MS` (`0` disables) and `FORMFLOW_EVENT_BUFFER`.
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str| std::env::var(name).ok().and_then(|s| s.trim().parse::<u64>().ok());

        Self {
            max_recomputes_per_settle: var("FORMFLOW_MAX_RECOMPUTES")
                .map(|n| n as usize)
                .unwrap_or(defaults.max_recomputes_per_settle),
            lookup_timeout: match var("FORMFLOW_LOOKUP_TIMEOUT_MS") {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => defaults.lookup_timeout,
            },
            event_buffer: var("FORMFLOW_EVENT_BUFFER")
                .map(|n| n.max(1) as usize)
                .unwrap_or(defaults.event_buffer),
            ..defaults
        }
    }

    /// Events off.
    pub fn quiet() -> Self {
        Self {
            events_enabled: false,
            ..Default::default()
        }
    }

    pub fn max_recomputes_per_settle(mut self, limit: usize) -> Self {
        self.max_recomputes_per_settle = limit;
        self
    }

    pub fn lookup_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    pub fn events_enabled(mut self, enabled: bool) -> Self {
        self.events_enabled = enabled;
        self
    }

    pub fn event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size.max(1);
        self
    }
}
