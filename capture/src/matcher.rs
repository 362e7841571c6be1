//! Dispatch matcher
//!
//! Per-session selector. Counts every inspected dispatch per kernel object
//! and fires exactly once, on the first dispatch whose kernel name matches
//! the configured pattern at the configured occurrence index.

use std::collections::HashMap;
use std::env;

use regex::Regex;
use tracing::{info, warn};

/// `ISOLATE_KERNEL`: pattern matched (unanchored) against the demangled, else
/// mangled, kernel name.
pub const ENV_KERNEL: &str = "ISOLATE_KERNEL";
/// `ISOLATE_DISPATCH_INDEX`: zero-based occurrence index within the matched
/// kernel.
pub const ENV_DISPATCH_INDEX: &str = "ISOLATE_DISPATCH_INDEX";

/// Immutable session configuration. Absent configuration disables capture.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub pattern: Regex,
    pub target_index: u64,
}

impl CaptureConfig {
    pub fn new(pattern: &str, target_index: u64) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            target_index,
        })
    }

    /// Read the session configuration from the environment. Both variables
    /// must be present; a pattern that fails to compile or an unparseable
    /// index disables capture for the session.
    pub fn from_env() -> Option<Self> {
        let pattern = env::var(ENV_KERNEL).ok()?;
        let index = env::var(ENV_DISPATCH_INDEX).ok()?;

        let target_index: u64 = match index.parse() {
            Ok(v) => v,
            Err(e) => {
                warn!("{ENV_DISPATCH_INDEX}={index:?} is not a valid index ({e}); capture disabled");
                return None;
            }
        };

        match Self::new(&pattern, target_index) {
            Ok(config) => {
                info!(
                    "capture armed: kernel pattern {:?}, dispatch index {}",
                    pattern, target_index
                );
                Some(config)
            }
            Err(e) => {
                warn!("{ENV_KERNEL}={pattern:?} does not compile ({e}); capture disabled");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Not the selected dispatch; pass the packet through.
    Pass,
    /// This dispatch is the one. Fires at most once per session.
    Fire { index: u64 },
}

/// One-shot matcher state. Callers hold the one lock around [`observe`]
/// (`Engine` wraps the matcher in a `Mutex`); the snapshot itself runs after
/// the lock is dropped.
///
/// [`observe`]: DispatchMatcher::observe
pub struct DispatchMatcher {
    config: Option<CaptureConfig>,
    counters: HashMap<u64, u64>,
    done: bool,
}

impl DispatchMatcher {
    pub fn new(config: Option<CaptureConfig>) -> Self {
        Self {
            config,
            counters: HashMap::new(),
            done: false,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.is_some()
    }

    pub fn fired(&self) -> bool {
        self.done
    }

    /// Count this dispatch against its kernel object and decide. The counter
    /// always advances, whether or not capture is enabled or already done, so
    /// occurrence indices agree with submission order per kernel object.
    pub fn observe(&mut self, kernel_object: u64, name: &str) -> MatchOutcome {
        let counter = self.counters.entry(kernel_object).or_insert(0);
        let index = *counter;
        *counter += 1;

        if self.done {
            return MatchOutcome::Pass;
        }
        let Some(config) = &self.config else {
            return MatchOutcome::Pass;
        };
        if config.pattern.is_match(name) && index == config.target_index {
            self.done = true;
            return MatchOutcome::Fire { index };
        }
        MatchOutcome::Pass
    }

    /// Dispatches observed so far for a kernel object.
    pub fn occurrences(&self, kernel_object: u64) -> u64 {
        self.counters.get(&kernel_object).copied().unwrap_or(0)
    }
}
