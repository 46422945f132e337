//! Restart policy: whether and when to respawn a crashed service

use crate::config::RestartConfig;
use crate::runtime::process::ExitOutcome;
use std::time::Duration;

/// Default uptime after which a crash starts a fresh loop
pub const DEFAULT_STABILITY_WINDOW: Duration = Duration::from_secs(30);

/// Exponential backoff between restarts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
}

impl Backoff {
    /// `min(base * multiplier^(attempt-1), cap)`
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nanos = self.base.as_nanos() as f64 * self.multiplier.powi(exponent);
        let cap = self.cap.as_nanos() as f64;

        if !nanos.is_finite() || nanos >= cap {
            self.cap
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(30),
        }
    }
}

/// Outcome of a restart evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RestartDecision {
    /// Respawn after `delay`; `attempt` is the new consecutive-failure count
    Restart { attempt: u32, delay: Duration },
    /// The crash loop went past `max_attempts`
    Exhausted { attempt: u32 },
    /// Intentional stop, never restarted
    CleanExit,
    /// Automatic restarts are turned off for this service
    Disabled,
}

/// Per-service restart policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartPolicy {
    pub auto_restart: bool,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub stability_window: Duration,
}

impl RestartPolicy {
    pub fn from_config(config: &RestartConfig, stability_window: Duration) -> Self {
        Self {
            auto_restart: config.auto,
            max_attempts: config.max_attempts,
            backoff: Backoff {
                base: Duration::from_millis(config.backoff.base_ms),
                multiplier: config.backoff.multiplier,
                cap: Duration::from_millis(config.backoff.cap_ms),
            },
            stability_window,
        }
    }

    /// Uptime long enough that a crash no longer continues a loop
    pub fn is_stable(&self, uptime: Duration) -> bool {
        uptime >= self.stability_window
    }

    /// Decide what to do after an exit.
    ///
    /// `attempt` is the consecutive-failure count including this crash. A
    /// service that ran past the stability window restarts the count at 1.
    pub fn should_restart(
        &self,
        attempt: u32,
        exit: &ExitOutcome,
        was_running_long_enough: bool,
    ) -> RestartDecision {
        if exit.is_clean() {
            return RestartDecision::CleanExit;
        }
        if !self.auto_restart {
            return RestartDecision::Disabled;
        }

        let attempt = if was_running_long_enough {
            1
        } else {
            attempt.max(1)
        };

        if attempt > self.max_attempts {
            return RestartDecision::Exhausted { attempt };
        }

        RestartDecision::Restart {
            attempt,
            delay: self.backoff.delay(attempt),
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            auto_restart: false,
            max_attempts: 3,
            backoff: Backoff::default(),
            stability_window: DEFAULT_STABILITY_WINDOW,
        }
    }
}
