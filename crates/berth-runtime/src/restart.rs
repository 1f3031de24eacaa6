//! Restart policies for crashed workers.
//!
//! A policy is only consulted for crashes; a worker that terminated cleanly
//! is never restarted. `attempt` counts consecutive crashes of one worker
//! slot, starting at 1, and resets once the worker has been stable.

use std::fmt;
use std::time::Duration;

use berth_common::config::SupervisorSettings;
use berth_compose::service::RestartSpec;

use crate::worker::WorkerExit;

/// Decides whether and when a crashed worker is replaced.
pub trait RestartPolicy: Send + Sync + fmt::Debug {
    /// Returns whether the worker should be restarted after its
    /// `attempt`-th consecutive crash.
    fn should_restart(&self, attempt: u32, last_exit: &WorkerExit) -> bool;

    /// Returns how long to wait before the restart.
    fn backoff(&self, attempt: u32) -> Duration;

    /// Returns whether the policy never gives up.
    fn is_unbounded(&self) -> bool {
        false
    }
}

/// Capped exponential backoff: `initial * 2^(attempt-1)`, at most `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first restart.
    pub initial: Duration,
    /// Upper bound on the delay.
    pub max: Duration,
}

impl Backoff {
    /// Builds the backoff from supervisor settings.
    #[must_use]
    pub const fn from_settings(settings: &SupervisorSettings) -> Self {
        Self {
            initial: settings.backoff_initial(),
            max: settings.backoff_max(),
        }
    }

    /// Returns the delay for a 1-based attempt.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1_u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_settings(&SupervisorSettings::default())
    }
}

/// Restart unconditionally, with no bound on retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct Always {
    /// Delay schedule.
    pub backoff: Backoff,
}

impl RestartPolicy for Always {
    fn should_restart(&self, _attempt: u32, _last_exit: &WorkerExit) -> bool {
        true
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    fn is_unbounded(&self) -> bool {
        true
    }
}

/// Never restart.
#[derive(Debug, Clone, Copy, Default)]
pub struct Never;

impl RestartPolicy for Never {
    fn should_restart(&self, _attempt: u32, _last_exit: &WorkerExit) -> bool {
        false
    }

    fn backoff(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Restart after crashes, up to `max_retries` consecutive attempts.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnFailure {
    /// Consecutive restart limit; unbounded when absent.
    pub max_retries: Option<u32>,
    /// Delay schedule.
    pub backoff: Backoff,
}

impl RestartPolicy for OnFailure {
    fn should_restart(&self, attempt: u32, last_exit: &WorkerExit) -> bool {
        !last_exit.is_clean() && self.max_retries.is_none_or(|max| attempt <= max)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    fn is_unbounded(&self) -> bool {
        self.max_retries.is_none()
    }
}

/// Builds the policy for a service's restart setting.
#[must_use]
pub fn policy_for(spec: RestartSpec, settings: &SupervisorSettings) -> Box<dyn RestartPolicy> {
    let backoff = Backoff::from_settings(settings);
    match spec {
        RestartSpec::Always | RestartSpec::UnlessStopped => Box::new(Always { backoff }),
        RestartSpec::No => Box::new(Never),
        RestartSpec::OnFailure { max_retries } => Box::new(OnFailure {
            max_retries,
            backoff,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crash() -> WorkerExit {
        WorkerExit {
            code: Some(1),
            signal: None,
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(9), Duration::from_millis(25_600));
        assert_eq!(backoff.delay(10), Duration::from_secs(30));
        assert_eq!(backoff.delay(200), Duration::from_secs(30));
    }

    #[test]
    fn always_restarts_without_bound() {
        let policy = Always::default();
        assert!(policy.should_restart(1, &crash()));
        assert!(policy.should_restart(10_000, &crash()));
        assert!(policy.is_unbounded());
    }

    #[test]
    fn never_does_not_restart() {
        assert!(!Never.should_restart(1, &crash()));
    }

    #[test]
    fn on_failure_respects_retry_limit() {
        let policy = OnFailure {
            max_retries: Some(3),
            backoff: Backoff::default(),
        };
        assert!(policy.should_restart(3, &crash()));
        assert!(!policy.should_restart(4, &crash()));
        assert!(!policy.is_unbounded());

        let clean = WorkerExit {
            code: Some(0),
            signal: None,
        };
        assert!(!policy.should_restart(1, &clean));
    }

    #[test]
    fn policy_for_maps_every_spec() {
        let settings = SupervisorSettings::default();
        assert!(policy_for(RestartSpec::Always, &settings).is_unbounded());
        assert!(policy_for(RestartSpec::UnlessStopped, &settings).is_unbounded());
        assert!(!policy_for(RestartSpec::No, &settings).should_restart(1, &crash()));
        let bounded = policy_for(RestartSpec::OnFailure { max_retries: Some(1) }, &settings);
        assert!(bounded.should_restart(1, &crash()));
        assert!(!bounded.should_restart(2, &crash()));
    }
}
