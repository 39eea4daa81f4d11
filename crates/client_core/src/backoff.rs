use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Fraction of the delay randomized in both directions, 0.0..=1.0.
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Delay before the next attempt once `failures` attempts in a row have failed.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.base
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    Ready,
    Wait(Duration),
    Exhausted { attempts: u32 },
}

/// Reconnect gate: consecutive failure count plus the earliest instant another attempt is allowed.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    policy: BackoffPolicy,
    failures: u32,
    next_allowed_at: Option<Instant>,
}

impl ReconnectBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            next_allowed_at: None,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn decide(&self, now: Instant) -> BackoffDecision {
        if self.failures >= self.policy.max_attempts {
            return BackoffDecision::Exhausted {
                attempts: self.failures,
            };
        }
        match self.next_allowed_at {
            Some(at) if at > now => BackoffDecision::Wait(at - now),
            _ => BackoffDecision::Ready,
        }
    }

    /// Records a failed attempt and returns the (jittered) wait before the next one.
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.jittered(self.policy.delay_for(self.failures));
        self.next_allowed_at = Some(now + delay);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.next_allowed_at = None;
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        delay.mul_f64(factor).min(self.policy.max_delay)
    }
}
