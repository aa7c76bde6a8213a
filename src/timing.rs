//! Interaction-time accounting.
//!
//! `timeOfLastInteraction` only moves forward, and only when a command's
//! effect is defined as mutating; `adjustedToLatestInteraction` keeps the
//! next selector/condition wait from stacking its own timeout on top of
//! however long the previous mutating command already took in wall time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Tracks the instant of the most recent mutating command. Owned
/// exclusively by the flow task; reads and writes never race because only
/// one task drives a given flow instance.
pub struct InteractionClock {
    start: Instant,
    last_interaction_millis: AtomicU64,
}

impl InteractionClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            last_interaction_millis: AtomicU64::new(0),
        }
    }

    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Records "now" as the time of the latest interaction. Call only for
    /// commands whose effect is mutating.
    pub fn mark_interaction(&self) {
        self.last_interaction_millis
            .store(self.now_millis(), Ordering::Relaxed);
    }

    /// `adjustedToLatestInteraction(t) = max(0, t - (now - timeOfLastInteraction))`.
    /// Applied only to selector/condition waits, never to AI calls or
    /// command-specified durations.
    pub fn adjusted(&self, timeout: Duration) -> Duration {
        let last = self.last_interaction_millis.load(Ordering::Relaxed);
        if last == 0 {
            return timeout;
        }
        let elapsed_since = self.now_millis().saturating_sub(last);
        timeout.saturating_sub(Duration::from_millis(elapsed_since))
    }
}

impl Default for InteractionClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unadjusted_before_any_interaction() {
        let clock = InteractionClock::new();
        assert_eq!(clock.adjusted(Duration::from_millis(500)), Duration::from_millis(500));
    }

    #[test]
    fn shrinks_after_a_slow_interaction() {
        let clock = InteractionClock::new();
        clock.mark_interaction();
        std::thread::sleep(Duration::from_millis(50));
        let adjusted = clock.adjusted(Duration::from_millis(500));
        assert!(adjusted <= Duration::from_millis(500));
    }

    #[test]
    fn never_goes_negative() {
        let clock = InteractionClock::new();
        clock.mark_interaction();
        std::thread::sleep(Duration::from_millis(20));
        let adjusted = clock.adjusted(Duration::from_millis(1));
        assert_eq!(adjusted, Duration::ZERO);
    }
}
