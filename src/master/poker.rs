//! Leading-edge throttle for poke forwarding.
//!
//! The first call in a quiet period drains immediately; calls landing inside
//! the window coalesce into one trailing drain when the window closes, so
//! every poke is forwarded within at most one window.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Throttle {
    window: Duration,
    last_drain: Option<Instant>,
    armed: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Drain immediately.
    DrainNow,
    /// Arm a timer and drain when it fires.
    DrainAfter(Duration),
    /// A timer is already armed; nothing to do.
    Pending,
}

impl Throttle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_drain: None,
            armed: false,
        }
    }

    pub fn on_call(&mut self, now: Instant) -> ThrottleDecision {
        if self.armed {
            return ThrottleDecision::Pending;
        }
        match self.last_drain {
            Some(last) if now.duration_since(last) < self.window => {
                self.armed = true;
                ThrottleDecision::DrainAfter(self.window - now.duration_since(last))
            }
            _ => {
                self.last_drain = Some(now);
                ThrottleDecision::DrainNow
            }
        }
    }

    /// The armed timer fired; the caller drains now.
    pub fn on_timer(&mut self, now: Instant) {
        self.armed = false;
        self.last_drain = Some(now);
    }
}
