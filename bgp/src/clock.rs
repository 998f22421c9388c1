// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Session timers. Nothing here runs on its own: the router ticks every
//! session clock from its event loop and feeds the expiries to the FSM.

use rand::Rng;
use std::time::Duration;

/// How long a session stays in the stopped state waiting for its
/// notification to drain.
pub const STOPPED_INTERVAL: Duration = Duration::from_secs(10);

/// Hold time used between sending our OPEN and receiving the peer's.
///
/// Ref: RFC 4271 §8.2.2
pub const LARGE_HOLD_INTERVAL: Duration = Duration::from_secs(240);

#[derive(Debug, Clone)]
pub struct Timer {
    /// How long a timer runs until it fires.
    pub interval: Duration,

    enabled: bool,
    remaining: Duration,
}

impl Timer {
    /// Create a new, disabled timer with the specified interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            enabled: false,
            remaining: interval,
        }
    }

    /// Make the timer tick, decrementing the value by the specified
    /// resolution. The decrement saturates, so ticking once the timer has
    /// reached zero is a no-op. Use `expired` to check for expiration.
    pub fn tick(&mut self, resolution: Duration) {
        if self.enabled {
            self.remaining = self.remaining.saturating_sub(resolution);
        }
    }

    /// Returns true if the timer is enabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Enable the timer. Only enabled timers can expire.
    pub fn enable(&mut self) {
        self.enabled = true
    }

    /// Disable the timer. Only enabled timers can expire.
    pub fn disable(&mut self) {
        self.enabled = false
    }

    /// Check if the timer has expired. Returns true if the timer is enabled
    /// and has ticked down to zero.
    pub fn expired(&self) -> bool {
        self.enabled && self.remaining.is_zero()
    }

    /// Reset the value of a timer to the timers interval.
    pub fn reset(&mut self) {
        self.remaining = self.interval;
    }

    /// Reset and enable. A timer with a zero interval stays disabled.
    pub fn restart(&mut self) {
        self.reset();
        self.enabled = !self.interval.is_zero();
    }

    /// Change the interval and restart. A zero interval leaves the timer
    /// disabled.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
        self.reset();
        if interval.is_zero() {
            self.disable();
        } else {
            self.enable();
        }
    }

    pub fn remaining(&self) -> Duration {
        self.remaining
    }
}

/// A timer that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    ConnectRetry,
    Hold,
    Keepalive,
    Stopped,
}

/// The timers of one peering session.
#[derive(Debug, Clone)]
pub struct SessionClock {
    pub connect_retry: Timer,
    pub hold: Timer,
    pub keepalive: Timer,
    pub stopped: Timer,
}

impl SessionClock {
    pub fn new(connect_retry: Duration) -> Self {
        Self {
            connect_retry: Timer::new(connect_retry),
            hold: Timer::new(LARGE_HOLD_INTERVAL),
            keepalive: Timer::new(Duration::ZERO),
            stopped: Timer::new(STOPPED_INTERVAL),
        }
    }

    /// Advance every timer by `elapsed`. Expired timers are disabled and
    /// reported, the FSM decides whether to start them again.
    pub fn tick(&mut self, elapsed: Duration) -> Vec<TimerKind> {
        let mut fired = Vec::new();
        for (kind, t) in [
            (TimerKind::ConnectRetry, &mut self.connect_retry),
            (TimerKind::Hold, &mut self.hold),
            (TimerKind::Keepalive, &mut self.keepalive),
            (TimerKind::Stopped, &mut self.stopped),
        ] {
            t.tick(elapsed);
            if t.expired() {
                t.disable();
                fired.push(kind);
            }
        }
        fired
    }

    pub fn stop_all(&mut self) {
        self.connect_retry.disable();
        self.hold.disable();
        self.keepalive.disable();
        self.stopped.disable();
    }
}

/// Scale `interval` by a random factor in [0.75, 1.0], never going below
/// one second.
///
/// Ref: RFC 4271 §10
pub fn jittered(interval: Duration) -> Duration {
    if interval.is_zero() {
        return interval;
    }
    let factor = rand::thread_rng().gen_range(0.75..=1.0);
    interval.mul_f64(factor).max(Duration::from_secs(1))
}
