//! Polled interval timer.
//!
//! A [`PeriodicTrigger`] does not own its callback. The caller polls it every
//! scheduler tick and runs the work itself when [`PeriodicTrigger::poll`]
//! reports a fire.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Times(u32),
    Forever,
}

#[derive(Debug, Clone)]
pub struct PeriodicTrigger {
    interval_ms: u64,
    repeat: Repeat,
    remaining: Option<u32>,
    next_fire_ms: u64,
    armed: bool,
    fired: u32,
}

impl PeriodicTrigger {
    pub fn new(interval_ms: u64, repeat: Repeat) -> Self {
        Self {
            interval_ms,
            repeat,
            remaining: None,
            next_fire_ms: 0,
            armed: false,
            fired: 0,
        }
    }

    pub fn once(interval_ms: u64) -> Self {
        Self::new(interval_ms, Repeat::Times(1))
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Number of fires since the last `start`.
    pub fn fired(&self) -> u32 {
        self.fired
    }

    pub fn next_fire_ms(&self) -> Option<u64> {
        self.armed.then_some(self.next_fire_ms)
    }

    /// Arms the trigger; the first fire is one interval after `now_ms`.
    pub fn start(&mut self, now_ms: u64) {
        self.remaining = match self.repeat {
            Repeat::Times(count) => Some(count),
            Repeat::Forever => None,
        };
        self.fired = 0;
        self.next_fire_ms = now_ms.saturating_add(self.interval_ms);
        self.armed = self.remaining != Some(0);
    }

    pub fn stop(&mut self) {
        self.armed = false;
    }

    /// Returns true when the deadline has passed. Fires at most once per call.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        if !self.armed || now_ms < self.next_fire_ms {
            return false;
        }

        self.fired = self.fired.saturating_add(1);
        self.next_fire_ms = now_ms.saturating_add(self.interval_ms);

        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.armed = false;
            }
        }

        true
    }
}
