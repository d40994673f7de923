use std::time::Duration;

/// Per-chain block range size, adapted to how the source copes with it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchSize {
    value: u64,
    min: u64,
    max: u64,
    target_response_time: Duration,
    max_events: usize,
}

impl BatchSize {
    pub fn new(initial: u64, min: u64, max: u64, target_response_time: Duration, max_events: usize) -> Self {
        Self {
            value: initial.clamp(min, max),
            min,
            max,
            target_response_time,
            max_events,
        }
    }

    pub fn get(&self) -> u64 {
        self.value
    }

    /// Halves after slow or crowded responses, grows by half after fast and sparse ones
    pub fn adjust(&mut self, elapsed: Duration, events_count: usize) {
        if elapsed > self.target_response_time || events_count > self.max_events {
            self.shrink();
        } else if elapsed * 2 <= self.target_response_time && events_count * 2 <= self.max_events {
            self.grow();
        }
    }

    pub fn shrink(&mut self) {
        self.value = (self.value / 2).clamp(self.min, self.max);
    }

    pub fn grow(&mut self) {
        self.value = (self.value + (self.value / 2).max(1)).clamp(self.min, self.max);
    }
}
