//! Simulated time.
//!
//! Discrete ticks grouped into days. The clock is advanced exactly once
//! per tick by the orchestrator and never observes wall-clock time.

use crate::num::Ratio;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimClock {
    current_tick: usize,
    ticks_per_day: usize,
    num_days: usize,
}

impl SimClock {
    pub fn new(ticks_per_day: usize, num_days: usize) -> Self {
        assert!(ticks_per_day > 0, "ticks_per_day must be positive");
        assert!(num_days > 0, "num_days must be positive");
        Self {
            current_tick: 0,
            ticks_per_day,
            num_days,
        }
    }

    pub fn advance(&mut self) {
        self.current_tick += 1;
    }

    pub fn current_tick(&self) -> usize {
        self.current_tick
    }

    pub fn ticks_per_day(&self) -> usize {
        self.ticks_per_day
    }

    pub fn num_days(&self) -> usize {
        self.num_days
    }

    /// 0-indexed day of the current tick.
    pub fn current_day(&self) -> usize {
        self.current_tick / self.ticks_per_day
    }

    /// 0-indexed tick within the current day.
    pub fn tick_in_day(&self) -> usize {
        self.current_tick % self.ticks_per_day
    }

    /// Ticks left in the day, not counting the current one.
    pub fn ticks_remaining_in_day(&self) -> usize {
        self.ticks_per_day - self.tick_in_day() - 1
    }

    /// Fraction of the day elapsed, exact.
    pub fn day_progress(&self) -> Ratio {
        Ratio::new(self.tick_in_day() as i64, self.ticks_per_day as i64)
            .expect("ticks_per_day is positive")
    }

    /// True on the final tick of a day.
    pub fn is_last_tick_of_day(&self) -> bool {
        (self.current_tick + 1) % self.ticks_per_day == 0
    }

    /// Absolute index of the last tick of the current day.
    pub fn last_tick_of_current_day(&self) -> usize {
        (self.current_day() + 1) * self.ticks_per_day - 1
    }

    /// Total ticks in the episode.
    pub fn episode_ticks(&self) -> usize {
        self.ticks_per_day * self.num_days
    }

    pub fn is_finished(&self) -> bool {
        self.current_tick >= self.episode_ticks()
    }
}
