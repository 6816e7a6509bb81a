//! Game clock mapping wall-clock time to competition ticks.

use chrono::{DateTime, Utc};

/// Competition tick index.
pub type Tick = u64;

/// Derives the current tick from the configured game start.
///
/// Tick 0 starts at `start`. Before the start, or with no start configured,
/// the clock stays at tick 0.
#[derive(Debug, Clone)]
pub struct GameClock {
    start: Option<DateTime<Utc>>,
    tick_duration: u64,
}

impl GameClock {
    /// Create a clock. `tick_duration` is in seconds.
    pub fn new(start: Option<DateTime<Utc>>, tick_duration: u64) -> Self {
        Self {
            start,
            tick_duration: tick_duration.max(1),
        }
    }

    /// Tick at the given instant.
    pub fn tick_at(&self, now: DateTime<Utc>) -> Tick {
        let Some(start) = self.start else {
            return 0;
        };

        let elapsed = (now - start).num_seconds();
        if elapsed < 0 {
            0
        } else {
            elapsed as u64 / self.tick_duration
        }
    }

    /// Tick right now.
    pub fn current_tick(&self) -> Tick {
        self.tick_at(Utc::now())
    }
}
