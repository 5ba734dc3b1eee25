//! Randomized, human-looking pauses between UI interactions.

use rand::Rng;
use std::ops::RangeInclusive;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    scale: f64,
}

impl Pacer {
    pub fn new(scale: f64) -> Self {
        Self {
            scale: scale.max(0.0),
        }
    }

    /// A pacer that never waits.
    pub fn instant() -> Self {
        Self::new(0.0)
    }

    /// Sleeps for a random duration drawn from `seconds`.
    pub async fn pause(&self, seconds: RangeInclusive<f64>) {
        let delay = self.pick(seconds);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Random per-keystroke delay drawn from `millis`.
    pub fn key_delay(&self, millis: RangeInclusive<u64>) -> Duration {
        if self.scale == 0.0 {
            return Duration::ZERO;
        }
        let ms = rand::thread_rng().gen_range(millis);
        Duration::from_millis(ms).mul_f64(self.scale)
    }

    fn pick(&self, seconds: RangeInclusive<f64>) -> Duration {
        if self.scale == 0.0 {
            return Duration::ZERO;
        }
        let secs = rand::thread_rng().gen_range(seconds);
        Duration::from_secs_f64(secs * self.scale)
    }
}

/// Splits text into two halves on a character boundary, so it can be typed in
/// two bursts.
pub fn halves(text: &str) -> (&str, &str) {
    let chars = text.chars().count();
    let mid = text
        .char_indices()
        .nth(chars / 2)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    text.split_at(mid)
}
