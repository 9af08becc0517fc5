use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Wall-clock source for computing fire times
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall time derived from the tokio clock, starting at a fixed instant.
///
/// Under a paused tokio runtime the trigger sleeps and this clock advance
/// together, so minute boundaries are reached deterministically.
#[derive(Debug, Clone, Copy)]
pub struct PausedClock {
    base: DateTime<Utc>,
    anchor: Instant,
}

impl PausedClock {
    pub fn starting_at(base: DateTime<Utc>) -> Self {
        Self {
            base,
            anchor: Instant::now(),
        }
    }
}

impl Clock for PausedClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.anchor);
        self.base + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_paused_clock_follows_tokio_time() {
        let base = DateTime::parse_from_rfc3339("2024-01-01T00:00:30Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = PausedClock::starting_at(base);
        assert_eq!(clock.now(), base);

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!((clock.now() - base).num_seconds(), 90);
    }
}
