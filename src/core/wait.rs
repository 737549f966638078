use std::time::{Duration, Instant};

/// Exponential backoff: spin-yield first, then sleep with doubling intervals.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    next: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            next: initial,
            max: max.max(initial),
            attempts: 0,
        }
    }

    /// Waits for the current interval and doubles it, capped at `max`.
    pub fn snooze(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        if self.next.is_zero() {
            std::thread::yield_now();
            self.next = Duration::from_micros(1);
            return;
        }
        std::thread::sleep(self.next);
        self.next = (self.next * 2).min(self.max);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
        self.attempts = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_micros(10), Duration::from_millis(10))
    }
}

/// Retries `attempt` with backoff until it yields a value or `timeout` elapses.
///
/// `attempt` returns `Ok(Some(_))` on success, `Ok(None)` to retry and `Err` to
/// abort immediately. Expiry returns `Ok(None)`.
pub fn retry_until<T, E>(
    timeout: Duration,
    mut backoff: Backoff,
    mut attempt: impl FnMut() -> Result<Option<T>, E>,
) -> Result<Option<T>, E> {
    let start = Instant::now();
    loop {
        if let Some(value) = attempt()? {
            return Ok(Some(value));
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        backoff.snooze();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_micros(1), Duration::from_micros(4));
        for _ in 0..4 {
            backoff.snooze();
        }
        assert_eq!(backoff.attempts(), 4);
        assert_eq!(backoff.next, Duration::from_micros(4));
        backoff.reset();
        assert_eq!(backoff.next, Duration::from_micros(1));
    }

    #[test]
    fn retry_until_returns_first_success() {
        let mut calls = 0;
        let out: Result<Option<u32>, ()> = retry_until(
            Duration::from_secs(1),
            Backoff::new(Duration::ZERO, Duration::from_micros(10)),
            || {
                calls += 1;
                Ok((calls == 3).then_some(calls))
            },
        );
        assert_eq!(out, Ok(Some(3)));
    }

    #[test]
    fn retry_until_gives_up_after_timeout() {
        let out: Result<Option<()>, ()> = retry_until(
            Duration::from_millis(5),
            Backoff::new(Duration::from_micros(100), Duration::from_millis(1)),
            || Ok(None),
        );
        assert_eq!(out, Ok(None));
    }

    #[test]
    fn retry_until_propagates_errors() {
        let out: Result<Option<()>, &str> =
            retry_until(Duration::from_secs(1), Backoff::default(), || Err("fatal"));
        assert_eq!(out, Err("fatal"));
    }
}
