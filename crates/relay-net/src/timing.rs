use std::time::{Duration, Instant};

/// Interval gate for periodic work inside a poll loop.
///
/// A fresh repeater fires on its first check; `reset` pushes the next firing
/// a full interval out, `force_fire` makes the next check fire immediately.
#[derive(Clone, Copy, Debug)]
pub struct Repeater {
    interval: Duration,
    last_acted: Option<Instant>,
}

impl Repeater {
    #[inline]
    pub fn every(interval: Duration) -> Self {
        Self { interval, last_acted: None }
    }

    #[inline]
    pub fn maybe<F>(&mut self, mut f: F)
    where
        F: FnMut(),
    {
        if self.fired() {
            f();
        }
    }

    #[inline]
    pub fn fired(&mut self) -> bool {
        let due = self.last_acted.is_none_or(|t| t.elapsed() >= self.interval);
        if due {
            self.last_acted = Some(Instant::now());
        }
        due
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn reset(&mut self) {
        self.last_acted = Some(Instant::now());
    }

    pub fn force_fire(&mut self) {
        self.last_acted = None;
    }
}

/// Run `f`, then sleep out the remainder of `min_duration` if it finished
/// early. Keeps poll loops from spinning a core.
#[inline]
pub fn pace<F, R>(min_duration: Option<Duration>, f: F) -> R
where
    F: FnOnce() -> R,
{
    match min_duration {
        Some(min) if !min.is_zero() => {
            let start_t = Instant::now();
            let out = f();
            let el = start_t.elapsed();
            if el < min {
                std::thread::sleep(min - el);
            }
            out
        }
        _ => f(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_immediately_then_waits_out_the_interval() {
        let mut r = Repeater::every(Duration::from_secs(60));
        assert!(r.fired());
        assert!(!r.fired());
        r.force_fire();
        assert!(r.fired());
    }

    #[test]
    fn reset_postpones_the_first_firing() {
        let mut r = Repeater::every(Duration::from_secs(60));
        r.reset();
        assert!(!r.fired());
    }

    #[test]
    fn pace_enforces_a_minimum_duration() {
        let start_t = Instant::now();
        pace(Some(Duration::from_millis(20)), || {});
        assert!(start_t.elapsed() >= Duration::from_millis(20));
    }
}
