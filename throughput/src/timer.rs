use quanta::{Clock, Instant};

use crate::{Error, Result, TimingSample};

/// Monotonic wall-clock source shared by every timed section of a run.
#[derive(Clone)]
pub struct Timer {
    clock: Clock,
}

impl Timer {
    pub fn new() -> Result<Self> {
        Self::with_clock(Clock::new())
    }

    pub fn with_clock(clock: Clock) -> Result<Self> {
        let first = clock.now();
        let second = clock.now();
        if second < first {
            return Err(Error::ClockUnavailable(
                "clock went backwards while calibrating".into(),
            ));
        }
        Ok(Self { clock })
    }

    pub fn start(&self) -> Stopwatch<'_> {
        let now = self.clock.now();
        Stopwatch { clock: &self.clock, started: now, last: now }
    }

    pub fn time<R>(&self, label: &str, f: impl FnOnce() -> R) -> (R, TimingSample) {
        let watch = self.start();
        let out = f();
        (out, watch.stop(label))
    }
}

/// Scoped measurement. `lap` splits phases, `stop` closes the whole span.
pub struct Stopwatch<'a> {
    clock: &'a Clock,
    started: Instant,
    last: Instant,
}

impl Stopwatch<'_> {
    pub fn lap(&mut self, label: &str) -> TimingSample {
        let now = self.clock.now();
        let sample = sample(label, now.duration_since(self.last));
        self.last = now;
        sample
    }

    pub fn stop(self, label: &str) -> TimingSample {
        sample(label, self.clock.now().duration_since(self.started))
    }
}

fn sample(label: &str, elapsed: std::time::Duration) -> TimingSample {
    TimingSample {
        label: label.to_string(),
        elapsed_ms: elapsed.as_secs_f64() * 1000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_mock_clock_laps() {
        let (clock, mock) = Clock::mock();
        let timer = Timer::with_clock(clock).unwrap();
        let mut watch = timer.start();
        mock.increment(Duration::from_millis(3));
        let upload = watch.lap("upload");
        mock.increment(Duration::from_millis(5));
        let kernel = watch.lap("kernel");
        let total = watch.stop("total");

        assert_eq!(upload.label, "upload");
        assert!((upload.elapsed_ms - 3.0).abs() < 1e-9);
        assert!((kernel.elapsed_ms - 5.0).abs() < 1e-9);
        assert!((total.elapsed_ms - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_time_closure() {
        let timer = Timer::new().unwrap();
        let (value, sample) = timer.time("serial", || 21 * 2);
        assert_eq!(value, 42);
        assert_eq!(sample.label, "serial");
        assert!(sample.elapsed_ms >= 0.0);
    }
}
