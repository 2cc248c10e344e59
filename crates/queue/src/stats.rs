use serde::Serialize;
use std::time::Duration;

/// Counters published by the render thread after every drain.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchStats {
    pub drains: u64,
    pub commands_executed: u64,
    pub frames_presented: u64,
    pub failures: u64,
    /// Presents that had to rebuild the swapchain or device.
    pub recoveries: u64,
    pub last_drain: Duration,
    pub average_drain: Duration,
    pub max_drain: Duration,
}

/// Rolling window of drain durations.
#[derive(Debug)]
pub struct DrainTimer {
    history: Vec<Duration>,
    index: usize,
    filled: bool,
}

impl DrainTimer {
    pub fn new(window: usize) -> Self {
        Self {
            history: vec![Duration::ZERO; window.max(1)],
            index: 0,
            filled: false,
        }
    }

    pub fn record(&mut self, dt: Duration) {
        self.history[self.index] = dt;
        self.index = (self.index + 1) % self.history.len();
        if self.index == 0 {
            self.filled = true;
        }
    }

    fn window(&self) -> &[Duration] {
        let count = if self.filled {
            self.history.len()
        } else {
            self.index
        };
        &self.history[..count]
    }

    pub fn average(&self) -> Duration {
        let samples = self.window();
        if samples.is_empty() {
            return Duration::ZERO;
        }
        samples.iter().sum::<Duration>() / samples.len() as u32
    }

    pub fn max(&self) -> Duration {
        self.window().iter().copied().max().unwrap_or(Duration::ZERO)
    }

    pub fn count(&self) -> usize {
        self.window().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_recorded_drains() {
        let mut timer = DrainTimer::new(4);
        assert_eq!(timer.average(), Duration::ZERO);
        timer.record(Duration::from_micros(100));
        timer.record(Duration::from_micros(300));
        assert_eq!(timer.count(), 2);
        assert_eq!(timer.average(), Duration::from_micros(200));
        assert_eq!(timer.max(), Duration::from_micros(300));
    }

    #[test]
    fn window_drops_oldest() {
        let mut timer = DrainTimer::new(2);
        timer.record(Duration::from_millis(50));
        timer.record(Duration::from_millis(10));
        timer.record(Duration::from_millis(30));
        assert_eq!(timer.count(), 2);
        assert_eq!(timer.max(), Duration::from_millis(30));
        assert_eq!(timer.average(), Duration::from_millis(20));
    }
}
