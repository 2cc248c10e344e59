use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Counting semaphore used for the flush handoff.
#[derive(Debug, Default)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        *self.permits.lock() += 1;
        self.available.notify_one();
    }

    pub fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Returns `false` if no permit arrived within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self
                .available
                .wait_until(&mut permits, deadline)
                .timed_out()
                && *permits == 0
            {
                return false;
            }
        }
        *permits -= 1;
        true
    }

    pub fn try_wait(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    pub fn available(&self) -> usize {
        *self.permits.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn permits_accumulate() {
        let sem = Semaphore::new(0);
        sem.signal();
        sem.signal();
        assert_eq!(sem.available(), 2);
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
    }

    #[test]
    fn wait_timeout_expires_without_signal() {
        let sem = Semaphore::new(0);
        let start = Instant::now();
        assert!(!sem.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wait_wakes_on_signal_from_other_thread() {
        let sem = Arc::new(Semaphore::new(0));
        let signaller = {
            let sem = sem.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                sem.signal();
            })
        };
        assert!(sem.wait_timeout(Duration::from_secs(5)));
        signaller.join().unwrap();
        assert_eq!(sem.available(), 0);
    }
}
