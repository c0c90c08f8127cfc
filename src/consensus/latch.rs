use std::sync::{Condvar, Mutex};

/// CountdownLatch blocks waiters until its count reaches zero. Counting down
/// past zero is a no-op rather than an error so that late completions during
/// shutdown stay harmless.
pub struct CountdownLatch {
    count: Mutex<usize>,
    zero: Condvar,
}

impl CountdownLatch {
    pub fn new(count: usize) -> Self {
        CountdownLatch {
            count: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock().expect("CountdownLatch.count() mutex guard poison")
    }

    /// Replaces the current count. Waiters blocked on a zero count wake up if
    /// the new count is zero.
    pub fn reset(&self, count: usize) {
        let mut current = self.count.lock().expect("CountdownLatch.reset() mutex guard poison");
        *current = count;
        if *current == 0 {
            self.zero.notify_all();
        }
    }

    pub fn count_down(&self) {
        let mut current = self
            .count
            .lock()
            .expect("CountdownLatch.count_down() mutex guard poison");
        if *current == 0 {
            return;
        }
        *current -= 1;
        if *current == 0 {
            self.zero.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut current = self.count.lock().expect("CountdownLatch.wait() mutex guard poison");
        while *current > 0 {
            current = self
                .zero
                .wait(current)
                .expect("CountdownLatch.wait() mutex guard poison");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_returns_when_counted_down() {
        let latch = Arc::new(CountdownLatch::new(2));

        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait())
        };

        latch.count_down();
        assert_eq!(latch.count(), 1);
        latch.count_down();
        waiter.join().unwrap();
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn count_down_at_zero_is_noop() {
        let latch = CountdownLatch::new(0);
        latch.count_down();
        assert_eq!(latch.count(), 0);
        latch.wait();
    }

    #[test]
    fn reset_replaces_count() {
        let latch = CountdownLatch::new(0);
        latch.reset(3);
        assert_eq!(latch.count(), 3);
        latch.reset(0);
        latch.wait();
    }
}
