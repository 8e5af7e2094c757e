use std::path::Path;
use std::time::{Duration, Instant};

use super::constants::{IMAGE_POLL_INTERVAL_MS, IMAGE_RECHECKS, IMAGE_RECHECK_PAUSE_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Found,
    TimedOut,
}

/// A cancellable monotonic deadline bounding the wait for the next image.
///
/// Restarted every time an image is confirmed so a stale expiry can never fire
/// after data has continued to arrive.
#[derive(Debug, Clone)]
pub struct Deadline {
    timeout: Duration,
    expires: Instant,
    cancelled: bool,
}

impl Deadline {
    pub fn start(timeout: Duration) -> Self {
        Self {
            timeout,
            expires: Instant::now() + timeout,
            cancelled: false,
        }
    }

    pub fn restart(&mut self) {
        self.expires = Instant::now() + self.timeout;
        self.cancelled = false;
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// A cancelled deadline never expires
    pub fn is_expired(&self) -> bool {
        !self.cancelled && Instant::now() >= self.expires
    }

    pub fn remaining(&self) -> Duration {
        if self.cancelled {
            return self.timeout;
        }
        self.expires.saturating_duration_since(Instant::now())
    }
}

/// Polls the filesystem for images of a collection in progress
#[derive(Debug, Clone)]
pub struct FileWatcher {
    poll_interval: Duration,
    recheck_pause: Duration,
    rechecks: u32,
}

impl Default for FileWatcher {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(IMAGE_POLL_INTERVAL_MS),
            recheck_pause: Duration::from_millis(IMAGE_RECHECK_PAUSE_MS),
            rechecks: IMAGE_RECHECKS,
        }
    }
}

impl FileWatcher {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            recheck_pause: poll_interval.max(Duration::from_millis(1)),
            ..Default::default()
        }
    }

    /// Wait for an image to appear, giving up after timeout
    pub fn wait_for_image(&self, path: &Path, timeout: Duration) -> WaitOutcome {
        let mut deadline = Deadline::start(timeout);
        self.wait_until(path, &mut deadline)
    }

    /// Wait for an image to appear until the deadline expires.
    ///
    /// On expiry the path is checked again a few times to ride out network
    /// filesystem propagation delays before the image is declared missing.
    pub fn wait_until(&self, path: &Path, deadline: &mut Deadline) -> WaitOutcome {
        loop {
            if path.exists() {
                return WaitOutcome::Found;
            }
            if deadline.is_expired() {
                break;
            }
            std::thread::sleep(self.poll_interval.min(deadline.remaining()));
        }
        log::debug!("Wait for {} expired, rechecking", path.to_string_lossy());
        if self.recheck(path) {
            WaitOutcome::Found
        } else {
            WaitOutcome::TimedOut
        }
    }

    /// Non-blocking existence check with the recheck policy applied
    pub fn recheck(&self, path: &Path) -> bool {
        for _ in 0..self.rechecks {
            std::thread::sleep(self.recheck_pause);
            if path.exists() {
                return true;
            }
        }
        path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_found_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("x_0001.cbf");
        std::fs::write(&image, b"").unwrap();
        let watcher = FileWatcher::new(Duration::from_millis(5));
        assert_eq!(
            watcher.wait_for_image(&image, Duration::from_millis(20)),
            WaitOutcome::Found
        );
    }

    #[test]
    fn test_found_after_delay() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("x_0002.cbf");
        let writer_path = image.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            std::fs::write(writer_path, b"").unwrap();
        });
        let watcher = FileWatcher::new(Duration::from_millis(5));
        assert_eq!(
            watcher.wait_for_image(&image, Duration::from_secs(5)),
            WaitOutcome::Found
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("never.cbf");
        let watcher = FileWatcher::new(Duration::from_millis(2));
        assert_eq!(
            watcher.wait_for_image(&image, Duration::from_millis(10)),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn test_cancelled_deadline_does_not_expire() {
        let mut deadline = Deadline::start(Duration::from_millis(0));
        assert!(deadline.is_expired());
        deadline.cancel();
        assert!(!deadline.is_expired());
        deadline.restart();
        assert!(!deadline.is_cancelled());
    }
}
