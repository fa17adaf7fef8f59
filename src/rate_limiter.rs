use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, Instant};

use crate::settings::DownloadSettings;

const MIN_SLICE: u64 = 1024;
const MAX_SLICE: u64 = 64 * 1024;

/// Shares the configured speed limit between running transfers.
///
/// Every transfer gets its own [`Throttle`], a token bucket that refills at
/// the transfer's current share of the limit. The share is recalculated on
/// every request for credit, so changes to the settings or to the number of
/// running transfers apply to the next chunk.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    settings: watch::Receiver<DownloadSettings>,
    active: Arc<AtomicUsize>,
}

impl RateLimiter {
    pub fn new(settings: watch::Receiver<DownloadSettings>) -> Self {
        RateLimiter {
            settings,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Update the number of transfers in `downloading`.
    pub fn set_active(&self, count: usize) {
        self.active.store(count, Ordering::SeqCst);
    }

    /// Bytes per second a single transfer may use right now, 0 for unlimited.
    pub fn share(&self) -> u64 {
        let settings = self.settings.borrow();
        let limit = settings.speed_limit_bytes_per_sec;
        if limit == 0 || !settings.divide_speed_enabled {
            return limit;
        }
        let active = self.active.load(Ordering::SeqCst).max(1) as u64;
        (limit / active).max(1)
    }

    pub fn throttle(&self) -> Throttle {
        Throttle {
            limiter: self.clone(),
            allowance: 0f64,
            last: Instant::now(),
        }
    }
}

pub struct Throttle {
    limiter: RateLimiter,
    /// Goes negative when a chunk was bigger than the available credit, the
    /// debt is paid off by sleeping.
    allowance: f64,
    last: Instant,
}

impl Throttle {
    /// How many bytes to write before asking for credit again, about a tenth
    /// of a second worth at the current share.
    pub fn slice_len(&self) -> usize {
        match self.limiter.share() {
            0 => usize::MAX,
            rate => (rate / 10).clamp(MIN_SLICE, MAX_SLICE) as usize,
        }
    }

    /// Wait until `bytes` may be written. The connection stays open while
    /// waiting, dropping the future gives up the wait but keeps the debt.
    pub async fn acquire(&mut self, bytes: usize) {
        let now = Instant::now();
        let rate = self.limiter.share();
        if rate == 0 || bytes == 0 {
            self.allowance = 0f64;
            self.last = now;
            return;
        }

        let rate = rate as f64;
        let capacity = rate / 4f64;
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.allowance = (self.allowance + elapsed * rate).min(capacity);
        self.allowance -= bytes as f64;
        self.last = now;

        if self.allowance < 0f64 {
            sleep(Duration::from_secs_f64(-self.allowance / rate)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u64, divide: bool) -> (watch::Sender<DownloadSettings>, RateLimiter) {
        let (tx, rx) = watch::channel(DownloadSettings {
            speed_limit_bytes_per_sec: limit,
            divide_speed_enabled: divide,
            ..Default::default()
        });
        (tx, RateLimiter::new(rx))
    }

    async fn pump(mut throttle: Throttle, total: usize) -> f64 {
        let started = Instant::now();
        let mut sent = 0;
        while sent < total {
            let chunk = throttle.slice_len().min(16 * 1024).min(total - sent);
            throttle.acquire(chunk).await;
            sent += chunk;
        }
        sent as f64 / started.elapsed().as_secs_f64()
    }

    #[test]
    fn share_follows_the_mode() {
        let (_tx, divided) = limiter(1_000_000, true);
        divided.set_active(4);
        assert_eq!(divided.share(), 250_000);
        divided.set_active(0);
        assert_eq!(divided.share(), 1_000_000);

        let (_tx, full) = limiter(1_000_000, false);
        full.set_active(4);
        assert_eq!(full.share(), 1_000_000);

        let (_tx, unlimited) = limiter(0, true);
        unlimited.set_active(2);
        assert_eq!(unlimited.share(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn divided_limit_is_shared_by_concurrent_transfers() {
        let (_tx, limiter) = limiter(1_000_000, true);
        limiter.set_active(2);

        let (a, b) = tokio::join!(
            pump(limiter.throttle(), 1_500_000),
            pump(limiter.throttle(), 1_500_000)
        );
        assert!(a <= 510_000f64, "first transfer ran at {} B/s", a);
        assert!(b <= 510_000f64, "second transfer ran at {} B/s", b);
        assert!(a >= 450_000f64, "first transfer ran at {} B/s", a);
    }

    #[tokio::test(start_paused = true)]
    async fn undivided_limit_bounds_each_transfer() {
        let (_tx, limiter) = limiter(200_000, false);
        limiter.set_active(2);

        let (a, b) = tokio::join!(
            pump(limiter.throttle(), 600_000),
            pump(limiter.throttle(), 600_000)
        );
        assert!(a <= 205_000f64 && a >= 180_000f64, "ran at {} B/s", a);
        assert!(b <= 205_000f64 && b >= 180_000f64, "ran at {} B/s", b);
    }

    #[tokio::test(start_paused = true)]
    async fn raising_the_limit_applies_to_the_next_chunk() {
        let (tx, limiter) = limiter(10_000, false);
        let mut throttle = limiter.throttle();
        throttle.acquire(1_000).await;

        tx.send_replace(DownloadSettings {
            speed_limit_bytes_per_sec: 0,
            ..Default::default()
        });
        let started = Instant::now();
        throttle.acquire(1_000_000).await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(throttle.slice_len(), usize::MAX);
    }
}
