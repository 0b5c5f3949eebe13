//! Bandwidth throttling for transfers.
//!
//! A single [`RateLimiter`] is shared by every transfer in a run, so the
//! configured rate caps the aggregate bandwidth rather than each stream.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Bits in one megabit, as the throttle flag counts them.
pub const BITS_PER_MEGABIT: u64 = 1024 * 1024;

/// Burst headroom granted on top of the sustained rate.
pub const DEFAULT_BURST: Duration = Duration::from_secs(5);

/// Token bucket measured in bytes.
#[derive(Debug)]
pub struct RateLimiter {
    bytes_per_sec: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    available: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Creates a limiter for `bytes_per_sec` with `burst` worth of headroom.
    pub fn new(bytes_per_sec: u64, burst: Duration) -> Self {
        let rate = bytes_per_sec.max(1) as f64;
        let capacity = (rate * burst.as_secs_f64()).max(1.0);
        Self {
            bytes_per_sec: rate,
            capacity,
            bucket: Mutex::new(Bucket {
                available: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Creates a shared limiter from a rate in bits per second. `0` means unlimited.
    pub fn from_bits_per_sec(bits_per_sec: u64) -> Option<Arc<Self>> {
        if bits_per_sec == 0 {
            return None;
        }
        Some(Arc::new(Self::new((bits_per_sec / 8).max(1), DEFAULT_BURST)))
    }

    /// Creates a shared limiter from a rate in megabits per second. `0` means unlimited.
    pub fn from_megabits(megabits_per_sec: u64) -> Option<Arc<Self>> {
        Self::from_bits_per_sec(megabits_per_sec.saturating_mul(BITS_PER_MEGABIT))
    }

    /// Sustained rate in bytes per second.
    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec as u64
    }

    /// Charges `n` bytes and returns how long the caller must pause before
    /// reading more. The bucket may go into debt; the pause repays it.
    fn consume(&self, n: usize) -> Duration {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.available = (bucket.available + elapsed * self.bytes_per_sec).min(self.capacity);
        bucket.last_refill = now;
        bucket.available -= n as f64;

        if bucket.available >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.available / self.bytes_per_sec)
        }
    }
}

/// Reader that paces the wrapped reader through an optional [`RateLimiter`].
///
/// Without a limiter it is a plain pass-through. Errors and EOF from the
/// inner reader are returned unchanged.
pub struct Throttled<R> {
    inner: R,
    limiter: Option<Arc<RateLimiter>>,
    delay: Option<Pin<Box<Sleep>>>,
}

impl<R> Throttled<R> {
    pub fn new(inner: R, limiter: Option<Arc<RateLimiter>>) -> Self {
        Self {
            inner,
            limiter,
            delay: None,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Throttled<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(delay) = this.delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            this.delay = None;
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let read = buf.filled().len() - before;

        if let Some(limiter) = &this.limiter {
            let wait = limiter.consume(read);
            if !wait.is_zero() {
                this.delay = Some(Box::pin(tokio::time::sleep(wait)));
            }
        }

        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_zero_is_unlimited() {
        assert!(RateLimiter::from_bits_per_sec(0).is_none());
        assert!(RateLimiter::from_megabits(0).is_none());
    }

    #[test]
    fn test_megabit_conversion() {
        let limiter = RateLimiter::from_megabits(200).unwrap();
        assert_eq!(limiter.bytes_per_sec(), 200 * 1024 * 1024 / 8);
    }

    #[tokio::test]
    async fn test_passthrough_without_limiter() {
        let data = vec![7u8; 10_000];
        let mut reader = Throttled::new(&data[..], None);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_rate_is_capped() {
        let limiter = Arc::new(RateLimiter::new(1_000, Duration::from_secs(1)));
        let data = vec![1u8; 5_000];

        let start = Instant::now();
        let mut reader = Throttled::new(&data[..], Some(limiter));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(out.len(), 5_000);
        // 1s of burst is free, the remaining 4000 bytes take 4s at 1000 B/s.
        assert!(elapsed >= Duration::from_millis(3_900), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(6), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_not_penalised() {
        let limiter = Arc::new(RateLimiter::new(1_000, Duration::from_secs(5)));
        let data = vec![1u8; 4_000];

        let start = Instant::now();
        let mut reader = Throttled::new(&data[..], Some(limiter));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_is_shared_between_readers() {
        let limiter = Arc::new(RateLimiter::new(1_000, Duration::from_secs(1)));
        let a = vec![1u8; 2_000];
        let b = vec![2u8; 2_000];

        let start = Instant::now();
        let mut first = Throttled::new(&a[..], Some(limiter.clone()));
        let mut second = Throttled::new(&b[..], Some(limiter));
        let (mut out_a, mut out_b) = (Vec::new(), Vec::new());
        let (ra, rb) = tokio::join!(first.read_to_end(&mut out_a), second.read_to_end(&mut out_b));
        ra.unwrap();
        rb.unwrap();

        // 4000 bytes total, 1000 of burst: about 3s regardless of the split.
        assert!(start.elapsed() >= Duration::from_millis(2_900));
    }

    #[tokio::test]
    async fn test_errors_pass_through() {
        struct Failing;
        impl AsyncRead for Failing {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "boom")))
            }
        }

        let limiter = RateLimiter::from_bits_per_sec(8_000);
        let mut reader = Throttled::new(Failing, limiter);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
