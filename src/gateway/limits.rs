//! Per-endpoint-class request budgets for the exchange REST API
//!
//! The exchange meters market-data endpoints and order endpoints
//! separately, and punishes them differently: a burst of candle pulls is
//! tolerated, a burst of order calls draws a 429 that counts against the
//! account. The budget encodes that asymmetry: the public class may burst
//! to twice its steady rate, the private class gets no burst headroom at
//! all, and a 429 puts the whole offending class on a cooldown so retries
//! stop hammering a limit the exchange has already said is exhausted.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Which budget a REST call draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    /// Market data: products, candles, bid/ask, trades
    Public,
    /// Authenticated account and order endpoints
    Private,
}

struct BucketState {
    tokens: f64,
    updated_at: Instant,
    /// Set by a 429: no request on this class until it passes.
    blocked_until: Option<Instant>,
}

/// Continuous-refill token bucket: tokens accrue with elapsed time up to
/// a burst cap, so a caller never waits longer than one token interval
/// once the cap is respected.
struct Bucket {
    refill_per_sec: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl Bucket {
    fn new(steady_rps: usize, capacity: f64) -> Self {
        let capacity = capacity.max(1.0);
        Self {
            refill_per_sec: steady_rps.max(1) as f64,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                updated_at: Instant::now(),
                blocked_until: None,
            }),
        }
    }

    async fn acquire(&self) {
        loop {
            match self.try_take().await {
                None => return,
                Some(wait) => sleep(wait).await,
            }
        }
    }

    /// Take one token if available, otherwise return how long to wait.
    async fn try_take(&self) -> Option<Duration> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if let Some(until) = state.blocked_until {
            if now < until {
                return Some(until - now);
            }
            state.blocked_until = None;
        }

        let elapsed = now.saturating_duration_since(state.updated_at);
        state.tokens =
            (state.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        state.updated_at = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            None
        } else {
            Some(Duration::from_secs_f64(
                (1.0 - state.tokens) / self.refill_per_sec,
            ))
        }
    }

    async fn block_for(&self, cooldown: Duration) {
        let mut state = self.state.lock().await;
        let until = Instant::now() + cooldown;
        state.blocked_until = Some(state.blocked_until.map_or(until, |u| u.max(until)));
    }
}

/// Request budgets for the two endpoint classes.
pub struct RateBudget {
    public: Bucket,
    private: Bucket,
}

impl RateBudget {
    pub fn new(public_rps: usize, private_rps: usize) -> Self {
        Self {
            // Candle pulls for a scan arrive in clumps; give them headroom.
            public: Bucket::new(public_rps, public_rps as f64 * 2.0),
            // Order calls get exactly the steady rate. A clump of order
            // requests is the failure mode the exchange punishes.
            private: Bucket::new(private_rps, private_rps as f64),
        }
    }

    /// Wait until this class may make one request.
    pub async fn acquire(&self, class: EndpointClass) {
        self.bucket(class).acquire().await
    }

    /// Applied when the exchange answers 429 on this class: hold every
    /// request on the class back for `cooldown` instead of letting retries
    /// re-offend immediately.
    pub async fn penalize(&self, class: EndpointClass, cooldown: Duration) {
        self.bucket(class).block_for(cooldown).await
    }

    fn bucket(&self, class: EndpointClass) -> &Bucket {
        match class {
            EndpointClass::Public => &self.public,
            EndpointClass::Private => &self.private,
        }
    }
}
