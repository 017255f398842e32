use governor::{
    clock::QuantaClock,
    middleware::NoOpMiddleware,
    state::keyed::DashMapStateStore,
    Quota, RateLimiter
};
use nonzero_ext::nonzero;
use std::{
    net::IpAddr,
    num::NonZeroU32,
    sync::Arc,
    time::Duration,
};
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

/// Throttles handshakes per client IP.
#[derive(Clone)]
pub struct ConnectionRateLimiter {
    limiter: Arc<RateLimiter<IpAddr, DashMapStateStore<IpAddr>, QuantaClock, NoOpMiddleware>>,
}

impl ConnectionRateLimiter {
    /// Creates a keyed limiter.
    ///
    /// # Arguments
    /// * `per_second` - Handshakes allowed per IP per second, also the burst
    ///   size. A zero rate is treated as one per second.
    pub fn new(per_second: u32) -> Self {
        let rate = NonZeroU32::new(per_second).unwrap_or(nonzero!(1u32));

        Self {
            limiter: Arc::new(RateLimiter::keyed(Quota::per_second(rate))),
        }
    }

    /// Waits until a handshake from `ip` is allowed.
    pub async fn throttle(&self, ip: IpAddr) {
        self.limiter.until_key_ready(&ip).await;
    }

    /// Forgets every IP whose quota has fully replenished.
    ///
    /// # Returns
    /// The number of IPs still tracked.
    pub fn prune(&self) -> usize {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        self.limiter.len()
    }

    /// Number of IPs currently tracked.
    pub fn len(&self) -> usize {
        self.limiter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiter.is_empty()
    }

    /// Prunes at a fixed period, forever.
    pub async fn prune_periodically(self, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let tracked = self.prune();
            debug!(tracked, "Pruned rate limiter state");
        }
    }
}
