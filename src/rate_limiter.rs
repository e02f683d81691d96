//! Per-source token-bucket rate limiting.
//!
//! One bucket per image source, keyed by source id and shared by every job
//! in the process. Buckets are created when a source is first seen and
//! swept by a background task once they have been idle long enough.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: u32,
    last_refill: Instant,
    max_tokens: u32,
    refill_rate: u32,
}

impl TokenBucket {
    fn new(max_rps: u32) -> Self {
        Self {
            tokens: max_rps,
            last_refill: Instant::now(),
            max_tokens: max_rps,
            refill_rate: max_rps,
        }
    }

    /// Add whole tokens earned since the last refill. The clock only
    /// advances when at least one token is credited, so fractional
    /// progress is never thrown away.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill);
        let earned = (elapsed.as_secs_f64() * self.refill_rate as f64).floor() as u32;
        if earned > 0 {
            self.tokens = (self.tokens + earned).min(self.max_tokens);
            self.last_refill = now;
        }
    }
}

/// Shared token-bucket map. `try_acquire` performs refill and debit under
/// the map entry's guard, so concurrent jobs cannot over-debit a bucket.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    buckets: Arc<DashMap<String, TokenBucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a bucket for `source_id`, starting full. Re-initialization
    /// replaces any existing bucket.
    pub fn init_bucket(&self, source_id: &str, max_rps: u32) {
        let max_rps = max_rps.max(1);
        self.buckets
            .insert(source_id.to_string(), TokenBucket::new(max_rps));
    }

    /// Make sure a bucket exists for `source_id` without resetting one
    /// that is already filling. The bucket is only replaced when the
    /// configured rate changed.
    pub fn ensure_bucket(&self, source_id: &str, max_rps: u32) {
        let max_rps = max_rps.max(1);
        // Drop the read guard before touching the map again.
        let needs_install = self
            .buckets
            .get(source_id)
            .map_or(true, |bucket| bucket.max_tokens != max_rps);
        if needs_install {
            self.init_bucket(source_id, max_rps);
        }
    }

    /// Take one token if available. Sources without a bucket are not
    /// limited.
    pub fn try_acquire(&self, source_id: &str) -> bool {
        let Some(mut bucket) = self.buckets.get_mut(source_id) else {
            return true;
        };
        bucket.refill(Instant::now());
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Milliseconds until one token becomes available: `ceil(1000/rate)`
    /// when the bucket is empty, zero otherwise.
    pub fn wait_time_ms(&self, source_id: &str) -> u64 {
        match self.buckets.get(source_id) {
            Some(bucket) if bucket.tokens == 0 => {
                (1000 + bucket.refill_rate as u64 - 1) / bucket.refill_rate as u64
            }
            _ => 0,
        }
    }

    /// Spawn the background sweeper that drops buckets idle for at least
    /// `idle_after`. Returns a handle whose `stop` shuts the task down.
    pub fn spawn_sweeper(&self, idle_after: Duration) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let buckets = Arc::clone(&self.buckets);

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(idle_after);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let before = buckets.len();
                        buckets.retain(|_, bucket| bucket.last_refill.elapsed() < idle_after);
                        let removed = before - buckets.len();
                        if removed > 0 {
                            debug!(removed, "swept idle rate-limit buckets");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("rate-limit sweeper shutting down");
                        break;
                    }
                }
            }
        });

        SweeperHandle { shutdown_tx }
    }

    #[cfg(test)]
    fn rewind_last_refill(&self, source_id: &str, by: Duration) {
        if let Some(mut bucket) = self.buckets.get_mut(source_id) {
            bucket.last_refill -= by;
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Shutdown handle for the bucket sweeper task.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl SweeperHandle {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}
