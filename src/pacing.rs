//! Pacing for sequential batch work.
//!
//! The triage batch driver and the correspondence resolver never sleep
//! directly; they ask a `Pacer` for a pause of a given kind. Production uses
//! `FixedPacer`, tests use `RecordingPacer` so ordering is observable
//! without real delays.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

/// Why a pause is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaceKind {
    /// Before each item inside a resolver batch.
    Stagger,
    /// Between resolver batches.
    BatchPause,
    /// Between emails in a triage batch.
    BetweenEmails,
}

#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self, kind: PaceKind);
}

/// Fixed delays per pause kind.
#[derive(Debug, Clone)]
pub struct FixedPacer {
    pub stagger: Duration,
    pub batch_pause: Duration,
    pub between_emails: Duration,
}

impl Default for FixedPacer {
    fn default() -> Self {
        Self {
            stagger: Duration::from_millis(200),
            batch_pause: Duration::from_millis(2000),
            between_emails: Duration::from_secs(1),
        }
    }
}

impl FixedPacer {
    fn delay(&self, kind: PaceKind) -> Duration {
        match kind {
            PaceKind::Stagger => self.stagger,
            PaceKind::BatchPause => self.batch_pause,
            PaceKind::BetweenEmails => self.between_emails,
        }
    }
}

#[async_trait]
impl Pacer for FixedPacer {
    async fn pause(&self, kind: PaceKind) {
        let delay = self.delay(kind);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Slowest refill rate accepted: one token every ~17 minutes.
pub const MIN_RATE_PER_SEC: f64 = 0.001;

struct BucketState {
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

/// Token bucket: up to `capacity` pauses pass immediately, after that one
/// token refills every `1 / rate_per_sec` seconds.
///
/// The rate can be changed at runtime when a provider reports its quota.
pub struct TokenBucket {
    capacity: f64,
    state: tokio::sync::Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u32, rate_per_sec: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            state: tokio::sync::Mutex::new(BucketState {
                tokens: capacity,
                rate_per_sec: sanitize_rate(rate_per_sec),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Change the refill rate (tokens per second).
    pub async fn set_rate(&self, rate_per_sec: f64) {
        let mut state = self.state.lock().await;
        refill(&mut state, self.capacity);
        state.rate_per_sec = sanitize_rate(rate_per_sec);
        debug!(rate_per_sec = state.rate_per_sec, "Token bucket rate updated");
    }

    /// Take one token, waiting for a refill if the bucket is empty.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        refill(&mut state, self.capacity);
        if state.tokens < 1.0 {
            let wait = Duration::from_secs_f64((1.0 - state.tokens) / state.rate_per_sec);
            // Holding the lock keeps waiters in arrival order.
            tokio::time::sleep(wait).await;
            refill(&mut state, self.capacity);
        }
        state.tokens = (state.tokens - 1.0).max(0.0);
    }
}

fn sanitize_rate(rate: f64) -> f64 {
    if rate.is_finite() && rate > 0.0 {
        rate.max(MIN_RATE_PER_SEC)
    } else {
        1.0
    }
}

fn refill(state: &mut BucketState, capacity: f64) {
    let now = Instant::now();
    let elapsed = now.duration_since(state.last_refill).as_secs_f64();
    state.tokens = (state.tokens + elapsed * state.rate_per_sec).min(capacity);
    state.last_refill = now;
}

#[async_trait]
impl Pacer for TokenBucket {
    async fn pause(&self, _kind: PaceKind) {
        self.acquire().await;
    }
}

/// Records pauses without sleeping.
#[derive(Debug, Default)]
pub struct RecordingPacer {
    calls: Mutex<Vec<PaceKind>>,
}

impl RecordingPacer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<PaceKind> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, kind: PaceKind) -> usize {
        self.calls().iter().filter(|k| **k == kind).count()
    }
}

#[async_trait]
impl Pacer for RecordingPacer {
    async fn pause(&self, kind: PaceKind) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(kind);
        }
    }
}
