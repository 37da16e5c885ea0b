//! # Transport Statistics
//!
//! Aggregate counters for the sender and receiver, plus the shared EWMA and
//! windowed-rate helpers used to compute them. Exported via `serde` for JSON
//! reporting by the embedder.

use serde::Serialize;
use quanta::Instant;

// ─── Sender Stats ───────────────────────────────────────────────────────────

/// Aggregate sender-side statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    /// Total symbols submitted to encoders.
    pub symbols_loaded: u64,
    /// Systematic packets emitted.
    pub systematic_sent: u64,
    /// Repair packets emitted (fountain + in-line debt combined).
    pub repairs_sent: u64,
    /// Generations retired (`lrank == K ∧ rrank == K`).
    pub generations_retired: u64,
    /// Current smoothed loss-rate estimate.
    pub loss_rate: f64,
}

impl SenderStats {
    pub fn new() -> Self {
        Self::default()
    }
}

// ─── Receiver Stats ─────────────────────────────────────────────────────────

/// Aggregate receiver-side statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    /// Datagrams received (including obsolete/duplicate).
    pub packets_received: u64,
    /// Datagrams dropped for carrying an obsolete `block_id`.
    pub obsolete_dropped: u64,
    /// Records delivered to the application.
    pub records_delivered: u64,
    /// Symbols recovered via the codec rather than received systematic.
    pub symbols_recovered: u64,
    /// Generations fully extracted.
    pub generations_extracted: u64,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of received datagrams that turned out to be for an already
    /// fully-delivered generation.
    pub fn obsolete_ratio(&self) -> f64 {
        if self.packets_received == 0 {
            0.0
        } else {
            self.obsolete_dropped as f64 / self.packets_received as f64
        }
    }
}

// ─── Rate Counter ───────────────────────────────────────────────────────────

/// Windowed rate counter for computing bytes/sec or packets/sec.
pub struct RateCounter {
    samples: Vec<(Instant, u64)>,
    window: std::time::Duration,
}

impl RateCounter {
    pub fn new(window: std::time::Duration) -> Self {
        RateCounter {
            samples: Vec::with_capacity(128),
            window,
        }
    }

    pub fn record(&mut self, value: u64) {
        let now = Instant::now();
        self.samples.push((now, value));
        self.cleanup();
    }

    pub fn rate(&self) -> f64 {
        let now = Instant::now();
        let cutoff = now - self.window;
        let sum: u64 = self
            .samples
            .iter()
            .filter(|(t, _)| *t >= cutoff)
            .map(|(_, v)| v)
            .sum();
        sum as f64 / self.window.as_secs_f64()
    }

    pub fn count_in_window(&self) -> u64 {
        let cutoff = Instant::now() - self.window;
        self.samples
            .iter()
            .filter(|(t, _)| *t >= cutoff)
            .map(|(_, v)| v)
            .sum()
    }

    fn cleanup(&mut self) {
        let cutoff = Instant::now() - self.window;
        self.samples.retain(|(t, _)| *t >= cutoff);
    }
}

// ─── EWMA ───────────────────────────────────────────────────────────────────

/// Exponentially weighted moving average, used for the loss-rate estimate of
/// the loss-rate estimate (`p ← α·local + (1−α)·p`, `α = 0.5`).
#[derive(Debug, Clone)]
pub struct Ewma {
    alpha: f64,
    value: f64,
    initialized: bool,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        assert!((0.0..=1.0).contains(&alpha), "alpha must be in [0, 1]");
        Ewma {
            alpha,
            value: 0.0,
            initialized: false,
        }
    }

    /// Seeds on the first sample rather than blending against an arbitrary
    /// initial `p` (see DESIGN.md's Open Question decisions: applying the
    /// literal `p ← α·local + (1−α)·p` from the first retirement onward
    /// would report a reading that is always too low by a factor of `α`
    /// until the estimate has had several generations to warm up).
    pub fn update(&mut self, sample: f64) -> f64 {
        if !self.initialized {
            self.value = sample;
            self.initialized = true;
        } else {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
        self.initialized = false;
    }
}
