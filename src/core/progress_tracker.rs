//! Progress aggregation and speed statistics
//!
//! Workers report byte deltas through [`ProgressAggregator::record`] using
//! atomic adds, so recording never blocks on the downloader. The relay loop
//! periodically calls [`ProgressAggregator::sample`] to turn the running total
//! into an instantaneous speed and an exponential moving average over a
//! sliding window of recent samples.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::core::models::Segment;

/// Speed snapshot in bytes per second
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeedReading {
    /// Bytes since the previous sample divided by the elapsed time
    pub instant: f64,
    /// Exponential moving average over the sample window
    pub smoothed: f64,
    /// Bytes of this run divided by the run time
    pub average: f64,
}

#[derive(Debug)]
struct SpeedSampler {
    run_started: Instant,
    run_base_bytes: u64,
    last_sample: Instant,
    last_bytes: u64,
    window: VecDeque<f64>,
    window_size: usize,
    ema_alpha: f64,
    last_reading: SpeedReading,
}

impl SpeedSampler {
    fn new(bytes: u64, window_size: usize, ema_alpha: f64) -> Self {
        let now = Instant::now();
        Self {
            run_started: now,
            run_base_bytes: bytes,
            last_sample: now,
            last_bytes: bytes,
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            ema_alpha,
            last_reading: SpeedReading::default(),
        }
    }

    fn smoothed(&self) -> f64 {
        let mut samples = self.window.iter();
        let Some(first) = samples.next() else {
            return 0.0;
        };
        samples.fold(*first, |ema, speed| {
            self.ema_alpha * speed + (1.0 - self.ema_alpha) * ema
        })
    }
}

/// Merges per-worker byte counters into a total and a smoothed throughput
#[derive(Debug)]
pub struct ProgressAggregator {
    /// Bytes currently on disk according to the workers
    written: AtomicU64,
    /// Highest total ever reported
    high_water: AtomicU64,
    segment_bytes: DashMap<usize, u64>,
    sampler: Mutex<SpeedSampler>,
}

impl ProgressAggregator {
    pub fn new(segments: &[Segment], window_size: usize, ema_alpha: f64) -> Self {
        let total: u64 = segments.iter().map(|s| s.bytes_written).sum();
        let segment_bytes = segments
            .iter()
            .map(|s| (s.index, s.bytes_written))
            .collect::<DashMap<_, _>>();

        Self {
            written: AtomicU64::new(total),
            high_water: AtomicU64::new(total),
            segment_bytes,
            sampler: Mutex::new(SpeedSampler::new(total, window_size, ema_alpha)),
        }
    }

    /// Add `delta` freshly written bytes of segment `index`
    pub fn record(&self, index: usize, delta: u64) {
        let total = self.written.fetch_add(delta, Ordering::AcqRel) + delta;
        *self.segment_bytes.entry(index).or_insert(0) += delta;
        self.high_water.fetch_max(total, Ordering::AcqRel);
    }

    /// Monotonic total suitable for progress reporting
    pub fn downloaded(&self) -> u64 {
        self.high_water.load(Ordering::Acquire)
    }

    /// Actual bytes written, may drop after [`rebase`](Self::rebase)
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    pub fn segment_bytes(&self, index: usize) -> u64 {
        self.segment_bytes.get(&index).map(|v| *v).unwrap_or(0)
    }

    /// Reset the counters to the given segments after progress was discarded.
    ///
    /// The reported total keeps its high-water mark.
    pub fn rebase(&self, segments: &[Segment]) {
        let total: u64 = segments.iter().map(|s| s.bytes_written).sum();
        self.segment_bytes.clear();
        for segment in segments {
            self.segment_bytes.insert(segment.index, segment.bytes_written);
        }
        self.written.store(total, Ordering::Release);

        let mut sampler = self.sampler.lock();
        sampler.last_bytes = total;
        sampler.run_base_bytes = total;
    }

    /// Start a new run: speed statistics restart from the current total
    pub fn restart_run(&self) {
        let total = self.written();
        let mut sampler = self.sampler.lock();
        let (window_size, ema_alpha) = (sampler.window_size, sampler.ema_alpha);
        *sampler = SpeedSampler::new(total, window_size, ema_alpha);
    }

    /// Take a speed sample
    pub fn sample(&self) -> SpeedReading {
        let now = Instant::now();
        let bytes = self.written();
        let mut sampler = self.sampler.lock();

        let elapsed = now.duration_since(sampler.last_sample).as_secs_f64();
        if elapsed <= 0.0 {
            return sampler.last_reading;
        }

        let delta = bytes.saturating_sub(sampler.last_bytes);
        let instant = delta as f64 / elapsed;
        sampler.last_sample = now;
        sampler.last_bytes = bytes;

        if sampler.window.len() == sampler.window_size {
            sampler.window.pop_front();
        }
        sampler.window.push_back(instant);

        let run_elapsed = now.duration_since(sampler.run_started).as_secs_f64();
        let average = if run_elapsed > 0.0 {
            bytes.saturating_sub(sampler.run_base_bytes) as f64 / run_elapsed
        } else {
            0.0
        };

        let reading = SpeedReading {
            instant,
            smoothed: sampler.smoothed(),
            average,
        };
        sampler.last_reading = reading;
        reading
    }

    /// Most recent sample without taking a new one
    pub fn last_reading(&self) -> SpeedReading {
        self.sampler.lock().last_reading
    }
}
