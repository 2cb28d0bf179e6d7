//! Per-torrent transfer rate history
//!
//! Display-only telemetry: samples are never consulted for cache sizing.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::engine::TorrentStats;

/// Transfer rates observed at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpeedSample {
    pub date: DateTime<Utc>,
    /// Download rate in bytes per second
    pub download: u64,
    /// Upload rate in bytes per second
    pub upload: u64,
}

impl SpeedSample {
    /// Captures the current rates from engine counters.
    pub fn from_stats(date: DateTime<Utc>, stats: &TorrentStats) -> Self {
        Self {
            date,
            download: stats.download_rate,
            upload: stats.upload_rate,
        }
    }
}

/// Fixed-depth ring of samples, oldest dropped first.
#[derive(Debug, Clone)]
pub struct SpeedHistory {
    samples: VecDeque<SpeedSample>,
    depth: usize,
}

impl SpeedHistory {
    pub fn new(depth: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(depth),
            depth,
        }
    }

    pub fn record(&mut self, sample: SpeedSample) {
        if self.depth == 0 {
            return;
        }
        while self.samples.len() >= self.depth {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Samples in chronological order.
    pub fn samples(&self) -> Vec<SpeedSample> {
        self.samples.iter().copied().collect()
    }

    pub fn latest(&self) -> Option<SpeedSample> {
        self.samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
