// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! Cooperative memory monitor.
//!
//! Samples process RSS into a fixed-size ring and raises a pressure flag
//! when growth stays above the alert rate for three consecutive samples.
//! The ring overwrites in place and the monitor exposes only copied
//! snapshots, so it can never itself pin memory it is reporting on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::index::store::SearchStore;
use crate::ledger::LedgerApi;
use crate::peergraph::PeerGraph;
use crate::LongLivedService;

/// Ring capacity; old samples are overwritten in place.
const RING_SLOTS: usize = 30;

/// Alert when external growth exceeds this rate...
const ALERT_BYTES_PER_MIN: u64 = 100 * 1024 * 1024;
/// ...for this many consecutive samples.
const ALERT_STREAK: u32 = 3;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    /// Milliseconds since the monitor started.
    pub at_ms: u64,
    pub rss_bytes: u64,
}

#[derive(Debug)]
struct Ring {
    slots: [Option<MemorySample>; RING_SLOTS],
    next: usize,
}

impl Ring {
    fn new() -> Self {
        Self {
            slots: [None; RING_SLOTS],
            next: 0,
        }
    }

    fn push(&mut self, sample: MemorySample) {
        self.slots[self.next] = Some(sample);
        self.next = (self.next + 1) % RING_SLOTS;
    }

    /// Samples in chronological order.
    fn snapshot(&self) -> Vec<MemorySample> {
        let mut out = Vec::with_capacity(RING_SLOTS);
        for i in 0..RING_SLOTS {
            let idx = (self.next + i) % RING_SLOTS;
            if let Some(s) = self.slots[idx] {
                out.push(s);
            }
        }
        out
    }
}

/// Shared view of the monitor: the pressure flag is read by pooling
/// clients to recycle sooner while pressure holds.
#[derive(Clone)]
pub struct MemoryPressure {
    flag: Arc<AtomicBool>,
}

impl Default for MemoryPressure {
    fn default() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl MemoryPressure {
    pub fn is_high(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    fn set(&self, high: bool) {
        self.flag.store(high, Ordering::Relaxed);
    }
}

pub struct MonitorSrv {
    pressure: MemoryPressure,
    ring: Ring,
    streak: u32,
    interval: Duration,
}

impl MonitorSrv {
    pub fn new(pressure: MemoryPressure) -> Self {
        Self {
            pressure,
            ring: Ring::new(),
            streak: 0,
            interval: SAMPLE_INTERVAL,
        }
    }

    pub fn snapshot(&self) -> Vec<MemorySample> {
        self.ring.snapshot()
    }

    /// Record a sample and re-evaluate the alert streak.
    fn observe(&mut self, sample: MemorySample) {
        let previous = self.ring.snapshot().last().copied();
        self.ring.push(sample);

        let Some(previous) = previous else {
            return;
        };

        let elapsed_ms = sample.at_ms.saturating_sub(previous.at_ms);
        if elapsed_ms == 0 {
            return;
        }

        let growth = sample.rss_bytes.saturating_sub(previous.rss_bytes);
        let per_min = growth.saturating_mul(60_000) / elapsed_ms;

        if per_min > ALERT_BYTES_PER_MIN {
            self.streak += 1;
            if self.streak >= ALERT_STREAK {
                warn!(
                    event = "memory_pressure",
                    rss = sample.rss_bytes,
                    growth_per_min = per_min,
                    streak = self.streak,
                );
                self.pressure.set(true);
            }
        } else {
            if self.streak >= ALERT_STREAK {
                info!(event = "memory_pressure_cleared", rss = sample.rss_bytes);
            }
            self.streak = 0;
            self.pressure.set(false);
        }
    }
}

#[async_trait]
impl<L: LedgerApi, G: PeerGraph> LongLivedService<L, G> for MonitorSrv {
    async fn execute(
        &mut self,
        _ledger: Arc<RwLock<L>>,
        _graph: Arc<RwLock<G>>,
        _store: SearchStore,
    ) -> anyhow::Result<usize> {
        let started = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            ticker.tick().await;

            let Some(usage) = memory_stats::memory_stats() else {
                continue;
            };

            self.observe(MemorySample {
                at_ms: started.elapsed().as_millis() as u64,
                rss_bytes: usage.physical_mem as u64,
            });
        }
    }

    fn name(&self) -> &'static str {
        "memory_monitor"
    }
}
