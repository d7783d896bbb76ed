use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use ringtap_common::{TpacketStats, TpacketStatsV3};
use serde::Serialize;

use crate::error::Result;

/// Counters kept by this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Packets returned to the caller.
    pub packets: u64,
    /// Blocking poll calls made while waiting for packets. One poll usually
    /// covers many packets.
    pub polls: u64,
}

/// Kernel counters, summed over every query since the handle opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SocketStats {
    pub packets: u64,
    pub drops: u64,
    /// v3 only.
    pub queue_freezes: u64,
}

/// One PACKET_STATISTICS answer. The kernel zeroes its counters as it
/// answers, so each one is a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KernelDelta {
    V1(TpacketStats),
    V3(TpacketStatsV3),
}

impl SocketStats {
    fn add(&mut self, delta: KernelDelta) {
        match delta {
            KernelDelta::V1(s) => {
                self.packets += u64::from(s.tp_packets);
                self.drops += u64::from(s.tp_drops);
            }
            KernelDelta::V3(s) => {
                self.packets += u64::from(s.tp_packets);
                self.drops += u64::from(s.tp_drops);
                self.queue_freezes += u64::from(s.tp_freeze_q_cnt);
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct StatsTracker {
    packets: AtomicU64,
    polls: AtomicU64,
    kernel: Mutex<SocketStats>,
}

impl StatsTracker {
    pub(crate) fn record_packet(&self) {
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_poll(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn local(&self) -> Stats {
        Stats {
            packets: self.packets.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
        }
    }

    /// Run `query` under the kernel-stats lock and fold its answer into the
    /// running total. Two queries racing would otherwise each see half.
    pub(crate) fn accumulate(
        &self,
        query: impl FnOnce() -> Result<KernelDelta>,
    ) -> Result<SocketStats> {
        let mut total = self.kernel.lock().unwrap_or_else(PoisonError::into_inner);
        total.add(query()?);
        Ok(*total)
    }

    /// Discard whatever the kernel counted before we started reading.
    pub(crate) fn reset(&self, query: impl FnOnce() -> Result<KernelDelta>) -> Result<()> {
        let mut total = self.kernel.lock().unwrap_or_else(PoisonError::into_inner);
        query()?;
        *total = SocketStats::default();
        Ok(())
    }
}
