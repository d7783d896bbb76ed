use dashmap::DashMap;
use ringtap::CaptureInfo;
use serde::Serialize;
use std::ffi::CStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

/// Counters for one ingress interface or one VLAN.
#[derive(Debug, Serialize, Clone, Default)]
pub struct TrafficCounters {
    pub packets: u64,
    /// Bytes on the wire.
    pub bytes: u64,
    /// Bytes that made it into the ring (snap length and frame size cap this).
    pub captured_bytes: u64,
    /// Capture timestamp of the newest packet, in ms since the epoch.
    pub last_seen_ms: i64,
}

impl TrafficCounters {
    fn record(&mut self, info: &CaptureInfo, timestamp_ms: i64) {
        self.packets += 1;
        self.bytes += info.length as u64;
        self.captured_bytes += info.capture_length as u64;
        self.last_seen_ms = self.last_seen_ms.max(timestamp_ms);
    }
}

/// Live traffic counters, written by the capture thread and read by the API.
pub struct TrafficState {
    pub interfaces: DashMap<i32, TrafficCounters>,
    pub vlans: DashMap<u16, TrafficCounters>,
    pub total_packets: AtomicU64,
    pub total_bytes: AtomicU64,
    pub captured_bytes: AtomicU64,
    /// Reads that ended the capture loop with an error.
    pub read_errors: AtomicU64,
}

impl TrafficState {
    pub fn new() -> Self {
        Self {
            interfaces: DashMap::new(),
            vlans: DashMap::new(),
            total_packets: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            captured_bytes: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
        }
    }

    pub fn update(&self, info: &CaptureInfo) {
        let timestamp_ms = info
            .timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_else(|_| chrono::Utc::now().timestamp_millis());

        self.interfaces
            .entry(info.interface_index)
            .or_default()
            .record(info, timestamp_ms);
        if let Some(tag) = info.vlan {
            self.vlans
                .entry(tag.id())
                .or_default()
                .record(info, timestamp_ms);
        }

        self.total_packets.fetch_add(1, Ordering::Relaxed);
        self.total_bytes
            .fetch_add(info.length as u64, Ordering::Relaxed);
        self.captured_bytes
            .fetch_add(info.capture_length as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Per-interface counters, busiest first.
    pub fn interfaces_by_packets(&self) -> Vec<(i32, TrafficCounters)> {
        let mut rows: Vec<_> = self
            .interfaces
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        rows.sort_by(|a, b| b.1.packets.cmp(&a.1.packets).then(a.0.cmp(&b.0)));
        rows
    }
}

/// Interface name for `ifindex`, if the interface still exists.
pub fn interface_name(ifindex: i32) -> Option<String> {
    let index = u32::try_from(ifindex).ok().filter(|&i| i > 0)?;
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    // SAFETY: buf holds IF_NAMESIZE bytes, as if_indextoname requires.
    let name = unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) };
    if name.is_null() {
        return None;
    }
    // SAFETY: on success buf holds a NUL-terminated name.
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Some(name.to_string_lossy().into_owned())
}
