//! The capture handle: one packet socket, its mapped receive ring, and the
//! cursor that drains it.

use std::io;
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use ringtap_common::{
    SockFilter, TpacketStats, TpacketStatsV3, PACKET_FANOUT, PACKET_STATISTICS, SOL_PACKET,
};
use tracing::{debug, warn};

use crate::cursor::{Cursor, Frame};
use crate::error::{Error, Result};
use crate::fanout::{fanout_arg, FanoutType};
use crate::filter;
use crate::options::{page_size, Options, RingGeometry, TpacketVersion, VersionPreference};
use crate::packet::{with_vlan_header, CaptureInfo, Packet};
use crate::poll::{SocketWaiter, Waker};
use crate::ring::MappedRing;
use crate::socket::{interface_index, SocketHandle};
use crate::stats::{KernelDelta, SocketStats, Stats, StatsTracker};

/// Everything a read mutates. Held for the whole read, poll included.
struct ReadState {
    ring: Option<MappedRing>,
    cursor: Cursor,
}

/// A memory-mapped `AF_PACKET` capture socket.
///
/// Reads are serialized: a second reader blocks behind the first. Stats,
/// filters and writes do not wait on a read in progress. [`close`] may be
/// called from any thread and wakes a reader blocked in poll.
///
/// [`close`]: TPacket::close
pub struct TPacket {
    version: TpacketVersion,
    ifindex: i32,
    geometry: RingGeometry,
    add_vlan_header: bool,
    read: Mutex<ReadState>,
    socket: RwLock<Option<SocketHandle>>,
    stats: StatsTracker,
    waker: Waker,
    closed: AtomicBool,
}

impl TPacket {
    /// Open a capture socket with `opts`.
    pub fn open(opts: Options) -> Result<Self> {
        Self::open_with_page_size(opts, page_size())
    }

    /// As [`open`](TPacket::open), validating geometry against `page_size`.
    pub fn open_with_page_size(opts: Options, page_size: usize) -> Result<Self> {
        opts.check(page_size)?;
        let ifindex = interface_index(&opts.interface)?;

        // Every resource below closes itself if a later step fails.
        let socket = SocketHandle::open(opts.socket_type)?;
        socket.bind(ifindex)?;
        let version = negotiate_version(&socket, opts.version)?;

        let geometry = opts.geometry();
        socket.request_ring(version, &geometry)?;
        let ring = MappedRing::map(socket.raw(), geometry.mapping_size())?;
        debug!(
            "mapped {} byte {} ring on ifindex {}",
            ring.len(),
            version,
            ifindex
        );

        let waker = Waker::new().map_err(|source| Error::Setup {
            op: "eventfd",
            source,
        })?;
        let stats = StatsTracker::default();
        stats.reset(|| query_kernel(&socket, version))?;

        Ok(Self {
            version,
            ifindex,
            geometry,
            add_vlan_header: opts.add_vlan_header,
            read: Mutex::new(ReadState {
                ring: Some(ring),
                cursor: Cursor::new(version, geometry, opts.snap_len, opts.poll_timeout_ms()),
            }),
            socket: RwLock::new(Some(socket)),
            stats,
            waker,
            closed: AtomicBool::new(false),
        })
    }

    pub fn version(&self) -> TpacketVersion {
        self.version
    }

    /// Bound interface index; zero when bound to every interface.
    pub fn interface_index(&self) -> i32 {
        self.ifindex
    }

    pub fn geometry(&self) -> RingGeometry {
        self.geometry
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Unmap the ring and close the socket. A reader blocked in poll returns
    /// [`Error::Closed`]. Safe to call more than once.
    ///
    /// Waits for an outstanding [`PacketRef`] to be dropped, so never call it
    /// while holding one on the same thread.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake blocked reader on close: {}", e);
        }
        self.lock_read().ring.take();
        self.write_socket().take();
        debug!("closed {} ring on ifindex {}", self.version, self.ifindex);
    }

    /// Next packet as a view into the ring. The slot stays with user space,
    /// and other reads wait, until the returned [`PacketRef`] is dropped.
    pub fn zero_copy_read(&self) -> Result<PacketRef<'_>> {
        let mut guard = self.lock_read();
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let socket = self.read_socket();
        let socket = socket.as_ref().ok_or(Error::Closed)?;
        let waiter = SocketWaiter::new(socket.raw(), &self.waker);

        let state = &mut *guard;
        let ring = state.ring.as_ref().ok_or(Error::Closed)?;
        let frame = state.cursor.next(ring, &waiter, &self.stats)?;
        Ok(PacketRef {
            guard,
            frame,
            add_vlan_header: self.add_vlan_header,
        })
    }

    /// Next packet, copied into a buffer the caller owns.
    pub fn read_packet(&self) -> Result<Packet> {
        Ok(self.zero_copy_read()?.to_packet())
    }

    /// Next packet, copied into `buf`. The reported capture length shrinks to
    /// what fit; the wire length is left alone.
    pub fn read_packet_into(&self, buf: &mut [u8]) -> Result<CaptureInfo> {
        let packet = self.zero_copy_read()?;
        let data = packet.data();
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        let mut info = packet.info().clone();
        info.capture_length = n;
        Ok(info)
    }

    /// Send one link-layer frame straight out of the socket.
    pub fn write_raw(&self, frame: &[u8]) -> Result<()> {
        let socket = self.read_socket();
        let socket = socket.as_ref().ok_or(Error::Closed)?;
        socket
            .write(frame)
            .map(drop)
            .map_err(|source| Error::Syscall { op: "write", source })
    }

    /// Install a classic BPF program, replacing any previous filter.
    pub fn attach_classic_filter(&self, program: &[SockFilter]) -> Result<()> {
        let socket = self.read_socket();
        filter::attach_classic(socket.as_ref().ok_or(Error::Closed)?, program)
    }

    /// Install an already loaded eBPF socket-filter program.
    pub fn attach_compiled_filter(&self, program: BorrowedFd<'_>) -> Result<()> {
        let socket = self.read_socket();
        filter::attach_ebpf(socket.as_ref().ok_or(Error::Closed)?, program)
    }

    /// Join fanout group `group_id`. Every socket joining the same group must
    /// use the same `fanout` type.
    pub fn set_fanout(&self, fanout: FanoutType, group_id: u16) -> Result<()> {
        let _read = self.lock_read();
        let socket = self.read_socket();
        let socket = socket.as_ref().ok_or(Error::Closed)?;
        socket
            .setsockopt(SOL_PACKET, PACKET_FANOUT, &fanout_arg(fanout, group_id))
            .map_err(|source| Error::Syscall {
                op: "setsockopt(PACKET_FANOUT)",
                source,
            })?;
        debug!("joined fanout group {} as {:?}", group_id, fanout);
        Ok(())
    }

    /// Counters kept by this handle.
    pub fn stats(&self) -> Stats {
        self.stats.local()
    }

    /// Kernel counters since open. Each call folds in what the kernel counted
    /// since the previous one.
    pub fn socket_stats(&self) -> Result<SocketStats> {
        let socket = self.read_socket();
        let socket = socket.as_ref().ok_or(Error::Closed)?;
        self.stats
            .accumulate(|| query_kernel(socket, self.version))
    }

    fn lock_read(&self) -> MutexGuard<'_, ReadState> {
        self.read.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_socket(&self) -> RwLockReadGuard<'_, Option<SocketHandle>> {
        self.socket.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_socket(&self) -> std::sync::RwLockWriteGuard<'_, Option<SocketHandle>> {
        self.socket.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TPacket {
    fn drop(&mut self) {
        self.close();
    }
}

fn negotiate_version(
    socket: &SocketHandle,
    preference: VersionPreference,
) -> Result<TpacketVersion> {
    let mut last_err: Option<io::Error> = None;
    for &version in preference.candidates() {
        match socket.set_version(version) {
            Ok(()) => {
                debug!("negotiated {}", version);
                return Ok(version);
            }
            Err(e) => {
                debug!("{} rejected: {}", version, e);
                last_err = Some(e);
            }
        }
    }
    Err(Error::Configuration {
        reason: "no known tpacket versions work on this machine".to_string(),
        source: last_err,
    })
}

fn query_kernel(socket: &SocketHandle, version: TpacketVersion) -> Result<KernelDelta> {
    let failed = |source: io::Error| Error::Syscall {
        op: "getsockopt(PACKET_STATISTICS)",
        source,
    };
    Ok(match version {
        TpacketVersion::V3 => KernelDelta::V3(
            socket
                .getsockopt::<TpacketStatsV3>(SOL_PACKET, PACKET_STATISTICS)
                .map_err(failed)?,
        ),
        TpacketVersion::V1 | TpacketVersion::V2 => KernelDelta::V1(
            socket
                .getsockopt::<TpacketStats>(SOL_PACKET, PACKET_STATISTICS)
                .map_err(failed)?,
        ),
    })
}

/// A packet still sitting in the ring.
///
/// Holds the handle's read lock: the next read, `set_fanout` and `close`
/// wait until this is dropped.
pub struct PacketRef<'a> {
    guard: MutexGuard<'a, ReadState>,
    frame: Frame,
    add_vlan_header: bool,
}

impl PacketRef<'_> {
    pub fn data(&self) -> &[u8] {
        match &self.guard.ring {
            Some(ring) => ring.bytes(self.frame.offset, self.frame.len),
            None => &[],
        }
    }

    pub fn info(&self) -> &CaptureInfo {
        &self.frame.info
    }

    /// Copy the packet out of the ring, re-inserting a stripped VLAN tag
    /// when the handle was opened with `add_vlan_header`.
    pub fn to_packet(&self) -> Packet {
        let mut info = self.frame.info.clone();
        let data = match info.vlan {
            Some(tag) if self.add_vlan_header => with_vlan_header(self.data(), tag.tci),
            _ => self.data().to_vec(),
        };
        info.capture_length = data.len();
        Packet { data, info }
    }
}

#[cfg(test)]
impl TPacket {
    /// A handle over a heap ring and an ordinary socket, for driving reads
    /// without a kernel ring.
    fn synthetic(
        version: TpacketVersion,
        geometry: RingGeometry,
        timeout_ms: i32,
        add_vlan_header: bool,
    ) -> Self {
        Self {
            version,
            ifindex: 1,
            geometry,
            add_vlan_header,
            read: Mutex::new(ReadState {
                ring: Some(MappedRing::heap(geometry.mapping_size())),
                cursor: Cursor::new(version, geometry, 0, timeout_ms),
            }),
            socket: RwLock::new(Some(SocketHandle::for_tests())),
            stats: StatsTracker::default(),
            waker: Waker::new().unwrap(),
            closed: AtomicBool::new(false),
        }
    }

    fn with_ring<R>(&self, f: impl FnOnce(&MappedRing) -> R) -> R {
        f(self.lock_read().ring.as_ref().unwrap())
    }
}
