//! The read side of the ring: which slot we are on, whether it still has to
//! go back to the kernel, and how far into a v3 block we have walked.

use crate::error::{Error, Result};
use crate::header::{BlockPosition, FrameHeader, HeaderView, V3Header};
use crate::options::{RingGeometry, TpacketVersion};
use crate::packet::{CaptureInfo, VlanTag};
use crate::poll::{Readiness, Wait};
use crate::ring::MappedRing;
use crate::stats::StatsTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CursorState {
    /// No header acquired since open or since the last slot was released.
    NeedHeader,
    /// A header was handed out and has not been released.
    HaveHeader,
    /// The v3 block at the cursor has no packets left.
    BlockExhausted,
}

/// A packet located in the ring. Offsets are absolute within the mapping.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub offset: usize,
    pub len: usize,
    pub info: CaptureInfo,
}

pub(crate) struct Cursor {
    version: TpacketVersion,
    geometry: RingGeometry,
    snap_len: usize,
    timeout_ms: i32,
    /// Slot index: a frame for v1/v2, a block for v3.
    offset: usize,
    state: CursorState,
    pending_release: bool,
    block: Option<BlockPosition>,
}

impl Cursor {
    pub(crate) fn new(
        version: TpacketVersion,
        geometry: RingGeometry,
        snap_len: usize,
        timeout_ms: i32,
    ) -> Self {
        Self {
            version,
            geometry,
            snap_len,
            timeout_ms,
            offset: 0,
            state: CursorState::NeedHeader,
            pending_release: false,
            block: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> CursorState {
        self.state
    }

    fn header<'a>(&self, ring: &'a MappedRing) -> HeaderView<'a> {
        HeaderView::at(
            ring,
            self.version,
            self.geometry.slot_offset(self.version, self.offset),
            self.geometry.frame_size,
            self.geometry.block_size(),
        )
    }

    /// Give the slot at the cursor back to the kernel and move past it.
    fn release(&mut self, ring: &MappedRing) {
        self.header(ring).clear_status();
        self.offset = (self.offset + 1) % self.geometry.slots(self.version).max(1);
        self.pending_release = false;
        self.block = None;
    }

    /// Next packet, blocking in `waiter` until the kernel delivers one.
    ///
    /// On error nothing is consumed: the next call waits on the same slot.
    pub(crate) fn next(
        &mut self,
        ring: &MappedRing,
        waiter: &dyn Wait,
        stats: &StatsTracker,
    ) -> Result<Frame> {
        loop {
            if self.state == CursorState::HaveHeader {
                match self.block {
                    Some(pos) => {
                        let mut header = V3Header::resume(ring, pos, self.geometry.block_size());
                        if header.advance() {
                            self.block = Some(header.position());
                            return Ok(self.emit(&header, stats));
                        }
                        self.state = CursorState::BlockExhausted;
                    }
                    None => self.state = CursorState::NeedHeader,
                }
            }

            if self.pending_release {
                self.release(ring);
            }

            self.wait_for_user(ring, waiter, stats)?;
            self.pending_release = true;

            // Rebuilt after the handover: a v3 block descriptor is only
            // complete once its status says so.
            let header = self.header(ring);
            if header.len() == 0 {
                self.state = CursorState::NeedHeader;
                continue;
            }
            self.state = CursorState::HaveHeader;
            self.block = header.block_position();
            return Ok(match &header {
                HeaderView::V1(h) => self.emit(h, stats),
                HeaderView::V2(h) => self.emit(h, stats),
                HeaderView::V3(h) => self.emit(h, stats),
            });
        }
    }

    fn wait_for_user(
        &self,
        ring: &MappedRing,
        waiter: &dyn Wait,
        stats: &StatsTracker,
    ) -> Result<()> {
        let header = self.header(ring);
        while !header.is_user() {
            stats.record_poll();
            match waiter.wait(self.timeout_ms) {
                Ok(Readiness::Ready) => tracing::trace!("poll woke on slot {}", self.offset),
                Ok(Readiness::Interrupted) => continue,
                Ok(Readiness::TimedOut) => return Err(Error::PollTimeout),
                Ok(Readiness::Failed) => return Err(Error::PollFailure),
                Ok(Readiness::Woken) => return Err(Error::Closed),
                Err(source) => return Err(Error::Syscall { op: "poll", source }),
            }
        }
        Ok(())
    }

    fn emit<'a, H: FrameHeader<'a>>(&self, header: &H, stats: &StatsTracker) -> Frame {
        let (offset, mut len) = header.data_span();
        if self.snap_len > 0 {
            len = len.min(self.snap_len);
        }
        stats.record_packet();
        Frame {
            offset,
            len,
            info: CaptureInfo {
                timestamp: header.timestamp(),
                capture_length: len,
                length: header.len(),
                interface_index: header.ifindex(),
                vlan: header.vlan_tci().map(|tci| VlanTag { tci }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::io;
    use std::time::Duration;

    use super::*;
    use crate::header::testing::*;
    use crate::header::{V1Header, V2Header};

    const FRAME: usize = 2048;

    /// Stands in for poll(2). Each step either plays the kernel (the closure
    /// runs, then the wait reports ready) or returns a fixed outcome. An
    /// empty script times out.
    enum Step<'a> {
        Kernel(Box<dyn FnOnce() + 'a>),
        Return(io::Result<Readiness>),
    }

    struct Scripted<'a> {
        steps: RefCell<VecDeque<Step<'a>>>,
        calls: Cell<usize>,
    }

    impl<'a> Scripted<'a> {
        fn new(steps: Vec<Step<'a>>) -> Self {
            Self {
                steps: RefCell::new(steps.into()),
                calls: Cell::new(0),
            }
        }

        fn idle() -> Self {
            Self::new(Vec::new())
        }
    }

    impl Wait for Scripted<'_> {
        fn wait(&self, _timeout_ms: i32) -> io::Result<Readiness> {
            self.calls.set(self.calls.get() + 1);
            match self.steps.borrow_mut().pop_front() {
                Some(Step::Kernel(deliver)) => {
                    deliver();
                    Ok(Readiness::Ready)
                }
                Some(Step::Return(outcome)) => outcome,
                None => Ok(Readiness::TimedOut),
            }
        }
    }

    fn geometry(frames_per_block: usize, num_blocks: usize) -> RingGeometry {
        RingGeometry {
            frame_size: FRAME,
            frames_per_block,
            num_blocks,
            block_timeout: Duration::from_millis(64),
        }
    }

    fn setup(version: TpacketVersion, g: RingGeometry) -> (MappedRing, Cursor, StatsTracker) {
        (
            MappedRing::heap(g.mapping_size()),
            Cursor::new(version, g, 0, 100),
            StatsTracker::default(),
        )
    }

    #[test]
    fn test_reads_ready_frames_in_order_then_times_out() {
        let (ring, mut cursor, stats) = setup(TpacketVersion::V2, geometry(2, 2));
        let frames: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 60 + i as usize]).collect();
        for (i, data) in frames.iter().enumerate() {
            write_v2(&ring, i * FRAME, &Pkt::new(data));
        }

        let waiter = Scripted::idle();
        let mut seen = Vec::new();
        for data in &frames {
            let frame = cursor.next(&ring, &waiter, &stats).unwrap();
            assert_eq!(ring.bytes(frame.offset, frame.len), &data[..]);
            seen.push((frame.offset, frame.len));
        }
        for pair in seen.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }
        assert_eq!(waiter.calls.get(), 0);

        assert!(matches!(
            cursor.next(&ring, &waiter, &stats),
            Err(Error::PollTimeout)
        ));
        assert_eq!(waiter.calls.get(), 1);
        assert_eq!(stats.local(), crate::stats::Stats { packets: 4, polls: 1 });
    }

    #[test]
    fn test_frame_released_only_when_cursor_moves_on() {
        let (ring, mut cursor, stats) = setup(TpacketVersion::V2, geometry(2, 2));
        let data = [7u8; 60];
        write_v2(&ring, 0, &Pkt::new(&data));
        write_v2(&ring, FRAME, &Pkt::new(&data));
        let waiter = Scripted::idle();

        cursor.next(&ring, &waiter, &stats).unwrap();
        let first = V2Header::new(&ring, 0, FRAME);
        assert!(first.is_user());

        cursor.next(&ring, &waiter, &stats).unwrap();
        assert!(!first.is_user());
        assert!(V2Header::new(&ring, FRAME, FRAME).is_user());
    }

    #[test]
    fn test_timeout_consumes_nothing() {
        let (ring, mut cursor, stats) = setup(TpacketVersion::V2, geometry(2, 2));
        let data = [1u8; 60];
        let waiter = Scripted::idle();
        assert!(cursor.next(&ring, &waiter, &stats).unwrap_err().is_timeout());
        assert_eq!(cursor.state(), CursorState::NeedHeader);

        write_v2(&ring, 0, &Pkt::new(&data));
        let frame = cursor.next(&ring, &waiter, &stats).unwrap();
        assert_eq!(frame.offset, MAC as usize);
    }

    #[test]
    fn test_blocks_until_kernel_delivers() {
        let (ring, mut cursor, stats) = setup(TpacketVersion::V2, geometry(2, 2));
        let data = [3u8; 60];
        let waiter = Scripted::new(vec![
            Step::Return(Ok(Readiness::Ready)),
            Step::Kernel(Box::new(|| write_v2(&ring, 0, &Pkt::new(&data)))),
        ]);
        let frame = cursor.next(&ring, &waiter, &stats).unwrap();
        assert_eq!(frame.info.capture_length, 60);
        assert_eq!(waiter.calls.get(), 2);
        assert_eq!(stats.local().polls, 2);
    }

    #[test]
    fn test_interrupted_poll_is_retried() {
        let (ring, mut cursor, stats) = setup(TpacketVersion::V2, geometry(2, 2));
        let data = [3u8; 60];
        let waiter = Scripted::new(vec![
            Step::Return(Ok(Readiness::Interrupted)),
            Step::Return(Ok(Readiness::Interrupted)),
            Step::Kernel(Box::new(|| write_v2(&ring, 0, &Pkt::new(&data)))),
        ]);
        assert!(cursor.next(&ring, &waiter, &stats).is_ok());
        assert_eq!(waiter.calls.get(), 3);
    }

    #[test]
    fn test_poll_error_bit_is_not_retried() {
        let (ring, mut cursor, stats) = setup(TpacketVersion::V2, geometry(2, 2));
        let data = [3u8; 60];
        let waiter = Scripted::new(vec![
            Step::Return(Ok(Readiness::Failed)),
            Step::Kernel(Box::new(|| write_v2(&ring, 0, &Pkt::new(&data)))),
        ]);
        assert!(matches!(
            cursor.next(&ring, &waiter, &stats),
            Err(Error::PollFailure)
        ));
        assert_eq!(waiter.calls.get(), 1);
    }

    #[test]
    fn test_poll_syscall_error_and_close() {
        let (ring, mut cursor, stats) = setup(TpacketVersion::V2, geometry(2, 2));
        let waiter = Scripted::new(vec![
            Step::Return(Err(io::Error::from_raw_os_error(libc::EBADF))),
            Step::Return(Ok(Readiness::Woken)),
        ]);
        let err = cursor.next(&ring, &waiter, &stats).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
        assert!(matches!(
            cursor.next(&ring, &waiter, &stats),
            Err(Error::Closed)
        ));
    }

    #[test]
    fn test_ring_wraps_after_last_frame() {
        let (ring, mut cursor, stats) = setup(TpacketVersion::V1, geometry(1, 2));
        let a = [0xa; 60];
        let b = [0xb; 60];
        let c = [0xc; 60];
        write_v1(&ring, 0, &Pkt::new(&a));
        write_v1(&ring, FRAME, &Pkt::new(&b));
        let waiter = Scripted::new(vec![Step::Kernel(Box::new(|| {
            write_v1(&ring, 0, &Pkt::new(&c))
        }))]);

        assert_eq!(cursor.next(&ring, &waiter, &stats).unwrap().offset, MAC as usize);
        assert_eq!(
            cursor.next(&ring, &waiter, &stats).unwrap().offset,
            FRAME + MAC as usize
        );
        let frame = cursor.next(&ring, &waiter, &stats).unwrap();
        assert_eq!(frame.offset, MAC as usize);
        assert_eq!(ring.bytes(frame.offset, frame.len), &c[..]);
    }

    #[test]
    fn test_zero_length_frame_is_skipped() {
        let (ring, mut cursor, stats) = setup(TpacketVersion::V1, geometry(2, 2));
        let data = [5u8; 60];
        write_v1(&ring, 0, &Pkt::new(&[]));
        write_v1(&ring, FRAME, &Pkt::new(&data));
        let waiter = Scripted::idle();

        let frame = cursor.next(&ring, &waiter, &stats).unwrap();
        assert_eq!(frame.offset, FRAME + MAC as usize);
        assert!(!V1Header::new(&ring, 0, FRAME).is_user());
        assert_eq!(stats.local().packets, 1);
    }

    #[test]
    fn test_v3_drains_block_before_releasing_it() {
        let g = geometry(2, 2);
        let (ring, mut cursor, stats) = setup(TpacketVersion::V3, g);
        let block = g.block_size();
        let a = [1u8; 60];
        let b = [2u8; 70];
        let c = [3u8; 80];
        let offsets = write_v3_block(&ring, 0, &[Pkt::new(&a), Pkt::new(&b)]);
        write_v3_block(&ring, block, &[Pkt::new(&c)]);
        let waiter = Scripted::idle();

        let first = cursor.next(&ring, &waiter, &stats).unwrap();
        assert_eq!(first.offset, offsets[0] + MAC as usize);
        assert_eq!(first.len, 60);
        let second = cursor.next(&ring, &waiter, &stats).unwrap();
        assert_eq!(second.offset, offsets[1] + MAC as usize);
        assert!(V3Header::first(&ring, 0, block).is_user());
        assert_eq!(cursor.state(), CursorState::HaveHeader);

        let third = cursor.next(&ring, &waiter, &stats).unwrap();
        assert_eq!(ring.bytes(third.offset, third.len), &c[..]);
        assert!(!V3Header::first(&ring, 0, block).is_user());

        assert!(cursor.next(&ring, &waiter, &stats).unwrap_err().is_timeout());
        assert_eq!(cursor.state(), CursorState::BlockExhausted);
        assert!(!V3Header::first(&ring, block, block).is_user());
    }

    #[test]
    fn test_v3_empty_block_never_reaches_caller() {
        let g = geometry(2, 2);
        let (ring, mut cursor, stats) = setup(TpacketVersion::V3, g);
        let data = [9u8; 60];
        write_v3_block(&ring, 0, &[]);
        write_v3_block(&ring, g.block_size(), &[Pkt::new(&data)]);
        let waiter = Scripted::idle();

        let frame = cursor.next(&ring, &waiter, &stats).unwrap();
        assert_eq!(ring.bytes(frame.offset, frame.len), &data[..]);
        assert!(!V3Header::first(&ring, 0, g.block_size()).is_user());
    }

    #[test]
    fn test_snap_len_caps_capture_length_only() {
        let g = geometry(2, 2);
        let ring = MappedRing::heap(g.mapping_size());
        let mut cursor = Cursor::new(TpacketVersion::V2, g, 32, 100);
        let stats = StatsTracker::default();
        let data = [4u8; 60];
        write_v2(&ring, 0, &Pkt::new(&data));

        let frame = cursor.next(&ring, &Scripted::idle(), &stats).unwrap();
        assert_eq!(frame.len, 32);
        assert_eq!(frame.info.capture_length, 32);
        assert_eq!(frame.info.length, 60);
    }

    #[test]
    fn test_vlan_reported_in_capture_info() {
        let (ring, mut cursor, stats) = setup(TpacketVersion::V2, geometry(2, 2));
        let data = [4u8; 60];
        write_v2(&ring, 0, &Pkt { vlan_tci: Some(0x0064), ..Pkt::new(&data) });
        write_v2(&ring, FRAME, &Pkt::new(&data));
        let waiter = Scripted::idle();

        let tagged = cursor.next(&ring, &waiter, &stats).unwrap();
        assert_eq!(tagged.info.vlan.map(|v| v.id()), Some(100));
        let untagged = cursor.next(&ring, &waiter, &stats).unwrap();
        assert_eq!(untagged.info.vlan, None);
    }
}
