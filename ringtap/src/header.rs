//! Accessors over the three ring header layouts.
//!
//! A header is a short-lived view: the cursor builds one per advance from a
//! plain position and drops it before returning to the caller.

use std::mem::{offset_of, size_of};
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ringtap_common::{
    tpacket_align, SockaddrLl, Tpacket2Hdr, Tpacket3Hdr, TpacketBlockDesc, TpacketHdr,
    TpacketHdrV1, TpacketHdrVariant1, TPACKET2_HDRLEN, TPACKET3_HDRLEN, TPACKET_HDRLEN,
    TP_STATUS_KERNEL, TP_STATUS_USER, TP_STATUS_VLAN_VALID,
};

use crate::options::TpacketVersion;
use crate::ring::MappedRing;

const SLL_IFINDEX: usize = offset_of!(SockaddrLl, sll_ifindex);

const BLOCK_STATUS: usize =
    offset_of!(TpacketBlockDesc, hdr) + offset_of!(TpacketHdrV1, block_status);
const BLOCK_NUM_PKTS: usize =
    offset_of!(TpacketBlockDesc, hdr) + offset_of!(TpacketHdrV1, num_pkts);
const BLOCK_FIRST_PKT: usize =
    offset_of!(TpacketBlockDesc, hdr) + offset_of!(TpacketHdrV1, offset_to_first_pkt);

/// What every ring layout can tell us about the slot it describes.
pub(crate) trait FrameHeader<'a> {
    fn status(&self) -> u32;

    /// Hand the slot back to the kernel.
    fn clear_status(&self);

    /// Full on-wire length.
    fn len(&self) -> usize;

    #[cfg(test)]
    fn ring(&self) -> &'a MappedRing;

    /// Start and length of the captured bytes, bounded by the slot.
    fn data_span(&self) -> (usize, usize);

    #[cfg(test)]
    fn data(&self) -> &'a [u8] {
        let (start, len) = self.data_span();
        self.ring().bytes(start, len)
    }

    fn timestamp(&self) -> SystemTime;

    fn ifindex(&self) -> i32;

    /// Raw 802.1Q TCI, when the kernel marked it valid.
    fn vlan_tci(&self) -> Option<u16>;

    /// Step to the next packet in the same slot. Only v3 blocks hold more
    /// than one packet.
    fn advance(&mut self) -> bool {
        false
    }

    fn is_user(&self) -> bool {
        self.status() & TP_STATUS_USER != 0
    }
}

fn epoch(sec: u32, nsec: u32) -> SystemTime {
    UNIX_EPOCH + Duration::new(u64::from(sec), nsec.min(999_999_999))
}

fn clamp(start: usize, len: usize, limit: usize) -> (usize, usize) {
    let end = start.saturating_add(len).min(limit);
    (start, end.saturating_sub(start))
}

// -- v1 -----------------------------------------------------------------------

pub(crate) struct V1Header<'a> {
    ring: &'a MappedRing,
    base: usize,
    limit: usize,
}

impl<'a> V1Header<'a> {
    pub(crate) fn new(ring: &'a MappedRing, base: usize, frame_size: usize) -> Self {
        Self {
            ring,
            base,
            limit: base + frame_size,
        }
    }

    fn u32(&self, field: usize) -> u32 {
        self.ring.u32_at(self.base + field).unwrap_or(0)
    }
}

impl<'a> FrameHeader<'a> for V1Header<'a> {
    fn status(&self) -> u32 {
        self.ring
            .status_ulong(self.base + offset_of!(TpacketHdr, tp_status))
            .map_or(TP_STATUS_KERNEL, |s| s.load(Ordering::Acquire) as u32)
    }

    fn clear_status(&self) {
        if let Some(s) = self
            .ring
            .status_ulong(self.base + offset_of!(TpacketHdr, tp_status))
        {
            s.store(TP_STATUS_KERNEL as usize, Ordering::Release);
        }
    }

    fn len(&self) -> usize {
        self.u32(offset_of!(TpacketHdr, tp_len)) as usize
    }

    #[cfg(test)]
    fn ring(&self) -> &'a MappedRing {
        self.ring
    }

    fn data_span(&self) -> (usize, usize) {
        let mac = self
            .ring
            .u16_at(self.base + offset_of!(TpacketHdr, tp_mac))
            .unwrap_or(0) as usize;
        let snaplen = self.u32(offset_of!(TpacketHdr, tp_snaplen)) as usize;
        clamp(self.base + mac, snaplen, self.limit)
    }

    fn timestamp(&self) -> SystemTime {
        let usec = self.u32(offset_of!(TpacketHdr, tp_usec));
        epoch(
            self.u32(offset_of!(TpacketHdr, tp_sec)),
            usec.saturating_mul(1000),
        )
    }

    fn ifindex(&self) -> i32 {
        self.u32(TPACKET_HDRLEN + SLL_IFINDEX) as i32
    }

    fn vlan_tci(&self) -> Option<u16> {
        None
    }
}

// -- v2 -----------------------------------------------------------------------

pub(crate) struct V2Header<'a> {
    ring: &'a MappedRing,
    base: usize,
    limit: usize,
}

impl<'a> V2Header<'a> {
    pub(crate) fn new(ring: &'a MappedRing, base: usize, frame_size: usize) -> Self {
        Self {
            ring,
            base,
            limit: base + frame_size,
        }
    }

    fn u32(&self, field: usize) -> u32 {
        self.ring.u32_at(self.base + field).unwrap_or(0)
    }
}

impl<'a> FrameHeader<'a> for V2Header<'a> {
    fn status(&self) -> u32 {
        self.ring
            .status_u32(self.base + offset_of!(Tpacket2Hdr, tp_status))
            .map_or(TP_STATUS_KERNEL, |s| s.load(Ordering::Acquire))
    }

    fn clear_status(&self) {
        if let Some(s) = self
            .ring
            .status_u32(self.base + offset_of!(Tpacket2Hdr, tp_status))
        {
            s.store(TP_STATUS_KERNEL, Ordering::Release);
        }
    }

    fn len(&self) -> usize {
        self.u32(offset_of!(Tpacket2Hdr, tp_len)) as usize
    }

    #[cfg(test)]
    fn ring(&self) -> &'a MappedRing {
        self.ring
    }

    fn data_span(&self) -> (usize, usize) {
        let mac = self
            .ring
            .u16_at(self.base + offset_of!(Tpacket2Hdr, tp_mac))
            .unwrap_or(0) as usize;
        let snaplen = self.u32(offset_of!(Tpacket2Hdr, tp_snaplen)) as usize;
        clamp(self.base + mac, snaplen, self.limit)
    }

    fn timestamp(&self) -> SystemTime {
        epoch(
            self.u32(offset_of!(Tpacket2Hdr, tp_sec)),
            self.u32(offset_of!(Tpacket2Hdr, tp_nsec)),
        )
    }

    fn ifindex(&self) -> i32 {
        self.u32(TPACKET2_HDRLEN + SLL_IFINDEX) as i32
    }

    fn vlan_tci(&self) -> Option<u16> {
        if self.status() & TP_STATUS_VLAN_VALID == 0 {
            return None;
        }
        self.ring
            .u16_at(self.base + offset_of!(Tpacket2Hdr, tp_vlan_tci))
    }
}

// -- v3 -----------------------------------------------------------------------

/// Where a v3 walk stands inside its block. Kept by the cursor between reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockPosition {
    pub block: usize,
    pub packet: usize,
    pub used: u32,
    pub num_pkts: u32,
}

pub(crate) struct V3Header<'a> {
    ring: &'a MappedRing,
    pos: BlockPosition,
    limit: usize,
}

impl<'a> V3Header<'a> {
    /// Position at the block descriptor's first packet.
    pub(crate) fn first(ring: &'a MappedRing, block: usize, block_size: usize) -> Self {
        let limit = block + block_size;
        let num_pkts = ring.u32_at(block + BLOCK_NUM_PKTS).unwrap_or(0);
        let first = ring.u32_at(block + BLOCK_FIRST_PKT).unwrap_or(0) as usize;
        let packet = block + first;
        let fits = packet + size_of::<Tpacket3Hdr>() <= limit;
        Self {
            ring,
            pos: BlockPosition {
                block,
                packet,
                used: 0,
                num_pkts: if fits { num_pkts } else { 0 },
            },
            limit,
        }
    }

    pub(crate) fn resume(ring: &'a MappedRing, pos: BlockPosition, block_size: usize) -> Self {
        Self {
            ring,
            pos,
            limit: pos.block + block_size,
        }
    }

    pub(crate) fn position(&self) -> BlockPosition {
        self.pos
    }

    fn u32(&self, field: usize) -> u32 {
        self.ring.u32_at(self.pos.packet + field).unwrap_or(0)
    }
}

impl<'a> FrameHeader<'a> for V3Header<'a> {
    fn status(&self) -> u32 {
        self.ring
            .status_u32(self.pos.block + BLOCK_STATUS)
            .map_or(TP_STATUS_KERNEL, |s| s.load(Ordering::Acquire))
    }

    fn clear_status(&self) {
        if let Some(s) = self.ring.status_u32(self.pos.block + BLOCK_STATUS) {
            s.store(TP_STATUS_KERNEL, Ordering::Release);
        }
    }

    fn len(&self) -> usize {
        if self.pos.num_pkts == 0 {
            return 0;
        }
        self.u32(offset_of!(Tpacket3Hdr, tp_len)) as usize
    }

    #[cfg(test)]
    fn ring(&self) -> &'a MappedRing {
        self.ring
    }

    fn data_span(&self) -> (usize, usize) {
        if self.pos.num_pkts == 0 {
            return (self.pos.block, 0);
        }
        let mac = self
            .ring
            .u16_at(self.pos.packet + offset_of!(Tpacket3Hdr, tp_mac))
            .unwrap_or(0) as usize;
        let snaplen = self.u32(offset_of!(Tpacket3Hdr, tp_snaplen)) as usize;
        clamp(self.pos.packet + mac, snaplen, self.limit)
    }

    fn timestamp(&self) -> SystemTime {
        epoch(
            self.u32(offset_of!(Tpacket3Hdr, tp_sec)),
            self.u32(offset_of!(Tpacket3Hdr, tp_nsec)),
        )
    }

    fn ifindex(&self) -> i32 {
        self.u32(TPACKET3_HDRLEN + SLL_IFINDEX) as i32
    }

    fn vlan_tci(&self) -> Option<u16> {
        if self.u32(offset_of!(Tpacket3Hdr, tp_status)) & TP_STATUS_VLAN_VALID == 0 {
            return None;
        }
        self.ring.u16_at(
            self.pos.packet
                + offset_of!(Tpacket3Hdr, hv1)
                + offset_of!(TpacketHdrVariant1, tp_vlan_tci),
        )
    }

    fn advance(&mut self) -> bool {
        self.pos.used += 1;
        if self.pos.used >= self.pos.num_pkts {
            return false;
        }
        let next_offset = self.u32(offset_of!(Tpacket3Hdr, tp_next_offset)) as usize;
        let next = if next_offset != 0 {
            self.pos.packet + next_offset
        } else {
            let mac = self
                .ring
                .u16_at(self.pos.packet + offset_of!(Tpacket3Hdr, tp_mac))
                .unwrap_or(0) as usize;
            let snaplen = self.u32(offset_of!(Tpacket3Hdr, tp_snaplen)) as usize;
            self.pos.packet + tpacket_align(snaplen + mac)
        };
        if next <= self.pos.packet || next + size_of::<Tpacket3Hdr>() > self.limit {
            self.pos.used = self.pos.num_pkts;
            return false;
        }
        self.pos.packet = next;
        true
    }
}

/// The header at the cursor, in whichever layout was negotiated.
pub(crate) enum HeaderView<'a> {
    V1(V1Header<'a>),
    V2(V2Header<'a>),
    V3(V3Header<'a>),
}

impl<'a> HeaderView<'a> {
    /// The header that owns slot `offset` of the ring.
    pub(crate) fn at(
        ring: &'a MappedRing,
        version: TpacketVersion,
        offset: usize,
        frame_size: usize,
        block_size: usize,
    ) -> Self {
        match version {
            TpacketVersion::V1 => HeaderView::V1(V1Header::new(ring, offset, frame_size)),
            TpacketVersion::V2 => HeaderView::V2(V2Header::new(ring, offset, frame_size)),
            TpacketVersion::V3 => HeaderView::V3(V3Header::first(ring, offset, block_size)),
        }
    }

    pub(crate) fn is_user(&self) -> bool {
        match self {
            HeaderView::V1(h) => h.is_user(),
            HeaderView::V2(h) => h.is_user(),
            HeaderView::V3(h) => h.is_user(),
        }
    }

    pub(crate) fn clear_status(&self) {
        match self {
            HeaderView::V1(h) => h.clear_status(),
            HeaderView::V2(h) => h.clear_status(),
            HeaderView::V3(h) => h.clear_status(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            HeaderView::V1(h) => h.len(),
            HeaderView::V2(h) => h.len(),
            HeaderView::V3(h) => h.len(),
        }
    }

    pub(crate) fn block_position(&self) -> Option<BlockPosition> {
        match self {
            HeaderView::V3(h) => Some(h.position()),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Writers that lay packets out the way the kernel does.

    use super::*;

    pub(crate) const MAC: u16 = 80;

    fn put_u16(ring: &MappedRing, at: usize, v: u16) {
        ring.write(at, &v.to_ne_bytes());
    }

    fn put_u32(ring: &MappedRing, at: usize, v: u32) {
        ring.write(at, &v.to_ne_bytes());
    }

    pub(crate) struct Pkt<'p> {
        pub data: &'p [u8],
        pub wire_len: u32,
        pub sec: u32,
        pub subsec: u32,
        pub ifindex: i32,
        pub vlan_tci: Option<u16>,
    }

    impl<'p> Pkt<'p> {
        pub(crate) fn new(data: &'p [u8]) -> Self {
            Self {
                data,
                wire_len: data.len() as u32,
                sec: 1_700_000_000,
                subsec: 0,
                ifindex: 1,
                vlan_tci: None,
            }
        }
    }

    pub(crate) fn write_v1(ring: &MappedRing, base: usize, pkt: &Pkt<'_>) {
        put_u32(ring, base + offset_of!(TpacketHdr, tp_len), pkt.wire_len);
        put_u32(ring, base + offset_of!(TpacketHdr, tp_snaplen), pkt.data.len() as u32);
        put_u16(ring, base + offset_of!(TpacketHdr, tp_mac), MAC);
        put_u32(ring, base + offset_of!(TpacketHdr, tp_sec), pkt.sec);
        put_u32(ring, base + offset_of!(TpacketHdr, tp_usec), pkt.subsec);
        put_u32(ring, base + TPACKET_HDRLEN + SLL_IFINDEX, pkt.ifindex as u32);
        ring.write(base + MAC as usize, pkt.data);
        ring.status_ulong(base)
            .unwrap()
            .store(TP_STATUS_USER as usize, Ordering::Release);
    }

    pub(crate) fn write_v2(ring: &MappedRing, base: usize, pkt: &Pkt<'_>) {
        put_u32(ring, base + offset_of!(Tpacket2Hdr, tp_len), pkt.wire_len);
        put_u32(ring, base + offset_of!(Tpacket2Hdr, tp_snaplen), pkt.data.len() as u32);
        put_u16(ring, base + offset_of!(Tpacket2Hdr, tp_mac), MAC);
        put_u32(ring, base + offset_of!(Tpacket2Hdr, tp_sec), pkt.sec);
        put_u32(ring, base + offset_of!(Tpacket2Hdr, tp_nsec), pkt.subsec);
        put_u16(
            ring,
            base + offset_of!(Tpacket2Hdr, tp_vlan_tci),
            pkt.vlan_tci.unwrap_or(0),
        );
        put_u32(ring, base + TPACKET2_HDRLEN + SLL_IFINDEX, pkt.ifindex as u32);
        ring.write(base + MAC as usize, pkt.data);
        let mut status = TP_STATUS_USER;
        if pkt.vlan_tci.is_some() {
            status |= TP_STATUS_VLAN_VALID;
        }
        ring.status_u32(base + offset_of!(Tpacket2Hdr, tp_status))
            .unwrap()
            .store(status, Ordering::Release);
    }

    /// Fill a v3 block with `pkts` back to back and hand it to user space.
    /// Returns the packet offsets relative to the block.
    pub(crate) fn write_v3_block(ring: &MappedRing, block: usize, pkts: &[Pkt<'_>]) -> Vec<usize> {
        let first = tpacket_align(size_of::<TpacketBlockDesc>());
        let mut offsets = Vec::new();
        let mut at = first;
        for (i, pkt) in pkts.iter().enumerate() {
            let p = block + at;
            let span = tpacket_align(MAC as usize + pkt.data.len());
            let next = if i + 1 == pkts.len() { 0 } else { span as u32 };
            put_u32(ring, p + offset_of!(Tpacket3Hdr, tp_next_offset), next);
            put_u32(ring, p + offset_of!(Tpacket3Hdr, tp_sec), pkt.sec);
            put_u32(ring, p + offset_of!(Tpacket3Hdr, tp_nsec), pkt.subsec);
            put_u32(ring, p + offset_of!(Tpacket3Hdr, tp_snaplen), pkt.data.len() as u32);
            put_u32(ring, p + offset_of!(Tpacket3Hdr, tp_len), pkt.wire_len);
            let status = if pkt.vlan_tci.is_some() { TP_STATUS_VLAN_VALID } else { 0 };
            put_u32(ring, p + offset_of!(Tpacket3Hdr, tp_status), status);
            put_u16(ring, p + offset_of!(Tpacket3Hdr, tp_mac), MAC);
            put_u32(
                ring,
                p + offset_of!(Tpacket3Hdr, hv1) + offset_of!(TpacketHdrVariant1, tp_vlan_tci),
                u32::from(pkt.vlan_tci.unwrap_or(0)),
            );
            put_u32(ring, p + TPACKET3_HDRLEN + SLL_IFINDEX, pkt.ifindex as u32);
            ring.write(p + MAC as usize, pkt.data);
            offsets.push(at);
            at += span;
        }
        put_u32(ring, block + BLOCK_NUM_PKTS, pkts.len() as u32);
        put_u32(ring, block + BLOCK_FIRST_PKT, first as u32);
        ring.status_u32(block + BLOCK_STATUS)
            .unwrap()
            .store(TP_STATUS_USER, Ordering::Release);
        offsets
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    const FRAME: usize = 2048;
    const BLOCK: usize = 2048 * 4;

    fn payload() -> Vec<u8> {
        (0..60u8).collect()
    }

    #[test]
    fn test_layouts_decode_the_same_packet() {
        let bytes = payload();
        let mut pkt = Pkt::new(&bytes);
        pkt.wire_len = 1514;
        pkt.ifindex = 3;

        let v1 = MappedRing::heap(BLOCK);
        pkt.subsec = 250_000;
        write_v1(&v1, 0, &pkt);
        let h1 = V1Header::new(&v1, 0, FRAME);

        let v2 = MappedRing::heap(BLOCK);
        pkt.subsec = 250_000_000;
        write_v2(&v2, 0, &pkt);
        let h2 = V2Header::new(&v2, 0, FRAME);

        let v3 = MappedRing::heap(BLOCK);
        write_v3_block(
            &v3,
            0,
            &[Pkt {
                subsec: 250_000_000,
                wire_len: 1514,
                ifindex: 3,
                ..Pkt::new(&bytes)
            }],
        );
        let h3 = V3Header::first(&v3, 0, BLOCK);

        let expected_ts = UNIX_EPOCH + Duration::new(1_700_000_000, 250_000_000);
        assert_eq!(h1.data(), &bytes[..]);
        assert_eq!(h2.data(), &bytes[..]);
        assert_eq!(h3.data(), &bytes[..]);
        assert_eq!(h1.len(), 1514);
        assert_eq!(h2.len(), 1514);
        assert_eq!(h3.len(), 1514);
        assert_eq!(h1.timestamp(), expected_ts);
        assert_eq!(h2.timestamp(), expected_ts);
        assert_eq!(h3.timestamp(), expected_ts);
        assert_eq!(h1.ifindex(), 3);
        assert_eq!(h2.ifindex(), 3);
        assert_eq!(h3.ifindex(), 3);
        assert!(h1.is_user() && h2.is_user() && h3.is_user());
    }

    #[test]
    fn test_vlan_only_when_marked_valid() {
        let bytes = payload();
        let ring = MappedRing::heap(BLOCK);
        write_v2(&ring, 0, &Pkt { vlan_tci: Some(0x2064), ..Pkt::new(&bytes) });
        write_v2(&ring, FRAME, &Pkt::new(&bytes));
        assert_eq!(V2Header::new(&ring, 0, FRAME).vlan_tci(), Some(0x2064));
        assert_eq!(V2Header::new(&ring, FRAME, FRAME).vlan_tci(), None);
        assert_eq!(V1Header::new(&ring, 0, FRAME).vlan_tci(), None);

        let v3 = MappedRing::heap(BLOCK);
        write_v3_block(
            &v3,
            0,
            &[Pkt { vlan_tci: Some(42), ..Pkt::new(&bytes) }, Pkt::new(&bytes)],
        );
        let mut h = V3Header::first(&v3, 0, BLOCK);
        assert_eq!(h.vlan_tci(), Some(42));
        assert!(h.advance());
        assert_eq!(h.vlan_tci(), None);
    }

    #[test]
    fn test_v3_walks_block_until_exhausted() {
        let a = [1u8; 60];
        let b = [2u8; 100];
        let c = [3u8; 10];
        let ring = MappedRing::heap(BLOCK);
        write_v3_block(&ring, 0, &[Pkt::new(&a), Pkt::new(&b), Pkt::new(&c)]);

        let mut h = V3Header::first(&ring, 0, BLOCK);
        assert_eq!(h.data(), &a[..]);
        assert!(h.advance());
        assert_eq!(h.data(), &b[..]);
        assert!(h.advance());
        assert_eq!(h.data(), &c[..]);
        assert!(!h.advance());
        assert!(!h.advance());
    }

    #[test]
    fn test_v3_empty_block_reports_zero_length() {
        let ring = MappedRing::heap(BLOCK);
        write_v3_block(&ring, 0, &[]);
        let h = V3Header::first(&ring, 0, BLOCK);
        assert!(h.is_user());
        assert_eq!(h.len(), 0);
        assert!(h.data().is_empty());
    }

    #[test]
    fn test_v3_rejects_first_packet_outside_block() {
        let ring = MappedRing::heap(BLOCK);
        write_v3_block(&ring, 0, &[Pkt::new(&[9u8; 4])]);
        ring.write(BLOCK_FIRST_PKT, &(BLOCK as u32).to_ne_bytes());
        let h = V3Header::first(&ring, 0, BLOCK);
        assert_eq!(h.len(), 0);
    }

    #[test]
    fn test_data_is_clamped_to_frame() {
        let bytes = payload();
        let ring = MappedRing::heap(BLOCK);
        write_v2(&ring, 0, &Pkt::new(&bytes));
        ring.write(offset_of!(Tpacket2Hdr, tp_snaplen), &(FRAME as u32 * 4).to_ne_bytes());
        let h = V2Header::new(&ring, 0, FRAME);
        assert_eq!(h.data().len(), FRAME - MAC as usize);
    }

    #[test]
    fn test_clear_status_returns_slot_to_kernel() {
        let bytes = payload();
        let ring = MappedRing::heap(BLOCK);
        write_v1(&ring, 0, &Pkt::new(&bytes));
        let h = V1Header::new(&ring, 0, FRAME);
        assert!(h.is_user());
        h.clear_status();
        assert!(!h.is_user());
    }
}
