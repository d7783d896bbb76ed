#![no_std]

//! Kernel ABI for `AF_PACKET` memory-mapped rings.
//!
//! Every struct here mirrors a definition from `<linux/if_packet.h>` /
//! `<linux/filter.h>` field for field. The ring reader derives its field
//! offsets from these layouts with `core::mem::offset_of!`, so a mismatch here
//! is a mismatch with the kernel. Do not reorder fields.

use core::ffi::c_ulong;
use core::mem::size_of;

// -- Socket options -----------------------------------------------------------

pub const SOL_SOCKET: i32 = 1;
pub const SOL_PACKET: i32 = 263;

pub const SO_ATTACH_FILTER: i32 = 26;
pub const SO_ATTACH_BPF: i32 = 50;

pub const PACKET_RX_RING: i32 = 5;
pub const PACKET_STATISTICS: i32 = 6;
pub const PACKET_VERSION: i32 = 10;
pub const PACKET_FANOUT: i32 = 18;

/// Every protocol, host byte order. Convert with `to_be()` before handing it
/// to `socket(2)` or `sockaddr_ll`.
pub const ETH_P_ALL: u16 = 0x0003;

// -- Ring versions ------------------------------------------------------------

pub const TPACKET_V1: i32 = 0;
pub const TPACKET_V2: i32 = 1;
pub const TPACKET_V3: i32 = 2;

// -- Frame / block status bits ------------------------------------------------

pub const TP_STATUS_KERNEL: u32 = 0;
pub const TP_STATUS_USER: u32 = 1 << 0;
pub const TP_STATUS_COPY: u32 = 1 << 1;
pub const TP_STATUS_LOSING: u32 = 1 << 2;
pub const TP_STATUS_CSUMNOTREADY: u32 = 1 << 3;
pub const TP_STATUS_VLAN_VALID: u32 = 1 << 4;
pub const TP_STATUS_BLK_TMO: u32 = 1 << 5;
pub const TP_STATUS_VLAN_TPID_VALID: u32 = 1 << 6;

// -- Fanout -------------------------------------------------------------------

pub const PACKET_FANOUT_HASH: u16 = 0;
pub const PACKET_FANOUT_LB: u16 = 1;
pub const PACKET_FANOUT_CPU: u16 = 2;
pub const PACKET_FANOUT_ROLLOVER: u16 = 3;
pub const PACKET_FANOUT_RND: u16 = 4;
pub const PACKET_FANOUT_QM: u16 = 5;
pub const PACKET_FANOUT_CBPF: u16 = 6;
pub const PACKET_FANOUT_EBPF: u16 = 7;
pub const PACKET_FANOUT_FLAG_ROLLOVER: u16 = 0x1000;
pub const PACKET_FANOUT_FLAG_DEFRAG: u16 = 0x8000;

// -- Socket filter program ----------------------------------------------------

/// Capacity of the `ETHER_TYPES` map the ringtap-ebpf socket filter reads.
pub const MAX_FILTER_ETHER_TYPES: u32 = 64;

// -- Alignment ----------------------------------------------------------------

pub const TPACKET_ALIGNMENT: usize = 16;

/// `TPACKET_ALIGN(x)`.
pub const fn tpacket_align(x: usize) -> usize {
    (x + TPACKET_ALIGNMENT - 1) & !(TPACKET_ALIGNMENT - 1)
}

/// Offset of the `sockaddr_ll` that follows a v1 frame header.
pub const TPACKET_HDRLEN: usize = tpacket_align(size_of::<TpacketHdr>());
/// Offset of the `sockaddr_ll` that follows a v2 frame header.
pub const TPACKET2_HDRLEN: usize = tpacket_align(size_of::<Tpacket2Hdr>());
/// Offset of the `sockaddr_ll` that follows a v3 packet header.
pub const TPACKET3_HDRLEN: usize = tpacket_align(size_of::<Tpacket3Hdr>());

// -- Ring headers -------------------------------------------------------------

/// `struct tpacket_hdr` (TPACKET_V1).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TpacketHdr {
    pub tp_status: c_ulong,
    pub tp_len: u32,
    pub tp_snaplen: u32,
    pub tp_mac: u16,
    pub tp_net: u16,
    pub tp_sec: u32,
    pub tp_usec: u32,
}

/// `struct tpacket2_hdr` (TPACKET_V2).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Tpacket2Hdr {
    pub tp_status: u32,
    pub tp_len: u32,
    pub tp_snaplen: u32,
    pub tp_mac: u16,
    pub tp_net: u16,
    pub tp_sec: u32,
    pub tp_nsec: u32,
    pub tp_vlan_tci: u16,
    pub tp_vlan_tpid: u16,
    pub tp_padding: [u8; 4],
}

/// `struct tpacket_hdr_variant1`, embedded in every v3 packet header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TpacketHdrVariant1 {
    pub tp_rxhash: u32,
    pub tp_vlan_tci: u32,
    pub tp_vlan_tpid: u16,
    pub tp_padding: u16,
}

/// `struct tpacket3_hdr` (TPACKET_V3 per-packet header inside a block).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Tpacket3Hdr {
    pub tp_next_offset: u32,
    pub tp_sec: u32,
    pub tp_nsec: u32,
    pub tp_snaplen: u32,
    pub tp_len: u32,
    pub tp_status: u32,
    pub tp_mac: u16,
    pub tp_net: u16,
    pub hv1: TpacketHdrVariant1,
    pub tp_padding: [u8; 8],
}

/// `struct tpacket_bd_ts`. The second word is usec or nsec depending on the
/// socket's timestamp source; the kernel fills nsec for v3 rings.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TpacketBdTs {
    pub ts_sec: u32,
    pub ts_nsec: u32,
}

/// `struct tpacket_hdr_v1`, the block header of a v3 block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TpacketHdrV1 {
    pub block_status: u32,
    pub num_pkts: u32,
    pub offset_to_first_pkt: u32,
    pub blk_len: u32,
    pub seq_num: u64,
    pub ts_first_pkt: TpacketBdTs,
    pub ts_last_pkt: TpacketBdTs,
}

/// `struct tpacket_block_desc`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TpacketBlockDesc {
    pub version: u32,
    pub offset_to_priv: u32,
    pub hdr: TpacketHdrV1,
}

// -- Ring requests ------------------------------------------------------------

/// `struct tpacket_req` (PACKET_RX_RING for v1/v2).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TpacketReq {
    pub tp_block_size: u32,
    pub tp_block_nr: u32,
    pub tp_frame_size: u32,
    pub tp_frame_nr: u32,
}

/// `struct tpacket_req3` (PACKET_RX_RING for v3).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TpacketReq3 {
    pub tp_block_size: u32,
    pub tp_block_nr: u32,
    pub tp_frame_size: u32,
    pub tp_frame_nr: u32,
    /// Block retire timeout in milliseconds.
    pub tp_retire_blk_tov: u32,
    pub tp_sizeof_priv: u32,
    pub tp_feature_req_word: u32,
}

// -- Statistics ---------------------------------------------------------------

/// `struct tpacket_stats`. Reading PACKET_STATISTICS resets the kernel copy.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct TpacketStats {
    pub tp_packets: u32,
    pub tp_drops: u32,
}

/// `struct tpacket_stats_v3`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct TpacketStatsV3 {
    pub tp_packets: u32,
    pub tp_drops: u32,
    pub tp_freeze_q_cnt: u32,
}

// -- Filters / addressing -----------------------------------------------------

/// `struct sock_filter`: one classic BPF instruction.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

/// `struct sockaddr_ll`. The kernel writes one after every frame header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SockaddrLl {
    pub sll_family: u16,
    pub sll_protocol: u16,
    pub sll_ifindex: i32,
    pub sll_hatype: u16,
    pub sll_pkttype: u8,
    pub sll_halen: u8,
    pub sll_addr: [u8; 8],
}

// Sizes the kernel headers have on LP64 targets.
#[cfg(target_pointer_width = "64")]
const _: () = assert!(size_of::<TpacketHdr>() == 32);
const _: () = assert!(size_of::<Tpacket2Hdr>() == 32);
const _: () = assert!(size_of::<Tpacket3Hdr>() == 48);
const _: () = assert!(size_of::<TpacketBlockDesc>() == 48);
const _: () = assert!(size_of::<TpacketReq3>() == 28);
const _: () = assert!(size_of::<SockFilter>() == 8);
const _: () = assert!(size_of::<SockaddrLl>() == 20);
