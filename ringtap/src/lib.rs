//! Packet capture from a Linux `AF_PACKET` memory-mapped receive ring.
//!
//! ```no_run
//! use ringtap::{Options, TPacket};
//!
//! let tp = TPacket::open(Options::default().interface("eth0"))?;
//! loop {
//!     let packet = tp.zero_copy_read()?;
//!     println!("{} bytes on ifindex {}", packet.info().length, packet.info().interface_index);
//! }
//! # Ok::<(), ringtap::Error>(())
//! ```

mod cursor;
mod error;
mod fanout;
mod filter;
mod header;
mod options;
mod packet;
mod poll;
mod ring;
mod socket;
mod stats;
mod tpacket;

pub use error::{Error, Result};
pub use fanout::FanoutType;
pub use filter::parse_ddd;
pub use options::{
    page_size, Options, RingGeometry, SocketType, TpacketVersion, VersionPreference,
    DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_TIMEOUT, DEFAULT_FRAME_SIZE, DEFAULT_NUM_BLOCKS,
};
pub use packet::{CaptureInfo, Packet, VlanTag};
pub use ringtap_common::SockFilter;
pub use socket::interface_index;
pub use stats::{SocketStats, Stats};
pub use tpacket::{PacketRef, TPacket};
