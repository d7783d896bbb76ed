use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use ringtap_common::{TpacketReq, TpacketReq3, TPACKET_V1, TPACKET_V2, TPACKET_V3};
use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_FRAME_SIZE: usize = 4096;
pub const DEFAULT_BLOCK_SIZE: usize = DEFAULT_FRAME_SIZE * 128;
pub const DEFAULT_NUM_BLOCKS: usize = 128;
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_millis(64);

/// A ring layout revision the kernel speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TpacketVersion {
    V1,
    V2,
    V3,
}

impl TpacketVersion {
    /// Value for the PACKET_VERSION socket option.
    pub fn as_raw(self) -> i32 {
        match self {
            TpacketVersion::V1 => TPACKET_V1,
            TpacketVersion::V2 => TPACKET_V2,
            TpacketVersion::V3 => TPACKET_V3,
        }
    }
}

impl fmt::Display for TpacketVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TpacketVersion::V1 => f.write_str("TPACKET_V1"),
            TpacketVersion::V2 => f.write_str("TPACKET_V2"),
            TpacketVersion::V3 => f.write_str("TPACKET_V3"),
        }
    }
}

impl FromStr for TpacketVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().trim_start_matches("tpacket_") {
            "v1" | "1" => Ok(TpacketVersion::V1),
            "v2" | "2" => Ok(TpacketVersion::V2),
            "v3" | "3" => Ok(TpacketVersion::V3),
            _ => Err(format!("unknown tpacket version {s:?}")),
        }
    }
}

/// Which ring version(s) `open` may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionPreference {
    /// Try v3, then v2, then v1.
    #[default]
    HighestAvailable,
    Exactly(TpacketVersion),
}

impl VersionPreference {
    /// Versions to try, in order.
    pub fn candidates(self) -> &'static [TpacketVersion] {
        match self {
            VersionPreference::HighestAvailable => {
                &[TpacketVersion::V3, TpacketVersion::V2, TpacketVersion::V1]
            }
            VersionPreference::Exactly(TpacketVersion::V1) => &[TpacketVersion::V1],
            VersionPreference::Exactly(TpacketVersion::V2) => &[TpacketVersion::V2],
            VersionPreference::Exactly(TpacketVersion::V3) => &[TpacketVersion::V3],
        }
    }
}

/// Link-layer framing of what the socket hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketType {
    /// Full frames including the link-layer header.
    #[default]
    Raw,
    /// Link-layer header stripped by the kernel.
    Datagram,
}

impl SocketType {
    pub fn as_raw(self) -> i32 {
        match self {
            SocketType::Raw => libc::SOCK_RAW,
            SocketType::Datagram => libc::SOCK_DGRAM,
        }
    }
}

/// Everything `TPacket::open` needs to know.
#[derive(Debug, Clone)]
pub struct Options {
    /// Interface to bind. Empty means every interface.
    pub interface: String,
    pub version: VersionPreference,
    pub frame_size: usize,
    pub block_size: usize,
    pub num_blocks: usize,
    /// v3 only. Zero lets the kernel pick.
    pub block_timeout: Duration,
    /// `None` blocks until a packet arrives.
    pub poll_timeout: Option<Duration>,
    pub socket_type: SocketType,
    /// Upper bound on returned capture length. Zero means no cap.
    pub snap_len: usize,
    /// Re-insert the 802.1Q tag the kernel strips, on copy-out reads.
    pub add_vlan_header: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interface: String::new(),
            version: VersionPreference::default(),
            frame_size: DEFAULT_FRAME_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            num_blocks: DEFAULT_NUM_BLOCKS,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            poll_timeout: None,
            socket_type: SocketType::default(),
            snap_len: 0,
            add_vlan_header: false,
        }
    }
}

impl Options {
    pub fn interface(mut self, name: impl Into<String>) -> Self {
        self.interface = name.into();
        self
    }

    pub fn version(mut self, version: VersionPreference) -> Self {
        self.version = version;
        self
    }

    pub fn frame_size(mut self, size: usize) -> Self {
        self.frame_size = size;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn num_blocks(mut self, n: usize) -> Self {
        self.num_blocks = n;
        self
    }

    pub fn block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn poll_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn socket_type(mut self, socket_type: SocketType) -> Self {
        self.socket_type = socket_type;
        self
    }

    pub fn snap_len(mut self, snap_len: usize) -> Self {
        self.snap_len = snap_len;
        self
    }

    pub fn add_vlan_header(mut self, enabled: bool) -> Self {
        self.add_vlan_header = enabled;
        self
    }

    /// Reject combinations the kernel would refuse anyway, with a readable
    /// message. `page_size` comes from [`page_size`].
    pub fn check(&self, page_size: usize) -> Result<()> {
        if self.frame_size == 0 || self.block_size == 0 {
            return Err(Error::config("frame size and block size must be non-zero"));
        }
        if page_size == 0 || self.block_size % page_size != 0 {
            return Err(Error::config(format!(
                "block size {} must be divisible by page size {}",
                self.block_size, page_size
            )));
        }
        if self.block_size % self.frame_size != 0 {
            return Err(Error::config(format!(
                "block size {} must be divisible by frame size {}",
                self.block_size, self.frame_size
            )));
        }
        if self.num_blocks < 1 {
            return Err(Error::config(format!(
                "num blocks {} must be >= 1",
                self.num_blocks
            )));
        }
        let geometry = self.geometry();
        let frame_count = geometry.frames_per_block.checked_mul(self.num_blocks);
        let fits = |n: usize| u32::try_from(n).is_ok();
        match frame_count {
            Some(frames)
                if fits(self.block_size)
                    && fits(self.frame_size)
                    && fits(self.num_blocks)
                    && fits(frames) => {}
            _ => {
                return Err(Error::config(format!(
                    "ring of {} blocks of {} bytes does not fit a 32-bit ring request",
                    self.num_blocks, self.block_size
                )))
            }
        }
        if !self.block_timeout.is_zero() && self.block_timeout < Duration::from_millis(1) {
            return Err(Error::config(format!(
                "block timeout {:?} must be >= 1ms",
                self.block_timeout
            )));
        }
        Ok(())
    }

    pub fn geometry(&self) -> RingGeometry {
        RingGeometry {
            frame_size: self.frame_size,
            frames_per_block: self.block_size / self.frame_size.max(1),
            num_blocks: self.num_blocks,
            block_timeout: self.block_timeout,
        }
    }

    /// Poll timeout in the form `poll(2)` takes it.
    pub(crate) fn poll_timeout_ms(&self) -> i32 {
        match self.poll_timeout {
            None => -1,
            Some(t) => t.as_millis().min(i32::MAX as u128) as i32,
        }
    }
}

/// Sizing of the shared mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    pub frame_size: usize,
    pub frames_per_block: usize,
    pub num_blocks: usize,
    pub block_timeout: Duration,
}

impl RingGeometry {
    pub fn block_size(&self) -> usize {
        self.frame_size * self.frames_per_block
    }

    pub fn frame_count(&self) -> usize {
        self.frames_per_block * self.num_blocks
    }

    pub fn mapping_size(&self) -> usize {
        self.frame_size * self.frames_per_block * self.num_blocks
    }

    /// Number of ownership slots the cursor rotates over.
    pub fn slots(&self, version: TpacketVersion) -> usize {
        match version {
            TpacketVersion::V1 | TpacketVersion::V2 => self.frame_count(),
            TpacketVersion::V3 => self.num_blocks,
        }
    }

    /// Byte offset of slot `index` in the mapping.
    pub fn slot_offset(&self, version: TpacketVersion, index: usize) -> usize {
        match version {
            TpacketVersion::V1 | TpacketVersion::V2 => index * self.frame_size,
            TpacketVersion::V3 => index * self.block_size(),
        }
    }

    // Options::check bounds every field below to u32.
    pub(crate) fn request(&self) -> TpacketReq {
        TpacketReq {
            tp_block_size: self.block_size() as u32,
            tp_block_nr: self.num_blocks as u32,
            tp_frame_size: self.frame_size as u32,
            tp_frame_nr: self.frame_count() as u32,
        }
    }

    pub(crate) fn request_v3(&self) -> TpacketReq3 {
        TpacketReq3 {
            tp_block_size: self.block_size() as u32,
            tp_block_nr: self.num_blocks as u32,
            tp_frame_size: self.frame_size as u32,
            tp_frame_nr: self.frame_count() as u32,
            tp_retire_blk_tov: self.block_timeout.as_millis().min(u32::MAX as u128) as u32,
            tp_sizeof_priv: 0,
            tp_feature_req_word: 0,
        }
    }
}

/// The system page size. Resolve it once and hand it to [`Options::check`].
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}
