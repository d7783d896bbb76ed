use std::time::SystemTime;

use serde::Serialize;

/// Length of an Ethernet II header, after which a re-inserted 802.1Q tag goes.
const ETH_HLEN: usize = 14;
const ETH_P_8021Q: u16 = 0x8100;

/// An 802.1Q tag the kernel stripped from the frame and reported alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VlanTag {
    pub tci: u16,
}

impl VlanTag {
    /// The 12-bit VLAN identifier.
    pub fn id(&self) -> u16 {
        self.tci & 0x0fff
    }

    pub fn priority(&self) -> u8 {
        (self.tci >> 13) as u8
    }
}

/// Metadata for one captured packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureInfo {
    pub timestamp: SystemTime,
    /// Bytes available to the caller.
    pub capture_length: usize,
    /// Length of the packet on the wire.
    pub length: usize,
    pub interface_index: i32,
    pub vlan: Option<VlanTag>,
}

/// A packet whose bytes were copied out of the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
    pub info: CaptureInfo,
}

/// Copy `data`, putting the stripped 802.1Q tag back after the MAC addresses.
pub(crate) fn with_vlan_header(data: &[u8], tci: u16) -> Vec<u8> {
    if tci == 0 || data.len() < ETH_HLEN {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(data.len() + 4);
    out.extend_from_slice(&data[..ETH_HLEN - 2]);
    out.extend_from_slice(&ETH_P_8021Q.to_be_bytes());
    out.extend_from_slice(&tci.to_be_bytes());
    out.extend_from_slice(&data[ETH_HLEN - 2..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlan_fields() {
        let tag = VlanTag { tci: 0xa064 };
        assert_eq!(tag.id(), 0x064);
        assert_eq!(tag.priority(), 5);
    }

    #[test]
    fn test_vlan_header_reinserted_before_ethertype() {
        let mut frame = vec![0xaa; 12];
        frame.extend_from_slice(&[0x08, 0x00]);
        frame.extend_from_slice(&[1, 2, 3]);

        let tagged = with_vlan_header(&frame, 0x0064);
        assert_eq!(tagged.len(), frame.len() + 4);
        assert_eq!(&tagged[..12], &frame[..12]);
        assert_eq!(&tagged[12..16], &[0x81, 0x00, 0x00, 0x64]);
        assert_eq!(&tagged[16..], &[0x08, 0x00, 1, 2, 3]);
    }

    #[test]
    fn test_zero_tci_or_short_frame_left_alone() {
        let frame = vec![1u8; 20];
        assert_eq!(with_vlan_header(&frame, 0), frame);
        assert_eq!(with_vlan_header(&frame[..10], 7), &frame[..10]);
    }
}
