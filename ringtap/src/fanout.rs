use std::str::FromStr;

use ringtap_common::{
    PACKET_FANOUT_CBPF, PACKET_FANOUT_CPU, PACKET_FANOUT_EBPF, PACKET_FANOUT_FLAG_DEFRAG,
    PACKET_FANOUT_HASH, PACKET_FANOUT_LB, PACKET_FANOUT_QM, PACKET_FANOUT_RND,
    PACKET_FANOUT_ROLLOVER,
};
use serde::Deserialize;

/// How the kernel spreads packets across the sockets of one fanout group.
///
/// Every socket in a group must join with the same type and id. Groups work
/// across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutType {
    /// By flow hash.
    Hash,
    /// By flow hash, reassembling IP fragments first so they hash alike.
    HashWithDefrag,
    /// Round robin.
    LoadBalance,
    /// By the CPU the packet arrived on.
    Cpu,
    /// Fill one socket, spill to the next when its ring is full.
    Rollover,
    Random,
    /// By the NIC receive queue.
    QueueMapping,
    /// A classic BPF program attached to the group picks the socket.
    Cbpf,
    /// An eBPF program attached to the group picks the socket.
    Ebpf,
}

impl FanoutType {
    /// Mode bits as the kernel expects them in the upper half of the
    /// PACKET_FANOUT argument.
    pub fn as_raw(self) -> u16 {
        match self {
            FanoutType::Hash => PACKET_FANOUT_HASH,
            FanoutType::HashWithDefrag => PACKET_FANOUT_HASH | PACKET_FANOUT_FLAG_DEFRAG,
            FanoutType::LoadBalance => PACKET_FANOUT_LB,
            FanoutType::Cpu => PACKET_FANOUT_CPU,
            FanoutType::Rollover => PACKET_FANOUT_ROLLOVER,
            FanoutType::Random => PACKET_FANOUT_RND,
            FanoutType::QueueMapping => PACKET_FANOUT_QM,
            FanoutType::Cbpf => PACKET_FANOUT_CBPF,
            FanoutType::Ebpf => PACKET_FANOUT_EBPF,
        }
    }
}

impl FromStr for FanoutType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "hash" => FanoutType::Hash,
            "hash_with_defrag" => FanoutType::HashWithDefrag,
            "load_balance" | "lb" => FanoutType::LoadBalance,
            "cpu" => FanoutType::Cpu,
            "rollover" => FanoutType::Rollover,
            "random" => FanoutType::Random,
            "queue_mapping" => FanoutType::QueueMapping,
            "cbpf" => FanoutType::Cbpf,
            "ebpf" => FanoutType::Ebpf,
            other => return Err(format!("unknown fanout type {other:?}")),
        })
    }
}

/// `(mode << 16) | group id`.
pub(crate) fn fanout_arg(fanout: FanoutType, group_id: u16) -> u32 {
    (u32::from(fanout.as_raw()) << 16) | u32::from(group_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_id_in_low_half() {
        let arg = fanout_arg(FanoutType::Hash, 7);
        assert_eq!(arg & 0xffff, 7);
        assert_eq!(arg >> 16, 0);
    }

    #[test]
    fn test_mode_in_high_half() {
        assert_eq!(fanout_arg(FanoutType::Cpu, 1), (2 << 16) | 1);
        assert_eq!(fanout_arg(FanoutType::Ebpf, 0xffff), (7 << 16) | 0xffff);
        assert_eq!(fanout_arg(FanoutType::HashWithDefrag, 3) >> 16, 0x8000);
    }

    #[test]
    fn test_deserialize_from_config() {
        let t: FanoutType = serde_yaml::from_str("load_balance").unwrap();
        assert_eq!(t, FanoutType::LoadBalance);
        let t: FanoutType = serde_yaml::from_str("hash_with_defrag").unwrap();
        assert_eq!(t, FanoutType::HashWithDefrag);
    }

    #[test]
    fn test_parse_from_flag() {
        assert_eq!("cpu".parse::<FanoutType>().unwrap(), FanoutType::Cpu);
        assert_eq!("lb".parse::<FanoutType>().unwrap(), FanoutType::LoadBalance);
        assert!("roundrobin".parse::<FanoutType>().is_err());
    }
}
