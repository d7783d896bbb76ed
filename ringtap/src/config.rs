use ringtap::{FanoutType, Options, TpacketVersion, VersionPreference};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Application configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Network interface to capture on. None captures on every interface.
    #[serde(default)]
    pub interface: Option<String>,

    /// API server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,

    /// List of CIDRs allowed to access the API (empty = allow all).
    #[serde(default)]
    pub allowed_ips: Vec<String>,

    /// Ring sizing and read behaviour.
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Classic BPF program in `tcpdump -ddd` format.
    #[serde(default)]
    pub filter_file: Option<String>,

    /// Compiled ringtap-ebpf object to attach as a socket filter.
    #[serde(default)]
    pub ebpf_object: Option<String>,

    /// EtherTypes the eBPF filter lets through.
    #[serde(default)]
    pub ether_types: Vec<u16>,

    #[serde(default)]
    pub fanout: Option<FanoutConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Ring version to insist on. None negotiates the highest available.
    #[serde(default)]
    pub version: Option<TpacketVersion>,

    #[serde(default = "default_frame_size")]
    pub frame_size: usize,

    #[serde(default = "default_block_size")]
    pub block_size: usize,

    #[serde(default = "default_num_blocks")]
    pub num_blocks: usize,

    /// v3 block retire timeout in milliseconds.
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,

    /// How long one read may block before the capture loop rechecks for
    /// shutdown.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Cap on bytes kept per packet (0 = whole frame).
    #[serde(default)]
    pub snap_len: usize,

    #[serde(default)]
    pub add_vlan_header: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FanoutConfig {
    #[serde(rename = "type")]
    pub mode: FanoutType,
    pub group_id: u16,
}

fn default_port() -> u16 {
    3000
}

fn default_frame_size() -> usize {
    ringtap::DEFAULT_FRAME_SIZE
}

fn default_block_size() -> usize {
    ringtap::DEFAULT_BLOCK_SIZE
}

fn default_num_blocks() -> usize {
    ringtap::DEFAULT_NUM_BLOCKS
}

fn default_block_timeout_ms() -> u64 {
    ringtap::DEFAULT_BLOCK_TIMEOUT.as_millis() as u64
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            version: None,
            frame_size: default_frame_size(),
            block_size: default_block_size(),
            num_blocks: default_num_blocks(),
            block_timeout_ms: default_block_timeout_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            snap_len: 0,
            add_vlan_header: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: None,
            port: default_port(),
            quiet: false,
            allowed_ips: Vec::new(),
            capture: CaptureConfig::default(),
            filter_file: None,
            ebpf_object: None,
            ether_types: Vec::new(),
            fanout: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if cli.interface.is_some() {
            self.interface = cli.interface.clone();
        }
        if cli.port != 3000 {
            self.port = cli.port;
        }
        if cli.quiet {
            self.quiet = true;
        }
        if !cli.allowed_ips.is_empty() {
            self.allowed_ips = cli.allowed_ips.clone();
        }
        if cli.tpacket_version.is_some() {
            self.capture.version = cli.tpacket_version;
        }
        if let Some(snap_len) = cli.snap_len {
            self.capture.snap_len = snap_len;
        }
        if cli.add_vlan_header {
            self.capture.add_vlan_header = true;
        }
        if cli.filter_file.is_some() {
            self.filter_file = cli.filter_file.clone();
        }
        if cli.ebpf_object.is_some() {
            self.ebpf_object = cli.ebpf_object.clone();
        }
        if !cli.ether_types.is_empty() {
            self.ether_types = cli.ether_types.clone();
        }
        if let Some(group_id) = cli.fanout_group {
            self.fanout = Some(FanoutConfig {
                mode: cli.fanout_type,
                group_id,
            });
        }
    }

    /// Ring options for the capture socket.
    pub fn capture_options(&self) -> Options {
        let capture = &self.capture;
        Options::default()
            .interface(self.interface.clone().unwrap_or_default())
            .version(match capture.version {
                Some(v) => VersionPreference::Exactly(v),
                None => VersionPreference::HighestAvailable,
            })
            .frame_size(capture.frame_size)
            .block_size(capture.block_size)
            .num_blocks(capture.num_blocks)
            .block_timeout(Duration::from_millis(capture.block_timeout_ms))
            .poll_timeout(Some(Duration::from_millis(capture.poll_timeout_ms)))
            .snap_len(capture.snap_len)
            .add_vlan_header(capture.add_vlan_header)
    }
}

use clap::Parser;

/// ringtap: memory-mapped AF_PACKET traffic monitor
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Network interface to capture on (e.g., eth0). Omit for all interfaces.
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Port to serve the API on.
    #[arg(short, long, default_value_t = 3000)]
    pub port: u16,

    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// IP CIDRs allowed to access the API (e.g., 10.0.0.0/8). Repeat for multiple.
    #[arg(long)]
    pub allowed_ips: Vec<String>,

    /// Ring version to require (v1, v2 or v3). Default: highest available.
    #[arg(long)]
    pub tpacket_version: Option<TpacketVersion>,

    /// Bytes kept per packet (0 = whole frame).
    #[arg(long)]
    pub snap_len: Option<usize>,

    /// Re-insert stripped 802.1Q tags into copied packets.
    #[arg(long)]
    pub add_vlan_header: bool,

    /// Classic BPF filter in `tcpdump -ddd` format.
    #[arg(long)]
    pub filter_file: Option<String>,

    /// Compiled ringtap-ebpf socket filter object.
    #[arg(long)]
    pub ebpf_object: Option<String>,

    /// EtherType the eBPF filter passes (e.g., 2048 for IPv4). Repeat for multiple.
    #[arg(long)]
    pub ether_types: Vec<u16>,

    /// Join this fanout group.
    #[arg(long)]
    pub fanout_group: Option<u16>,

    /// Fanout mode used with --fanout-group.
    #[arg(long, default_value = "hash")]
    pub fanout_type: FanoutType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_with_capture_section() {
        let yaml = r#"
interface: eth1
port: 8080
capture:
  version: v2
  num_blocks: 16
  snap_len: 128
fanout:
  type: load_balance
  group_id: 42
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.interface.as_deref(), Some("eth1"));
        assert_eq!(config.capture.version, Some(TpacketVersion::V2));
        assert_eq!(config.capture.frame_size, ringtap::DEFAULT_FRAME_SIZE);

        let opts = config.capture_options();
        assert_eq!(opts.interface, "eth1");
        assert_eq!(opts.num_blocks, 16);
        assert_eq!(opts.snap_len, 128);
        assert_eq!(opts.version, VersionPreference::Exactly(TpacketVersion::V2));
        assert_eq!(opts.poll_timeout, Some(Duration::from_millis(1000)));

        let fanout = config.fanout.unwrap();
        assert_eq!(fanout.mode, FanoutType::LoadBalance);
        assert_eq!(fanout.group_id, 42);
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut config = Config::default();
        let cli = CliArgs::parse_from([
            "ringtap",
            "-i",
            "lo",
            "--snap-len",
            "96",
            "--fanout-group",
            "7",
            "--fanout-type",
            "cpu",
        ]);
        config.merge_cli(&cli);
        assert_eq!(config.interface.as_deref(), Some("lo"));
        assert_eq!(config.capture.snap_len, 96);
        let fanout = config.fanout.unwrap();
        assert_eq!(fanout.mode, FanoutType::Cpu);
        assert_eq!(fanout.group_id, 7);
    }

    #[test]
    fn test_defaults_capture_everything() {
        let opts = Config::default().capture_options();
        assert_eq!(opts.interface, "");
        assert_eq!(opts.version, VersionPreference::HighestAvailable);
        assert!(opts.check(4096).is_ok());
    }
}
