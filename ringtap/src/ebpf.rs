use anyhow::Context as _;
use aya::maps::HashMap;
use aya::programs::SocketFilter;
use aya::Ebpf;
use std::os::fd::AsFd;
use std::path::Path;

use ringtap::TPacket;

/// Load the ringtap-ebpf socket filter from `object`, allow `ether_types`
/// through it, and attach it to the capture socket.
///
/// The returned `Ebpf` owns the map the filter reads; keep it alive for as
/// long as the filter should see updates.
pub fn attach_socket_filter(tp: &TPacket, object: &Path, ether_types: &[u16]) -> anyhow::Result<Ebpf> {
    let mut bpf = Ebpf::load_file(object)
        .with_context(|| format!("failed to load eBPF object {}", object.display()))?;

    let mut allowed: HashMap<_, u16, u8> = HashMap::try_from(
        bpf.map_mut("ETHER_TYPES")
            .context("ETHER_TYPES map missing from eBPF object")?,
    )?;
    for &ether_type in ether_types {
        allowed.insert(ether_type, 1, 0)?;
    }

    let program: &mut SocketFilter = bpf
        .program_mut("ringtap")
        .context("ringtap program missing from eBPF object")?
        .try_into()?;
    program.load()?;
    tp.attach_compiled_filter(program.fd()?.as_fd())?;
    tracing::info!(
        "eBPF socket filter attached ({} ether types allowed)",
        ether_types.len()
    );

    Ok(bpf)
}
