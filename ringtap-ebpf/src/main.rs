#![no_std]
#![no_main]

use aya_ebpf::{
    macros::{map, socket_filter},
    maps::HashMap,
    programs::SkBuffContext,
};
use network_types::eth::EthHdr;
use ringtap_common::MAX_FILTER_ETHER_TYPES;

#[no_mangle]
#[link_section = "license"]
pub static _license: [u8; 4] = *b"GPL\0";

/// EtherTypes (host byte order) that reach the capture ring. Filled by the
/// agent before the program is attached.
#[map]
static ETHER_TYPES: HashMap<u16, u8> = HashMap::with_max_entries(MAX_FILTER_ETHER_TYPES, 0);

/// Socket filter entry point.
///
/// Returns the number of bytes to keep: the whole frame for an allowed
/// EtherType, zero (drop) for everything else, including frames too short to
/// carry one.
#[socket_filter]
pub fn ringtap(ctx: SkBuffContext) -> i64 {
    // The EtherType is the last field of the Ethernet header. A tag the
    // kernel stripped does not show up here.
    let ether_type = match ctx.load::<u16>(EthHdr::LEN - 2) {
        Ok(raw) => u16::from_be(raw),
        Err(_) => return 0,
    };
    if unsafe { ETHER_TYPES.get(&ether_type) }.is_some() {
        ctx.len() as i64
    } else {
        0
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
