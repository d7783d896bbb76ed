use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use ringtap::{Error, TPacket};

use crate::state::TrafficState;

/// Drain the ring on a dedicated thread until `running` clears or the
/// handle closes.
///
/// Reads block in poll, so this cannot live on the tokio runtime. Copy-out
/// reads are only used when VLAN tags must be put back into the bytes.
pub fn spawn(
    tp: Arc<TPacket>,
    traffic: Arc<TrafficState>,
    running: Arc<AtomicBool>,
    copy_out: bool,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("ringtap-capture".into())
        .spawn(move || run(&tp, &traffic, &running, copy_out))
}

fn run(tp: &TPacket, traffic: &TrafficState, running: &AtomicBool, copy_out: bool) {
    tracing::info!("capture thread started ({})", tp.version());
    while running.load(Ordering::Relaxed) {
        let read = if copy_out {
            tp.read_packet().map(|packet| traffic.update(&packet.info))
        } else {
            tp.zero_copy_read().map(|packet| traffic.update(packet.info()))
        };
        match read {
            Ok(()) => {}
            // Nothing arrived in time: go round and look at `running` again.
            Err(e) if e.is_timeout() => {}
            Err(Error::Closed) => break,
            Err(e) => {
                tracing::error!("capture stopped: {}", e);
                traffic.record_error();
                break;
            }
        }
    }
    tracing::info!("capture thread exiting");
}
