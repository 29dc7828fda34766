//! SocketCAN reader feeding the in-process hub.
//!
//! The interface must be configured by the system first:
//! `ip link set can0 up type can bitrate 500000`

use busbridge_adapter_can::CanHub;
use busbridge_core::mapping::MAX_CAN_ID;
use busbridge_core::{Backoff, CanFrame};
use socketcan::{CanAnyFrame, CanFdSocket, EmbeddedFrame, Frame, Socket};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Blocking read timeout, bounds how long cancellation goes unnoticed.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Read `interface` on a blocking thread until `cancel` fires.
///
/// The socket is reopened with backoff whenever it fails; the hub is marked
/// down meanwhile.
pub fn spawn_reader(
    interface: String,
    hub: Arc<CanHub>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut backoff = Backoff::default();

        while !cancel.is_cancelled() {
            let socket = match CanFdSocket::open(&interface) {
                Ok(socket) => socket,
                Err(e) => {
                    hub.set_up(false);
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        interface = %interface,
                        error = %e,
                        delay_ms = delay.as_millis(),
                        "Cannot open CAN interface"
                    );
                    sleep_unless_cancelled(delay, &cancel);
                    continue;
                }
            };
            if let Err(e) = socket.set_read_timeout(READ_TIMEOUT) {
                tracing::warn!(interface = %interface, error = %e, "Cannot set CAN read timeout");
            }

            tracing::info!(interface = %interface, "CAN interface open");
            hub.set_up(true);
            backoff.reset();

            while !cancel.is_cancelled() {
                match socket.read_frame() {
                    Ok(frame) => {
                        if let Some(frame) = convert_frame(frame) {
                            hub.publish(frame);
                        }
                    }
                    Err(ref e)
                        if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                    Err(e) => {
                        tracing::warn!(
                            interface = %interface,
                            error = %e,
                            "CAN read failed, reopening"
                        );
                        break;
                    }
                }
            }
            hub.set_up(false);
        }

        tracing::debug!(interface = %interface, "CAN reader stopped");
    })
}

/// Classic and FD data frames; remote and error frames are skipped.
fn convert_frame(frame: CanAnyFrame) -> Option<CanFrame> {
    match frame {
        CanAnyFrame::Normal(f) => Some(CanFrame::new(
            f.raw_id() & MAX_CAN_ID,
            f.is_extended(),
            f.data().to_vec(),
        )),
        CanAnyFrame::Fd(f) => Some(CanFrame::new(
            f.raw_id() & MAX_CAN_ID,
            f.is_extended(),
            f.data().to_vec(),
        )),
        CanAnyFrame::Remote(_) | CanAnyFrame::Error(_) => None,
    }
}

fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) {
    let mut left = delay;
    while !left.is_zero() && !cancel.is_cancelled() {
        let step = left.min(READ_TIMEOUT);
        std::thread::sleep(step);
        left -= step;
    }
}
