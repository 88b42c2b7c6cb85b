use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use b2_net_backend::{dispatch_key, FrameBuf, FrameSource, Transport};

use crate::bridge::Delivery;
use crate::device::Shared;
use crate::guest::{Alerts, GuestCpu};
use crate::stats::Counters;

/// Bounded readiness wait; also the cancellation latency of the loop.
pub const RX_WAIT: Duration = Duration::from_millis(20);

/// The reception thread: reads one frame at a time and hands it to the guest behind one
/// interrupt, waiting for the acknowledgment before reading the next.
pub(crate) struct ReceptionLoop {
    shared: Arc<Shared>,
    transport: Arc<Transport>,
    cpu: Arc<dyn GuestCpu>,
    alerts: Arc<dyn Alerts>,
    buf: FrameBuf,
}

impl ReceptionLoop {
    pub fn new(
        shared: Arc<Shared>,
        transport: Arc<Transport>,
        cpu: Arc<dyn GuestCpu>,
        alerts: Arc<dyn Alerts>,
    ) -> Self {
        Self {
            shared,
            transport,
            cpu,
            alerts,
            buf: FrameBuf::new(),
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("b2-ether-rx".to_string())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        tracing::debug!("Ethernet reception started");
        while !self.shared.cancel.load(Ordering::Acquire) {
            match self.transport.wait_readable(RX_WAIT) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    let message = format!("network device became unreadable: {err}");
                    tracing::error!("{message}");
                    self.shared.counters.rx_failed.store(true, Ordering::Release);
                    self.alerts.warning(&message);
                    break;
                }
            }

            match self.transport.read_frame(&mut self.buf) {
                Ok(Some(source)) => self.deliver(source),
                Ok(None) => {}
                Err(err) => tracing::trace!("dropping unreadable frame: {err}"),
            }
        }
        tracing::debug!("Ethernet reception stopped");
    }

    fn deliver(&mut self, source: FrameSource) {
        let frame = std::mem::take(&mut self.buf);
        let delivery = match source {
            FrameSource::Tunnel(from) => Delivery::Tunnel { frame, from },
            FrameSource::Device => {
                // Runts never get here; the transport drops them.
                let Some(header) = frame.header() else {
                    return;
                };
                let ether_type = u16::from_be_bytes([header[12], header[13]]);
                match self.shared.protocols.lookup(dispatch_key(ether_type)) {
                    Some(handler) if !handler.is_null() => Delivery::Dispatch {
                        handler,
                        ether_type,
                        header,
                        frame,
                    },
                    _ => {
                        Counters::bump(&self.shared.counters.rx_dropped);
                        tracing::trace!(ether_type, "no protocol handler, dropping frame");
                        return;
                    }
                }
            }
        };

        if self.shared.bridge.raise(delivery).is_err() {
            return;
        }
        Counters::bump(&self.shared.counters.interrupts_raised);
        self.cpu.raise_interrupt();

        if self.shared.bridge.wait_ack().is_err() {
            tracing::debug!("device closed while an interrupt was outstanding");
        }
    }
}
