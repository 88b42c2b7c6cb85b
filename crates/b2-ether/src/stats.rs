use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use b2_net_backend::TransportStats;
use b2_net_pump::PumpStats;

/// Snapshot of device counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EtherStats {
    pub tx_packets: u64,
    /// Transmits the host transport refused.
    pub tx_buffer_full: u64,
    pub tx_too_long: u64,
    /// Frames handed to the guest.
    pub rx_packets: u64,
    /// Frames with no handler (or a null handler) for their type.
    pub rx_dropped: u64,
    pub interrupts_raised: u64,
    pub interrupts_serviced: u64,
    /// Service calls with nothing outstanding.
    pub spurious_interrupts: u64,
    /// The reception thread stopped because the transport could no longer be polled.
    pub rx_failed: bool,
    pub transport: TransportStats,
    /// Present in NAT mode.
    pub pump: Option<PumpStats>,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub tx_packets: AtomicU64,
    pub tx_buffer_full: AtomicU64,
    pub tx_too_long: AtomicU64,
    pub rx_packets: AtomicU64,
    pub rx_dropped: AtomicU64,
    pub interrupts_raised: AtomicU64,
    pub interrupts_serviced: AtomicU64,
    pub spurious_interrupts: AtomicU64,
    pub rx_failed: AtomicBool,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, transport: TransportStats, pump: Option<PumpStats>) -> EtherStats {
        EtherStats {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_buffer_full: self.tx_buffer_full.load(Ordering::Relaxed),
            tx_too_long: self.tx_too_long.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            interrupts_raised: self.interrupts_raised.load(Ordering::Relaxed),
            interrupts_serviced: self.interrupts_serviced.load(Ordering::Relaxed),
            spurious_interrupts: self.spurious_interrupts.load(Ordering::Relaxed),
            rx_failed: self.rx_failed.load(Ordering::Acquire),
            transport,
            pump,
        }
    }
}
