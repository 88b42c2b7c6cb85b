use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use b2_net_backend::{
    sys, Backend, MacAddr, NatPumpChannels, RawDeviceKind, Transport, TransportKind,
    TransportStats, TransportSelector,
};
use b2_net_pump::{NatPump, PumpStats, RedirectRule, StackError, UserNetStack};

use crate::bridge::{Delivery, InterruptBridge};
use crate::config::EtherConfig;
use crate::dispatch::ProtocolTable;
use crate::error::{DispatchError, InitError, MulticastError, TxError};
use crate::guest::{Alerts, GuestCpu, GuestHandler, GuestPacket, GuestRxLayout, LogAlerts};
use crate::rx::ReceptionLoop;
use crate::stats::{Counters, EtherStats};
use crate::tx;

/// Hardware address in NAT mode (the address the NAT stack's DHCP server expects).
pub const NAT_MAC: MacAddr = MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);

/// Address reported while no device is open, and when a raw device will not report its own.
pub const FALLBACK_MAC: MacAddr = MacAddr([0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc]);

/// State shared between the driver entry points and the reception thread.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub protocols: ProtocolTable,
    pub bridge: InterruptBridge,
    pub cancel: AtomicBool,
    pub counters: Counters,
}

/// Everything the device needs from the embedding emulator.
pub struct EtherHost {
    pub cpu: Arc<dyn GuestCpu>,
    pub layout: GuestRxLayout,
    pub alerts: Arc<dyn Alerts>,
    /// Stack driven by the NAT pump when the `slirp` transport is selected.
    pub nat_stack: Option<Box<dyn UserNetStack>>,
}

impl EtherHost {
    pub fn new(cpu: Arc<dyn GuestCpu>, layout: GuestRxLayout) -> Self {
        Self {
            cpu,
            layout,
            alerts: Arc::new(LogAlerts),
            nat_stack: None,
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn Alerts>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_nat_stack(mut self, stack: Box<dyn UserNetStack>) -> Self {
        self.nat_stack = Some(stack);
        self
    }
}

/// The emulated Ethernet device.
///
/// Owns the host transport, the reception thread and (in NAT mode) the NAT pump. Driver entry
/// points take `&self` and may be called from any thread; [`EtherDevice::shutdown`] tears
/// everything down and also runs on drop.
pub struct EtherDevice {
    shared: Arc<Shared>,
    transport: Option<Arc<Transport>>,
    rx_thread: Option<JoinHandle<()>>,
    pump: Option<NatPump>,
    cpu: Arc<dyn GuestCpu>,
    layout: GuestRxLayout,
    mac: MacAddr,
    kind: TransportKind,
    /// Counters captured at shutdown, once the transport and pump are gone.
    final_stats: Option<(TransportStats, Option<PumpStats>)>,
}

impl EtherDevice {
    /// Open the transport named by `config` and start the device.
    ///
    /// Failures other than "no transport configured" are also reported through the host's
    /// [`Alerts`].
    pub fn open(config: &EtherConfig, host: EtherHost) -> Result<Self, InitError> {
        let alerts = Arc::clone(&host.alerts);
        let res = Self::open_configured(config, host);
        if let Err(err) = &res {
            if !matches!(err, InitError::NoTransport) {
                alerts.warning(&err.to_string());
            }
        }
        res
    }

    fn open_configured(config: &EtherConfig, host: EtherHost) -> Result<Self, InitError> {
        let selector = config.transport().ok_or(InitError::NoTransport)?;
        if selector == TransportSelector::Nat && host.nat_stack.is_none() {
            return Err(InitError::NatStackMissing);
        }

        if let Err(err) = sys::ignore_sigpipe() {
            tracing::warn!("cannot ignore SIGPIPE: {err}");
        }

        let (rules, errors) = config.redirects();
        for err in &errors {
            host.alerts.warning(&err.to_string());
        }

        let (transport, pump_channels) = Transport::open(&selector)?;
        Self::start(transport, pump_channels, &rules, host)
    }

    /// Start the device on a transport the host opened itself.
    pub fn with_transport(transport: Transport, host: EtherHost) -> Result<Self, InitError> {
        Self::start(transport, None, &[], host)
    }

    fn start(
        transport: Transport,
        pump_channels: Option<NatPumpChannels>,
        rules: &[RedirectRule],
        host: EtherHost,
    ) -> Result<Self, InitError> {
        let EtherHost {
            cpu,
            layout,
            alerts,
            nat_stack,
        } = host;

        let pump = match pump_channels {
            Some(channels) => {
                let stack = nat_stack.ok_or(InitError::NatStackMissing)?;
                let mut warn = |err: &StackError| alerts.warning(&err.to_string());
                Some(NatPump::spawn(stack, rules, channels, &mut warn)?)
            }
            None => None,
        };

        let mac = resolve_mac(&transport);
        let kind = transport.kind();
        let transport = Arc::new(transport);
        let shared = Arc::new(Shared::default());

        let rx_thread = ReceptionLoop::new(
            Arc::clone(&shared),
            Arc::clone(&transport),
            Arc::clone(&cpu),
            alerts,
        )
        .spawn()
        .map_err(InitError::Spawn)?;

        tracing::info!(%mac, ?kind, "Ethernet device open");
        Ok(Self {
            shared,
            transport: Some(transport),
            rx_thread: Some(rx_thread),
            pump,
            cpu,
            layout,
            mac,
            kind,
            final_stats: None,
        })
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn hardware_address(&self) -> MacAddr {
        self.mac
    }

    pub fn attach(&self, ether_type: u16, handler: GuestHandler) -> Result<(), DispatchError> {
        self.shared.protocols.attach(ether_type, handler)?;
        tracing::debug!(ether_type, handler = handler.0, "attached protocol handler");
        Ok(())
    }

    pub fn detach(&self, ether_type: u16) -> Result<(), DispatchError> {
        self.shared.protocols.detach(ether_type)?;
        tracing::debug!(ether_type, "detached protocol handler");
        Ok(())
    }

    /// Forget every protocol handler.
    pub fn reset(&self) {
        self.shared.protocols.reset();
    }

    pub fn transmit(&self, packet: &GuestPacket) -> Result<(), TxError> {
        let transport = self.transport.as_deref().ok_or(TxError::Closed)?;
        tx::transmit_packet(transport, &*self.cpu, packet, &self.shared.counters)
    }

    /// Send a frame that is already in host memory.
    pub fn transmit_frame(&self, frame: &[u8]) -> Result<(), TxError> {
        let transport = self.transport.as_deref().ok_or(TxError::Closed)?;
        tx::transmit_frame(transport, frame, &self.shared.counters)
    }

    /// Add `addr` to the host-side multicast filter.
    ///
    /// An ethertap device that refuses the address still reports success; the tap delivers
    /// multicast regardless.
    pub fn add_multicast(&self, addr: MacAddr) -> Result<(), MulticastError> {
        let Some(transport) = self.transport.as_deref() else {
            return Ok(());
        };
        match transport.add_multicast(addr) {
            Ok(()) => Ok(()),
            Err(err) if raw_kind(transport) == Some(RawDeviceKind::Ethertap) => {
                tracing::debug!(%addr, "ethertap refused multicast address: {err}");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(%addr, "couldn't enable multicast address: {err}");
                Err(MulticastError(err))
            }
        }
    }

    pub fn remove_multicast(&self, addr: MacAddr) -> Result<(), MulticastError> {
        let Some(transport) = self.transport.as_deref() else {
            return Ok(());
        };
        transport.remove_multicast(addr).map_err(|err| {
            tracing::warn!(%addr, "couldn't disable multicast address: {err}");
            MulticastError(err)
        })
    }

    /// Deliver the outstanding received frame to the guest and acknowledge the interrupt.
    ///
    /// Called by the emulator, in guest interrupt context, after
    /// [`GuestCpu::raise_interrupt`]. Returns `false` when no interrupt was outstanding.
    pub fn service_interrupt(&self) -> bool {
        let Some(delivery) = self.shared.bridge.take_delivery() else {
            Counters::bump(&self.shared.counters.spurious_interrupts);
            return false;
        };
        Counters::bump(&self.shared.counters.interrupts_serviced);

        match delivery {
            Delivery::Dispatch {
                handler,
                ether_type,
                header,
                frame,
            } => {
                self.cpu
                    .write_guest_memory(self.layout.packet_buffer, frame.as_slice());
                self.cpu.write_guest_memory(self.layout.rha, &header);
                let regs = self.layout.handler_regs(ether_type, frame.len());
                tracing::trace!(
                    ether_type,
                    len = frame.len(),
                    handler = handler.0,
                    "calling protocol handler"
                );
                self.cpu.invoke_guest_handler(handler, &regs);
            }
            Delivery::Tunnel { frame, from } => {
                self.cpu.udp_tunnel_read(frame.as_slice(), from);
            }
        }
        Counters::bump(&self.shared.counters.rx_packets);

        self.shared.bridge.acknowledge();
        true
    }

    pub fn stats(&self) -> EtherStats {
        let (transport, pump) = match (&self.transport, &self.final_stats) {
            (Some(transport), _) => (
                transport.stats(),
                self.pump.as_ref().map(NatPump::stats),
            ),
            (None, Some(last)) => *last,
            (None, None) => (TransportStats::default(), None),
        };
        self.shared.counters.snapshot(transport, pump)
    }

    /// Stop both threads and close the transport. Idempotent.
    pub fn shutdown(&mut self) {
        if self.transport.is_none() {
            return;
        }

        self.shared.cancel.store(true, Ordering::Release);
        self.shared.bridge.close();

        let pump_stats = self.pump.take().map(|mut pump| {
            pump.stop();
            pump.stats()
        });

        if let Some(thread) = self.rx_thread.take() {
            if thread.join().is_err() {
                tracing::error!("Ethernet reception thread panicked");
            }
        }

        if let Some(transport) = self.transport.take() {
            self.final_stats = Some((transport.stats(), pump_stats));
        }
        tracing::info!("Ethernet device closed");
    }
}

impl Drop for EtherDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for EtherDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtherDevice")
            .field("kind", &self.kind)
            .field("mac", &self.mac)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

fn raw_kind(transport: &Transport) -> Option<RawDeviceKind> {
    match transport.backend() {
        Backend::RawDevice(dev) => Some(dev.kind()),
        Backend::UdpTunnel(_) | Backend::NatPipe(_) => None,
    }
}

fn resolve_mac(transport: &Transport) -> MacAddr {
    match transport.hardware_address() {
        None => NAT_MAC,
        Some(Ok(mac)) => mac,
        Some(Err(err)) => {
            tracing::warn!("couldn't read Ethernet address from network device: {err}");
            FALLBACK_MAC
        }
    }
}
