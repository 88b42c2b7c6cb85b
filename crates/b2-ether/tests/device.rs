mod common;

use std::net::{Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use b2_ether::{
    status, EtherConfig, EtherDevice, EtherDriver, GuestHandler, GuestPacket, GuestSegment,
    HandlerRegs, InitError, LoopbackStack, MacAddr, TransportKind, TxError, FALLBACK_MAC,
    NAT_MAC,
};
use b2_net_backend::{Backend, RawDevice, RawDeviceKind, Transport, UdpTunnel};
use b2_net_pump::{FrameSink, PollSet, RedirectRule, StackError, UserNetStack};
use common::*;

const IP_HANDLER: GuestHandler = GuestHandler(0x0040_0000);

#[test]
fn frame_reaches_attached_handler() {
    let (cpu, line) = TestCpu::new();
    let (device, host_end) = raw_device(&cpu);
    device.attach(0x0800, IP_HANDLER).unwrap();

    let sent = frame(0x0800, 60, 0x45);
    host_end.send(&sent).unwrap();
    expect_interrupt(&line);
    assert!(device.service_interrupt());

    assert_eq!(
        cpu.events(),
        vec![GuestEvent::Handler {
            handler: IP_HANDLER,
            regs: HandlerRegs {
                d0: 0x0800,
                d1: 46,
                a0: LAYOUT.packet_buffer + 14,
                a3: LAYOUT.rha + 14,
                a4: LAYOUT.read_packet,
            },
            packet: sent.clone(),
            rha: sent[..14].to_vec(),
        }]
    );

    let stats = device.stats();
    assert_eq!(stats.rx_packets, 1);
    assert_eq!(stats.interrupts_raised, 1);
    assert_eq!(stats.interrupts_serviced, 1);
}

#[test]
fn length_field_boundary_selects_catch_all() {
    let (cpu, line) = TestCpu::new();
    let (device, host_end) = raw_device(&cpu);
    device.attach(0, GuestHandler(0x100)).unwrap();

    host_end.send(&frame(1500, 64, 0)).unwrap();
    expect_interrupt(&line);
    device.service_interrupt();

    // 1501 is a real EtherType with no handler of its own.
    host_end.send(&frame(1501, 64, 0)).unwrap();
    expect_no_interrupt(&line);
    assert_eq!(device.stats().rx_dropped, 1);

    device.attach(1501, GuestHandler(0x200)).unwrap();
    host_end.send(&frame(1501, 64, 0)).unwrap();
    expect_interrupt(&line);
    device.service_interrupt();

    let handlers: Vec<(GuestHandler, u32)> = cpu
        .events()
        .into_iter()
        .map(|event| match event {
            GuestEvent::Handler { handler, regs, .. } => (handler, regs.d0),
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(
        handlers,
        vec![(GuestHandler(0x100), 1500), (GuestHandler(0x200), 1501)]
    );
}

#[test]
fn short_frames_never_interrupt() {
    let (cpu, line) = TestCpu::new();
    let (device, host_end) = raw_device(&cpu);
    device.attach(0, GuestHandler(0x100)).unwrap();

    host_end.send(&[]).unwrap();
    host_end.send(&[0u8; 13]).unwrap();
    expect_no_interrupt(&line);

    let stats = device.stats();
    assert_eq!(stats.transport.rx_runts, 2);
    assert_eq!(stats.interrupts_raised, 0);
    assert!(cpu.events().is_empty());
}

#[test]
fn null_handler_drops_frames() {
    let (cpu, line) = TestCpu::new();
    let (device, host_end) = raw_device(&cpu);
    device.attach(0x0806, GuestHandler::NULL).unwrap();

    host_end.send(&frame(0x0806, 42, 0)).unwrap();
    expect_no_interrupt(&line);
    assert_eq!(device.stats().rx_dropped, 1);
}

#[test]
fn one_interrupt_outstanding_at_a_time() {
    let (cpu, line) = TestCpu::new();
    let (device, host_end) = raw_device(&cpu);
    device.attach(0x0800, IP_HANDLER).unwrap();

    for i in 0..4u8 {
        host_end.send(&frame(0x0800, 64, i)).unwrap();
    }

    for _ in 0..4 {
        expect_interrupt(&line);
        // The guest is slow to service; the device must not raise another meanwhile.
        thread::sleep(Duration::from_millis(40));
        expect_no_interrupt_within(&line, Duration::ZERO);
        assert!(device.service_interrupt());
    }

    assert_eq!(cpu.overlapping_interrupts(), 0);
    let fills: Vec<u8> = cpu
        .events()
        .into_iter()
        .map(|event| match event {
            GuestEvent::Handler { packet, .. } => packet[20],
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(fills, vec![0, 1, 2, 3]);
}

fn expect_no_interrupt_within(line: &std::sync::mpsc::Receiver<()>, wait: Duration) {
    assert!(line.recv_timeout(wait).is_err(), "second interrupt raised");
}

#[test]
fn spurious_service_is_counted_and_harmless() {
    let (cpu, line) = TestCpu::new();
    let (device, host_end) = raw_device(&cpu);
    device.attach(0x0800, IP_HANDLER).unwrap();

    assert!(!device.service_interrupt());
    assert_eq!(device.stats().spurious_interrupts, 1);

    host_end.send(&frame(0x0800, 64, 7)).unwrap();
    expect_interrupt(&line);
    assert!(device.service_interrupt());
    assert!(!device.service_interrupt());
    assert_eq!(cpu.events().len(), 1);
}

#[test]
fn shutdown_releases_a_blocked_reception_thread() {
    let (cpu, line) = TestCpu::new();
    let (mut device, host_end) = raw_device(&cpu);
    device.attach(0x0800, IP_HANDLER).unwrap();

    host_end.send(&frame(0x0800, 64, 1)).unwrap();
    expect_interrupt(&line);

    // Never acknowledged.
    let started = Instant::now();
    device.shutdown();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!device.is_open());

    device.shutdown();
    assert!(matches!(
        device.transmit_frame(&frame(0x0800, 60, 0)),
        Err(TxError::Closed)
    ));
    assert_eq!(device.stats().transport.rx_frames, 1);
}

#[test]
fn transmit_gathers_guest_packets() {
    let (cpu, _line) = TestCpu::new();
    let (device, host_end) = raw_device(&cpu);

    let sent = frame(0x0800, 100, 0x11);
    cpu.poke(0x4000, &sent[..14]);
    cpu.poke(0x5000, &sent[14..]);
    let mut wds = Vec::new();
    wds.extend_from_slice(&14u16.to_be_bytes());
    wds.extend_from_slice(&0x4000u32.to_be_bytes());
    wds.extend_from_slice(&86u16.to_be_bytes());
    wds.extend_from_slice(&0x5000u32.to_be_bytes());
    wds.extend_from_slice(&[0, 0]);
    cpu.poke(0x6000, &wds);

    device.transmit(&GuestPacket::Wds(0x6000)).unwrap();
    device
        .transmit(&GuestPacket::Segments(vec![
            GuestSegment {
                addr: 0x4000,
                len: 14,
            },
            GuestSegment {
                addr: 0x5000,
                len: 86,
            },
        ]))
        .unwrap();

    let mut out = [0u8; 2048];
    for _ in 0..2 {
        let n = host_end.recv(&mut out).unwrap();
        assert_eq!(&out[..n], &sent[..]);
    }

    let err = device
        .transmit(&GuestPacket::Linear {
            addr: 0x1000,
            len: 1517,
        })
        .unwrap_err();
    assert!(matches!(err, TxError::TooLong { len: 1517, .. }));

    let stats = device.stats();
    assert_eq!(stats.tx_packets, 2);
    assert_eq!(stats.tx_too_long, 1);
}

#[test]
fn raw_device_without_address_uses_fallback() {
    let (cpu, _line) = TestCpu::new();
    let (device, _host_end) = raw_device(&cpu);
    assert_eq!(device.kind(), TransportKind::RawDevice);
    // A socket pair does not answer the driver's address query.
    assert_eq!(device.hardware_address(), FALLBACK_MAC);
}

#[test]
fn multicast_failures_depend_on_device_kind() {
    let group = MacAddr([0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]);
    let (cpu, _line) = TestCpu::new();

    // Socket pairs reject the multicast ioctls, standing in for a driver that refuses.
    let (transport, _host_end) = raw_transport(RawDeviceKind::SheepNet);
    let sheep_net = EtherDevice::with_transport(transport, host(&cpu)).unwrap();
    assert_eq!(
        b2_ether::status_of(&sheep_net.add_multicast(group)),
        status::E_MULTI_ERR
    );

    let (transport, _host_end) = raw_transport(RawDeviceKind::Ethertap);
    let ethertap = EtherDevice::with_transport(transport, host(&cpu)).unwrap();
    assert!(ethertap.add_multicast(group).is_ok());
    assert!(ethertap.remove_multicast(group).is_err());
}

#[test]
fn nat_round_trip_is_bit_identical() {
    let (cpu, line) = TestCpu::new();
    let config = EtherConfig {
        ether: Some("slirp".to_string()),
        redir: vec!["tcp:18080::80".to_string()],
        ..EtherConfig::default()
    };
    let mut device = EtherDevice::open(
        &config,
        host(&cpu).with_nat_stack(Box::new(LoopbackStack::new())),
    )
    .unwrap();
    assert_eq!(device.kind(), TransportKind::Nat);
    assert_eq!(device.hardware_address(), NAT_MAC);

    device.attach(0x0800, IP_HANDLER).unwrap();
    let lengths = [60, 1514, 1515, 1516];
    for (n, len) in lengths.into_iter().enumerate() {
        let sent: Vec<u8> = frame(0x0800, len, 0)
            .into_iter()
            .enumerate()
            .map(|(i, b)| if i < 14 { b } else { i as u8 })
            .collect();
        device.transmit_frame(&sent).unwrap();

        expect_interrupt(&line);
        device.service_interrupt();
        let events = cpu.events();
        assert_eq!(events.len(), n + 1);
        match events.last() {
            Some(GuestEvent::Handler { packet, rha, regs, .. }) => {
                assert_eq!(packet, &sent, "{len} byte frame changed in transit");
                assert_eq!(rha, &sent[..14]);
                assert_eq!(regs.d1 as usize, len - 14);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    let stats = device.stats();
    let pump = stats.pump.expect("NAT mode reports pump stats");
    assert_eq!(pump.frames_in, lengths.len() as u64);
    assert_eq!(pump.frames_out, lengths.len() as u64);
    assert!(!stats.rx_failed);

    device.shutdown();
    assert!(!device.is_open());
}

/// Stack whose initialization always fails.
struct FailingStack;

impl UserNetStack for FailingStack {
    fn init(&mut self) -> Result<(), StackError> {
        Err(StackError::Init("no user-mode network available".to_string()))
    }

    fn add_redirect(&mut self, _rule: &RedirectRule) -> Result<(), StackError> {
        Ok(())
    }

    fn input(&mut self, _frame: &[u8], _out: &mut dyn FrameSink) {}

    fn fill_poll_set(&mut self, _set: &mut PollSet) -> Duration {
        Duration::from_millis(10)
    }

    fn poll_complete(&mut self, _set: &PollSet, _out: &mut dyn FrameSink) {}
}

#[test]
fn failed_stack_init_releases_nat_channels() {
    const ATTEMPTS: usize = 256;

    let (cpu, _line) = TestCpu::new();
    let alerts = Arc::new(RecordingAlerts::default());
    let config = EtherConfig {
        ether: Some("slirp".to_string()),
        ..EtherConfig::default()
    };

    let before = open_fd_count();
    for _ in 0..ATTEMPTS {
        let err = EtherDevice::open(
            &config,
            host(&cpu)
                .with_alerts(alerts.clone())
                .with_nat_stack(Box::new(FailingStack)),
        )
        .unwrap_err();
        assert!(matches!(err, InitError::Pump(_)), "{err}");
    }
    let after = open_fd_count();

    // Each open creates four channel descriptors; other tests run concurrently, so allow slack.
    assert!(
        after < before + 64,
        "descriptors grew from {before} to {after} over {ATTEMPTS} failed opens"
    );

    let messages = alerts.messages();
    assert_eq!(messages.len(), ATTEMPTS);
    assert!(messages[0].contains("no user-mode network"), "{}", messages[0]);
}

#[test]
fn unpollable_transport_alerts_and_stops_reception() {
    let (cpu, line) = TestCpu::new();
    let alerts = Arc::new(RecordingAlerts::default());
    let (read_end, write_end) = pipe();
    drop(write_end);

    let dev = RawDevice::from_fd(read_end, RawDeviceKind::SheepNet).unwrap();
    let mut device = EtherDevice::with_transport(
        Transport::new(Backend::RawDevice(dev)),
        host(&cpu).with_alerts(alerts.clone()),
    )
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while alerts.messages().is_empty() {
        assert!(Instant::now() < deadline, "reception failure never reported");
        thread::sleep(Duration::from_millis(5));
    }
    let messages = alerts.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("unreadable"), "{}", messages[0]);
    assert!(device.stats().rx_failed);
    expect_no_interrupt(&line);

    device.shutdown();
    assert!(!device.is_open());
}

#[test]
fn nat_without_stack_fails_and_alerts() {
    let (cpu, _line) = TestCpu::new();
    let alerts = Arc::new(RecordingAlerts::default());
    let config = EtherConfig {
        ether: Some("slirp".to_string()),
        ..EtherConfig::default()
    };
    let err = EtherDevice::open(&config, host(&cpu).with_alerts(alerts.clone())).unwrap_err();
    assert!(matches!(err, InitError::NatStackMissing));
    assert_eq!(alerts.messages().len(), 1);
}

#[test]
fn bad_redirect_is_reported_and_skipped() {
    let (cpu, _line) = TestCpu::new();
    let alerts = Arc::new(RecordingAlerts::default());
    let config = EtherConfig {
        ether: Some("slirp".to_string()),
        redir: vec!["udp:1:2.3.4.5:99999".to_string(), "tcp:8080::80".to_string()],
        ..EtherConfig::default()
    };
    let device = EtherDevice::open(
        &config,
        host(&cpu)
            .with_alerts(alerts.clone())
            .with_nat_stack(Box::new(LoopbackStack::new())),
    )
    .unwrap();
    assert!(device.is_open());
    let messages = alerts.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("99999"), "{}", messages[0]);
}

#[test]
fn udp_tunnel_frames_bypass_the_protocol_table() {
    let (cpu, line) = TestCpu::new();
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = socket.local_addr().unwrap().port();
    let tunnel = UdpTunnel::from_socket(socket, Ipv4Addr::LOCALHOST).unwrap();
    let device =
        EtherDevice::with_transport(Transport::new(Backend::UdpTunnel(tunnel)), host(&cpu))
            .unwrap();
    assert_eq!(
        device.hardware_address(),
        MacAddr([b'B', b'2', 127, 0, 0, 1])
    );

    let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let sent = frame(0x0800, 80, 0x99);
    peer.send_to(&[0u8; 10], (Ipv4Addr::LOCALHOST, port)).unwrap();
    peer.send_to(&sent, (Ipv4Addr::LOCALHOST, port)).unwrap();

    expect_interrupt(&line);
    device.service_interrupt();
    assert_eq!(
        cpu.events(),
        vec![GuestEvent::Tunnel {
            frame: sent,
            from: peer.local_addr().unwrap(),
        }]
    );
    assert_eq!(device.stats().transport.rx_runts, 1);
}

#[test]
fn closed_driver_is_inert() {
    let (cpu, _line) = TestCpu::new();
    let config = EtherConfig {
        ether: Some("slirp".to_string()),
        nonet: true,
        ..EtherConfig::default()
    };
    let mut driver = EtherDriver::init(&config, host(&cpu));
    assert!(!driver.is_open());
    assert_eq!(driver.hardware_address(), FALLBACK_MAC);
    assert_eq!(
        driver.transmit(&GuestPacket::Linear {
            addr: 0,
            len: 60
        }),
        status::NO_ERR
    );
    assert_eq!(driver.add_multicast(MacAddr::BROADCAST), status::NO_ERR);
    assert_eq!(driver.remove_multicast(MacAddr::BROADCAST), status::NO_ERR);
    driver.service_interrupt();
    assert!(driver.stats().is_none());
    driver.exit();

    let unconfigured = EtherDriver::init(&EtherConfig::default(), host(&cpu));
    assert!(!unconfigured.is_open());
}

#[test]
fn driver_reports_guest_status_codes() {
    let (cpu, _line) = TestCpu::new();
    let (device, _host_end) = raw_device(&cpu);
    let mut driver = EtherDriver::from_device(device);

    assert_eq!(driver.attach(0x0800, IP_HANDLER), status::NO_ERR);
    assert_eq!(driver.attach(0x0800, IP_HANDLER), status::LAP_PROT_ERR);
    assert_eq!(driver.detach(0x0800), status::NO_ERR);
    assert_eq!(driver.detach(0x0800), status::LAP_PROT_ERR);
    assert_eq!(
        driver.transmit(&GuestPacket::Linear {
            addr: 0,
            len: 2000
        }),
        status::E_LEN_ERR
    );

    driver.attach(0x0806, GuestHandler(1));
    driver.reset();
    assert_eq!(driver.detach(0x0806), status::LAP_PROT_ERR);

    driver.exit();
    assert!(!driver.is_open());
    driver.exit();
}

#[test]
fn broken_transmit_maps_to_excess_collisions() {
    let (cpu, _line) = TestCpu::new();
    let (device, host_end) = raw_device(&cpu);
    drop(host_end);
    let driver = EtherDriver::from_device(device);
    assert_eq!(
        driver.transmit(&GuestPacket::Linear { addr: 0, len: 60 }),
        status::EXCESS_COLLSNS
    );
    let stats = driver.stats().unwrap();
    assert_eq!(stats.tx_buffer_full, 1);
}
