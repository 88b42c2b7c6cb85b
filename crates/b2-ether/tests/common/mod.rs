#![allow(dead_code)]

use std::net::SocketAddr;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use b2_ether::{
    Alerts, EtherDevice, EtherHost, GuestCpu, GuestHandler, GuestRxLayout, HandlerRegs,
};
use b2_net_backend::{Backend, RawDevice, RawDeviceKind, Transport};

pub const LAYOUT: GuestRxLayout = GuestRxLayout {
    packet_buffer: 0x1000,
    rha: 0x2000,
    read_packet: 0x3000,
};

const MEMORY_SIZE: usize = 0x8000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestEvent {
    Handler {
        handler: GuestHandler,
        regs: HandlerRegs,
        packet: Vec<u8>,
        rha: Vec<u8>,
    },
    Tunnel {
        frame: Vec<u8>,
        from: SocketAddr,
    },
}

/// Guest double: flat memory, a journal of handler calls, and an interrupt line that wakes the
/// test thread.
pub struct TestCpu {
    memory: Mutex<Vec<u8>>,
    events: Mutex<Vec<GuestEvent>>,
    interrupt_line: Mutex<Sender<()>>,
    outstanding: AtomicUsize,
    overlapping: AtomicUsize,
}

impl TestCpu {
    pub fn new() -> (Arc<Self>, Receiver<()>) {
        let (tx, rx) = mpsc::channel();
        let cpu = Arc::new(Self {
            memory: Mutex::new(vec![0; MEMORY_SIZE]),
            events: Mutex::new(Vec::new()),
            interrupt_line: Mutex::new(tx),
            outstanding: AtomicUsize::new(0),
            overlapping: AtomicUsize::new(0),
        });
        (cpu, rx)
    }

    pub fn events(&self) -> Vec<GuestEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn memory(&self, addr: u32, len: usize) -> Vec<u8> {
        let mem = self.memory.lock().unwrap();
        mem[addr as usize..addr as usize + len].to_vec()
    }

    pub fn poke(&self, addr: u32, data: &[u8]) {
        self.write_guest_memory(addr, data);
    }

    /// Interrupts raised while another was still outstanding.
    pub fn overlapping_interrupts(&self) -> usize {
        self.overlapping.load(Ordering::SeqCst)
    }

    fn finish_interrupt(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

impl GuestCpu for TestCpu {
    fn raise_interrupt(&self) {
        if self.outstanding.fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlapping.fetch_add(1, Ordering::SeqCst);
        }
        let _ = self.interrupt_line.lock().unwrap().send(());
    }

    fn read_guest_memory(&self, addr: u32, buf: &mut [u8]) {
        let mem = self.memory.lock().unwrap();
        let start = addr as usize;
        buf.copy_from_slice(&mem[start..start + buf.len()]);
    }

    fn write_guest_memory(&self, addr: u32, data: &[u8]) {
        let mut mem = self.memory.lock().unwrap();
        let start = addr as usize;
        mem[start..start + data.len()].copy_from_slice(data);
    }

    fn invoke_guest_handler(&self, handler: GuestHandler, regs: &HandlerRegs) {
        let packet_len = regs.d1 as usize + 14;
        let event = GuestEvent::Handler {
            handler,
            regs: *regs,
            packet: self.memory(LAYOUT.packet_buffer, packet_len),
            rha: self.memory(LAYOUT.rha, 14),
        };
        self.events.lock().unwrap().push(event);
        self.finish_interrupt();
    }

    fn udp_tunnel_read(&self, frame: &[u8], from: SocketAddr) {
        self.events.lock().unwrap().push(GuestEvent::Tunnel {
            frame: frame.to_vec(),
            from,
        });
        self.finish_interrupt();
    }
}

#[derive(Default)]
pub struct RecordingAlerts(Mutex<Vec<String>>);

impl RecordingAlerts {
    pub fn messages(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl Alerts for RecordingAlerts {
    fn warning(&self, message: &str) {
        self.0.lock().unwrap().push(message.to_string());
    }
}

pub fn host(cpu: &Arc<TestCpu>) -> EtherHost {
    EtherHost::new(Arc::clone(cpu) as Arc<dyn GuestCpu>, LAYOUT)
}

pub fn raw_transport(kind: RawDeviceKind) -> (Transport, UnixDatagram) {
    let (dev, host_end) = UnixDatagram::pair().unwrap();
    let dev = RawDevice::from_fd(OwnedFd::from(dev), kind).unwrap();
    (Transport::new(Backend::RawDevice(dev)), host_end)
}

/// Device on a socket-pair "raw device"; the returned socket is the host network side.
pub fn raw_device(cpu: &Arc<TestCpu>) -> (EtherDevice, UnixDatagram) {
    let (transport, host_end) = raw_transport(RawDeviceKind::SheepNet);
    let device = EtherDevice::with_transport(transport, host(cpu)).unwrap();
    (device, host_end)
}

/// Read and write ends of a fresh pipe.
pub fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as libc::c_int; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

pub fn open_fd_count() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

pub fn frame(ether_type: u16, len: usize, fill: u8) -> Vec<u8> {
    let mut frame = vec![fill; len];
    frame[..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 1]);
    frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 2]);
    frame[12..14].copy_from_slice(&ether_type.to_be_bytes());
    frame
}

pub fn expect_interrupt(line: &Receiver<()>) {
    line.recv_timeout(Duration::from_secs(2))
        .expect("no interrupt raised");
}

pub fn expect_no_interrupt(line: &Receiver<()>) {
    match line.recv_timeout(Duration::from_millis(100)) {
        Err(RecvTimeoutError::Timeout) => {}
        Ok(()) => panic!("unexpected interrupt"),
        Err(RecvTimeoutError::Disconnected) => panic!("interrupt line dropped"),
    }
}
