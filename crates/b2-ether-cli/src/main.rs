#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use b2_ether::{
    status, EtherConfig, EtherDriver, EtherHost, GuestCpu, GuestHandler, GuestPacket,
    GuestRxLayout, HandlerRegs, LoopbackStack,
};
use clap::Parser;

/// IEEE local experimental EtherType, used for the `--probe` frame.
const PROBE_ETHER_TYPE: u16 = 0x88b5;

const GUEST_MEMORY_SIZE: usize = 0x10000;
const PROBE_ADDR: u32 = 0x8000;
const LAYOUT: GuestRxLayout = GuestRxLayout {
    packet_buffer: 0x1000,
    rha: 0x2000,
    read_packet: 0x3000,
};

#[derive(Debug, Parser)]
#[command(about = "Open the emulated Ethernet device against a logging guest")]
struct Args {
    /// JSON network preferences; flags below override its fields.
    #[arg(long, env = "B2_ETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Transport selector: `slirp`, `udp`, `tapN`, or a sheep_net device name.
    #[arg(long, env = "B2_ETHER_DEVICE")]
    ether: Option<String>,

    /// NAT forwarding rule `<proto>:<host_port>:<guest_address>:<guest_port>` (repeatable).
    #[arg(long)]
    redir: Vec<String>,

    /// Tunnel Ethernet over UDP.
    #[arg(long)]
    udp_tunnel: bool,

    #[arg(long)]
    udp_port: Option<u16>,

    #[arg(long)]
    nonet: bool,

    /// EtherTypes to attach a handler for (decimal or 0x-prefixed). Values up to 1500 all share
    /// the catch-all handler.
    #[arg(
        long = "attach",
        value_parser = parse_ether_type,
        default_values_t = [0x0800u16, 0x0806, 0x86dd, PROBE_ETHER_TYPE, 0]
    )]
    attach: Vec<u16>,

    /// Transmit one broadcast probe frame after opening.
    #[arg(long)]
    probe: bool,

    /// Stop after this many milliseconds; runs until killed otherwise.
    #[arg(long)]
    duration_ms: Option<u64>,

    /// `tracing` filter directive.
    #[arg(long, env = "B2_ETHER_LOG", default_value = "info")]
    log_level: String,
}

fn parse_ether_type(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|err| format!("invalid EtherType {s:?}: {err}"))
}

impl Args {
    fn ether_config(&self) -> Result<EtherConfig> {
        let mut config = match &self.config {
            Some(path) => EtherConfig::load(path)?,
            None => EtherConfig::default(),
        };
        if let Some(ether) = &self.ether {
            config.ether = Some(ether.clone());
        }
        if !self.redir.is_empty() {
            config.redir = self.redir.clone();
        }
        if let Some(port) = self.udp_port {
            config.udpport = port;
        }
        config.udptunnel |= self.udp_tunnel;
        config.nonet |= self.nonet;
        Ok(config)
    }
}

/// Guest double that logs every delivery. Interrupts are forwarded to the main loop, which
/// services them.
struct LoggingCpu {
    memory: Mutex<Vec<u8>>,
    interrupt_line: Mutex<Sender<()>>,
}

impl LoggingCpu {
    fn new() -> (Arc<Self>, Receiver<()>) {
        let (tx, rx) = mpsc::channel();
        let cpu = Arc::new(Self {
            memory: Mutex::new(vec![0; GUEST_MEMORY_SIZE]),
            interrupt_line: Mutex::new(tx),
        });
        (cpu, rx)
    }
}

impl GuestCpu for LoggingCpu {
    fn raise_interrupt(&self) {
        let line = self.interrupt_line.lock().unwrap_or_else(|p| p.into_inner());
        let _ = line.send(());
    }

    fn read_guest_memory(&self, addr: u32, buf: &mut [u8]) {
        let mem = self.memory.lock().unwrap_or_else(|p| p.into_inner());
        let start = addr as usize;
        match mem.get(start..start + buf.len()) {
            Some(src) => buf.copy_from_slice(src),
            None => buf.fill(0),
        }
    }

    fn write_guest_memory(&self, addr: u32, data: &[u8]) {
        let mut mem = self.memory.lock().unwrap_or_else(|p| p.into_inner());
        let start = addr as usize;
        if let Some(dst) = mem.get_mut(start..start + data.len()) {
            dst.copy_from_slice(data);
        }
    }

    fn invoke_guest_handler(&self, handler: GuestHandler, regs: &HandlerRegs) {
        let mut header = [0u8; 14];
        self.read_guest_memory(LAYOUT.rha, &mut header);
        tracing::info!(
            handler = %format_args!("{:#x}", handler.0),
            ether_type = %format_args!("{:#06x}", regs.d0),
            len = regs.d1 + 14,
            dst = %mac_display(&header[..6]),
            src = %mac_display(&header[6..12]),
            "frame delivered"
        );
    }

    fn udp_tunnel_read(&self, frame: &[u8], from: SocketAddr) {
        tracing::info!(len = frame.len(), %from, "tunnel frame delivered");
    }
}

fn mac_display(octets: &[u8]) -> String {
    octets
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn send_probe(driver: &EtherDriver, cpu: &LoggingCpu) {
    let mac = driver.hardware_address();
    let mut frame = vec![0u8; 60];
    frame[..6].fill(0xff);
    frame[6..12].copy_from_slice(&mac.0);
    frame[12..14].copy_from_slice(&PROBE_ETHER_TYPE.to_be_bytes());
    frame[14..].copy_from_slice(&[0x42; 46]);
    cpu.write_guest_memory(PROBE_ADDR, &frame);

    let code = driver.transmit(&GuestPacket::Linear {
        addr: PROBE_ADDR,
        len: frame.len(),
    });
    if code == status::NO_ERR {
        tracing::info!(len = frame.len(), "probe sent");
    } else {
        tracing::warn!(code, "probe transmit failed");
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_new(&args.log_level)
        .with_context(|| format!("invalid --log-level {:?}", args.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.ether_config().context("failed to load network config")?;
    let (cpu, interrupts) = LoggingCpu::new();
    let host = EtherHost::new(Arc::clone(&cpu) as Arc<dyn GuestCpu>, LAYOUT)
        .with_nat_stack(Box::new(LoopbackStack::new()));

    let mut driver = EtherDriver::init(&config, host);
    if !driver.is_open() {
        tracing::info!("Ethernet device not open; nothing to do");
        return Ok(());
    }

    for &ether_type in &args.attach {
        // The handler address is only echoed back in logs.
        let code = driver.attach(ether_type, GuestHandler(u32::from(ether_type) | 0x10000));
        if code != status::NO_ERR {
            tracing::warn!(ether_type, code, "attach failed");
        }
    }

    if args.probe {
        send_probe(&driver, &cpu);
    }

    let deadline = args
        .duration_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));
    loop {
        let wait = match deadline {
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(left) => left.min(Duration::from_millis(100)),
                None => break,
            },
            None => Duration::from_millis(100),
        };
        match interrupts.recv_timeout(wait) {
            Ok(()) => driver.service_interrupt(),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Some(stats) = driver.stats() {
        println!("{stats:#?}");
    }
    driver.exit();
    Ok(())
}
