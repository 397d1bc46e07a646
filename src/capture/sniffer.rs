use pcap::{Active, Capture, Offline, Packet, PacketHeader};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{atomic::{AtomicBool, Ordering}, Arc};
use std::thread::{self, JoinHandle};
use crossbeam_channel::Sender;
use etherparse::{NetHeaders, PacketHeaders, TransportHeader};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::types::{PacketRecord, TcpFields, UdpFields};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture source '{0}' does not exist")]
    SourceNotFound(String),

    #[error("capture is not initialized, call init_sniffer first")]
    NotInitialized,

    #[error("sniffer is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Pcap(#[from] pcap::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    pub name: String,
    pub description: String,
    pub is_up: bool,
}

pub fn list_interfaces() -> Result<Vec<NetworkInterface>, CaptureError> {
    let devices = pcap::Device::list()?;
    Ok(devices
        .into_iter()
        .filter(|d| !d.flags.is_loopback())
        .map(|d| NetworkInterface {
            description: d.desc.unwrap_or_else(|| "No description".to_string()),
            is_up: d.flags.is_up(),
            name: d.name,
        })
        .collect())
}

/// Where packets come from: a live device or a saved capture (file or named pipe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    Interface(String),
    File(PathBuf),
}

impl CaptureSource {
    /// `-` is stdin and an existing path is a saved capture; otherwise the name must be a known device.
    pub fn resolve(source: &str) -> Result<Self, CaptureError> {
        let path = PathBuf::from(source);
        // libpcap reads a savefile named "-" from stdin
        if source == "-" {
            return Ok(CaptureSource::File(path));
        }
        if path.exists() {
            return Ok(CaptureSource::File(path));
        }
        let known = pcap::Device::list()?.into_iter().any(|d| d.name == source);
        if known {
            Ok(CaptureSource::Interface(source.to_string()))
        } else {
            Err(CaptureError::SourceNotFound(source.to_string()))
        }
    }
}

enum Handle {
    Live(Capture<Active>),
    Offline(Capture<Offline>),
}

impl Handle {
    fn next_packet(&mut self) -> Result<Packet<'_>, pcap::Error> {
        match self {
            Handle::Live(cap) => cap.next_packet(),
            Handle::Offline(cap) => cap.next_packet(),
        }
    }
}

pub struct PacketSniffer {
    sniffer_running: Arc<AtomicBool>,
    sniffer_thread: Option<JoinHandle<()>>,
    capture: Option<Handle>,      // owned until start, then moved into thread
    packet_sender: Option<Sender<PacketRecord>>,
}

impl PacketSniffer {
    pub fn new_with_sender(sender: Sender<PacketRecord>) -> Self {
        Self {
            sniffer_running: Arc::new(AtomicBool::new(false)),
            sniffer_thread: None,
            capture: None,
            packet_sender: Some(sender),
        }
    }

    pub fn init_sniffer(&mut self, source: &CaptureSource, filter: &str) -> Result<(), CaptureError> {
        let handle = match source {
            CaptureSource::Interface(name) => {
                let mut cap = Capture::from_device(name.as_str())?
                    .promisc(true)
                    .immediate_mode(true)
                    .timeout(10)
                    .open()?;
                cap.filter(filter, true)?;
                info!(interface = %name, "interface opened");
                Handle::Live(cap.setnonblock()?)
            }
            CaptureSource::File(path) => {
                let mut cap = Capture::from_file(path)?;
                cap.filter(filter, true)?;
                info!(path = %path.display(), "capture file opened");
                Handle::Offline(cap)
            }
        };
        info!(%filter, "filter applied");

        self.capture = Some(handle);
        Ok(())
    }

    pub fn start_sniffer(&mut self) -> Result<(), CaptureError> {
        let mut cap = self.capture.take().ok_or(CaptureError::NotInitialized)?;

        if self.sniffer_running.swap(true, Ordering::Relaxed) {
            return Err(CaptureError::AlreadyRunning);
        }

        let running = self.sniffer_running.clone();
        // The thread owns the only sender, so the processor sees a disconnect once capture ends.
        let sender = self.packet_sender.take().ok_or(CaptureError::NotInitialized)?;

        self.sniffer_thread = Some(thread::spawn(move || {
            info!("sniffer thread started");
            while running.load(Ordering::Relaxed) {
                match cap.next_packet() {
                    Ok(packet) => {
                        if !PacketSniffer::packet_handler(packet.header, packet.data, &sender) {
                            break;
                        }
                    }
                    Err(pcap::Error::TimeoutExpired) => {
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    }
                    Err(pcap::Error::NoMorePackets) => {
                        info!("end of capture");
                        break;
                    }
                    Err(e) => { error!(error = %e, "error capturing packet"); break; }
                }
            }
            running.store(false, Ordering::Relaxed);
            info!("sniffer thread exiting");
            // cap and sender drop here
        }));

        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.sniffer_running.load(Ordering::Relaxed)
    }

    pub fn stop_sniffer(&mut self) {
        self.sniffer_running.store(false, Ordering::Relaxed);

        if let Some(handle) = self.sniffer_thread.take() {
            let _ = handle.join();
        }

        // If start succeeded, capture is already moved. If not, drop it now.
        self.capture = None;
        info!("sniffer stopped");
    }

    /// Returns false once the processor has gone away.
    fn packet_handler(header: &PacketHeader, packet_data: &[u8], sender: &Sender<PacketRecord>) -> bool {
        match parse_packet(header_timestamp(header), packet_data) {
            // Blocking send: a slow batch backs up capture instead of losing records
            Some(record) => sender.send(record).is_ok(),
            None => {
                debug!(len = header.len, "skipping non-IPv4 frame");
                true
            }
        }
    }
}

#[inline]
fn header_timestamp(header: &PacketHeader) -> f64 {
    header.ts.tv_sec as f64 + header.ts.tv_usec as f64 / 1_000_000.0
}

/// Extract the fields the aggregator needs from an Ethernet frame. Non-IPv4 frames yield `None`.
pub fn parse_packet(timestamp: f64, data: &[u8]) -> Option<PacketRecord> {
    let parsed = PacketHeaders::from_ethernet_slice(data).ok()?;

    let ipv4 = match &parsed.net {
        Some(NetHeaders::Ipv4(ipv4, _)) => ipv4,
        _ => return None,
    };
    let ip_flags = (ipv4.dont_fragment as u8) << 1 | (ipv4.more_fragments as u8);

    let (tcp, udp) = match &parsed.transport {
        Some(TransportHeader::Tcp(tcp)) => {
            let flags = (tcp.cwr as u8) << 7
                | (tcp.ece as u8) << 6
                | (tcp.urg as u8) << 5
                | (tcp.ack as u8) << 4
                | (tcp.psh as u8) << 3
                | (tcp.rst as u8) << 2
                | (tcp.syn as u8) << 1
                | (tcp.fin as u8);
            let fields = TcpFields {
                src_port: tcp.source_port,
                dst_port: tcp.destination_port,
                seq: tcp.sequence_number,
                ack: tcp.acknowledgment_number,
                flags,
            };
            (Some(fields), None)
        }
        Some(TransportHeader::Udp(udp)) => {
            let fields = UdpFields { src_port: udp.source_port, dst_port: udp.destination_port };
            (None, Some(fields))
        }
        _ => (None, None),
    };

    Some(PacketRecord {
        src: Ipv4Addr::from(ipv4.source),
        dst: Ipv4Addr::from(ipv4.destination),
        size: ipv4.total_len as u32,
        timestamp,
        ttl: ipv4.time_to_live,
        ip_flags,
        tcp,
        udp,
    })
}
