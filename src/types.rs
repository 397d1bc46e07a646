use serde::{Serialize, Deserialize};
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpFields {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpFields {
    pub src_port: u16,
    pub dst_port: u16,
}

/// One observed IPv4 packet, as handed over by the capture layer.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketRecord {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    /// IPv4 total length in bytes
    pub size: u32,
    /// Seconds since the epoch, fractional
    pub timestamp: f64,
    pub ttl: u8,
    pub ip_flags: u8,
    pub tcp: Option<TcpFields>,
    pub udp: Option<UdpFields>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction { Upload, Download }

impl Direction {
    pub fn sign(self) -> i8 {
        match self {
            Direction::Upload => 1,
            Direction::Download => -1,
        }
    }
}

/// A packet seen from the point of view of the LAN client that sent or received it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedRecord {
    pub packet: PacketRecord,
    pub client: Ipv4Addr,
    pub server: Ipv4Addr,
    pub direction: Direction,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct BatchStats {
    pub packets: u64,
    // Records left after dropping LAN-internal traffic
    pub classified: u64,
    pub clients: u64,
    pub windows: u64,
    pub dropped_windows: u64,
    pub blocked: u64,
}
