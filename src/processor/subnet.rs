use std::net::Ipv4Addr;

use crate::types::{ClassifiedRecord, Direction, PacketRecord};

/// The monitored LAN, as network address plus prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanSubnet {
    network: u32,
    mask: u32,
}

impl LanSubnet {
    pub fn new(network: Ipv4Addr, prefix_len: u8) -> Self {
        let mask = match prefix_len {
            0 => 0,
            p if p >= 32 => u32::MAX,
            p => u32::MAX << (32 - p as u32),
        };
        Self { network: u32::from(network) & mask, mask }
    }

    #[inline]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & self.mask == self.network
    }

    /// Orient a packet around its LAN endpoint. LAN-internal traffic yields `None`.
    pub fn classify(&self, packet: PacketRecord) -> Option<ClassifiedRecord> {
        let src_in = self.contains(packet.src);
        let dst_in = self.contains(packet.dst);
        if src_in && dst_in {
            return None;
        }
        let (client, server, direction) = if src_in {
            (packet.src, packet.dst, Direction::Upload)
        } else {
            (packet.dst, packet.src, Direction::Download)
        };
        Some(ClassifiedRecord { packet, client, server, direction })
    }
}
