mod sniffer;

pub use sniffer::{
    list_interfaces,
    parse_packet,
    CaptureError,
    CaptureSource,
    NetworkInterface,
    PacketSniffer,
};
