//! Frame buffers and debug decoding.

use smoltcp::wire::{EthernetProtocol, IPV6_HEADER_LEN, IpVersion, Ipv4Packet, Ipv6Packet};
use tracing::debug;

/// Reusable buffer holding one frame of at most `mtu` bytes.
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(mtu: usize) -> Self {
        FrameBuffer { buf: vec![0u8; mtu] }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The full buffer, for the next read.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// The first `len` bytes, as filled by the last read.
    pub fn frame(&self, len: usize) -> &[u8] {
        &self.buf[..len.min(self.buf.len())]
    }
}

/// Header fields of an IP frame, decoded for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSummary<'a> {
    /// EtherType matching the IP version (0x0800 or 0x86dd).
    pub ethertype: u16,
    pub source: String,
    pub destination: String,
    pub protocol: String,
    pub payload: &'a [u8],
}

impl<'a> FrameSummary<'a> {
    /// Decode `frame`. `None` if it is not a well-formed IP packet.
    pub fn parse(frame: &'a [u8]) -> Option<Self> {
        match IpVersion::of_packet(frame).ok()? {
            IpVersion::Ipv4 => {
                let packet = Ipv4Packet::new_checked(frame).ok()?;
                Some(FrameSummary {
                    ethertype: EthernetProtocol::Ipv4.into(),
                    source: packet.src_addr().to_string(),
                    destination: packet.dst_addr().to_string(),
                    protocol: packet.next_header().to_string(),
                    payload: ipv4_payload(frame, &packet),
                })
            }
            IpVersion::Ipv6 => {
                let packet = Ipv6Packet::new_checked(frame).ok()?;
                Some(FrameSummary {
                    ethertype: EthernetProtocol::Ipv6.into(),
                    source: packet.src_addr().to_string(),
                    destination: packet.dst_addr().to_string(),
                    protocol: packet.next_header().to_string(),
                    payload: ipv6_payload(frame, &packet),
                })
            }
        }
    }
}

fn ipv4_payload<'a>(frame: &'a [u8], packet: &Ipv4Packet<&[u8]>) -> &'a [u8] {
    let start = usize::from(packet.header_len());
    let end = usize::from(packet.total_len()).min(frame.len());
    frame.get(start..end).unwrap_or_default()
}

fn ipv6_payload<'a>(frame: &'a [u8], packet: &Ipv6Packet<&[u8]>) -> &'a [u8] {
    let end = (IPV6_HEADER_LEN + usize::from(packet.payload_len())).min(frame.len());
    frame.get(IPV6_HEADER_LEN..end).unwrap_or_default()
}

/// Emit one debug event describing `frame`.
pub fn log_frame(direction: &'static str, frame: &[u8]) {
    match FrameSummary::parse(frame) {
        Some(summary) => debug!(
            direction,
            len = frame.len(),
            ethertype = format_args!("{:#06x}", summary.ethertype),
            src = %summary.source,
            dst = %summary.destination,
            protocol = %summary.protocol,
            payload = %hex::encode(summary.payload),
            "Frame"
        ),
        None => debug!(
            direction,
            len = frame.len(),
            raw = %hex::encode(frame),
            "Undecodable frame"
        ),
    }
}
