//! Zero-copy Ethernet/IPv4/TCP decoding of captured frames.

use chrono::{DateTime, Utc};
use etherparse::{NetSlice, SlicedPacket, TransportSlice};

use crate::matcher::PacketMeta;

/// Slice `frame` as Ethernet → IPv4 → TCP and build the per-packet view.
///
/// Returns `None` for anything that is not IPv4+TCP (the kernel filter
/// already drops most of it; ARP and stray IPv6 still get here). The
/// returned meta borrows the frame's TCP payload — it lives only as long
/// as the frame does.
pub fn decode_frame<'a>(
    frame: &'a [u8],
    timestamp: DateTime<Utc>,
    wire_length: u64,
) -> Option<PacketMeta<'a>> {
    let sliced = SlicedPacket::from_ethernet(frame).ok()?;

    let ipv4 = match sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => ipv4,
        _ => return None,
    };
    let tcp = match sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => tcp,
        _ => return None,
    };

    Some(PacketMeta {
        timestamp,
        src_ip: ipv4.header().source_addr(),
        dst_ip: ipv4.header().destination_addr(),
        src_port: tcp.source_port(),
        dst_port: tcp.destination_port(),
        payload: tcp.payload(),
        packet_size: wire_length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    /// Minimal Ethernet+IPv4+TCP frame with the given payload.
    fn build_frame(
        src: Ipv4Addr,
        src_port: u16,
        dst: Ipv4Addr,
        dst_port: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let builder = etherparse::PacketBuilder::ethernet2(
            [0x02, 0, 0, 0, 0, 1],
            [0x02, 0, 0, 0, 0, 2],
        )
        .ipv4(src.octets(), dst.octets(), 64)
        .tcp(src_port, dst_port, 1000, 64_000);

        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, payload).unwrap();
        frame
    }

    #[test]
    fn test_decode_ipv4_tcp_frame() {
        let src = Ipv4Addr::new(192, 168, 1, 10);
        let dst = Ipv4Addr::new(10, 0, 0, 1);
        let payload = b"GET /api/test HTTP/1.1\r\n\r\n";
        let frame = build_frame(src, 12345, dst, 80, payload);

        let meta = decode_frame(&frame, Utc::now(), frame.len() as u64).unwrap();
        assert_eq!(meta.src_ip, src);
        assert_eq!(meta.dst_ip, dst);
        assert_eq!(meta.src_port, 12345);
        assert_eq!(meta.dst_port, 80);
        assert_eq!(meta.payload, payload);
        assert_eq!(meta.packet_size, frame.len() as u64);
    }

    #[test]
    fn test_decode_rejects_non_ip_frames() {
        // EtherType 0x0806 (ARP) with a stub body.
        let mut frame = vec![0u8; 14];
        frame[12] = 0x08;
        frame[13] = 0x06;
        frame.extend_from_slice(&[0u8; 28]);
        assert!(decode_frame(&frame, Utc::now(), frame.len() as u64).is_none());
    }

    #[test]
    fn test_decode_rejects_udp() {
        let builder = etherparse::PacketBuilder::ethernet2(
            [0x02, 0, 0, 0, 0, 1],
            [0x02, 0, 0, 0, 0, 2],
        )
        .ipv4([1, 1, 1, 1], [2, 2, 2, 2], 64)
        .udp(5353, 5353);
        let mut frame = Vec::new();
        builder.write(&mut frame, b"hello").unwrap();

        assert!(decode_frame(&frame, Utc::now(), frame.len() as u64).is_none());
    }

    #[test]
    fn test_decode_rejects_truncated_frame() {
        let frame = build_frame(
            Ipv4Addr::new(1, 2, 3, 4),
            1,
            Ipv4Addr::new(5, 6, 7, 8),
            80,
            b"x",
        );
        assert!(decode_frame(&frame[..20], Utc::now(), 20).is_none());
    }
}
