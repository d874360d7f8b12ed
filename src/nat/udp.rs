//! UDP reply write-back
//!
//! A push-mode datagram carries a [`ReplyTemplate`]: a private copy of the
//! request's IP and UDP headers. Each reply clones the template into its own
//! buffer, swaps in the reply source, lengths and checksums, and writes the
//! result to the device. Concurrent replies therefore never share a
//! scratch buffer.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::trace;

use super::udp_socket::NatUdpSocket;
use crate::device::{write_error, PacketDevice};
use crate::error::{NatError, PacketError, UdpError};
use crate::packet::build::DEFAULT_TTL;
use crate::packet::{ipv4, ipv6, udp, IpPacket, Ipv4Packet, Ipv6Packet, UdpPacket};
use crate::stats::NatStats;

/// Headers of a request, ready to be turned into replies
pub(crate) struct ReplyTemplate {
    header: Bytes,
    ip_header_len: usize,
    client: SocketAddr,
    remote: SocketAddr,
    device: Arc<dyn PacketDevice>,
    stats: Arc<NatStats>,
}

impl ReplyTemplate {
    /// Capture the headers of a validated UDP request
    ///
    /// IPv4 options are not carried over.
    pub fn from_request<T: AsRef<[u8]>>(
        ip: &IpPacket<T>,
        client: SocketAddr,
        remote: SocketAddr,
        device: Arc<dyn PacketDevice>,
        stats: Arc<NatStats>,
    ) -> Self {
        let ip_header_len = if ip.is_ipv4() {
            ipv4::HEADER_LEN
        } else {
            ipv6::HEADER_LEN
        };
        let mut header = BytesMut::with_capacity(ip_header_len + udp::HEADER_LEN);
        header.extend_from_slice(&ip.header()[..ip_header_len]);
        header.extend_from_slice(&ip.payload()[..udp::HEADER_LEN]);
        if ip.is_ipv4() {
            header[0] = 0x45;
            Ipv4Packet::new_unchecked(&mut header[..]).set_ttl(DEFAULT_TTL);
        } else {
            Ipv6Packet::new_unchecked(&mut header[..]).set_hop_limit(DEFAULT_TTL);
        }
        Self {
            header: header.freeze(),
            ip_header_len,
            client,
            remote,
            device,
            stats,
        }
    }

    /// Build one reply packet from `source` to the client
    fn build(&self, payload: &[u8], source: SocketAddr) -> Result<BytesMut, NatError> {
        let udp_len = udp::HEADER_LEN + payload.len();
        let total = self.ip_header_len + udp_len;
        let limit_exceeded = if self.client.is_ipv4() {
            total > usize::from(u16::MAX)
        } else {
            udp_len > usize::from(u16::MAX)
        };
        if limit_exceeded {
            return Err(UdpError::PayloadTooLarge(payload.len()).into());
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.extend_from_slice(&self.header);
        buf.extend_from_slice(payload);

        #[allow(clippy::cast_possible_truncation)]
        {
            if self.client.is_ipv4() {
                Ipv4Packet::new_unchecked(&mut buf[..]).set_total_len(total as u16);
            } else {
                Ipv6Packet::new_unchecked(&mut buf[..]).set_payload_len(udp_len as u16);
            }
            UdpPacket::new_unchecked(&mut buf[self.ip_header_len..]).set_len(udp_len as u16);
        }

        let mut ip = IpPacket::new_checked(&mut buf[..])?;
        ip.rewrite_endpoints(source, self.client)
            .map_err(|e| match e {
                PacketError::FamilyMismatch(_) => NatError::Udp(UdpError::FamilyMismatch {
                    source_addr: source,
                    client: self.client,
                }),
                other => NatError::Packet(other),
            })?;
        Ok(buf)
    }

    async fn write(&self, payload: &[u8], source: SocketAddr) -> Result<usize, NatError> {
        let packet = self.build(payload, source)?;
        self.device
            .send(&packet)
            .await
            .map_err(|e| UdpError::WriteBack(write_error(e)))?;
        self.stats.record_udp_reply();
        trace!(%source, client = %self.client, len = payload.len(), "UDP reply written");
        Ok(payload.len())
    }
}

#[derive(Clone)]
enum WriteBack {
    Template(Arc<ReplyTemplate>),
    Socket {
        socket: Arc<NatUdpSocket>,
        client: SocketAddr,
        remote: SocketAddr,
    },
}

/// Sends replies back to the client of a UDP datagram
///
/// Cheap to clone; clones address the same client.
#[derive(Clone)]
pub struct UdpWriteBack {
    inner: WriteBack,
}

impl UdpWriteBack {
    pub(crate) fn template(template: ReplyTemplate) -> Self {
        Self {
            inner: WriteBack::Template(Arc::new(template)),
        }
    }

    pub(crate) fn socket(socket: Arc<NatUdpSocket>, client: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            inner: WriteBack::Socket {
                socket,
                client,
                remote,
            },
        }
    }

    /// The client replies are addressed to
    pub fn client(&self) -> SocketAddr {
        match &self.inner {
            WriteBack::Template(t) => t.client,
            WriteBack::Socket { client, .. } => *client,
        }
    }

    /// The original destination, used as the default reply source
    pub fn remote(&self) -> SocketAddr {
        match &self.inner {
            WriteBack::Template(t) => t.remote,
            WriteBack::Socket { remote, .. } => *remote,
        }
    }

    /// Send `payload` to the client
    ///
    /// `source` overrides the reply's source address (full-cone replies from
    /// a different remote); by default it is the original destination.
    /// IPv4-mapped IPv6 sources are treated as IPv4.
    ///
    /// # Errors
    ///
    /// Returns `UdpError::FamilyMismatch` if `source` and the client are of
    /// different families, `UdpError::PayloadTooLarge` if the reply does
    /// not fit in one packet, and `UdpError::WriteBack` if the device write
    /// fails.
    pub async fn write(&self, payload: &[u8], source: Option<SocketAddr>) -> Result<usize, NatError> {
        let source = source.unwrap_or_else(|| self.remote());
        let source = SocketAddr::new(source.ip().to_canonical(), source.port());
        match &self.inner {
            WriteBack::Template(template) => template.write(payload, source).await,
            WriteBack::Socket { socket, client, .. } => {
                socket.write_to(payload, source, *client).await
            }
        }
    }
}

impl fmt::Debug for UdpWriteBack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpWriteBack")
            .field("client", &self.client())
            .field("remote", &self.remote())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ChannelDevice;
    use crate::packet::build;

    fn request(client: &str, remote: &str) -> BytesMut {
        build::udp_datagram(client.parse().unwrap(), remote.parse().unwrap(), b"request").unwrap()
    }

    fn template_for(buf: &[u8], device: Arc<dyn PacketDevice>) -> UdpWriteBack {
        let ip = IpPacket::new_checked(buf).unwrap();
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        let client = SocketAddr::new(ip.src_addr(), udp.src_port());
        let remote = SocketAddr::new(ip.dst_addr(), udp.dst_port());
        UdpWriteBack::template(ReplyTemplate::from_request(
            &ip,
            client,
            remote,
            device,
            Arc::new(NatStats::new()),
        ))
    }

    fn parse_reply(packet: &[u8]) -> (SocketAddr, SocketAddr, Vec<u8>) {
        assert!(build::checksums_valid(packet));
        let ip = IpPacket::new_checked(packet).unwrap();
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        (
            SocketAddr::new(ip.src_addr(), udp.src_port()),
            SocketAddr::new(ip.dst_addr(), udp.dst_port()),
            udp.payload().to_vec(),
        )
    }

    #[tokio::test]
    async fn test_reply_defaults_to_original_destination() {
        let (device, mut handle) = ChannelDevice::pair(8);
        let write_back = template_for(&request("10.0.0.2:5353", "1.1.1.1:53"), Arc::new(device));

        assert_eq!(write_back.write(b"answer", None).await.unwrap(), 6);
        let reply = handle.next_written().await.unwrap();
        let (src, dst, payload) = parse_reply(&reply);
        assert_eq!(src, "1.1.1.1:53".parse().unwrap());
        assert_eq!(dst, "10.0.0.2:5353".parse().unwrap());
        assert_eq!(payload, b"answer");
    }

    #[tokio::test]
    async fn test_reply_source_override_and_mapped_address() {
        let (device, mut handle) = ChannelDevice::pair(8);
        let write_back = template_for(&request("10.0.0.2:5353", "1.1.1.1:53"), Arc::new(device));

        let mapped: SocketAddr = "[::ffff:8.8.8.8]:5300".parse().unwrap();
        write_back.write(b"x", Some(mapped)).await.unwrap();
        let (src, _, _) = parse_reply(&handle.next_written().await.unwrap());
        assert_eq!(src, "8.8.8.8:5300".parse().unwrap());
    }

    #[tokio::test]
    async fn test_family_mismatch_rejected() {
        let (device, mut handle) = ChannelDevice::pair(8);
        let write_back = template_for(&request("10.0.0.2:5353", "1.1.1.1:53"), Arc::new(device));

        let err = write_back
            .write(b"x", Some("[2001:db8::1]:53".parse().unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, NatError::Udp(UdpError::FamilyMismatch { .. })));
        assert!(handle.try_next_written().is_none());
    }

    #[tokio::test]
    async fn test_oversized_reply_rejected() {
        let (device, _handle) = ChannelDevice::pair(8);
        let write_back = template_for(&request("10.0.0.2:5353", "1.1.1.1:53"), Arc::new(device));
        let payload = vec![0u8; 65536];
        let err = write_back.write(&payload, None).await.unwrap_err();
        assert!(matches!(err, NatError::Udp(UdpError::PayloadTooLarge(_))));
    }

    #[tokio::test]
    async fn test_ipv6_reply() {
        let (device, mut handle) = ChannelDevice::pair(8);
        let write_back = template_for(
            &request("[fd00::2]:5353", "[2001:4860:4860::8888]:53"),
            Arc::new(device),
        );
        write_back.write(b"v6 answer", None).await.unwrap();
        let (src, dst, payload) = parse_reply(&handle.next_written().await.unwrap());
        assert_eq!(src, "[2001:4860:4860::8888]:53".parse().unwrap());
        assert_eq!(dst, "[fd00::2]:5353".parse().unwrap());
        assert_eq!(payload, b"v6 answer");
    }

    #[tokio::test]
    async fn test_concurrent_replies_do_not_interfere() {
        let (device, mut handle) = ChannelDevice::pair(64);
        let write_back = template_for(&request("10.0.0.2:5353", "1.1.1.1:53"), Arc::new(device));

        let tasks: Vec<_> = (0..32u8)
            .map(|i| {
                let write_back = write_back.clone();
                tokio::spawn(async move { write_back.write(&[i; 100], None).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..32 {
            let (_, _, payload) = parse_reply(&handle.next_written().await.unwrap());
            assert!(payload.iter().all(|b| *b == payload[0]), "payload mixed");
            seen.push(payload[0]);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..32).collect::<Vec<u8>>());
    }
}
