//! PROXY protocol header handling.
//!
//! Outbound: a v1 (text) header is written to backends that ask for it,
//! carrying the original client address and the address it connected to:
//!
//! ```text
//! PROXY TCP4 192.168.1.1 10.0.0.1 56324 443\r\n
//! ```
//!
//! Inbound: when the listener sits behind a load balancer that speaks
//! PROXY protocol, the header it prepends (v1 or v2) is decoded and the
//! addresses it carries replace the socket addresses.
//!
//! Reference: https://www.haproxy.org/download/2.8/doc/proxy-protocol.txt

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::time::timeout;

use crate::error::ProxyHeaderError;

/// Maximum length of a v1 header line, CRLF included.
pub const V1_MAX_LEN: usize = 107;

/// PROXY protocol v2 signature (12 bytes).
const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Version 2 with PROXY command.
const VERSION_COMMAND_PROXY: u8 = 0x21;

/// Version 2 with LOCAL command (health checks from the load balancer).
const VERSION_COMMAND_LOCAL: u8 = 0x20;

/// AF_INET + STREAM.
const FAMILY_TCP4: u8 = 0x11;

/// AF_INET6 + STREAM.
const FAMILY_TCP6: u8 = 0x21;

/// Transport family named in a v1 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyFamily {
    Tcp4,
    Tcp6,
    Unknown,
}

impl ProxyFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp4 => "TCP4",
            Self::Tcp6 => "TCP6",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ProxyFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PROXY protocol v1 header for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeaderV1 {
    pub family: ProxyFamily,
    /// Original client address.
    pub src_addr: SocketAddr,
    /// Address the client connected to.
    pub dst_addr: SocketAddr,
}

impl ProxyHeaderV1 {
    /// Build a header for the given client and local addresses.
    ///
    /// The family follows the client address: TCP4 when it is (or maps to)
    /// IPv4, TCP6 otherwise. The local address is converted into the same
    /// family so the line stays well-formed.
    pub fn new(src_addr: SocketAddr, dst_addr: SocketAddr) -> Self {
        let src_ip = src_addr.ip().to_canonical();
        let dst_ip = dst_addr.ip().to_canonical();

        let (family, dst_ip) = match (src_ip, dst_ip) {
            (IpAddr::V4(_), IpAddr::V4(dst)) => (ProxyFamily::Tcp4, IpAddr::V4(dst)),
            (IpAddr::V4(_), IpAddr::V6(dst)) => (
                ProxyFamily::Tcp4,
                IpAddr::V4(extract_v4_from_v6(dst).unwrap_or(Ipv4Addr::UNSPECIFIED)),
            ),
            (IpAddr::V6(_), IpAddr::V6(dst)) => (ProxyFamily::Tcp6, IpAddr::V6(dst)),
            (IpAddr::V6(_), IpAddr::V4(dst)) => {
                (ProxyFamily::Tcp6, IpAddr::V6(dst.to_ipv6_mapped()))
            }
        };

        Self {
            family,
            src_addr: SocketAddr::new(src_ip, src_addr.port()),
            dst_addr: SocketAddr::new(dst_ip, dst_addr.port()),
        }
    }

    /// Render the header line, CRLF included.
    pub fn encode(&self) -> String {
        match self.family {
            ProxyFamily::Unknown => "PROXY UNKNOWN\r\n".to_string(),
            family => format!(
                "PROXY {} {} {} {} {}\r\n",
                family,
                self.src_addr.ip(),
                self.dst_addr.ip(),
                self.src_addr.port(),
                self.dst_addr.port()
            ),
        }
    }

    /// Parse a v1 header line (CRLF optional).
    ///
    /// `PROXY UNKNOWN ...` parses to `None`: the sender had no addresses
    /// to give and the socket addresses stay in effect.
    pub fn parse(line: &str) -> Result<Option<Self>, ProxyHeaderError> {
        let malformed = || ProxyHeaderError::MalformedV1(line.trim_end().to_string());

        let line = line.strip_suffix("\r\n").unwrap_or(line);
        let mut parts = line.split(' ');

        if parts.next() != Some("PROXY") {
            return Err(malformed());
        }

        let family = match parts.next() {
            Some("TCP4") => ProxyFamily::Tcp4,
            Some("TCP6") => ProxyFamily::Tcp6,
            Some("UNKNOWN") => return Ok(None),
            _ => return Err(malformed()),
        };

        let fields: Vec<&str> = parts.collect();
        if fields.len() != 4 {
            return Err(malformed());
        }

        let src_ip: IpAddr = fields[0].parse().map_err(|_| malformed())?;
        let dst_ip: IpAddr = fields[1].parse().map_err(|_| malformed())?;
        let src_port: u16 = fields[2].parse().map_err(|_| malformed())?;
        let dst_port: u16 = fields[3].parse().map_err(|_| malformed())?;

        let family_matches = match family {
            ProxyFamily::Tcp4 => src_ip.is_ipv4() && dst_ip.is_ipv4(),
            _ => src_ip.is_ipv6() && dst_ip.is_ipv6(),
        };
        if !family_matches {
            return Err(malformed());
        }

        Ok(Some(Self {
            family,
            src_addr: SocketAddr::new(src_ip, src_port),
            dst_addr: SocketAddr::new(dst_ip, dst_port),
        }))
    }
}

/// Extract IPv4 from an IPv6 address if it's a mapped or compatible address.
fn extract_v4_from_v6(addr: Ipv6Addr) -> Option<Ipv4Addr> {
    let octets = addr.octets();

    // IPv4-mapped: ::ffff:a.b.c.d
    if let Some(v4) = addr.to_ipv4_mapped() {
        return Some(v4);
    }

    // IPv4-compatible: ::a.b.c.d (deprecated but still handled)
    if octets[..12].iter().all(|&b| b == 0) {
        return Some(Ipv4Addr::new(
            octets[12], octets[13], octets[14], octets[15],
        ));
    }

    None
}

/// Addresses carried by an inbound PROXY header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundAddrs {
    pub src_addr: SocketAddr,
    pub dst_addr: SocketAddr,
}

/// Decode an inbound PROXY header if the stream starts with one.
///
/// The first byte decides: `P` starts a v1 line, `\r` starts the v2
/// signature, anything else (a TLS record starts with 0x16) means there is
/// no header and nothing is consumed. Returns `None` when there is no
/// header or the header carries no usable addresses (UNKNOWN, LOCAL,
/// unsupported family).
pub async fn read_inbound_header<S: AsyncRead + Unpin>(
    reader: &mut BufReader<S>,
) -> Result<Option<InboundAddrs>, ProxyHeaderError> {
    let first = match reader.fill_buf().await?.first() {
        Some(&b) => b,
        None => return Ok(None),
    };

    match first {
        b'P' => read_v1(reader).await,
        0x0D => read_v2(reader).await,
        _ => Ok(None),
    }
}

/// Same as [`read_inbound_header`], bounded by a deadline.
pub async fn read_inbound_header_with_timeout<S: AsyncRead + Unpin>(
    reader: &mut BufReader<S>,
    deadline: Duration,
) -> Result<Option<InboundAddrs>, ProxyHeaderError> {
    match timeout(deadline, read_inbound_header(reader)).await {
        Ok(result) => result,
        Err(_) => Err(ProxyHeaderError::Timeout(deadline)),
    }
}

async fn read_v1<S: AsyncRead + Unpin>(
    reader: &mut BufReader<S>,
) -> Result<Option<InboundAddrs>, ProxyHeaderError> {
    let mut line = Vec::with_capacity(V1_MAX_LEN);
    (&mut *reader)
        .take(V1_MAX_LEN as u64)
        .read_until(b'\n', &mut line)
        .await?;

    if !line.ends_with(b"\r\n") {
        return Err(ProxyHeaderError::Unterminated(V1_MAX_LEN));
    }

    let line = std::str::from_utf8(&line)
        .map_err(|_| ProxyHeaderError::MalformedV1("non-UTF-8 header".to_string()))?;

    Ok(ProxyHeaderV1::parse(line)?.map(|header| InboundAddrs {
        src_addr: header.src_addr,
        dst_addr: header.dst_addr,
    }))
}

async fn read_v2<S: AsyncRead + Unpin>(
    reader: &mut BufReader<S>,
) -> Result<Option<InboundAddrs>, ProxyHeaderError> {
    let mut header = [0u8; 16];
    reader.read_exact(&mut header).await?;

    if header[..12] != PROXY_V2_SIGNATURE {
        return Err(ProxyHeaderError::MalformedV2("bad signature"));
    }

    let version_command = header[12];
    let family_protocol = header[13];
    let addr_len = u16::from_be_bytes([header[14], header[15]]) as usize;

    // Always consume the address block so the stream is left at the payload.
    let mut data = vec![0u8; addr_len];
    reader.read_exact(&mut data).await?;

    match version_command {
        VERSION_COMMAND_PROXY => {}
        VERSION_COMMAND_LOCAL => return Ok(None),
        _ => return Err(ProxyHeaderError::MalformedV2("unsupported version or command")),
    }

    let addrs = match family_protocol {
        FAMILY_TCP4 => {
            if addr_len < 12 {
                return Err(ProxyHeaderError::MalformedV2("short IPv4 address block"));
            }
            let src_ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            let dst_ip = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
            let src_port = u16::from_be_bytes([data[8], data[9]]);
            let dst_port = u16::from_be_bytes([data[10], data[11]]);
            InboundAddrs {
                src_addr: SocketAddr::new(IpAddr::V4(src_ip), src_port),
                dst_addr: SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
            }
        }
        FAMILY_TCP6 => {
            if addr_len < 36 {
                return Err(ProxyHeaderError::MalformedV2("short IPv6 address block"));
            }
            let mut src_octets = [0u8; 16];
            let mut dst_octets = [0u8; 16];
            src_octets.copy_from_slice(&data[0..16]);
            dst_octets.copy_from_slice(&data[16..32]);
            let src_port = u16::from_be_bytes([data[32], data[33]]);
            let dst_port = u16::from_be_bytes([data[34], data[35]]);
            InboundAddrs {
                src_addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src_octets)), src_port),
                dst_addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst_octets)), dst_port),
            }
        }
        // UNSPEC, UDP and UNIX sockets carry nothing we can use.
        _ => return Ok(None),
    };

    Ok(Some(addrs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn v2_header(command: u8, family: u8, addresses: &[u8]) -> Vec<u8> {
        let mut buf = PROXY_V2_SIGNATURE.to_vec();
        buf.push(command);
        buf.push(family);
        buf.extend_from_slice(&(addresses.len() as u16).to_be_bytes());
        buf.extend_from_slice(addresses);
        buf
    }

    #[test]
    fn test_encode_ipv4() {
        let header = ProxyHeaderV1::new(addr("192.168.1.1:56324"), addr("10.0.0.1:443"));
        assert_eq!(header.family, ProxyFamily::Tcp4);
        assert_eq!(
            header.encode(),
            "PROXY TCP4 192.168.1.1 10.0.0.1 56324 443\r\n"
        );
    }

    #[test]
    fn test_encode_ipv6() {
        let header = ProxyHeaderV1::new(addr("[2001:db8::1]:12345"), addr("[2001:db8::2]:443"));
        assert_eq!(header.family, ProxyFamily::Tcp6);
        assert_eq!(
            header.encode(),
            "PROXY TCP6 2001:db8::1 2001:db8::2 12345 443\r\n"
        );
    }

    #[test]
    fn test_encode_mapped_client_is_tcp4() {
        // Dual-stack listener: both sides show up as IPv4-mapped IPv6.
        let header = ProxyHeaderV1::new(
            addr("[::ffff:192.168.1.1]:5000"),
            addr("[::ffff:10.0.0.1]:443"),
        );
        assert_eq!(
            header.encode(),
            "PROXY TCP4 192.168.1.1 10.0.0.1 5000 443\r\n"
        );
    }

    #[test]
    fn test_encode_mixed_families() {
        let header = ProxyHeaderV1::new(addr("192.168.1.1:5000"), addr("[2001:db8::2]:443"));
        assert_eq!(header.encode(), "PROXY TCP4 192.168.1.1 0.0.0.0 5000 443\r\n");

        let header = ProxyHeaderV1::new(addr("[2001:db8::1]:5000"), addr("10.0.0.1:443"));
        assert_eq!(
            header.encode(),
            "PROXY TCP6 2001:db8::1 ::ffff:10.0.0.1 5000 443\r\n"
        );
    }

    #[test]
    fn test_encode_fits_v1_limit() {
        let header = ProxyHeaderV1::new(
            addr("[ffff:ffff:ffff:ffff:ffff:ffff:ffff:fffe]:65535"),
            addr("[ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff]:65535"),
        );
        assert!(header.encode().len() <= V1_MAX_LEN);
    }

    #[test]
    fn test_parse_v1() {
        let parsed = ProxyHeaderV1::parse("PROXY TCP4 192.168.1.1 10.0.0.1 56324 443\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(parsed.src_addr, addr("192.168.1.1:56324"));
        assert_eq!(parsed.dst_addr, addr("10.0.0.1:443"));

        let header = ProxyHeaderV1::new(addr("[2001:db8::1]:1"), addr("[2001:db8::2]:2"));
        assert_eq!(ProxyHeaderV1::parse(&header.encode()).unwrap(), Some(header));
    }

    #[test]
    fn test_parse_v1_unknown() {
        assert_eq!(ProxyHeaderV1::parse("PROXY UNKNOWN\r\n").unwrap(), None);
        assert_eq!(
            ProxyHeaderV1::parse("PROXY UNKNOWN 1.1.1.1 2.2.2.2 1 2\r\n").unwrap(),
            None
        );
    }

    #[test]
    fn test_parse_v1_invalid() {
        for line in [
            "PROXY\r\n",
            "PROXI TCP4 1.1.1.1 2.2.2.2 1 2\r\n",
            "PROXY TCP5 1.1.1.1 2.2.2.2 1 2\r\n",
            "PROXY TCP4 1.1.1.1 2.2.2.2 1\r\n",
            "PROXY TCP4 1.1.1.1 2.2.2.2 1 70000\r\n",
            "PROXY TCP4 2001:db8::1 2.2.2.2 1 2\r\n",
            "PROXY TCP6 1.1.1.1 2.2.2.2 1 2\r\n",
        ] {
            assert!(ProxyHeaderV1::parse(line).is_err(), "accepted {:?}", line);
        }
    }

    #[test]
    fn test_extract_v4_from_v6() {
        // IPv4-mapped
        let mapped: Ipv6Addr = "::ffff:192.168.1.1".parse().unwrap();
        assert_eq!(
            extract_v4_from_v6(mapped),
            Some(Ipv4Addr::new(192, 168, 1, 1))
        );

        // Regular IPv6
        let regular: Ipv6Addr = "2001:db8::1".parse().unwrap();
        assert_eq!(extract_v4_from_v6(regular), None);
    }

    #[tokio::test]
    async fn test_inbound_v1() {
        let data = b"PROXY TCP4 203.0.113.7 10.0.0.1 40000 443\r\n\x16\x03\x01".to_vec();
        let mut reader = BufReader::new(&data[..]);

        let addrs = read_inbound_header(&mut reader).await.unwrap().unwrap();
        assert_eq!(addrs.src_addr, addr("203.0.113.7:40000"));
        assert_eq!(addrs.dst_addr, addr("10.0.0.1:443"));

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, [0x16, 0x03, 0x01]);
    }

    #[tokio::test]
    async fn test_inbound_absent_leaves_stream_untouched() {
        let data = [0x16u8, 0x03, 0x01, 0x00, 0x00];
        let mut reader = BufReader::new(&data[..]);

        assert!(read_inbound_header(&mut reader).await.unwrap().is_none());

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, data);
    }

    #[tokio::test]
    async fn test_inbound_empty_stream() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(read_inbound_header(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_inbound_v1_unterminated() {
        let data = vec![b'P'; 200];
        let mut reader = BufReader::new(&data[..]);

        let err = read_inbound_header(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProxyHeaderError::Unterminated(V1_MAX_LEN)));
    }

    #[tokio::test]
    async fn test_inbound_v2_ipv4() {
        let mut data = v2_header(
            VERSION_COMMAND_PROXY,
            FAMILY_TCP4,
            &[192, 168, 1, 1, 10, 0, 0, 1, 0x30, 0x39, 0x01, 0xbb],
        );
        data.push(0x16);
        let mut reader = BufReader::new(&data[..]);

        let addrs = read_inbound_header(&mut reader).await.unwrap().unwrap();
        assert_eq!(addrs.src_addr, addr("192.168.1.1:12345"));
        assert_eq!(addrs.dst_addr, addr("10.0.0.1:443"));

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, [0x16]);
    }

    #[tokio::test]
    async fn test_inbound_v2_ipv6() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let mut addresses = src.octets().to_vec();
        addresses.extend_from_slice(&dst.octets());
        addresses.extend_from_slice(&12345u16.to_be_bytes());
        addresses.extend_from_slice(&443u16.to_be_bytes());

        let data = v2_header(VERSION_COMMAND_PROXY, FAMILY_TCP6, &addresses);
        let mut reader = BufReader::new(&data[..]);

        let addrs = read_inbound_header(&mut reader).await.unwrap().unwrap();
        assert_eq!(addrs.src_addr, addr("[2001:db8::1]:12345"));
        assert_eq!(addrs.dst_addr, addr("[2001:db8::2]:443"));
    }

    #[tokio::test]
    async fn test_inbound_v2_local_consumes_header() {
        let mut data = v2_header(VERSION_COMMAND_LOCAL, 0x00, &[]);
        data.push(0x16);
        let mut reader = BufReader::new(&data[..]);

        assert!(read_inbound_header(&mut reader).await.unwrap().is_none());

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, [0x16]);
    }

    #[tokio::test]
    async fn test_inbound_v2_bad_signature() {
        let mut data = v2_header(VERSION_COMMAND_PROXY, FAMILY_TCP4, &[0; 12]);
        data[3] = 0xff;
        let mut reader = BufReader::new(&data[..]);

        let err = read_inbound_header(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProxyHeaderError::MalformedV2(_)));
    }

    #[tokio::test]
    async fn test_inbound_timeout() {
        let (_client, server) = tokio::io::duplex(64);
        let mut reader = BufReader::new(server);

        let err = read_inbound_header_with_timeout(&mut reader, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyHeaderError::Timeout(_)));
    }
}
