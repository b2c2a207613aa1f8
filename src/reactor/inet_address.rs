use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Wraps `std::net::SocketAddr`, which already expresses the
/// `sockaddr_in`/`sockaddr_in6` union natively, with the small set of
/// convenience constructors callers actually reach for.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct InetAddress(SocketAddr);

impl InetAddress {
    /// A wildcard (or loopback-only) address on `port`, IPv4 or IPv6.
    pub fn new(port: u16, loopback_only: bool, ipv6: bool) -> InetAddress {
        let addr = if ipv6 {
            let ip = if loopback_only { Ipv6Addr::LOCALHOST } else { Ipv6Addr::UNSPECIFIED };
            SocketAddr::new(IpAddr::V6(ip), port)
        } else {
            let ip = if loopback_only { Ipv4Addr::LOCALHOST } else { Ipv4Addr::UNSPECIFIED };
            SocketAddr::new(IpAddr::V4(ip), port)
        };
        InetAddress(addr)
    }

    pub fn with_ip(ip: &str, port: u16) -> Result<InetAddress, std::net::AddrParseError> {
        let ip: IpAddr = ip.parse()?;
        Ok(InetAddress(SocketAddr::new(ip, port)))
    }

    pub fn from_socket_addr(addr: SocketAddr) -> InetAddress {
        InetAddress(addr)
    }

    pub fn ip(&self) -> String {
        self.0.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn to_ip_port(&self) -> String {
        match self.0 {
            SocketAddr::V4(a) => format!("{}:{}", a.ip(), a.port()),
            SocketAddr::V6(a) => format!("{}:{}", a.ip(), a.port()),
        }
    }

    pub fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn is_ipv6(&self) -> bool {
        self.0.is_ipv6()
    }
}

impl From<SocketAddr> for InetAddress {
    fn from(addr: SocketAddr) -> InetAddress {
        InetAddress(addr)
    }
}

impl From<InetAddress> for SocketAddr {
    fn from(addr: InetAddress) -> SocketAddr {
        addr.0
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_ip_port())
    }
}

impl fmt::Debug for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InetAddress({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_vs_loopback() {
        let any = InetAddress::new(8080, false, false);
        assert_eq!(any.ip(), "0.0.0.0");
        let loopback = InetAddress::new(8080, true, false);
        assert_eq!(loopback.ip(), "127.0.0.1");
    }

    #[test]
    fn to_ip_port_formats_host_and_port() {
        let addr = InetAddress::with_ip("192.168.1.1", 9000).unwrap();
        assert_eq!(addr.to_ip_port(), "192.168.1.1:9000");
        assert_eq!(addr.port(), 9000);
    }

    #[test]
    fn rejects_invalid_ip() {
        assert!(InetAddress::with_ip("not-an-ip", 80).is_err());
    }
}
