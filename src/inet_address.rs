use std::fmt;
use std::mem::size_of;
use std::net::Ipv4Addr;

/// An IPv4 socket address: a `sockaddr_in` with an ergonomic Rust face.
///
/// Grounded on muduo's `InetAddress` (`InetAddress.h`/`.cc`).
/// IPv6 is out of scope; see the crate's Non-goals.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InetAddress {
    ip: Ipv4Addr,
    port: u16,
}

impl InetAddress {
    pub fn new(ip: Ipv4Addr, port: u16) -> InetAddress {
        InetAddress { ip, port }
    }

    /// An address suitable for `bind`, listening on every local interface.
    /// Grounded on `InetAddress(uint16_t port, bool loopbackOnly = false)`
    /// with `loopbackOnly` left at its default of `false`.
    pub fn any(port: u16) -> InetAddress {
        InetAddress::new(Ipv4Addr::UNSPECIFIED, port)
    }

    pub fn loopback(port: u16) -> InetAddress {
        InetAddress::new(Ipv4Addr::LOCALHOST, port)
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn to_sockaddr_in(self) -> libc::sockaddr_in {
        let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        raw.sin_family = libc::AF_INET as libc::sa_family_t;
        raw.sin_port = self.port.to_be();
        raw.sin_addr = libc::in_addr {
            s_addr: u32::from_ne_bytes(self.ip.octets()),
        };
        raw
    }

    pub(crate) fn from_sockaddr_in(raw: libc::sockaddr_in) -> InetAddress {
        debug_assert_eq!(size_of::<libc::sockaddr_in>(), size_of::<libc::sockaddr_in>());
        InetAddress {
            ip: Ipv4Addr::from(u32::from_ne_bytes(raw.sin_addr.s_addr.to_ne_bytes())),
            port: u16::from_be(raw.sin_port),
        }
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl From<std::net::SocketAddrV4> for InetAddress {
    fn from(addr: std::net::SocketAddrV4) -> InetAddress {
        InetAddress::new(*addr.ip(), addr.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_sockaddr_in() {
        let addr = InetAddress::new(Ipv4Addr::new(127, 0, 0, 1), 9981);
        let raw = addr.to_sockaddr_in();
        assert_eq!(InetAddress::from_sockaddr_in(raw), addr);
    }

    #[test]
    fn any_binds_to_unspecified() {
        let addr = InetAddress::any(8080);
        assert_eq!(addr.ip(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn display_matches_host_colon_port() {
        let addr = InetAddress::loopback(80);
        assert_eq!(addr.to_string(), "127.0.0.1:80");
    }
}
