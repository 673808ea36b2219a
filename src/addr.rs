//! Address model: 16-byte IP values, host-port tuples and their sockaddr
//! conversions.
//!
//! IPv4 addresses are stored as IPv4-mapped IPv6 (`::ffff:a.b.c.d`), so a
//! single 16-byte value with byte-lexicographic ordering covers both
//! families.

use std::fmt;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::RawFd;

use crate::error::{Error, Result};

/// Length of the address buffer (an IPv6 address).
pub const IPV6_SIZE: usize = 16;

const IPV4_MAPPED_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff];

/// An immutable 16-byte IP address value, IPv4 represented as
/// IPv4-mapped IPv6. Ordering is byte-lexicographic.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IpAddress {
    octets: [u8; IPV6_SIZE],
}

impl IpAddress {
    /// The IPv4 loopback address, `127.0.0.1`.
    pub const IPV4_LOOPBACK: IpAddress = IpAddress {
        octets: [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 127, 0, 0, 1],
    };
    /// The IPv6 loopback address, `::1`.
    pub const IPV6_LOOPBACK: IpAddress = IpAddress {
        octets: [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1],
    };

    /// Build an IPv4 address from a host-byte-order `u32`.
    pub fn from_ipv4(addr: u32) -> Self {
        let mut octets = [0u8; IPV6_SIZE];
        octets[..12].copy_from_slice(&IPV4_MAPPED_PREFIX);
        octets[12..].copy_from_slice(&addr.to_be_bytes());
        IpAddress { octets }
    }

    pub const fn from_octets(octets: [u8; IPV6_SIZE]) -> Self {
        IpAddress { octets }
    }

    /// Whether this value carries the IPv4-mapped prefix.
    pub fn is_ipv4(&self) -> bool {
        self.octets[..12] == IPV4_MAPPED_PREFIX
    }

    /// Whether this is a plain IPv6 address (i.e. `!is_ipv4()`).
    pub fn is_ipv6(&self) -> bool {
        !self.is_ipv4()
    }

    /// True for link-local addresses: `169.254.0.0/16` or `fe80::/64`.
    pub fn is_local_link(&self) -> bool {
        (self.is_ipv4() && self.octets[12] == 169 && self.octets[13] == 254)
            || self.octets[..8] == [0xfe, 0x80, 0, 0, 0, 0, 0, 0]
    }

    /// The IPv4 part, in host byte order. Meaningful only when `is_ipv4()`.
    pub fn ipv4(&self) -> u32 {
        u32::from_be_bytes([
            self.octets[12],
            self.octets[13],
            self.octets[14],
            self.octets[15],
        ])
    }

    /// The full 16-byte buffer.
    pub fn octets(&self) -> &[u8; IPV6_SIZE] {
        &self.octets
    }

    /// The value as a standard library address, collapsing IPv4-mapped
    /// values back to `Ipv4Addr`.
    pub fn to_std(&self) -> IpAddr {
        if self.is_ipv4() {
            IpAddr::V4(Ipv4Addr::from(self.ipv4()))
        } else {
            IpAddr::V6(Ipv6Addr::from(self.octets))
        }
    }

    /// Parse from decimal-dotted IPv4 or colon-hex IPv6 text.
    pub fn parse_from_string(text: &str) -> Result<IpAddress> {
        if text.is_empty() {
            return Err(Error::InvalidArgument("empty IP address string".into()));
        }
        if let Ok(v4) = text.parse::<Ipv4Addr>() {
            return Ok(IpAddress::from(v4));
        }
        if let Ok(v6) = text.parse::<Ipv6Addr>() {
            return Ok(IpAddress::from(v6));
        }
        Err(Error::InvalidArgument(format!(
            "`{text}` parses neither as IPv4 nor as IPv6"
        )))
    }

    /// Extract the address from an `AF_INET` or `AF_INET6` sockaddr.
    pub fn parse_from_sockaddr(addr: &libc::sockaddr_storage) -> Result<IpAddress> {
        match addr.ss_family as libc::c_int {
            libc::AF_INET => {
                let sa = unsafe { &*(addr as *const _ as *const libc::sockaddr_in) };
                Ok(IpAddress::from_ipv4(u32::from_be(sa.sin_addr.s_addr)))
            }
            libc::AF_INET6 => {
                let sa = unsafe { &*(addr as *const _ as *const libc::sockaddr_in6) };
                Ok(IpAddress::from_octets(sa.sin6_addr.s6_addr))
            }
            family => Err(Error::InvalidArgument(format!(
                "sockaddr family {family} is neither AF_INET nor AF_INET6"
            ))),
        }
    }

    /// Fill `addr` with this address and the matching family.
    pub fn to_sockaddr(&self, addr: &mut libc::sockaddr_storage) {
        if self.is_ipv4() {
            let sa = unsafe { &mut *(addr as *mut _ as *mut libc::sockaddr_in) };
            sa.sin_family = libc::AF_INET as libc::sa_family_t;
            sa.sin_addr.s_addr = self.ipv4().to_be();
        } else {
            let sa = unsafe { &mut *(addr as *mut _ as *mut libc::sockaddr_in6) };
            sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sa.sin6_addr.s6_addr = self.octets;
        }
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(addr: Ipv4Addr) -> Self {
        IpAddress::from_ipv4(u32::from(addr))
    }
}

impl From<Ipv6Addr> for IpAddress {
    fn from(addr: Ipv6Addr) -> Self {
        IpAddress::from_octets(addr.octets())
    }
}

impl From<IpAddr> for IpAddress {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => v4.into(),
            IpAddr::V6(v6) => v6.into(),
        }
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.to_std(), f)
    }
}

impl fmt::Debug for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IpAddress({})", self)
    }
}

/// A host/port tuple where every part is optional: a bare host name, a
/// resolved `ip:port`, or any mix in between.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostPort {
    host: Option<String>,
    ip: Option<IpAddress>,
    port: Option<u16>,
    scope_id: Option<u32>,
}

impl HostPort {
    pub fn new() -> Self {
        HostPort::default()
    }

    pub fn from_parts(
        host: Option<String>,
        ip: Option<IpAddress>,
        port: Option<u16>,
    ) -> Self {
        HostPort {
            host,
            ip,
            port,
            scope_id: None,
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }
    pub fn ip(&self) -> Option<IpAddress> {
        self.ip
    }
    pub fn port(&self) -> Option<u16> {
        self.port
    }
    pub fn scope_id(&self) -> Option<u32> {
        self.scope_id
    }

    pub fn set_host(&mut self, host: impl Into<String>) -> &mut Self {
        self.host = Some(host.into());
        self
    }
    pub fn set_ip(&mut self, ip: IpAddress) -> &mut Self {
        self.ip = Some(ip);
        self
    }
    pub fn set_port(&mut self, port: u16) -> &mut Self {
        self.port = Some(port);
        self
    }
    pub fn set_scope_id(&mut self, scope_id: u32) -> &mut Self {
        self.scope_id = Some(scope_id);
        self
    }

    /// Valid: a non-zero port plus a host or an ip.
    pub fn is_valid(&self) -> bool {
        matches!(self.port, Some(p) if p != 0) && (self.ip.is_some() || self.host.is_some())
    }

    /// Resolved: a non-zero port plus an ip.
    pub fn is_resolved(&self) -> bool {
        matches!(self.port, Some(p) if p != 0) && self.ip.is_some()
    }

    /// Merge every part set in `other` into `self`.
    pub fn update(&mut self, other: &HostPort) {
        if let Some(host) = &other.host {
            self.host = Some(host.clone());
        }
        if other.ip.is_some() {
            self.ip = other.ip;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.scope_id.is_some() {
            self.scope_id = other.scope_id;
        }
    }

    /// Parse `host:port` text. The rule: if the string ends with `]` the
    /// whole string is a bracketed address with no port; otherwise the last
    /// `:` separates the host token from the port. A bracketed token is
    /// parsed as an IP; anything unparseable as an IP becomes the host
    /// name. Unbracketed IPv6 text is rejected since its colons would be
    /// misparsed as a port separator.
    pub fn parse_from_string(text: &str) -> Result<HostPort> {
        if text.is_empty() {
            return Ok(HostPort::new());
        }
        let mut result = HostPort::new();
        let (token, port_text) = if text.ends_with(']') {
            (text, None)
        } else {
            match text.rfind(':') {
                Some(pos) => (&text[..pos], Some(&text[pos + 1..])),
                None => (text, None),
            }
        };
        let ip_token = if token.starts_with('[') && token.ends_with(']') {
            &token[1..token.len() - 1]
        } else {
            token
        };
        match IpAddress::parse_from_string(ip_token) {
            Ok(ip) => {
                if ip.is_ipv6() && ip_token == token {
                    return Err(Error::InvalidArgument(format!(
                        "an IPv6 host-port needs the [ip]:port form in `{text}`"
                    )));
                }
                result.set_ip(ip);
            }
            Err(_) => {
                result.set_host(token);
            }
        }
        if let Some(port_text) = port_text {
            let port: u32 = port_text.parse().map_err(|_| {
                Error::InvalidArgument(format!("bad port in host-port string `{text}`"))
            })?;
            if port == 0 || port > u16::MAX as u32 {
                return Err(Error::InvalidArgument(format!(
                    "host-port port out of range: {port}"
                )));
            }
            result.set_port(port as u16);
        }
        Ok(result)
    }

    /// Extract ip, port and (when non-zero) scope id from a sockaddr.
    pub fn parse_from_sockaddr(addr: &libc::sockaddr_storage) -> Result<HostPort> {
        let mut hp = HostPort::new();
        hp.set_ip(IpAddress::parse_from_sockaddr(addr)?);
        match addr.ss_family as libc::c_int {
            libc::AF_INET => {
                let sa = unsafe { &*(addr as *const _ as *const libc::sockaddr_in) };
                hp.set_port(u16::from_be(sa.sin_port));
            }
            libc::AF_INET6 => {
                let sa = unsafe { &*(addr as *const _ as *const libc::sockaddr_in6) };
                hp.set_port(u16::from_be(sa.sin6_port));
                if sa.sin6_scope_id != 0 {
                    hp.set_scope_id(sa.sin6_scope_id);
                }
            }
            _ => unreachable!("family checked by IpAddress::parse_from_sockaddr"),
        }
        Ok(hp)
    }

    /// The best representation for network use: `ip:port` when an ip is
    /// present, else `host:port`. Errors when either half is missing.
    pub fn to_hostport_string(&self) -> Result<String> {
        let port = self.port.ok_or_else(|| {
            Error::FailedPrecondition("host-port has no port specified".into())
        })?;
        if let Some(ip) = self.ip {
            if ip.is_ipv6() {
                Ok(format!("[{ip}]:{port}"))
            } else {
                Ok(format!("{ip}:{port}"))
            }
        } else if let Some(host) = &self.host {
            Ok(format!("{host}:{port}"))
        } else {
            Err(Error::FailedPrecondition(
                "host-port has no host or ip specified".into(),
            ))
        }
    }

    /// Build the sockaddr for this host-port. Requires `is_resolved()`.
    pub fn to_sockaddr(&self) -> Result<(libc::sockaddr_storage, libc::socklen_t)> {
        match (self.ip, self.port) {
            (Some(ip), Some(port)) if port != 0 => {
                Ok(to_sockaddr_parts(ip, port, self.scope_id))
            }
            _ => Err(Error::FailedPrecondition(
                "host-port is not resolved for sockaddr conversion".into(),
            )),
        }
    }
}

impl fmt::Display for HostPort {
    /// Canonical form `host[ip]:port`: the ip is bracketed whenever a host
    /// precedes it or it is IPv6. The empty host-port renders as `[]`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        if let Some(host) = &self.host {
            f.write_str(host)?;
            wrote = true;
        }
        if let Some(ip) = self.ip {
            let brackets = wrote || ip.is_ipv6();
            if brackets {
                write!(f, "[{ip}]")?;
            } else {
                write!(f, "{ip}")?;
            }
            wrote = true;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
            wrote = true;
        }
        if !wrote {
            f.write_str("[]")?;
        }
        Ok(())
    }
}

/// Assemble a sockaddr from loose parts. Used for listen addresses where a
/// zero port ("pick one for me") is legitimate.
pub(crate) fn to_sockaddr_parts(
    ip: IpAddress,
    port: u16,
    scope_id: Option<u32>,
) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    ip.to_sockaddr(&mut storage);
    if storage.ss_family as libc::c_int == libc::AF_INET6 {
        let sa = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
        sa.sin6_port = port.to_be();
        if let Some(scope_id) = scope_id {
            sa.sin6_scope_id = scope_id;
        }
    } else {
        let sa = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
        sa.sin_port = port.to_be();
    }
    (storage, sockaddr_len(&storage))
}

/// Size of the initialized portion of a sockaddr_storage, per family.
pub(crate) fn sockaddr_len(addr: &libc::sockaddr_storage) -> libc::socklen_t {
    if addr.ss_family as libc::c_int == libc::AF_INET {
        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
    } else {
        mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
    }
}

/// Read the local (bound) address of a socket.
pub(crate) fn local_sockaddr(fd: RawFd) -> Result<libc::sockaddr_storage> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if ret < 0 {
        return Err(Error::last_os(format!("::getsockname failed for fd {fd}")));
    }
    Ok(storage)
}

/// Read the peer address of a connected socket.
pub(crate) fn peer_sockaddr(fd: RawFd) -> Result<libc::sockaddr_storage> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if ret < 0 {
        return Err(Error::last_os(format!("::getpeername failed for fd {fd}")));
    }
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_mapping() {
        let ip = IpAddress::parse_from_string("192.168.1.7").unwrap();
        assert!(ip.is_ipv4());
        assert!(!ip.is_ipv6());
        assert_eq!(ip.ipv4(), 0xc0a80107);
        assert_eq!(ip.to_string(), "192.168.1.7");
    }

    #[test]
    fn ipv6_canonical_form() {
        let ip = IpAddress::parse_from_string("2001:db8:0:0:0:0:0:1").unwrap();
        assert!(ip.is_ipv6());
        assert_eq!(ip.to_string(), "2001:db8::1");
    }

    #[test]
    fn ip_round_trip() {
        for text in ["127.0.0.1", "255.255.255.255", "::1", "fe80::1", "2001:db8::8:800:200c:417a"] {
            let ip = IpAddress::parse_from_string(text).unwrap();
            assert_eq!(
                IpAddress::parse_from_string(&ip.to_string()).unwrap(),
                ip,
                "round trip failed for {text}"
            );
        }
    }

    #[test]
    fn loopback_constants() {
        assert_eq!(IpAddress::IPV4_LOOPBACK.to_string(), "127.0.0.1");
        assert_eq!(IpAddress::IPV6_LOOPBACK.to_string(), "::1");
        assert!(IpAddress::IPV4_LOOPBACK.is_ipv4());
        assert!(IpAddress::IPV6_LOOPBACK.is_ipv6());
    }

    #[test]
    fn local_link_detection() {
        assert!(IpAddress::parse_from_string("169.254.3.4")
            .unwrap()
            .is_local_link());
        assert!(IpAddress::parse_from_string("fe80::1234")
            .unwrap()
            .is_local_link());
        assert!(!IpAddress::parse_from_string("10.0.0.1")
            .unwrap()
            .is_local_link());
        assert!(!IpAddress::parse_from_string("fe81::1")
            .unwrap()
            .is_local_link());
    }

    #[test]
    fn ordering_is_byte_lexicographic() {
        // Any IPv4-mapped value sorts above a low plain-IPv6 value.
        let v4 = IpAddress::parse_from_string("0.0.0.1").unwrap();
        let v6 = IpAddress::IPV6_LOOPBACK;
        assert!(v6 < v4);
        let a = IpAddress::parse_from_string("10.0.0.1").unwrap();
        let b = IpAddress::parse_from_string("10.0.0.2").unwrap();
        assert!(a < b);
    }

    #[test]
    fn sockaddr_round_trip_v4() {
        let mut hp = HostPort::new();
        hp.set_ip(IpAddress::parse_from_string("10.1.2.3").unwrap());
        hp.set_port(8080);
        let (storage, _len) = hp.to_sockaddr().unwrap();
        let back = HostPort::parse_from_sockaddr(&storage).unwrap();
        assert_eq!(back, hp);
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let mut hp = HostPort::new();
        hp.set_ip(IpAddress::parse_from_string("2001:db8::42").unwrap());
        hp.set_port(443);
        let (storage, _len) = hp.to_sockaddr().unwrap();
        let back = HostPort::parse_from_sockaddr(&storage).unwrap();
        assert_eq!(back, hp);
    }

    #[test]
    fn parse_name_and_port() {
        let hp = HostPort::parse_from_string("example.com:80").unwrap();
        assert_eq!(hp.host(), Some("example.com"));
        assert_eq!(hp.port(), Some(80));
        assert!(hp.ip().is_none());
        assert!(hp.is_valid());
        assert!(!hp.is_resolved());
        assert_eq!(hp.to_string(), "example.com:80");
    }

    #[test]
    fn parse_v4_and_port() {
        let hp = HostPort::parse_from_string("127.0.0.1:9000").unwrap();
        assert_eq!(hp.ip(), Some(IpAddress::IPV4_LOOPBACK));
        assert_eq!(hp.port(), Some(9000));
        assert!(hp.is_resolved());
        assert_eq!(hp.to_string(), "127.0.0.1:9000");
    }

    #[test]
    fn parse_bracketed_v6() {
        let hp = HostPort::parse_from_string("[::1]:22").unwrap();
        assert_eq!(hp.ip(), Some(IpAddress::IPV6_LOOPBACK));
        assert_eq!(hp.port(), Some(22));
        assert_eq!(hp.to_string(), "[::1]:22");
    }

    #[test]
    fn parse_bracketed_v6_without_port() {
        let hp = HostPort::parse_from_string("[fe80::1]").unwrap();
        assert_eq!(
            hp.ip(),
            Some(IpAddress::parse_from_string("fe80::1").unwrap())
        );
        assert!(hp.port().is_none());
        assert!(!hp.is_valid());
    }

    #[test]
    fn unbracketed_v6_with_port_is_rejected() {
        // The host token left of the last colon parses as IPv6, so the
        // string is ambiguous without brackets.
        assert!(HostPort::parse_from_string("fe80::1:22").is_err());
    }

    #[test]
    fn round_trip_resolved_and_name_only() {
        for text in ["1.2.3.4:55", "[2001:db8::1]:8443", "some-host:9999"] {
            let hp = HostPort::parse_from_string(text).unwrap();
            assert_eq!(
                HostPort::parse_from_string(&hp.to_string()).unwrap(),
                hp,
                "round trip failed for {text}"
            );
        }
    }

    #[test]
    fn port_validation() {
        assert!(HostPort::parse_from_string("host:0").is_err());
        assert!(HostPort::parse_from_string("host:65536").is_err());
        assert!(HostPort::parse_from_string("host:abc").is_err());
    }

    #[test]
    fn empty_string_is_empty_hostport() {
        let hp = HostPort::parse_from_string("").unwrap();
        assert_eq!(hp, HostPort::new());
        assert_eq!(hp.to_string(), "[]");
    }

    #[test]
    fn hostport_string_prefers_ip() {
        let mut hp = HostPort::new();
        hp.set_host("db.internal");
        hp.set_ip(IpAddress::parse_from_string("10.0.0.9").unwrap());
        hp.set_port(5432);
        assert_eq!(hp.to_hostport_string().unwrap(), "10.0.0.9:5432");
        assert_eq!(hp.to_string(), "db.internal[10.0.0.9]:5432");
    }

    #[test]
    fn hostport_string_requires_parts() {
        let mut hp = HostPort::new();
        hp.set_port(80);
        assert!(hp.to_hostport_string().is_err());
        let mut hp = HostPort::new();
        hp.set_host("a");
        assert!(hp.to_hostport_string().is_err());
    }

    #[test]
    fn update_merges_fields() {
        let mut hp = HostPort::parse_from_string("example.com:80").unwrap();
        let other = HostPort::parse_from_string("127.0.0.1:81").unwrap();
        hp.update(&other);
        assert_eq!(hp.host(), Some("example.com"));
        assert_eq!(hp.ip(), Some(IpAddress::IPV4_LOOPBACK));
        assert_eq!(hp.port(), Some(81));
    }

    #[test]
    fn to_sockaddr_requires_resolved() {
        let hp = HostPort::parse_from_string("example.com:80").unwrap();
        assert!(hp.to_sockaddr().is_err());
    }
}
