//! Destination checks for outbound webhook requests.
//!
//! Only http(s) URLs whose host is a public name or a public unicast address
//! are allowed. Hostnames are not resolved; IP literals (including the
//! integer and hex forms the URL parser normalizes) are classified.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use url::{Host, Url};

/// Why a destination was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SsrfError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("scheme '{0}' is not allowed, use http or https")]
    Scheme(String),
    #[error("host '{0}' is not allowed")]
    Hostname(String),
    #[error("address {addr} is {class}")]
    Address { addr: IpAddr, class: AddressClass },
}

/// Classification of an IP address by reachability scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    Unspecified,
    Loopback,
    Private,
    LinkLocal,
    Multicast,
    Broadcast,
    /// 100.64.0.0/10, carrier-grade NAT.
    SharedAddressSpace,
    /// Documentation, benchmarking and future-use ranges.
    Reserved,
    /// fc00::/7
    UniqueLocal,
    Public,
}

impl fmt::Display for AddressClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AddressClass::Unspecified => "unspecified",
            AddressClass::Loopback => "loopback",
            AddressClass::Private => "private",
            AddressClass::LinkLocal => "link-local",
            AddressClass::Multicast => "multicast",
            AddressClass::Broadcast => "broadcast",
            AddressClass::SharedAddressSpace => "carrier-grade NAT",
            AddressClass::Reserved => "reserved",
            AddressClass::UniqueLocal => "unique-local",
            AddressClass::Public => "public",
        };
        f.write_str(name)
    }
}

/// Parse `raw` and check it is an allowed webhook destination.
pub fn validate_url(raw: &str) -> Result<Url, SsrfError> {
    let url = Url::parse(raw).map_err(|e| SsrfError::InvalidUrl(e.to_string()))?;
    check_url(&url)?;
    Ok(url)
}

/// Check an already-parsed URL.
pub fn check_url(url: &Url) -> Result<(), SsrfError> {
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(SsrfError::Scheme(other.to_string())),
    }

    match url.host() {
        None => Err(SsrfError::InvalidUrl("missing host".to_string())),
        Some(Host::Domain(domain)) => check_hostname(domain),
        Some(Host::Ipv4(addr)) => check_ip(IpAddr::V4(addr)),
        Some(Host::Ipv6(addr)) => check_ip(IpAddr::V6(addr)),
    }
}

fn check_hostname(domain: &str) -> Result<(), SsrfError> {
    let host = domain.trim_end_matches('.').to_ascii_lowercase();
    let blocked = host.is_empty()
        || host == "localhost"
        || host.ends_with(".localhost")
        || host.ends_with(".local")
        || host.ends_with(".internal");
    if blocked {
        return Err(SsrfError::Hostname(domain.to_string()));
    }

    // Numeric hosts the parser left as domains still get classified.
    if let Ok(addr) = host.parse::<IpAddr>() {
        return check_ip(addr);
    }
    Ok(())
}

fn check_ip(addr: IpAddr) -> Result<(), SsrfError> {
    match classify_ip(addr) {
        AddressClass::Public => Ok(()),
        class => Err(SsrfError::Address { addr, class }),
    }
}

/// Classify an address. Embedded IPv4 (mapped, compatible, NAT64) is
/// classified as the IPv4 address it carries.
pub fn classify_ip(addr: IpAddr) -> AddressClass {
    match addr {
        IpAddr::V4(v4) => classify_v4(v4),
        IpAddr::V6(v6) => classify_v6(v6),
    }
}

fn classify_v4(addr: Ipv4Addr) -> AddressClass {
    let [a, b, c, _] = addr.octets();

    if a == 0 {
        AddressClass::Unspecified
    } else if addr.is_loopback() {
        AddressClass::Loopback
    } else if addr.is_private() {
        AddressClass::Private
    } else if addr.is_link_local() {
        AddressClass::LinkLocal
    } else if addr.is_broadcast() {
        AddressClass::Broadcast
    } else if addr.is_multicast() {
        AddressClass::Multicast
    } else if a == 100 && (64..128).contains(&b) {
        AddressClass::SharedAddressSpace
    } else if (a == 192 && b == 0 && c == 0)
        || (a == 192 && b == 0 && c == 2)
        || (a == 198 && (b == 18 || b == 19))
        || (a == 198 && b == 51 && c == 100)
        || (a == 203 && b == 0 && c == 113)
        || a >= 240
    {
        AddressClass::Reserved
    } else {
        AddressClass::Public
    }
}

fn classify_v6(addr: Ipv6Addr) -> AddressClass {
    if let Some(v4) = embedded_v4(addr) {
        return classify_v4(v4);
    }

    let segments = addr.segments();
    if addr.is_unspecified() {
        AddressClass::Unspecified
    } else if addr.is_loopback() {
        AddressClass::Loopback
    } else if addr.is_multicast() {
        AddressClass::Multicast
    } else if segments[0] & 0xfe00 == 0xfc00 {
        AddressClass::UniqueLocal
    } else if segments[0] & 0xffc0 == 0xfe80 {
        AddressClass::LinkLocal
    } else if segments[0] == 0x2001 && segments[1] == 0x0db8 {
        AddressClass::Reserved
    } else {
        AddressClass::Public
    }
}

/// IPv4 carried inside an IPv6 address: `::ffff:a.b.c.d`, the deprecated
/// `::a.b.c.d`, or the NAT64 prefix `64:ff9b::/96`.
fn embedded_v4(addr: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(v4) = addr.to_ipv4_mapped() {
        return Some(v4);
    }

    let s = addr.segments();
    let tail = Ipv4Addr::new(
        (s[6] >> 8) as u8,
        s[6] as u8,
        (s[7] >> 8) as u8,
        s[7] as u8,
    );
    let compatible = s[..6].iter().all(|&x| x == 0) && u32::from(tail) > 1;
    let nat64 = s[0] == 0x64 && s[1] == 0xff9b && s[2..6].iter().all(|&x| x == 0);

    (compatible || nat64).then_some(tail)
}
