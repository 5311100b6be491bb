use rsip::{transport::Transport, HostWithPort};
use std::{fmt, net::SocketAddr};

/// Network endpoint of a SIP peer, tagged with the transport it was seen on.
///
/// Only IP endpoints are represented: devices are reached at the address
/// their packets arrived from, never through DNS.
#[derive(Debug, Eq, PartialEq, Clone, Hash)]
pub struct SipAddr {
    pub r#type: Option<Transport>,
    pub addr: SocketAddr,
}

impl fmt::Display for SipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.r#type {
            Some(r#type) => write!(f, "{} {}", r#type, self.addr),
            None => write!(f, "{}", self.addr),
        }
    }
}

impl SipAddr {
    pub fn new(transport: Transport, addr: SocketAddr) -> Self {
        SipAddr {
            r#type: Some(transport),
            addr,
        }
    }

    pub fn udp(addr: SocketAddr) -> Self {
        Self::new(Transport::Udp, addr)
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self::new(Transport::Tcp, addr)
    }

    /// Lowercase network name as it appears in logs and route tables.
    pub fn network(&self) -> &'static str {
        match self.r#type {
            Some(Transport::Tcp) => "tcp",
            _ => "udp",
        }
    }
}

impl From<SocketAddr> for SipAddr {
    fn from(addr: SocketAddr) -> Self {
        SipAddr { r#type: None, addr }
    }
}

impl From<SipAddr> for HostWithPort {
    fn from(addr: SipAddr) -> Self {
        addr.addr.into()
    }
}

impl From<&SipAddr> for rsip::Uri {
    fn from(addr: &SipAddr) -> Self {
        rsip::Uri {
            scheme: Some(rsip::Scheme::Sip),
            host_with_port: addr.addr.into(),
            ..Default::default()
        }
    }
}
